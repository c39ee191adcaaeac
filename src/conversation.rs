use crate::{Request, Response};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default()
}

/// One request/response exchange on a client connection.
///
/// Timestamps are filled in as the exchange progresses, in milliseconds
/// since the Unix epoch.
#[derive(Debug, Clone)]
pub struct Conversation {
  connection_id: u64,
  request: Request,
  response: Option<Response>,
  request_time: Option<u64>,
  response_header_time: Option<u64>,
  response_content_time: Option<u64>,
}

impl Conversation {
  /// Start a conversation for a request received on `connection_id`.
  pub fn new(connection_id: u64, request: Request) -> Self {
    Self {
      connection_id,
      request,
      response: None,
      request_time: None,
      response_header_time: None,
      response_content_time: None,
    }
  }
  /// Identifier of the client connection carrying this exchange.
  pub fn connection_id(&self) -> u64 {
    self.connection_id
  }
  /// request
  pub fn request(&self) -> &Request {
    &self.request
  }
  /// Mutable request, for hooks that rewrite it before it is sent.
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }
  /// response, once its header arrived
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }
  /// Mutable response, e.g. to rewrite a buffered body.
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }
  /// When the request was written upstream.
  pub fn request_time(&self) -> Option<u64> {
    self.request_time
  }
  /// When the response header was read.
  pub fn response_header_time(&self) -> Option<u64> {
    self.response_header_time
  }
  /// When the response body was complete.
  pub fn response_content_time(&self) -> Option<u64> {
    self.response_content_time
  }
  pub(crate) fn mark_request_sent(&mut self) {
    self.request_time = Some(now_millis());
  }
  pub(crate) fn set_response(&mut self, response: Response) {
    self.response_header_time = Some(now_millis());
    self.response = Some(response);
  }
  pub(crate) fn mark_response_content(&mut self) {
    self.response_content_time = Some(now_millis());
  }
}

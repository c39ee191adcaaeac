//! Hooks into the lifecycle of every proxied HTTP exchange.
use crate::conversation::Conversation;
use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Callbacks invoked by the HTTP stage.
///
/// Every method has a default. When a hook returns `Err` or panics, the
/// failure is logged and the default is used instead.
#[async_trait::async_trait]
pub trait ProxyMonitor: Send + Sync {
  /// A request was read from the client. Returning a response answers the
  /// client without contacting the upstream server. The request may be
  /// rewritten in place.
  async fn on_request_received(&self, _conversation: &mut Conversation) -> Result<Option<Response>> {
    Ok(None)
  }
  /// The request could not be read. `request` is present when the header
  /// parsed but the body did not.
  async fn on_error_reading_request(
    &self,
    _request: Option<&Request>,
    _error: &Error,
  ) -> Result<Option<Response>> {
    Ok(None)
  }
  /// The response header arrived. `true` streams the body to the client as
  /// it arrives, `false` buffers it so
  /// [`on_response_content_received`](ProxyMonitor::on_response_content_received)
  /// can rewrite it.
  async fn on_response_header_received(&self, _conversation: &mut Conversation) -> Result<bool> {
    Ok(true)
  }
  /// The response body is complete. When it was buffered (`streamed` is
  /// `false`) changes to the response are what the client receives.
  async fn on_response_content_received(
    &self,
    _conversation: &mut Conversation,
    _streamed: bool,
  ) -> Result<()> {
    Ok(())
  }
  /// The upstream response header could not be fetched.
  async fn on_error_fetching_response_header(
    &self,
    _conversation: &Conversation,
    _error: &Error,
  ) -> Result<Option<Response>> {
    Ok(None)
  }
  /// The upstream response body could not be fetched. A substitute is only
  /// used when nothing was written to the client yet.
  async fn on_error_fetching_response_content(
    &self,
    _conversation: &Conversation,
    _error: &Error,
  ) -> Result<Option<Response>> {
    Ok(None)
  }
  /// The response was written to the client.
  async fn on_wrote_response_to_client(&self, _conversation: &Conversation) -> Result<()> {
    Ok(())
  }
  /// Writing the response to the client failed.
  async fn on_error_writing_response_to_client(
    &self,
    _conversation: &Conversation,
    _error: &Error,
  ) -> Result<()> {
    Ok(())
  }
}

/// Monitor that does nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopMonitor;

impl ProxyMonitor for NoopMonitor {}

async fn guard<T, F>(hook: &'static str, default: T, future: F) -> T
where
  F: Future<Output = Result<T>>,
{
  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(Ok(value)) => value,
    Ok(Err(e)) => {
      tracing::warn!("monitor hook {} failed: {}", hook, e);
      default
    }
    Err(_) => {
      tracing::error!("monitor hook {} panicked", hook);
      default
    }
  }
}

/// Wraps a monitor so that hook failures fall back to the defaults.
#[derive(Clone)]
pub(crate) struct GuardedMonitor {
  inner: Arc<dyn ProxyMonitor>,
}

impl GuardedMonitor {
  pub(crate) fn new(inner: Arc<dyn ProxyMonitor>) -> Self {
    Self { inner }
  }
  pub(crate) async fn request_received(&self, conversation: &mut Conversation) -> Option<Response> {
    guard(
      "on_request_received",
      None,
      self.inner.on_request_received(conversation),
    )
    .await
  }
  pub(crate) async fn error_reading_request(
    &self,
    request: Option<&Request>,
    error: &Error,
  ) -> Option<Response> {
    guard(
      "on_error_reading_request",
      None,
      self.inner.on_error_reading_request(request, error),
    )
    .await
  }
  pub(crate) async fn response_header_received(&self, conversation: &mut Conversation) -> bool {
    guard(
      "on_response_header_received",
      true,
      self.inner.on_response_header_received(conversation),
    )
    .await
  }
  pub(crate) async fn response_content_received(
    &self,
    conversation: &mut Conversation,
    streamed: bool,
  ) {
    guard(
      "on_response_content_received",
      (),
      self.inner.on_response_content_received(conversation, streamed),
    )
    .await
  }
  pub(crate) async fn error_fetching_response_header(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) -> Option<Response> {
    guard(
      "on_error_fetching_response_header",
      None,
      self.inner.on_error_fetching_response_header(conversation, error),
    )
    .await
  }
  pub(crate) async fn error_fetching_response_content(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) -> Option<Response> {
    guard(
      "on_error_fetching_response_content",
      None,
      self.inner.on_error_fetching_response_content(conversation, error),
    )
    .await
  }
  pub(crate) async fn wrote_response_to_client(&self, conversation: &Conversation) {
    guard(
      "on_wrote_response_to_client",
      (),
      self.inner.on_wrote_response_to_client(conversation),
    )
    .await
  }
  pub(crate) async fn error_writing_response_to_client(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) {
    guard(
      "on_error_writing_response_to_client",
      (),
      self.inner.on_error_writing_response_to_client(conversation, error),
    )
    .await
  }
}

/// Runs several monitors in order.
///
/// The first substitute response wins; the body is streamed only when every
/// monitor agrees. A member that fails is skipped, the others still run.
#[derive(Default, Clone)]
pub struct MonitorSet {
  monitors: Vec<Arc<dyn ProxyMonitor>>,
}

impl MonitorSet {
  /// Empty set.
  pub fn new() -> Self {
    Self::default()
  }
  /// Append a monitor.
  pub fn with(mut self, monitor: Arc<dyn ProxyMonitor>) -> Self {
    self.monitors.push(monitor);
    self
  }
  /// Append a monitor.
  pub fn push(&mut self, monitor: Arc<dyn ProxyMonitor>) {
    self.monitors.push(monitor);
  }
}

#[async_trait::async_trait]
impl ProxyMonitor for MonitorSet {
  async fn on_request_received(&self, conversation: &mut Conversation) -> Result<Option<Response>> {
    for monitor in &self.monitors {
      let hook = monitor.on_request_received(conversation);
      if let Some(response) = guard("on_request_received", None, hook).await {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }
  async fn on_error_reading_request(
    &self,
    request: Option<&Request>,
    error: &Error,
  ) -> Result<Option<Response>> {
    for monitor in &self.monitors {
      let hook = monitor.on_error_reading_request(request, error);
      if let Some(response) = guard("on_error_reading_request", None, hook).await {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }
  async fn on_response_header_received(&self, conversation: &mut Conversation) -> Result<bool> {
    let mut stream = true;
    for monitor in &self.monitors {
      let hook = monitor.on_response_header_received(conversation);
      stream &= guard("on_response_header_received", true, hook).await;
    }
    Ok(stream)
  }
  async fn on_response_content_received(
    &self,
    conversation: &mut Conversation,
    streamed: bool,
  ) -> Result<()> {
    for monitor in &self.monitors {
      let hook = monitor.on_response_content_received(conversation, streamed);
      guard("on_response_content_received", (), hook).await;
    }
    Ok(())
  }
  async fn on_error_fetching_response_header(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) -> Result<Option<Response>> {
    for monitor in &self.monitors {
      let hook = monitor.on_error_fetching_response_header(conversation, error);
      if let Some(response) = guard("on_error_fetching_response_header", None, hook).await {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }
  async fn on_error_fetching_response_content(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) -> Result<Option<Response>> {
    for monitor in &self.monitors {
      let hook = monitor.on_error_fetching_response_content(conversation, error);
      if let Some(response) = guard("on_error_fetching_response_content", None, hook).await {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }
  async fn on_wrote_response_to_client(&self, conversation: &Conversation) -> Result<()> {
    for monitor in &self.monitors {
      let hook = monitor.on_wrote_response_to_client(conversation);
      guard("on_wrote_response_to_client", (), hook).await;
    }
    Ok(())
  }
  async fn on_error_writing_response_to_client(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) -> Result<()> {
    for monitor in &self.monitors {
      let hook = monitor.on_error_writing_response_to_client(conversation, error);
      guard("on_error_writing_response_to_client", (), hook).await;
    }
    Ok(())
  }
}

/// Logs one line per exchange.
#[derive(Debug, Default, Clone)]
pub struct LoggingMonitor;

#[async_trait::async_trait]
impl ProxyMonitor for LoggingMonitor {
  async fn on_wrote_response_to_client(&self, conversation: &Conversation) -> Result<()> {
    let request = conversation.request();
    let uri = request
      .uri()
      .map(|u| u.to_string())
      .unwrap_or_else(|_| request.resource());
    let status = conversation
      .response()
      .map(|r| r.start_line())
      .unwrap_or_default();
    let elapsed = match (conversation.request_time(), conversation.response_content_time()) {
      (Some(start), Some(end)) => end.saturating_sub(start),
      _ => 0,
    };
    tracing::info!(
      connection = conversation.connection_id(),
      "{} {} -> {} ({}ms)",
      request.method(),
      uri,
      status,
      elapsed
    );
    Ok(())
  }
  async fn on_error_fetching_response_header(
    &self,
    conversation: &Conversation,
    error: &Error,
  ) -> Result<Option<Response>> {
    tracing::warn!(
      connection = conversation.connection_id(),
      "{} {} failed: {}",
      conversation.request().method(),
      conversation.request().resource(),
      error
    );
    Ok(None)
  }
}

/// Keeps completed conversations in memory, oldest dropped first once
/// `capacity` is reached.
pub struct ConversationRecorder {
  capacity: usize,
  conversations: Mutex<VecDeque<Conversation>>,
}

impl Default for ConversationRecorder {
  fn default() -> Self {
    Self::new(1000)
  }
}

impl ConversationRecorder {
  /// Recorder keeping at most `capacity` conversations.
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      conversations: Mutex::new(VecDeque::new()),
    }
  }
  /// A snapshot of the recorded conversations, oldest first.
  pub async fn conversations(&self) -> Vec<Conversation> {
    self.conversations.lock().await.iter().cloned().collect()
  }
  /// Forget everything recorded so far.
  pub async fn clear(&self) {
    self.conversations.lock().await.clear();
  }
}

#[async_trait::async_trait]
impl ProxyMonitor for ConversationRecorder {
  async fn on_wrote_response_to_client(&self, conversation: &Conversation) -> Result<()> {
    if self.capacity == 0 {
      return Ok(());
    }
    let mut conversations = self.conversations.lock().await;
    while conversations.len() >= self.capacity {
      conversations.pop_front();
    }
    conversations.push_back(conversation.clone());
    Ok(())
  }
}

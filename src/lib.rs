#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tapwire
//!
//! An intercepting proxy for HTTP, SOCKS4/4a/5 and TLS traffic.
//!
//! One listening port serves HTTP proxy clients (absolute-URI requests and
//! `CONNECT`) and SOCKS clients alike. Once the destination is known, TLS
//! sessions are terminated with a certificate minted on the fly for the
//! destination host and signed by a local CA, so every request and response
//! can be seen, and rewritten, by a [`ProxyMonitor`].
//!
//! - SOCKS4, SOCKS4a and SOCKS5 (no-auth and username/password)
//! - TLS interception with per-host certificates, cached for the process
//!   lifetime
//! - HTTP/1.x keep-alive, chunked and `Content-Length` framing, bodies kept
//!   in wire form
//! - Upstream routing: direct, through an HTTP proxy or a SOCKS5 proxy
//!
//! ## Running a proxy
//!
//! ```no_run
//! # async fn run() -> tapwire::Result<()> {
//! use std::sync::Arc;
//! use tapwire::{ConversationRecorder, ProxyBuilder, ProxyConfig};
//!
//! let recorder = Arc::new(ConversationRecorder::default());
//! let server = ProxyBuilder::new(ProxyConfig::default())
//!   .monitor(recorder.clone())
//!   .build()
//!   .await?;
//! if let Some(pem) = server.ca_cert_pem() {
//!   println!("install this CA in your browser:\n{}", pem);
//! }
//! let listener = server.listen("127.0.0.1:8008").await?;
//! tokio::signal::ctrl_c().await?;
//! listener.stop().await;
//! println!("{} conversations", recorder.conversations().await.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Rewriting traffic
//!
//! Implement [`ProxyMonitor`] and override the hooks you need. Returning a
//! [`Response`] from [`ProxyMonitor::on_request_received`] answers the
//! client without contacting the server; returning `false` from
//! [`ProxyMonitor::on_response_header_received`] buffers the body so that
//! [`ProxyMonitor::on_response_content_received`] can rewrite it. Hook
//! errors and panics are logged and the default behavior is used.
//!
//! ## Optional Features
//!
//! - **gzip**: `decoded_content` and `set_decoded_content` handle gzip
//!   content coding.
//!
pub mod body;
pub mod ca;
mod client;
mod connector;
mod conversation;
mod errors;
pub mod handler;
pub mod io;
pub mod message;
pub mod monitor;
mod proxy;
mod request;
mod response;
mod server;
mod socket;
pub mod socks;
mod target;
pub mod tls;
mod tunnel;
pub mod upstream;

pub use ca::{CertificateAuthority, KeyEntry};
pub use client::UpstreamClient;
pub use connector::{Connector, ConnectorBuilder};
pub use conversation::Conversation;
pub use errors::{Error, ReplyError, Result};
pub use handler::{Connection, Pipeline, Stage};
pub use http::{StatusCode, Uri};
pub use message::{Message, NamedValue};
pub use monitor::{ConversationRecorder, LoggingMonitor, MonitorSet, NoopMonitor, ProxyMonitor};
pub use proxy::{ProxyBuilder, ProxyConfig, ProxyContext};
pub use request::Request;
pub use response::Response;
pub use server::{Listener, ProxyServer};
pub use socket::{AsyncIo, BoxedIo, Socket};
pub use target::TargetAddr;
pub use tls::{AutoGeneratingContextSelector, ContextSelector, StaticContextSelector, UpstreamTrust};
pub use tunnel::{spawn_tunnel, tunnel, TunnelStats};
pub use upstream::{Upstream, UpstreamSelector};

pub(crate) const CR_LF: &str = "\r\n";
pub(crate) const COLON_SPACE: &str = ": ";

//! Raw byte pump between two streams.
//!
//! Two tasks, one per direction, share a single cancellation flag. The
//! first direction to see end of stream or an error raises it, the other
//! direction stops, and both write halves are shut down.
use crate::io::{CountingReader, EofNotify};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Bytes moved by a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
  /// client to server
  pub sent: u64,
  /// server to client
  pub received: u64,
}

/// Pump bytes both ways until either side ends.
pub async fn tunnel<A, B>(client: A, server: B) -> TunnelStats
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  let (client_read, client_write) = tokio::io::split(client);
  let (server_read, server_write) = tokio::io::split(server);
  let (done, _) = watch::channel(false);
  let done = Arc::new(done);
  let upstream = tokio::spawn(pump("client->server", client_read, server_write, done.clone()));
  let downstream = tokio::spawn(pump("server->client", server_read, client_write, done));
  let (sent, received) = tokio::join!(upstream, downstream);
  TunnelStats {
    sent: sent.unwrap_or_default(),
    received: received.unwrap_or_default(),
  }
}

/// Run [`tunnel`] on its own task.
pub fn spawn_tunnel<A, B>(id: u64, client: A, server: B)
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  tokio::spawn(async move {
    let stats = tunnel(client, server).await;
    tracing::debug!(
      connection = id,
      "tunnel closed, {} bytes sent, {} bytes received",
      stats.sent,
      stats.received
    );
  });
}

async fn pump<R, W>(direction: &'static str, reader: R, mut writer: W, done: Arc<watch::Sender<bool>>) -> u64
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let cancelled = done.subscribe();
  let mut reader = CountingReader::new(EofNotify::new(reader, done.clone()));
  let result = tokio::select! {
    biased;
    result = tokio::io::copy(&mut reader, &mut writer) => result.map(|_| ()),
    _ = wait_cancelled(cancelled) => Ok(()),
  };
  if let Err(e) = result {
    tracing::debug!("tunnel {} ended with error: {}", direction, e);
    done.send_replace(true);
  }
  let _ = writer.shutdown().await;
  reader.count()
}

async fn wait_cancelled(mut cancelled: watch::Receiver<bool>) {
  while !*cancelled.borrow_and_update() {
    if cancelled.changed().await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn test_tunnel_moves_bytes_and_stops_both_sides() {
    let (mut client, proxy_client) = tokio::io::duplex(64);
    let (proxy_server, mut server) = tokio::io::duplex(64);
    let handle = tokio::spawn(tunnel(proxy_client, proxy_server));

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    server.write_all(b"pong!").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong!");

    // the server going away ends the client side too
    drop(server);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    let stats = handle.await.unwrap();
    assert_eq!(stats, TunnelStats { sent: 4, received: 5 });
  }
}

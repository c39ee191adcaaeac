//! Accepting client connections.
use crate::errors::Result;
use crate::handler::{Connection, Pipeline};
use crate::proxy::ProxyContext;
use crate::socket::Socket;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Back-off after a failed `accept`, e.g. out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A proxy ready to listen on any number of addresses.
#[derive(Clone)]
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
  pipeline: Pipeline,
}

impl ProxyServer {
  /// Server handing each connection to `pipeline`.
  pub fn new(ctx: Arc<ProxyContext>, pipeline: Pipeline) -> Self {
    Self { ctx, pipeline }
  }
  /// The shared context
  pub fn context(&self) -> &Arc<ProxyContext> {
    &self.ctx
  }
  /// The local CA certificate in PEM, for installation into clients
  pub fn ca_cert_pem(&self) -> Option<&str> {
    self.ctx.ca().map(|ca| ca.ca_cert_pem())
  }

  /// Bind `addr` and serve it on a background task until the returned
  /// [`Listener`] is stopped or dropped.
  pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<Listener> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    self.ctx.loop_guard().register(local_addr).await;
    let (stop, stopped) = watch::channel(false);
    let handle = tokio::spawn(accept_loop(
      self.ctx.clone(),
      self.pipeline.clone(),
      listener,
      stopped,
    ));
    tracing::info!("listening on {}", local_addr);
    Ok(Listener {
      local_addr,
      stop,
      handle,
    })
  }

  /// Serve `addr` until Ctrl-C.
  pub async fn run<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
    let listener = self.listen(addr).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    listener.stop().await;
    Ok(())
  }
}

/// A running listener.
pub struct Listener {
  local_addr: SocketAddr,
  stop: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

impl Listener {
  /// Address the listener is bound to
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
  /// Stop accepting, give running connections the configured grace period,
  /// then abort the rest.
  pub async fn stop(self) {
    self.stop.send_replace(true);
    let _ = self.handle.await;
  }
}

async fn accept_loop(
  ctx: Arc<ProxyContext>,
  pipeline: Pipeline,
  listener: TcpListener,
  mut stopped: watch::Receiver<bool>,
) {
  let local_addr = listener.local_addr().ok();
  let config = ctx.config();
  let semaphore = Arc::new(Semaphore::new(config.max_connections));
  let mut tasks = JoinSet::new();
  loop {
    let permit = tokio::select! {
      _ = stopped.changed() => break,
      permit = semaphore.clone().acquire_owned() => match permit {
        Ok(permit) => permit,
        Err(_) => break,
      },
    };
    let accepted = tokio::select! {
      _ = stopped.changed() => break,
      accepted = listener.accept() => accepted,
    };
    while tasks.try_join_next().is_some() {}
    let (stream, peer) = match accepted {
      Ok(accepted) => accepted,
      Err(e) => {
        tracing::warn!("accept failed: {}", e);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
        continue;
      }
    };
    let _ = stream.set_nodelay(true);
    let Ok(local) = stream.local_addr() else {
      continue;
    };
    let id = ctx.next_connection_id();
    let socket = Socket::new(stream, config.read_timeout, config.write_timeout);
    let connection = Connection::new(id, peer, local, Box::new(socket));
    let pipeline = pipeline.clone();
    tasks.spawn(async move {
      let _permit = permit;
      tracing::debug!(connection = id, "accepted {}", peer);
      if let Err(e) = pipeline.run(connection).await {
        tracing::debug!(connection = id, "closed with error: {}", e);
      }
    });
  }

  drop(listener);
  if let Some(addr) = local_addr {
    ctx.loop_guard().unregister(addr).await;
  }
  let drained = tokio::time::timeout(config.shutdown_grace, async {
    while tasks.join_next().await.is_some() {}
  })
  .await;
  if drained.is_err() {
    tracing::info!("aborting {} connections", tasks.len());
    tasks.shutdown().await;
  }
}

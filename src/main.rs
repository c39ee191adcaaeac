use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapwire::{LoggingMonitor, ProxyBuilder, ProxyConfig, Upstream};
use tracing_subscriber::EnvFilter;

/// Intercepting HTTP/SOCKS proxy with on-the-fly TLS interception
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Port to listen on
  #[arg(short, long, default_value_t = 8008)]
  port: u16,

  /// Address to listen on
  #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
  listen_ip: IpAddr,

  /// Upstream route: "DIRECT", "PROXY [user:pass@]host:port" or
  /// "SOCKS host:port"
  #[arg(short, long, default_value = "DIRECT")]
  upstream: Upstream,

  /// Directory holding the CA certificate and key
  #[arg(long, default_value = ".tapwire")]
  ca_dir: PathBuf,

  /// Do not serve SOCKS clients
  #[arg(long)]
  no_socks: bool,

  /// Tunnel TLS untouched instead of intercepting it
  #[arg(long)]
  no_intercept: bool,

  /// Socket read timeout in seconds, 0 for none
  #[arg(long, default_value_t = 30)]
  read_timeout: u64,

  /// Log every exchange
  #[arg(short, long)]
  verbose: bool,
}

fn timeout(seconds: u64) -> Option<Duration> {
  (seconds > 0).then(|| Duration::from_secs(seconds))
}

#[tokio::main]
async fn main() -> tapwire::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let cli = Cli::parse();
  let config = ProxyConfig {
    ca_storage_path: cli.ca_dir,
    enable_interception: !cli.no_intercept,
    enable_socks: !cli.no_socks,
    read_timeout: timeout(cli.read_timeout),
    ..Default::default()
  };
  let mut builder = ProxyBuilder::new(config).upstream_selector(Arc::new(cli.upstream));
  if cli.verbose {
    builder = builder.monitor(Arc::new(LoggingMonitor));
  }
  let server = builder.build().await?;
  server.run((cli.listen_ip, cli.port)).await
}

mod cache;
mod config;
mod logging;
mod server;
mod upstream;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheController, FileStorage};
use crate::upstream::HttpFetcher;

#[derive(Parser, Debug)]
#[command(name = "artifact-cache")]
#[command(about = "Serve one upstream artifact from a TTL cache with a one-shot grace window")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./artifact-cache.yaml or $XDG_CONFIG_HOME/artifact-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Port to listen on
  #[arg(short, long)]
  port: Option<u16>,

  /// Directory holding the cached artifact and its metadata
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Seconds a fetched artifact stays fresh
  #[arg(long)]
  ttl: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration (file, then environment)
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line wins over both
  if let Some(port) = args.port {
    config.port = port;
  }
  if let Some(data_dir) = args.data_dir {
    config.cache.data_dir = data_dir;
  }
  if let Some(ttl) = args.ttl {
    config.cache.ttl_secs = ttl;
  }

  let _log_guard = logging::init(config.log_file.as_deref())?;

  let storage = FileStorage::open(&config.cache.data_dir)?;
  let fetcher = HttpFetcher::new(&config.upstream)?;
  info!(
    data_dir = %config.cache.data_dir.display(),
    ttl = config.cache.ttl_secs,
    upstream = %fetcher.url(),
    serve_stale_on_error = config.cache.serve_stale_on_error,
    "cache configured"
  );

  let cache = CacheController::new(Arc::new(storage), Arc::new(fetcher), config.cache.ttl())
    .with_stale_fallback(config.cache.serve_stale_on_error);

  let app = server::router(
    Arc::new(cache),
    &config.route,
    config.upstream.content_type.clone(),
  );
  server::run(config.port, app).await
}

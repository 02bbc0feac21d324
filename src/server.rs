//! HTTP surface: the artifact route plus health and status probes.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::{CacheController, CacheStorage, Fetcher};

/// Response header naming where the served bytes came from.
const X_CACHE: &str = "x-cache";

struct AppState<S: CacheStorage, F: Fetcher> {
  cache: Arc<CacheController<S, F>>,
  content_type: String,
}

/// Build the router. `route` serves the artifact with `content_type`.
pub fn router<S, F>(cache: Arc<CacheController<S, F>>, route: &str, content_type: String) -> Router
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  let state = Arc::new(AppState {
    cache,
    content_type,
  });

  Router::new()
    .route(route, get(get_artifact::<S, F>))
    .route("/cache/status", get(cache_status::<S, F>))
    .route("/healthz", get(healthz))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Bind to `port` on all interfaces and serve until Ctrl-C.
pub async fn run(port: u16, app: Router) -> Result<()> {
  let addr = SocketAddr::from(([0, 0, 0, 0], port));
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  info!("Server started in port {}", port);

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("Shutdown signal received");
    })
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn get_artifact<S, F>(State(state): State<Arc<AppState<S, F>>>) -> Response
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  match state.cache.get_artifact().await {
    Ok(result) => {
      info!(source = result.source.as_str(), bytes = result.data.len(), "serving artifact");
      (
        [(header::CONTENT_TYPE, state.content_type.clone())],
        [(X_CACHE, result.source.as_str())],
        result.data,
      )
        .into_response()
    }
    Err(e) => (
      StatusCode::SERVICE_UNAVAILABLE,
      [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
      format!("artifact unavailable: {}\n", e),
    )
      .into_response(),
  }
}

async fn cache_status<S, F>(State(state): State<Arc<AppState<S, F>>>) -> impl IntoResponse
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  Json(state.cache.status())
}

async fn healthz() -> &'static str {
  "ok"
}

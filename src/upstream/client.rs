use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, redirect};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{FetchError, Fetcher};
use crate::config::UpstreamConfig;

const USER_AGENT: &str = concat!("artifact-cache/", env!("CARGO_PKG_VERSION"));

/// Upstream client that resolves redirects by hand and downloads the final body.
///
/// Sources like `https://picsum.photos/1200` answer with a redirect to the
/// actual file; each hop is followed explicitly so it can be logged and
/// bounded. The timeout covers the whole chain, not each hop.
pub struct HttpFetcher {
  client: reqwest::Client,
  url: Url,
  timeout: Duration,
  max_redirects: usize,
}

impl HttpFetcher {
  pub fn new(config: &UpstreamConfig) -> Result<Self> {
    let url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid upstream url {}: {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .redirect(redirect::Policy::none())
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      url,
      timeout: config.timeout(),
      max_redirects: config.max_redirects,
    })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  async fn download(&self) -> Result<Bytes, FetchError> {
    let mut url = self.url.clone();

    for _ in 0..=self.max_redirects {
      let response = self.client.get(url.clone()).send().await?;
      let status = response.status();

      if status.is_redirection() {
        let next = redirect_target(&url, response.headers().get(header::LOCATION))?;
        debug!(from = %url, to = %next, status = status.as_u16(), "following upstream redirect");
        url = next;
        continue;
      }

      if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
      }

      let body = response.bytes().await?;
      debug!(url = %url, bytes = body.len(), "downloaded artifact");
      return Ok(body);
    }

    Err(FetchError::TooManyRedirects(self.max_redirects))
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self) -> Result<Bytes, FetchError> {
    tokio::time::timeout(self.timeout, self.download())
      .await
      .map_err(|_| FetchError::Timeout)?
  }
}

/// Resolve a `Location` header against the URL that produced it.
fn redirect_target(base: &Url, location: Option<&header::HeaderValue>) -> Result<Url, FetchError> {
  let location = location
    .ok_or_else(|| FetchError::BadRedirect("no Location header".to_string()))?
    .to_str()
    .map_err(|e| FetchError::BadRedirect(e.to_string()))?;

  base
    .join(location)
    .map_err(|e| FetchError::BadRedirect(format!("{}: {}", location, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::http::HeaderMap;
  use axum::response::{IntoResponse, Redirect};
  use axum::routing::get;
  use axum::Router;
  use reqwest::StatusCode;
  use std::time::Instant;

  async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
  }

  fn fetcher(url: String, timeout_secs: u64) -> HttpFetcher {
    HttpFetcher::new(&UpstreamConfig {
      url,
      timeout_secs,
      max_redirects: 3,
      content_type: "image/jpeg".to_string(),
    })
    .unwrap()
  }

  fn upstream() -> Router {
    Router::new()
      .route("/random", get(|| async { Redirect::to("/files/42.jpg") }))
      .route("/files/42.jpg", get(|| async { "jpeg-bytes" }))
      .route("/loop", get(|| async { Redirect::temporary("/loop") }))
      .route("/broken", get(|| async { StatusCode::FOUND }))
      .route(
        "/missing",
        get(|| async { (StatusCode::NOT_FOUND, "gone").into_response() }),
      )
      .route(
        "/agent",
        get(|headers: HeaderMap| async move {
          headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
        }),
      )
      .route(
        "/partial",
        get(|| async { (StatusCode::NON_AUTHORITATIVE_INFORMATION, "jpeg-bytes") }),
      )
      .route("/chain/a", get(|| slow_hop("/chain/b")))
      .route("/chain/b", get(|| slow_hop("/chain/c")))
      .route("/chain/c", get(|| slow_hop("/files/42.jpg")))
      .route(
        "/slow",
        get(|| async {
          tokio::time::sleep(Duration::from_secs(3)).await;
          "late"
        }),
      )
  }

  async fn slow_hop(next: &'static str) -> Redirect {
    tokio::time::sleep(Duration::from_millis(700)).await;
    Redirect::to(next)
  }

  #[tokio::test]
  async fn test_direct_download() {
    let base = serve(upstream()).await;
    let body = fetcher(format!("{}/files/42.jpg", base), 5)
      .fetch()
      .await
      .unwrap();
    assert_eq!(body, Bytes::from_static(b"jpeg-bytes"));
  }

  #[tokio::test]
  async fn test_follows_relative_redirect() {
    let base = serve(upstream()).await;
    let body = fetcher(format!("{}/random", base), 5)
      .fetch()
      .await
      .unwrap();
    assert_eq!(body, Bytes::from_static(b"jpeg-bytes"));
  }

  #[tokio::test]
  async fn test_error_status_is_normalized() {
    let base = serve(upstream()).await;
    let err = fetcher(format!("{}/missing", base), 5)
      .fetch()
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Status(404));
  }

  #[tokio::test]
  async fn test_any_success_status_is_accepted() {
    let base = serve(upstream()).await;
    let body = fetcher(format!("{}/partial", base), 5)
      .fetch()
      .await
      .unwrap();
    assert_eq!(body, Bytes::from_static(b"jpeg-bytes"));
  }

  #[tokio::test]
  async fn test_redirect_without_location() {
    let base = serve(upstream()).await;
    let err = fetcher(format!("{}/broken", base), 5)
      .fetch()
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::BadRedirect(_)));
  }

  #[tokio::test]
  async fn test_redirect_loop_is_bounded() {
    let base = serve(upstream()).await;
    let err = fetcher(format!("{}/loop", base), 5)
      .fetch()
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::TooManyRedirects(3));
  }

  #[tokio::test]
  async fn test_timeout_is_normalized() {
    let base = serve(upstream()).await;
    let err = fetcher(format!("{}/slow", base), 1)
      .fetch()
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Timeout);
  }

  #[tokio::test]
  async fn test_timeout_covers_whole_redirect_chain() {
    let base = serve(upstream()).await;
    let started = Instant::now();
    // Each hop finishes well within the limit; the chain does not
    let err = fetcher(format!("{}/chain/a", base), 1)
      .fetch()
      .await
      .unwrap_err();

    assert_eq!(err, FetchError::Timeout);
    assert!(started.elapsed() < Duration::from_millis(1500));
  }

  #[tokio::test]
  async fn test_connection_refused_is_network_error() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = fetcher(format!("http://{}/random", addr), 5)
      .fetch()
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Network(_)));
  }

  #[tokio::test]
  async fn test_sends_user_agent() {
    let base = serve(upstream()).await;
    let body = fetcher(format!("{}/agent", base), 5)
      .fetch()
      .await
      .unwrap();
    assert!(String::from_utf8_lossy(&body).starts_with("artifact-cache/"));
  }

  #[test]
  fn test_redirect_target_resolution() {
    let base = Url::parse("https://picsum.photos/1200").unwrap();
    let absolute = header::HeaderValue::from_static("https://fastly.picsum.photos/id/1/1200.jpg");
    assert_eq!(
      redirect_target(&base, Some(&absolute)).unwrap().as_str(),
      "https://fastly.picsum.photos/id/1/1200.jpg"
    );

    let relative = header::HeaderValue::from_static("/id/2/1200");
    assert_eq!(
      redirect_target(&base, Some(&relative)).unwrap().as_str(),
      "https://picsum.photos/id/2/1200"
    );

    assert!(redirect_target(&base, None).is_err());
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Paths the server always mounts itself.
const RESERVED_ROUTES: &[&str] = &["/healthz", "/cache/status"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub port: u16,
  /// Path the cached artifact is served on
  pub route: String,
  pub cache: CacheConfig,
  pub upstream: UpstreamConfig,
  /// Also write logs to a daily rolling file at this path
  pub log_file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      port: 8080,
      route: "/image".to_string(),
      cache: CacheConfig::default(),
      upstream: UpstreamConfig::default(),
      log_file: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds an artifact stays fresh after it is fetched
  pub ttl_secs: u64,
  /// Directory holding the artifact and its metadata record
  pub data_dir: PathBuf,
  /// Serve the previous artifact instead of an error when a refresh fails
  pub serve_stale_on_error: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 600,
      data_dir: PathBuf::from("/data"),
      serve_stale_on_error: false,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  pub url: String,
  pub timeout_secs: u64,
  /// Redirect hops followed before giving up
  pub max_redirects: usize,
  /// Content type the artifact is served with
  pub content_type: String,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      url: "https://picsum.photos/1200".to_string(),
      timeout_secs: 10,
      max_redirects: 5,
      content_type: "image/jpeg".to_string(),
    }
  }
}

impl UpstreamConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Load configuration from file, then apply environment overrides.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./artifact-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/artifact-cache/config.yaml
  /// 4. Built-in defaults
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("artifact-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("artifact-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Apply environment-style overrides. `lookup` returns the raw value for a
  /// variable name, if set.
  pub fn apply_overrides<L>(&mut self, lookup: L) -> Result<()>
  where
    L: Fn(&str) -> Option<String>,
  {
    if let Some(v) = parse_var(&lookup, "PORT")? {
      self.port = v;
    }
    if let Some(v) = lookup("CACHE_ROUTE") {
      self.route = v;
    }
    if let Some(v) = parse_var(&lookup, "TTL")? {
      self.cache.ttl_secs = v;
    }
    if let Some(v) = lookup("DATA_DIR") {
      self.cache.data_dir = PathBuf::from(v);
    }
    if let Some(v) = parse_var(&lookup, "SERVE_STALE_ON_ERROR")? {
      self.cache.serve_stale_on_error = v;
    }
    if let Some(v) = lookup("UPSTREAM_URL") {
      self.upstream.url = v;
    }
    if let Some(v) = parse_var(&lookup, "UPSTREAM_TIMEOUT")? {
      self.upstream.timeout_secs = v;
    }
    if let Some(v) = parse_var(&lookup, "UPSTREAM_MAX_REDIRECTS")? {
      self.upstream.max_redirects = v;
    }
    if let Some(v) = lookup("CONTENT_TYPE") {
      self.upstream.content_type = v;
    }
    if let Some(v) = lookup("LOG_FILE") {
      self.log_file = Some(PathBuf::from(v));
    }

    Ok(())
  }

  pub fn validate(&self) -> Result<()> {
    if self.upstream.url.trim().is_empty() {
      return Err(eyre!("upstream.url must not be empty"));
    }
    url::Url::parse(&self.upstream.url)
      .map_err(|e| eyre!("Invalid upstream.url {}: {}", self.upstream.url, e))?;
    if !self.route.starts_with('/') {
      return Err(eyre!("route must start with '/': {}", self.route));
    }
    if RESERVED_ROUTES.contains(&self.route.as_str()) {
      return Err(eyre!("route {} is reserved", self.route));
    }
    if self.upstream.timeout_secs == 0 {
      return Err(eyre!("upstream.timeout_secs must be greater than zero"));
    }

    Ok(())
  }
}

fn parse_var<T, L>(lookup: &L, key: &str) -> Result<Option<T>>
where
  T: FromStr,
  T::Err: std::fmt::Display,
  L: Fn(&str) -> Option<String>,
{
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse()
      .map(Some)
      .map_err(|e| eyre!("Invalid value for {}: {:?} ({})", key, raw, e)),
    None => Ok(None),
  }
}

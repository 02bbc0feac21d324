use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `LOG_LEVEL`, then `info`.
/// When `log_file` is set, output is also written to a daily rolling file;
/// keep the returned guard alive until exit so buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(default_directive(std::env::var("LOG_LEVEL").ok())))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let prefix = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      let appender = tracing_appender::rolling::daily(dir, prefix);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer())
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn default_directive(level: Option<String>) -> String {
  level
    .map(|l| l.trim().to_lowercase())
    .filter(|l| !l.is_empty())
    .map(|l| {
      match l.as_str() {
        "warning" => "warn",
        "critical" | "fatal" => "error",
        other => other,
      }
      .to_string()
    })
    .unwrap_or_else(|| "info".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_directive() {
    assert_eq!(default_directive(None), "info");
    assert_eq!(default_directive(Some("WARNING ".to_string())), "warn");
    assert_eq!(default_directive(Some("critical".to_string())), "error");
    assert_eq!(default_directive(Some("DEBUG".to_string())), "debug");
    assert_eq!(default_directive(Some(String::new())), "info");
  }
}

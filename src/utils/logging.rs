//! Logging setup and helpers that keep secrets out of logs
//!
//! [`init_logging`] installs a `tracing` subscriber writing to stderr and,
//! optionally, to a daily rolling file. Tool-server stderr, HTTP headers and
//! environment variables pass through the helpers here before being logged.

use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration for hosts and the operator binary
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `toolbridge=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json_format: bool,
    /// Also write a daily rolling file here
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Read `TOOLBRIDGE_LOG_LEVEL`, `TOOLBRIDGE_JSON_LOGS` and `TOOLBRIDGE_LOG_DIR`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("TOOLBRIDGE_LOG_LEVEL") {
            config.level = level;
        }
        if let Ok(json) = std::env::var("TOOLBRIDGE_JSON_LOGS") {
            config.json_format = json.parse().unwrap_or(false);
        }
        if let Ok(dir) = std::env::var("TOOLBRIDGE_LOG_DIR") {
            if !dir.is_empty() {
                config.log_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }

    fn filter(&self) -> EnvFilter {
        let filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        ["hyper=warn", "reqwest=warn", "h2=warn"]
            .iter()
            .filter_map(|d| d.parse().ok())
            .fold(filter, |f, d| f.add_directive(d))
    }
}

/// Keeps the file writer flushing; hold it for the life of the process
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
///
/// Calling this again after a subscriber is installed is harmless: the second
/// call leaves the first subscriber in place.
pub fn init_logging(config: LoggingConfig) -> std::io::Result<LoggingGuard> {
    let console_layer = if config.json_format {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_filter(config.filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(config.filter())
            .boxed()
    };

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "toolbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_filter(config.filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            level = %config.level,
            json_format = config.json_format,
            log_dir = ?config.log_dir,
            "Logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Show the first few characters of a secret and mask the rest
///
/// ```rust
/// use toolbridge::utils::logging::obscure_credential;
///
/// assert_eq!(obscure_credential("Bearer abcdef123"), "Beare***");
/// assert_eq!(obscure_credential("key"), "***");
/// ```
pub fn obscure_credential(credential: &str) -> String {
    let char_count = credential.chars().count();
    if char_count <= 5 {
        "*".repeat(char_count)
    } else {
        format!("{}***", truncate_string(credential, 5))
    }
}

/// Truncate to at most `max_chars` characters, respecting UTF-8 boundaries
///
/// ```rust
/// use toolbridge::utils::logging::truncate_string;
///
/// assert_eq!(truncate_string("Hello World", 5), "Hello");
/// assert_eq!(truncate_string("Short", 100), "Short");
/// ```
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obscure_credential() {
        assert_eq!(obscure_credential("sk-live-1234567890"), "sk-li***");
        assert_eq!(obscure_credential("short"), "*****");
        assert_eq!(obscure_credential(""), "");
        assert_eq!(obscure_credential("\u{1F44B}\u{1F44B}\u{1F44B}"), "***");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello World", 5), "Hello");
        assert_eq!(truncate_string("\u{1F44B}\u{1F44B}\u{1F44B}\u{1F44B}", 3), "\u{1F44B}\u{1F44B}\u{1F44B}");
        assert_eq!(truncate_string("", 10), "");
    }

    #[test]
    fn test_default_config_filter() {
        let config = LoggingConfig {
            level: "not a [valid filter".to_string(),
            ..Default::default()
        };
        // Falls back instead of failing
        let _ = config.filter();
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: Some(dir.path().join("logs")),
            ..Default::default()
        };
        let _first = init_logging(config.clone()).unwrap();
        let _second = init_logging(config).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}

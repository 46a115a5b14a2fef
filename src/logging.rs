//! Tracing bridge and optional subscriber bootstrap.
//!
//! Every supervisor event goes through [`emit`], which maps the sink
//! severities onto `tracing` levels under the `prefork` target. Embedders
//! that already run their own subscriber need nothing else; the rest can
//! call [`init`] once at startup for a stderr (and optionally file)
//! subscriber honoring `PREFORK_LOG`, `RUST_LOG`, and `PREFORK_LOG_FORMAT`.

use std::path::PathBuf;

use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::callback::Severity;

/// Forward one supervisor event to the tracing layer. `Crit` lands on
/// `error`; the rest map one-to-one.
pub(crate) fn emit(severity: Severity, message: &str) {
    match severity {
        Severity::Debug => tracing::debug!(target: "prefork", "{message}"),
        Severity::Info => tracing::info!(target: "prefork", "{message}"),
        Severity::Warn => tracing::warn!(target: "prefork", "{message}"),
        Severity::Crit => tracing::error!(target: "prefork", "{message}"),
    }
}

/// Output shape for [`init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// Single line per event.
    Compact,
    /// One JSON object per event, for log aggregation.
    Json,
}

impl LogFormat {
    fn from_env() -> Option<Self> {
        match std::env::var("PREFORK_LOG_FORMAT").ok()?.to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            other => {
                eprintln!("prefork: unknown log format '{other}', keeping the default");
                None
            }
        }
    }
}

/// Subscriber configuration. Unset fields fall back to the environment.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directive, e.g. `"info"` or `"prefork=debug"`. Falls back to
    /// `PREFORK_LOG`, then `RUST_LOG`, then `"info"`.
    pub filter: Option<String>,
    /// Output shape; `PREFORK_LOG_FORMAT` applies when unset.
    pub format: Option<LogFormat>,
    /// Daily-rotated log file written in addition to stderr.
    pub file: Option<PathBuf>,
}

/// Install the global subscriber. Returns false when one is already set
/// (the call is then a no-op, so it is safe in library embedders).
pub fn init(config: &LogConfig) -> bool {
    let directive = config
        .filter
        .clone()
        .or_else(|| std::env::var("PREFORK_LOG").ok())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| {
        eprintln!("prefork: invalid log filter '{directive}', using 'info'");
        EnvFilter::new("info")
    });

    let format = config.format.or_else(LogFormat::from_env).unwrap_or_default();
    let file_appender = config.file.as_ref().map(|path| {
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "prefork.log".into());
        rolling::daily(dir, name)
    });

    // An absent file appender contributes a no-op layer, so each format
    // needs only one arm.
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_appender.map(|a| fmt::layer().json().with_ansi(false).with_writer(a)))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .with(file_appender.map(|a| fmt::layer().compact().with_ansi(false).with_writer(a)))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_appender.map(|a| fmt::layer().with_ansi(false).with_writer(a)))
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_default_is_pretty() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_config_default_defers_to_environment() {
        let config = LogConfig::default();
        assert!(config.filter.is_none());
        assert!(config.format.is_none());
        assert!(config.file.is_none());
    }
}

//! Logging setup
//!
//! Settings come from environment variables:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `RUST_LOG` | `info` | `EnvFilter` directives |
//! | `GATEWAY_LOG_FORMAT` | `pretty` | `pretty` or `json` |
//! | `GATEWAY_LOG_SPANS` | `false` | Log span close events with timings |

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives
    pub filter: String,
    pub format: LogFormat,
    pub log_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            log_spans: false,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = LogConfig::default();
        LogConfig {
            filter: lookup("RUST_LOG")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: match lookup("GATEWAY_LOG_FORMAT").as_deref() {
                Some("json") | Some("JSON") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            log_spans: lookup("GATEWAY_LOG_SPANS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.log_spans),
        }
    }
}

/// Install the global subscriber
///
/// Returns an error if one is already installed or the filter does not parse.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.filter)?;
    let spans = if config.log_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(spans)
        .with_target(true);

    match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Pretty => builder.try_init(),
    }
}

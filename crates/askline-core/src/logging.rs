//! Structured logging configuration for askline.
//!
//! Uses `tracing` with `tracing-subscriber`. Output goes to stderr so that
//! answers printed on stdout stay clean.
//!
//! ## Environment Variables
//!
//! - `ASKLINE_LOG` or `RUST_LOG`: log filter (e.g. `askline_core=debug`)
//! - `ASKLINE_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! ```bash
//! # Watch every frame the channel drops
//! ASKLINE_LOG=askline_core=trace askline "what is the tallest mountain?"
//! ```

use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "askline=warn,askline_core=warn,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Pretty,
    /// Single-line output; the default for a terminal client
    #[default]
    Compact,
    /// JSON output for log aggregation
    Json,
}

impl LogFormat {
    /// Unknown names fall back to compact.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `askline_core=debug,reqwest=warn`
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Source location on every event
    pub with_file: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Compact,
            with_spans: false,
            with_file: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// `ASKLINE_LOG`, then `RUST_LOG`, then the warn-only default.
    pub fn from_env() -> Self {
        let filter = std::env::var("ASKLINE_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        let format = std::env::var("ASKLINE_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// Protocol-level detail for `--verbose`.
    pub fn verbose() -> Self {
        Self {
            filter: "askline=debug,askline_core=debug,warn".to_string(),
            ..Default::default()
        }
    }

    /// Everything, including dropped frames and span timings.
    pub fn debug() -> Self {
        Self {
            filter: "askline=trace,askline_core=trace,info".to_string(),
            format: LogFormat::Pretty,
            with_spans: true,
            with_file: true,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. A second call leaves the first one in place.
pub fn init(config: LogConfig) {
    let filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::registry()
        .with(stderr_layer(&config))
        .with(filter)
        .try_init();
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(config: &LogConfig) -> BoxedLayer {
    let spans = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(spans)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    }
}

/// Convenience for `init(LogConfig::from_env())`.
pub fn init_from_env() {
    init(LogConfig::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        for (name, format) in [
            ("json", LogFormat::Json),
            ("Pretty", LogFormat::Pretty),
            ("compact", LogFormat::Compact),
            ("", LogFormat::Compact),
        ] {
            assert_eq!(LogFormat::parse(name), format, "{name:?}");
        }
    }

    #[test]
    fn test_verbose_config() {
        let config = LogConfig::verbose();
        assert!(config.filter.contains("askline_core=debug"));
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_debug_config() {
        let config = LogConfig::debug();
        assert!(config.with_file);
        assert!(config.with_spans);
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_every_preset_filter_parses() {
        for config in [LogConfig::default(), LogConfig::verbose(), LogConfig::debug()] {
            assert!(EnvFilter::try_new(&config.filter).is_ok(), "{}", config.filter);
        }
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(LogConfig::default());
        init(LogConfig::debug());
        tracing::warn!("still logging");
    }
}

//! Tracing setup.
//!
//! The library only emits `tracing` events. Installing a subscriber is left
//! to the binary (or the embedding application) through [`init_tracing`],
//! which is available with the `cli` feature.

use tracing::{Level, Span, span};

/// Environment variable holding an `EnvFilter` directive, e.g.
/// `session_recorder=debug`.
pub const LOG_ENV_VAR: &str = "SESSION_RECORDER_LOG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl TracingLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            TracingLevel::Error => "error",
            TracingLevel::Warn => "warn",
            TracingLevel::Info => "info",
            TracingLevel::Debug => "debug",
            TracingLevel::Trace => "trace",
        }
    }

    /// Level for a `-v` count: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => TracingLevel::Warn,
            1 => TracingLevel::Info,
            2 => TracingLevel::Debug,
            _ => TracingLevel::Trace,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    Init(String),
}

/// Span carrying the session ID for everything logged while it is entered.
pub fn session_span(session_id: &str) -> Span {
    span!(Level::INFO, "session", session_id = %session_id)
}

/// Install a stderr `fmt` subscriber.
///
/// `SESSION_RECORDER_LOG` wins over `default_level` when set and valid.
#[cfg(feature = "cli")]
pub fn init_tracing(default_level: TracingLevel) -> Result<(), ObservabilityError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_filter()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ObservabilityError::Init(e.to_string()))
}

//! Logging initialization and the server's pluggable log sink.
//!
//! Structured logging goes through `tracing`. Binaries install a global
//! subscriber with [`init_logging_with_config`]; the server itself only ever
//! emits events inside its [`Logger`], which may carry its own
//! [`tracing::Dispatch`] so that a single server instance can be pointed at a
//! different sink (tests use this to capture lifecycle output).

use anyhow::{Context, Result};
use std::env;
use std::fmt;
use tracing::{Dispatch, Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log format: JSON for production, pretty-print for development
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json, // Default to JSON
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level: trace/debug/info/warn/error
    pub log_level: String,
    /// Log format: json/pretty
    pub format: LogFormat,
    /// Enable async buffered logging
    pub async_logging: bool,
    /// Module filter (comma-separated directives)
    pub target_filter: Option<String>,
    /// Include file:line location (dev only)
    pub include_location: bool,
}

impl LogConfig {
    /// Parse configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            log_level: env::var("BRRTS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::parse(
                &env::var("BRRTS_LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            ),
            async_logging: env::var("BRRTS_LOG_ASYNC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            target_filter: env::var("BRRTS_LOG_TARGET_FILTER").ok(),
            include_location: env::var("BRRTS_LOG_INCLUDE_LOCATION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
        }
    }

    /// Create a default configuration for local development
    #[must_use]
    pub fn default_dev() -> Self {
        Self {
            log_level: "debug".to_string(),
            format: LogFormat::Pretty,
            async_logging: false,
            target_filter: None,
            include_location: true,
        }
    }

    /// Create a default production configuration
    #[must_use]
    pub fn default_prod() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Json,
            async_logging: true,
            target_filter: None,
            include_location: false,
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let level = parse_level(&config.log_level);
    let mut env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if let Some(target_filter) = &config.target_filter {
        for filter in target_filter.split(',') {
            let filter = filter.trim();
            if filter.is_empty() {
                continue;
            }
            match filter.parse() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(_) => eprintln!("Warning: Invalid log filter directive: {filter}"),
            }
        }
    }
    env_filter
}

/// Initialize the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging_with_config(config: &LogConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(config));

    if config.async_logging {
        let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

        let fmt_layer = match config.format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_span_list(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(non_blocking)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_writer(non_blocking)
                .boxed(),
        };

        registry
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize async logging")?;

        // The worker must outlive every coroutine that logs.
        std::mem::forget(guard);
    } else {
        let fmt_layer = match config.format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_span_list(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .boxed(),
        };

        registry
            .with(fmt_layer)
            .try_init()
            .context("Failed to initialize sync logging")?;
    }

    Ok(())
}

/// Server-scoped log sink.
///
/// Wraps a root span (every lifecycle message is emitted inside it) and,
/// optionally, a dedicated dispatcher that overrides the global subscriber
/// for everything run through [`Logger::in_scope`].
#[derive(Clone)]
pub struct Logger {
    span: Span,
    dispatch: Option<Dispatch>,
}

impl Logger {
    /// Logger using the global subscriber.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            span: tracing::info_span!("server", name = %name),
            dispatch: None,
        }
    }

    /// Logger bound to its own dispatcher instead of the global one.
    #[must_use]
    pub fn with_dispatch(name: &str, dispatch: Dispatch) -> Self {
        let span = tracing::dispatcher::with_default(&dispatch, || {
            tracing::info_span!("server", name = %name)
        });
        Self {
            span,
            dispatch: Some(dispatch),
        }
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `f` with this logger's dispatcher (if any) and root span active.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => {
                tracing::dispatcher::with_default(dispatch, || self.span.in_scope(f))
            }
            None => self.span.in_scope(f),
        }
    }

    /// Best-effort error reporting: log and carry on.
    pub fn log_error(&self, err: &anyhow::Error) {
        self.in_scope(|| tracing::error!(error = %err, "{err:#}"));
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("brrtserver")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("span", &self.span)
            .field("custom_dispatch", &self.dispatch.is_some())
            .finish()
    }
}

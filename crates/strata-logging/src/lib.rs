//! Structured logging bootstrap for the Strata relay
//!
//! Every Strata crate logs through `tracing`. This crate wires those events
//! to a subscriber once per process.
//!
//! # Features
//!
//! - **JSON lines by default**: structured output for log aggregation
//! - **Pretty or compact console**: human-readable output for development and tests
//! - **Per-target levels**: quiet the access tracker, open up the planner
//! - **File Rotation**: daily/hourly log rotation via tracing-appender
//! - **RUST_LOG aware**: the environment filter overrides the configured directives
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_logging::{StrataSubscriberBuilder, LogConfig};
//!
//! // JSON lines to the console
//! StrataSubscriberBuilder::new().init();
//!
//! // Pretty output while developing
//! let _guard = StrataSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```

pub mod config;

pub use config::{ConsoleConfig, ConsoleFormat, FileConfig, LogConfig, RotationStrategy};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Builder for configuring and initializing the Strata logging subscriber
///
/// By default, console output uses JSON lines. Use `LogConfig::development()`
/// for human-readable pretty output during development.
pub struct StrataSubscriberBuilder {
    config: LogConfig,
}

impl StrataSubscriberBuilder {
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the level for targets without an override
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Override the level of one target, such as `strata_storage::gc`
    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.config = self.config.with_target(target, level);
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_format(mut self, format: ConsoleFormat) -> Self {
        self.config.console.format = format;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Initialize the subscriber globally
    ///
    /// Returns the file writer guard when file output is configured; keep it
    /// alive for the duration of the program. If a global subscriber is
    /// already installed the call reports it on stderr and leaves the
    /// existing subscriber in place.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: logging already initialized: {}", e);
                None
            }
        }
    }

    /// Try to initialize the subscriber globally
    pub fn try_init(self) -> Result<Option<WorkerGuard>, TryInitError> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.directives()));

        let console = &self.config.console;
        let console_filter = || EnvFilter::new(self.config.console_directives());
        let console_writer = || {
            if console.test_writer {
                BoxMakeWriter::new(TestWriter::new())
            } else {
                BoxMakeWriter::new(std::io::stdout)
            }
        };
        let uses = |format: ConsoleFormat| console.enabled && console.format == format;

        let json_layer = uses(ConsoleFormat::Json).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .flatten_event(true)
                .with_writer(console_writer())
                .with_filter(console_filter())
        });

        let pretty_layer = uses(ConsoleFormat::Pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(console.ansi)
                .with_writer(console_writer())
                .with_filter(console_filter())
        });

        let compact_layer = uses(ConsoleFormat::Compact).then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_writer(console_writer())
                .with_filter(console_filter())
        });

        let (file_writer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = file_writer(file_config);
                (Some(writer), Some(guard))
            }
            None => (None, None),
        };

        let file_layer = file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .flatten_event(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
        });

        Registry::default()
            .with(env_filter)
            .with(json_layer)
            .with(pretty_layer)
            .with(compact_layer)
            .with(file_layer)
            .try_init()?;

        Ok(guard)
    }
}

impl Default for StrataSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn file_writer(config: &FileConfig) -> (NonBlocking, WorkerGuard) {
    let (rotation, prefix) = match config.rotation {
        RotationStrategy::Daily => (Rotation::DAILY, config.prefix.clone()),
        RotationStrategy::Hourly => (Rotation::HOURLY, config.prefix.clone()),
        RotationStrategy::Never => (Rotation::NEVER, format!("{}.log", config.prefix)),
    };
    let appender = RollingFileAppender::new(rotation, &config.directory, prefix);
    tracing_appender::non_blocking(appender)
}

/// Initialize logging with default settings (JSON lines to console)
pub fn init_default() {
    StrataSubscriberBuilder::new().init();
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() {
    StrataSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init();
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from many tests; only the first call installs a subscriber.
pub fn init_testing() {
    let _ = StrataSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

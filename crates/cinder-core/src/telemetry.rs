//! Logging initialization
//!
//! The engine itself only emits `tracing` events; embedding applications that
//! do not install their own subscriber can call [`init_logging`] with the
//! `[logging]` section of the configuration.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{CinderError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install a global `tracing` subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Returns an error if
/// a global subscriber is already installed or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let layer: BoxedLayer = match (&config.file, config.format) {
        (Some(path), format) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let writer = Mutex::new(file);
            match format {
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
                LogFormat::Pretty => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
            }
        }
        (None, LogFormat::Json) => fmt::layer().json().boxed(),
        (None, LogFormat::Pretty) => fmt::layer().pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| CinderError::Config(format!("Failed to initialize tracing subscriber: {e}")))
}

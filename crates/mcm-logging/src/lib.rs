//! Logging setup for the media proxy.
//!
//! Two output shapes, selectable at init time: a single-line key=value
//! format for development and single-node runs, and JSON for cloud
//! deployments where a collector parses the stream. Console and rolling
//! file outputs can be combined.
//!
//! Wire it up before bringing any connection up, and keep the guard alive
//! for the process lifetime:
//!
//! ```no_run
//! let _guard = mcm_logging::init(&mcm_logging::LogConfig::default());
//! // configure / establish connections from here on
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::rolling;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Re-export the tracing macros for call sites.
pub use tracing::{debug, error, info, trace, warn};

/// Output shape of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single line with key=value fields.
    #[default]
    Standard,
    /// One JSON object per line.
    Json,
}

/// File rotation cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error). Overridden by
    /// `RUST_LOG` when set.
    pub level: String,

    pub format: LogFormat,

    /// Whether to log to stdout.
    pub console: bool,

    /// Directory for rolling log files; no file output when unset.
    pub log_dir: Option<PathBuf>,

    pub file_prefix: String,

    pub rotation: Rotation,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
            format: LogFormat::Standard,
            console: true,
            log_dir: None,
            file_prefix: "media-proxy".into(),
            rotation: Rotation::Hourly,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

impl LogConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// One formatted output in the configured shape, writing to `writer`.
    fn output<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        match self.format {
            LogFormat::Standard => fmt::layer().with_writer(writer).boxed(),
            LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        }
    }
}

/// Keeps the non-blocking file writer flushing; hold for the process
/// lifetime. Dropping it loses buffered file output.
pub struct LogGuard {
    _file_writer: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber described by `config`.
///
/// Call once at startup. Later calls (and calls in processes that already
/// installed a subscriber) keep the existing subscriber and only return a
/// fresh guard, so tests may call this freely.
pub fn init(config: &LogConfig) -> LogGuard {
    let mut outputs: Vec<BoxedLayer> = vec![config.filter().boxed()];
    let mut file_writer = None;

    if config.console {
        outputs.push(config.output(std::io::stdout));
    }

    if let Some(dir) = &config.log_dir {
        let appender = rolling::RollingFileAppender::builder()
            .rotation(config.rotation.into())
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(dir)
            .expect("failed to create rolling file appender");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        outputs.push(config.output(writer));
        file_writer = Some(guard);
    }

    // A second install attempt loses to the first; that is the documented
    // behavior, not an error worth surfacing.
    let _ = tracing_subscriber::registry().with(outputs).try_init();

    LogGuard {
        _file_writer: file_writer,
    }
}

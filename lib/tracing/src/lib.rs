//! Process-wide log setup: picks a record format and installs it behind a `RUST_LOG` filter.

mod formatter;
pub use formatter::LogFormat;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Configuration for the process-wide tracer.
///
/// Holds the output format, coloring and the level applied when `RUST_LOG` is unset.
#[derive(Debug, Clone)]
pub struct Tracer {
    format: LogFormat,
    use_color: bool,
    default_level: LevelFilter,
}

impl Tracer {
    /// Logs at INFO unless `RUST_LOG` says otherwise. `use_color` only affects
    /// the JSON and terminal formats.
    pub const fn new(format: LogFormat, use_color: bool) -> Self {
        Self {
            format,
            use_color,
            default_level: LevelFilter::INFO,
        }
    }

    pub const fn with_default_level(mut self, level: LevelFilter) -> Self {
        self.default_level = level;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.default_level.into())
            .from_env_lossy()
    }

    /// Installs the tracer as the global default subscriber.
    /// Does nothing if a global subscriber is already installed.
    pub fn init(self) {
        let layer = self.format.apply(self.filter(), self.use_color);
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }
    }
}

impl Default for Tracer {
    /// By default logs are human-readable and colored.
    fn default() -> Self {
        Self::new(LogFormat::Terminal, true)
    }
}

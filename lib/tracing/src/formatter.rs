use serde::{Deserialize, Serialize};
use std::{fmt, fmt::Display, str::FromStr};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output format of log records.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per record, with target, file and line.
    Json,

    /// logfmt (key=value) records.
    LogFmt,

    /// Human-readable records for interactive use.
    #[default]
    Terminal,
}

impl LogFormat {
    const ALL: [Self; 3] = [Self::Json, Self::LogFmt, Self::Terminal];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::LogFmt => "logfmt",
            Self::Terminal => "terminal",
        }
    }

    /// Builds the formatting layer for this format, filtered by `filter`.
    pub fn apply(
        &self,
        filter: EnvFilter,
        use_color: bool,
    ) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
        // Log lines go to stderr: stdout carries the program's output.
        match self {
            Self::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(use_color)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed(),
            Self::LogFmt => tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr)
                .with_filter(filter)
                .boxed(),
            Self::Terminal => tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(use_color)
                .with_target(true)
                .with_filter(filter)
                .boxed(),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log format `{0}`, expected one of: json, logfmt, terminal")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownLogFormat(s.to_owned()))
    }
}

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use streamline_tracing::LogFormat;

pub use streamline_publish::PublisherConfig;

/// Environment variable holding the path of the TOML config file.
pub const CONFIG_PATH_ENV: &str = "STREAMLINE_CONFIG";

/// Configuration of the publisher binary.
/// Every section and field is optional; defaults suit a local run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub general: GeneralConfig,
    pub publisher: PublisherConfig,
    pub log: LogConfig,
}

impl Config {
    /// Loads the file named by `STREAMLINE_CONFIG`, or the defaults if it is unset.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Stream every input line is published to.
    #[serde(default = "default_stream_id")]
    pub stream_id: String,

    /// Number of partitions of the stream.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Size of the stdin read buffer, in bytes.
    #[serde(default = "default_input_buffer_capacity")]
    pub input_buffer_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            stream_id: default_stream_id(),
            partitions: default_partitions(),
            input_buffer_capacity: default_input_buffer_capacity(),
        }
    }
}

fn default_stream_id() -> String {
    "streamline/default".into()
}

fn default_partitions() -> u32 {
    1
}

fn default_input_buffer_capacity() -> usize {
    64 * 1024
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_use_color")]
    pub use_color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            use_color: default_use_color(),
        }
    }
}

fn default_use_color() -> bool {
    true
}

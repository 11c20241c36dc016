use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    /// Id this publisher signs its message chains with.
    #[serde(default = "default_publisher_id")]
    pub publisher_id: String,

    /// Message chain used when a publish request names none.
    /// A random id is generated when unset.
    #[serde(default)]
    pub msg_chain_id: Option<String>,

    /// Max number of message chains whose state is kept in memory.
    #[serde(default = "default_chain_cache_max_size")]
    pub chain_cache_max_size: usize,

    /// Chains idle for longer than this many seconds start over from sequence number 0.
    #[serde(default)]
    pub chain_cache_max_age_secs: Option<u64>,

    /// How many publish requests may wait in front of the message creator.
    #[serde(default = "default_queue_buffer_size")]
    pub queue_buffer_size: usize,
}

impl PublisherConfig {
    pub fn chain_cache_max_age(&self) -> Option<Duration> {
        self.chain_cache_max_age_secs.map(Duration::from_secs)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publisher_id: default_publisher_id(),
            msg_chain_id: None,
            chain_cache_max_size: default_chain_cache_max_size(),
            chain_cache_max_age_secs: None,
            queue_buffer_size: default_queue_buffer_size(),
        }
    }
}

fn default_publisher_id() -> String {
    "anonymous".into()
}

fn default_chain_cache_max_size() -> usize {
    10_000
}

fn default_queue_buffer_size() -> usize {
    256
}

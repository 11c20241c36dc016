//! Message publishing on top of `streamline_pipeline`: partition routing, per-publisher
//! message chains and the message creator tying them together.

mod cache;
pub mod chain;
pub mod config;
mod creator;
mod message;
pub mod partition;

pub use cache::ChainStateCache;
pub use chain::{ChainError, ChainKey, ChainState, MessageChainer, MessageId, MessageRef};
pub use config::PublisherConfig;
pub use creator::{
    FixedPartitions, MessageCreator, MessageSealer, PublishError, PublishRequest, StreamMetadata,
};
pub use message::StreamMessage;
pub use partition::{PartitionError, partition};

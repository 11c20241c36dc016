use crate::cache::ChainStateCache;
use crate::chain::{ChainError, ChainKey, MessageChainer};
use crate::config::PublisherConfig;
use crate::message::StreamMessage;
use crate::partition::{PartitionError, partition};
use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use std::sync::Arc;
use streamline_pipeline::{KeyedQueue, KeyedQueueError, PushPipeline};

/// Source of stream metadata needed to route messages.
#[async_trait]
pub trait StreamMetadata: Send + Sync + 'static {
    async fn partition_count(&self, stream_id: &str) -> anyhow::Result<u32>;
}

/// Every stream has the same, fixed number of partitions.
#[derive(Debug, Clone, Copy)]
pub struct FixedPartitions(pub u32);

#[async_trait]
impl StreamMetadata for FixedPartitions {
    async fn partition_count(&self, _stream_id: &str) -> anyhow::Result<u32> {
        Ok(self.0)
    }
}

/// A transformation applied to every created message before it is returned,
/// e.g. payload encryption or signing.
#[async_trait]
pub trait MessageSealer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn seal(&self, message: &mut StreamMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub stream_id: String,
    /// Explicit target partition. Mutually exclusive with `partition_key`.
    #[serde(default)]
    pub partition: Option<u32>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub msg_chain_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub content: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("`partition` and `partition_key` cannot be combined")]
    PartitionConflict,
    #[error("partition {partition} is out of range, stream has {count} partitions")]
    PartitionOutOfRange { partition: u32, count: u32 },
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Queue(#[from] KeyedQueueError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Turns publish requests into chained, sealed stream messages.
///
/// Messages of one chain are created strictly one at a time, in the order requests reach the
/// creator; chains are processed concurrently.
pub struct MessageCreator {
    publisher_id: String,
    default_msg_chain_id: String,
    metadata: Arc<dyn StreamMetadata>,
    sealers: Vec<Arc<dyn MessageSealer>>,
    chains: Arc<ChainStateCache>,
    queue: KeyedQueue<ChainKey>,
}

impl MessageCreator {
    pub fn new(config: &PublisherConfig, metadata: Arc<dyn StreamMetadata>) -> Self {
        let default_msg_chain_id = config
            .msg_chain_id
            .clone()
            .unwrap_or_else(random_msg_chain_id);
        tracing::info!(
            publisher_id = %config.publisher_id,
            msg_chain_id = %default_msg_chain_id,
            "message creator initialized"
        );
        Self {
            publisher_id: config.publisher_id.clone(),
            default_msg_chain_id,
            metadata,
            sealers: Vec::new(),
            chains: Arc::new(ChainStateCache::new(
                config.chain_cache_max_size,
                config.chain_cache_max_age(),
            )),
            queue: KeyedQueue::new(),
        }
    }

    /// Appends a sealer. Sealers run in registration order, so register encryption before
    /// signing.
    pub fn with_sealer(mut self, sealer: Arc<dyn MessageSealer>) -> Self {
        self.sealers.push(sealer);
        self
    }

    pub async fn create(&self, request: PublishRequest) -> Result<StreamMessage, PublishError> {
        let PublishRequest {
            stream_id,
            partition: explicit_partition,
            partition_key,
            msg_chain_id,
            timestamp,
            content,
        } = request;

        if explicit_partition.is_some() && partition_key.is_some() {
            return Err(PublishError::PartitionConflict);
        }
        let count = self
            .metadata
            .partition_count(&stream_id)
            .await
            .with_context(|| format!("failed to fetch metadata of stream {stream_id}"))?;
        let partition = match (explicit_partition, partition_key.as_deref()) {
            (Some(partition), _) if partition >= count => {
                return Err(PublishError::PartitionOutOfRange { partition, count });
            }
            (Some(partition), _) => partition,
            (None, Some(key)) => partition(count, Some(key))?,
            // Unkeyed messages of a publisher all land on the first partition, one chain.
            (None, None) if count > 0 => 0,
            (None, None) => return Err(PartitionError::NoPartitions.into()),
        };

        let key = ChainKey {
            stream_id,
            partition,
            publisher_id: self.publisher_id.clone(),
            msg_chain_id: msg_chain_id.unwrap_or_else(|| self.default_msg_chain_id.clone()),
        };
        let chains = self.chains.clone();
        let sealers = self.sealers.clone();
        let job_key = key.clone();
        let job = async move {
            let (message_id, prev_msg_ref) =
                chains.update(&job_key, |state| MessageChainer::chain(&job_key, state, timestamp))?;
            let mut message = StreamMessage::new(message_id, prev_msg_ref, content);
            for sealer in &sealers {
                sealer
                    .seal(&mut message)
                    .await
                    .with_context(|| format!("sealer `{}` failed", sealer.name()))?;
            }
            tracing::trace!(
                chain = %job_key,
                timestamp,
                sequence_number = message.message_id.sequence_number,
                "message created"
            );
            Ok::<_, PublishError>(message)
        };
        self.queue.queue(key, job).await?
    }

    /// A push pipeline turning pushed requests into messages, in push order.
    pub fn publish_pipeline(
        self: &Arc<Self>,
        capacity: usize,
    ) -> PushPipeline<PublishRequest, StreamMessage> {
        let creator = self.clone();
        PushPipeline::<PublishRequest>::new(capacity)
            .map_async(move |request, _| {
                let creator = creator.clone();
                async move { Ok(creator.create(request).await?) }
            })
            .on_finally(|outcome| async move {
                tracing::debug!(?outcome, "publish pipeline finished");
                Ok(())
            })
    }

    /// Drops queued requests and forgets all chain state.
    pub fn stop(&self) {
        self.queue.clear();
        self.chains.clear();
        tracing::info!("message creator stopped");
    }

    pub fn default_msg_chain_id(&self) -> &str {
        &self.default_msg_chain_id
    }
}

impl std::fmt::Debug for MessageCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCreator")
            .field("publisher_id", &self.publisher_id)
            .field("default_msg_chain_id", &self.default_msg_chain_id)
            .field("sealers", &self.sealers.len())
            .field("chains", &self.chains)
            .finish()
    }
}

fn random_msg_chain_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

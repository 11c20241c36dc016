use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one message chain: a publisher's ordered series of messages on one stream
/// partition. Chains under different keys are independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainKey {
    pub stream_id: String,
    pub partition: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}|{}|{}",
            self.stream_id, self.partition, self.publisher_id, self.msg_chain_id
        )
    }
}

/// Position of a message within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence_number: u32,
}

/// Full identity of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageId {
    pub stream_id: String,
    pub stream_partition: u32,
    pub timestamp: i64,
    pub sequence_number: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn to_ref(&self) -> MessageRef {
        MessageRef {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
        }
    }
}

/// Last position issued on a chain. Empty until the first message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainState {
    last: Option<MessageRef>,
}

impl ChainState {
    pub fn last(&self) -> Option<MessageRef> {
        self.last
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("timestamp {timestamp} is older than the last message of chain {key} ({last:?})")]
    OutOfOrder {
        key: String,
        timestamp: i64,
        last: MessageRef,
    },
    #[error("chain {key} ran out of sequence numbers at timestamp {timestamp}")]
    SequenceExhausted { key: String, timestamp: i64 },
}

/// Assigns chain positions.
///
/// Messages sharing a timestamp are told apart by an increasing sequence number, which
/// restarts at 0 whenever the timestamp grows. Every message references its predecessor so
/// subscribers can detect gaps. Callers must serialize calls per key
/// (see `MessageCreator`, which runs them through a keyed queue).
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageChainer;

impl MessageChainer {
    pub fn chain(
        key: &ChainKey,
        state: &mut ChainState,
        timestamp: i64,
    ) -> Result<(MessageId, Option<MessageRef>), ChainError> {
        let prev = state.last;
        let sequence_number = match prev {
            None => 0,
            Some(last) if timestamp == last.timestamp => last
                .sequence_number
                .checked_add(1)
                .ok_or_else(|| ChainError::SequenceExhausted {
                    key: key.to_string(),
                    timestamp,
                })?,
            Some(last) if timestamp > last.timestamp => 0,
            Some(last) => {
                return Err(ChainError::OutOfOrder {
                    key: key.to_string(),
                    timestamp,
                    last,
                });
            }
        };

        let id = MessageId {
            stream_id: key.stream_id.clone(),
            stream_partition: key.partition,
            timestamp,
            sequence_number,
            publisher_id: key.publisher_id.clone(),
            msg_chain_id: key.msg_chain_id.clone(),
        };
        state.last = Some(id.to_ref());
        Ok((id, prev))
    }
}

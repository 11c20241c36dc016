use crate::chain::{MessageId, MessageRef};
use serde::{Deserialize, Serialize};

/// A chained message ready to be handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub message_id: MessageId,
    pub prev_msg_ref: Option<MessageRef>,
    pub content: serde_json::Value,
    /// Id of the group key the content was encrypted with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl StreamMessage {
    pub fn new(
        message_id: MessageId,
        prev_msg_ref: Option<MessageRef>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            message_id,
            prev_msg_ref,
            content,
            group_key_id: None,
            signature: None,
        }
    }
}

use chrono::{DateTime, Utc};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};

use crate::{BranchId, ConversationId, MessageId};

/// Free-form JSON attached to conversations and messages.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A high-level container for one recorded chat session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// One linear path of messages within a conversation.
///
/// The root branch of a conversation has neither a parent branch nor a
/// parent message; every forked branch has both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub id: BranchId,
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<BranchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

/// A tool call carried by a chat message.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub function: FunctionCallRecord,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCallRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// A plain chat message as seen on the wire, before it gains an identity
/// in the ledger.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Setters)]
#[setters(into, strip_option)]
pub struct SimpleMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i32>,
    /// Prompt evaluation wall time in nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<i64>,
    /// Completion wall time in nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_host: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl SimpleMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// Folds the typed tool-call fields into the metadata map persisted with
    /// the message. Returns `None` when there is nothing to store.
    pub fn metadata_for_persistence(&self) -> Option<Metadata> {
        let mut metadata = self.metadata.clone().unwrap_or_default();
        if !self.tool_calls.is_empty() {
            if let Ok(value) = serde_json::to_value(&self.tool_calls) {
                metadata.insert("tool_calls".to_string(), value);
            }
        }
        if let Some(tool_call_id) = &self.tool_call_id {
            metadata.insert(
                "tool_call_id".to_string(),
                serde_json::Value::String(tool_call_id.clone()),
            );
        }
        (!metadata.is_empty()).then_some(metadata)
    }
}

/// A message that has been persisted into the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub branch_id: BranchId,
    pub sequence_number: i32,
    pub cumulative_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_branch_ids: Vec<BranchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<String>,
    #[serde(flatten)]
    pub detail: SimpleMessage,
}

/// Input for appending a message to the ledger.
///
/// `branch_id` is required only when the message has no parent, i.e. it
/// seeds a fresh root branch.
#[derive(Debug, Default, Clone, Setters)]
#[setters(into, strip_option)]
pub struct NewMessage {
    pub branch_id: Option<BranchId>,
    pub upstream_status_code: Option<i32>,
    pub upstream_error: Option<String>,
    pub detail: SimpleMessage,
}

impl From<SimpleMessage> for NewMessage {
    fn from(detail: SimpleMessage) -> Self {
        Self {
            detail,
            ..Default::default()
        }
    }
}

/// Summary of one conversation: the conversation row plus its first
/// non-system message and first system message, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationOverview {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<Message>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_metadata_for_persistence_empty() {
        let fixture = SimpleMessage::new("user", "Hello");

        assert_eq!(fixture.metadata_for_persistence(), None);
    }

    #[test]
    fn test_metadata_for_persistence_folds_tool_calls() {
        let fixture = SimpleMessage::new("assistant", "").tool_calls(vec![ToolCallRecord {
            id: "call_123".to_string(),
            kind: "function".to_string(),
            function: FunctionCallRecord {
                name: "get_weather".to_string(),
                arguments: r#"{"location":"London"}"#.to_string(),
            },
        }]);

        let actual = fixture.metadata_for_persistence().unwrap();

        assert!(actual.contains_key("tool_calls"));
        assert_eq!(actual["tool_calls"][0]["id"], "call_123");
    }

    #[test]
    fn test_metadata_for_persistence_keeps_existing_keys() {
        let mut metadata = Metadata::new();
        metadata.insert("origin".to_string(), "test".into());
        let fixture = SimpleMessage::new("tool", "42")
            .metadata(metadata)
            .tool_call_id("call_abc");

        let actual = fixture.metadata_for_persistence().unwrap();

        assert_eq!(actual["origin"], "test");
        assert_eq!(actual["tool_call_id"], "call_abc");
    }
}

//! Conversation / turn / message data model.
//!
//! These are the rows the storage adapter persists. Conversations own
//! turns, turns own messages; a message may weakly reference a child
//! conversation through `linked_conversation_id`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Conversation status while idle / waiting on the assistant.
pub const CONVERSATION_STATUS_ACTIVE: &str = "";
pub const CONVERSATION_STATUS_COMPACTING: &str = "compacting";
pub const CONVERSATION_STATUS_COMPACTED: &str = "compacted";

/// Message status marking a compaction summary.
pub const MESSAGE_STATUS_SUMMARY: &str = "summary";

/// Message mode marking chain-internal messages (never cloned into children).
pub const MESSAGE_MODE_CHAIN: &str = "chain";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Token usage counters accumulated on a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_turn_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Free text: `""`, `"compacting"`, `"compacted"`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn_id: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_conversation_id: None,
            parent_turn_id: None,
            visibility: Visibility::default(),
            default_model: None,
            status: CONVERSATION_STATUS_ACTIVE.to_owned(),
            last_turn_id: None,
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a conversation row. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub id: String,
    pub status: Option<String>,
    pub last_turn_id: Option<String>,
    pub usage: Option<Usage>,
}

impl ConversationPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Queued,
    Pending,
    Running,
    WaitingForUser,
    Succeeded,
    Failed,
    Canceled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForUser => "waiting_for_user",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_for_user" => Ok(Self::WaitingForUser),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(Error::InvalidInput(format!("unknown turn status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    /// Admission order within the conversation. Immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_seq: Option<i64>,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Turn {
    /// The lightweight reference messages are anchored to.
    pub fn turn_ref(&self) -> TurnRef {
        TurnRef {
            conversation_id: self.conversation_id.clone(),
            turn_id: self.id.clone(),
            parent_message_id: self.starting_message_id.clone(),
        }
    }
}

/// Conditional status patch for a turn: applied only while the stored
/// status still equals `expected`. `queue_seq` and `created_at` are never
/// part of a patch, so they cannot change after insert.
#[derive(Debug, Clone)]
pub struct TurnPatch {
    pub id: String,
    pub expected: TurnStatus,
    pub status: TurnStatus,
    pub error_message: Option<String>,
}

/// Identifies the turn a message is written into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRef {
    pub conversation_id: String,
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

impl TurnRef {
    pub fn new(conversation_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_id: turn_id.into(),
            parent_message_id: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Chain,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Chain => "chain",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    ToolOp,
    Control,
    ElicitationRequest,
    ElicitationResponse,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ToolOp => "tool_op",
            Self::Control => "control",
            Self::ElicitationRequest => "elicitation_request",
            Self::ElicitationResponse => "elicitation_response",
        }
    }

    pub fn is_elicitation(self) -> bool {
        matches!(self, Self::ElicitationRequest | Self::ElicitationResponse)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Per-turn order. `None` until the allocator assigns it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub role: Role,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub interim: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_payload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elicitation_payload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_index: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_archived(&self) -> bool {
        self.archived.unwrap_or(false)
    }

    pub fn is_summary(&self) -> bool {
        self.status == MESSAGE_STATUS_SUMMARY
    }

    /// The body used for previews and size estimates: `content`, falling
    /// back to `raw_content` when content is empty.
    pub fn body(&self) -> &str {
        if self.content.is_empty() {
            self.raw_content.as_deref().unwrap_or("")
        } else {
            &self.content
        }
    }

    /// One-line description used in error contexts and logs.
    pub fn describe(&self) -> String {
        format!(
            "id={} conversation={} turn={} role={} type={} status={:?}",
            self.id,
            self.conversation_id,
            self.turn_id.as_deref().unwrap_or("-"),
            self.role,
            self.message_type,
            self.status,
        )
    }
}

/// Partial update of a message row. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub id: String,
    pub sequence: Option<i64>,
    pub content: Option<String>,
    pub raw_content: Option<String>,
    pub status: Option<String>,
    pub interim: Option<bool>,
    pub archived: Option<bool>,
    pub summary: Option<String>,
    pub superseded_by: Option<String>,
    pub linked_conversation_id: Option<String>,
}

impl MessagePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn apply(&self, msg: &mut Message) {
        if let Some(seq) = self.sequence {
            msg.sequence = Some(seq);
        }
        if let Some(content) = &self.content {
            msg.content = content.clone();
        }
        if let Some(raw) = &self.raw_content {
            msg.raw_content = Some(raw.clone());
        }
        if let Some(status) = &self.status {
            msg.status = status.clone();
        }
        if let Some(interim) = self.interim {
            msg.interim = interim;
        }
        if let Some(archived) = self.archived {
            msg.archived = Some(archived);
        }
        if let Some(summary) = &self.summary {
            msg.summary = Some(summary.clone());
        }
        if let Some(sup) = &self.superseded_by {
            msg.superseded_by = Some(sup.clone());
        }
        if let Some(linked) = &self.linked_conversation_id {
            msg.linked_conversation_id = Some(linked.clone());
        }
        msg.updated_at = Some(Utc::now());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Satellite records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool execution metadata, keyed 1:1 by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub message_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_payload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Model invocation metadata, keyed 1:1 by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    pub message_id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

use serde::Serialize;

/// Structured trace events emitted by the conversation-state core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    MessageAdded {
        conversation_id: String,
        turn_id: Option<String>,
        message_id: String,
        role: String,
        sequence: Option<i64>,
        attempts: u32,
    },
    SequenceConflict {
        turn_id: String,
        message_id: String,
        sequence: i64,
        attempt: u32,
    },
    TurnStatusChanged {
        conversation_id: String,
        turn_id: String,
        from: String,
        to: String,
    },
    CompactionCompleted {
        conversation_id: String,
        strategy: String,
        removed: usize,
        freed_tokens: usize,
        kept_tokens: usize,
    },
    ConversationLinked {
        parent_conversation_id: String,
        parent_turn_id: String,
        child_conversation_id: String,
    },
    TranscriptCloned {
        child_conversation_id: String,
        child_turn_id: String,
        messages: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "cs_event");
    }
}

//! Storage contract consumed by the core, plus an in-memory adapter.
//!
//! Adapters persist single rows only; the core never asks for multi-row
//! transactions. A uniqueness violation must come back as
//! [`StorageError::Conflict`] naming the violated [`Constraint`], so the
//! message store can tell a sequence race from any other failure.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use cs_domain::error::{Constraint, StorageError};
use cs_domain::model::{
    Conversation, ConversationPatch, Message, MessagePatch, ModelCall, ToolCall, Turn, TurnPatch,
};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable keyed storage for conversations, turns and messages.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> StorageResult<()>;
    async fn update_conversation(&self, patch: &ConversationPatch) -> StorageResult<()>;
    async fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>>;

    async fn insert_turn(&self, turn: &Turn) -> StorageResult<()>;
    async fn get_turn(&self, id: &str) -> StorageResult<Option<Turn>>;
    async fn list_turns(&self, conversation_id: &str) -> StorageResult<Vec<Turn>>;
    /// Compare-and-set on status: must fail with
    /// `Conflict { constraint: TurnStatus }` when the stored status is not
    /// `patch.expected`.
    async fn update_turn(&self, patch: &TurnPatch) -> StorageResult<()>;
    /// Highest `queue_seq` assigned in a conversation.
    async fn max_queue_seq(&self, conversation_id: &str) -> StorageResult<Option<i64>>;

    async fn insert_message(&self, message: &Message) -> StorageResult<()>;
    async fn update_message(&self, patch: &MessagePatch) -> StorageResult<()>;
    async fn get_message(&self, id: &str) -> StorageResult<Option<Message>>;
    async fn list_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>>;
    /// Highest persisted `sequence` in a turn.
    async fn max_sequence(&self, turn_id: &str) -> StorageResult<Option<i64>>;

    async fn upsert_tool_call(&self, call: &ToolCall) -> StorageResult<()>;
    async fn get_tool_call(&self, message_id: &str) -> StorageResult<Option<ToolCall>>;
    async fn upsert_model_call(&self, call: &ModelCall) -> StorageResult<()>;
    async fn get_model_call(&self, message_id: &str) -> StorageResult<Option<ModelCall>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type MessageFault = Box<dyn Fn(&Message) -> Option<StorageError> + Send + Sync>;

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Conversation>,
    turns: HashMap<String, Turn>,
    messages: HashMap<String, Message>,
    /// Unique index on `(turn_id, sequence)`.
    turn_sequences: HashSet<(String, i64)>,
    tool_calls: HashMap<String, ToolCall>,
    model_calls: HashMap<String, ModelCall>,
}

/// Process-local storage enforcing the same uniqueness constraints a SQL
/// backend would: primary keys and `(turn_id, sequence)`.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    message_fault: Mutex<Option<MessageFault>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages across all conversations.
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }

    /// Make message inserts fail whenever `fault` returns an error.
    #[cfg(test)]
    pub(crate) fn set_message_fault(
        &self,
        fault: impl Fn(&Message) -> Option<StorageError> + Send + Sync + 'static,
    ) {
        *self.message_fault.lock() = Some(Box::new(fault));
    }
}

fn conflict(constraint: Constraint) -> StorageError {
    StorageError::Conflict { constraint }
}

fn not_found(table: &'static str, id: &str) -> StorageError {
    StorageError::NotFound {
        table,
        id: id.to_owned(),
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_conversation(&self, conversation: &Conversation) -> StorageResult<()> {
        let mut tables = self.tables.write();
        if tables.conversations.contains_key(&conversation.id) {
            return Err(conflict(Constraint::PrimaryKey));
        }
        tables
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn update_conversation(&self, patch: &ConversationPatch) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let conv = tables
            .conversations
            .get_mut(&patch.id)
            .ok_or_else(|| not_found("conversation", &patch.id))?;
        if let Some(status) = &patch.status {
            conv.status = status.clone();
        }
        if let Some(last_turn_id) = &patch.last_turn_id {
            conv.last_turn_id = Some(last_turn_id.clone());
        }
        if let Some(usage) = patch.usage {
            conv.usage = usage;
        }
        conv.updated_at = Utc::now();
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>> {
        Ok(self.tables.read().conversations.get(id).cloned())
    }

    async fn insert_turn(&self, turn: &Turn) -> StorageResult<()> {
        let mut tables = self.tables.write();
        if tables.turns.contains_key(&turn.id) {
            return Err(conflict(Constraint::PrimaryKey));
        }
        tables.turns.insert(turn.id.clone(), turn.clone());
        Ok(())
    }

    async fn update_turn(&self, patch: &TurnPatch) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let turn = tables
            .turns
            .get_mut(&patch.id)
            .ok_or_else(|| not_found("turn", &patch.id))?;
        if turn.status != patch.expected {
            return Err(conflict(Constraint::TurnStatus));
        }
        turn.status = patch.status;
        if let Some(msg) = &patch.error_message {
            turn.error_message = Some(msg.clone());
        }
        turn.updated_at = Utc::now();
        Ok(())
    }

    async fn get_turn(&self, id: &str) -> StorageResult<Option<Turn>> {
        Ok(self.tables.read().turns.get(id).cloned())
    }

    async fn list_turns(&self, conversation_id: &str) -> StorageResult<Vec<Turn>> {
        Ok(self
            .tables
            .read()
            .turns
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn max_queue_seq(&self, conversation_id: &str) -> StorageResult<Option<i64>> {
        Ok(self
            .tables
            .read()
            .turns
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .filter_map(|t| t.queue_seq)
            .max())
    }

    async fn insert_message(&self, message: &Message) -> StorageResult<()> {
        if let Some(fault) = self.message_fault.lock().as_ref() {
            if let Some(err) = fault(message) {
                return Err(err);
            }
        }

        let mut tables = self.tables.write();
        if tables.messages.contains_key(&message.id) {
            return Err(conflict(Constraint::PrimaryKey));
        }
        if let (Some(turn_id), Some(seq)) = (&message.turn_id, message.sequence) {
            if !tables.turn_sequences.insert((turn_id.clone(), seq)) {
                return Err(conflict(Constraint::TurnSequence));
            }
        }
        tables.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn update_message(&self, patch: &MessagePatch) -> StorageResult<()> {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let msg = tables
            .messages
            .get_mut(&patch.id)
            .ok_or_else(|| not_found("message", &patch.id))?;

        if let (Some(new_seq), Some(turn_id)) = (patch.sequence, msg.turn_id.clone()) {
            if msg.sequence != Some(new_seq) {
                if !tables.turn_sequences.insert((turn_id.clone(), new_seq)) {
                    return Err(conflict(Constraint::TurnSequence));
                }
                if let Some(old) = msg.sequence {
                    tables.turn_sequences.remove(&(turn_id, old));
                }
            }
        }
        patch.apply(msg);
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StorageResult<Option<Message>> {
        Ok(self.tables.read().messages.get(id).cloned())
    }

    async fn list_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn max_sequence(&self, turn_id: &str) -> StorageResult<Option<i64>> {
        Ok(self
            .tables
            .read()
            .turn_sequences
            .iter()
            .filter(|(t, _)| t == turn_id)
            .map(|(_, seq)| *seq)
            .max())
    }

    async fn upsert_tool_call(&self, call: &ToolCall) -> StorageResult<()> {
        self.tables
            .write()
            .tool_calls
            .insert(call.message_id.clone(), call.clone());
        Ok(())
    }

    async fn get_tool_call(&self, message_id: &str) -> StorageResult<Option<ToolCall>> {
        Ok(self.tables.read().tool_calls.get(message_id).cloned())
    }

    async fn upsert_model_call(&self, call: &ModelCall) -> StorageResult<()> {
        self.tables
            .write()
            .model_calls
            .insert(call.message_id.clone(), call.clone());
        Ok(())
    }

    async fn get_model_call(&self, message_id: &str) -> StorageResult<Option<ModelCall>> {
        Ok(self.tables.read().model_calls.get(message_id).cloned())
    }
}

//! Message store: the single write path for messages.
//!
//! New rows anchored to a turn get their `sequence` from the
//! [`SequenceAllocator`]. A `(turn_id, sequence)` conflict on insert is
//! retried with a fresh sequence and linear backoff; explicit sequences
//! and updates of existing rows are never retried.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use cs_domain::config::SequenceConfig;
use cs_domain::error::{Error, Result};
use cs_domain::model::{
    ConversationPatch, Message, MessagePatch, MessageType, Role, TurnRef,
    CONVERSATION_STATUS_ACTIVE,
};
use cs_domain::trace::TraceEvent;

use crate::cancel::{backoff, cancellable};
use crate::sequence::SequenceAllocator;
use crate::storage::Storage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NewMessage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fluent description of a message to add to a turn.
///
/// Conversation id, turn id and parent message id come from the turn;
/// everything else is set here.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub(crate) id: Option<String>,
    pub(crate) role: Role,
    pub(crate) message_type: MessageType,
    pub(crate) content: Option<String>,
    pub(crate) raw_content: Option<String>,
    pub(crate) status: Option<String>,
    pub(crate) interim: Option<bool>,
    pub(crate) mode: Option<String>,
    pub(crate) created_by: Option<String>,
    pub(crate) sequence: Option<i64>,
    pub(crate) parent_message_id: Option<String>,
    pub(crate) linked_conversation_id: Option<String>,
    pub(crate) tool_name: Option<String>,
    pub(crate) elicitation_id: Option<String>,
    pub(crate) attachment_payload_id: Option<String>,
    pub(crate) elicitation_payload_id: Option<String>,
    pub(crate) embedding_index: Option<Vec<u8>>,
}

impl NewMessage {
    pub fn new(role: Role) -> Self {
        Self {
            id: None,
            role,
            message_type: MessageType::Text,
            content: None,
            raw_content: None,
            status: None,
            interim: None,
            mode: None,
            created_by: None,
            sequence: None,
            parent_message_id: None,
            linked_conversation_id: None,
            tool_name: None,
            elicitation_id: None,
            attachment_payload_id: None,
            elicitation_payload_id: None,
            embedding_index: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User).content(content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant).content(content)
    }

    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Tool)
            .message_type(MessageType::ToolOp)
            .tool_name(tool_name)
            .content(content)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn raw_content(mut self, raw: impl Into<String>) -> Self {
        self.raw_content = Some(raw.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn interim(mut self, interim: bool) -> Self {
        self.interim = Some(interim);
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    /// Caller-owned ordering. Trusted as-is: a conflict is a hard failure.
    pub fn sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Override the turn's default parent message.
    pub fn parent_message_id(mut self, id: impl Into<String>) -> Self {
        self.parent_message_id = Some(id.into());
        self
    }

    pub fn linked_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.linked_conversation_id = Some(id.into());
        self
    }

    pub fn tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn elicitation_id(mut self, id: impl Into<String>) -> Self {
        self.elicitation_id = Some(id.into());
        self
    }

    pub fn attachment_payload_id(mut self, id: impl Into<String>) -> Self {
        self.attachment_payload_id = Some(id.into());
        self
    }

    pub fn elicitation_payload_id(mut self, id: impl Into<String>) -> Self {
        self.elicitation_payload_id = Some(id.into());
        self
    }

    pub fn embedding_index(mut self, blob: Vec<u8>) -> Self {
        self.embedding_index = Some(blob);
        self
    }

    fn into_message(self, turn: &TurnRef) -> Message {
        Message {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            conversation_id: turn.conversation_id.clone(),
            turn_id: Some(turn.turn_id.clone()),
            sequence: self.sequence,
            parent_message_id: self.parent_message_id.or_else(|| turn.parent_message_id.clone()),
            superseded_by: None,
            role: self.role,
            message_type: self.message_type,
            content: self.content.unwrap_or_default(),
            raw_content: self.raw_content,
            interim: self.interim.unwrap_or(false),
            archived: None,
            status: self.status.unwrap_or_default(),
            mode: self.mode,
            created_by: self.created_by,
            linked_conversation_id: self.linked_conversation_id,
            tool_name: self.tool_name,
            elicitation_id: self.elicitation_id,
            attachment_payload_id: self.attachment_payload_id,
            elicitation_payload_id: self.elicitation_payload_id,
            summary: None,
            embedding_index: self.embedding_index,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Patch applied when the caller-supplied id already exists. Only
    /// fields set on the draft are written.
    fn into_patch(self, id: &str) -> MessagePatch {
        MessagePatch {
            id: id.to_owned(),
            sequence: self.sequence,
            content: self.content,
            raw_content: self.raw_content,
            status: self.status,
            interim: self.interim,
            archived: None,
            summary: None,
            superseded_by: None,
            linked_conversation_id: self.linked_conversation_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation status rule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Status the parent conversation should take after `message` is written.
///
/// A final (non-interim) assistant reply that is not a compaction summary
/// means the conversation is no longer waiting on the assistant.
pub fn conversation_status_patch(message: &Message) -> Option<&'static str> {
    if message.role == Role::Assistant && !message.interim && !message.is_summary() {
        Some(CONVERSATION_STATUS_ACTIVE)
    } else {
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content paging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A `[offset, offset + length)` byte window over a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: usize,
    pub length: usize,
}

/// One page of a message body. When `has_more` is set, `next` is the
/// range to request next; readers never restart from offset 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPage {
    pub message_id: String,
    pub text: String,
    pub range: ByteRange,
    pub total_bytes: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<ByteRange>,
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Slice `body` into a page. Offsets are snapped to UTF-8 boundaries.
pub fn page_content(message_id: &str, body: &str, offset: usize, length: usize) -> Result<ContentPage> {
    if length == 0 {
        return Err(Error::InvalidInput("page length must be positive".into()));
    }
    if offset > body.len() {
        return Err(Error::InvalidInput(format!(
            "offset {offset} beyond content length {}",
            body.len()
        )));
    }

    let start = floor_boundary(body, offset);
    let mut end = floor_boundary(body, start.saturating_add(length));
    if end == start && start < body.len() {
        // Window narrower than one character: return the whole character.
        end = ceil_boundary(body, start + 1);
    }

    let has_more = end < body.len();
    Ok(ContentPage {
        message_id: message_id.to_owned(),
        text: body[start..end].to_owned(),
        range: ByteRange {
            offset: start,
            length: end - start,
        },
        total_bytes: body.len(),
        has_more,
        next: has_more.then_some(ByteRange {
            offset: end,
            length,
        }),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MessageStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MessageStore {
    storage: Arc<dyn Storage>,
    sequences: Arc<SequenceAllocator>,
    config: SequenceConfig,
}

impl MessageStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        sequences: Arc<SequenceAllocator>,
        config: SequenceConfig,
    ) -> Self {
        Self {
            storage,
            sequences,
            config,
        }
    }

    /// Add a message to `turn`.
    ///
    /// A caller-supplied id that already exists turns this into an update
    /// of that row, touching only the fields set on `draft`. Fails with
    /// `InvalidInput` when `turn` is missing or incomplete, or when the
    /// existing row belongs to another turn or conversation.
    pub async fn add_message(
        &self,
        cancel: &CancellationToken,
        turn: Option<&TurnRef>,
        draft: NewMessage,
    ) -> Result<Message> {
        let turn = turn.ok_or_else(|| Error::InvalidInput("add_message: turn is required".into()))?;
        if turn.turn_id.is_empty() || turn.conversation_id.is_empty() {
            return Err(Error::InvalidInput(
                "add_message: turn reference needs conversation and turn ids".into(),
            ));
        }

        if let Some(id) = draft.id.clone() {
            let existing = cancellable(cancel, "add_message", async {
                self.storage
                    .get_message(&id)
                    .await
                    .map_err(|e| Error::storage(format!("loading message {id}"), e))
            })
            .await?;
            if let Some(mut existing) = existing {
                if existing.conversation_id != turn.conversation_id
                    || existing.turn_id.as_deref() != Some(turn.turn_id.as_str())
                {
                    return Err(Error::InvalidInput(format!(
                        "add_message: message {} is not part of conversation {} turn {}",
                        existing.describe(),
                        turn.conversation_id,
                        turn.turn_id
                    )));
                }
                let patch = draft.into_patch(&existing.id);
                cancellable(cancel, "add_message", async {
                    self.storage.update_message(&patch).await.map_err(|e| {
                        Error::storage(format!("updating message {}", existing.describe()), e)
                    })
                })
                .await?;
                patch.apply(&mut existing);
                self.apply_conversation_status(&existing).await?;
                return Ok(existing);
            }
        }

        let mut message = draft.into_message(turn);
        let attempts = self.insert_with_retry(cancel, &mut message).await?;

        TraceEvent::MessageAdded {
            conversation_id: message.conversation_id.clone(),
            turn_id: message.turn_id.clone(),
            message_id: message.id.clone(),
            role: message.role.to_string(),
            sequence: message.sequence,
            attempts,
        }
        .emit();

        self.apply_conversation_status(&message).await?;
        Ok(message)
    }

    /// Insert `message`, allocating and retrying its sequence as needed.
    /// Returns the number of attempts used.
    async fn insert_with_retry(&self, cancel: &CancellationToken, message: &mut Message) -> Result<u32> {
        let turn_id = message
            .turn_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("message has no turn".into()))?;
        let explicit = message.sequence.is_some();
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            if message.sequence.is_none() {
                message.sequence = Some(self.sequences.next(&turn_id).await?);
            }

            let result = cancellable(cancel, "add_message", async {
                self.storage.insert_message(message).await.map_err(|e| {
                    Error::storage(format!("inserting message {}", message.describe()), e)
                })
            })
            .await;

            match result {
                Ok(()) => {
                    if explicit {
                        if let Some(seq) = message.sequence {
                            self.sequences.observe(&turn_id, seq);
                        }
                    }
                    return Ok(attempt + 1);
                }
                Err(e) if e.is_sequence_conflict() && !explicit && attempt + 1 < max_attempts => {
                    let seq = message.sequence.unwrap_or_default();
                    tracing::debug!(
                        turn_id = %turn_id,
                        message_id = %message.id,
                        sequence = seq,
                        attempt,
                        "sequence conflict, reallocating"
                    );
                    TraceEvent::SequenceConflict {
                        turn_id: turn_id.clone(),
                        message_id: message.id.clone(),
                        sequence: seq,
                        attempt,
                    }
                    .emit();
                    message.sequence = None;
                    backoff(cancel, "add_message", self.config.delay_for_attempt(attempt)).await?;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_sequence_conflict() {
                        tracing::warn!(
                            turn_id = %turn_id,
                            message_id = %message.id,
                            explicit,
                            attempts = attempt + 1,
                            "sequence conflict not recoverable"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn apply_conversation_status(&self, message: &Message) -> Result<()> {
        let Some(status) = conversation_status_patch(message) else {
            return Ok(());
        };
        let mut patch = ConversationPatch::new(&message.conversation_id);
        patch.status = Some(status.to_owned());
        self.storage.update_conversation(&patch).await.map_err(|e| {
            Error::storage(
                format!(
                    "resetting status of conversation {} after message {}",
                    message.conversation_id, message.id
                ),
                e,
            )
        })
    }

    /// Update-only path: status, content, archived, summary mutations.
    /// Never allocates a sequence.
    pub async fn patch_message(&self, patch: &MessagePatch) -> Result<()> {
        if patch.id.is_empty() {
            return Err(Error::InvalidInput("patch_message: id is required".into()));
        }
        self.storage
            .update_message(patch)
            .await
            .map_err(|e| Error::storage(format!("patching message {}", patch.id), e))
    }

    pub async fn get_message(&self, id: &str) -> Result<Message> {
        self.storage
            .get_message(id)
            .await
            .map_err(|e| Error::storage(format!("loading message {id}"), e))?
            .ok_or_else(|| Error::NotFound {
                kind: "message",
                id: id.to_owned(),
            })
    }

    /// Read a byte window of a message body.
    pub async fn read_content(&self, message_id: &str, offset: usize, length: usize) -> Result<ContentPage> {
        let message = self.get_message(message_id).await?;
        page_content(&message.id, message.body(), offset, length)
    }
}

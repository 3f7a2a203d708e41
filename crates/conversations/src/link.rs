//! Linked child conversations for delegated work.
//!
//! A child is tied to its parent turn through `parent_conversation_id` /
//! `parent_turn_id` on the child, and made visible from the parent
//! transcript by one interim link message carrying
//! `linked_conversation_id`. Transcript cloning is best effort: rows
//! cloned before a failure stay in place.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cs_domain::config::LinkingConfig;
use cs_domain::error::{Error, Result};
use cs_domain::model::{
    Message, Role, TurnRef, TurnStatus, Visibility, MESSAGE_MODE_CHAIN, MESSAGE_STATUS_SUMMARY,
};
use cs_domain::trace::TraceEvent;

use crate::conversation::{Conversations, NewConversation};
use crate::lifecycle::{NewTurn, TurnManager};
use crate::messages::{MessageStore, NewMessage};
use crate::transcript::Transcript;

#[derive(Debug, Clone, Default)]
pub struct LinkRequest {
    /// Copy the last turn of `transcript` into the child.
    pub clone_transcript: bool,
    pub transcript: Option<Transcript>,
    /// Falls back to the configured default visibility.
    pub visibility: Option<Visibility>,
}

/// A link message posted into the parent turn. Unset fields take the
/// configured defaults (`assistant`, link actor, link mode).
#[derive(Debug, Clone, Default)]
pub struct LinkMessage {
    pub child_conversation_id: String,
    pub role: Option<Role>,
    pub actor: Option<String>,
    pub mode: Option<String>,
    pub content: String,
}

/// Status a cloned message carries: summaries stay summaries, everything
/// else starts clean in the child.
fn normalize_status(status: &str) -> &'static str {
    if status == MESSAGE_STATUS_SUMMARY {
        MESSAGE_STATUS_SUMMARY
    } else {
        ""
    }
}

fn clone_draft(source: &Message) -> NewMessage {
    let mut draft = NewMessage::new(source.role)
        .message_type(source.message_type)
        .content(source.content.clone())
        .status(normalize_status(&source.status))
        .interim(source.interim);
    if let Some(raw) = &source.raw_content {
        draft = draft.raw_content(raw.clone());
    }
    if let Some(mode) = &source.mode {
        draft = draft.mode(mode.clone());
    }
    if let Some(actor) = &source.created_by {
        draft = draft.created_by(actor.clone());
    }
    if let Some(tool) = &source.tool_name {
        draft = draft.tool_name(tool.clone());
    }
    if let Some(id) = &source.elicitation_id {
        draft = draft.elicitation_id(id.clone());
    }
    if let Some(id) = &source.attachment_payload_id {
        draft = draft.attachment_payload_id(id.clone());
    }
    if let Some(id) = &source.elicitation_payload_id {
        draft = draft.elicitation_payload_id(id.clone());
    }
    if let Some(linked) = &source.linked_conversation_id {
        draft = draft.linked_conversation_id(linked.clone());
    }
    draft
}

pub struct Linker {
    conversations: Arc<Conversations>,
    turns: Arc<TurnManager>,
    messages: Arc<MessageStore>,
    config: LinkingConfig,
}

impl Linker {
    pub fn new(
        conversations: Arc<Conversations>,
        turns: Arc<TurnManager>,
        messages: Arc<MessageStore>,
        config: LinkingConfig,
    ) -> Self {
        Self {
            conversations,
            turns,
            messages,
            config,
        }
    }

    /// Create a child conversation under `parent` and return its id.
    ///
    /// Each call allocates a fresh child id, so retrying after a failed
    /// clone is safe.
    pub async fn create_linked_conversation(
        &self,
        cancel: &CancellationToken,
        parent: &TurnRef,
        req: LinkRequest,
    ) -> Result<String> {
        if parent.conversation_id.is_empty() || parent.turn_id.is_empty() {
            return Err(Error::InvalidInput(
                "create_linked_conversation: parent turn needs conversation and turn ids".into(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("create_linked_conversation".into()));
        }

        let default_model = self
            .conversations
            .get(&parent.conversation_id)
            .await?
            .default_model;

        let child = self
            .conversations
            .create(NewConversation {
                id: None,
                parent_conversation_id: Some(parent.conversation_id.clone()),
                parent_turn_id: Some(parent.turn_id.clone()),
                visibility: req.visibility.unwrap_or(self.config.default_visibility),
                default_model,
            })
            .await
            .map_err(|e| match e {
                Error::Storage { context, source } => Error::storage(
                    format!("creating child of turn {}: {context}", parent.turn_id),
                    source,
                ),
                other => other,
            })?;

        TraceEvent::ConversationLinked {
            parent_conversation_id: parent.conversation_id.clone(),
            parent_turn_id: parent.turn_id.clone(),
            child_conversation_id: child.id.clone(),
        }
        .emit();

        if req.clone_transcript {
            match &req.transcript {
                Some(transcript) => self.clone_last_turn(cancel, &child.id, transcript).await?,
                None => tracing::debug!(
                    child_conversation_id = %child.id,
                    "clone requested without a transcript, child starts empty"
                ),
            }
        }

        Ok(child.id)
    }

    async fn clone_last_turn(
        &self,
        cancel: &CancellationToken,
        child_id: &str,
        transcript: &Transcript,
    ) -> Result<()> {
        let child_turn = self.turns.create_turn(child_id, NewTurn::default()).await?;
        self.turns
            .set_status(&child_turn.id, TurnStatus::Running, None)
            .await?;
        let target = TurnRef::new(child_id, &child_turn.id);

        let Some(last) = transcript.last_turn() else {
            return Ok(());
        };

        let mut cloned = 0;
        for view in &last.messages {
            let source = &view.message;
            if source.mode.as_deref() == Some(MESSAGE_MODE_CHAIN) {
                continue;
            }
            self.messages
                .add_message(cancel, Some(&target), clone_draft(source))
                .await
                .map_err(|e| match e {
                    Error::Storage { context, source: cause } => Error::storage(
                        format!("cloning message {} into {child_id}: {context}", source.describe()),
                        cause,
                    ),
                    Error::Cancelled(what) => Error::Cancelled(format!(
                        "{what} while cloning message {}",
                        source.describe()
                    )),
                    other => other,
                })?;
            cloned += 1;
        }

        TraceEvent::TranscriptCloned {
            child_conversation_id: child_id.to_owned(),
            child_turn_id: child_turn.id,
            messages: cloned,
        }
        .emit();
        Ok(())
    }

    /// Post the interim link message into the parent turn.
    pub async fn add_link_message(
        &self,
        cancel: &CancellationToken,
        parent: &TurnRef,
        link: LinkMessage,
    ) -> Result<Message> {
        if link.child_conversation_id.is_empty() {
            return Err(Error::InvalidInput(
                "add_link_message: child conversation id is required".into(),
            ));
        }
        let draft = NewMessage::new(link.role.unwrap_or(Role::Assistant))
            .content(link.content)
            .interim(true)
            .created_by(link.actor.unwrap_or_else(|| self.config.link_actor.clone()))
            .mode(link.mode.unwrap_or_else(|| self.config.link_mode.clone()))
            .linked_conversation_id(link.child_conversation_id);
        self.messages.add_message(cancel, Some(parent), draft).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_domain::config::SequenceConfig;
    use cs_domain::error::StorageError;

    use crate::sequence::SequenceAllocator;
    use crate::storage::{MemoryStorage, Storage};
    use crate::transcript::{load_transcript, TranscriptQuery};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        linker: Linker,
        messages: Arc<MessageStore>,
        parent: TurnRef,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let dyn_storage: Arc<dyn Storage> = storage.clone();
        let sequences = Arc::new(SequenceAllocator::new(dyn_storage.clone()));
        let conversations = Arc::new(Conversations::new(dyn_storage.clone()));
        let turns = Arc::new(TurnManager::new(dyn_storage.clone(), sequences.clone()));
        let messages = Arc::new(MessageStore::new(dyn_storage, sequences, SequenceConfig::default()));

        conversations
            .create(NewConversation {
                id: Some("parent".into()),
                default_model: Some("m-small".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let turn = turns.create_turn("parent", NewTurn::default()).await.unwrap();

        Fixture {
            linker: Linker::new(conversations, turns, messages.clone(), LinkingConfig::default()),
            storage,
            messages,
            parent: turn.turn_ref(),
            cancel: CancellationToken::new(),
        }
    }

    async fn parent_transcript(fx: &Fixture) -> Transcript {
        load_transcript(fx.storage.as_ref(), "parent", &TranscriptQuery::full())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn child_inherits_parent_links_and_model() {
        let fx = fixture().await;
        let child_id = fx
            .linker
            .create_linked_conversation(&fx.cancel, &fx.parent, LinkRequest::default())
            .await
            .unwrap();
        let child = fx.storage.get_conversation(&child_id).await.unwrap().unwrap();
        assert_eq!(child.parent_conversation_id.as_deref(), Some("parent"));
        assert_eq!(child.parent_turn_id.as_deref(), Some(fx.parent.turn_id.as_str()));
        assert_eq!(child.default_model.as_deref(), Some("m-small"));
        assert_eq!(child.visibility, Visibility::Private);
    }

    #[tokio::test]
    async fn clone_skips_chain_messages_and_normalizes_status() {
        let fx = fixture().await;
        let q = fx
            .messages
            .add_message(&fx.cancel, Some(&fx.parent), NewMessage::user("question").status("answered"))
            .await
            .unwrap();
        fx.messages
            .add_message(&fx.cancel, Some(&fx.parent), NewMessage::assistant("plan").mode("chain"))
            .await
            .unwrap();
        fx.messages
            .add_message(
                &fx.cancel,
                Some(&fx.parent),
                NewMessage::assistant("recap").status(MESSAGE_STATUS_SUMMARY),
            )
            .await
            .unwrap();

        let req = LinkRequest {
            clone_transcript: true,
            transcript: Some(parent_transcript(&fx).await),
            visibility: Some(Visibility::Public),
        };
        let child_id = fx
            .linker
            .create_linked_conversation(&fx.cancel, &fx.parent, req)
            .await
            .unwrap();

        let child = load_transcript(fx.storage.as_ref(), &child_id, &TranscriptQuery::full())
            .await
            .unwrap();
        assert_eq!(child.turns.len(), 1);
        assert_eq!(child.turns[0].turn.status, TurnStatus::Running);

        let cloned: Vec<&Message> = child.messages().map(|v| &v.message).collect();
        assert_eq!(cloned.len(), 2);
        assert_eq!(cloned[0].content, "question");
        assert_eq!(cloned[0].status, "");
        assert_ne!(cloned[0].id, q.id);
        assert_eq!(cloned[0].conversation_id, child_id);
        assert_eq!(cloned[0].sequence, Some(1));
        assert_eq!(cloned[1].status, MESSAGE_STATUS_SUMMARY);
        assert_eq!(cloned[1].sequence, Some(2));
    }

    #[tokio::test]
    async fn clone_failure_names_the_message() {
        let fx = fixture().await;
        fx.messages
            .add_message(&fx.cancel, Some(&fx.parent), NewMessage::user("first"))
            .await
            .unwrap();
        fx.messages
            .add_message(&fx.cancel, Some(&fx.parent), NewMessage::assistant("second"))
            .await
            .unwrap();
        let transcript = parent_transcript(&fx).await;

        fx.storage.set_message_fault(|m| {
            (m.conversation_id != "parent" && m.content == "second")
                .then(|| StorageError::Backend("disk full".into()))
        });
        let req = LinkRequest {
            clone_transcript: true,
            transcript: Some(transcript),
            visibility: None,
        };
        let err = fx
            .linker
            .create_linked_conversation(&fx.cancel, &fx.parent, req)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("disk full"), "{text}");
        assert!(text.contains("role=assistant"), "{text}");
        assert!(text.contains("conversation=parent"), "{text}");

        // The first clone stays: no rollback.
        assert_eq!(fx.storage.message_count(), 3);
    }

    #[tokio::test]
    async fn link_message_uses_defaults_and_is_interim() {
        let fx = fixture().await;
        let child_id = fx
            .linker
            .create_linked_conversation(&fx.cancel, &fx.parent, LinkRequest::default())
            .await
            .unwrap();
        let msg = fx
            .linker
            .add_link_message(
                &fx.cancel,
                &fx.parent,
                LinkMessage {
                    child_conversation_id: child_id.clone(),
                    content: "delegated to researcher".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.interim);
        assert_eq!(msg.created_by.as_deref(), Some("link"));
        assert_eq!(msg.mode.as_deref(), Some("link"));
        assert_eq!(msg.linked_conversation_id.as_deref(), Some(child_id.as_str()));
        assert_eq!(msg.turn_id.as_deref(), Some(fx.parent.turn_id.as_str()));
    }

    #[tokio::test]
    async fn link_message_requires_child() {
        let fx = fixture().await;
        let err = fx
            .linker
            .add_link_message(&fx.cancel, &fx.parent, LinkMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

//! Conversation registry: creation, status, usage counters.

use std::sync::Arc;

use cs_domain::error::{Error, Result};
use cs_domain::model::{Conversation, ConversationPatch, Usage, Visibility};

use crate::storage::Storage;

/// Options for a new root or child conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub id: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub parent_turn_id: Option<String>,
    pub visibility: Visibility,
    pub default_model: Option<String>,
}

pub struct Conversations {
    storage: Arc<dyn Storage>,
}

impl Conversations {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn create(&self, opts: NewConversation) -> Result<Conversation> {
        let mut conv = Conversation::new(
            opts.id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        conv.parent_conversation_id = opts.parent_conversation_id;
        conv.parent_turn_id = opts.parent_turn_id;
        conv.visibility = opts.visibility;
        conv.default_model = opts.default_model;

        self.storage
            .insert_conversation(&conv)
            .await
            .map_err(|e| Error::storage(format!("inserting conversation {}", conv.id), e))?;
        tracing::debug!(
            conversation_id = %conv.id,
            parent = ?conv.parent_conversation_id,
            "conversation created"
        );
        Ok(conv)
    }

    pub async fn get(&self, id: &str) -> Result<Conversation> {
        self.storage
            .get_conversation(id)
            .await
            .map_err(|e| Error::storage(format!("loading conversation {id}"), e))?
            .ok_or_else(|| Error::NotFound {
                kind: "conversation",
                id: id.to_owned(),
            })
    }

    pub async fn set_status(&self, id: &str, status: &str) -> Result<()> {
        let mut patch = ConversationPatch::new(id);
        patch.status = Some(status.to_owned());
        self.storage
            .update_conversation(&patch)
            .await
            .map_err(|e| Error::storage(format!("setting status {status:?} on conversation {id}"), e))
    }

    /// Add `delta` to the conversation's usage counters. Returns the new
    /// totals.
    pub async fn record_usage(&self, id: &str, delta: Usage) -> Result<Usage> {
        let conv = self.get(id).await?;
        let usage = Usage {
            input_tokens: conv.usage.input_tokens.saturating_add(delta.input_tokens),
            output_tokens: conv.usage.output_tokens.saturating_add(delta.output_tokens),
            total_tokens: conv.usage.total_tokens.saturating_add(delta.total_tokens),
        };
        let mut patch = ConversationPatch::new(id);
        patch.usage = Some(usage);
        self.storage
            .update_conversation(&patch)
            .await
            .map_err(|e| Error::storage(format!("recording usage on conversation {id}"), e))?;
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn registry() -> Conversations {
        Conversations::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn create_then_get() {
        let convs = registry();
        let created = convs
            .create(NewConversation {
                default_model: Some("m1".into()),
                visibility: Visibility::Public,
                ..Default::default()
            })
            .await
            .unwrap();
        let loaded = convs.get(&created.id).await.unwrap();
        assert_eq!(loaded.default_model.as_deref(), Some("m1"));
        assert_eq!(loaded.visibility, Visibility::Public);
        assert_eq!(loaded.status, "");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let convs = registry();
        let opts = NewConversation {
            id: Some("c1".into()),
            ..Default::default()
        };
        convs.create(opts.clone()).await.unwrap();
        let err = convs.create(opts).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(!err.is_sequence_conflict());
    }

    #[tokio::test]
    async fn missing_is_not_found() {
        let err = registry().get("ghost").await.unwrap_err();
        assert_eq!(err.to_string(), "conversation not found: ghost");
    }

    #[tokio::test]
    async fn usage_accumulates() {
        let convs = registry();
        let conv = convs.create(NewConversation::default()).await.unwrap();
        let delta = Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        };
        convs.record_usage(&conv.id, delta).await.unwrap();
        let total = convs.record_usage(&conv.id, delta).await.unwrap();
        assert_eq!(total.total_tokens, 30);
        assert_eq!(convs.get(&conv.id).await.unwrap().usage.input_tokens, 20);
    }
}

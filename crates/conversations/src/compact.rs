//! Token-budget compaction.
//!
//! Archives the fewest messages needed to bring a conversation's active
//! token estimate under a budget. Each archived message is replaced by a
//! short `status = "summary"` preview anchored to the most recent turn,
//! and the original is flagged `archived` with the same preview in its
//! `summary` field.
//!
//! Never archived: interim messages, elicitation request/response
//! messages, the most recent non-interim user message, messages that are
//! already archived, and existing summaries. None of those count toward
//! the total either.
//!
//! Archive and summary insert are separate single-row writes. A failure
//! part way leaves the earlier pairs in place; rerunning is safe because
//! archived rows are skipped.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use cs_domain::config::{CompactionConfig, CompactionStrategy};
use cs_domain::error::{Error, Result};
use cs_domain::model::{
    ConversationPatch, MessagePatch, MessageType, Role, TurnRef, CONVERSATION_STATUS_COMPACTED,
    CONVERSATION_STATUS_COMPACTING, MESSAGE_STATUS_SUMMARY,
};
use cs_domain::trace::TraceEvent;

use crate::cancel::cancellable;
use crate::messages::{MessageStore, NewMessage};
use crate::storage::Storage;
use crate::summarizer::{self, Summarizer};
use crate::transcript::{load_transcript, MessageView, TranscriptQuery};

#[derive(Debug, Clone)]
pub struct CompactRequest {
    pub conversation_id: String,
    pub max_tokens: usize,
    /// Falls back to the configured default strategy.
    pub strategy: Option<CompactionStrategy>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactOutcome {
    pub removed_count: usize,
    pub freed_tokens: usize,
    pub kept_tokens: usize,
    pub archived_ids: Vec<String>,
    pub summary_ids: Vec<String>,
}

/// Cheap size estimate: four bytes per token, at least one.
pub fn estimate_tokens(body: &str) -> usize {
    (body.len() / 4).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Tool,
    Other,
}

fn kind_of(view: &MessageView) -> Kind {
    let msg = &view.message;
    if msg.role == Role::Tool || msg.message_type == MessageType::ToolOp {
        Kind::Tool
    } else if matches!(msg.role, Role::User | Role::Assistant) && msg.message_type == MessageType::Text {
        Kind::Text
    } else {
        Kind::Other
    }
}

fn rank(strategy: CompactionStrategy, kind: Kind) -> u8 {
    match (strategy, kind) {
        (CompactionStrategy::OldestFirst, _) => 0,
        (_, Kind::Other) => 1,
        (CompactionStrategy::TextFirst, Kind::Text) | (CompactionStrategy::ToolFirst, Kind::Tool) => 0,
        _ => 2,
    }
}

/// Deterministic preview kept in place of an archived message.
pub(crate) fn preview(view: &MessageView, max_chars: usize) -> String {
    let msg = &view.message;
    let text = match (kind_of(view), msg.tool_name.as_deref()) {
        (Kind::Tool, Some(name)) => {
            let args = view
                .tool_call
                .as_ref()
                .map(|c| c.arguments.to_string())
                .unwrap_or_else(|| msg.body().to_owned());
            format!("{name}: {args}")
        }
        _ => msg.body().to_owned(),
    };
    text.chars().take(max_chars).collect()
}

struct Candidate<'a> {
    view: &'a MessageView,
    tokens: usize,
    rank: u8,
}

pub struct Compactor {
    storage: Arc<dyn Storage>,
    messages: Arc<MessageStore>,
    config: CompactionConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl Compactor {
    pub fn new(storage: Arc<dyn Storage>, messages: Arc<MessageStore>, config: CompactionConfig) -> Self {
        Self {
            storage,
            messages,
            config,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub async fn compact(&self, cancel: &CancellationToken, req: &CompactRequest) -> Result<CompactOutcome> {
        if req.conversation_id.is_empty() {
            return Err(Error::InvalidInput("compact: conversation id is required".into()));
        }
        let strategy = req.strategy.unwrap_or(self.config.default_strategy);

        let conv = cancellable(cancel, "compact", async {
            self.storage
                .get_conversation(&req.conversation_id)
                .await
                .map_err(|e| Error::storage(format!("loading conversation {}", req.conversation_id), e))
        })
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "conversation",
            id: req.conversation_id.clone(),
        })?;

        let transcript = cancellable(
            cancel,
            "compact",
            load_transcript(self.storage.as_ref(), &conv.id, &TranscriptQuery::full()),
        )
        .await?;

        let last_user = transcript
            .messages()
            .filter(|v| v.message.role == Role::User && !v.message.interim)
            .last()
            .map(|v| v.message.id.clone());

        let mut candidates: Vec<Candidate<'_>> = transcript
            .messages()
            .filter(|v| {
                let m = &v.message;
                !m.interim
                    && !m.message_type.is_elicitation()
                    && !m.is_archived()
                    && !m.is_summary()
                    && last_user.as_deref() != Some(m.id.as_str())
            })
            .map(|v| Candidate {
                view: v,
                tokens: estimate_tokens(v.message.body()),
                rank: rank(strategy, kind_of(v)),
            })
            .collect();

        let total: usize = candidates.iter().map(|c| c.tokens).sum();
        if total <= req.max_tokens {
            tracing::debug!(
                conversation_id = %conv.id,
                total,
                budget = req.max_tokens,
                "within budget, nothing to compact"
            );
            return Ok(CompactOutcome {
                kept_tokens: total,
                ..Default::default()
            });
        }

        // Stable: chronological order survives inside each rank.
        candidates.sort_by_key(|c| c.rank);

        let mut needed = total - req.max_tokens;
        let mut selected = Vec::new();
        for c in &candidates {
            if needed == 0 {
                break;
            }
            needed = needed.saturating_sub(c.tokens);
            selected.push(c);
        }

        let anchor_turn = conv
            .last_turn_id
            .clone()
            .or_else(|| transcript.last_turn().map(|t| t.turn.id.clone()))
            .ok_or_else(|| Error::InvalidInput(format!("conversation {} has no turn to anchor summaries", conv.id)))?;
        let anchor = TurnRef::new(&conv.id, anchor_turn);

        self.set_conversation_status(&conv.id, CONVERSATION_STATUS_COMPACTING).await?;

        let archived = self.archive(cancel, &anchor, &selected).await;
        let mut outcome = match archived {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(restore) = self.set_conversation_status(&conv.id, &conv.status).await {
                    tracing::warn!(
                        conversation_id = %conv.id,
                        error = %restore,
                        "failed to restore status after aborted compaction"
                    );
                }
                return Err(e);
            }
        };

        if self.config.llm_summary {
            if let Some(id) = self.llm_summary(cancel, &anchor, &selected).await {
                outcome.summary_ids.push(id);
            }
        }

        self.set_conversation_status(&conv.id, CONVERSATION_STATUS_COMPACTED).await?;

        outcome.kept_tokens = total - outcome.freed_tokens;
        TraceEvent::CompactionCompleted {
            conversation_id: conv.id.clone(),
            strategy: strategy.to_string(),
            removed: outcome.removed_count,
            freed_tokens: outcome.freed_tokens,
            kept_tokens: outcome.kept_tokens,
        }
        .emit();
        Ok(outcome)
    }

    async fn archive(
        &self,
        cancel: &CancellationToken,
        anchor: &TurnRef,
        selected: &[&Candidate<'_>],
    ) -> Result<CompactOutcome> {
        let mut outcome = CompactOutcome::default();
        for c in selected {
            let original = &c.view.message;
            let text = preview(c.view, self.config.preview_chars);

            let summary = self
                .messages
                .add_message(
                    cancel,
                    Some(anchor),
                    NewMessage::assistant(text.clone())
                        .status(MESSAGE_STATUS_SUMMARY)
                        .parent_message_id(&original.id),
                )
                .await?;

            let mut patch = MessagePatch::new(&original.id);
            patch.archived = Some(true);
            patch.summary = Some(text);
            patch.superseded_by = Some(summary.id.clone());
            self.messages.patch_message(&patch).await.map_err(|e| match e {
                Error::Storage { context, source } => Error::storage(
                    format!("archiving {}: {context}", original.describe()),
                    source,
                ),
                other => other,
            })?;

            outcome.removed_count += 1;
            outcome.freed_tokens += c.tokens;
            outcome.archived_ids.push(original.id.clone());
            outcome.summary_ids.push(summary.id);
        }
        Ok(outcome)
    }

    /// One extra summary of everything archived. Failures are logged and
    /// do not fail the compaction.
    async fn llm_summary(
        &self,
        cancel: &CancellationToken,
        anchor: &TurnRef,
        selected: &[&Candidate<'_>],
    ) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        let text = summarizer::conversation_text(selected.iter().map(|c| &c.view.message));
        let prompt = summarizer::system_prompt(self.config.summary_max_tokens);

        let generated = cancellable(cancel, "compact summary", summarizer.generate(&prompt, &text)).await;
        let content = match generated {
            Ok(content) if !content.trim().is_empty() => content,
            Ok(_) => {
                tracing::warn!(conversation_id = %anchor.conversation_id, "summarizer returned empty text");
                return None;
            }
            Err(e) => {
                tracing::warn!(conversation_id = %anchor.conversation_id, error = %e, "summarizer failed");
                return None;
            }
        };

        match self
            .messages
            .add_message(
                cancel,
                Some(anchor),
                NewMessage::assistant(content).status(MESSAGE_STATUS_SUMMARY),
            )
            .await
        {
            Ok(msg) => Some(msg.id),
            Err(e) => {
                tracing::warn!(conversation_id = %anchor.conversation_id, error = %e, "storing llm summary failed");
                None
            }
        }
    }

    async fn set_conversation_status(&self, conversation_id: &str, status: &str) -> Result<()> {
        let mut patch = ConversationPatch::new(conversation_id);
        patch.status = Some(status.to_owned());
        self.storage.update_conversation(&patch).await.map_err(|e| {
            Error::storage(
                format!("setting status {status:?} on conversation {conversation_id}"),
                e,
            )
        })
    }
}

//! Transcript queries: a conversation as ordered turns of ordered messages.

use std::collections::HashMap;

use serde::Serialize;

use cs_domain::error::{Error, Result};
use cs_domain::model::{Message, ModelCall, ToolCall, Turn};

use crate::storage::Storage;

/// Filters for [`load_transcript`]. The default view is the durable one:
/// no interim or archived messages, no satellite detail.
#[derive(Debug, Clone, Default)]
pub struct TranscriptQuery {
    /// Start at this message (inclusive); earlier turns and messages are
    /// dropped.
    pub since_message_id: Option<String>,
    pub include_tool_calls: bool,
    pub include_model_calls: bool,
    pub include_interim: bool,
    pub include_archived: bool,
}

impl TranscriptQuery {
    /// Everything, including interim/archived rows and satellite records.
    pub fn full() -> Self {
        Self {
            since_message_id: None,
            include_tool_calls: true,
            include_model_calls: true,
            include_interim: true,
            include_archived: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_call: Option<ModelCall>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnView {
    #[serde(flatten)]
    pub turn: Turn,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    pub conversation_id: String,
    pub turns: Vec<TurnView>,
}

impl Transcript {
    pub fn last_turn(&self) -> Option<&TurnView> {
        self.turns.last()
    }

    pub fn turn(&self, turn_id: &str) -> Option<&TurnView> {
        self.turns.iter().find(|t| t.turn.id == turn_id)
    }

    /// All messages in transcript order.
    pub fn messages(&self) -> impl Iterator<Item = &MessageView> {
        self.turns.iter().flat_map(|t| t.messages.iter())
    }
}

/// Load the transcript of `conversation_id`.
///
/// Turns are ordered by `(created_at, queue_seq, id)`; messages within a
/// turn by `(sequence, created_at)`. `sequence` follows allocation order
/// and can disagree with `created_at` by one slot after a conflict retry.
pub async fn load_transcript(
    storage: &dyn Storage,
    conversation_id: &str,
    query: &TranscriptQuery,
) -> Result<Transcript> {
    let mut turns = storage
        .list_turns(conversation_id)
        .await
        .map_err(|e| Error::storage(format!("listing turns of conversation {conversation_id}"), e))?;
    turns.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.queue_seq.cmp(&b.queue_seq))
            .then_with(|| a.id.cmp(&b.id))
    });

    let messages = storage
        .list_messages(conversation_id)
        .await
        .map_err(|e| {
            Error::storage(format!("listing messages of conversation {conversation_id}"), e)
        })?;

    let mut by_turn: HashMap<String, Vec<Message>> = HashMap::new();
    for msg in messages {
        match &msg.turn_id {
            Some(turn_id) => by_turn.entry(turn_id.clone()).or_default().push(msg),
            None => tracing::debug!(message_id = %msg.id, "message without turn left out of transcript"),
        }
    }
    for msgs in by_turn.values_mut() {
        msgs.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then(a.created_at.cmp(&b.created_at))
        });
    }

    // Locate the starting point before filtering so `since` can point at
    // an interim or archived message too.
    let mut start: Option<(usize, usize)> = None;
    if let Some(since) = &query.since_message_id {
        start = turns.iter().enumerate().find_map(|(ti, turn)| {
            by_turn
                .get(&turn.id)
                .and_then(|msgs| msgs.iter().position(|m| &m.id == since))
                .map(|mi| (ti, mi))
        });
        if start.is_none() {
            return Err(Error::NotFound {
                kind: "message",
                id: since.clone(),
            });
        }
    }

    let mut views = Vec::with_capacity(turns.len());
    for (ti, turn) in turns.into_iter().enumerate() {
        let skip = match start {
            Some((start_turn, _)) if ti < start_turn => continue,
            Some((start_turn, start_msg)) if ti == start_turn => start_msg,
            _ => 0,
        };

        let mut messages = Vec::new();
        for msg in by_turn.remove(&turn.id).unwrap_or_default().into_iter().skip(skip) {
            if msg.interim && !query.include_interim {
                continue;
            }
            if msg.is_archived() && !query.include_archived {
                continue;
            }
            let tool_call = if query.include_tool_calls {
                storage
                    .get_tool_call(&msg.id)
                    .await
                    .map_err(|e| Error::storage(format!("loading tool call of message {}", msg.id), e))?
            } else {
                None
            };
            let model_call = if query.include_model_calls {
                storage
                    .get_model_call(&msg.id)
                    .await
                    .map_err(|e| Error::storage(format!("loading model call of message {}", msg.id), e))?
            } else {
                None
            };
            messages.push(MessageView {
                message: msg,
                tool_call,
                model_call,
            });
        }
        views.push(TurnView { turn, messages });
    }

    Ok(Transcript {
        conversation_id: conversation_id.to_owned(),
        turns: views,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use cs_domain::model::{TurnStatus, Conversation};

    use crate::storage::tests::message;
    use crate::storage::MemoryStorage;

    fn turn(id: &str, offset_secs: i64) -> Turn {
        let at = Utc::now() + Duration::seconds(offset_secs);
        Turn {
            id: id.into(),
            conversation_id: "c1".into(),
            created_at: at,
            queue_seq: None,
            status: TurnStatus::Running,
            error_message: None,
            retry_of: None,
            agent_id_override: None,
            model_override: None,
            starting_message_id: None,
            updated_at: at,
        }
    }

    async fn seeded() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.insert_conversation(&Conversation::new("c1")).await.unwrap();
        // Inserted out of order on purpose.
        storage.insert_turn(&turn("t2", 10)).await.unwrap();
        storage.insert_turn(&turn("t1", 0)).await.unwrap();

        storage.insert_message(&message("b", "t1", Some(2))).await.unwrap();
        storage.insert_message(&message("a", "t1", Some(1))).await.unwrap();
        let mut interim = message("i", "t1", Some(3));
        interim.interim = true;
        storage.insert_message(&interim).await.unwrap();
        let mut archived = message("x", "t2", Some(1));
        archived.archived = Some(true);
        storage.insert_message(&archived).await.unwrap();
        storage.insert_message(&message("y", "t2", Some(2))).await.unwrap();
        storage
            .upsert_tool_call(&ToolCall {
                message_id: "y".into(),
                tool_name: "grep".into(),
                status: "ok".into(),
                arguments: serde_json::json!({"q": "x"}),
                response_payload_id: None,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .await
            .unwrap();
        storage
    }

    fn ids(t: &Transcript) -> Vec<&str> {
        t.messages().map(|m| m.message.id.as_str()).collect()
    }

    #[tokio::test]
    async fn default_view_is_ordered_and_durable() {
        let storage = seeded().await;
        let t = load_transcript(&storage, "c1", &TranscriptQuery::default()).await.unwrap();
        assert_eq!(t.turns.len(), 2);
        assert_eq!(t.turns[0].turn.id, "t1");
        assert_eq!(ids(&t), vec!["a", "b", "y"]);
        assert!(t.messages().all(|m| m.tool_call.is_none()));
        assert_eq!(t.last_turn().unwrap().turn.id, "t2");
    }

    #[tokio::test]
    async fn full_view_includes_everything() {
        let storage = seeded().await;
        let t = load_transcript(&storage, "c1", &TranscriptQuery::full()).await.unwrap();
        assert_eq!(ids(&t), vec!["a", "b", "i", "x", "y"]);
        let y = t.turn("t2").unwrap().messages.last().unwrap();
        assert_eq!(y.tool_call.as_ref().unwrap().tool_name, "grep");
    }

    #[tokio::test]
    async fn since_message_is_inclusive() {
        let storage = seeded().await;
        let query = TranscriptQuery {
            since_message_id: Some("b".into()),
            ..TranscriptQuery::full()
        };
        let t = load_transcript(&storage, "c1", &query).await.unwrap();
        assert_eq!(ids(&t), vec!["b", "i", "x", "y"]);
    }

    #[tokio::test]
    async fn since_unknown_message_is_not_found() {
        let storage = seeded().await;
        let query = TranscriptQuery {
            since_message_id: Some("zzz".into()),
            ..Default::default()
        };
        let err = load_transcript(&storage, "c1", &query).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "message", .. }));
    }
}

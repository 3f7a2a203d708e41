//! Turn lifecycle: creation, admission order, and the status state machine.
//!
//! ```text
//! queued ─┐
//!         ├─> pending ─> running <─> waiting_for_user
//!         └──────────────┘   │              │
//!                            └──────┬───────┘
//!                                   v
//!                    succeeded | failed | canceled
//! ```
//!
//! Any non-terminal state may go straight to a terminal one. Terminal
//! states are closed: the same status again is a no-op, anything else is
//! rejected. A failed or canceled turn is retried by creating a new turn
//! with `retry_of` set.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cs_domain::error::{Error, Result};
use cs_domain::model::{ConversationPatch, Turn, TurnPatch, TurnStatus};
use cs_domain::trace::TraceEvent;

use crate::cancel::cancellable;
use crate::sequence::{CounterMap, SequenceAllocator};
use crate::storage::Storage;

/// Options for a new turn.
#[derive(Debug, Clone, Default)]
pub struct NewTurn {
    pub id: Option<String>,
    /// Assign a `queue_seq` and enter `queued` instead of `pending`.
    pub track_queue: bool,
    pub agent_id_override: Option<String>,
    pub model_override: Option<String>,
    pub starting_message_id: Option<String>,
    pub retry_of: Option<String>,
}

/// Result of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Applied { from: TurnStatus, to: TurnStatus },
    /// The turn already had the requested status; nothing was written.
    Unchanged(TurnStatus),
}

/// Whether `from -> to` is an edge of the state machine.
pub fn transition_allowed(from: TurnStatus, to: TurnStatus) -> bool {
    use TurnStatus::*;

    if from.is_terminal() {
        return false;
    }
    if to.is_terminal() {
        return true;
    }
    matches!(
        (from, to),
        (Queued, Pending)
            | (Queued, Running)
            | (Pending, Running)
            | (Running, WaitingForUser)
            | (WaitingForUser, Running)
    )
}

/// Conditional status writes lost to a concurrent writer before giving up.
const STATUS_WRITE_ATTEMPTS: u32 = 10;

pub struct TurnManager {
    storage: Arc<dyn Storage>,
    sequences: Arc<SequenceAllocator>,
    /// Per-conversation `queue_seq` counters.
    queues: CounterMap,
}

impl TurnManager {
    pub fn new(storage: Arc<dyn Storage>, sequences: Arc<SequenceAllocator>) -> Self {
        Self {
            storage,
            sequences,
            queues: CounterMap::default(),
        }
    }

    pub async fn get_turn(&self, turn_id: &str) -> Result<Turn> {
        self.storage
            .get_turn(turn_id)
            .await
            .map_err(|e| Error::storage(format!("loading turn {turn_id}"), e))?
            .ok_or_else(|| Error::NotFound {
                kind: "turn",
                id: turn_id.to_owned(),
            })
    }

    /// Open a turn in `conversation_id` and make it the conversation's
    /// last turn.
    pub async fn create_turn(&self, conversation_id: &str, opts: NewTurn) -> Result<Turn> {
        if conversation_id.is_empty() {
            return Err(Error::InvalidInput("create_turn: conversation id is required".into()));
        }
        let exists = self
            .storage
            .get_conversation(conversation_id)
            .await
            .map_err(|e| Error::storage(format!("loading conversation {conversation_id}"), e))?
            .is_some();
        if !exists {
            return Err(Error::NotFound {
                kind: "conversation",
                id: conversation_id.to_owned(),
            });
        }

        let queue_seq = if opts.track_queue {
            let storage = self.storage.clone();
            let conv = conversation_id.to_owned();
            let seq = self
                .queues
                .next(conversation_id, async move {
                    storage.max_queue_seq(&conv).await.map_err(|e| {
                        Error::storage(format!("reading max queue_seq of conversation {conv}"), e)
                    })
                })
                .await?;
            Some(seq)
        } else {
            None
        };

        let now = Utc::now();
        let turn = Turn {
            id: opts.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            conversation_id: conversation_id.to_owned(),
            created_at: now,
            queue_seq,
            status: if queue_seq.is_some() {
                TurnStatus::Queued
            } else {
                TurnStatus::Pending
            },
            error_message: None,
            retry_of: opts.retry_of,
            agent_id_override: opts.agent_id_override,
            model_override: opts.model_override,
            starting_message_id: opts.starting_message_id,
            updated_at: now,
        };

        self.storage.insert_turn(&turn).await.map_err(|e| {
            Error::storage(
                format!("inserting turn {} into conversation {conversation_id}", turn.id),
                e,
            )
        })?;

        let mut patch = ConversationPatch::new(conversation_id);
        patch.last_turn_id = Some(turn.id.clone());
        self.storage.update_conversation(&patch).await.map_err(|e| {
            Error::storage(
                format!("recording last turn {} on conversation {conversation_id}", turn.id),
                e,
            )
        })?;

        tracing::debug!(
            conversation_id,
            turn_id = %turn.id,
            queue_seq = ?turn.queue_seq,
            status = %turn.status,
            "turn created"
        );
        Ok(turn)
    }

    /// Create a new turn that retries `original_id`. The original keeps
    /// its terminal status.
    pub async fn retry_turn(&self, original_id: &str, track_queue: bool) -> Result<Turn> {
        let original = self.get_turn(original_id).await?;
        if !matches!(original.status, TurnStatus::Failed | TurnStatus::Canceled) {
            return Err(Error::InvalidInput(format!(
                "turn {original_id} is {}; only failed or canceled turns can be retried",
                original.status
            )));
        }

        self.create_turn(
            &original.conversation_id,
            NewTurn {
                id: None,
                track_queue,
                agent_id_override: original.agent_id_override,
                model_override: original.model_override,
                starting_message_id: original.starting_message_id,
                retry_of: Some(original.id),
            },
        )
        .await
    }

    /// Move a turn to `status`, optionally recording an error message.
    ///
    /// Re-applying the current status is `Unchanged`; a move out of a
    /// terminal status, or any other edge missing from the state machine,
    /// is `InvalidTransition`. The write is conditional on the status that
    /// was read, so concurrent writers cannot both leave a terminal state;
    /// a lost race re-reads and re-evaluates. `queue_seq` and `created_at`
    /// are never touched.
    pub async fn set_status(
        &self,
        turn_id: &str,
        status: TurnStatus,
        error_message: Option<&str>,
    ) -> Result<StatusChange> {
        if turn_id.is_empty() {
            return Err(Error::InvalidInput("set_status: turn id is required".into()));
        }

        let mut attempt = 0;
        loop {
            let turn = self.get_turn(turn_id).await?;
            let from = turn.status;

            if from == status {
                return Ok(StatusChange::Unchanged(from));
            }
            if !transition_allowed(from, status) {
                tracing::warn!(turn_id, from = %from, to = %status, "rejected turn transition");
                return Err(Error::InvalidTransition {
                    turn_id: turn_id.to_owned(),
                    from: from.to_string(),
                    to: status.to_string(),
                });
            }

            let patch = TurnPatch {
                id: turn_id.to_owned(),
                expected: from,
                status,
                error_message: error_message.map(str::to_owned),
            };
            match self.storage.update_turn(&patch).await {
                Ok(()) => {}
                Err(e) if e.is_status_conflict() && attempt + 1 < STATUS_WRITE_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(
                        turn_id,
                        from = %from,
                        to = %status,
                        attempt,
                        "turn status changed underneath, re-reading"
                    );
                    continue;
                }
                Err(e) => {
                    return Err(Error::storage(format!("setting turn {turn_id} to {status}"), e));
                }
            }

            if status.is_terminal() {
                self.sequences.forget(turn_id);
            }

            TraceEvent::TurnStatusChanged {
                conversation_id: turn.conversation_id,
                turn_id: turn_id.to_owned(),
                from: from.to_string(),
                to: status.to_string(),
            }
            .emit();

            return Ok(StatusChange::Applied { from, to: status });
        }
    }

    /// Persist the terminal status for a finished run.
    ///
    /// A cancelled outcome (or a fired `run` token) is written as
    /// `canceled` without consulting `run`. Other errors become `failed`
    /// with the error text, written under `run` while it is live and
    /// detached otherwise. If the turn already reached a terminal status
    /// that status is returned as-is.
    pub async fn record_outcome(
        &self,
        turn_id: &str,
        outcome: &Result<()>,
        run: &CancellationToken,
    ) -> Result<TurnStatus> {
        let (status, error_message) = match outcome {
            Ok(()) if !run.is_cancelled() => (TurnStatus::Succeeded, None),
            Err(e) if !e.is_cancelled() && !run.is_cancelled() => {
                (TurnStatus::Failed, Some(e.to_string()))
            }
            _ => (TurnStatus::Canceled, None),
        };

        let write = match status {
            TurnStatus::Canceled => self.set_status(turn_id, status, None).await,
            _ => {
                let attempt = cancellable(run, "record_outcome", async {
                    self.set_status(turn_id, status, error_message.as_deref()).await
                })
                .await;
                match attempt {
                    Err(e) if e.is_cancelled() => {
                        tracing::debug!(turn_id, status = %status, "run cancelled mid-write, retrying detached");
                        self.set_status(turn_id, status, error_message.as_deref()).await
                    }
                    other => other,
                }
            }
        };

        match write {
            Ok(StatusChange::Applied { to, .. }) => Ok(to),
            Ok(StatusChange::Unchanged(current)) => Ok(current),
            Err(Error::InvalidTransition { .. }) => {
                let current = self.get_turn(turn_id).await?.status;
                tracing::debug!(turn_id, current = %current, wanted = %status, "turn already terminal");
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::storage::{MemoryStorage, StorageResult};
    use cs_domain::model::{Conversation, Message, MessagePatch, ModelCall, ToolCall};

    async fn manager() -> (Arc<MemoryStorage>, Arc<SequenceAllocator>, TurnManager) {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_conversation(&Conversation::new("c1")).await.unwrap();
        let sequences = Arc::new(SequenceAllocator::new(storage.clone()));
        let turns = TurnManager::new(storage.clone(), sequences.clone());
        (storage, sequences, turns)
    }

    #[test]
    fn state_machine_edges() {
        use TurnStatus::*;
        assert!(transition_allowed(Queued, Pending));
        assert!(transition_allowed(Pending, Running));
        assert!(transition_allowed(Running, WaitingForUser));
        assert!(transition_allowed(WaitingForUser, Running));
        assert!(transition_allowed(Queued, Canceled));
        assert!(!transition_allowed(Running, Pending));
        assert!(!transition_allowed(Pending, Queued));
        for terminal in [Succeeded, Failed, Canceled] {
            for to in [Queued, Pending, Running, WaitingForUser, Succeeded, Failed, Canceled] {
                assert!(!transition_allowed(terminal, to));
            }
        }
    }

    #[tokio::test]
    async fn entry_state_depends_on_queue_tracking() {
        let (storage, _, turns) = manager().await;
        let pending = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        assert_eq!(pending.status, TurnStatus::Pending);
        assert_eq!(pending.queue_seq, None);

        let queued = turns
            .create_turn("c1", NewTurn { track_queue: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(queued.status, TurnStatus::Queued);
        assert_eq!(queued.queue_seq, Some(1));

        let conv = storage.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.last_turn_id.as_deref(), Some(queued.id.as_str()));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let (_, _, turns) = manager().await;
        let err = turns.create_turn("nope", NewTurn::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "conversation", .. }));
    }

    #[tokio::test]
    async fn queue_seq_resumes_after_persisted_max() {
        let (storage, sequences, turns) = manager().await;
        turns
            .create_turn("c1", NewTurn { track_queue: true, ..Default::default() })
            .await
            .unwrap();

        // A fresh manager (e.g. after restart) continues from storage.
        let restarted = TurnManager::new(storage, sequences);
        let next = restarted
            .create_turn("c1", NewTurn { track_queue: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(next.queue_seq, Some(2));
    }

    #[tokio::test]
    async fn terminal_is_closed_and_idempotent() {
        let (_, _, turns) = manager().await;
        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        turns.set_status(&turn.id, TurnStatus::Running, None).await.unwrap();
        turns.set_status(&turn.id, TurnStatus::Succeeded, None).await.unwrap();

        let again = turns.set_status(&turn.id, TurnStatus::Succeeded, None).await.unwrap();
        assert_eq!(again, StatusChange::Unchanged(TurnStatus::Succeeded));

        let err = turns
            .set_status(&turn.id, TurnStatus::Failed, Some("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let stored = turns.get_turn(&turn.id).await.unwrap();
        assert_eq!(stored.status, TurnStatus::Succeeded);
        assert_eq!(stored.error_message, None);
    }

    /// Delegates to `MemoryStorage`, stalling every turn read so that
    /// concurrent writers all observe the same starting status.
    struct SlowTurnReads(MemoryStorage);

    #[async_trait::async_trait]
    impl Storage for SlowTurnReads {
        async fn insert_conversation(&self, c: &Conversation) -> StorageResult<()> {
            self.0.insert_conversation(c).await
        }
        async fn update_conversation(&self, p: &ConversationPatch) -> StorageResult<()> {
            self.0.update_conversation(p).await
        }
        async fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>> {
            self.0.get_conversation(id).await
        }
        async fn insert_turn(&self, t: &Turn) -> StorageResult<()> {
            self.0.insert_turn(t).await
        }
        async fn update_turn(&self, p: &TurnPatch) -> StorageResult<()> {
            self.0.update_turn(p).await
        }
        async fn get_turn(&self, id: &str) -> StorageResult<Option<Turn>> {
            let turn = self.0.get_turn(id).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            turn
        }
        async fn list_turns(&self, conversation_id: &str) -> StorageResult<Vec<Turn>> {
            self.0.list_turns(conversation_id).await
        }
        async fn max_queue_seq(&self, conversation_id: &str) -> StorageResult<Option<i64>> {
            self.0.max_queue_seq(conversation_id).await
        }
        async fn insert_message(&self, m: &Message) -> StorageResult<()> {
            self.0.insert_message(m).await
        }
        async fn update_message(&self, p: &MessagePatch) -> StorageResult<()> {
            self.0.update_message(p).await
        }
        async fn get_message(&self, id: &str) -> StorageResult<Option<Message>> {
            self.0.get_message(id).await
        }
        async fn list_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>> {
            self.0.list_messages(conversation_id).await
        }
        async fn max_sequence(&self, turn_id: &str) -> StorageResult<Option<i64>> {
            self.0.max_sequence(turn_id).await
        }
        async fn upsert_tool_call(&self, c: &ToolCall) -> StorageResult<()> {
            self.0.upsert_tool_call(c).await
        }
        async fn get_tool_call(&self, message_id: &str) -> StorageResult<Option<ToolCall>> {
            self.0.get_tool_call(message_id).await
        }
        async fn upsert_model_call(&self, c: &ModelCall) -> StorageResult<()> {
            self.0.upsert_model_call(c).await
        }
        async fn get_model_call(&self, message_id: &str) -> StorageResult<Option<ModelCall>> {
            self.0.get_model_call(message_id).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_terminal_writes_leave_one_consistent_outcome() {
        let storage = Arc::new(SlowTurnReads(MemoryStorage::new()));
        storage.insert_conversation(&Conversation::new("c1")).await.unwrap();
        let sequences = Arc::new(SequenceAllocator::new(storage.clone()));
        let turns = Arc::new(TurnManager::new(storage.clone(), sequences));

        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        turns.set_status(&turn.id, TurnStatus::Running, None).await.unwrap();

        let succeed = tokio::spawn({
            let turns = turns.clone();
            let id = turn.id.clone();
            async move { turns.set_status(&id, TurnStatus::Succeeded, None).await }
        });
        let fail = tokio::spawn({
            let turns = turns.clone();
            let id = turn.id.clone();
            async move { turns.set_status(&id, TurnStatus::Failed, Some("boom")).await }
        });
        let results = [succeed.await.unwrap(), fail.await.unwrap()];

        let applied: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Ok(StatusChange::Applied { to, .. }) => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(applied.len(), 1, "exactly one writer wins: {results:?}");
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::InvalidTransition { .. })))
                .count(),
            1,
            "the loser sees a terminal turn: {results:?}"
        );

        let stored = turns.get_turn(&turn.id).await.unwrap();
        assert_eq!(stored.status, applied[0]);
        match stored.status {
            TurnStatus::Succeeded => assert_eq!(stored.error_message, None),
            TurnStatus::Failed => assert_eq!(stored.error_message.as_deref(), Some("boom")),
            other => panic!("unexpected status {other}"),
        }
    }

    #[tokio::test]
    async fn terminal_status_releases_sequence_counter() {
        let (_, sequences, turns) = manager().await;
        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        sequences.next(&turn.id).await.unwrap();
        assert_eq!(sequences.tracked_turns(), 1);

        turns.set_status(&turn.id, TurnStatus::Canceled, None).await.unwrap();
        assert_eq!(sequences.tracked_turns(), 0);
    }

    #[tokio::test]
    async fn waiting_for_user_is_reentrant() {
        let (_, _, turns) = manager().await;
        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        for status in [
            TurnStatus::Running,
            TurnStatus::WaitingForUser,
            TurnStatus::Running,
            TurnStatus::WaitingForUser,
            TurnStatus::Running,
        ] {
            turns.set_status(&turn.id, status, None).await.unwrap();
        }
        assert_eq!(turns.get_turn(&turn.id).await.unwrap().status, TurnStatus::Running);
    }

    #[tokio::test]
    async fn retry_only_from_failed_or_canceled() {
        let (_, _, turns) = manager().await;
        let turn = turns
            .create_turn(
                "c1",
                NewTurn {
                    model_override: Some("m-large".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(turns.retry_turn(&turn.id, false).await.is_err());

        turns.set_status(&turn.id, TurnStatus::Failed, Some("boom")).await.unwrap();
        let retry = turns.retry_turn(&turn.id, false).await.unwrap();
        assert_eq!(retry.retry_of.as_deref(), Some(turn.id.as_str()));
        assert_eq!(retry.model_override.as_deref(), Some("m-large"));
        assert_eq!(retry.status, TurnStatus::Pending);

        let original = turns.get_turn(&turn.id).await.unwrap();
        assert_eq!(original.status, TurnStatus::Failed);
        assert_eq!(original.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn outcome_maps_errors_to_failed() {
        let (_, _, turns) = manager().await;
        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        turns.set_status(&turn.id, TurnStatus::Running, None).await.unwrap();

        let outcome: Result<()> = Err(Error::Summarizer("provider timeout".into()));
        let status = turns
            .record_outcome(&turn.id, &outcome, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, TurnStatus::Failed);
        let stored = turns.get_turn(&turn.id).await.unwrap();
        assert!(stored.error_message.unwrap().contains("provider timeout"));
    }

    #[tokio::test]
    async fn outcome_under_cancelled_token_is_still_persisted() {
        let (_, _, turns) = manager().await;
        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        turns.set_status(&turn.id, TurnStatus::Running, None).await.unwrap();

        let run = CancellationToken::new();
        run.cancel();
        let outcome: Result<()> = Err(Error::Cancelled("user stop".into()));
        let status = turns.record_outcome(&turn.id, &outcome, &run).await.unwrap();
        assert_eq!(status, TurnStatus::Canceled);
        assert_eq!(turns.get_turn(&turn.id).await.unwrap().status, TurnStatus::Canceled);
    }

    #[tokio::test]
    async fn outcome_after_terminal_keeps_existing_status() {
        let (_, _, turns) = manager().await;
        let turn = turns.create_turn("c1", NewTurn::default()).await.unwrap();
        turns.set_status(&turn.id, TurnStatus::Canceled, None).await.unwrap();

        let status = turns
            .record_outcome(&turn.id, &Ok(()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, TurnStatus::Canceled);
    }
}

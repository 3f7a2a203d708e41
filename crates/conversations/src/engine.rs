//! Engine facade: one storage handle and one sequence allocator shared by
//! every component.

use std::sync::Arc;

use cs_domain::config::Config;
use cs_domain::error::Result;

use crate::compact::Compactor;
use crate::conversation::Conversations;
use crate::lifecycle::TurnManager;
use crate::link::Linker;
use crate::messages::MessageStore;
use crate::sequence::SequenceAllocator;
use crate::storage::Storage;
use crate::summarizer::Summarizer;
use crate::transcript::{load_transcript, Transcript, TranscriptQuery};

/// Wires every component around one storage handle and one shared
/// sequence allocator.
pub struct Engine {
    storage: Arc<dyn Storage>,
    config: Config,
    sequences: Arc<SequenceAllocator>,
    conversations: Arc<Conversations>,
    turns: Arc<TurnManager>,
    messages: Arc<MessageStore>,
    compactor: Compactor,
    linker: Linker,
}

impl Engine {
    pub fn new(storage: Arc<dyn Storage>, config: Config) -> Self {
        let sequences = Arc::new(SequenceAllocator::new(storage.clone()));
        let conversations = Arc::new(Conversations::new(storage.clone()));
        let turns = Arc::new(TurnManager::new(storage.clone(), sequences.clone()));
        let messages = Arc::new(MessageStore::new(
            storage.clone(),
            sequences.clone(),
            config.sequence.clone(),
        ));
        let compactor = Compactor::new(storage.clone(), messages.clone(), config.compaction.clone());
        let linker = Linker::new(
            conversations.clone(),
            turns.clone(),
            messages.clone(),
            config.linking.clone(),
        );

        Self {
            storage,
            config,
            sequences,
            conversations,
            turns,
            messages,
            compactor,
            linker,
        }
    }

    /// Attach the summarizer used when `compaction.llm_summary` is on.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.compactor = self.compactor.with_summarizer(summarizer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn sequences(&self) -> &SequenceAllocator {
        &self.sequences
    }

    pub fn conversations(&self) -> &Conversations {
        &self.conversations
    }

    pub fn turns(&self) -> &TurnManager {
        &self.turns
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    pub async fn transcript(&self, conversation_id: &str, query: &TranscriptQuery) -> Result<Transcript> {
        load_transcript(self.storage.as_ref(), conversation_id, query).await
    }
}

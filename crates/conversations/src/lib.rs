//! Conversation state engine: durable conversations, turns and messages
//! with per-turn ordering under concurrent writers, token-budget
//! compaction, and linked child conversations.

mod cancel;
pub mod compact;
pub mod conversation;
pub mod engine;
pub mod lifecycle;
pub mod link;
pub mod messages;
pub mod sequence;
pub mod storage;
pub mod summarizer;
pub mod transcript;

pub use compact::{CompactOutcome, CompactRequest, Compactor};
pub use conversation::{Conversations, NewConversation};
pub use engine::Engine;
pub use lifecycle::{NewTurn, StatusChange, TurnManager};
pub use link::{LinkMessage, LinkRequest, Linker};
pub use messages::{ByteRange, ContentPage, MessageStore, NewMessage};
pub use sequence::SequenceAllocator;
pub use storage::{MemoryStorage, Storage, StorageResult};
pub use summarizer::Summarizer;
pub use transcript::{MessageView, Transcript, TranscriptQuery, TurnView};

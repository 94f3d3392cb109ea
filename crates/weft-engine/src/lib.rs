//! weft-engine: Conversation reconciliation engine
//!
//! Polls a conversation's status snapshots and reconciles them into a
//! deduplicated, ordered transcript: per-task lifecycle entries plus one
//! final answer extracted from whatever shape the backend produced.

pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod ledger;
pub mod normalize;
pub mod scheduler;
pub mod session;
pub mod transcript;

pub use engine::{Engine, EngineConfig, SessionEventStream};
pub use error::{Error, Result};
pub use events::{SessionEvent, StopReason, TaskRef, TaskStateChange};
pub use handle::SessionHandle;
pub use ledger::{TaskGroup, TaskLedger, TaskRecord};
pub use normalize::{Extraction, Rule};
pub use scheduler::{PollPolicy, PollingScheduler, PollingState};
pub use session::ConversationSession;
pub use transcript::{Phase, ProcessKind, TranscriptBuilder, TranscriptEntry, TranscriptStore};

//! Conversation session
//!
//! Owns everything that lives as long as one conversation is being polled:
//! the task ledger, the transcript builder, the last raw snapshot used to
//! short-circuit identical polls, and a deferred fallback answer. All of it is
//! dropped when polling stops.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use weft_api::{ConversationSnapshot, ConversationStatus};

use crate::events::{SessionEvent, StopReason};
use crate::ledger::TaskLedger;
use crate::normalize;
use crate::scheduler::{Fetched, PollHandler, PollPolicy};
use crate::transcript::{TranscriptBuilder, TranscriptEntry, TranscriptStore, TranscriptUpdate};

/// Final entry for a failed conversation that reported no reason
pub const FAILURE_NOTICE: &str = "The request could not be completed.";

/// Reconciles one conversation's snapshots into the shared transcript
pub struct ConversationSession {
    conversation_id: String,
    ledger: TaskLedger,
    transcript: TranscriptBuilder,
    last_raw: Option<Value>,
    /// Fallback rendering of the latest terminal snapshot, held back in case
    /// real content arrives during the grace polls
    deferred_final: Option<(ConversationStatus, String)>,
    polls: u32,
    stop_on_final: bool,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ConversationSession {
    pub fn new(
        conversation_id: impl Into<String>,
        store: TranscriptStore,
        policy: &PollPolicy,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            transcript: TranscriptBuilder::new(conversation_id.clone(), store),
            conversation_id,
            ledger: TaskLedger::new(),
            last_raw: None,
            deferred_final: None,
            polls: 0,
            stop_on_final: policy.stop_on_final,
            event_tx,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn transcript(&self) -> &TranscriptBuilder {
        &self.transcript
    }

    /// Record the user's query as the first entry of the conversation
    pub fn record_user_message(&mut self, content: &str) {
        let updates = self.transcript.apply(&[], Some(content));
        self.publish(updates);
    }

    /// Reconcile one snapshot. `last_poll` allows a fallback rendering to be
    /// accepted as the final answer when nothing better arrived; otherwise it
    /// is deferred until polling ends.
    pub fn ingest(&mut self, snapshot: &ConversationSnapshot, last_poll: bool) -> Option<StopReason> {
        if self.transcript.is_finalized() {
            return None;
        }

        if self.last_raw.as_ref() == Some(snapshot.raw()) {
            tracing::debug!("Snapshot unchanged for {}", self.conversation_id);
        } else {
            let changes = self.ledger.apply(snapshot);
            for change in &changes {
                let _ = self.event_tx.send(SessionEvent::TaskChanged {
                    conversation_id: self.conversation_id.clone(),
                    change: change.clone(),
                });
            }
            let updates = self.transcript.apply(&changes, None);
            self.publish(updates);
            self.last_raw = Some(snapshot.raw().clone());
        }

        if !snapshot.status.is_terminal() {
            return None;
        }
        let (content, definitive) = final_content(snapshot);
        if !definitive && !last_poll {
            self.deferred_final = Some((snapshot.status, content));
            return None;
        }
        self.accept_final(snapshot.status, &content)
    }

    fn accept_final(&mut self, status: ConversationStatus, content: &str) -> Option<StopReason> {
        let entry = self.transcript.finalize(status, content)?;
        self.deferred_final = None;
        tracing::info!("Final answer accepted for {}", self.conversation_id);
        let _ = self.event_tx.send(SessionEvent::EntryAppended {
            entry: entry.clone(),
        });
        let _ = self.event_tx.send(SessionEvent::FinalAnswer {
            conversation_id: self.conversation_id.clone(),
            content: entry.content().to_string(),
        });

        self.stop_on_final.then_some(StopReason::FinalAccepted)
    }

    fn publish(&self, updates: Vec<TranscriptUpdate>) {
        for update in updates {
            let event = match update {
                TranscriptUpdate::Appended(entry) => SessionEvent::EntryAppended { entry },
                TranscriptUpdate::Updated(entry) => SessionEvent::EntryUpdated { entry },
            };
            let _ = self.event_tx.send(event);
        }
    }

    /// Entries of this conversation in display order
    pub fn display(&self) -> Vec<TranscriptEntry> {
        self.transcript.display()
    }

    fn clear_caches(&mut self) {
        self.ledger.clear();
        self.last_raw = None;
        self.deferred_final = None;
    }
}

/// Final answer for a terminal snapshot, and whether it may be accepted
/// before the last poll
fn final_content(snapshot: &ConversationSnapshot) -> (String, bool) {
    let extraction = normalize::final_answer(snapshot);
    if extraction.is_content() {
        return (extraction.text, true);
    }
    if snapshot.status == ConversationStatus::Failed {
        let notice = snapshot
            .error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| FAILURE_NOTICE.to_string());
        return (notice, true);
    }
    (extraction.text, false)
}

#[async_trait]
impl PollHandler for ConversationSession {
    async fn on_fetched(&mut self, fetched: Fetched, last_poll: bool) -> Option<StopReason> {
        self.polls += 1;
        match fetched {
            Ok(Some(snapshot)) => {
                let _ = self.event_tx.send(SessionEvent::Polled {
                    conversation_id: self.conversation_id.clone(),
                    status: snapshot.status,
                    poll: self.polls,
                });
                self.ingest(&snapshot, last_poll)
            }
            Ok(None) => {
                tracing::debug!("No snapshot yet for {}", self.conversation_id);
                None
            }
            Err(e) => {
                tracing::warn!("Status fetch failed for {}: {}", self.conversation_id, e);
                let _ = self.event_tx.send(SessionEvent::FetchFailed {
                    conversation_id: self.conversation_id.clone(),
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
                None
            }
        }
    }

    async fn on_stopped(&mut self, reason: StopReason) {
        // Grace polls may all have failed; the held-back fallback still counts
        if matches!(reason, StopReason::GraceExhausted | StopReason::MaxPolls) {
            if let Some((status, content)) = self.deferred_final.take() {
                self.accept_final(status, &content);
            }
        }
        self.clear_caches();
        let _ = self.event_tx.send(SessionEvent::SessionStopped {
            conversation_id: self.conversation_id.clone(),
            reason,
        });
    }
}

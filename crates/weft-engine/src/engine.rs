//! Engine: owns the transcript store and all live sessions

use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::Stream;
use weft_api::{Backend, QueryRequest};

use crate::error::{Error, Result};
use crate::events::{SessionEvent, StopReason};
use crate::handle::SessionHandle;
use crate::scheduler::{PollPolicy, PollingScheduler};
use crate::session::ConversationSession;
use crate::transcript::{TranscriptEntry, TranscriptStore};

/// Stream of engine events
pub type SessionEventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: PollPolicy,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: PollPolicy::default(),
            event_capacity: 256,
        }
    }
}

/// Submits queries and reconciles their conversations into one transcript
pub struct Engine {
    scheduler: PollingScheduler,
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    store: TranscriptStore,
    event_tx: broadcast::Sender<SessionEvent>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    current: Mutex<Option<String>>,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            scheduler: PollingScheduler::new(Arc::clone(&backend), config.policy.clone()),
            backend,
            config,
            store: TranscriptStore::new(),
            event_tx,
            sessions: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Engine events as a stream. Lagged receivers skip ahead.
    pub fn events(&self) -> SessionEventStream {
        let mut rx = self.event_tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event stream lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Submit a query and start polling its conversation.
    ///
    /// The session showing the previous query is superseded once the backend
    /// has accepted the new one; its entries stay in the transcript.
    pub async fn submit(&self, query: &str) -> Result<SessionHandle> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidQuery("query is empty".to_string()));
        }

        let accepted = self
            .backend
            .submit_query(&QueryRequest::new(query))
            .await
            .map_err(|e| {
                tracing::warn!("Could not submit query: {}", e);
                Error::from(e)
            })?;
        tracing::info!("Query accepted as conversation {}", accepted.conversation_id);

        if let Some(previous) = self.current() {
            if previous != accepted.conversation_id {
                self.stop_with(&previous, StopReason::Superseded);
            }
        }
        Ok(self.start_session(&accepted.conversation_id, Some(query)))
    }

    /// Start polling an existing conversation without submitting anything
    pub fn watch(&self, conversation_id: &str) -> Result<SessionHandle> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(Error::InvalidQuery("conversation id is empty".to_string()));
        }
        Ok(self.start_session(conversation_id, None))
    }

    fn start_session(&self, conversation_id: &str, user_message: Option<&str>) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, handle| handle.is_running());
        if let Some(existing) = sessions.remove(conversation_id) {
            existing.stop_with(StopReason::Superseded);
        }

        let mut session = ConversationSession::new(
            conversation_id,
            self.store.clone(),
            &self.config.policy,
            self.event_tx.clone(),
        );
        let _ = self.event_tx.send(SessionEvent::SessionStarted {
            conversation_id: conversation_id.to_string(),
        });
        if let Some(message) = user_message {
            session.record_user_message(message);
        }

        let handle = self.scheduler.start(conversation_id, session);
        sessions.insert(conversation_id.to_string(), handle.clone());
        *self.current.lock() = Some(conversation_id.to_string());
        handle
    }

    /// Stop polling a conversation. Returns `false` if it was not running.
    pub fn stop(&self, conversation_id: &str) -> bool {
        self.stop_with(conversation_id, StopReason::Cancelled)
    }

    fn stop_with(&self, conversation_id: &str, reason: StopReason) -> bool {
        match self.sessions.lock().remove(conversation_id) {
            Some(handle) if handle.is_running() => {
                handle.stop_with(reason);
                true
            }
            _ => false,
        }
    }

    /// Stop every session and wait for them to wind down
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop();
        }
        for handle in &handles {
            handle.wait_for_stop().await;
        }
    }

    /// Conversation currently shown to the user
    pub fn current(&self) -> Option<String> {
        self.current.lock().clone()
    }

    pub fn session(&self, conversation_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(conversation_id).cloned()
    }

    /// The shared transcript
    pub fn transcript(&self) -> &TranscriptStore {
        &self.store
    }

    /// One conversation's entries in display order
    pub fn display(&self, conversation_id: &str) -> Vec<TranscriptEntry> {
        self.store.display(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use weft_api::{ConversationSnapshot, QueryAccepted};

    /// Backend with scripted status documents per conversation. The last
    /// document of a script repeats, unless the conversation is marked as
    /// failing, in which case an exhausted script answers 503.
    #[derive(Default)]
    struct MockBackend {
        accept: Mutex<VecDeque<serde_json::Value>>,
        scripts: Mutex<HashMap<String, VecDeque<serde_json::Value>>>,
        failing: Mutex<Vec<String>>,
        fetches: Mutex<HashMap<String, u32>>,
    }

    impl MockBackend {
        fn accepting(self, response: serde_json::Value) -> Self {
            self.accept.lock().push_back(response);
            self
        }

        fn script(self, conversation_id: &str, docs: Vec<serde_json::Value>) -> Self {
            self.scripts
                .lock()
                .insert(conversation_id.to_string(), docs.into());
            self
        }

        fn then_failing(self, conversation_id: &str) -> Self {
            self.failing.lock().push(conversation_id.to_string());
            self
        }

        fn fetch_count(&self, conversation_id: &str) -> u32 {
            self.fetches.lock().get(conversation_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn submit_query(&self, _request: &QueryRequest) -> weft_api::Result<QueryAccepted> {
            let response = self
                .accept
                .lock()
                .pop_front()
                .unwrap_or_else(|| json!({}));
            QueryAccepted::from_value(response)
        }

        async fn fetch_status(
            &self,
            conversation_id: &str,
        ) -> weft_api::Result<Option<ConversationSnapshot>> {
            *self
                .fetches
                .lock()
                .entry(conversation_id.to_string())
                .or_default() += 1;
            let failing = self.failing.lock().iter().any(|id| id == conversation_id);
            let doc = {
                let mut scripts = self.scripts.lock();
                let Some(script) = scripts.get_mut(conversation_id) else {
                    return Ok(None);
                };
                if script.len() > 1 || failing {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            };
            match doc {
                Some(doc) => ConversationSnapshot::from_value(doc).map(Some),
                None if failing => Err(weft_api::Error::api(503, "service unavailable")),
                None => Ok(None),
            }
        }
    }

    fn engine(backend: MockBackend, policy: PollPolicy) -> (Engine, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let engine = Engine::new(
            backend.clone(),
            EngineConfig {
                policy,
                ..Default::default()
            },
        );
        (engine, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_runs_conversation_to_completion() {
        let backend = MockBackend::default()
            .accepting(json!({"conversation_id": "c1"}))
            .script(
                "c1",
                vec![
                    json!({"status": "processing", "tasks": [
                        {"id": "t1", "role": "researcher", "description": "Search", "status": "processing"}
                    ]}),
                    json!({"status": "completed", "tasks": [
                        {"id": "t1", "role": "researcher", "description": "Search",
                         "status": "completed", "result": {"content": "Found it"}}
                    ]}),
                ],
            );
        let (engine, backend) = engine(backend, PollPolicy::default());

        let handle = engine.submit("find it").await.unwrap();
        handle.wait_for_stop().await;

        // one processing poll, then the terminal poll plus two grace polls
        assert_eq!(backend.fetch_count("c1"), 4);

        let entries = engine.display("c1");
        let kinds: Vec<&str> = entries
            .iter()
            .map(|e| match e {
                TranscriptEntry::User { .. } => "user",
                TranscriptEntry::SystemProcess { .. } => "process",
                TranscriptEntry::AssistantFinal { .. } => "final",
            })
            .collect();
        assert_eq!(kinds, vec!["user", "process", "process", "final"]);
        assert_eq!(entries[0].content(), "find it");
        assert_eq!(entries[2].content(), "Found it");
        assert_eq!(entries[3].content(), "Found it");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_answer_survives_failing_grace_polls() {
        let backend = MockBackend::default()
            .accepting(json!({"conversation_id": "c1"}))
            .script("c1", vec![json!({"status": "completed", "result": {"rows": [1, 2]}})])
            .then_failing("c1");
        let (engine, backend) = engine(backend, PollPolicy::default());

        let handle = engine.submit("list rows").await.unwrap();
        handle.wait_for_stop().await;

        assert_eq!(backend.fetch_count("c1"), 3);
        let finals: Vec<TranscriptEntry> = engine
            .display("c1")
            .into_iter()
            .filter(|e| e.is_final())
            .collect();
        assert_eq!(finals.len(), 1);
        assert!(finals[0].content().starts_with("```json"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_conversation_id_never_polls() {
        let backend = MockBackend::default().accepting(json!({"status": "pending"}));
        let (engine, backend) = engine(backend, PollPolicy::default());

        let err = engine.submit("q").await.unwrap_err();
        assert!(err.is_missing_conversation_id());
        assert!(engine.current().is_none());
        assert!(engine.transcript().is_empty());
        assert!(backend.fetches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let (engine, _) = engine(MockBackend::default(), PollPolicy::default());
        assert!(matches!(
            engine.submit("   ").await,
            Err(Error::InvalidQuery(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_query_supersedes_current() {
        let backend = MockBackend::default()
            .accepting(json!({"conversation_id": "old"}))
            .accepting(json!({"conversation_id": "new"}))
            .script("old", vec![json!({"status": "processing"})])
            .script("new", vec![json!({"status": "completed", "message": "New answer"})]);
        let (engine, _) = engine(backend, PollPolicy::default());
        let mut events = engine.events();

        let old = engine.submit("first").await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let new = engine.submit("second").await.unwrap();

        old.wait_for_stop().await;
        new.wait_for_stop().await;
        assert_eq!(engine.current().as_deref(), Some("new"));

        let mut stopped = Vec::new();
        while stopped.len() < 2 {
            if let Some(SessionEvent::SessionStopped {
                conversation_id,
                reason,
            }) = events.next().await
            {
                stopped.push((conversation_id, reason));
            }
        }
        assert!(stopped.contains(&("old".to_string(), StopReason::Superseded)));
        assert!(stopped.contains(&("new".to_string(), StopReason::GraceExhausted)));

        // the superseded conversation keeps its entries
        assert_eq!(engine.display("old")[0].content(), "first");
        assert!(engine.transcript().has_final("new"));
        assert!(!engine.transcript().has_final("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_final_policy() {
        let backend = MockBackend::default()
            .accepting(json!({"id": "c1"}))
            .script("c1", vec![json!({"status": "completed", "message": "Done"})]);
        let policy = PollPolicy {
            stop_on_final: true,
            ..Default::default()
        };
        let (engine, backend) = engine(backend, policy);

        let handle = engine.submit("q").await.unwrap();
        handle.wait_for_stop().await;
        assert_eq!(backend.fetch_count("c1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_and_stop() {
        let backend =
            MockBackend::default().script("c9", vec![json!({"status": "processing"})]);
        let (engine, backend) = engine(backend, PollPolicy::default());

        let handle = engine.watch("c9").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(engine.stop("c9"));
        handle.wait_for_stop().await;
        assert!(!engine.stop("c9"));

        let fetched = backend.fetch_count("c9");
        assert_eq!(fetched, 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.fetch_count("c9"), fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sessions_share_store() {
        let backend = MockBackend::default()
            .script("a", vec![json!({"status": "completed", "message": "A"})])
            .script("b", vec![json!({"status": "completed", "message": "B"})]);
        let (engine, _) = engine(backend, PollPolicy::default());

        let a = engine.watch("a").unwrap();
        let b = engine.watch("b").unwrap();
        a.wait_for_stop().await;
        b.wait_for_stop().await;

        assert_eq!(engine.display("a")[0].content(), "A");
        assert_eq!(engine.display("b")[0].content(), "B");
        assert_eq!(engine.transcript().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let backend = MockBackend::default().script("x", vec![json!({"status": "processing"})]);
        let (engine, _) = engine(backend, PollPolicy::default());
        let handle = engine.watch("x").unwrap();
        engine.shutdown().await;
        assert!(!handle.is_running());
    }
}

//! Polling scheduler
//!
//! Split in two: [`PollingState`] decides, per tick, whether to fetch and
//! whether to keep going, with no runtime involved. [`PollingScheduler`] runs
//! that state machine on a tokio task per conversation.
//!
//! Termination: once a terminal status is first observed the session gets
//! `grace_polls` more polls, so a conversation that reaches and stays
//! terminal is polled exactly `grace_polls + 1` times from that point on.
//! Failed fetches after that point count against the budget too.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use weft_api::{Backend, ConversationSnapshot, ConversationStatus};

use crate::events::StopReason;
use crate::handle::SessionHandle;

/// Timing and termination settings for polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between polls
    pub interval: Duration,
    /// Extra polls after the first terminal status
    pub grace_polls: u32,
    /// Stop as soon as a final answer is accepted
    pub stop_on_final: bool,
    /// Hard cap on polls per conversation
    pub max_polls: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            grace_polls: 2,
            stop_on_final: false,
            max_polls: None,
        }
    }
}

impl PollPolicy {
    const MIN_INTERVAL: Duration = Duration::from_millis(10);

    /// The interval, clamped to a sane minimum
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(Self::MIN_INTERVAL)
    }
}

/// Why a tick did not fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    InFlight,
    TooSoon,
}

/// Tick decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Poll,
    Skip(SkipReason),
}

/// What to do after a poll completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Stop(StopReason),
}

impl PollOutcome {
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            PollOutcome::Continue => None,
            PollOutcome::Stop(reason) => Some(*reason),
        }
    }
}

/// Per-conversation scheduler state
#[derive(Debug, Clone)]
pub struct PollingState {
    pub conversation_id: String,
    pub active: bool,
    /// Start time of the last successful fetch
    pub last_poll_at: Option<Instant>,
    /// Polls taken since the terminal status was first seen
    pub grace_extra_polls: u32,
    pub terminal_seen: bool,
    pub in_flight: bool,
    pub total_polls: u32,
    started_at: Option<Instant>,
    policy: PollPolicy,
}

impl PollingState {
    pub fn new(conversation_id: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            active: true,
            last_poll_at: None,
            grace_extra_polls: 0,
            terminal_seen: false,
            in_flight: false,
            total_polls: 0,
            started_at: None,
            policy,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Decide whether this tick fetches. A `Poll` marks the fetch in flight.
    pub fn on_tick(&mut self, now: Instant) -> TickDecision {
        if !self.active {
            return TickDecision::Skip(SkipReason::Inactive);
        }
        if self.in_flight {
            return TickDecision::Skip(SkipReason::InFlight);
        }
        if let Some(last) = self.last_poll_at {
            if now.saturating_duration_since(last) < self.policy.effective_interval() {
                return TickDecision::Skip(SkipReason::TooSoon);
            }
        }
        self.in_flight = true;
        self.started_at = Some(now);
        self.total_polls += 1;
        TickDecision::Poll
    }

    /// Record a successful fetch. `status` is `None` when the backend had no
    /// snapshot yet.
    pub fn on_success(&mut self, status: Option<ConversationStatus>) -> PollOutcome {
        self.in_flight = false;
        self.last_poll_at = self.started_at.take();
        self.account(status.is_some_and(|s| s.is_terminal()))
    }

    /// Record a failed fetch. The next tick may retry immediately.
    pub fn on_failure(&mut self) -> PollOutcome {
        self.in_flight = false;
        self.started_at = None;
        self.account(false)
    }

    fn account(&mut self, terminal: bool) -> PollOutcome {
        if self.terminal_seen {
            self.grace_extra_polls += 1;
        } else if terminal {
            self.terminal_seen = true;
        }

        let outcome = if self.terminal_seen && self.grace_extra_polls >= self.policy.grace_polls {
            PollOutcome::Stop(StopReason::GraceExhausted)
        } else if self
            .policy
            .max_polls
            .is_some_and(|max| self.total_polls >= max)
        {
            PollOutcome::Stop(StopReason::MaxPolls)
        } else {
            PollOutcome::Continue
        };
        if outcome != PollOutcome::Continue {
            self.active = false;
        }
        outcome
    }

    /// Stop permanently
    pub fn deactivate(&mut self) {
        self.active = false;
        self.in_flight = false;
    }
}

/// Result of one fetch, as delivered to a [`PollHandler`]
pub type Fetched = weft_api::Result<Option<ConversationSnapshot>>;

/// Receives what the scheduler fetches for one conversation
#[async_trait]
pub trait PollHandler: Send + 'static {
    /// Handle one fetch result. `last_poll` is true when the scheduler will
    /// not poll again. Return a reason to stop polling early.
    async fn on_fetched(&mut self, fetched: Fetched, last_poll: bool) -> Option<StopReason>;

    /// Called once when polling stops for any reason
    async fn on_stopped(&mut self, reason: StopReason);
}

/// Drives periodic status fetches, one tokio task per conversation
#[derive(Clone)]
pub struct PollingScheduler {
    backend: Arc<dyn Backend>,
    policy: PollPolicy,
}

impl PollingScheduler {
    pub fn new(backend: Arc<dyn Backend>, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Begin polling a conversation. The first fetch happens immediately.
    pub fn start<H: PollHandler>(&self, conversation_id: &str, handler: H) -> SessionHandle {
        let handle = SessionHandle::new(PollingState::new(conversation_id, self.policy.clone()));
        tracing::info!("Polling started for conversation {}", conversation_id);
        tokio::spawn(run(
            Arc::clone(&self.backend),
            self.policy.effective_interval(),
            handle.clone(),
            handler,
        ));
        handle
    }
}

async fn run<H: PollHandler>(
    backend: Arc<dyn Backend>,
    interval: Duration,
    handle: SessionHandle,
    mut handler: H,
) {
    let conversation_id = handle.conversation_id().to_string();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break handle.cancel_reason(),
            _ = ticker.tick() => {}
            _ = handle.nudge.notified() => {}
        }

        let decision = handle.state.lock().on_tick(Instant::now());
        if let TickDecision::Skip(skip) = decision {
            tracing::debug!("Skipping poll for {}: {:?}", conversation_id, skip);
            continue;
        }

        let fetched = backend.fetch_status(&conversation_id).await;
        if handle.cancel.is_cancelled() {
            tracing::debug!("Discarding poll result for stopped conversation {}", conversation_id);
            break handle.cancel_reason();
        }

        let outcome = {
            let mut state = handle.state.lock();
            match &fetched {
                Ok(snapshot) => state.on_success(snapshot.as_ref().map(|s| s.status)),
                Err(_) => state.on_failure(),
            }
        };

        let last_poll = outcome.stop_reason();
        if let Some(reason) = handler.on_fetched(fetched, last_poll.is_some()).await {
            break reason;
        }
        if let Some(reason) = last_poll {
            break reason;
        }
    };

    handle.state.lock().deactivate();
    tracing::info!("Polling stopped for conversation {}: {:?}", conversation_id, reason);
    handler.on_stopped(reason).await;
    handle.mark_stopped();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use crate::events::SessionEvent;
    use crate::session::ConversationSession;
    use crate::transcript::TranscriptStore;
    use std::collections::VecDeque;
    use weft_api::{QueryAccepted, QueryRequest};

    fn policy(grace_polls: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(2),
            grace_polls,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_tick_polls() {
        let mut state = PollingState::new("c", policy(2));
        assert_eq!(state.on_tick(Instant::now()), TickDecision::Poll);
        assert!(state.in_flight);
        assert_eq!(state.total_polls, 1);
    }

    #[test]
    fn test_tick_while_in_flight_is_noop() {
        let mut state = PollingState::new("c", policy(2));
        let now = Instant::now();
        state.on_tick(now);
        assert_eq!(
            state.on_tick(now + Duration::from_secs(5)),
            TickDecision::Skip(SkipReason::InFlight)
        );
        assert_eq!(state.total_polls, 1);
    }

    #[test]
    fn test_skip_if_interval_not_elapsed() {
        let mut state = PollingState::new("c", policy(2));
        let now = Instant::now();
        state.on_tick(now);
        state.on_success(Some(ConversationStatus::Processing));

        assert_eq!(
            state.on_tick(now + Duration::from_millis(500)),
            TickDecision::Skip(SkipReason::TooSoon)
        );
        assert_eq!(
            state.on_tick(now + Duration::from_secs(2)),
            TickDecision::Poll
        );
    }

    #[test]
    fn test_failed_fetch_does_not_reset_interval() {
        let mut state = PollingState::new("c", policy(2));
        let now = Instant::now();
        state.on_tick(now);
        assert_eq!(state.on_failure(), PollOutcome::Continue);
        assert!(state.active);
        assert_eq!(
            state.on_tick(now + Duration::from_millis(100)),
            TickDecision::Poll
        );
    }

    fn run_statuses(state: &mut PollingState, statuses: &[ConversationStatus]) -> Vec<PollOutcome> {
        let mut now = Instant::now();
        let mut outcomes = Vec::new();
        for status in statuses {
            assert_eq!(state.on_tick(now), TickDecision::Poll);
            outcomes.push(state.on_success(Some(*status)));
            now += Duration::from_secs(2);
        }
        outcomes
    }

    #[test]
    fn test_stops_after_grace_polls() {
        use ConversationStatus::*;
        let mut state = PollingState::new("c", policy(2));
        let outcomes = run_statuses(&mut state, &[Processing, Completed, Completed, Completed]);
        assert_eq!(
            outcomes,
            vec![
                PollOutcome::Continue,
                PollOutcome::Continue,
                PollOutcome::Continue,
                PollOutcome::Stop(StopReason::GraceExhausted),
            ]
        );
        assert!(!state.active);
        assert_eq!(
            state.on_tick(Instant::now() + Duration::from_secs(60)),
            TickDecision::Skip(SkipReason::Inactive)
        );
    }

    #[test]
    fn test_zero_grace_stops_on_first_terminal() {
        let mut state = PollingState::new("c", policy(0));
        let outcomes = run_statuses(&mut state, &[ConversationStatus::Failed]);
        assert_eq!(outcomes, vec![PollOutcome::Stop(StopReason::GraceExhausted)]);
    }

    #[test]
    fn test_failures_after_terminal_count_toward_grace() {
        let mut state = PollingState::new("c", policy(2));
        let now = Instant::now();
        state.on_tick(now);
        assert_eq!(state.on_success(Some(ConversationStatus::Completed)), PollOutcome::Continue);
        state.on_tick(now + Duration::from_secs(2));
        assert_eq!(state.on_failure(), PollOutcome::Continue);
        state.on_tick(now + Duration::from_secs(4));
        assert_eq!(state.on_failure(), PollOutcome::Stop(StopReason::GraceExhausted));
    }

    #[test]
    fn test_max_polls_cap() {
        let mut state = PollingState::new(
            "c",
            PollPolicy {
                max_polls: Some(2),
                ..policy(2)
            },
        );
        let outcomes = run_statuses(
            &mut state,
            &[ConversationStatus::Processing, ConversationStatus::Processing],
        );
        assert_eq!(outcomes[1], PollOutcome::Stop(StopReason::MaxPolls));
    }

    #[test]
    fn test_interval_clamped() {
        let policy = PollPolicy {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(policy.effective_interval() > Duration::ZERO);
    }

    /// Backend that replays scripted status documents, repeating the last one.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Option<serde_json::Value>>>,
        last: Mutex<Option<serde_json::Value>>,
        fetches: Mutex<u32>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Option<serde_json::Value>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                fetches: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn submit_query(&self, _request: &QueryRequest) -> weft_api::Result<QueryAccepted> {
            QueryAccepted::from_value(json!({"conversation_id": "c"}))
        }

        async fn fetch_status(
            &self,
            _conversation_id: &str,
        ) -> weft_api::Result<Option<ConversationSnapshot>> {
            *self.fetches.lock() += 1;
            let next = self.script.lock().pop_front();
            let value = match next {
                Some(value) => {
                    *self.last.lock() = value.clone();
                    value
                }
                None => self.last.lock().clone(),
            };
            match value {
                Some(value) => ConversationSnapshot::from_value(value).map(Some),
                None => Err(weft_api::Error::api(503, "unavailable")),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(Option<ConversationStatus>, bool)>>>,
        stopped: Arc<Mutex<Option<StopReason>>>,
    }

    #[async_trait]
    impl PollHandler for Recorder {
        async fn on_fetched(&mut self, fetched: Fetched, last_poll: bool) -> Option<StopReason> {
            let status = fetched.ok().flatten().map(|s| s.status);
            self.seen.lock().push((status, last_poll));
            None
        }

        async fn on_stopped(&mut self, reason: StopReason) {
            *self.stopped.lock() = Some(reason);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_polls_until_grace_exhausted() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Some(json!({"status": "processing"})),
            Some(json!({"status": "completed"})),
        ]));
        let scheduler = PollingScheduler::new(backend.clone(), policy(2));
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let stopped = Arc::clone(&recorder.stopped);

        let handle = scheduler.start("c", recorder);
        handle.wait_for_stop().await;

        assert_eq!(*backend.fetches.lock(), 4);
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3], (Some(ConversationStatus::Completed), true));
        assert!(seen[..3].iter().all(|(_, last)| !last));
        assert_eq!(*stopped.lock(), Some(StopReason::GraceExhausted));
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_survives_fetch_failures() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            None,
            None,
            Some(json!({"status": "completed"})),
        ]));
        let scheduler = PollingScheduler::new(backend.clone(), policy(0));
        let handle = scheduler.start("c", Recorder::default());
        handle.wait_for_stop().await;

        assert_eq!(*backend.fetches.lock(), 3);
        assert_eq!(handle.polling_state().total_polls, 3);
    }

    /// Backend whose fetch blocks until released
    #[derive(Default)]
    struct GatedBackend {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        fetches: Mutex<u32>,
    }

    #[async_trait]
    impl Backend for GatedBackend {
        async fn submit_query(&self, _request: &QueryRequest) -> weft_api::Result<QueryAccepted> {
            QueryAccepted::from_value(json!({"conversation_id": "c"}))
        }

        async fn fetch_status(
            &self,
            _conversation_id: &str,
        ) -> weft_api::Result<Option<ConversationSnapshot>> {
            *self.fetches.lock() += 1;
            self.entered.notify_one();
            self.release.notified().await;
            ConversationSnapshot::from_value(json!({
                "status": "completed",
                "message": "too late",
                "tasks": [{"id": "t1", "status": "completed", "result": "too late"}]
            }))
            .map(Some)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_of_outstanding_fetch_discarded_after_stop() {
        let backend = Arc::new(GatedBackend::default());
        let scheduler = PollingScheduler::new(backend.clone(), policy(2));
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let stopped = Arc::clone(&recorder.stopped);
        let handle = scheduler.start("c", recorder);

        backend.entered.notified().await;
        handle.stop();
        backend.release.notify_one();
        handle.wait_for_stop().await;

        assert_eq!(*backend.fetches.lock(), 1);
        assert!(seen.lock().is_empty());
        assert_eq!(*stopped.lock(), Some(StopReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_session_appends_nothing_from_outstanding_fetch() {
        let backend = Arc::new(GatedBackend::default());
        let scheduler = PollingScheduler::new(backend.clone(), policy(2));
        let store = TranscriptStore::new();
        let (tx, mut rx) = tokio::sync::broadcast::channel(64);
        let session = ConversationSession::new("c", store.clone(), scheduler.policy(), tx);
        let handle = scheduler.start("c", session);

        backend.entered.notified().await;
        handle.stop();
        backend.release.notify_one();
        handle.wait_for_stop().await;

        assert!(store.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::SessionStopped {
                reason: StopReason::Cancelled,
                ..
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_polling() {
        let backend = Arc::new(ScriptedBackend::new(vec![Some(json!({"status": "processing"}))]));
        let scheduler = PollingScheduler::new(backend.clone(), policy(2));
        let recorder = Recorder::default();
        let stopped = Arc::clone(&recorder.stopped);
        let handle = scheduler.start("c", recorder);

        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.stop();
        assert!(handle.wait_for_stop_timeout(Duration::from_secs(1)).await);

        let fetches = *backend.fetches.lock();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*backend.fetches.lock(), fetches);
        assert_eq!(*stopped.lock(), Some(StopReason::Cancelled));
        assert!(!handle.polling_state().active);
    }
}

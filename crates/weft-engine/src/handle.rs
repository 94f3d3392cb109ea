//! A cloneable handle for controlling a running session from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::events::StopReason;
use crate::scheduler::PollingState;

/// A cloneable handle for controlling a running session.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) conversation_id: Arc<str>,
    pub(crate) cancel: CancellationToken,
    pub(crate) cancel_reason: Arc<Mutex<Option<StopReason>>>,
    pub(crate) nudge: Arc<Notify>,
    pub(crate) idle_notify: Arc<Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
    pub(crate) state: Arc<Mutex<PollingState>>,
}

impl SessionHandle {
    pub(crate) fn new(state: PollingState) -> Self {
        Self {
            conversation_id: Arc::from(state.conversation_id.as_str()),
            cancel: CancellationToken::new(),
            cancel_reason: Arc::new(Mutex::new(None)),
            nudge: Arc::new(Notify::new()),
            idle_notify: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Stop polling. Takes effect before the next tick; a fetch already in
    /// flight finishes and its result is discarded.
    pub fn stop(&self) {
        self.stop_with(StopReason::Cancelled);
    }

    pub(crate) fn stop_with(&self, reason: StopReason) {
        self.cancel_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }

    pub(crate) fn cancel_reason(&self) -> StopReason {
        self.cancel_reason.lock().unwrap_or(StopReason::Cancelled)
    }

    /// Ask for a poll now instead of at the next tick. Ignored if the last
    /// successful poll was less than one interval ago.
    pub fn poll_now(&self) {
        self.nudge.notify_one();
    }

    /// Copy of the scheduler state
    pub fn polling_state(&self) -> PollingState {
        self.state.lock().clone()
    }

    /// Whether the session is still polling.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Wait until the session stops polling.
    pub async fn wait_for_stop(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until the session stops, with a timeout.
    /// Returns `true` if it stopped, `false` on timeout.
    pub async fn wait_for_stop_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_stop())
            .await
            .is_ok()
    }

    pub(crate) fn mark_stopped(&self) {
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("conversation_id", &self.conversation_id)
            .field("is_running", &self.is_running())
            .finish()
    }
}

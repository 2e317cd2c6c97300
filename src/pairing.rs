//! Pairing State Machine (spec §4.9): one instance per protocol, owns
//! the permit-join window and the timeout race.
//!
//! Grounded on `plugin_orchestrator.rs`'s interval/cancellation shape;
//! the cancellation token itself is `tokio_util::sync::CancellationToken`,
//! drawn in from `wayle`'s dependency set since the teacher has no
//! trait-object-free equivalent of its own.

use std::sync::Mutex;

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Open,
}

/// Stage emitted on `homenavi/hdp/pairing/progress/<protocol>` (spec §4.9).
#[derive(Debug, Clone, PartialEq)]
pub enum PairingStage {
    DeviceJoined,
    DeviceAnnounced,
    InterviewStarted,
    InterviewSucceeded,
    InterviewFailed,
    Timeout,
}

impl PairingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingStage::DeviceJoined => "device_joined",
            PairingStage::DeviceAnnounced => "device_announced",
            PairingStage::InterviewStarted => "interview_started",
            PairingStage::InterviewSucceeded => "interview_succeeded",
            PairingStage::InterviewFailed => "interview_failed",
            PairingStage::Timeout => "timeout",
        }
    }
}

struct Session {
    state: PairingState,
    cancel: Option<CancellationToken>,
}

/// At most one pairing session per protocol (spec §3 Pairing Session).
/// The mutex is held only to flip `state` and store/clear the cancel
/// handle (spec §5).
pub struct PairingStateMachine {
    session: Mutex<Session>,
}

impl Default for PairingStateMachine {
    fn default() -> Self {
        Self {
            session: Mutex::new(Session {
                state: PairingState::Idle,
                cancel: None,
            }),
        }
    }
}

impl PairingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PairingState {
        self.session.lock().unwrap().state
    }

    /// Starts the pairing window. No-op if already `Open` (spec §4.9
    /// guard; §7.8 lockout policy). `timeout_s <= 0` defaults to
    /// [`DEFAULT_TIMEOUT_SECS`]. Returns the cancellation token the
    /// caller should race a timer against if a new window was opened.
    pub fn start(&self, timeout_s: i64) -> Option<CancellationToken> {
        let mut session = self.session.lock().unwrap();
        if session.state == PairingState::Open {
            return None;
        }
        let token = CancellationToken::new();
        session.state = PairingState::Open;
        session.cancel = Some(token.clone());
        Some(token)
    }

    /// Effective timeout for a `start(timeout_s)` call.
    pub fn effective_timeout(timeout_s: i64) -> Duration {
        if timeout_s <= 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(timeout_s as u64)
        }
    }

    /// Stops the pairing window, if open, and cancels its timer.
    /// No-op in `Idle` (spec §4.9 guard; §7.8 lockout policy).
    pub fn stop(&self) -> bool {
        let mut session = self.session.lock().unwrap();
        if session.state == PairingState::Idle {
            return false;
        }
        session.state = PairingState::Idle;
        if let Some(cancel) = session.cancel.take() {
            cancel.cancel();
        }
        true
    }

    /// Forces `Open -> Idle`, e.g. from the adapter's `Stop()` (spec
    /// §4.9 "Cancellation").
    pub fn force_idle(&self) {
        self.stop();
    }

    /// Called by the timer task when it wins the race against
    /// cancellation; transitions `Open -> Idle` only if no explicit
    /// stop happened first.
    pub fn expire(&self) -> bool {
        let mut session = self.session.lock().unwrap();
        if session.state != PairingState::Open {
            return false;
        }
        session.state = PairingState::Idle;
        session.cancel = None;
        true
    }
}

/// Races `timeout` against `cancel`; returns `true` if the timeout won
/// (the caller should then call [`PairingStateMachine::expire`] and
/// emit `stage="timeout"`).
pub async fn race_timeout(cancel: CancellationToken, timeout: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            debug!(?timeout, "pairing window timed out");
            true
        }
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_in_open_is_a_no_op() {
        let sm = PairingStateMachine::new();
        assert!(sm.start(60).is_some());
        assert!(sm.start(60).is_none());
        assert_eq!(sm.state(), PairingState::Open);
    }

    #[test]
    fn stop_in_idle_is_a_no_op() {
        let sm = PairingStateMachine::new();
        assert!(!sm.stop());
        assert_eq!(sm.state(), PairingState::Idle);
    }

    #[test]
    fn default_timeout_applies_when_non_positive() {
        assert_eq!(
            PairingStateMachine::effective_timeout(0),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
        assert_eq!(
            PairingStateMachine::effective_timeout(-5),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
        assert_eq!(
            PairingStateMachine::effective_timeout(30),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn stop_cancels_the_timer_before_it_fires() {
        let sm = PairingStateMachine::new();
        let token = sm.start(60).unwrap();
        sm.stop();
        let timed_out = race_timeout(token, Duration::from_millis(20)).await;
        assert!(!timed_out);
    }

    #[tokio::test]
    async fn timer_expires_when_not_cancelled() {
        let sm = PairingStateMachine::new();
        let token = sm.start(60).unwrap();
        let timed_out = race_timeout(token, Duration::from_millis(5)).await;
        assert!(timed_out);
        assert!(sm.expire());
        assert_eq!(sm.state(), PairingState::Idle);
    }
}

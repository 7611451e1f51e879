//! Shared run state.
//!
//! One `RunState` exists per session, owned by the controller and handed out
//! as cheap clones to the control loop, the safety supervisor, the dialog
//! watchdog, and the recovery coordinator. All mutation goes through a single
//! mutex, so concurrent writers converge: every event is counted exactly once
//! and the stop transition happens exactly once no matter how many threads
//! race for it.
//!
//! Invariants held here:
//! - automation enabled implies the session is running
//! - paused implies the session is running
//! - the recorded stop reason is the first one reported, later ones are kept
//!   only as counter increments

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::safety::{SafetyEventKind, SafetyLevel};

/// Why automation stopped. Terminal reasons end the session; `UserActivity`
/// is recoverable once the operator settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserActivity,
    EmergencyStop,
    UnexpectedDialog,
    WindowLost,
    Manual,
}

impl StopReason {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StopReason::UserActivity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::UserActivity => "user_activity",
            StopReason::EmergencyStop => "emergency_stop",
            StopReason::UnexpectedDialog => "unexpected_dialog",
            StopReason::WindowLost => "window_lost",
            StopReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub actions_executed: u64,
    pub observations_made: u64,
    pub errors_count: u64,
    pub mouse_events: u64,
    pub keyboard_events: u64,
    pub emergency_stops: u64,
    pub total_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug)]
struct StateInner {
    phase: Phase,
    automation_enabled: bool,
    monitoring_enabled: bool,
    safety_level: SafetyLevel,
    stop_reason: Option<StopReason>,
    counters: Counters,
}

/// Point-in-time copy of the state, safe to read without holding the lock.
#[derive(Debug, Clone, Copy)]
pub struct StateSnapshot {
    pub is_running: bool,
    pub is_paused: bool,
    pub automation_enabled: bool,
    pub monitoring_enabled: bool,
    pub safety_level: SafetyLevel,
    pub stop_reason: Option<StopReason>,
    pub counters: Counters,
}

#[derive(Debug, Clone)]
pub struct RunState {
    inner: Arc<Mutex<StateInner>>,
}

impl RunState {
    pub fn new(safety_level: SafetyLevel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                phase: Phase::Idle,
                automation_enabled: false,
                monitoring_enabled: false,
                safety_level,
                stop_reason: None,
                counters: Counters::default(),
            })),
        }
    }

    /// Idle -> Running. Automation stays off until explicitly enabled.
    pub fn begin_session(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Idle {
            return false;
        }
        inner.phase = Phase::Running;
        true
    }

    /// Turns automation on. Clears a previous recoverable stop reason so the
    /// control loop resumes its decision cycle. Refuses outright when a
    /// terminal stop is on record: terminal means terminal, no matter who
    /// asks afterwards.
    pub fn enable_automation(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.phase, Phase::Running | Phase::Paused) {
            return false;
        }
        if inner.stop_reason.is_some_and(StopReason::is_terminal) {
            return false;
        }
        inner.automation_enabled = true;
        inner.stop_reason = None;
        true
    }

    /// Turns automation off. The recorded reason is the first one reported,
    /// except that a terminal reason upgrades a recoverable one — a session
    /// already parked on user activity must not forget a terminal stop that
    /// arrives while it waits. Returns true only for the call that performed
    /// the transition; concurrent callers get false.
    pub fn stop_automation(&self, reason: StopReason) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.stop_reason {
            None => inner.stop_reason = Some(reason),
            Some(existing) if !existing.is_terminal() && reason.is_terminal() => {
                inner.stop_reason = Some(reason);
            }
            Some(_) => {}
        }
        if !inner.automation_enabled {
            return false;
        }
        inner.automation_enabled = false;
        true
    }

    pub fn pause(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Running {
            return false;
        }
        inner.phase = Phase::Paused;
        true
    }

    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Paused {
            return false;
        }
        inner.phase = Phase::Running;
        true
    }

    /// Ends the session. Idempotent: only the first call returns true, so the
    /// caller can gate its session-end bookkeeping on the result.
    pub fn stop_session(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.phase, Phase::Running | Phase::Paused) {
            return false;
        }
        inner.phase = Phase::Stopped;
        inner.automation_enabled = false;
        inner.monitoring_enabled = false;
        if inner.stop_reason.is_none() {
            inner.stop_reason = Some(StopReason::Manual);
        }
        true
    }

    pub fn set_monitoring(&self, enabled: bool) {
        self.inner.lock().unwrap().monitoring_enabled = enabled;
    }

    pub fn record_safety_event(&self, kind: SafetyEventKind) {
        let mut inner = self.inner.lock().unwrap();
        match kind {
            SafetyEventKind::MouseMove | SafetyEventKind::MouseClick => {
                inner.counters.mouse_events += 1;
            }
            SafetyEventKind::KeyboardInput => inner.counters.keyboard_events += 1,
            SafetyEventKind::EmergencyStop => inner.counters.emergency_stops += 1,
        }
        inner.counters.total_events += 1;
    }

    pub fn record_observation(&self) {
        self.inner.lock().unwrap().counters.observations_made += 1;
    }

    pub fn record_action(&self) {
        self.inner.lock().unwrap().counters.actions_executed += 1;
    }

    pub fn record_cycle_error(&self) {
        self.inner.lock().unwrap().counters.errors_count += 1;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        StateSnapshot {
            is_running: matches!(inner.phase, Phase::Running | Phase::Paused),
            is_paused: inner.phase == Phase::Paused,
            automation_enabled: inner.automation_enabled,
            monitoring_enabled: inner.monitoring_enabled,
            safety_level: inner.safety_level,
            stop_reason: inner.stop_reason,
            counters: inner.counters,
        }
    }
}

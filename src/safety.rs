//! Operator-activity detection and the safety supervisor thread.
//!
//! The detector is a pure state machine over an injected clock and input
//! probe: feed it polls, get back safety events. The supervisor wraps it in a
//! background thread that forwards events to the router and trips into a
//! suspended state after emitting, staying quiet until recovery rearms it.
//!
//! Event rules:
//! - the emergency key always fires, bypassing grace period and debounce
//! - during the grace period after (re)arming, operator activity is ignored
//!   but pointer position keeps being tracked
//! - pointer travel below the movement threshold is jitter and never fires,
//!   though it still updates the last known position
//! - each event kind is debounced independently

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SafetySettings;
use crate::errors::CoreError;
use crate::ports::InputProbe;

const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_millis(1500);

/// How aggressively the supervisor watches the operator.
///
/// `Disabled` skips the monitor thread entirely, `Low` checks only the
/// emergency key, `Medium` and `High` run every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Disabled,
    Low,
    Medium,
    High,
}

impl SafetyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyLevel::Disabled => "disabled",
            SafetyLevel::Low => "low",
            SafetyLevel::Medium => "medium",
            SafetyLevel::High => "high",
        }
    }
}

impl Default for SafetyLevel {
    fn default() -> Self {
        SafetyLevel::Medium
    }
}

impl FromStr for SafetyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(SafetyLevel::Disabled),
            "low" => Ok(SafetyLevel::Low),
            "medium" => Ok(SafetyLevel::Medium),
            "high" => Ok(SafetyLevel::High),
            other => Err(format!(
                "unknown safety level '{other}' (expected disabled, low, medium, or high)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyEventKind {
    MouseMove,
    MouseClick,
    KeyboardInput,
    EmergencyStop,
}

impl SafetyEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyEventKind::MouseMove => "mouse_move",
            SafetyEventKind::MouseClick => "mouse_click",
            SafetyEventKind::KeyboardInput => "keyboard_input",
            SafetyEventKind::EmergencyStop => "emergency_stop",
        }
    }

    /// Activity the operator can walk away from; everything except the
    /// emergency stop, which is terminal.
    pub fn is_user_activity(self) -> bool {
        !matches!(self, SafetyEventKind::EmergencyStop)
    }
}

#[derive(Debug, Clone)]
pub struct SafetyEvent {
    pub kind: SafetyEventKind,
    /// Wall-clock stamp for log readers. Grace, debounce, and every other
    /// timing decision go through the injected [`Clock`], which deals in
    /// monotonic `Instant`s and cannot mint calendar time; this field is
    /// the one place the detector reads the system clock directly.
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub emergency_key: String,
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub movement_threshold: f64,
    pub debounce: Duration,
}

impl SafetyConfig {
    pub fn from_settings(settings: &SafetySettings) -> Self {
        Self {
            emergency_key: settings.emergency_key.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            grace_period: Duration::from_millis(settings.grace_period_ms),
            movement_threshold: settings.movement_threshold_px,
            debounce: Duration::from_millis(settings.debounce_ms),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self::from_settings(&SafetySettings::default())
    }
}

/// Pure poll-driven detector. Owns all timing state; holds no locks and
/// spawns no threads.
pub struct ActivityDetector {
    config: SafetyConfig,
    level: SafetyLevel,
    clock: Arc<dyn Clock>,
    armed_at: Instant,
    last_pos: Option<(i32, i32)>,
    last_emitted: HashMap<SafetyEventKind, Instant>,
}

impl ActivityDetector {
    pub fn new(config: SafetyConfig, level: SafetyLevel, clock: Arc<dyn Clock>) -> Self {
        let armed_at = clock.now();
        Self {
            config,
            level,
            clock,
            armed_at,
            last_pos: None,
            last_emitted: HashMap::new(),
        }
    }

    /// Restarts the grace period and forgets debounce and pointer history.
    pub fn rearm(&mut self) {
        self.armed_at = self.clock.now();
        self.last_pos = None;
        self.last_emitted.clear();
    }

    pub fn poll(&mut self, probe: &dyn InputProbe) -> Vec<SafetyEvent> {
        let mut events = Vec::new();
        if self.level == SafetyLevel::Disabled {
            return events;
        }
        let now = self.clock.now();

        match probe.key_down(&self.config.emergency_key) {
            Ok(true) => {
                events.push(self.event(
                    SafetyEventKind::EmergencyStop,
                    format!("emergency key '{}' pressed", self.config.emergency_key),
                ));
                return events;
            }
            Ok(false) => {}
            // A failed query means no observed activity this tick.
            Err(e) => warn!(error = %e, "emergency key query failed"),
        }
        if self.level == SafetyLevel::Low {
            return events;
        }

        let in_grace = now.duration_since(self.armed_at) < self.config.grace_period;

        match probe.pointer_pos() {
            Ok(pos) => {
                if let Some(last) = self.last_pos {
                    let dx = f64::from(pos.0 - last.0);
                    let dy = f64::from(pos.1 - last.1);
                    let distance = (dx * dx + dy * dy).sqrt();
                    if !in_grace
                        && distance >= self.config.movement_threshold
                        && self.debounce_ok(SafetyEventKind::MouseMove, now)
                    {
                        self.last_emitted.insert(SafetyEventKind::MouseMove, now);
                        events.push(self.event(
                            SafetyEventKind::MouseMove,
                            format!("pointer moved {distance:.0}px"),
                        ));
                    }
                }
                self.last_pos = Some(pos);
            }
            Err(e) => warn!(error = %e, "pointer position query failed"),
        }

        if !in_grace {
            match probe.pointer_button_down() {
                Ok(true) if self.debounce_ok(SafetyEventKind::MouseClick, now) => {
                    self.last_emitted.insert(SafetyEventKind::MouseClick, now);
                    events.push(
                        self.event(SafetyEventKind::MouseClick, "mouse button pressed".to_string()),
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "mouse button query failed"),
            }

            match probe.any_key_down() {
                Ok(true) if self.debounce_ok(SafetyEventKind::KeyboardInput, now) => {
                    self.last_emitted
                        .insert(SafetyEventKind::KeyboardInput, now);
                    events
                        .push(self.event(SafetyEventKind::KeyboardInput, "key pressed".to_string()));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "keyboard query failed"),
            }
        }

        events
    }

    fn debounce_ok(&self, kind: SafetyEventKind, now: Instant) -> bool {
        match self.last_emitted.get(&kind) {
            Some(last) => now.duration_since(*last) >= self.config.debounce,
            None => true,
        }
    }

    fn event(&self, kind: SafetyEventKind, detail: String) -> SafetyEvent {
        SafetyEvent {
            kind,
            timestamp: Utc::now(),
            detail,
        }
    }
}

struct SupervisorShared {
    suspended: AtomicBool,
    detector: Mutex<ActivityDetector>,
}

/// Background thread polling the input probe at the configured interval.
///
/// After emitting events the supervisor suspends itself so a single burst of
/// operator activity produces one trip, not a stream; recovery calls `rearm`
/// to resume watching with a fresh grace period.
pub struct SafetySupervisor {
    shared: Arc<SupervisorShared>,
    stop: Arc<AtomicBool>,
    done_rx: Mutex<Receiver<()>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SafetySupervisor {
    /// Returns `None` when the level is `Disabled`: no thread, no polling.
    pub fn start(
        config: SafetyConfig,
        level: SafetyLevel,
        probe: Box<dyn InputProbe>,
        clock: Arc<dyn Clock>,
        on_event: Arc<dyn Fn(SafetyEvent) + Send + Sync>,
    ) -> Option<Self> {
        if level == SafetyLevel::Disabled {
            info!("safety level is disabled; supervisor not started");
            return None;
        }

        let poll_interval = config.poll_interval;
        let shared = Arc::new(SupervisorShared {
            suspended: AtomicBool::new(false),
            detector: Mutex::new(ActivityDetector::new(config, level, clock.clone())),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let thread_shared = Arc::clone(&shared);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            info!(level = level.as_str(), "safety supervisor started");
            while !thread_stop.load(Ordering::Relaxed) {
                if thread_shared.suspended.load(Ordering::Relaxed) {
                    clock.sleep(poll_interval);
                    continue;
                }
                let events = thread_shared.detector.lock().unwrap().poll(probe.as_ref());
                let tripped = !events.is_empty();
                for event in events {
                    on_event(event);
                }
                if tripped {
                    // One trip per burst; recovery rearms us.
                    thread_shared.suspended.store(true, Ordering::Relaxed);
                }
                clock.sleep(poll_interval);
            }
            debug!("safety supervisor exiting");
            let _ = done_tx.send(());
        });

        Some(Self {
            shared,
            stop,
            done_rx: Mutex::new(done_rx),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Relaxed)
    }

    /// Resets the detector (fresh grace period, cleared debounce history) and
    /// resumes polling.
    pub fn rearm(&self) {
        self.shared.detector.lock().unwrap().rearm();
        self.shared.suspended.store(false, Ordering::Relaxed);
        debug!("safety supervisor rearmed");
    }

    /// Signals the thread and waits for it with a bounded timeout.
    pub fn stop(&self) -> Result<(), CoreError> {
        self.stop.store(true, Ordering::Relaxed);
        let done_rx = self.done_rx.lock().unwrap();
        match done_rx.recv_timeout(SUPERVISOR_JOIN_TIMEOUT) {
            Ok(()) => {
                if let Some(handle) = self.handle.lock().unwrap().take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(_) => Err(CoreError::JoinTimeout {
                thread: "safety-supervisor",
                timeout_ms: SUPERVISOR_JOIN_TIMEOUT.as_millis() as u64,
            }),
        }
    }
}

//! Automatic recovery after operator activity.
//!
//! When the safety supervisor trips on recoverable activity, the router
//! schedules a recovery attempt here. The attempt waits for the activity to
//! settle, puts the target window back in front, rearms the supervisor with a
//! fresh grace period, and re-enables automation so the control loop resumes.
//! At most one attempt is in flight at a time; while one is pending, further
//! schedule calls are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::WindowConfig;
use crate::log::{LogEvent, SessionLog};
use crate::ports::WindowActivator;
use crate::safety::SafetySupervisor;
use crate::state::{RunState, StopReason};

pub struct RecoveryCoordinator {
    settle_delay: Duration,
    state: RunState,
    log: Arc<SessionLog>,
    clock: Arc<dyn Clock>,
    activator: Arc<dyn WindowActivator>,
    window: WindowConfig,
    // Attached after the supervisor exists; the supervisor's callback chain
    // reaches back here, so construction order forces the late binding.
    supervisor: Mutex<Option<Arc<SafetySupervisor>>>,
    in_flight: AtomicBool,
}

impl RecoveryCoordinator {
    pub fn new(
        settle_delay: Duration,
        state: RunState,
        log: Arc<SessionLog>,
        clock: Arc<dyn Clock>,
        activator: Arc<dyn WindowActivator>,
        window: WindowConfig,
    ) -> Self {
        Self {
            settle_delay,
            state,
            log,
            clock,
            activator,
            window,
            supervisor: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn attach_supervisor(&self, supervisor: Arc<SafetySupervisor>) {
        *self.supervisor.lock().unwrap() = Some(supervisor);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Kicks off a recovery attempt on a fresh thread unless one is already
    /// pending.
    pub fn schedule(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("recovery already in flight");
            return;
        }
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            this.run();
            this.in_flight.store(false, Ordering::SeqCst);
        });
    }

    fn run(&self) {
        self.log.record(LogEvent::RecoveryStarted {
            reason: "user_activity".to_string(),
        });
        info!(
            settle_secs = self.settle_delay.as_secs_f64(),
            "waiting for operator activity to settle"
        );
        self.clock.sleep(self.settle_delay);

        let window_active = if self.window.enabled {
            match self.activator.ensure_active(&self.window) {
                Ok(active) => active,
                Err(e) => {
                    warn!(error = %e, "window activation failed during recovery");
                    false
                }
            }
        } else {
            true
        };

        let mut automation_resumed = false;
        let snap = self.state.snapshot();
        let terminal = snap.stop_reason.is_some_and(StopReason::is_terminal);
        if terminal {
            // A terminal stop landed while the settle delay was pending;
            // leave the session exactly as the stop left it.
            debug!(reason = ?snap.stop_reason, "terminal stop recorded; recovery abandoned");
        } else if snap.is_running {
            if !snap.monitoring_enabled {
                if let Some(supervisor) = self.supervisor.lock().unwrap().as_ref() {
                    supervisor.rearm();
                    self.state.set_monitoring(true);
                }
            }
            if !snap.automation_enabled {
                automation_resumed = self.state.enable_automation();
            }
        } else {
            debug!("session ended before recovery completed");
        }

        self.log.record(LogEvent::RecoveryCompleted {
            window_active,
            automation_resumed,
        });
        if automation_resumed {
            info!("automation resumed after recovery");
        }
    }
}

//! Session orchestration and the perceive -> decide -> act control loop.
//!
//! `Controller::start` wires everything for one session: loads the profile,
//! activates the target window, opens the session log, starts the safety
//! supervisor and dialog watchdog, then spawns the control loop. The loop
//! parks while automation is disabled for a recoverable reason and exits on
//! a terminal stop, so recovery can hand control back without respawning it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{DetectionConfig, HumanizeSettings, Profile, ProfileStore};
use crate::dialog::DialogWatchdog;
use crate::errors::CoreError;
use crate::log::{LogEvent, SessionLog};
use crate::ports::{
    Action, Capture, EmptyWindowProbe, IdleProbe, Input, InputProbe, NoopActivator, NullCapture,
    NullInput, NullPointer, NullVision, Observation, PointerInput, Region, Vision,
    WindowActivator, WindowProbe,
};
use crate::recovery::RecoveryCoordinator;
use crate::router::EventRouter;
use crate::safety::{SafetyConfig, SafetyLevel, SafetySupervisor};
use crate::state::{Counters, RunState, StopReason};

const LOOP_JOIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Everything platform-specific a session needs, bundled for `start`.
pub struct Backends {
    pub capture: Box<dyn Capture>,
    pub vision: Box<dyn Vision>,
    pub input: Arc<dyn Input>,
    pub activator: Arc<dyn WindowActivator>,
    pub input_probe: Box<dyn InputProbe>,
    pub window_probe: Box<dyn WindowProbe>,
    pub pointer: Box<dyn PointerInput>,
}

impl Backends {
    /// Inert collaborators: empty frames, no detections, recorded actions,
    /// a still operator, and a desktop without dialogs.
    pub fn dry_run() -> Self {
        Self {
            capture: Box::new(NullCapture),
            vision: Box::new(NullVision),
            input: Arc::new(NullInput::default()),
            activator: Arc::new(NoopActivator),
            input_probe: Box::new(IdleProbe),
            window_probe: Box::new(EmptyWindowProbe),
            pointer: Box::new(NullPointer::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub is_running: bool,
    pub is_paused: bool,
    pub automation_enabled: bool,
    pub monitoring_enabled: bool,
    pub safety_level: String,
    pub profile: Option<String>,
    pub uptime_secs: f64,
    pub stop_reason: Option<StopReason>,
    pub stats: Counters,
}

impl Status {
    fn idle(safety_level: SafetyLevel) -> Self {
        Self {
            is_running: false,
            is_paused: false,
            automation_enabled: false,
            monitoring_enabled: false,
            safety_level: safety_level.as_str().to_string(),
            profile: None,
            uptime_secs: 0.0,
            stop_reason: None,
            stats: Counters::default(),
        }
    }
}

struct Session {
    profile_name: String,
    profile: Profile,
    state: RunState,
    log: Arc<SessionLog>,
    input: Arc<dyn Input>,
    activator: Arc<dyn WindowActivator>,
    supervisor: Option<Arc<SafetySupervisor>>,
    watchdog: Option<DialogWatchdog>,
    loop_stop: Arc<AtomicBool>,
    loop_done: Receiver<()>,
    loop_handle: Option<JoinHandle<()>>,
    started_at: Instant,
}

pub struct Controller {
    profiles: ProfileStore,
    logs_dir: PathBuf,
    safety_level: SafetyLevel,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<Session>>,
}

impl Controller {
    pub fn new(
        profiles: ProfileStore,
        logs_dir: impl Into<PathBuf>,
        safety_level: SafetyLevel,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            profiles,
            logs_dir: logs_dir.into(),
            safety_level,
            clock,
            session: Mutex::new(None),
        }
    }

    /// Starts a session for `profile_name`. Fails fast on a missing or
    /// invalid profile, an already-active session, or a missing target
    /// window; after this returns the monitors and the control loop run on
    /// their own threads.
    pub fn start(&self, profile_name: &str, backends: Backends) -> Result<(), CoreError> {
        let mut slot = self.session.lock().unwrap();
        if let Some(session) = slot.as_ref() {
            if session.state.snapshot().is_running {
                return Err(CoreError::AlreadyRunning);
            }
        }

        let profile = self.profiles.load(profile_name)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let log_path = self.logs_dir.join(format!("{profile_name}-{session_id}.jsonl"));
        let log = Arc::new(SessionLog::new(&log_path)?);
        let state = RunState::new(self.safety_level);

        if profile.window.enabled {
            if !backends.activator.ensure_active(&profile.window)? {
                return Err(CoreError::WindowNotFound);
            }
            self.clock
                .sleep(Duration::from_millis(profile.window.activation_delay_ms));
        }

        state.begin_session();
        log.record(LogEvent::SessionStarted {
            session_id: session_id.clone(),
            profile: profile_name.to_string(),
            safety_level: self.safety_level.as_str().to_string(),
        });
        info!(
            session_id = %session_id,
            profile = profile_name,
            safety_level = self.safety_level.as_str(),
            log = %log_path.display(),
            "session starting"
        );

        let recovery = Arc::new(RecoveryCoordinator::new(
            Duration::from_millis(profile.safety.settle_delay_ms),
            state.clone(),
            log.clone(),
            self.clock.clone(),
            backends.activator.clone(),
            profile.window.clone(),
        ));
        let router = Arc::new(EventRouter::new(
            state.clone(),
            log.clone(),
            profile.safety.auto_recover.then(|| recovery.clone()),
        ));

        let safety_router = router.clone();
        let supervisor = SafetySupervisor::start(
            SafetyConfig::from_settings(&profile.safety),
            self.safety_level,
            backends.input_probe,
            self.clock.clone(),
            Arc::new(move |event| safety_router.on_safety_event(&event)),
        )
        .map(Arc::new);
        if let Some(supervisor) = &supervisor {
            state.set_monitoring(true);
            recovery.attach_supervisor(supervisor.clone());
        }

        let dialog_router = router.clone();
        let watchdog = DialogWatchdog::start(
            &profile.dialogs,
            self.clock.clone(),
            backends.window_probe,
            backends.pointer,
            Arc::new(move |outcome| dialog_router.on_dialog_outcome(&outcome)),
        );

        state.enable_automation();

        let loop_stop = Arc::new(AtomicBool::new(false));
        let (done_tx, loop_done) = mpsc::channel();
        let context = LoopContext {
            state: state.clone(),
            log: log.clone(),
            clock: self.clock.clone(),
            capture: backends.capture,
            vision: backends.vision,
            input: backends.input.clone(),
            region: profile.screen_region,
            detection: {
                let mut detection = profile.detection.clone();
                detection.confidence_threshold = profile.controller.confidence_threshold;
                detection
            },
            attack_key: profile
                .keymap
                .get("attack")
                .cloned()
                .unwrap_or_else(|| "q".to_string()),
            tick: cycle_tick(&profile),
            action_cooldown: Duration::from_millis(profile.controller.action_cooldown_ms),
            last_action_at: None,
            stop: loop_stop.clone(),
            done: done_tx,
        };
        let loop_handle = std::thread::spawn(move || run_control_loop(context));

        let session = Session {
            profile_name: profile_name.to_string(),
            profile,
            state,
            log,
            input: backends.input,
            activator: backends.activator,
            supervisor,
            watchdog,
            loop_stop,
            loop_done,
            loop_handle: Some(loop_handle),
            started_at: self.clock.now(),
        };

        if let Some(macro_name) = session.profile.strategy.auto_execute_macro.clone() {
            self.clock.sleep(Duration::from_millis(
                session.profile.strategy.execution_delay_ms,
            ));
            run_macro(&session, &macro_name);
        }

        *slot = Some(session);
        Ok(())
    }

    /// Ends the session: one state transition, bounded joins on all three
    /// threads, and exactly one session-end log entry. Safe to call any
    /// number of times.
    pub fn stop(&self) {
        let mut slot = self.session.lock().unwrap();
        let Some(session) = slot.as_mut() else {
            debug!("stop requested with no session");
            return;
        };

        let first_stop = session.state.stop_session();
        session.loop_stop.store(true, Ordering::Relaxed);

        if let Some(handle) = session.loop_handle.take() {
            match session.loop_done.recv_timeout(LOOP_JOIN_TIMEOUT) {
                Ok(()) => {
                    let _ = handle.join();
                }
                Err(_) => warn!("control loop did not exit in time; detaching"),
            }
        }
        if let Some(watchdog) = session.watchdog.take() {
            if let Err(e) = watchdog.stop() {
                warn!(error = %e, "dialog watchdog shutdown timed out");
            }
        }
        if let Some(supervisor) = session.supervisor.take() {
            if let Err(e) = supervisor.stop() {
                warn!(error = %e, "safety supervisor shutdown timed out");
            }
        }

        if first_stop {
            let snap = session.state.snapshot();
            let reason = snap
                .stop_reason
                .map(StopReason::as_str)
                .unwrap_or("manual")
                .to_string();
            let duration_secs = self
                .clock
                .now()
                .duration_since(session.started_at)
                .as_secs_f64();
            session.log.record(LogEvent::SessionEnded {
                profile: session.profile_name.clone(),
                duration_secs,
                reason: reason.clone(),
                counters: snap.counters,
            });
            info!(
                profile = %session.profile_name,
                reason = %reason,
                actions = snap.counters.actions_executed,
                observations = snap.counters.observations_made,
                errors = snap.counters.errors_count,
                "session ended"
            );
        }
    }

    pub fn pause(&self) -> bool {
        let slot = self.session.lock().unwrap();
        match slot.as_ref() {
            Some(session) if session.state.pause() => {
                info!("session paused");
                true
            }
            _ => false,
        }
    }

    pub fn resume(&self) -> bool {
        let slot = self.session.lock().unwrap();
        match slot.as_ref() {
            Some(session) if session.state.resume() => {
                info!("session resumed");
                true
            }
            _ => false,
        }
    }

    /// Plays a named macro from the active profile. Returns true only when
    /// every expanded action succeeded.
    pub fn execute_macro(&self, name: &str) -> bool {
        let slot = self.session.lock().unwrap();
        let Some(session) = slot.as_ref() else {
            warn!(macro_name = name, "no active session");
            return false;
        };
        run_macro(session, name)
    }

    pub fn status(&self) -> Status {
        let slot = self.session.lock().unwrap();
        let Some(session) = slot.as_ref() else {
            return Status::idle(self.safety_level);
        };
        let snap = session.state.snapshot();
        Status {
            is_running: snap.is_running,
            is_paused: snap.is_paused,
            automation_enabled: snap.automation_enabled,
            monitoring_enabled: snap.monitoring_enabled,
            safety_level: snap.safety_level.as_str().to_string(),
            profile: Some(session.profile_name.clone()),
            uptime_secs: self
                .clock
                .now()
                .duration_since(session.started_at)
                .as_secs_f64(),
            stop_reason: snap.stop_reason,
            stats: snap.counters,
        }
    }
}

/// Cycle interval: the fps limit, floored at the configured minimum tick.
fn cycle_tick(profile: &Profile) -> Duration {
    let from_fps = Duration::from_secs_f64(1.0 / f64::from(profile.controller.fps_limit.max(1)));
    from_fps.max(Duration::from_millis(profile.controller.minimum_tick_ms))
}

struct LoopContext {
    state: RunState,
    log: Arc<SessionLog>,
    clock: Arc<dyn Clock>,
    capture: Box<dyn Capture>,
    vision: Box<dyn Vision>,
    input: Arc<dyn Input>,
    region: Region,
    detection: DetectionConfig,
    attack_key: String,
    tick: Duration,
    action_cooldown: Duration,
    last_action_at: Option<Instant>,
    stop: Arc<AtomicBool>,
    done: Sender<()>,
}

fn run_control_loop(mut ctx: LoopContext) {
    info!(tick_ms = ctx.tick.as_millis() as u64, "control loop started");
    let mut cycle: u64 = 0;
    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }
        let snap = ctx.state.snapshot();
        if !snap.is_running || snap.stop_reason.is_some_and(StopReason::is_terminal) {
            break;
        }
        // Parked: paused, or stopped for a recoverable reason. Recovery
        // re-enables automation and the loop picks back up.
        if snap.is_paused || !snap.automation_enabled {
            ctx.clock.sleep(ctx.tick);
            continue;
        }

        cycle += 1;
        if let Err((step, error)) = execute_cycle(&mut ctx, cycle) {
            ctx.state.record_cycle_error();
            warn!(cycle, step, error = %error, "cycle failed; continuing");
            ctx.log.record(LogEvent::CycleError {
                cycle,
                step: step.to_string(),
                detail: error.to_string(),
            });
        }
        ctx.clock.sleep(ctx.tick);
    }
    info!("control loop stopped");
    let _ = ctx.done.send(());
}

/// One perceive -> decide -> act cycle. A failed step aborts the cycle, not
/// the loop; the error names the step for the log.
fn execute_cycle(ctx: &mut LoopContext, cycle: u64) -> Result<(), (&'static str, CoreError)> {
    let frame = ctx.capture.capture(&ctx.region).map_err(|e| ("capture", e))?;
    let observation = ctx
        .vision
        .process_observation(&frame, &ctx.detection)
        .map_err(|e| ("vision", e))?;
    ctx.state.record_observation();
    ctx.log.record(LogEvent::Observation {
        cycle,
        enemies: observation.enemies.len(),
        items: observation.items.len(),
    });

    if let Some(action) = decide(&observation, &ctx.attack_key) {
        // Observation rate and action rate are decoupled: a decided action
        // inside the cooldown window is dropped, not queued.
        let now = ctx.clock.now();
        let cooled = ctx
            .last_action_at
            .map_or(true, |at| now.duration_since(at) >= ctx.action_cooldown);
        if cooled {
            let outcome = ctx
                .input
                .execute_action(&action)
                .map_err(|e| ("input", e))?;
            ctx.last_action_at = Some(now);
            ctx.state.record_action();
            ctx.log.record(LogEvent::ActionExecuted {
                action,
                success: outcome.success,
                error: outcome.error,
            });
        }
    }
    Ok(())
}

fn decide(observation: &Observation, attack_key: &str) -> Option<Action> {
    if observation.enemies.is_empty() {
        return None;
    }
    Some(Action::Press {
        key: attack_key.to_string(),
    })
}

fn run_macro(session: &Session, name: &str) -> bool {
    let Some(steps) = session.profile.macros.get(name) else {
        warn!(macro_name = name, "macro not defined in profile");
        return false;
    };

    // Keep the target in front before injecting a burst of input. Losing it
    // mid-session is terminal.
    if session.profile.window.enabled {
        let active = session
            .activator
            .ensure_active(&session.profile.window)
            .unwrap_or(false);
        if !active {
            warn!(macro_name = name, "target window lost; stopping automation");
            session.state.stop_automation(StopReason::WindowLost);
            return false;
        }
    }

    let actions = expand_macro(steps, &session.profile.keymap, &session.profile.humanize);
    let mut succeeded = 0usize;
    for action in &actions {
        match session.input.execute_action(action) {
            Ok(outcome) => {
                session.state.record_action();
                if outcome.success {
                    succeeded += 1;
                }
                session.log.record(LogEvent::ActionExecuted {
                    action: action.clone(),
                    success: outcome.success,
                    error: outcome.error,
                });
            }
            Err(e) => {
                session.state.record_cycle_error();
                warn!(macro_name = name, error = %e, "macro action failed");
                session.log.record(LogEvent::ActionExecuted {
                    action: action.clone(),
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    info!(
        macro_name = name,
        succeeded,
        total = actions.len(),
        "macro executed"
    );
    succeeded == actions.len()
}

/// Expands macro steps into actions.
///
/// `key: name` presses the keymapped key (or the literal name when unmapped),
/// `type: text` types the text, and a bare item is looked up in the keymap
/// and skipped when absent. Humanized playback interleaves short waits.
fn expand_macro(
    steps: &[String],
    keymap: &std::collections::HashMap<String, String>,
    humanize: &HumanizeSettings,
) -> Vec<Action> {
    let mut actions = Vec::new();
    for step in steps {
        let action = if let Some(text) = step.strip_prefix("type: ") {
            Some(Action::Type {
                text: text.to_string(),
            })
        } else if let Some(name) = step.strip_prefix("key: ") {
            Some(Action::Press {
                key: keymap.get(name).cloned().unwrap_or_else(|| name.to_string()),
            })
        } else if let Some(key) = keymap.get(step) {
            Some(Action::Press { key: key.clone() })
        } else {
            debug!(step = %step, "macro step has no keymap entry; skipped");
            None
        };
        if let Some(action) = action {
            if humanize.enabled && !actions.is_empty() {
                let [min, max] = humanize.key_delay_ms;
                actions.push(Action::Wait { ms: (min + max) / 2 });
            }
            actions.push(action);
        }
    }
    actions
}

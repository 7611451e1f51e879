//! Dialog watchdog: detects popup dialogs, classifies them, and answers them.
//!
//! The scanner walks top-level windows (bounded per sweep), filters for
//! dialog-shaped ones, classifies their text, and checks the allow-list.
//! Expected dialogs get their affirmative button; everything else gets the
//! dismissive one. When no matching button exists the resolver falls back to
//! posting the standard dialog command. Buttons are clicked with an eased
//! pointer glide rather than a teleport.

pub mod classify;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DialogSettings;
use crate::errors::CoreError;
use crate::ports::{DialogCommand, PointerInput, WindowHandle, WindowProbe};

use classify::{DialogKind, ExpectationList};

const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Sweep at least this often regardless of the configured interval, so a
/// modal dialog never blocks the workflow for long.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

const CLICK_SETTLE: Duration = Duration::from_millis(200);
const BUTTON_HOLD: Duration = Duration::from_millis(50);

/// Pointer glides move roughly this many pixels per step.
const GLIDE_STEP_PX: f64 = 5.0;
const GLIDE_STEP_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct DialogRecord {
    pub handle: WindowHandle,
    pub title: String,
    pub content: String,
    pub classification: DialogKind,
    pub is_expected: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogResponse {
    Acknowledge,
    Dismiss,
}

impl DialogResponse {
    /// Button captions that count as this response, checked by substring.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            DialogResponse::Acknowledge => &["确定", "ok", "是", "yes"],
            DialogResponse::Dismiss => &["取消", "cancel", "否", "no"],
        }
    }

    pub fn command(self) -> DialogCommand {
        match self {
            DialogResponse::Acknowledge => DialogCommand::Ok,
            DialogResponse::Dismiss => DialogCommand::Cancel,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DialogResponse::Acknowledge => "acknowledge",
            DialogResponse::Dismiss => "dismiss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialogOutcome {
    pub record: DialogRecord,
    pub response: DialogResponse,
    /// True when no matching button was found and the command was posted
    /// directly instead.
    pub via_fallback: bool,
    pub clicked: bool,
}

/// Stateful sweep over top-level windows. Remembers which handles it already
/// answered so a slow-to-close dialog is not clicked twice.
pub struct DialogScanner {
    expectations: ExpectationList,
    max_windows: usize,
    handled: HashSet<WindowHandle>,
}

impl DialogScanner {
    pub fn new(expectations: ExpectationList, max_windows: usize) -> Self {
        Self {
            expectations,
            max_windows,
            handled: HashSet::new(),
        }
    }

    pub fn scan(&mut self, probe: &dyn WindowProbe) -> Vec<DialogRecord> {
        let windows = match probe.enumerate(self.max_windows) {
            Ok(windows) => windows,
            Err(e) => {
                warn!(error = %e, "window enumeration failed; skipping sweep");
                return Vec::new();
            }
        };

        // Forget handles that left the screen, so a reused handle value is
        // treated as a fresh dialog.
        let live: HashSet<WindowHandle> = windows.iter().map(|w| w.handle).collect();
        self.handled.retain(|h| live.contains(h));

        let mut records = Vec::new();
        for window in windows {
            if !window.visible || self.handled.contains(&window.handle) {
                continue;
            }
            if !classify::looks_like_dialog(&window.class_name, &window.title) {
                continue;
            }
            // One unreadable window must not abort the sweep.
            let content = match probe.static_text(window.handle) {
                Ok(content) => content,
                Err(e) => {
                    debug!(handle = window.handle, error = %e, "window text unreadable; skipping");
                    continue;
                }
            };
            let classification = classify::classify(&window.title, &content);
            // An unclassifiable dialog is never expected, allow-listed or not.
            let is_expected = classification != DialogKind::Unknown
                && self.expectations.is_expected(&window.title, &content);
            self.handled.insert(window.handle);
            records.push(DialogRecord {
                handle: window.handle,
                title: window.title,
                content,
                classification,
                is_expected,
                timestamp: Utc::now(),
            });
        }
        records
    }
}

/// Answers a detected dialog: expected dialogs are acknowledged, unexpected
/// ones dismissed.
pub fn resolve(
    record: &DialogRecord,
    probe: &dyn WindowProbe,
    pointer: &mut dyn PointerInput,
    clock: &dyn Clock,
) -> DialogOutcome {
    let response = if record.is_expected {
        DialogResponse::Acknowledge
    } else {
        DialogResponse::Dismiss
    };

    let buttons = match probe.buttons(record.handle) {
        Ok(buttons) => buttons,
        Err(e) => {
            warn!(handle = record.handle, error = %e, "button enumeration failed");
            Vec::new()
        }
    };
    let target = buttons.iter().find(|b| {
        let text = b.text.to_lowercase();
        response.candidates().iter().any(|c| text.contains(c))
    });

    match target {
        Some(button) => {
            let (x, y) = button.rect.center();
            match click_at(pointer, clock, x, y) {
                Ok(()) => {
                    info!(
                        title = %record.title,
                        button = %button.text,
                        response = response.as_str(),
                        "dialog answered by click"
                    );
                    DialogOutcome {
                        record: record.clone(),
                        response,
                        via_fallback: false,
                        clicked: true,
                    }
                }
                Err(e) => {
                    warn!(handle = record.handle, error = %e, "click failed; posting command");
                    post_fallback(record, probe, response)
                }
            }
        }
        None => post_fallback(record, probe, response),
    }
}

fn post_fallback(
    record: &DialogRecord,
    probe: &dyn WindowProbe,
    response: DialogResponse,
) -> DialogOutcome {
    if let Err(e) = probe.post_command(record.handle, response.command()) {
        warn!(handle = record.handle, error = %e, "dialog command post failed");
    } else {
        info!(
            title = %record.title,
            response = response.as_str(),
            "dialog answered by posted command"
        );
    }
    DialogOutcome {
        record: record.clone(),
        response,
        via_fallback: true,
        clicked: false,
    }
}

fn click_at(
    pointer: &mut dyn PointerInput,
    clock: &dyn Clock,
    x: i32,
    y: i32,
) -> Result<(), CoreError> {
    glide_pointer(pointer, clock, x, y)?;
    clock.sleep(CLICK_SETTLE);
    pointer.press()?;
    clock.sleep(BUTTON_HOLD);
    pointer.release()?;
    Ok(())
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

/// Moves the pointer to (x, y) along an eased path instead of teleporting.
pub(crate) fn glide_pointer(
    pointer: &mut dyn PointerInput,
    clock: &dyn Clock,
    x: i32,
    y: i32,
) -> Result<(), CoreError> {
    let (sx, sy) = pointer.pointer_pos()?;
    let dx = f64::from(x - sx);
    let dy = f64::from(y - sy);
    let distance = (dx * dx + dy * dy).sqrt();
    let steps = (distance / GLIDE_STEP_PX).ceil().max(1.0) as u32;

    for step in 1..=steps {
        let progress = ease_in_out_cubic(f64::from(step) / f64::from(steps));
        let nx = sx + (dx * progress).round() as i32;
        let ny = sy + (dy * progress).round() as i32;
        pointer.move_pointer(nx, ny)?;
        clock.sleep(GLIDE_STEP_PAUSE);
    }
    Ok(())
}

/// Background thread sweeping for dialogs and answering them.
pub struct DialogWatchdog {
    stop: Arc<AtomicBool>,
    done_rx: Mutex<Receiver<()>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DialogWatchdog {
    /// Returns `None` when dialog handling is disabled in the profile.
    pub fn start(
        settings: &DialogSettings,
        clock: Arc<dyn Clock>,
        probe: Box<dyn WindowProbe>,
        mut pointer: Box<dyn PointerInput>,
        on_outcome: Arc<dyn Fn(DialogOutcome) + Send + Sync>,
    ) -> Option<Self> {
        if !settings.enabled {
            info!("dialog watchdog disabled by profile");
            return None;
        }

        let interval =
            Duration::from_millis(settings.detection_interval_ms).min(MAX_SWEEP_INTERVAL);
        let mut scanner = DialogScanner::new(
            ExpectationList::new(settings.expected.clone()),
            settings.max_windows_per_scan,
        );
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            info!("dialog watchdog started");
            while !thread_stop.load(Ordering::Relaxed) {
                for record in scanner.scan(probe.as_ref()) {
                    let outcome = resolve(&record, probe.as_ref(), pointer.as_mut(), clock.as_ref());
                    on_outcome(outcome);
                }
                clock.sleep(interval);
            }
            debug!("dialog watchdog exiting");
            let _ = done_tx.send(());
        });

        Some(Self {
            stop,
            done_rx: Mutex::new(done_rx),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) -> Result<(), CoreError> {
        self.stop.store(true, Ordering::Relaxed);
        let done_rx = self.done_rx.lock().unwrap();
        match done_rx.recv_timeout(WATCHDOG_JOIN_TIMEOUT) {
            Ok(()) => {
                if let Some(handle) = self.handle.lock().unwrap().take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(_) => Err(CoreError::JoinTimeout {
                thread: "dialog-watchdog",
                timeout_ms: WATCHDOG_JOIN_TIMEOUT.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ExpectedDialog;
    use crate::ports::{ButtonDesc, NullPointer, Rect, WindowDesc};

    #[derive(Default)]
    struct FakeDesktop {
        windows: Mutex<Vec<WindowDesc>>,
        texts: Mutex<std::collections::HashMap<WindowHandle, String>>,
        buttons: Mutex<std::collections::HashMap<WindowHandle, Vec<ButtonDesc>>>,
        unreadable: Mutex<HashSet<WindowHandle>>,
        posted: Mutex<Vec<(WindowHandle, DialogCommand)>>,
    }

    impl FakeDesktop {
        fn add_dialog(&self, handle: WindowHandle, title: &str, content: &str) {
            self.windows.lock().unwrap().push(WindowDesc {
                handle,
                title: title.to_string(),
                class_name: "#32770".to_string(),
                visible: true,
            });
            self.texts
                .lock()
                .unwrap()
                .insert(handle, content.to_string());
        }

        fn add_buttons(&self, handle: WindowHandle, captions: &[&str]) {
            let buttons = captions
                .iter()
                .enumerate()
                .map(|(i, text)| ButtonDesc {
                    text: text.to_string(),
                    rect: Rect {
                        left: 100 * i as i32,
                        top: 200,
                        right: 100 * i as i32 + 80,
                        bottom: 230,
                    },
                })
                .collect();
            self.buttons.lock().unwrap().insert(handle, buttons);
        }
    }

    impl WindowProbe for FakeDesktop {
        fn enumerate(&self, limit: usize) -> Result<Vec<WindowDesc>, CoreError> {
            let windows = self.windows.lock().unwrap();
            Ok(windows.iter().take(limit).cloned().collect())
        }

        fn static_text(&self, handle: WindowHandle) -> Result<String, CoreError> {
            if self.unreadable.lock().unwrap().contains(&handle) {
                return Err(CoreError::WindowQuery("text unreadable".to_string()));
            }
            Ok(self
                .texts
                .lock()
                .unwrap()
                .get(&handle)
                .cloned()
                .unwrap_or_default())
        }

        fn buttons(&self, handle: WindowHandle) -> Result<Vec<ButtonDesc>, CoreError> {
            Ok(self
                .buttons
                .lock()
                .unwrap()
                .get(&handle)
                .cloned()
                .unwrap_or_default())
        }

        fn post_command(
            &self,
            handle: WindowHandle,
            command: DialogCommand,
        ) -> Result<(), CoreError> {
            self.posted.lock().unwrap().push((handle, command));
            Ok(())
        }
    }

    fn scanner(expected: Vec<ExpectedDialog>) -> DialogScanner {
        DialogScanner::new(ExpectationList::new(expected), 50)
    }

    // ── Scanning ─────────────────────────────────────────────────────────

    #[test]
    fn scan_classifies_and_checks_expectation() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "记事本", "是否保存对文件的更改?");
        desktop.add_dialog(2, "删除确认", "确认删除该文件?");

        let records = scanner(Vec::new()).scan(&desktop);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].classification, DialogKind::SaveConfirm);
        assert!(records[0].is_expected);
        assert_eq!(records[1].classification, DialogKind::DeleteConfirm);
        assert!(!records[1].is_expected);
    }

    #[test]
    fn scan_ignores_ordinary_windows() {
        let desktop = FakeDesktop::default();
        desktop.windows.lock().unwrap().push(WindowDesc {
            handle: 7,
            title: "My Document".to_string(),
            class_name: "Chrome_WidgetWin_1".to_string(),
            visible: true,
        });
        assert!(scanner(Vec::new()).scan(&desktop).is_empty());
    }

    #[test]
    fn scan_deduplicates_until_handle_disappears() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "警告", "磁盘空间不足");

        let mut scanner = scanner(Vec::new());
        assert_eq!(scanner.scan(&desktop).len(), 1);
        assert!(scanner.scan(&desktop).is_empty());

        // Window closes, then a new dialog reuses the handle.
        desktop.windows.lock().unwrap().clear();
        assert!(scanner.scan(&desktop).is_empty());
        desktop.add_dialog(1, "警告", "磁盘空间不足");
        assert_eq!(scanner.scan(&desktop).len(), 1);
    }

    #[test]
    fn unknown_dialog_is_never_expected() {
        let desktop = FakeDesktop::default();
        // Dialog-like class, but no classifiable keyword anywhere.
        desktop.add_dialog(1, "xyzzy", "plugh");

        let records = scanner(vec![ExpectedDialog {
            title: "xyzzy".to_string(),
            content: String::new(),
        }])
        .scan(&desktop);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].classification, DialogKind::Unknown);
        assert!(!records[0].is_expected);
    }

    #[test]
    fn unreadable_window_does_not_abort_sweep() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "错误", "");
        desktop.add_dialog(2, "警告", "low battery");
        desktop.unreadable.lock().unwrap().insert(1);

        let records = scanner(Vec::new()).scan(&desktop);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].handle, 2);
    }

    #[test]
    fn scan_respects_window_limit() {
        let desktop = FakeDesktop::default();
        for handle in 0..10 {
            desktop.add_dialog(handle, "错误", "boom");
        }
        let mut scanner = DialogScanner::new(ExpectationList::new(Vec::new()), 3);
        assert_eq!(scanner.scan(&desktop).len(), 3);
    }

    // ── Resolution ───────────────────────────────────────────────────────

    fn record_for(desktop: &FakeDesktop, expected: bool) -> DialogRecord {
        let mut records = scanner(if expected {
            vec![ExpectedDialog {
                title: String::new(),
                content: "保存".to_string(),
            }]
        } else {
            Vec::new()
        })
        .scan(desktop);
        records.remove(0)
    }

    #[test]
    fn expected_dialog_gets_affirmative_button() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "记事本", "是否保存?");
        desktop.add_buttons(1, &["是(&Y)", "否(&N)", "取消"]);
        let record = record_for(&desktop, true);

        let clock = ManualClock::new();
        let mut pointer = NullPointer::default();
        let outcome = resolve(&record, &desktop, &mut pointer, &clock);

        assert_eq!(outcome.response, DialogResponse::Acknowledge);
        assert!(outcome.clicked);
        assert!(!outcome.via_fallback);
        assert_eq!(pointer.clicks, 1);
        // Glide ended on the 是 button's center.
        assert_eq!(pointer.trail.back(), Some(&(40, 215)));
        assert!(desktop.posted.lock().unwrap().is_empty());
    }

    #[test]
    fn unexpected_dialog_gets_dismissive_button() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "删除确认", "确认删除?");
        desktop.add_buttons(1, &["确定", "取消"]);
        let record = record_for(&desktop, false);

        let clock = ManualClock::new();
        let mut pointer = NullPointer::default();
        let outcome = resolve(&record, &desktop, &mut pointer, &clock);

        assert_eq!(outcome.response, DialogResponse::Dismiss);
        assert!(outcome.clicked);
        // 取消 is the second button.
        assert_eq!(pointer.trail.back(), Some(&(140, 215)));
    }

    #[test]
    fn missing_button_falls_back_to_posted_command() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "删除确认", "?");
        let record = record_for(&desktop, false);

        let clock = ManualClock::new();
        let mut pointer = NullPointer::default();
        let outcome = resolve(&record, &desktop, &mut pointer, &clock);

        assert!(outcome.via_fallback);
        assert!(!outcome.clicked);
        assert_eq!(pointer.clicks, 0);
        assert_eq!(
            desktop.posted.lock().unwrap().as_slice(),
            &[(1, DialogCommand::Cancel)]
        );
    }

    #[test]
    fn glide_is_stepwise_and_lands_exactly() {
        let clock = ManualClock::new();
        let mut pointer = NullPointer::default();
        glide_pointer(&mut pointer, &clock, 100, 0).unwrap();

        // ~5px per step from (0,0) to (100,0).
        assert_eq!(pointer.trail.len(), 20);
        assert_eq!(pointer.trail.back(), Some(&(100, 0)));
        // Eased: the first step is shorter than a linear 5px hop.
        let first = pointer.trail.front().unwrap();
        assert!(first.0 < 5);
    }

    #[test]
    fn ease_curve_endpoints() {
        assert_eq!(ease_in_out_cubic(0.0), 0.0);
        assert_eq!(ease_in_out_cubic(1.0), 1.0);
        assert!(ease_in_out_cubic(0.25) < 0.25);
        assert!(ease_in_out_cubic(0.75) > 0.75);
    }

    // ── Watchdog thread ──────────────────────────────────────────────────

    #[test]
    fn watchdog_answers_and_reports() {
        let desktop = FakeDesktop::default();
        desktop.add_dialog(1, "删除确认", "确认删除?");

        let settings = DialogSettings {
            detection_interval_ms: 10,
            ..DialogSettings::default()
        };
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let watchdog = DialogWatchdog::start(
            &settings,
            Arc::new(ManualClock::new()),
            Box::new(desktop),
            Box::new(NullPointer::default()),
            Arc::new(move |outcome| {
                let _ = tx.lock().unwrap().send(outcome);
            }),
        )
        .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome.response, DialogResponse::Dismiss);
        assert!(!outcome.record.is_expected);

        // Dedup holds across sweeps.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        watchdog.stop().unwrap();
    }

    #[test]
    fn disabled_watchdog_does_not_start() {
        let settings = DialogSettings {
            enabled: false,
            ..DialogSettings::default()
        };
        assert!(
            DialogWatchdog::start(
                &settings,
                Arc::new(ManualClock::new()),
                Box::new(FakeDesktop::default()),
                Box::new(NullPointer::default()),
                Arc::new(|_| {}),
            )
            .is_none()
        );
    }
}

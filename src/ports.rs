//! Collaborator interfaces between the supervision core and the platform.
//!
//! The core never touches a screen, a window system, or an input device
//! directly. Everything it needs from the outside world comes in through the
//! traits here, which keeps the decision pipeline testable and the platform
//! bindings swappable. The `Null*` implementations at the bottom back the
//! `--dry-run` mode and most of the test suite.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::{DetectionConfig, WindowConfig};
use crate::errors::CoreError;

/// Screen-space rectangle, in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// One captured frame of the watched region. The pixel format is whatever the
/// capture backend produces; the core only forwards it to the vision backend.
#[derive(Debug, Clone)]
pub struct Frame {
    pub region: Region,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub template: String,
    pub confidence: f64,
    pub x: i32,
    pub y: i32,
}

/// What the vision backend found in a single frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Observation {
    pub enemies: Vec<Detection>,
    pub items: Vec<Detection>,
    pub ui_elements: Vec<Detection>,
}

/// The complete set of things the decision stage may ask the input backend to
/// do. Closed by design: there is no string-dispatch escape hatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Press { key: String },
    Type { text: String },
    Click { x: i32, y: i32 },
    Wait { ms: u64 },
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

pub trait Capture: Send {
    fn capture(&mut self, region: &Region) -> Result<Frame, CoreError>;
}

pub trait Vision: Send {
    fn process_observation(
        &mut self,
        frame: &Frame,
        config: &DetectionConfig,
    ) -> Result<Observation, CoreError>;
}

/// Executes decided actions. Shared between the control loop and the macro
/// path, so implementations manage any interior mutability themselves.
pub trait Input: Send + Sync {
    fn execute_action(&self, action: &Action) -> Result<ActionOutcome, CoreError>;
}

/// Brings the configured target window to the foreground. `Ok(false)` means
/// the window could not be found or focused.
pub trait WindowActivator: Send + Sync {
    fn ensure_active(&self, config: &WindowConfig) -> Result<bool, CoreError>;
}

/// Read-only view of physical input devices, polled by the safety supervisor.
pub trait InputProbe: Send {
    fn pointer_pos(&self) -> Result<(i32, i32), CoreError>;
    fn pointer_button_down(&self) -> Result<bool, CoreError>;
    fn key_down(&self, key: &str) -> Result<bool, CoreError>;
    fn any_key_down(&self) -> Result<bool, CoreError>;
}

pub type WindowHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }
}

#[derive(Debug, Clone)]
pub struct WindowDesc {
    pub handle: WindowHandle,
    pub title: String,
    pub class_name: String,
    pub visible: bool,
}

#[derive(Debug, Clone)]
pub struct ButtonDesc {
    pub text: String,
    pub rect: Rect,
}

/// Fallback command posted to a dialog when no matching button is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogCommand {
    Ok,
    Cancel,
}

impl DialogCommand {
    /// Standard dialog control identifier (IDOK / IDCANCEL).
    pub fn wire_id(self) -> u32 {
        match self {
            DialogCommand::Ok => 1,
            DialogCommand::Cancel => 2,
        }
    }
}

/// Window-system view used by the dialog watchdog.
///
/// `enumerate` returns top-level windows in an implementation-defined order,
/// truncated at `limit`.
pub trait WindowProbe: Send {
    fn enumerate(&self, limit: usize) -> Result<Vec<WindowDesc>, CoreError>;
    fn static_text(&self, handle: WindowHandle) -> Result<String, CoreError>;
    fn buttons(&self, handle: WindowHandle) -> Result<Vec<ButtonDesc>, CoreError>;
    fn post_command(&self, handle: WindowHandle, command: DialogCommand) -> Result<(), CoreError>;
}

/// Low-level pointer movement, used only for dialog button clicks.
pub trait PointerInput: Send {
    fn pointer_pos(&mut self) -> Result<(i32, i32), CoreError>;
    fn move_pointer(&mut self, x: i32, y: i32) -> Result<(), CoreError>;
    fn press(&mut self) -> Result<(), CoreError>;
    fn release(&mut self) -> Result<(), CoreError>;
}

// ── Dry-run doubles ──────────────────────────────────────────────────────────

/// Produces empty frames of the requested region.
#[derive(Debug, Default)]
pub struct NullCapture;

impl Capture for NullCapture {
    fn capture(&mut self, region: &Region) -> Result<Frame, CoreError> {
        Ok(Frame {
            region: *region,
            data: Vec::new(),
        })
    }
}

/// Sees nothing in every frame.
#[derive(Debug, Default)]
pub struct NullVision;

impl Vision for NullVision {
    fn process_observation(
        &mut self,
        _frame: &Frame,
        _config: &DetectionConfig,
    ) -> Result<Observation, CoreError> {
        Ok(Observation::default())
    }
}

/// Records every action instead of driving the desktop.
#[derive(Debug, Default)]
pub struct NullInput {
    executed: Mutex<Vec<Action>>,
}

impl NullInput {
    pub fn executed(&self) -> Vec<Action> {
        self.executed.lock().unwrap().clone()
    }
}

impl Input for NullInput {
    fn execute_action(&self, action: &Action) -> Result<ActionOutcome, CoreError> {
        self.executed.lock().unwrap().push(action.clone());
        Ok(ActionOutcome::ok())
    }
}

/// Pretends the target window is always active.
#[derive(Debug, Default)]
pub struct NoopActivator;

impl WindowActivator for NoopActivator {
    fn ensure_active(&self, _config: &WindowConfig) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// A perfectly still user: fixed pointer, no buttons, no keys.
#[derive(Debug, Default)]
pub struct IdleProbe;

impl InputProbe for IdleProbe {
    fn pointer_pos(&self) -> Result<(i32, i32), CoreError> {
        Ok((0, 0))
    }

    fn pointer_button_down(&self) -> Result<bool, CoreError> {
        Ok(false)
    }

    fn key_down(&self, _key: &str) -> Result<bool, CoreError> {
        Ok(false)
    }

    fn any_key_down(&self) -> Result<bool, CoreError> {
        Ok(false)
    }
}

/// A desktop with no windows on it.
#[derive(Debug, Default)]
pub struct EmptyWindowProbe;

impl WindowProbe for EmptyWindowProbe {
    fn enumerate(&self, _limit: usize) -> Result<Vec<WindowDesc>, CoreError> {
        Ok(Vec::new())
    }

    fn static_text(&self, _handle: WindowHandle) -> Result<String, CoreError> {
        Ok(String::new())
    }

    fn buttons(&self, _handle: WindowHandle) -> Result<Vec<ButtonDesc>, CoreError> {
        Ok(Vec::new())
    }

    fn post_command(&self, _handle: WindowHandle, _command: DialogCommand) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Tracks pointer position in memory and records the traversal.
#[derive(Debug, Default)]
pub struct NullPointer {
    pos: (i32, i32),
    pub trail: VecDeque<(i32, i32)>,
    pub clicks: u32,
}

impl PointerInput for NullPointer {
    fn pointer_pos(&mut self) -> Result<(i32, i32), CoreError> {
        Ok(self.pos)
    }

    fn move_pointer(&mut self, x: i32, y: i32) -> Result<(), CoreError> {
        self.pos = (x, y);
        self.trail.push_back((x, y));
        Ok(())
    }

    fn press(&mut self) -> Result<(), CoreError> {
        self.clicks += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

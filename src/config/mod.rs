//! Profile loading and validation.
//!
//! A profile is one YAML file describing everything about an automation run:
//! the watched screen region, the keymap and macros, detection templates, the
//! target window, and the safety / dialog watchdog tuning. Profiles live in a
//! directory managed by [`ProfileStore`], one file per profile name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::CoreError;
use crate::ports::Region;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Display name; may differ from the file stem.
    pub profile: String,

    #[serde(default)]
    pub description: String,

    /// Screen region the control loop watches.
    pub screen_region: Region,

    /// Logical action name -> physical key. Must not be empty.
    pub keymap: HashMap<String, String>,

    /// Named action sequences, runnable on demand or at session start.
    #[serde(default)]
    pub macros: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub controller: ControllerSettings,

    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub safety: SafetySettings,

    #[serde(default)]
    pub dialogs: DialogSettings,

    #[serde(default)]
    pub strategy: StrategySettings,

    #[serde(default)]
    pub humanize: HumanizeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_scene")]
    pub scene: String,

    /// Category name -> template image paths, passed through to the vision
    /// backend untouched.
    #[serde(default)]
    pub templates: HashMap<String, Vec<String>>,

    /// Minimum confidence for a match to count as a detection. Operators set
    /// this under `controller`; the session stamps it here before handing
    /// the config to the vision backend.
    #[serde(skip, default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scene: default_scene(),
            templates: HashMap::new(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Upper bound on decision cycles per second.
    #[serde(default = "default_fps_limit")]
    pub fps_limit: u32,

    /// Floor on the cycle interval, regardless of fps_limit.
    #[serde(default = "default_minimum_tick_ms")]
    pub minimum_tick_ms: u64,

    #[serde(default = "default_action_cooldown_ms")]
    pub action_cooldown_ms: u64,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            fps_limit: default_fps_limit(),
            minimum_tick_ms: default_minimum_tick_ms(),
            action_cooldown_ms: default_action_cooldown_ms(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Title (or substring, unless `exact_match`) of the target window.
    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub exact_match: bool,

    /// Pause after activation before any input is injected.
    #[serde(default = "default_activation_delay_ms")]
    pub activation_delay_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            title: String::new(),
            exact_match: false,
            activation_delay_ms: default_activation_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySettings {
    #[serde(default = "default_emergency_key")]
    pub emergency_key: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Operator activity inside this window after session start is ignored.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Pointer travel below this distance is treated as jitter.
    #[serde(default = "default_movement_threshold_px")]
    pub movement_threshold_px: f64,

    /// Minimum spacing between two emitted events of the same kind.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Re-enable automation after operator activity settles.
    #[serde(default = "default_true")]
    pub auto_recover: bool,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            emergency_key: default_emergency_key(),
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            movement_threshold_px: default_movement_threshold_px(),
            debounce_ms: default_debounce_ms(),
            auto_recover: true,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_detection_interval_ms")]
    pub detection_interval_ms: u64,

    #[serde(default = "default_max_windows_per_scan")]
    pub max_windows_per_scan: usize,

    /// Dialogs matching these patterns are acknowledged instead of dismissed.
    #[serde(default)]
    pub expected: Vec<ExpectedDialog>,
}

impl Default for DialogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            detection_interval_ms: default_detection_interval_ms(),
            max_windows_per_scan: default_max_windows_per_scan(),
            expected: Vec::new(),
        }
    }
}

/// One allow-list entry. A dialog is expected when its title contains `title`
/// or its content contains `content`; empty fields never match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedDialog {
    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    /// Macro to run once, right after the session starts.
    #[serde(default)]
    pub auto_execute_macro: Option<String>,

    /// Delay before the auto macro fires.
    #[serde(default = "default_execution_delay_ms")]
    pub execution_delay_ms: u64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            auto_execute_macro: None,
            execution_delay_ms: default_execution_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanizeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// [min, max] inter-key delay for macro playback.
    #[serde(default = "default_key_delay_ms")]
    pub key_delay_ms: [u64; 2],
}

impl Default for HumanizeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            key_delay_ms: default_key_delay_ms(),
        }
    }
}

fn default_scene() -> String {
    "default".to_string()
}

fn default_fps_limit() -> u32 {
    10
}

fn default_minimum_tick_ms() -> u64 {
    10
}

fn default_action_cooldown_ms() -> u64 {
    100
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_activation_delay_ms() -> u64 {
    500
}

fn default_emergency_key() -> String {
    "esc".to_string()
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_movement_threshold_px() -> f64 {
    50.0
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_detection_interval_ms() -> u64 {
    500
}

fn default_max_windows_per_scan() -> usize {
    50
}

fn default_execution_delay_ms() -> u64 {
    1000
}

fn default_key_delay_ms() -> [u64; 2] {
    [80, 140]
}

fn default_true() -> bool {
    true
}

/// Directory of profile YAML files.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yaml"))
    }

    pub fn load(&self, name: &str) -> Result<Profile, CoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(CoreError::ProfileNotFound(name.to_string()));
        }
        let raw = std::fs::read_to_string(&path)?;
        let profile: Profile =
            serde_yaml::from_str(&raw).map_err(|e| CoreError::InvalidProfile {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        validate(name, &profile)?;
        debug!(profile = %name, path = %path.display(), "profile loaded");
        Ok(profile)
    }

    pub fn save(&self, name: &str, profile: &Profile) -> Result<PathBuf, CoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let raw = serde_yaml::to_string(profile)?;
        std::fs::write(&path, raw)?;
        Ok(path)
    }

    /// Writes a starter profile the operator can edit into shape.
    pub fn create_default(&self, name: &str, region: Region) -> Result<PathBuf, CoreError> {
        let mut keymap = HashMap::new();
        keymap.insert("attack".to_string(), "q".to_string());
        keymap.insert("jump".to_string(), "space".to_string());
        keymap.insert("interact".to_string(), "e".to_string());

        let mut macros = HashMap::new();
        macros.insert(
            "opening".to_string(),
            vec![
                "key: jump".to_string(),
                "key: attack".to_string(),
                "key: attack".to_string(),
            ],
        );

        let profile = Profile {
            profile: name.to_string(),
            description: "starter profile".to_string(),
            screen_region: region,
            keymap,
            macros,
            detection: DetectionConfig::default(),
            controller: ControllerSettings::default(),
            window: WindowConfig::default(),
            safety: SafetySettings::default(),
            dialogs: DialogSettings::default(),
            strategy: StrategySettings::default(),
            humanize: HumanizeSettings::default(),
        };
        self.save(name, &profile)
    }

    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| stem_if_yaml(&e.path()))
            .collect();
        names.sort();
        names
    }
}

fn stem_if_yaml(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if ext != "yaml" && ext != "yml" {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}

fn validate(name: &str, profile: &Profile) -> Result<(), CoreError> {
    let invalid = |reason: &str| CoreError::InvalidProfile {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if profile.keymap.is_empty() {
        return Err(invalid("keymap must not be empty"));
    }
    if profile.screen_region.width == 0 || profile.screen_region.height == 0 {
        return Err(invalid("screen_region must have a non-zero size"));
    }
    if profile.controller.fps_limit == 0 {
        return Err(invalid("controller.fps_limit must be at least 1"));
    }
    if profile.window.enabled && profile.window.title.is_empty() {
        return Err(invalid("window.title is required when window.enabled"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ProfileStore) {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path());
        (dir, store)
    }

    const MINIMAL: &str = r#"
profile: raid
screen_region: { x: 0, y: 0, width: 1920, height: 1080 }
keymap:
  attack: q
"#;

    #[test]
    fn minimal_profile_gets_defaults() {
        let profile: Profile = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(profile.safety.grace_period_ms, 5000);
        assert_eq!(profile.safety.movement_threshold_px, 50.0);
        assert_eq!(profile.safety.debounce_ms, 1000);
        assert_eq!(profile.safety.poll_interval_ms, 10);
        assert_eq!(profile.safety.emergency_key, "esc");
        assert!(profile.safety.auto_recover);
        assert_eq!(profile.dialogs.detection_interval_ms, 500);
        assert_eq!(profile.dialogs.max_windows_per_scan, 50);
        assert!(profile.dialogs.enabled);
        assert_eq!(profile.controller.fps_limit, 10);
        assert!(!profile.window.enabled);
    }

    #[test]
    fn full_profile_round_trips() {
        let yaml = r#"
profile: editor
description: drives the text editor
screen_region: { x: 100, y: 50, width: 800, height: 600 }
keymap:
  attack: q
  save: ctrl+s
macros:
  greet:
    - "type: hello"
    - "key: save"
window:
  enabled: true
  title: Notepad
safety:
  grace_period_ms: 2000
  movement_threshold_px: 50
dialogs:
  expected:
    - title: "是否保存"
strategy:
  auto_execute_macro: greet
"#;
        let profile: Profile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(profile.window.title, "Notepad");
        assert_eq!(profile.safety.grace_period_ms, 2000);
        assert_eq!(profile.dialogs.expected.len(), 1);
        assert_eq!(
            profile.strategy.auto_execute_macro.as_deref(),
            Some("greet")
        );

        let (_tmp, store) = store();
        store.save("editor", &profile).unwrap();
        let back = store.load("editor").unwrap();
        assert_eq!(back.macros["greet"].len(), 2);
    }

    #[test]
    fn missing_profile_is_not_found() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.load("ghost"),
            Err(CoreError::ProfileNotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn empty_keymap_is_rejected() {
        let (_tmp, store) = store();
        let yaml = r#"
profile: bad
screen_region: { x: 0, y: 0, width: 10, height: 10 }
keymap: {}
"#;
        std::fs::write(store.path_for("bad"), yaml).unwrap();
        assert!(matches!(
            store.load("bad"),
            Err(CoreError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn window_title_required_when_enabled() {
        let yaml = r#"
profile: bad
screen_region: { x: 0, y: 0, width: 10, height: 10 }
keymap: { attack: q }
window: { enabled: true }
"#;
        let profile: Profile = serde_yaml::from_str(yaml).unwrap();
        assert!(validate("bad", &profile).is_err());
    }

    #[test]
    fn create_default_then_list() {
        let (_tmp, store) = store();
        store
            .create_default(
                "starter",
                Region {
                    x: 0,
                    y: 0,
                    width: 1920,
                    height: 1080,
                },
            )
            .unwrap();
        assert_eq!(store.list(), vec!["starter".to_string()]);
        let profile = store.load("starter").unwrap();
        assert!(profile.keymap.contains_key("attack"));
        assert!(profile.macros.contains_key("opening"));
    }
}

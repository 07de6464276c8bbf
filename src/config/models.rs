use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::path::PathBuf;
use std::time::Duration;

/// Where frames come from and where actions go.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectMode {
    /// The primary local display and local pointer input.
    #[default]
    #[serde(alias = "Windows")]
    Local,
    /// An attached device reached through the adb bridge.
    #[serde(alias = "ADB")]
    Remote,
}

/// Runtime settings for Clickflow.
///
/// Deserialized from a JSON file; every field has a default so `{}` is a valid
/// settings document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Frame source and actuator selection.
    pub detect_mode: DetectMode,

    /// Device serial passed to `adb -s`; the only attached device when absent.
    pub device_serial: Option<String>,

    /// Path or name of the adb executable.
    pub adb_path: PathBuf,

    /// Deadline for one bridge command.
    #[validate(minimum = 1)]
    pub bridge_timeout_ms: u64,

    /// Directory that relative reference image names resolve against.
    pub images_dir: PathBuf,

    /// Pause between captures while a step is searching.
    #[validate(minimum = 500)]
    #[validate(maximum = 1000)]
    pub poll_interval_ms: u64,

    /// Pause between consecutive steps of a run.
    pub settle_delay_ms: u64,

    /// Consecutive capture failures tolerated per step.
    #[validate(maximum = 100)]
    pub capture_retries: u32,

    /// Length of the smoothed pointer move before a local click.
    #[validate(maximum = 10000)]
    pub move_duration_ms: u64,

    /// Matcher pyramid depth. Absent picks it from each template's size; 0 scans
    /// every placement at full resolution.
    #[validate(maximum = 4)]
    pub coarse_levels: Option<u8>,

    /// Log actions instead of performing them.
    pub dry_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detect_mode: DetectMode::Local,
            device_serial: None,
            adb_path: PathBuf::from("adb"),
            bridge_timeout_ms: 10_000,
            images_dir: PathBuf::from("detect"),
            poll_interval_ms: 1000,
            settle_delay_ms: 1000,
            capture_retries: 3,
            move_duration_ms: 500,
            coarse_levels: None,
            dry_run: false,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    pub fn move_duration(&self) -> Duration {
        Duration::from_millis(self.move_duration_ms)
    }
}

//! Core data types shared by the matcher, the runners and the graph compiler.
//!
//! - `ReferenceImage`: an identifier plus lazily decoded RGB pixels.
//! - `StepSettings` / `Step`: what to look for and how to act on it.
//! - `CompiledSequence`: the linear list of steps a run consumes.
//! - `RunResult`: what a run reports back to its caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use image::RgbImage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A point on the target surface, in surface pixels.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Center of a `width` x `height` box whose top-left corner is `self`
    /// (floor division per axis).
    pub fn center_of(self, width: u32, height: u32) -> Self {
        Self {
            x: self.x + (width / 2) as i32,
            y: self.y + (height / 2) as i32,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Failure to decode a reference image from disk.
#[derive(Debug, Error)]
#[error("failed to load reference image '{name}' from {}", path.display())]
pub struct ReferenceError {
    pub name: String,
    pub path: PathBuf,
    #[source]
    pub source: image::ImageError,
}

/// A small raster pattern searched for inside captured frames.
///
/// Cloning is cheap (shared); pixels are decoded on first use and never change afterwards.
#[derive(Clone)]
pub struct ReferenceImage {
    inner: Arc<ReferenceInner>,
}

struct ReferenceInner {
    name: String,
    path: Option<PathBuf>,
    pixels: OnceLock<RgbImage>,
}

impl ReferenceImage {
    /// Reference backed by an image file, decoded lazily.
    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ReferenceInner {
                name: name.into(),
                path: Some(path.into()),
                pixels: OnceLock::new(),
            }),
        }
    }

    /// Reference built from pixels already in memory.
    pub fn from_pixels(name: impl Into<String>, pixels: RgbImage) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(pixels);
        Self {
            inner: Arc::new(ReferenceInner {
                name: name.into(),
                path: None,
                pixels: cell,
            }),
        }
    }

    /// Identifier (file name or persisted location).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.pixels.get().is_some()
    }

    /// Decoded RGB pixels (alpha dropped); the first call reads the file.
    pub fn pixels(&self) -> Result<&RgbImage, ReferenceError> {
        if let Some(pixels) = self.inner.pixels.get() {
            return Ok(pixels);
        }
        // from_pixels always fills the cell, so a path is present here.
        let path = self.inner.path.clone().unwrap_or_default();
        let decoded = image::open(&path)
            .map_err(|source| ReferenceError {
                name: self.inner.name.clone(),
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        tracing::debug!(
            target: "clickflow::model",
            name = %self.inner.name,
            width = decoded.width(),
            height = decoded.height(),
            "Decoded reference image"
        );
        Ok(self.inner.pixels.get_or_init(|| decoded))
    }

    /// Width and height of the decoded pattern.
    pub fn extent(&self) -> Result<(u32, u32), ReferenceError> {
        self.pixels().map(|p| p.dimensions())
    }
}

impl fmt::Debug for ReferenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceImage")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Default minimum match score.
pub const DEFAULT_CONFIDENCE: f64 = 0.9;
/// Default search timeout.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of actions per step.
pub const DEFAULT_REPEAT_COUNT: u32 = 1;
/// Default pause between repeated actions.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-step matching and acting parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSettings {
    /// Minimum score (inclusive) for a match to count as found.
    pub confidence_threshold: f64,
    /// How long to keep searching before giving up.
    pub search_timeout: Duration,
    /// Number of actions performed once found (at least 1).
    pub repeat_count: u32,
    /// Pause between consecutive actions.
    pub repeat_interval: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            repeat_count: DEFAULT_REPEAT_COUNT,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
        }
    }
}

impl StepSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_repeats(mut self, count: u32, interval: Duration) -> Self {
        self.repeat_count = count.max(1);
        self.repeat_interval = interval;
        self
    }
}

/// A reference image plus the settings used to find and act on it.
#[derive(Debug, Clone)]
pub struct Step {
    pub image: ReferenceImage,
    pub settings: StepSettings,
}

impl Step {
    pub fn new(image: ReferenceImage, settings: StepSettings) -> Self {
        Self { image, settings }
    }

    pub fn name(&self) -> &str {
        self.image.name()
    }
}

/// Ordered, read-only list of steps ready for execution.
///
/// Built once (by the graph compiler or the step-sequence loader) and replaced
/// wholesale rather than edited.
#[derive(Debug, Clone, Default)]
pub struct CompiledSequence {
    steps: Vec<Step>,
}

impl CompiledSequence {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// Step names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }
}

impl FromIterator<Step> for CompiledSequence {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CompiledSequence {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

/// Category of a step failure, as reported in a `RunResult`.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TimedOut,
    CaptureFailed,
    ActuatorFailed,
    ReferenceUnreadable,
    MatchFailed,
    Cancelled,
}

/// Why a run stopped early.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReason {
    /// Index of the step that failed.
    pub step_index: usize,
    pub step_name: String,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} ('{}') failed: {}",
            self.step_index + 1,
            self.step_name,
            self.message
        )
    }
}

/// Outcome of one sequence run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub success: bool,
    /// Index of the last step that reached `Done`; `None` when no step completed.
    pub last_completed_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl RunResult {
    pub fn completed(len: usize) -> Self {
        Self {
            success: true,
            last_completed_index: len.checked_sub(1),
            failure_reason: None,
        }
    }

    pub fn failed(failed_index: usize, reason: FailureReason) -> Self {
        Self {
            success: false,
            last_completed_index: failed_index.checked_sub(1),
            failure_reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba, RgbaImage};

    #[test]
    fn center_uses_floor_division() {
        let p = Point::new(10, 20).center_of(5, 4);
        assert_eq!(p, Point::new(12, 22));
        assert_eq!(Point::new(0, 0).center_of(1, 1), Point::new(0, 0));
    }

    #[test]
    fn in_memory_reference_is_loaded() {
        let img = RgbImage::from_pixel(3, 2, Rgb([7, 8, 9]));
        let r = ReferenceImage::from_pixels("btn", img);
        assert!(r.is_loaded());
        assert_eq!(r.extent().unwrap(), (3, 2));
        assert_eq!(r.name(), "btn");
        assert!(r.path().is_none());
    }

    #[test]
    fn missing_file_reports_reference_error() {
        let r = ReferenceImage::from_path("nope.png", "/definitely/not/here/nope.png");
        let err = r.pixels().unwrap_err();
        assert_eq!(err.name, "nope.png");
        assert!(!r.is_loaded());
    }

    #[test]
    fn reference_decodes_from_disk_once() {
        let dir = std::env::temp_dir().join(format!("clickflow-model-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ref.png");
        RgbaImage::from_pixel(4, 6, Rgba([200, 40, 10, 128])).save(&path).unwrap();

        let r = ReferenceImage::from_path("ref.png", &path);
        assert!(!r.is_loaded());
        assert_eq!(r.extent().unwrap(), (4, 6));
        assert!(r.is_loaded());
        assert_eq!(r.pixels().unwrap().get_pixel(3, 5), &Rgb([200, 40, 10]));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_settings() {
        let s = StepSettings::default();
        assert_eq!(s.confidence_threshold, 0.9);
        assert_eq!(s.search_timeout, Duration::from_secs(30));
        assert_eq!(s.repeat_count, 1);
        assert_eq!(s.repeat_interval, Duration::from_secs(1));
        assert_eq!(s.with_repeats(0, Duration::ZERO).repeat_count, 1);
    }

    #[test]
    fn run_result_indices() {
        assert_eq!(RunResult::completed(3).last_completed_index, Some(2));
        assert_eq!(RunResult::completed(0).last_completed_index, None);
        let reason = FailureReason {
            step_index: 0,
            step_name: "a.png".into(),
            kind: FailureKind::TimedOut,
            message: "timed out".into(),
        };
        let r = RunResult::failed(0, reason);
        assert!(!r.success);
        assert_eq!(r.last_completed_index, None);
    }
}

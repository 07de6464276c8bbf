//! Local display capture.
//!
//! Captures the primary monitor through `xcap`. Click coordinates produced from
//! these frames are in the same pixel space the local actuator moves in.

use tracing::trace;

use super::{CaptureError, Frame, FrameSource};

/// Captures the full primary monitor.
#[derive(Debug, Default, Clone)]
pub struct LocalFrameSource;

impl LocalFrameSource {
    pub fn new() -> Self {
        Self
    }

    fn primary_monitor() -> Result<xcap::Monitor, CaptureError> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| CaptureError::Platform(format!("failed to list monitors: {e}")))?;
        let mut fallback = None;
        for monitor in monitors {
            match monitor.is_primary() {
                Ok(true) => return Ok(monitor),
                Ok(false) => {
                    if fallback.is_none() {
                        fallback = Some(monitor);
                    }
                }
                Err(e) => {
                    return Err(CaptureError::Platform(format!(
                        "error checking monitor primary status: {e}"
                    )));
                }
            }
        }
        fallback.ok_or(CaptureError::NoMonitor)
    }
}

impl FrameSource for LocalFrameSource {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let monitor = Self::primary_monitor()?;
        let image = monitor
            .capture_image()
            .map_err(|e| CaptureError::Platform(format!("failed to capture screen: {e}")))?;
        trace!(
            target: "clickflow::capture",
            width = image.width(),
            height = image.height(),
            "Captured local screen"
        );
        Ok(Frame::from_rgba(image))
    }
}

/*!
Frame sources: raster snapshots of the target surface.

- `local.rs`  -> `LocalFrameSource`  (primary monitor via `xcap`)
- `remote.rs` -> `RemoteFrameSource` (device bridge `screencap`)

Sources never retry. A failed capture is reported to the caller, which decides
whether to try again (the step runner retries a bounded number of times).
*/

use std::time::Duration;

use image::{DynamicImage, RgbImage, RgbaImage};
use thiserror::Error;

use crate::bridge::BridgeError;

pub mod local;
pub mod remote;

pub use local::LocalFrameSource;
pub use remote::RemoteFrameSource;

/// Reasons a capture can fail. All of them are transient from the runner's point of view.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no monitor available for capture")]
    NoMonitor,

    #[error("screen capture failed: {0}")]
    Platform(String),

    #[error("device bridge capture failed")]
    Bridge(#[from] BridgeError),

    #[error("captured image could not be decoded")]
    Decode(#[from] image::ImageError),
}

/// An RGB snapshot of the target surface at one instant.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: RgbImage,
}

impl Frame {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    /// Drop the alpha channel of a capture; the matcher works on RGB.
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self::new(DynamicImage::ImageRgba8(image).into_rgb8())
    }

    /// Decode an encoded image (PNG from `screencap`, for example).
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        Ok(Self::new(image::load_from_memory(bytes)?.into_rgb8()))
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Anything that can produce frames of the target surface.
pub trait FrameSource {
    /// Static human-readable identifier (used in logs).
    fn name(&self) -> &'static str;

    /// Take one snapshot. No retries happen at this layer.
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Take one snapshot, giving up once `budget` has passed where the source
    /// can bound its own wait. Local captures are immediate and ignore it.
    fn capture_within(&mut self, budget: Duration) -> Result<Frame, CaptureError> {
        let _ = budget;
        self.capture()
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        (**self).capture()
    }

    fn capture_within(&mut self, budget: Duration) -> Result<Frame, CaptureError> {
        (**self).capture_within(budget)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, Rgba};
    use std::io::Cursor;

    #[test]
    fn rgba_frames_keep_their_color() {
        let rgba = RgbaImage::from_pixel(4, 3, Rgba([250, 20, 5, 255]));
        let frame = Frame::from_rgba(rgba);
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.pixels().get_pixel(0, 0), &Rgb([250, 20, 5]));
    }

    #[test]
    fn decode_png_bytes() {
        let img = RgbImage::from_pixel(5, 2, Rgb([42, 7, 99]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.pixels(), &img);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Frame::decode(b"not an image").is_err());
    }
}

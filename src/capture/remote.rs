//! Remote capture over the device bridge.
//!
//! The encoded screenshot lands in a single reusable slot that is overwritten on
//! every call. Nothing from an earlier (possibly failed) capture is ever decoded:
//! the slot is emptied before each request.

use std::time::Duration;

use tracing::trace;

use super::{CaptureError, Frame, FrameSource};
use crate::bridge::SessionLease;

/// Captures the bound device's full surface.
pub struct RemoteFrameSource {
    lease: SessionLease,
    slot: Vec<u8>,
}

impl RemoteFrameSource {
    /// Building a remote source requires holding the session lease.
    pub fn new(lease: SessionLease) -> Self {
        Self {
            lease,
            slot: Vec::new(),
        }
    }

    pub fn lease(&self) -> &SessionLease {
        &self.lease
    }

    fn decode_slot(&self) -> Result<Frame, CaptureError> {
        let frame = Frame::decode(&self.slot)?;
        trace!(
            target: "clickflow::capture",
            device = %self.lease.describe(),
            bytes = self.slot.len(),
            width = frame.width(),
            height = frame.height(),
            "Captured remote screen"
        );
        Ok(frame)
    }
}

impl FrameSource for RemoteFrameSource {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        self.slot.clear();
        self.lease.screencap(&mut self.slot)?;
        self.decode_slot()
    }

    fn capture_within(&mut self, budget: Duration) -> Result<Frame, CaptureError> {
        self.slot.clear();
        self.lease.screencap_within(&mut self.slot, budget)?;
        self.decode_slot()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;
    use crate::bridge::testing::ScriptedBridge;
    use crate::bridge::{BridgeError, DeviceSession};

    fn png(value: u8) -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(3, 3, Rgb([value, 0, 255 - value]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn decodes_each_capture_fresh() {
        let bridge = Arc::new(ScriptedBridge {
            screens: Mutex::new(vec![Ok(png(10)), Err(()), Ok(png(20))]),
            ..Default::default()
        });
        let session = DeviceSession::bound(bridge);
        let mut source = RemoteFrameSource::new(session.lease().unwrap());

        let first = source.capture().unwrap();
        assert_eq!(first.pixels().get_pixel(0, 0), &Rgb([10, 0, 245]));

        let err = source.capture().unwrap_err();
        assert!(matches!(err, CaptureError::Bridge(_)));

        let third = source.capture().unwrap();
        assert_eq!(third.pixels().get_pixel(0, 0), &Rgb([20, 0, 235]));
    }

    #[test]
    fn undecodable_bytes_are_a_decode_error() {
        let bridge = Arc::new(ScriptedBridge {
            screens: Mutex::new(vec![Ok(b"junk".to_vec())]),
            ..Default::default()
        });
        let session = DeviceSession::bound(bridge);
        let mut source = RemoteFrameSource::new(session.lease().unwrap());
        assert!(matches!(source.capture(), Err(CaptureError::Decode(_))));
    }

    #[test]
    fn unbound_session_fails_capture() {
        let session = DeviceSession::unbound();
        let mut source = RemoteFrameSource::new(session.lease().unwrap());
        assert!(matches!(
            source.capture(),
            Err(CaptureError::Bridge(BridgeError::NotBound))
        ));
    }

    #[test]
    fn capture_budget_reaches_the_bridge() {
        let bridge = Arc::new(ScriptedBridge {
            screens: Mutex::new(vec![Ok(png(10))]),
            ..Default::default()
        });
        let session = DeviceSession::bound(Arc::clone(&bridge));
        let mut source = RemoteFrameSource::new(session.lease().unwrap());
        source.capture_within(Duration::from_millis(750)).unwrap();
        source.capture().unwrap();
        assert_eq!(
            *bridge.budgets.lock().unwrap(),
            vec![Some(Duration::from_millis(750)), None]
        );
    }
}

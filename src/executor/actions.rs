use enigo::Mouse as _;
use enigo::{Button, Coordinate, Direction, Enigo, Settings};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, trace};

use crate::bridge::{BridgeError, SessionLease};
use crate::model::Point;

/// Default length of the smoothed pointer move before a local click.
pub const DEFAULT_MOVE_DURATION: Duration = Duration::from_millis(500);

/// Interval between intermediate pointer positions during a smoothed move.
const MOVE_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("failed to initialize input injection: {0}")]
    Init(String),

    #[error("input injection failed: {0}")]
    Input(String),

    #[error("device tap failed")]
    Bridge(#[from] BridgeError),
}

/// Performs one pointer action at a point. Success only means the action was
/// dispatched; nothing confirms its on-screen effect.
pub trait Actuator {
    /// Static human-readable identifier (used in logs).
    fn name(&self) -> &'static str;

    fn act(&mut self, point: Point) -> Result<(), ActuatorError>;
}

impl<T: Actuator + ?Sized> Actuator for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn act(&mut self, point: Point) -> Result<(), ActuatorError> {
        (**self).act(point)
    }
}

/// Local input injection: smoothed move to the point, then a primary click.
/// In dry-run mode, actions are only logged and no real input is simulated.
pub struct LocalActuator {
    dry_run: bool,
    move_duration: Duration,
    enigo: Option<Enigo>,
}

impl LocalActuator {
    /// Create a new local actuator.
    /// - dry_run: when true, only logs instead of simulating real input.
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            move_duration: DEFAULT_MOVE_DURATION,
            enigo: None,
        }
    }

    /// Length of the pointer transition (zero jumps straight to the target).
    pub fn with_move_duration(mut self, duration: Duration) -> Self {
        self.move_duration = duration;
        self
    }

    /// Returns whether the actuator is currently in dry-run mode.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn smooth_move(&mut self, target: Point) -> Result<(), ActuatorError> {
        let ticks = (self.move_duration.as_millis() / MOVE_TICK.as_millis()).max(1) as u32;
        let tick = self.move_duration / ticks;
        let enigo = self.ensure_enigo()?;
        let (sx, sy) = enigo
            .location()
            .map_err(|e| ActuatorError::Input(e.to_string()))?;
        for step in 1..=ticks {
            let t = f64::from(step) / f64::from(ticks);
            let x = sx + ((target.x - sx) as f64 * t).round() as i32;
            let y = sy + ((target.y - sy) as f64 * t).round() as i32;
            enigo
                .move_mouse(x, y, Coordinate::Abs)
                .map_err(|e| ActuatorError::Input(e.to_string()))?;
            if step < ticks && !tick.is_zero() {
                thread::sleep(tick);
            }
        }
        Ok(())
    }

    fn ensure_enigo(&mut self) -> Result<&mut Enigo, ActuatorError> {
        if self.enigo.is_none() {
            trace!(target: "clickflow::actions", "Initializing Enigo");
            let enigo =
                Enigo::new(&Settings::default()).map_err(|e| ActuatorError::Init(e.to_string()))?;
            self.enigo = Some(enigo);
        }
        self.enigo
            .as_mut()
            .ok_or_else(|| ActuatorError::Init("Enigo unavailable".to_string()))
    }
}

impl Actuator for LocalActuator {
    fn name(&self) -> &'static str {
        "local"
    }

    fn act(&mut self, point: Point) -> Result<(), ActuatorError> {
        if self.dry_run {
            info!(target: "clickflow::actions", x = point.x, y = point.y, "DRY-RUN click");
            return Ok(());
        }
        trace!(target: "clickflow::actions", x = point.x, y = point.y, "click");
        self.smooth_move(point)?;
        let enigo = self.ensure_enigo()?;
        enigo
            .button(Button::Left, Direction::Click)
            .map_err(|e| ActuatorError::Input(e.to_string()))
    }
}

/// Remote actuator: dispatches a tap through the leased device bridge.
pub struct RemoteActuator {
    lease: SessionLease,
    dry_run: bool,
}

impl RemoteActuator {
    /// Building a remote actuator requires holding the session lease.
    pub fn new(lease: SessionLease, dry_run: bool) -> Self {
        Self { lease, dry_run }
    }
}

impl Actuator for RemoteActuator {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn act(&mut self, point: Point) -> Result<(), ActuatorError> {
        if self.dry_run {
            info!(
                target: "clickflow::actions",
                device = %self.lease.describe(), x = point.x, y = point.y,
                "DRY-RUN tap"
            );
            return Ok(());
        }
        trace!(target: "clickflow::actions", x = point.x, y = point.y, "tap");
        self.lease.tap(point.x, point.y)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::bridge::DeviceSession;
    use crate::bridge::testing::ScriptedBridge;

    #[test]
    fn dry_run_local_never_touches_input() {
        let mut actuator = LocalActuator::new(true);
        assert!(actuator.is_dry_run());
        actuator.act(Point::new(5, 5)).unwrap();
        assert!(actuator.enigo.is_none());
    }

    #[test]
    fn remote_tap_goes_through_the_lease() {
        let bridge = Arc::new(ScriptedBridge::default());
        let session = DeviceSession::bound(Arc::clone(&bridge));
        let mut actuator = RemoteActuator::new(session.lease().unwrap(), false);
        actuator.act(Point::new(120, 340)).unwrap();
        assert_eq!(*bridge.taps.lock().unwrap(), vec![(120, 340)]);
    }

    #[test]
    fn remote_dry_run_dispatches_nothing() {
        let bridge = Arc::new(ScriptedBridge::default());
        let session = DeviceSession::bound(Arc::clone(&bridge));
        let mut actuator = RemoteActuator::new(session.lease().unwrap(), true);
        actuator.act(Point::new(1, 2)).unwrap();
        assert!(bridge.taps.lock().unwrap().is_empty());
    }

    #[test]
    fn remote_tap_failure_is_reported() {
        let bridge = Arc::new(ScriptedBridge {
            screens: Mutex::new(Vec::new()),
            taps: Mutex::new(Vec::new()),
            fail_taps: true,
            ..Default::default()
        });
        let session = DeviceSession::bound(bridge);
        let mut actuator = RemoteActuator::new(session.lease().unwrap(), false);
        assert!(matches!(
            actuator.act(Point::new(1, 2)),
            Err(ActuatorError::Bridge(_))
        ));
    }
}

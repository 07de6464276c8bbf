/*!
Device-bridge layer: the request/response link to one remote handheld target.

The core depends on exactly two commands, "capture the full surface as an
encoded image" and "tap at (x, y)", expressed by the `DeviceBridge` trait.
`AdbBridge` implements it by spawning the `adb` executable.

Which device is targeted is decided outside the core: a `DeviceSession` is
created (or re-bound) by whoever manages device selection and is then handed to
runners explicitly. A session hands out at most one `SessionLease` at a time;
remote frame sources and actuators can only be built from a lease, so two runs
can never drive the same link concurrently.
*/

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

pub mod adb;

pub use adb::AdbBridge;

/// Errors raised by the device-bridge link.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no device is bound to the session")]
    NotBound,

    #[error("device session is already leased by another run")]
    Busy,

    #[error("failed to start '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("'{command}' did not finish within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("'{command}' produced no output")]
    EmptyOutput { command: String },

    #[error("I/O error talking to the device")]
    Io(#[from] io::Error),
}

/// A request/response channel to one remote target.
pub trait DeviceBridge: Send + Sync {
    /// Human-readable identifier of the target (used in logs).
    fn describe(&self) -> String;

    /// Capture the full surface as an encoded image, replacing the contents of `out`.
    fn screencap(&self, out: &mut Vec<u8>) -> Result<(), BridgeError>;

    /// `screencap`, waiting at most `budget` when that is shorter than the
    /// bridge's own command timeout.
    fn screencap_within(&self, out: &mut Vec<u8>, budget: Duration) -> Result<(), BridgeError> {
        let _ = budget;
        self.screencap(out)
    }

    /// Tap at surface coordinates.
    fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError>;
}

/// Explicit handle on the selected remote target.
pub struct DeviceSession {
    bridge: RwLock<Option<Arc<dyn DeviceBridge>>>,
    leased: AtomicBool,
}

impl DeviceSession {
    /// A session with no device selected yet.
    pub fn unbound() -> Arc<Self> {
        Arc::new(Self {
            bridge: RwLock::new(None),
            leased: AtomicBool::new(false),
        })
    }

    /// A session bound to `bridge`.
    pub fn bound(bridge: impl DeviceBridge + 'static) -> Arc<Self> {
        let session = Self::unbound();
        session.bind(bridge);
        session
    }

    /// Select (or replace) the target device.
    pub fn bind(&self, bridge: impl DeviceBridge + 'static) {
        debug!(target: "clickflow::bridge", device = %bridge.describe(), "Binding device session");
        *self.bridge.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(bridge));
    }

    /// Drop the selected device; in-flight commands keep their own handle.
    pub fn unbind(&self) {
        debug!(target: "clickflow::bridge", "Unbinding device session");
        *self.bridge.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_bound(&self) -> bool {
        self.bridge
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Take exclusive ownership of the link until every clone of the lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Result<SessionLease, BridgeError> {
        self.leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BridgeError::Busy)?;
        trace!(target: "clickflow::bridge", "Device session leased");
        Ok(SessionLease {
            guard: Arc::new(LeaseGuard {
                session: Arc::clone(self),
            }),
        })
    }

    fn current(&self) -> Result<Arc<dyn DeviceBridge>, BridgeError> {
        self.bridge
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BridgeError::NotBound)
    }
}

/// Exclusive right to use a `DeviceSession`. Clones share the same lease.
#[derive(Clone)]
pub struct SessionLease {
    guard: Arc<LeaseGuard>,
}

struct LeaseGuard {
    session: Arc<DeviceSession>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.session.leased.store(false, Ordering::Release);
        trace!(target: "clickflow::bridge", "Device session released");
    }
}

impl SessionLease {
    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.guard.session
    }

    pub fn screencap(&self, out: &mut Vec<u8>) -> Result<(), BridgeError> {
        self.guard.session.current()?.screencap(out)
    }

    pub fn screencap_within(&self, out: &mut Vec<u8>, budget: Duration) -> Result<(), BridgeError> {
        self.guard.session.current()?.screencap_within(out, budget)
    }

    pub fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError> {
        self.guard.session.current()?.tap(x, y)
    }

    pub fn describe(&self) -> String {
        self.guard
            .session
            .current()
            .map(|b| b.describe())
            .unwrap_or_else(|_| "<unbound>".to_string())
    }
}

//! `adb`-backed device bridge.
//!
//! Each command spawns `adb [-s <serial>] ...` through `tokio::process` and
//! waits for its output under a deadline. The child is killed when the wait is
//! abandoned. Bridge calls are synchronous: they drive the command on the
//! ambient runtime handle (runs execute on a blocking worker) or on a
//! throwaway current-thread runtime when no runtime is around.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tracing::{debug, trace, warn};

use super::{BridgeError, DeviceBridge};

/// Default deadline for a single adb command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridge to one Android device through the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    program: PathBuf,
    serial: Option<String>,
    timeout: Duration,
}

impl AdbBridge {
    /// Bridge to the default device (the only one attached).
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            serial: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Target a specific device serial (`adb -s <serial>`).
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Arguments for `adb`, including the device selector.
    fn args<'a>(&'a self, command: &[&'a str]) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(command.len() + 2);
        if let Some(serial) = &self.serial {
            args.push("-s");
            args.push(serial.as_str());
        }
        args.extend_from_slice(command);
        args
    }

    /// Run an adb command under the bridge timeout, collecting stdout into `out`.
    fn run(&self, command: &[&str], out: &mut Vec<u8>) -> Result<(), BridgeError> {
        self.run_for(command, out, self.timeout)
    }

    fn run_for(&self, command: &[&str], out: &mut Vec<u8>, timeout: Duration) -> Result<(), BridgeError> {
        let label = format!("adb {}", command.join(" "));
        trace!(target: "clickflow::bridge", command = %label, serial = ?self.serial, ?timeout, "Spawning adb");

        let output = block_on(self.execute(command, &label, timeout))??;
        if !output.status.success() {
            return Err(BridgeError::CommandFailed {
                command: label,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        out.clear();
        out.extend_from_slice(&output.stdout);
        debug!(target: "clickflow::bridge", command = %label, bytes = out.len(), "adb command finished");
        Ok(())
    }

    async fn execute(
        &self,
        command: &[&str],
        label: &str,
        timeout: Duration,
    ) -> Result<Output, BridgeError> {
        let child = Command::new(&self.program)
            .args(self.args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                warn!(target: "clickflow::bridge", command = %label, "adb command timed out; killing");
                Err(BridgeError::Timeout {
                    command: label.to_string(),
                    after: timeout,
                })
            }
        }
    }
}

/// Drive `future` to completion from synchronous code.
fn block_on<F: Future>(future: F) -> Result<F::Output, BridgeError> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            Ok(runtime.block_on(future))
        }
    }
}

impl DeviceBridge for AdbBridge {
    fn describe(&self) -> String {
        match &self.serial {
            Some(serial) => format!("adb:{serial}"),
            None => "adb:default".to_string(),
        }
    }

    fn screencap(&self, out: &mut Vec<u8>) -> Result<(), BridgeError> {
        self.screencap_within(out, self.timeout)
    }

    fn screencap_within(&self, out: &mut Vec<u8>, budget: Duration) -> Result<(), BridgeError> {
        self.run_for(&["exec-out", "screencap", "-p"], out, budget.min(self.timeout))?;
        if out.is_empty() {
            return Err(BridgeError::EmptyOutput {
                command: "adb exec-out screencap -p".to_string(),
            });
        }
        Ok(())
    }

    fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError> {
        let (x, y) = (x.to_string(), y.to_string());
        let mut sink = Vec::new();
        self.run(&["shell", "input", "tap", x.as_str(), y.as_str()], &mut sink)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn serial_is_prepended() {
        let bridge = AdbBridge::new("adb").with_serial("emulator-5554");
        assert_eq!(
            bridge.args(&["shell", "input", "tap", "1", "2"]),
            vec!["-s", "emulator-5554", "shell", "input", "tap", "1", "2"]
        );
        assert_eq!(bridge.describe(), "adb:emulator-5554");
    }

    #[test]
    fn default_device_has_no_selector() {
        let bridge = AdbBridge::new("adb");
        assert_eq!(bridge.args(&["exec-out"]), vec!["exec-out"]);
        assert_eq!(bridge.describe(), "adb:default");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let bridge = AdbBridge::new("/nonexistent/clickflow-adb");
        let err = bridge.tap(1, 1).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_times_out() {
        // Any long-running executable stands in for a hung adb.
        let bridge = AdbBridge::new("sleep").with_timeout(Duration::from_millis(50));
        let mut out = Vec::new();
        let started = Instant::now();
        let err = bridge.run(&["5"], &mut out).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn shorter_budget_cuts_the_command_early() {
        let bridge = AdbBridge::new("sleep");
        let mut out = Vec::new();
        let started = Instant::now();
        let err = bridge
            .run_for(&["5"], &mut out, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Timeout { after, .. } if after == Duration::from_millis(50)
        ));
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_status() {
        let bridge = AdbBridge::new("false");
        let err = bridge.tap(3, 4).unwrap_err();
        assert!(matches!(err, BridgeError::CommandFailed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_is_collected() {
        let bridge = AdbBridge::new("echo");
        let mut out = Vec::new();
        bridge.run(&["frame"], &mut out).unwrap();
        assert_eq!(out, b"frame\n");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn commands_run_on_a_blocking_worker() {
        let bridge = AdbBridge::new("sleep").with_timeout(Duration::from_millis(50));
        let err = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            bridge.run(&["5"], &mut out)
        })
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
    }
}

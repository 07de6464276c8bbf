use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{AdbBridge, BridgeError, DeviceSession};
use crate::capture::{LocalFrameSource, RemoteFrameSource};
use crate::config::{DetectMode, Settings};
use crate::executor::actions::{LocalActuator, RemoteActuator};
use crate::executor::clock::pause;
use crate::executor::events::{EventSink, RunEvent};
use crate::executor::step::{StepFailure, StepRunner};
use crate::matcher::TemplateMatcher;
use crate::model::{CompiledSequence, FailureReason, RunResult};

/// Default pause between consecutive steps.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Runs a compiled sequence step by step, stopping at the first failure.
pub struct SequenceRunner {
    steps: StepRunner,
    settle_delay: Duration,
}

impl SequenceRunner {
    pub fn new(steps: StepRunner) -> Self {
        Self {
            steps,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Pause inserted before every step but the first.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Build a runner for the configured detect mode.
    ///
    /// Remote mode leases `session` (or a fresh adb session when `None`) for the
    /// runner's whole lifetime; a second runner on the same session fails with
    /// `BridgeError::Busy` until this one is dropped.
    pub fn from_settings(
        settings: &Settings,
        session: Option<Arc<DeviceSession>>,
    ) -> Result<Self, BridgeError> {
        let step_runner = match settings.detect_mode {
            DetectMode::Local => StepRunner::new(
                LocalFrameSource::new(),
                LocalActuator::new(settings.dry_run).with_move_duration(settings.move_duration()),
            ),
            DetectMode::Remote => {
                let session = session.unwrap_or_else(|| adb_session(settings));
                let lease = session.lease()?;
                info!(
                    target: "clickflow::runtime",
                    device = %lease.describe(),
                    "Leased device session"
                );
                StepRunner::new(
                    RemoteFrameSource::new(lease.clone()),
                    RemoteActuator::new(lease, settings.dry_run),
                )
            }
        };

        let step_runner = step_runner
            .with_matcher(TemplateMatcher::new().with_coarse_levels(settings.coarse_levels))
            .with_poll_interval(settings.poll_interval())
            .with_capture_retries(settings.capture_retries);

        Ok(Self::new(step_runner).with_settle_delay(settings.settle_delay()))
    }

    /// Run without listeners or cancellation.
    pub fn run(&mut self, sequence: &CompiledSequence) -> RunResult {
        self.run_with(sequence, &EventSink::none(), &CancellationToken::new())
    }

    /// Run every step in order. The result's `last_completed_index` is the index
    /// of the last step that reached `Done`.
    pub fn run_with(
        &mut self,
        sequence: &CompiledSequence,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> RunResult {
        let total = sequence.len();
        info!(target: "clickflow::runtime", steps = total, "Starting run");
        events.emit(RunEvent::RunStarted { total });

        for (index, step) in sequence.iter().enumerate() {
            let outcome = self.settle(index, cancel).and_then(|()| {
                events.emit(RunEvent::StepStarted {
                    index,
                    total,
                    name: step.name().to_string(),
                });
                self.steps.run(index, step, events, cancel)
            });

            match outcome {
                Ok(report) => {
                    info!(
                        target: "clickflow::runtime",
                        step = index + 1,
                        total,
                        name = %step.name(),
                        click = %report.click_point,
                        confidence = report.confidence,
                        "Step completed"
                    );
                    events.emit(RunEvent::StepSucceeded { index, report });
                }
                Err(failure) => {
                    let reason = failure_reason(index, step.name(), &failure);
                    warn!(
                        target: "clickflow::runtime",
                        step = index + 1,
                        total,
                        name = %step.name(),
                        kind = ?reason.kind,
                        "{}", reason.message
                    );
                    events.emit(RunEvent::StepFailed {
                        index,
                        reason: reason.to_string(),
                    });
                    let result = RunResult::failed(index, reason);
                    events.emit(RunEvent::RunFinished(result.clone()));
                    return result;
                }
            }
        }

        info!(target: "clickflow::runtime", steps = total, "Run completed");
        let result = RunResult::completed(total);
        events.emit(RunEvent::RunFinished(result.clone()));
        result
    }

    fn settle(&self, index: usize, cancel: &CancellationToken) -> Result<(), StepFailure> {
        if index > 0 && !self.settle_delay.is_zero() {
            pause(&**self.steps.clock(), self.settle_delay, cancel)?;
        }
        Ok(())
    }
}

/// Run `sequence` on a blocking worker thread.
///
/// The runner is built on that thread by `factory`, since local input handles
/// may not be movable across threads. Cancel through `cancel`; the returned
/// handle resolves once the run has stopped.
pub fn spawn_run<F>(
    factory: F,
    sequence: CompiledSequence,
    events: EventSink,
    cancel: CancellationToken,
) -> JoinHandle<Result<RunResult, BridgeError>>
where
    F: FnOnce() -> Result<SequenceRunner, BridgeError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut runner = factory()?;
        Ok(runner.run_with(&sequence, &events, &cancel))
    })
}

fn adb_session(settings: &Settings) -> Arc<DeviceSession> {
    let mut bridge = AdbBridge::new(&settings.adb_path).with_timeout(settings.bridge_timeout());
    if let Some(serial) = &settings.device_serial {
        bridge = bridge.with_serial(serial.clone());
    }
    DeviceSession::bound(bridge)
}

fn failure_reason(index: usize, name: &str, failure: &StepFailure) -> FailureReason {
    FailureReason {
        step_index: index,
        step_name: name.to_string(),
        kind: failure.kind(),
        message: failure.describe(),
    }
}

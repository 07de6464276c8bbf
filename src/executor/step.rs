//! Step runner: drives one step through capture → match → act.
//!
//! States: `Searching → Found → Acting → Done`, or `Searching → TimedOut`.
//!
//! - Capture failures are retried up to `capture_retries` consecutive times,
//!   then fail the step.
//! - A score below the threshold is not an error; the runner waits one poll
//!   interval (clipped to the deadline) and captures again.
//! - The deadline is checked after every scored capture, so a search that never
//!   reaches the threshold ends at the deadline and never a full poll later.
//!   Captures after the first are bounded too: matching stops as soon as the
//!   deadline passes, and a remote capture waits at most the remaining time
//!   (never less than one poll interval).
//! - Any actuator failure ends the step; there is no partial success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capture::{CaptureError, FrameSource};
use crate::executor::actions::{Actuator, ActuatorError};
use crate::executor::clock::{Cancelled, Clock, SystemClock, pause};
use crate::executor::events::{EventSink, RunEvent};
use crate::matcher::{MatchError, TemplateMatcher};
use crate::model::{FailureKind, Point, ReferenceError, Step, StepSettings};

/// Default pause between captures while searching.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive capture failures tolerated before a step fails.
pub const MAX_CAPTURE_RETRIES: u32 = 3;

/// Step runner states.
#[derive(Debug, Copy, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Searching,
    Found,
    Acting,
    Done,
    TimedOut,
}

/// Successful step outcome.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepReport {
    /// Where the actions were performed.
    pub click_point: Point,
    /// Top-left corner of the match.
    pub location: Point,
    pub confidence: f64,
    pub elapsed: Duration,
    pub captures: u32,
}

/// Why a step did not reach `Done`.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("no match above {threshold} within {elapsed:.1?} (best confidence {best_confidence:.3})")]
    TimedOut {
        elapsed: Duration,
        best_confidence: f64,
        threshold: f64,
    },

    #[error("capture failed {attempts} times in a row")]
    CaptureFailed {
        attempts: u32,
        #[source]
        source: CaptureError,
    },

    #[error("action {repeat} failed")]
    ActuatorFailed {
        repeat: u32,
        #[source]
        source: ActuatorError,
    },

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error("run cancelled")]
    Cancelled,
}

impl From<Cancelled> for StepFailure {
    fn from(_: Cancelled) -> Self {
        StepFailure::Cancelled
    }
}

impl StepFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            StepFailure::TimedOut { .. } => FailureKind::TimedOut,
            StepFailure::CaptureFailed { .. } => FailureKind::CaptureFailed,
            StepFailure::ActuatorFailed { .. } => FailureKind::ActuatorFailed,
            StepFailure::Reference(_) => FailureKind::ReferenceUnreadable,
            StepFailure::Match(_) => FailureKind::MatchFailed,
            StepFailure::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Message including the chain of sources.
    pub fn describe(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            message.push_str(": ");
            message.push_str(&err.to_string());
            source = err.source();
        }
        message
    }
}

/// Runs single steps against one frame source and one actuator.
pub struct StepRunner {
    frames: Box<dyn FrameSource>,
    actuator: Box<dyn Actuator>,
    matcher: TemplateMatcher,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    capture_retries: u32,
}

impl StepRunner {
    pub fn new(frames: impl FrameSource + 'static, actuator: impl Actuator + 'static) -> Self {
        Self {
            frames: Box::new(frames),
            actuator: Box::new(actuator),
            matcher: TemplateMatcher::new(),
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
            capture_retries: MAX_CAPTURE_RETRIES,
        }
    }

    pub fn with_matcher(mut self, matcher: TemplateMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_capture_retries(mut self, retries: u32) -> Self {
        self.capture_retries = retries;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one step with no listener and no cancellation.
    pub fn run_step(&mut self, step: &Step) -> Result<StepReport, StepFailure> {
        self.run(0, step, &EventSink::none(), &CancellationToken::new())
    }

    /// Run one step; `index` only labels events and logs.
    pub fn run(
        &mut self,
        index: usize,
        step: &Step,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<StepReport, StepFailure> {
        let settings = step.settings;
        let template = step.image.pixels()?;
        let started = self.clock.now();
        let deadline = started + settings.search_timeout;

        info!(
            target: "clickflow::step",
            step = index + 1,
            name = %step.name(),
            timeout = ?settings.search_timeout,
            threshold = settings.confidence_threshold,
            "Searching for reference image"
        );
        transition(events, index, StepState::Searching);

        let mut best_confidence = f64::NEG_INFINITY;
        let mut failures = 0u32;
        let mut captures = 0u32;

        let clock = Arc::clone(&self.clock);
        let expired = || cancel.is_cancelled() || clock.now() > deadline;
        let never = || false;

        let found = loop {
            if cancel.is_cancelled() {
                return Err(StepFailure::Cancelled);
            }

            let budget = deadline
                .saturating_duration_since(self.clock.now())
                .max(self.poll_interval);
            match self.frames.capture_within(budget) {
                Ok(frame) => {
                    failures = 0;
                    captures += 1;
                    // The first capture is always scored in full, even with a zero timeout.
                    let stop: &dyn Fn() -> bool = if captures == 1 { &never } else { &expired };
                    let outcome = match self.matcher.match_until(frame.pixels(), template, stop) {
                        Ok(outcome) => outcome,
                        Err(MatchError::Interrupted) if cancel.is_cancelled() => {
                            return Err(StepFailure::Cancelled);
                        }
                        Err(MatchError::Interrupted) => {
                            trace!(target: "clickflow::step", step = index + 1, "Search cut at the deadline");
                            transition(events, index, StepState::TimedOut);
                            return Err(StepFailure::TimedOut {
                                elapsed: elapsed_since(&*self.clock, started),
                                best_confidence: best_confidence.max(0.0),
                                threshold: settings.confidence_threshold,
                            });
                        }
                        Err(err) => return Err(err.into()),
                    };
                    best_confidence = best_confidence.max(outcome.confidence);
                    if outcome.confidence >= settings.confidence_threshold {
                        break outcome;
                    }
                    let remaining = deadline.saturating_duration_since(self.clock.now());
                    trace!(
                        target: "clickflow::step",
                        step = index + 1,
                        confidence = outcome.confidence,
                        remaining = ?remaining,
                        "Below threshold"
                    );
                    events.emit(RunEvent::BelowThreshold {
                        index,
                        confidence: outcome.confidence,
                        remaining,
                    });
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.capture_retries {
                        return Err(StepFailure::CaptureFailed {
                            attempts: failures,
                            source: err,
                        });
                    }
                    warn!(
                        target: "clickflow::step",
                        step = index + 1,
                        attempt = failures,
                        source = %self.frames.name(),
                        error = %err,
                        "Capture failed; retrying"
                    );
                    events.emit(RunEvent::CaptureRetry {
                        index,
                        attempt: failures,
                        error: err.to_string(),
                    });
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                transition(events, index, StepState::TimedOut);
                return Err(StepFailure::TimedOut {
                    elapsed: now - started,
                    best_confidence: best_confidence.max(0.0),
                    threshold: settings.confidence_threshold,
                });
            }
            pause(&*self.clock, self.poll_interval.min(deadline - now), cancel)?;
        };

        transition(events, index, StepState::Found);
        let click_point = found.click_point();
        debug!(
            target: "clickflow::step",
            step = index + 1,
            location = %found.location,
            click = %click_point,
            confidence = found.confidence,
            "Reference image found"
        );

        transition(events, index, StepState::Acting);
        self.act_repeatedly(click_point, &settings, cancel)?;

        let report = StepReport {
            click_point,
            location: found.location,
            confidence: found.confidence,
            elapsed: elapsed_since(&*self.clock, started),
            captures,
        };
        transition(events, index, StepState::Done);
        Ok(report)
    }

    fn act_repeatedly(
        &mut self,
        point: Point,
        settings: &StepSettings,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let count = settings.repeat_count.max(1);
        for repeat in 1..=count {
            if cancel.is_cancelled() {
                return Err(StepFailure::Cancelled);
            }
            self.actuator
                .act(point)
                .map_err(|source| StepFailure::ActuatorFailed { repeat, source })?;
            trace!(
                target: "clickflow::step",
                actuator = %self.actuator.name(),
                repeat, count, %point,
                "Action dispatched"
            );
            if repeat < count {
                pause(&*self.clock, settings.repeat_interval, cancel)?;
            }
        }
        Ok(())
    }
}

fn transition(events: &EventSink, index: usize, state: StepState) {
    debug!(target: "clickflow::step", step = index + 1, ?state, "Step state");
    events.emit(RunEvent::StateChanged { index, state });
}

fn elapsed_since(clock: &dyn Clock, started: Instant) -> Duration {
    clock.now().saturating_duration_since(started)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;

    use image::{ImageFormat, RgbImage, imageops};
    use tokio::sync::mpsc;

    use super::*;
    use crate::bridge::DeviceSession;
    use crate::bridge::testing::ScriptedBridge;
    use crate::capture::RemoteFrameSource;
    use crate::capture::testing::ScriptedFrames;
    use crate::executor::actions::testing::RecordingActuator;
    use crate::executor::clock::testing::ManualClock;
    use crate::matcher::testing::{gray, noise};
    use crate::model::ReferenceImage;

    /// Frame with a bright square at (20, 10) on a gradient background.
    fn scene() -> RgbImage {
        RgbImage::from_fn(64, 48, |x, y| {
            if (20..30).contains(&x) && (10..16).contains(&y) {
                gray(((x * 7 + y * 13) % 200 + 40) as u8)
            } else {
                gray(((x + y) % 23) as u8)
            }
        })
    }

    fn target() -> ReferenceImage {
        ReferenceImage::from_pixels(
            "button.png",
            imageops::crop_imm(&scene(), 20, 10, 10, 6).to_image(),
        )
    }

    fn blank() -> RgbImage {
        RgbImage::from_fn(64, 48, |x, _| gray((x % 5) as u8))
    }

    fn runner(frames: ScriptedFrames, actuator: RecordingActuator, clock: Arc<ManualClock>) -> StepRunner {
        StepRunner::new(frames, actuator)
            .with_clock(clock)
            .with_poll_interval(Duration::from_millis(500))
    }

    #[test]
    fn first_capture_at_threshold_is_found() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::always(scene());
        let actuator = RecordingActuator::default();
        let mut runner = runner(frames.clone(), actuator.clone(), clock.clone());

        let step = Step::new(target(), StepSettings::default());
        let report = runner.run_step(&step).unwrap();

        assert_eq!(frames.count(), 1);
        assert_eq!(report.location, Point::new(20, 10));
        assert_eq!(report.click_point, Point::new(25, 13));
        assert_eq!(actuator.recorded(), vec![Point::new(25, 13)]);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn threshold_is_inclusive() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::always(scene());
        let mut runner = runner(frames, RecordingActuator::default(), clock);
        let exact = TemplateMatcher::new()
            .match_template(&scene(), target().pixels().unwrap())
            .unwrap()
            .confidence;
        let step = Step::new(target(), StepSettings::default().with_threshold(exact));
        assert!(runner.run_step(&step).is_ok());
    }

    #[test]
    fn never_matching_times_out_at_the_deadline() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::always(blank());
        let actuator = RecordingActuator::default();
        let mut runner = runner(frames.clone(), actuator.clone(), clock.clone());

        let timeout = Duration::from_millis(2300);
        let step = Step::new(target(), StepSettings::default().with_timeout(timeout));
        let err = runner.run_step(&step).unwrap_err();

        match err {
            StepFailure::TimedOut { elapsed, best_confidence, .. } => {
                assert!(elapsed >= timeout);
                assert!(elapsed < timeout + Duration::from_millis(500));
                assert!(best_confidence < 0.9);
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(clock.elapsed(), timeout);
        // Captures at 0, 0.5, 1.0, 1.5, 2.0 and the clipped final one at 2.3.
        assert_eq!(frames.count(), 6);
        assert!(actuator.recorded().is_empty());
    }

    #[test]
    fn zero_timeout_still_captures_once() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::always(blank());
        let mut runner = runner(frames.clone(), RecordingActuator::default(), clock);
        let step = Step::new(target(), StepSettings::default().with_timeout(Duration::ZERO));
        assert!(matches!(runner.run_step(&step), Err(StepFailure::TimedOut { .. })));
        assert_eq!(frames.count(), 1);
    }

    #[test]
    fn match_appearing_later_is_found() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::new(vec![Ok(blank()), Ok(blank()), Ok(scene())]);
        let mut runner = runner(frames, RecordingActuator::default(), clock.clone());
        let step = Step::new(target(), StepSettings::default());
        let report = runner.run_step(&step).unwrap();
        assert_eq!(report.captures, 3);
        assert_eq!(report.elapsed, Duration::from_millis(1000));
    }

    #[test]
    fn transient_capture_failures_are_absorbed() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::new(vec![
            Err("busy".into()),
            Err("busy".into()),
            Err("busy".into()),
            Ok(scene()),
        ]);
        let mut runner = runner(frames, RecordingActuator::default(), clock);
        let step = Step::new(target(), StepSettings::default());
        assert!(runner.run_step(&step).is_ok());
    }

    #[test]
    fn persistent_capture_failure_fails_the_step() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::new(vec![Err("gone".into())]);
        let mut runner = runner(frames.clone(), RecordingActuator::default(), clock);
        let step = Step::new(target(), StepSettings::default());
        let err = runner.run_step(&step).unwrap_err();
        assert!(matches!(err, StepFailure::CaptureFailed { attempts: 4, .. }));
        assert_eq!(err.kind(), FailureKind::CaptureFailed);
        assert_eq!(frames.count(), 4);
    }

    #[test]
    fn repeats_are_spaced_by_the_interval() {
        let clock = Arc::new(ManualClock::new());
        let actuator = RecordingActuator::default();
        let mut runner = runner(ScriptedFrames::always(scene()), actuator.clone(), clock.clone());
        let settings = StepSettings::default().with_repeats(3, Duration::from_millis(250));
        runner.run_step(&Step::new(target(), settings)).unwrap();
        assert_eq!(actuator.recorded().len(), 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[test]
    fn actuator_failure_aborts_without_retry() {
        let clock = Arc::new(ManualClock::new());
        let actuator = RecordingActuator::failing_on(2);
        let mut runner = runner(ScriptedFrames::always(scene()), actuator.clone(), clock);
        let settings = StepSettings::default().with_repeats(3, Duration::from_millis(100));
        let err = runner.run_step(&Step::new(target(), settings)).unwrap_err();
        assert!(matches!(err, StepFailure::ActuatorFailed { repeat: 2, .. }));
        assert_eq!(actuator.recorded().len(), 1);
        assert!(err.describe().contains("injected failure"));
    }

    #[test]
    fn oversized_reference_is_a_match_failure() {
        let clock = Arc::new(ManualClock::new());
        let big = ReferenceImage::from_pixels("big.png", RgbImage::new(100, 100));
        let mut runner = runner(ScriptedFrames::always(scene()), RecordingActuator::default(), clock);
        let err = runner
            .run_step(&Step::new(big, StepSettings::default()))
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::MatchFailed);
    }

    #[test]
    fn cancelled_token_stops_before_capturing() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::always(scene());
        let mut runner = runner(frames.clone(), RecordingActuator::default(), clock);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let step = Step::new(target(), StepSettings::default());
        let err = runner.run(0, &step, &EventSink::none(), &cancel).unwrap_err();
        assert!(matches!(err, StepFailure::Cancelled));
        assert_eq!(frames.count(), 0);
    }

    #[test]
    fn state_transitions_are_reported_in_order() {
        let clock = Arc::new(ManualClock::new());
        let frames = ScriptedFrames::new(vec![Ok(blank()), Ok(scene())]);
        let mut runner = runner(frames, RecordingActuator::default(), clock);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let step = Step::new(target(), StepSettings::default());
        runner
            .run(4, &step, &EventSink::new(tx), &CancellationToken::new())
            .unwrap();

        let mut states = Vec::new();
        let mut below = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::StateChanged { index, state } => {
                    assert_eq!(index, 4);
                    states.push(state);
                }
                RunEvent::BelowThreshold { .. } => below += 1,
                _ => {}
            }
        }
        assert_eq!(
            states,
            vec![StepState::Searching, StepState::Found, StepState::Acting, StepState::Done]
        );
        assert_eq!(below, 1);
    }

    #[test]
    fn screen_sized_search_stops_at_the_timeout() {
        let absent = ReferenceImage::from_pixels("absent.png", noise(120, 60, 22));
        let poll = Duration::from_millis(500);
        let timeout = Duration::from_secs(2);
        let mut runner = StepRunner::new(
            ScriptedFrames::always(noise(1920, 1080, 21)),
            RecordingActuator::default(),
        )
        .with_poll_interval(poll);

        let started = Instant::now();
        let err = runner
            .run_step(&Step::new(absent, StepSettings::default().with_timeout(timeout)))
            .unwrap_err();
        let wall = started.elapsed();

        match err {
            StepFailure::TimedOut { elapsed, best_confidence, .. } => {
                assert!(elapsed >= timeout, "{elapsed:?}");
                assert!(elapsed < timeout + poll, "{elapsed:?}");
                assert!(best_confidence < 0.5);
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert!(wall < timeout + poll, "{wall:?}");
    }

    #[test]
    fn remote_capture_wait_is_clipped_to_the_deadline() {
        let mut png = Vec::new();
        blank()
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        let bridge = Arc::new(ScriptedBridge {
            screens: Mutex::new(vec![Ok(png)]),
            ..Default::default()
        });
        let session = DeviceSession::bound(Arc::clone(&bridge));
        let frames = RemoteFrameSource::new(session.lease().unwrap());
        let clock = Arc::new(ManualClock::new());
        let mut runner = StepRunner::new(frames, RecordingActuator::default())
            .with_clock(clock)
            .with_poll_interval(Duration::from_millis(500));

        let step = Step::new(target(), StepSettings::default().with_timeout(Duration::from_secs(2)));
        assert!(matches!(runner.run_step(&step), Err(StepFailure::TimedOut { .. })));

        let ms = |v| Some(Duration::from_millis(v));
        assert_eq!(
            *bridge.budgets.lock().unwrap(),
            vec![ms(2000), ms(1500), ms(1000), ms(500), ms(500)]
        );
    }
}

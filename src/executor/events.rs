//! Status notifications from the worker thread to the presentation side.
//!
//! Delivery is one-way and fire-and-forget: a run never waits on, or fails
//! because of, whoever listens.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::executor::step::{StepReport, StepState};
use crate::model::RunResult;

/// Progress notification emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        total: usize,
    },
    StepStarted {
        index: usize,
        total: usize,
        name: String,
    },
    StateChanged {
        index: usize,
        state: StepState,
    },
    /// A capture was scored below the threshold.
    BelowThreshold {
        index: usize,
        confidence: f64,
        remaining: Duration,
    },
    CaptureRetry {
        index: usize,
        attempt: u32,
        error: String,
    },
    StepSucceeded {
        index: usize,
        report: StepReport,
    },
    StepFailed {
        index: usize,
        reason: String,
    },
    RunFinished(RunResult),
}

/// Optional sender side of the status channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub fn new(sender: UnboundedSender<RunEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Sink that drops every event.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.sender {
            // A closed receiver just means nobody is listening anymore.
            let _ = sender.send(event);
        }
    }
}

impl From<UnboundedSender<RunEvent>> for EventSink {
    fn from(sender: UnboundedSender<RunEvent>) -> Self {
        Self::new(sender)
    }
}

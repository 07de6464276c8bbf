#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

/*!
Executor module for Clickflow.

This module wires together:
- `actions`: actuators performing the pointer action (local input or device tap)
- `clock`: time source and cancellation-aware pauses
- `events`: progress notifications sent to whoever presents the run
- `step`: the per-step search/act state machine
- `runtime`: sequence execution and the background worker

Typical usage:
- Compile or load a `CompiledSequence`.
- Build a `SequenceRunner` from `Settings` (or from a hand-made `StepRunner`).
- Call `SequenceRunner::run`, or `spawn_run` to keep the caller responsive.

Example:
```no_run
use clickflow::config::Settings;
use clickflow::executor::SequenceRunner;
use clickflow::model::CompiledSequence;

let settings = Settings { dry_run: true, ..Settings::default() };
let mut runner = SequenceRunner::from_settings(&settings, None)?;
let result = runner.run(&CompiledSequence::default());
assert!(result.success);
# Ok::<(), clickflow::bridge::BridgeError>(())
```
*/

pub mod actions;
pub mod clock;
pub mod events;
pub mod runtime;
pub mod step;

pub use actions::{Actuator, ActuatorError, LocalActuator, RemoteActuator};
pub use clock::{Clock, SystemClock};
pub use events::{EventSink, RunEvent};
pub use runtime::{SequenceRunner, spawn_run};
pub use step::{StepFailure, StepReport, StepRunner, StepState};

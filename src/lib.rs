#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Clickflow — image-matching click automation.
//!
//! A run walks an ordered list of steps. Each step waits until its reference
//! image shows up on the target surface, then clicks (or taps) its center.
//! - `model`: shared data types (points, reference images, steps, run results).
//! - `capture`: frame sources (local display, remote device).
//! - `matcher`: normalized cross-correlation template matching.
//! - `bridge`: device-bridge link and exclusive device sessions.
//! - `executor`: actuators, the step state machine, and the sequence runner.
//! - `graph`: editable flow graphs and the graph compiler.
//! - `config`: runtime settings, loader, and schema helpers.
//! - `project`: project file persistence.
//!
//! Use `clickflow::prelude::*` to bring commonly used items into scope quickly.

/// Public module: device-bridge link and sessions.
pub mod bridge;
/// Public module: frame sources.
pub mod capture;
/// Public module: runtime settings (models, loader, schema helpers).
pub mod config;
/// Public module: execution engine (actuators, step and sequence runners).
pub mod executor;
/// Public module: flow graph and compiler.
pub mod graph;
/// Public module: template matching.
pub mod matcher;
/// Public module: shared data model (points, reference images, steps, results).
pub mod model;
/// Public module: project file persistence.
pub mod project;

/// Crate-level constants for consumers that want to inspect package metadata at runtime.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version (e.g., "0.1.0").
#[inline]
pub const fn version() -> &'static str {
    PKG_VERSION
}

/// Parse a log level name (trace|debug|info|warn|error).
pub fn parse_level(name: &str) -> Option<tracing::Level> {
    use tracing::Level;

    match name.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize tracing (logging) with a reasonable default.
/// - Honors the `RUST_LOG` environment variable if set.
/// - Falls back to `info` level.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_tracing() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(tracing::Level::INFO);
    init_tracing_with_level(level);
}

/// Initialize tracing at a fixed maximum level.
pub fn init_tracing_with_level(level: tracing::Level) {
    // Ignore the error if the global subscriber was already set.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

/// A convenient set of exports for most consumers.
///
/// Bring this into scope with:
/// `use clickflow::prelude::*;`
pub mod prelude {
    // Common result/error handling
    pub use anyhow::{Context, Error, Result, anyhow, bail, ensure};

    // Serialization
    pub use serde::{Deserialize, Serialize};

    // Tracing macros
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use std::time::Duration;
    pub use tokio_util::sync::CancellationToken;

    pub use crate as clickflow;

    pub use crate::config::{DetectMode, Settings};
    pub use crate::executor::{EventSink, RunEvent, SequenceRunner, StepRunner, spawn_run};
    pub use crate::graph::{CompileOptions, FlowGraph, Position, compile, compile_with};
    pub use crate::matcher::TemplateMatcher;
    pub use crate::model::{CompiledSequence, Point, ReferenceImage, RunResult, Step, StepSettings};

    // Frequently used internal modules
    pub use crate::{bridge, capture, config, executor, graph, model, project};
}

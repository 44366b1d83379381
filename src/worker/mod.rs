//! Worker runtime: executes registered job handlers as fenced attempts.
//!
//! - `runtime`: handler registry, attempt slots, dispatch and resume
//! - `context`: per-attempt handle for progress, events and checkpoints

pub mod context;
pub mod runtime;

pub use context::WorkerContext;
pub use runtime::{JobHandler, WorkerOutcome, WorkerRuntime};

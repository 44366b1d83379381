//! Jobs: state machine, event log semantics, checkpoints and crash recovery.

pub mod event;
pub mod manager;
pub mod model;
pub mod sweep;

pub use event::{Event, EventKind, Judgment};
pub use manager::{JobManager, Resumed};
pub use model::{Actor, Checkpoint, Job, JobState, StateTransition};
pub use sweep::spawn_crash_sweep;

//! Client-side subscriber helpers: per-job ordering, dedup and gap detection.

pub mod tracker;

pub use tracker::{Cursors, SequenceTracker};

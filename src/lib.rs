//! job-relay: resumable job orchestration with realtime event fan-out.

pub mod api;
pub mod app;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod store;
pub mod worker;

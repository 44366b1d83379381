//! Error types for job-relay.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::model::JobState;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors. `InvalidTransition` and `NoCheckpointAvailable`
/// are returned synchronously to producers and API callers.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: JobState,
        target: JobState,
    },

    #[error("Job {id} has no checkpoint to resume from")]
    NoCheckpointAvailable { id: Uuid },

    #[error("Job {id} already finished as {state}")]
    JobTerminal { id: Uuid, state: JobState },

    #[error("Job {id} is {state} and does not accept producer events")]
    NotAccepting { id: Uuid, state: JobState },

    #[error("Job {id} is on attempt {current}, writer holds stale attempt {attempt}")]
    StaleAttempt { id: Uuid, attempt: u32, current: u32 },

    #[error("Invalid event: {reason}")]
    InvalidEvent { reason: String },

    #[error("Invalid owner id {owner_id:?}: {reason}")]
    InvalidOwner { owner_id: String, reason: String },

    #[error("Checkpoint payload is {size} bytes, limit is {max}")]
    CheckpointTooLarge { size: usize, max: usize },

    #[error("Storage failure: {0}")]
    Database(#[from] DatabaseError),
}

impl JobError {
    /// Stable machine-readable code used in API and protocol error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NoCheckpointAvailable { .. } => "no_checkpoint_available",
            Self::JobTerminal { .. } => "job_terminal",
            Self::NotAccepting { .. } => "not_accepting",
            Self::StaleAttempt { .. } => "stale_attempt",
            Self::InvalidEvent { .. } => "invalid_event",
            Self::InvalidOwner { .. } => "invalid_owner",
            Self::CheckpointTooLarge { .. } => "checkpoint_too_large",
            Self::Database(_) => "storage",
        }
    }
}

/// Message broker errors. Always transient from the producer's point of view.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker transport {transport} unavailable: {reason}")]
    Unavailable { transport: String, reason: String },

    #[error("Failed to encode broker message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Broker transport error: {0}")]
    Transport(String),
}

/// Realtime gateway errors, surfaced to clients as protocol `error` frames.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway overloaded: {limit} limit of {max} reached")]
    Overload { limit: &'static str, max: usize },

    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Not allowed to join room {room}")]
    Forbidden { room: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Overload { .. } => "gateway_overload",
            Self::AuthFailed { .. } => "auth_failed",
            Self::Forbidden { .. } => "forbidden",
            Self::Protocol(_) => "protocol",
            Self::Job(e) => e.code(),
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overload { .. } | Self::Job(JobError::Database(_)))
    }
}

/// Worker runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("No handler registered for job type {job_type}")]
    NoHandler { job_type: String },

    #[error("Worker runtime is shut down")]
    Closed,

    #[error(transparent)]
    Job(#[from] JobError),
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoHandler { .. } => "no_handler",
            Self::Closed => "runtime_closed",
            Self::Job(e) => e.code(),
        }
    }
}

/// Client-side subscriber errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Job {job_id}: waited {waited:?} for sequence {expected}, re-fetch backlog")]
    SequenceGapTimeout {
        job_id: Uuid,
        expected: u64,
        waited: Duration,
    },
}

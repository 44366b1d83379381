//! Job state machine, job records and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job has been created but not handed to a queue.
    Created,
    /// Job is waiting for a worker slot.
    Queued,
    /// A worker attempt is executing the job.
    Running,
    /// The worker parked the job at a checkpoint boundary.
    Checkpointed,
    /// Job work is complete.
    Completed,
    /// Job failed and will not be retried.
    Failed,
    /// Job was cancelled.
    Cancelled,
    /// The crash sweep found the running attempt silent.
    Crashed,
}

/// Who is allowed to take a transition edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// Workers and API callers.
    Producer,
    /// The crash sweep.
    System,
    /// The resume operation.
    Resume,
}

/// The complete transition table. Anything not listed is invalid.
pub const TRANSITIONS: &[(JobState, JobState, Actor)] = {
    use Actor::*;
    use JobState::*;
    &[
        (Created, Queued, Producer),
        (Created, Cancelled, Producer),
        (Queued, Running, Producer),
        (Queued, Cancelled, Producer),
        (Running, Checkpointed, Producer),
        (Running, Completed, Producer),
        (Running, Failed, Producer),
        (Running, Cancelled, Producer),
        (Running, Crashed, System),
        (Checkpointed, Running, Producer),
        (Checkpointed, Completed, Producer),
        (Checkpointed, Failed, Producer),
        (Checkpointed, Cancelled, Producer),
        (Crashed, Running, Resume),
        (Crashed, Cancelled, Producer),
    ]
};

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Created,
        JobState::Queued,
        JobState::Running,
        JobState::Checkpointed,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Crashed,
    ];

    /// Check whether `actor` may move a job from this state to `target`.
    pub fn can_transition_to(&self, target: JobState, actor: Actor) -> bool {
        TRANSITIONS
            .iter()
            .any(|&(from, to, by)| from == *self && to == target && by == actor)
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which a worker attempt may append producer events.
    pub fn accepts_events(&self) -> bool {
        matches!(self, Self::Running | Self::Checkpointed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::System => "system",
            Self::Resume => "resume",
        }
    }
}

impl std::str::FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "producer" => Ok(Self::Producer),
            "system" => Ok(Self::System),
            "resume" => Ok(Self::Resume),
            other => Err(format!("unknown actor: {other}")),
        }
    }
}

/// A trackable, resumable unit of long-running work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub params: serde_json::Value,
    pub state: JobState,
    /// 0..=100.
    pub progress: u8,
    pub current_step: Option<String>,
    /// Worker attempt counter; bumped every time the job enters Running
    /// from Queued or Crashed.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        owner_id: impl Into<String>,
        job_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            job_type: job_type.into(),
            params,
            state: JobState::Created,
            progress: 0,
            current_step: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    /// Record activity at `at`, never moving `last_activity_at` backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    /// Apply a validated edge. Callers persist the job afterwards.
    ///
    /// Entering Running counts as activity: time spent waiting for a slot
    /// or parked at a checkpoint must not count towards the crash threshold.
    pub(crate) fn apply(&mut self, target: JobState, at: DateTime<Utc>) {
        if target == JobState::Running {
            if matches!(self.state, JobState::Queued | JobState::Crashed) {
                self.attempt += 1;
            }
            self.touch(at);
        }
        self.state = target;
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// A snapshot of resumable producer state at a given event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: Uuid,
    /// Last event sequence at the time the snapshot was taken.
    pub sequence: u64,
    pub progress: u8,
    pub step: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Audit record of one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: Uuid,
    pub from: JobState,
    pub to: JobState,
    pub actor: Actor,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

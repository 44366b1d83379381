//! Apply events at most once and in sequence order.
//!
//! Gateways may deliver an event twice (replay overlapping live traffic,
//! broker redelivery) or out of order across a reconnect. A tracker sits
//! between the socket and the application and only releases the next
//! expected sequence.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::ClientError;
use crate::jobs::event::Event;

/// Default time a gap may stay open before the client re-fetches backlog.
pub const DEFAULT_GAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct SequenceTracker {
    job_id: Uuid,
    last_applied: u64,
    pending: BTreeMap<u64, Event>,
    gap_opened: Option<Instant>,
    grace: Duration,
}

impl SequenceTracker {
    pub fn new(job_id: Uuid) -> Self {
        Self::resuming(job_id, 0)
    }

    /// Tracker for a client that already applied everything up to `last_applied`.
    pub fn resuming(job_id: Uuid, last_applied: u64) -> Self {
        Self {
            job_id,
            last_applied,
            pending: BTreeMap::new(),
            gap_opened: None,
            grace: DEFAULT_GAP_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Buffered events waiting for a gap to close.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// `last_seen_sequence` to send when resubscribing.
    pub fn resubscribe_from(&self) -> u64 {
        self.last_applied
    }

    pub fn push(&mut self, event: Event) -> Vec<Event> {
        self.push_at(event, Instant::now())
    }

    /// Accept an event observed at `now` and return the events that are now
    /// ready to apply, in order. Duplicates and stale sequences are dropped.
    pub fn push_at(&mut self, event: Event, now: Instant) -> Vec<Event> {
        if event.job_id != self.job_id || event.sequence <= self.last_applied {
            return Vec::new();
        }

        self.pending.entry(event.sequence).or_insert(event);

        let mut ready = Vec::new();
        while let Some(next) = self.pending.remove(&(self.last_applied + 1)) {
            self.last_applied = next.sequence;
            ready.push(next);
        }

        self.gap_opened = match (self.pending.is_empty(), self.gap_opened) {
            (true, _) => None,
            // Progress was made but a later gap remains: restart the clock.
            (false, Some(_)) if !ready.is_empty() => Some(now),
            (false, Some(opened)) => Some(opened),
            (false, None) => Some(now),
        };
        ready
    }

    /// Fails once a gap has stayed open longer than the grace window.
    pub fn check_gap(&self, now: Instant) -> Result<(), ClientError> {
        match self.gap_opened {
            Some(opened) if now.saturating_duration_since(opened) > self.grace => {
                Err(ClientError::SequenceGapTimeout {
                    job_id: self.job_id,
                    expected: self.last_applied + 1,
                    waited: now.saturating_duration_since(opened),
                })
            }
            _ => Ok(()),
        }
    }

    /// Drop buffered events, e.g. before re-fetching backlog after a timeout.
    pub fn reset_gap(&mut self) {
        self.pending.clear();
        self.gap_opened = None;
    }
}

/// Trackers for every job seen on an owner room.
#[derive(Debug, Default)]
pub struct Cursors {
    trackers: HashMap<Uuid, SequenceTracker>,
    grace: Option<Duration>,
}

impl Cursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            trackers: HashMap::new(),
            grace: Some(grace),
        }
    }

    pub fn push(&mut self, event: Event) -> Vec<Event> {
        self.push_at(event, Instant::now())
    }

    /// Route an event to its job's tracker. The first event of an unseen
    /// job is taken as the starting point for that job.
    pub fn push_at(&mut self, event: Event, now: Instant) -> Vec<Event> {
        let grace = self.grace;
        let tracker = self.trackers.entry(event.job_id).or_insert_with(|| {
            let tracker =
                SequenceTracker::resuming(event.job_id, event.sequence.saturating_sub(1));
            match grace {
                Some(grace) => tracker.with_grace(grace),
                None => tracker,
            }
        });
        tracker.push_at(event, now)
    }

    /// Per-job cursors for an owner-room `subscribe`.
    pub fn snapshot(&self) -> HashMap<Uuid, u64> {
        self.trackers
            .iter()
            .map(|(id, tracker)| (*id, tracker.resubscribe_from()))
            .collect()
    }

    pub fn check_gaps(&self, now: Instant) -> Vec<ClientError> {
        self.trackers
            .values()
            .filter_map(|tracker| tracker.check_gap(now).err())
            .collect()
    }

    pub fn tracker_mut(&mut self, job_id: Uuid) -> Option<&mut SequenceTracker> {
        self.trackers.get_mut(&job_id)
    }
}

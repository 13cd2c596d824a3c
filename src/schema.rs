//! Broker-side record definitions.
//!
//! These types describe job records as the broker stores and hands them out,
//! independent of which [`Broker`](crate::Broker) implementation is in use.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

use crate::background_job::Backoff;

/// Broker-assigned identifier of a job record.
pub type JobId = i64;

/// A job record that has been claimed by a worker.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job
    pub id: JobId,
    /// Queue the record belongs to
    pub queue: String,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// JSON data containing the job payload
    pub data: Value,
    /// Number of times the record has been claimed, including the current claim
    pub attempts: i32,
    /// Maximum number of attempts before the record fails permanently
    pub max_attempts: i32,
    /// Delay policy applied between attempts
    pub backoff: Json<Backoff>,
    /// Per-attempt execution limit in milliseconds
    pub timeout_ms: Option<i64>,
    /// Whether the record is deleted once it completes
    pub remove_on_complete: bool,
    /// Whether the record is deleted once it fails permanently
    pub remove_on_fail: bool,
    /// The record is not handed out before this instant
    pub run_at: DateTime<Utc>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Message of the most recent failed attempt
    pub last_error: Option<String>,
}

impl JobRecord {
    /// The configured per-attempt timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
    }

    /// The backoff policy for this record.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff.0
    }

    /// Whether the current attempt is the last one allowed.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Lifecycle states of a job record.
///
/// `Delayed` is never stored: it is a `Waiting` record whose scheduled time
/// lies in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Scheduled for a later time.
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully and retained.
    Completed,
    /// Failed permanently and retained.
    Failed,
}

impl JobState {
    /// Every state, in reporting order.
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    /// The lowercase name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state {s:?}"))
    }
}

/// Per-state record counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct JobCounts {
    /// Records ready to be claimed
    pub waiting: i64,
    /// Records currently claimed
    pub active: i64,
    /// Records scheduled for later
    pub delayed: i64,
    /// Retained completed records
    pub completed: i64,
    /// Retained permanently failed records
    pub failed: i64,
}

impl JobCounts {
    /// Records that still need a worker.
    pub fn pending(&self) -> i64 {
        self.waiting + self.active + self.delayed
    }

    /// Sum over every state.
    pub fn total(&self) -> i64 {
        self.pending() + self.completed + self.failed
    }

    /// The count for a single state.
    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_its_name() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("stalled".parse::<JobState>().is_err());
    }

    #[test]
    fn pending_excludes_terminal_states() {
        let counts = JobCounts {
            waiting: 1,
            active: 2,
            delayed: 3,
            completed: 4,
            failed: 5,
        };
        assert_eq!(counts.pending(), 6);
        assert_eq!(counts.total(), 15);
        assert_eq!(counts.get(JobState::Failed), 5);
    }
}

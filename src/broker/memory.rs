use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use serde_json::Value;
use sqlx::types::Json;

use super::{Broker, LEASE_EXPIRED_ERROR, NewJob};
use crate::errors::BrokerError;
use crate::schema::{JobCounts, JobId, JobRecord, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stored {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct StoredJob {
    record: JobRecord,
    state: Stored,
    locked_until: Option<DateTime<Utc>>,
}

impl StoredJob {
    fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match self.state {
            Stored::Waiting if self.record.run_at > now => JobState::Delayed,
            Stored::Waiting => JobState::Waiting,
            Stored::Active => JobState::Active,
            Stored::Completed => JobState::Completed,
            Stored::Failed => JobState::Failed,
        }
    }

    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            Stored::Waiting => self.record.run_at <= now,
            Stored::Active => self.lease_expired(now) && !self.is_exhausted(),
            Stored::Completed | Stored::Failed => false,
        }
    }

    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until < now)
    }

    fn is_exhausted(&self) -> bool {
        self.record.attempts >= self.record.max_attempts
    }

    fn is_held(&self, attempt: i32) -> bool {
        self.state == Stored::Active && self.record.attempts == attempt
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: JobId,
    jobs: BTreeMap<JobId, StoredJob>,
    paused: HashSet<String>,
}

impl Inner {
    fn held_mut(&mut self, id: JobId, attempt: i32) -> Option<&mut StoredJob> {
        self.jobs.get_mut(&id).filter(|job| job.is_held(attempt))
    }

    /// Fail active records of `queue` whose final attempt lost its lease.
    fn fail_abandoned(&mut self, queue: &str, now: DateTime<Utc>) {
        let abandoned: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| {
                job.record.queue == queue
                    && job.state == Stored::Active
                    && job.lease_expired(now)
                    && job.is_exhausted()
            })
            .map(|job| job.record.id)
            .collect();

        for id in abandoned {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.record.remove_on_fail {
                self.jobs.remove(&id);
                continue;
            }
            job.state = Stored::Failed;
            job.locked_until = None;
            job.record.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
        }
    }
}

/// Point-in-time view of a record held by a [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    /// Record identifier
    pub id: JobId,
    /// Job type name
    pub job_type: String,
    /// State at the time of the snapshot
    pub state: JobState,
    /// Claims so far
    pub attempts: i32,
    /// Attempt limit
    pub max_attempts: i32,
    /// Stored payload
    pub data: Value,
    /// Message of the most recent failed attempt
    pub last_error: Option<String>,
    /// Earliest time the record may be claimed
    pub run_at: DateTime<Utc>,
    /// Per-attempt execution limit
    pub timeout: Option<Duration>,
}

/// Process-local broker for tests and single-process development.
///
/// Follows the same claim and acknowledgement rules as
/// [`PgBroker`](super::PgBroker), but nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot every record of `queue`, in insertion order.
    pub fn jobs(&self, queue: &str) -> Vec<JobSnapshot> {
        let now = Utc::now();
        self.lock()
            .jobs
            .values()
            .filter(|job| job.record.queue == queue)
            .map(|job| JobSnapshot {
                id: job.record.id,
                job_type: job.record.job_type.clone(),
                state: job.state_at(now),
                attempts: job.record.attempts,
                max_attempts: job.record.max_attempts,
                data: job.record.data.clone(),
                last_error: job.record.last_error.clone(),
                run_at: job.record.run_at,
                timeout: job.record.timeout(),
            })
            .collect()
    }

    /// Snapshot a single record.
    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        let queue = self.lock().jobs.get(&id)?.record.queue.clone();
        self.jobs(&queue).into_iter().find(|job| job.id == id)
    }

    fn enqueue_sync(&self, job: NewJob) -> JobId {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        let record = JobRecord {
            id,
            queue: job.queue,
            job_type: job.job_type,
            data: job.data,
            attempts: 0,
            max_attempts: i32::try_from(job.options.max_attempts).unwrap_or(i32::MAX),
            backoff: Json(job.options.backoff),
            timeout_ms: job.options.timeout.map(millis),
            remove_on_complete: job.options.remove_on_complete,
            remove_on_fail: job.options.remove_on_fail,
            run_at: after(now, job.options.delay),
            created_at: now,
            last_error: None,
        };
        inner.jobs.insert(
            id,
            StoredJob {
                record,
                state: Stored::Waiting,
                locked_until: None,
            },
        );
        id
    }

    fn claim_sync(&self, queue: &str, lease: Duration) -> Option<JobRecord> {
        let now = Utc::now();
        let mut inner = self.lock();
        if inner.paused.contains(queue) {
            return None;
        }
        inner.fail_abandoned(queue, now);

        let id = inner
            .jobs
            .values()
            .filter(|job| job.record.queue == queue && job.is_claimable(now))
            .min_by_key(|job| (job.record.run_at, job.record.id))
            .map(|job| job.record.id)?;

        let job = inner.jobs.get_mut(&id)?;
        job.state = Stored::Active;
        job.record.attempts += 1;
        job.locked_until = Some(after(now, lease));
        Some(job.record.clone())
    }

    fn settle(&self, id: JobId, attempt: i32, remove: bool, state: Stored, error: Option<&str>) {
        let mut inner = self.lock();
        let Some(job) = inner.held_mut(id, attempt) else {
            return;
        };
        if remove {
            inner.jobs.remove(&id);
            return;
        }
        job.state = state;
        job.locked_until = None;
        if let Some(error) = error {
            job.record.last_error = Some(error.to_string());
        }
    }

    fn counts_sync(&self, queue: &str) -> JobCounts {
        let now = Utc::now();
        let mut counts = JobCounts::default();
        for job in self.lock().jobs.values().filter(|job| job.record.queue == queue) {
            match job.state_at(now) {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn remove_where(&self, queue: &str, predicate: impl Fn(JobState) -> bool) -> u64 {
        let now = Utc::now();
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| job.record.queue != queue || !predicate(job.state_at(now)));
        (before - inner.jobs.len()) as u64
    }
}

impl Broker for MemoryBroker {
    fn enqueue(&self, job: NewJob) -> BoxFuture<'_, Result<JobId, BrokerError>> {
        future::ready(Ok(self.enqueue_sync(job))).boxed()
    }

    fn claim<'a>(
        &'a self,
        queue: &'a str,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, BrokerError>> {
        future::ready(Ok(self.claim_sync(queue, lease))).boxed()
    }

    fn extend_lease(
        &self,
        id: JobId,
        attempt: i32,
        lease: Duration,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        if let Some(job) = self.lock().held_mut(id, attempt) {
            job.locked_until = Some(after(Utc::now(), lease));
        }
        future::ready(Ok(())).boxed()
    }

    fn complete(
        &self,
        id: JobId,
        attempt: i32,
        remove: bool,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        self.settle(id, attempt, remove, Stored::Completed, None);
        future::ready(Ok(())).boxed()
    }

    fn retry<'a>(
        &'a self,
        id: JobId,
        attempt: i32,
        delay: Duration,
        error: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        if let Some(job) = self.lock().held_mut(id, attempt) {
            job.state = Stored::Waiting;
            job.locked_until = None;
            job.record.run_at = after(Utc::now(), delay);
            job.record.last_error = Some(error.to_string());
        }
        future::ready(Ok(())).boxed()
    }

    fn fail<'a>(
        &'a self,
        id: JobId,
        attempt: i32,
        error: &'a str,
        remove: bool,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.settle(id, attempt, remove, Stored::Failed, Some(error));
        future::ready(Ok(())).boxed()
    }

    fn counts<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<JobCounts, BrokerError>> {
        future::ready(Ok(self.counts_sync(queue))).boxed()
    }

    fn pause<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.lock().paused.insert(queue.to_string());
        future::ready(Ok(())).boxed()
    }

    fn resume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.lock().paused.remove(queue);
        future::ready(Ok(())).boxed()
    }

    fn is_paused<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<bool, BrokerError>> {
        future::ready(Ok(self.lock().paused.contains(queue))).boxed()
    }

    fn drain<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<u64, BrokerError>> {
        let removed = self.remove_where(queue, |state| {
            matches!(state, JobState::Waiting | JobState::Delayed)
        });
        future::ready(Ok(removed)).boxed()
    }

    fn clean<'a>(
        &'a self,
        queue: &'a str,
        state: JobState,
    ) -> BoxFuture<'a, Result<u64, BrokerError>> {
        future::ready(Ok(self.remove_where(queue, |current| current == state))).boxed()
    }
}

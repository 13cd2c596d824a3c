//! Durable storage and claim arbitration for job records.
//!
//! The broker is the single source of truth for which worker owns a record.
//! Workers never run a record they were not handed by [`Broker::claim`], and
//! every acknowledgement carries the attempt number of that claim so a worker
//! whose lease expired cannot settle a record someone else has reclaimed.

mod memory;
mod postgres;

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::background_job::EnqueueOptions;
use crate::errors::BrokerError;
use crate::schema::{JobCounts, JobId, JobRecord, JobState};

pub use self::memory::{JobSnapshot, MemoryBroker};
pub use self::postgres::{PgBroker, setup_database};

/// Error recorded on a record whose final attempt lost its lease.
pub(crate) const LEASE_EXPIRED_ERROR: &str = "lease expired after final attempt";

/// A record about to be stored.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Target queue
    pub queue: String,
    /// Wire-level job type name
    pub job_type: String,
    /// Serialized payload
    pub data: Value,
    /// Resolved dispatch options
    pub options: EnqueueOptions,
}

/// Storage backend for job records.
pub trait Broker: Send + Sync + 'static {
    /// Store a new record. It becomes claimable once `options.delay` has elapsed.
    fn enqueue(&self, job: NewJob) -> BoxFuture<'_, Result<JobId, BrokerError>>;

    /// Hand out the next claimable record of `queue`, marking it active for `lease`.
    ///
    /// Claimable records are waiting records whose scheduled time has passed and
    /// active records whose lease expired. Records are handed out in scheduled
    /// time order, oldest first. Paused queues hand out nothing.
    ///
    /// An expired record without attempts left is failed instead of handed out.
    fn claim<'a>(
        &'a self,
        queue: &'a str,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, BrokerError>>;

    /// Push back the lease expiry of an active record.
    fn extend_lease(
        &self,
        id: JobId,
        attempt: i32,
        lease: Duration,
    ) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Acknowledge successful execution, deleting the record if `remove` is set.
    fn complete(&self, id: JobId, attempt: i32, remove: bool)
    -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Acknowledge a failed attempt and schedule the record again after `delay`.
    fn retry<'a>(
        &'a self,
        id: JobId,
        attempt: i32,
        delay: Duration,
        error: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Acknowledge a permanent failure, deleting the record if `remove` is set.
    fn fail<'a>(
        &'a self,
        id: JobId,
        attempt: i32,
        error: &'a str,
        remove: bool,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Count the records of `queue` per state.
    fn counts<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<JobCounts, BrokerError>>;

    /// Stop handing out records of `queue`.
    fn pause<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Resume handing out records of `queue`.
    fn resume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Whether `queue` is paused.
    fn is_paused<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<bool, BrokerError>>;

    /// Delete every waiting and delayed record of `queue`.
    fn drain<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<u64, BrokerError>>;

    /// Delete every record of `queue` in `state`.
    fn clean<'a>(
        &'a self,
        queue: &'a str,
        state: JobState,
    ) -> BoxFuture<'a, Result<u64, BrokerError>>;
}

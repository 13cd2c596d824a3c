use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::broker::Broker;
use crate::errors::ExecutionError;
use crate::job_registry::JobRegistry;
use crate::queue::QueueConfig;
use crate::rate_limit::RateLimiter;
use crate::schema::JobRecord;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Claims and runs the records of a single queue.
pub(crate) struct Worker {
    pub(crate) queue: QueueConfig,
    pub(crate) executor: Executor,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
}

/// Everything a spawned job execution needs.
#[derive(Clone)]
pub(crate) struct Executor {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) job_registry: Arc<JobRegistry>,
    pub(crate) lease_duration: Duration,
}

/// Resolves once shutdown was requested. Never resolves if the handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

impl Worker {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `duration`, returning early when an in-flight job finishes.
    ///
    /// Returns `true` if shutdown was requested in the meantime.
    async fn idle(&mut self, in_flight: &mut JoinSet<()>, duration: Duration) -> bool {
        tokio::select! {
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_task_result(result);
                false
            }
            _ = sleep(duration) => false,
            _ = shutdown_requested(&mut self.shutdown) => true,
        }
    }

    async fn queue_is_empty(&self) -> bool {
        match self.executor.broker.counts(&self.queue.name).await {
            Ok(counts) => counts.pending() == 0,
            Err(error) => {
                warn!("Failed to count pending jobs: {error}");
                false
            }
        }
    }

    /// Run jobs until shutdown is requested, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set. In-flight jobs are always awaited.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(mut self) {
        let semaphore = Arc::new(Semaphore::new(self.queue.concurrency));
        let mut limiter = self.queue.rate_limit.map(RateLimiter::new);
        let mut in_flight = JoinSet::new();
        let lease = self.executor.lease_duration;

        loop {
            while let Some(result) = in_flight.try_join_next() {
                log_task_result(result);
            }
            if self.is_shutting_down() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_requested(&mut self.shutdown) => break,
            };

            if let Some(limiter) = limiter.as_mut() {
                let wait = limiter.time_until_available(Instant::now());
                if !wait.is_zero() {
                    drop(permit);
                    trace!("Rate limit reached. Next start possible in {wait:?}…");
                    if self.idle(&mut in_flight, wait).await {
                        break;
                    }
                    continue;
                }
            }

            trace!("Looking for next background job…");
            match self.executor.broker.claim(&self.queue.name, lease).await {
                Ok(Some(job)) => {
                    if let Some(limiter) = limiter.as_mut() {
                        limiter.record(Instant::now());
                    }
                    in_flight.spawn(self.executor.clone().run(job, permit));
                }
                Ok(None) => {
                    drop(permit);
                    if self.shutdown_when_queue_empty
                        && in_flight.is_empty()
                        && self.queue_is_empty().await
                    {
                        debug!("No pending background jobs found. Shutting down the worker…");
                        break;
                    }

                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable background jobs found. Polling again in {sleep_duration:?}…");
                    if self.idle(&mut in_flight, sleep_duration).await {
                        break;
                    }
                }
                Err(error) => {
                    drop(permit);
                    error!("Failed to claim job: {error}");
                    let sleep_duration = self.sleep_duration_with_jitter();
                    if self.idle(&mut in_flight, sleep_duration).await {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight jobs to finish…");
        }
        while let Some(result) = in_flight.join_next().await {
            log_task_result(result);
        }
        debug!("Worker stopped");
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        error!(%error, "Job execution task failed");
    }
}

impl Executor {
    /// Execute one claimed record and acknowledge the outcome.
    async fn run(self, job: JobRecord, _permit: OwnedSemaphorePermit) {
        let span = info_span!(
            "job",
            job.id = job.id,
            job.type = %job.job_type,
            job.attempt = job.attempts,
        );

        async {
            debug!("Running job…");
            let result = with_sentry_transaction(&job.job_type, self.execute(&job))
                .bind_hub(Hub::current())
                .await;
            self.settle(&job, result).await;
        }
        .instrument(span)
        .await;
    }

    async fn execute(&self, job: &JobRecord) -> Result<(), ExecutionError> {
        let run_task_fn = self
            .job_registry
            .resolve(&job.job_type)
            .map_err(|_| ExecutionError::UnknownJobType(job.job_type.clone()))?;

        let data = job.data.clone();
        let task = match std::panic::catch_unwind(AssertUnwindSafe(|| run_task_fn(data))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind(),
            Err(panic) => {
                return Err(ExecutionError::Panicked(try_to_extract_panic_info(&*panic)));
            }
        };
        let guarded = async {
            tokio::select! {
                biased;
                result = task => result,
                never = self.heartbeat(job) => match never {},
            }
        };

        let outcome = match job.timeout() {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| ExecutionError::Timeout(limit))?,
            None => guarded.await,
        };

        match outcome {
            Ok(result) => result,
            Err(panic) => Err(ExecutionError::Panicked(try_to_extract_panic_info(&*panic))),
        }
    }

    /// Keep the lease of `job` alive while it runs.
    async fn heartbeat(&self, job: &JobRecord) -> Infallible {
        let period = (self.lease_duration / 3).max(MIN_HEARTBEAT);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            if let Err(error) = self
                .broker
                .extend_lease(job.id, job.attempts, self.lease_duration)
                .await
            {
                warn!("Failed to extend job lease: {error}");
            }
        }
    }

    async fn settle(&self, job: &JobRecord, result: Result<(), ExecutionError>) {
        let acknowledged = match result {
            Ok(()) => {
                debug!("Job completed");
                self.broker
                    .complete(job.id, job.attempts, job.remove_on_complete)
                    .await
            }
            Err(error) if error.is_terminal() || job.is_last_attempt() => {
                warn!(
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    "Job failed permanently: {error}"
                );
                self.broker
                    .fail(job.id, job.attempts, &error.to_string(), job.remove_on_fail)
                    .await
            }
            Err(error) => {
                let attempts_made = u32::try_from(job.attempts).unwrap_or(1);
                let delay = job.backoff().delay_for(attempts_made);
                warn!(retry_in = ?delay, "Job failed, scheduling retry: {error}");
                self.broker
                    .retry(job.id, job.attempts, delay, &error.to_string())
                    .await
            }
        };

        // The lease expires and the record is claimed again.
        if let Err(error) = acknowledged {
            error!("Failed to acknowledge job: {error}");
        }
    }
}

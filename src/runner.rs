use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use crate::job_registry::JobRegistry;
use crate::queue::QueueRegistry;
use crate::worker::{Executor, Worker};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// The core runner responsible for claiming and running jobs.
///
/// One worker is started per configured queue. Each worker runs up to the
/// queue's concurrency limit in parallel and honours its rate limit.
pub struct Runner {
    queues: Arc<QueueRegistry>,
    job_registry: Arc<JobRegistry>,
    poll_interval: Duration,
    jitter: Duration,
    lease_duration: Duration,
    shutdown_when_queue_empty: bool,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.names().collect::<Vec<_>>())
            .field("job_types", &self.job_registry.job_types())
            .field("poll_interval", &self.poll_interval)
            .field("lease_duration", &self.lease_duration)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl Runner {
    /// Create a new runner for the given queues and job handlers.
    pub fn new(queues: Arc<QueueRegistry>, job_registry: Arc<JobRegistry>) -> Self {
        Self {
            queues,
            job_registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            lease_duration: DEFAULT_LEASE_DURATION,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how long a claimed job stays owned by its worker without a heartbeat.
    ///
    /// Jobs of a worker that died are handed out again once their lease expired.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the runner to shut down when the background job queues are empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the workers and
    /// wait for them to shut down. Dropping the handle leaves them running.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for job_type in self.job_registry.job_types() {
            let queue = self
                .job_registry
                .config(job_type)
                .map(|config| config.queue_name());
            if let Some(queue) = queue.filter(|queue| self.queues.queue(queue).is_none()) {
                warn!(job.type = job_type, queue, "Job is registered for an unconfigured queue");
            }
        }

        let executor = Executor {
            broker: self.queues.broker().clone(),
            job_registry: self.job_registry.clone(),
            lease_duration: self.lease_duration,
        };

        let mut handles = Vec::new();
        for queue in self.queues.configs() {
            let name = format!("background-worker-{}", queue.name);
            info!(
                worker.name = %name,
                concurrency = queue.concurrency,
                job_types = ?self.job_registry.job_types_for_queue(&queue.name),
                "Starting worker…"
            );

            let worker = Worker {
                queue: queue.clone(),
                executor: executor.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                shutdown: shutdown_rx.clone(),
            };

            let span = info_span!("worker", worker.name = %name, queue = %queue.name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle {
            shutdown_tx,
            handles,
        }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Ask every worker to stop claiming new jobs.
    ///
    /// Jobs that are already running are finished first.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }

    /// Stop the workers and wait until their in-flight jobs are done.
    pub async fn shutdown_and_wait(self) {
        self.shutdown();
        self.wait_for_shutdown().await;
    }
}

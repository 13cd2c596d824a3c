use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::errors::EnqueueError;
use crate::queue::QueueRegistry;
use crate::schema::JobId;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// The default number of attempts a record gets before it fails permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// A fresh handler is built by the factory passed to
/// [`JobRegistry::register`](crate::JobRegistry::register) for every execution.
pub trait BackgroundJob: Send + Sync + 'static {
    /// The data stored alongside each record of this job.
    type Payload: Serialize + DeserializeOwned + Send + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// Returning an error fails the current attempt. Wrap the error in
    /// [`Unrecoverable`](crate::Unrecoverable) to skip the remaining attempts.
    fn handle(&self, payload: Self::Payload) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Delay policy applied before a failed record is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Retry as soon as a worker is free.
    #[default]
    Immediate,
    /// Wait the same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Wait `delay * 2^(attempt - 1)` before retrying.
    Exponential {
        /// Base delay in milliseconds.
        delay_ms: u64,
    },
}

impl Backoff {
    /// A fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: duration_millis(delay),
        }
    }

    /// An exponentially growing delay between attempts.
    pub fn exponential(delay: Duration) -> Self {
        Self::Exponential {
            delay_ms: duration_millis(delay),
        }
    }

    /// Delay before the next attempt, given how many attempts have been made.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                Duration::from_millis(delay_ms.saturating_mul(1_u64 << exponent))
            }
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Static policy of a job type: its wire name, target queue and retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    name: String,
    queue: String,
    max_attempts: u32,
    backoff: Backoff,
    timeout: Option<Duration>,
    delay: Option<Duration>,
}

impl JobConfig {
    /// Create the configuration for a job type.
    ///
    /// The name is stored with every record and MUST be unique for the whole application.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            timeout: None,
            delay: None,
        }
    }

    /// Set the queue records of this job are dispatched to.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set how many times a record is executed before it fails permanently.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay policy between attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bound a single execution attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay every dispatch by default.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The wire-level name of the job type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue this job is dispatched to.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Resolve per-call options against this configuration.
    pub fn enqueue_options(&self, options: &DispatchOptions) -> EnqueueOptions {
        EnqueueOptions {
            max_attempts: options.max_attempts.unwrap_or(self.max_attempts).max(1),
            backoff: options.backoff.unwrap_or(self.backoff),
            timeout: options.timeout.or(self.timeout),
            delay: options.delay.or(self.delay).unwrap_or(Duration::ZERO),
            remove_on_complete: options.remove_on_complete.unwrap_or(true),
            remove_on_fail: options.remove_on_fail.unwrap_or(false),
        }
    }
}

/// Per-call overrides of a job's [`JobConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    max_attempts: Option<u32>,
    backoff: Option<Backoff>,
    timeout: Option<Duration>,
    delay: Option<Duration>,
    remove_on_complete: Option<bool>,
    remove_on_fail: Option<bool>,
}

impl DispatchOptions {
    /// Options that override nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the number of attempts.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the backoff policy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the dispatch delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keep or delete the record once it completes. Completed records are deleted by default.
    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    /// Keep or delete the record once it fails permanently. Failed records are kept by default.
    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }
}

/// Fully resolved options for a single enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Attempts before the record fails permanently
    pub max_attempts: u32,
    /// Delay policy between attempts
    pub backoff: Backoff,
    /// Per-attempt execution limit
    pub timeout: Option<Duration>,
    /// Time before the record may be claimed
    pub delay: Duration,
    /// Delete the record once it completes
    pub remove_on_complete: bool,
    /// Delete the record once it fails permanently
    pub remove_on_fail: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        JobConfig::new("").enqueue_options(&DispatchOptions::default())
    }
}

/// Typed handle for dispatching records of one registered job type.
pub struct JobDefinition<P> {
    config: Arc<JobConfig>,
    _payload: PhantomData<fn(P)>,
}

impl<P> Clone for JobDefinition<P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for JobDefinition<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("config", &self.config)
            .finish()
    }
}

impl<P: Serialize + Sync> JobDefinition<P> {
    /// Create a dispatch handle from a job configuration.
    ///
    /// Dispatching does not require the handler to be registered in this
    /// process; only the worker processes need it.
    pub fn new(config: JobConfig) -> Self {
        Self {
            config: Arc::new(config),
            _payload: PhantomData,
        }
    }

    /// The configuration this handle dispatches with.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Enqueue one record with the job's default options.
    ///
    /// Returns once the broker has stored the record, not once it has run.
    pub async fn dispatch(&self, queues: &QueueRegistry, payload: &P) -> Result<JobId, EnqueueError> {
        self.dispatch_with(queues, payload, DispatchOptions::default())
            .await
    }

    /// Enqueue one record that may not start before `delay` has elapsed.
    pub async fn dispatch_after(
        &self,
        queues: &QueueRegistry,
        payload: &P,
        delay: Duration,
    ) -> Result<JobId, EnqueueError> {
        self.dispatch_with(queues, payload, DispatchOptions::default().delay(delay))
            .await
    }

    /// Enqueue one record, overriding the job's defaults with `options`.
    #[instrument(
        name = "jobqueue.dispatch",
        skip_all,
        fields(job.type = %self.config.name, queue = %self.config.queue)
    )]
    pub async fn dispatch_with(
        &self,
        queues: &QueueRegistry,
        payload: &P,
        options: DispatchOptions,
    ) -> Result<JobId, EnqueueError> {
        let data = serde_json::to_value(payload)?;
        let options = self.config.enqueue_options(&options);
        queues
            .enqueue(&self.config.queue, &self.config.name, data, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert!(backoff.delay_for(u32::MAX) > Duration::from_secs(60));
    }

    #[test]
    fn fixed_and_immediate_backoff() {
        assert_eq!(
            Backoff::fixed(Duration::from_secs(2)).delay_for(5),
            Duration::from_secs(2)
        );
        assert_eq!(Backoff::Immediate.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn backoff_is_stored_as_tagged_json() {
        let json = serde_json::to_value(Backoff::exponential(Duration::from_secs(1))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "exponential", "delay_ms": 1000}));
    }

    #[test]
    fn config_defaults_flow_into_enqueue_options() {
        let config = JobConfig::new("TestDispatchJob")
            .max_attempts(5)
            .timeout(Duration::from_millis(1234))
            .delay(Duration::from_millis(5678));

        let options = config.enqueue_options(&DispatchOptions::default());
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.timeout, Some(Duration::from_millis(1234)));
        assert_eq!(options.delay, Duration::from_millis(5678));
        assert!(options.remove_on_complete);
        assert!(!options.remove_on_fail);
    }

    #[test]
    fn dispatch_options_override_config() {
        let config = JobConfig::new("TestDispatchJob")
            .max_attempts(5)
            .delay(Duration::from_millis(5678));

        let options = config.enqueue_options(
            &DispatchOptions::new()
                .max_attempts(1)
                .delay(Duration::from_millis(100))
                .remove_on_complete(false),
        );
        assert_eq!(options.max_attempts, 1);
        assert_eq!(options.delay, Duration::from_millis(100));
        assert!(!options.remove_on_complete);
    }

    #[test]
    fn config_defaults_to_the_default_queue() {
        let config = JobConfig::new("ExampleJob");
        assert_eq!(config.queue_name(), DEFAULT_QUEUE);
        assert_eq!(
            config.enqueue_options(&DispatchOptions::default()).max_attempts,
            DEFAULT_MAX_ATTEMPTS
        );
    }
}

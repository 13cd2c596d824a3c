#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod broker;
/// Broker connection settings and queue configuration files.
pub mod config;
mod errors;
mod event_bus;
pub mod events;
mod job_registry;
pub mod jobs;
pub mod listeners;
mod queue;
mod rate_limit;
mod runner;
/// Broker-side record definitions.
pub mod schema;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
pub use self::background_job::{
    Backoff, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, DispatchOptions, EnqueueOptions, JobConfig,
    JobDefinition,
};
pub use self::broker::{Broker, JobSnapshot, MemoryBroker, NewJob, PgBroker, setup_database};
/// Error type for job enqueueing operations.
pub use self::errors::EnqueueError;
pub use self::errors::{
    BrokerError, ConfigError, EmitError, ExecutionError, HandlerFailure, QueueError,
    RegistryError, Unrecoverable,
};
pub use self::event_bus::{Emission, Event, EventBus};
pub use self::job_registry::{JobRegistry, RunJobFn};
pub use self::queue::{ClearSummary, QueueConfig, QueueRegistry};
pub use self::rate_limit::RateLimit;
/// The main runner that orchestrates job processing.
pub use self::runner::Runner;
pub use self::runner::RunHandle;

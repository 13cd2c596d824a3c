//! Logs the message it was dispatched with.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::background_job::{BackgroundJob, JobConfig, JobDefinition};

/// Wire-level name of [`ExampleJob`].
pub const NAME: &str = "ExampleJob";

/// Payload of [`ExampleJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleJobPayload {
    /// Text to log
    pub message: String,
}

/// Logs the message it was dispatched with.
#[derive(Debug, Default)]
pub struct ExampleJob;

impl BackgroundJob for ExampleJob {
    type Payload = ExampleJobPayload;

    async fn handle(&self, payload: Self::Payload) -> anyhow::Result<()> {
        info!(message = %payload.message, "ExampleJob executed");
        Ok(())
    }
}

/// Configuration of [`ExampleJob`].
pub fn config() -> JobConfig {
    JobConfig::new(NAME)
}

/// Dispatch handle for [`ExampleJob`].
pub fn definition() -> JobDefinition<ExampleJobPayload> {
    JobDefinition::new(config())
}

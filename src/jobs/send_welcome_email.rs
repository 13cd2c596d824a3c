//! Welcome email for newly registered users.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::background_job::{BackgroundJob, JobConfig, JobDefinition};

/// Wire-level name of [`SendWelcomeEmail`].
pub const NAME: &str = "SendWelcomeEmail";

/// Payload of [`SendWelcomeEmail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendWelcomeEmailPayload {
    /// The freshly registered user
    pub user_id: String,
}

/// Sends the welcome email to a new user.
#[derive(Debug, Default)]
pub struct SendWelcomeEmail;

impl BackgroundJob for SendWelcomeEmail {
    type Payload = SendWelcomeEmailPayload;

    async fn handle(&self, payload: Self::Payload) -> anyhow::Result<()> {
        info!(user.id = %payload.user_id, "Sending welcome email");
        Ok(())
    }
}

/// Configuration of [`SendWelcomeEmail`].
pub fn config() -> JobConfig {
    JobConfig::new(NAME).queue("emails")
}

/// Dispatch handle for [`SendWelcomeEmail`].
pub fn definition() -> JobDefinition<SendWelcomeEmailPayload> {
    JobDefinition::new(config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_uses_camel_case_keys() {
        let payload = SendWelcomeEmailPayload {
            user_id: "42".into(),
        };
        assert_eq!(serde_json::to_value(&payload).unwrap(), json!({"userId": "42"}));
    }
}

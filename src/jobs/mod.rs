//! The jobs of this application.
//!
//! `jobqueue make job` adds new modules here and registers them in
//! [`register_all`].

use crate::errors::RegistryError;
use crate::job_registry::JobRegistry;

pub mod example_job;
pub mod send_welcome_email;

/// Register every job of the application with `registry`.
pub fn register_all(registry: &mut JobRegistry) -> Result<(), RegistryError> {
    registry.register(example_job::config(), || example_job::ExampleJob)?;
    registry.register(send_welcome_email::config(), || send_welcome_email::SendWelcomeEmail)?;
    Ok(())
}

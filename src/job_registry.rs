use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::background_job::{BackgroundJob, JobConfig, JobDefinition};
use crate::errors::{ExecutionError, RegistryError};

/// Type-erased entry point that decodes a stored payload and runs a fresh handler.
pub type RunJobFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), ExecutionError>> + Send + Sync>;

struct RegisteredJob {
    config: JobConfig,
    run: RunJobFn,
}

/// Maps job type names to the code that executes them.
///
/// This is the only link between a stored record, which carries nothing but
/// a name and a payload, and the handler that runs it.
#[derive(Default)]
pub struct JobRegistry {
    entries: HashMap<String, RegisteredJob>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type with a factory producing a fresh handler per execution.
    ///
    /// Fails if a job with the same name is already registered.
    pub fn register<J, F>(
        &mut self,
        config: JobConfig,
        factory: F,
    ) -> Result<JobDefinition<J::Payload>, RegistryError>
    where
        J: BackgroundJob,
        J::Payload: Sync,
        F: Fn() -> J + Send + Sync + 'static,
    {
        let name = config.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateJobType(name));
        }

        let factory = Arc::new(factory);
        let run: RunJobFn = Arc::new(move |data: Value| {
            let factory = factory.clone();
            // Built inside the future so a panicking factory fails the attempt.
            async move {
                let job = factory();
                let payload = serde_json::from_value::<J::Payload>(data)
                    .map_err(ExecutionError::InvalidPayload)?;
                job.handle(payload).await.map_err(ExecutionError::Handler)
            }
            .boxed()
        });

        debug!(job.type = %name, queue = %config.queue_name(), "Registered job type");
        let definition = JobDefinition::new(config.clone());
        self.entries.insert(name, RegisteredJob { config, run });
        Ok(definition)
    }

    /// Look up the entry point for a job type.
    pub fn resolve(&self, job_type: &str) -> Result<RunJobFn, RegistryError> {
        self.entries
            .get(job_type)
            .map(|entry| entry.run.clone())
            .ok_or_else(|| RegistryError::UnknownJobType(job_type.to_string()))
    }

    /// The configuration a job type was registered with.
    pub fn config(&self, job_type: &str) -> Option<&JobConfig> {
        self.entries.get(job_type).map(|entry| &entry.config)
    }

    /// Names of all registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Names of the job types dispatched to `queue`, sorted.
    pub fn job_types_for_queue(&self, queue: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .values()
            .filter(|entry| entry.config.queue_name() == queue)
            .map(|entry| entry.config.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Whether no job types are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Greeting {
        message: String,
    }

    struct GreetingJob {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl BackgroundJob for GreetingJob {
        type Payload = Greeting;

        async fn handle(&self, payload: Self::Payload) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(payload.message);
            Ok(())
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = JobRegistry::new();

        let first = seen.clone();
        assert_ok!(registry.register(JobConfig::new("Greeting"), move || GreetingJob {
            seen: first.clone()
        }));

        let second = seen.clone();
        let error = assert_err!(
            registry.register(JobConfig::new("Greeting").queue("emails"), move || {
                GreetingJob {
                    seen: second.clone(),
                }
            })
        );
        assert_eq!(error, RegistryError::DuplicateJobType("Greeting".into()));
        assert_eq!(
            registry.config("Greeting").map(JobConfig::queue_name),
            Some("default")
        );
    }

    #[test]
    fn unknown_job_types_do_not_resolve() {
        let registry = JobRegistry::new();
        assert_eq!(
            registry.resolve("Missing").err(),
            Some(RegistryError::UnknownJobType("Missing".into()))
        );
    }

    #[tokio::test]
    async fn each_execution_gets_a_fresh_handler() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();

        let (factory_seen, factory_built) = (seen.clone(), built.clone());
        registry
            .register(JobConfig::new("Greeting"), move || {
                factory_built.fetch_add(1, Ordering::SeqCst);
                GreetingJob {
                    seen: factory_seen.clone(),
                }
            })
            .unwrap();

        let run = registry.resolve("Greeting").unwrap();
        run(json!({"message": "hello"})).await.unwrap();
        run(json!({"message": "again"})).await.unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["hello", "again"]);
    }

    #[tokio::test]
    async fn malformed_payloads_are_reported() {
        let mut registry = JobRegistry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        registry
            .register(JobConfig::new("Greeting"), move || GreetingJob {
                seen: seen.clone(),
            })
            .unwrap();

        let run = registry.resolve("Greeting").unwrap();
        let error = run(json!({"wrong": true})).await.unwrap_err();
        assert!(matches!(error, ExecutionError::InvalidPayload(_)));
        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn factory_panics_surface_when_the_future_runs() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobConfig::new("Greeting"), || -> GreetingJob {
                panic!("missing dependency")
            })
            .unwrap();

        let run = registry.resolve("Greeting").unwrap();
        let future = run(json!({"message": "hello"}));
        let outcome = std::panic::AssertUnwindSafe(future).catch_unwind().await;
        assert!(outcome.is_err());
    }

    #[test]
    fn job_types_are_grouped_by_queue() {
        let mut registry = JobRegistry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for (name, queue) in [("B", "emails"), ("A", "emails"), ("C", "default")] {
            let seen = seen.clone();
            registry
                .register(JobConfig::new(name).queue(queue), move || GreetingJob {
                    seen: seen.clone(),
                })
                .unwrap();
        }

        assert_eq!(registry.job_types(), vec!["A", "B", "C"]);
        assert_eq!(registry.job_types_for_queue("emails"), vec!["A", "B"]);
    }
}

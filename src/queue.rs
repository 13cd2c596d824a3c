use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::background_job::EnqueueOptions;
use crate::broker::{Broker, NewJob};
use crate::errors::{ConfigError, EnqueueError, QueueError};
use crate::rate_limit::RateLimit;
use crate::schema::{JobCounts, JobId, JobState};

/// Static configuration of one named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Globally unique queue name
    pub name: String,
    /// Maximum number of jobs executed at the same time
    pub concurrency: usize,
    /// Optional cap on job starts per rolling window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl QueueConfig {
    /// A queue running up to `concurrency` jobs at once, without rate limit.
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            rate_limit: None,
        }
    }

    /// Limit how many jobs may start per rolling window.
    pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

/// Summary of what [`QueueRegistry::clear`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    /// Waiting and delayed records removed by the drain
    pub drained: u64,
    /// Records removed while cleaning the remaining states
    pub cleaned: u64,
}

/// The statically configured queues, all backed by one shared broker.
#[derive(Clone)]
pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    queues: Arc<[QueueConfig]>,
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl QueueRegistry {
    /// Provision the configured queues on `broker`.
    ///
    /// Queue names must be unique and every queue needs a concurrency of at
    /// least one.
    pub fn new(broker: Arc<dyn Broker>, configs: Vec<QueueConfig>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.name.as_str()) {
                return Err(ConfigError::DuplicateQueue(config.name.clone()));
            }
            if config.concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency(config.name.clone()));
            }
            if config
                .rate_limit
                .is_some_and(|limit| limit.max == 0 || limit.duration_ms == 0)
            {
                return Err(ConfigError::InvalidRateLimit(config.name.clone()));
            }
        }

        Ok(Self {
            broker,
            queues: configs.into(),
        })
    }

    /// The configuration of a single queue.
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    /// All queue configurations, in configuration order.
    pub fn configs(&self) -> &[QueueConfig] {
        &self.queues
    }

    /// All queue names, in configuration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|queue| queue.name.as_str())
    }

    /// The broker shared by every queue.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    fn known(&self, name: &str) -> Result<(), QueueError> {
        match self.queue(name) {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownQueue(name.to_string())),
        }
    }

    /// Store a record of `job_type` on `queue`.
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        data: Value,
        options: EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        if self.queue(queue).is_none() {
            return Err(EnqueueError::UnknownQueue(queue.to_string()));
        }

        let id = self
            .broker
            .enqueue(NewJob {
                queue: queue.to_string(),
                job_type: job_type.to_string(),
                data,
                options,
            })
            .await?;

        tracing::debug!(job.id = id, job.type = job_type, queue, "Enqueued job");
        Ok(id)
    }

    /// Per-state record counts of `queue`.
    pub async fn stats(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.known(queue)?;
        Ok(self.broker.counts(queue).await?)
    }

    /// Stop workers from claiming records of `queue`.
    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.known(queue)?;
        self.broker.pause(queue).await?;
        info!(queue, "Paused queue");
        Ok(())
    }

    /// Let workers claim records of `queue` again.
    pub async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.known(queue)?;
        self.broker.resume(queue).await?;
        info!(queue, "Resumed queue");
        Ok(())
    }

    /// Whether `queue` is currently paused.
    pub async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.known(queue)?;
        Ok(self.broker.is_paused(queue).await?)
    }

    /// Delete every waiting and delayed record of `queue`.
    ///
    /// Pause the queue first if workers may be running.
    pub async fn drain(&self, queue: &str) -> Result<u64, QueueError> {
        self.known(queue)?;
        Ok(self.broker.drain(queue).await?)
    }

    /// Delete every record of `queue` in `state`.
    ///
    /// Pause the queue first if workers may be running.
    pub async fn clean(&self, queue: &str, state: JobState) -> Result<u64, QueueError> {
        self.known(queue)?;
        Ok(self.broker.clean(queue, state).await?)
    }

    /// Remove every record of `queue`: pause, drain, clean all states, resume.
    ///
    /// The queue is resumed even when cleaning fails, so a failed clear never
    /// leaves it paused.
    pub async fn clear(&self, queue: &str) -> Result<ClearSummary, QueueError> {
        self.pause(queue).await?;

        let result = self.remove_everything(queue).await;
        let resumed = self.resume(queue).await;

        match (result, resumed) {
            (Ok(summary), Ok(())) => {
                info!(queue, drained = summary.drained, cleaned = summary.cleaned, "Cleared queue");
                Ok(summary)
            }
            (Err(error), resumed) => {
                if let Err(resume_error) = resumed {
                    warn!(queue, "Failed to resume queue after clearing: {resume_error}");
                }
                Err(error)
            }
            (Ok(_), Err(error)) => Err(error),
        }
    }

    async fn remove_everything(&self, queue: &str) -> Result<ClearSummary, QueueError> {
        let drained = self.broker.drain(queue).await?;
        let mut cleaned = 0;
        for state in JobState::ALL {
            cleaned += self.broker.clean(queue, state).await?;
        }
        Ok(ClearSummary { drained, cleaned })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use claims::{assert_err, assert_ok};
    use insta::assert_compact_json_snapshot;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(
            Arc::new(MemoryBroker::new()),
            vec![
                QueueConfig::new("default", 2),
                QueueConfig::new("emails", 2)
                    .rate_limit(RateLimit::new(10, Duration::from_secs(60))),
            ],
        )
        .unwrap()
    }

    #[test]
    fn duplicate_queue_names_are_rejected() {
        let error = assert_err!(QueueRegistry::new(
            Arc::new(MemoryBroker::new()),
            vec![QueueConfig::new("default", 1), QueueConfig::new("default", 4)],
        ));
        assert!(matches!(error, ConfigError::DuplicateQueue(name) if name == "default"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let error = assert_err!(QueueRegistry::new(
            Arc::new(MemoryBroker::new()),
            vec![QueueConfig::new("default", 0)],
        ));
        assert!(matches!(error, ConfigError::ZeroConcurrency(_)));
    }

    #[tokio::test]
    async fn enqueue_to_unknown_queue_fails() {
        let queues = registry();
        let error = assert_err!(
            queues
                .enqueue("reports", "ExampleJob", json!({}), EnqueueOptions::default())
                .await
        );
        assert!(matches!(error, EnqueueError::UnknownQueue(name) if name == "reports"));
        assert!(matches!(
            queues.stats("reports").await,
            Err(QueueError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn stats_report_every_state() {
        let queues = registry();
        for delay in [Duration::ZERO, Duration::ZERO, Duration::from_secs(60)] {
            let options = EnqueueOptions {
                delay,
                ..EnqueueOptions::default()
            };
            assert_ok!(queues.enqueue("emails", "SendWelcomeEmail", json!({}), options).await);
        }

        let counts = queues.stats("emails").await.unwrap();
        assert_compact_json_snapshot!(counts, @r#"{"waiting": 2, "active": 0, "delayed": 1, "completed": 0, "failed": 0}"#);
    }

    #[tokio::test]
    async fn clear_removes_everything_and_resumes() {
        let queues = registry();
        let options = EnqueueOptions {
            remove_on_complete: false,
            ..EnqueueOptions::default()
        };
        for _ in 0..3 {
            queues
                .enqueue("default", "ExampleJob", json!({"message": "x"}), options.clone())
                .await
                .unwrap();
        }
        let broker = queues.broker();
        let claimed = broker
            .claim("default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        broker.complete(claimed.id, claimed.attempts, false).await.unwrap();

        let summary = queues.clear("default").await.unwrap();
        assert_eq!(summary, ClearSummary { drained: 2, cleaned: 1 });
        assert_eq!(queues.stats("default").await.unwrap().total(), 0);
        assert!(!queues.is_paused("default").await.unwrap());

        assert_ok!(
            queues
                .enqueue("default", "ExampleJob", json!({"message": "y"}), options)
                .await
        );
        assert_eq!(queues.stats("default").await.unwrap().waiting, 1);
    }

    #[test]
    fn names_keep_configuration_order() {
        let queues = registry();
        assert_eq!(queues.names().collect::<Vec<_>>(), vec!["default", "emails"]);
        assert!(queues.queue("emails").unwrap().rate_limit.is_some());
    }
}

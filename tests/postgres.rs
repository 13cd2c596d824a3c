#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use jobqueue::schema::JobState;
use jobqueue::{
    BackgroundJob, Broker, EnqueueOptions, JobConfig, JobRegistry, NewJob, PgBroker, QueueConfig,
    QueueRegistry, Runner, setup_database,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the broker and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgBroker, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;

        // Use the standard postgres/postgres credentials for testcontainers
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((PgBroker::new(pool), container))
    }

    pub(super) fn new_job(queue: &str, data: Value, options: EnqueueOptions) -> NewJob {
        NewJob {
            queue: queue.to_string(),
            job_type: "TestJob".to_string(),
            data,
            options,
        }
    }
}

async fn stored_state(pool: &PgPool, id: i64) -> anyhow::Result<Option<String>> {
    let row = sqlx::query("SELECT state FROM background_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| row.get("state")))
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn claims_hand_out_the_oldest_record_once() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;

    let first = broker
        .enqueue(test_utils::new_job("default", json!({"n": 1}), EnqueueOptions::default()))
        .await?;
    let second = broker
        .enqueue(test_utils::new_job("default", json!({"n": 2}), EnqueueOptions::default()))
        .await?;

    let claimed = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.data, json!({"n": 1}));

    let claimed = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    assert_eq!(claimed.id, second);
    assert_none!(broker.claim("default", Duration::from_secs(30)).await?);
    assert_none!(broker.claim("emails", Duration::from_secs(30)).await?);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn concurrent_claims_never_overlap() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;
    let broker = Arc::new(broker);

    for n in 0..50 {
        broker
            .enqueue(test_utils::new_job("default", json!({"n": n}), EnqueueOptions::default()))
            .await?;
    }

    let mut claimers = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let broker = broker.clone();
        claimers.spawn(async move {
            let mut ids = Vec::new();
            while let Some(job) = broker.claim("default", Duration::from_secs(30)).await.unwrap() {
                ids.push(job.id);
            }
            ids
        });
    }

    let mut seen = HashSet::new();
    while let Some(ids) = claimers.join_next().await {
        for id in ids? {
            assert!(seen.insert(id), "record {id} was claimed twice");
        }
    }
    assert_eq!(seen.len(), 50);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn counts_derive_delayed_from_the_schedule() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;

    let keep = EnqueueOptions {
        remove_on_complete: false,
        max_attempts: 1,
        ..EnqueueOptions::default()
    };
    for _ in 0..3 {
        broker
            .enqueue(test_utils::new_job("default", json!({}), keep.clone()))
            .await?;
    }
    let later = EnqueueOptions {
        delay: Duration::from_secs(3600),
        ..keep.clone()
    };
    broker
        .enqueue(test_utils::new_job("default", json!({}), later))
        .await?;

    let done = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    broker.complete(done.id, done.attempts, false).await?;
    let failed = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    broker.fail(failed.id, failed.attempts, "boom", false).await?;
    assert_some!(broker.claim("default", Duration::from_secs(30)).await?);

    let counts = broker.counts("default").await?;
    assert_compact_json_snapshot!(counts, @r#"{"waiting": 0, "active": 1, "delayed": 1, "completed": 1, "failed": 1}"#);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn stale_acknowledgements_are_ignored() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;
    let options = EnqueueOptions {
        remove_on_complete: false,
        ..EnqueueOptions::default()
    };
    let id = broker
        .enqueue(test_utils::new_job("default", json!({}), options))
        .await?;

    let stalled = assert_some!(broker.claim("default", Duration::from_millis(50)).await?);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reclaimed = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempts, 2);

    // The first worker comes back and tries to settle its expired claim.
    broker.fail(id, stalled.attempts, "too late", false).await?;
    assert_eq!(stored_state(broker.pool(), id).await?.as_deref(), Some("active"));

    broker.complete(id, reclaimed.attempts, false).await?;
    assert_eq!(stored_state(broker.pool(), id).await?.as_deref(), Some("completed"));
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn expired_final_attempts_fail_instead_of_running_again() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;
    let single = EnqueueOptions {
        max_attempts: 1,
        ..EnqueueOptions::default()
    };
    let id = broker
        .enqueue(test_utils::new_job("default", json!({}), single))
        .await?;
    let next = broker
        .enqueue(test_utils::new_job("default", json!({}), EnqueueOptions::default()))
        .await?;

    let stalled = assert_some!(broker.claim("default", Duration::from_millis(50)).await?);
    assert_eq!(stalled.id, id);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let claimed = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    assert_eq!(claimed.id, next);
    assert_eq!(stored_state(broker.pool(), id).await?.as_deref(), Some("failed"));

    let row = sqlx::query("SELECT attempts, last_error FROM background_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(broker.pool())
        .await?;
    assert_eq!(row.get::<i32, _>("attempts"), 1);
    assert_eq!(
        row.get::<Option<String>, _>("last_error").as_deref(),
        Some("lease expired after final attempt")
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn paused_queues_hand_out_nothing() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;
    broker
        .enqueue(test_utils::new_job("default", json!({}), EnqueueOptions::default()))
        .await?;

    broker.pause("default").await?;
    assert!(broker.is_paused("default").await?);
    assert_none!(broker.claim("default", Duration::from_secs(30)).await?);

    broker.resume("default").await?;
    assert!(!broker.is_paused("default").await?);
    assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn drain_and_clean_remove_records_per_state() -> anyhow::Result<()> {
    let (broker, _container) = test_utils::setup_test_db().await?;
    let keep = EnqueueOptions {
        remove_on_complete: false,
        ..EnqueueOptions::default()
    };
    for _ in 0..2 {
        broker
            .enqueue(test_utils::new_job("default", json!({}), keep.clone()))
            .await?;
    }
    broker
        .enqueue(test_utils::new_job("emails", json!({}), keep.clone()))
        .await?;

    let done = assert_some!(broker.claim("default", Duration::from_secs(30)).await?);
    broker.complete(done.id, done.attempts, false).await?;

    assert_eq!(broker.drain("default").await?, 1);
    assert_eq!(broker.clean("default", JobState::Completed).await?, 1);
    assert_eq!(broker.counts("default").await?.total(), 0);
    assert_eq!(broker.counts("emails").await?.waiting, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn runner_processes_records_stored_in_postgres() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct Count {
        n: usize,
    }

    struct Counter {
        total: Arc<AtomicUsize>,
    }

    impl BackgroundJob for Counter {
        type Payload = Count;

        async fn handle(&self, payload: Self::Payload) -> anyhow::Result<()> {
            self.total.fetch_add(payload.n, Ordering::SeqCst);
            Ok(())
        }
    }

    let (broker, _container) = test_utils::setup_test_db().await?;
    let pool = broker.pool().clone();
    let queues = Arc::new(QueueRegistry::new(
        Arc::new(broker),
        vec![QueueConfig::new("default", 4)],
    )?);

    let total = Arc::new(AtomicUsize::new(0));
    let mut registry = JobRegistry::new();
    let factory_total = total.clone();
    let job = registry.register(JobConfig::new("Counter"), move || Counter {
        total: factory_total.clone(),
    })?;
    for n in 1..=10 {
        job.dispatch(&queues, &Count { n }).await?;
    }

    let handle = Runner::new(queues.clone(), Arc::new(registry))
        .poll_interval(Duration::from_millis(10))
        .jitter(Duration::ZERO)
        .shutdown_when_queue_empty()
        .start();
    tokio::time::timeout(Duration::from_secs(30), handle.wait_for_shutdown()).await?;

    assert_eq!(total.load(Ordering::SeqCst), 55);
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 0);
    Ok(())
}

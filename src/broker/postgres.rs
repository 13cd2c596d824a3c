use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use tracing::debug;

use super::{Broker, LEASE_EXPIRED_ERROR, NewJob};
use crate::config::BrokerConfig;
use crate::errors::BrokerError;
use crate::schema::{JobCounts, JobId, JobRecord, JobState};

const RECORD_COLUMNS: &str = "id, queue, job_type, data, attempts, max_attempts, backoff, \
    timeout_ms, remove_on_complete, remove_on_fail, run_at, created_at, last_error";

/// Apply the broker schema to `pool`.
pub async fn setup_database(pool: &PgPool) -> Result<(), BrokerError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// PostgreSQL-backed broker.
///
/// Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so any number of
/// worker processes can share one database without executing a record twice.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from `config` without connecting yet.
    ///
    /// Connection failures surface on the first operation that needs the
    /// database, which lets workers start while the database is still down.
    pub fn connect_lazy(config: &BrokerConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(config.connect_options());
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fail active records of `queue` whose final attempt lost its lease.
    async fn fail_abandoned(&self, queue: &str) -> Result<(), BrokerError> {
        let result = sqlx::query(
            r"
            WITH abandoned AS (
                SELECT id, remove_on_fail FROM background_jobs
                WHERE queue = $1
                  AND state = 'active'
                  AND locked_until < NOW()
                  AND attempts >= max_attempts
                  AND NOT EXISTS (SELECT 1 FROM paused_queues WHERE paused_queues.queue = $1)
                FOR UPDATE SKIP LOCKED
            ),
            removed AS (
                DELETE FROM background_jobs
                WHERE id IN (SELECT id FROM abandoned WHERE remove_on_fail)
            )
            UPDATE background_jobs
            SET state = 'failed', locked_until = NULL, last_error = $2, finished_at = NOW()
            WHERE id IN (SELECT id FROM abandoned WHERE NOT remove_on_fail)
            ",
        )
        .bind(queue)
        .bind(LEASE_EXPIRED_ERROR)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(queue, failed = result.rows_affected(), "Failed records that ran out of attempts");
        }
        Ok(())
    }
}

fn i32_saturating(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Broker for PgBroker {
    fn enqueue(&self, job: NewJob) -> BoxFuture<'_, Result<JobId, BrokerError>> {
        async move {
            let id = sqlx::query_scalar::<_, i64>(
                r"
                INSERT INTO background_jobs
                    (queue, job_type, data, max_attempts, backoff, timeout_ms,
                     remove_on_complete, remove_on_fail, run_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW() + make_interval(secs => $9))
                RETURNING id
                ",
            )
            .bind(&job.queue)
            .bind(&job.job_type)
            .bind(&job.data)
            .bind(i32_saturating(job.options.max_attempts))
            .bind(Json(job.options.backoff))
            .bind(job.options.timeout.map(millis))
            .bind(job.options.remove_on_complete)
            .bind(job.options.remove_on_fail)
            .bind(job.options.delay.as_secs_f64())
            .fetch_one(&self.pool)
            .await?;

            Ok(id)
        }
        .boxed()
    }

    fn claim<'a>(
        &'a self,
        queue: &'a str,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, BrokerError>> {
        async move {
            self.fail_abandoned(queue).await?;

            // The subselect locks exactly one candidate; concurrent claimers skip it.
            let query = format!(
                r"
                UPDATE background_jobs
                SET state = 'active',
                    attempts = attempts + 1,
                    locked_until = NOW() + make_interval(secs => $2)
                WHERE id = (
                    SELECT id FROM background_jobs
                    WHERE queue = $1
                      AND ((state = 'waiting' AND run_at <= NOW())
                        OR (state = 'active' AND locked_until < NOW() AND attempts < max_attempts))
                      AND NOT EXISTS (SELECT 1 FROM paused_queues WHERE paused_queues.queue = $1)
                    ORDER BY run_at ASC, id ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {RECORD_COLUMNS}
                "
            );

            let record = sqlx::query_as::<_, JobRecord>(&query)
                .bind(queue)
                .bind(lease.as_secs_f64())
                .fetch_optional(&self.pool)
                .await?;

            Ok(record)
        }
        .boxed()
    }

    fn extend_lease(
        &self,
        id: JobId,
        attempt: i32,
        lease: Duration,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        async move {
            sqlx::query(
                r"
                UPDATE background_jobs
                SET locked_until = NOW() + make_interval(secs => $3)
                WHERE id = $1 AND attempts = $2 AND state = 'active'
                ",
            )
            .bind(id)
            .bind(attempt)
            .bind(lease.as_secs_f64())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn complete(
        &self,
        id: JobId,
        attempt: i32,
        remove: bool,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        async move {
            let sql = if remove {
                "DELETE FROM background_jobs WHERE id = $1 AND attempts = $2 AND state = 'active'"
            } else {
                r"
                UPDATE background_jobs
                SET state = 'completed', locked_until = NULL, finished_at = NOW()
                WHERE id = $1 AND attempts = $2 AND state = 'active'
                "
            };

            let result = sqlx::query(sql)
                .bind(id)
                .bind(attempt)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                debug!(job.id = id, "Completed job was no longer held by this worker");
            }
            Ok(())
        }
        .boxed()
    }

    fn retry<'a>(
        &'a self,
        id: JobId,
        attempt: i32,
        delay: Duration,
        error: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        async move {
            sqlx::query(
                r"
                UPDATE background_jobs
                SET state = 'waiting',
                    locked_until = NULL,
                    run_at = NOW() + make_interval(secs => $3),
                    last_error = $4
                WHERE id = $1 AND attempts = $2 AND state = 'active'
                ",
            )
            .bind(id)
            .bind(attempt)
            .bind(delay.as_secs_f64())
            .bind(error)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn fail<'a>(
        &'a self,
        id: JobId,
        attempt: i32,
        error: &'a str,
        remove: bool,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        async move {
            if remove {
                sqlx::query(
                    "DELETE FROM background_jobs WHERE id = $1 AND attempts = $2 AND state = 'active'",
                )
                .bind(id)
                .bind(attempt)
                .execute(&self.pool)
                .await?;
            } else {
                sqlx::query(
                    r"
                    UPDATE background_jobs
                    SET state = 'failed', locked_until = NULL, last_error = $3, finished_at = NOW()
                    WHERE id = $1 AND attempts = $2 AND state = 'active'
                    ",
                )
                .bind(id)
                .bind(attempt)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn counts<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<JobCounts, BrokerError>> {
        async move {
            let counts = sqlx::query_as::<_, JobCounts>(
                r"
                SELECT
                    COUNT(*) FILTER (WHERE state = 'waiting' AND run_at <= NOW()) AS waiting,
                    COUNT(*) FILTER (WHERE state = 'active') AS active,
                    COUNT(*) FILTER (WHERE state = 'waiting' AND run_at > NOW()) AS delayed,
                    COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE state = 'failed') AS failed
                FROM background_jobs
                WHERE queue = $1
                ",
            )
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
            Ok(counts)
        }
        .boxed()
    }

    fn pause<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        async move {
            sqlx::query("INSERT INTO paused_queues (queue) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(queue)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn resume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        async move {
            sqlx::query("DELETE FROM paused_queues WHERE queue = $1")
                .bind(queue)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn is_paused<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<bool, BrokerError>> {
        async move {
            let paused = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM paused_queues WHERE queue = $1)",
            )
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
            Ok(paused)
        }
        .boxed()
    }

    fn drain<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<u64, BrokerError>> {
        async move {
            let result =
                sqlx::query("DELETE FROM background_jobs WHERE queue = $1 AND state = 'waiting'")
                    .bind(queue)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }
        .boxed()
    }

    fn clean<'a>(
        &'a self,
        queue: &'a str,
        state: JobState,
    ) -> BoxFuture<'a, Result<u64, BrokerError>> {
        async move {
            let filter = match state {
                JobState::Waiting => "state = 'waiting' AND run_at <= NOW()",
                JobState::Delayed => "state = 'waiting' AND run_at > NOW()",
                JobState::Active => "state = 'active'",
                JobState::Completed => "state = 'completed'",
                JobState::Failed => "state = 'failed'",
            };
            let query = format!("DELETE FROM background_jobs WHERE queue = $1 AND {filter}");

            let result = sqlx::query(&query)
                .bind(queue)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
        .boxed()
    }
}

//! MySQL-backed queue.
//!
//! One row per envelope in `{prefix}queue_jobs`; `available_at` gates
//! delayed execution and `reserved_at` marks a live reservation.
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE queue_jobs (
//!     id           BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
//!     queue_name   VARCHAR(191) NOT NULL,
//!     payload      TEXT NOT NULL,
//!     attempts     BIGINT NOT NULL DEFAULT 0,
//!     available_at BIGINT NOT NULL,
//!     reserved_at  BIGINT NULL,
//!     created_at   BIGINT NOT NULL,
//!     KEY idx_queue_name (queue_name)
//! );
//!
//! CREATE TABLE queue_failed_jobs (
//!     id         BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
//!     queue_name VARCHAR(191) NOT NULL,
//!     payload    TEXT NOT NULL,
//!     exception  TEXT NOT NULL,
//!     failed_at  BIGINT NOT NULL
//! );
//! ```

use crate::driver::{Job, JobState, QueueDriver};
use crate::{Payload, QueueError, Result, payload};
use async_trait::async_trait;
use log::{error, warn};
use sqlx::MySqlPool;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// MySQL backend; reservation installation is atomic with the dequeue
/// through a `SELECT ... FOR UPDATE` row lock, so multiple consumer
/// processes may share one database.
#[derive(Clone)]
pub struct MySqlDriver {
    pool: MySqlPool,
    table_prefix: String,
}

impl MySqlDriver {
    pub fn new(pool: MySqlPool, table_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.into(),
        }
    }

    fn jobs_table(&self) -> String {
        format!("{}queue_jobs", self.table_prefix)
    }

    fn failed_jobs_table(&self) -> String {
        format!("{}queue_failed_jobs", self.table_prefix)
    }
}

#[async_trait]
impl QueueDriver for MySqlDriver {
    async fn size(&self, queue: &str) -> Result<i64> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let query = format!(
            "SELECT COUNT(*) FROM {} WHERE queue_name = ? \
             AND ((reserved_at IS NULL AND available_at <= ?) \
              OR (reserved_at IS NOT NULL AND reserved_at <= ?))",
            self.jobs_table()
        );

        let (count,): (i64,) = sqlx::query_as(&query)
            .bind(queue)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn push(&self, queue: &str, bytes: &[u8]) -> Result<()> {
        self.later_at(queue, OffsetDateTime::now_utc(), bytes).await
    }

    async fn later(&self, queue: &str, delay: Duration, bytes: &[u8]) -> Result<()> {
        self.later_at(queue, OffsetDateTime::now_utc() + delay, bytes)
            .await
    }

    async fn later_at(&self, queue: &str, at: OffsetDateTime, bytes: &[u8]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (queue_name, payload, attempts, available_at, created_at) \
             VALUES (?, ?, 0, ?, ?)",
            self.jobs_table()
        );

        sqlx::query(&query)
            .bind(queue)
            .bind(String::from_utf8_lossy(bytes).into_owned())
            .bind(at.unix_timestamp())
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn Job>>> {
        let now = OffsetDateTime::now_utc();
        let now_unix = now.unix_timestamp();

        let mut tx = self.pool.begin().await?;

        // Reclaim reservations whose deadline has passed.
        let reclaim = format!(
            "UPDATE {} SET reserved_at = NULL \
             WHERE queue_name = ? AND reserved_at IS NOT NULL AND reserved_at <= ?",
            self.jobs_table()
        );
        sqlx::query(&reclaim)
            .bind(queue)
            .bind(now_unix)
            .execute(&mut *tx)
            .await?;

        // Oldest available row, locked for this transaction.
        let select = format!(
            "SELECT id, payload, attempts FROM {} \
             WHERE queue_name = ? AND available_at <= ? AND reserved_at IS NULL \
             ORDER BY id ASC LIMIT 1 FOR UPDATE",
            self.jobs_table()
        );
        let row: Option<(u64, String, i64)> = sqlx::query_as(&select)
            .bind(queue)
            .bind(now_unix)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((id, payload_str, attempts)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut decoded: Payload = match payload::decode(payload_str.as_bytes()) {
            Ok(decoded) => decoded,
            Err(err) => {
                // Poison row: remove it so it cannot wedge the queue.
                error!("drop undecodable job {id} on queue {queue}: {err}");
                let delete = format!("DELETE FROM {} WHERE id = ?", self.jobs_table());
                sqlx::query(&delete).bind(id).execute(&mut *tx).await?;
                tx.commit().await?;
                return Err(QueueError::Storage(format!(
                    "drop undecodable job {id} on queue {queue}: {err}"
                )));
            }
        };

        let reserved_until = now_unix + decoded.timeout.max(0);
        let reserve = format!(
            "UPDATE {} SET reserved_at = ?, attempts = attempts + 1 WHERE id = ?",
            self.jobs_table()
        );
        sqlx::query(&reserve)
            .bind(reserved_until)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        // First pop: persist PopTime in the stored payload. The attempts
        // column stays authoritative for attempt accounting.
        if decoded.pop_time == 0 {
            decoded.pop_time = now_unix;
            let update_payload = format!("UPDATE {} SET payload = ? WHERE id = ?", self.jobs_table());
            sqlx::query(&update_payload)
                .bind(String::from_utf8_lossy(&payload::encode(&decoded)?).into_owned())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        decoded.attempts = attempts + 1;
        decoded.timeout_at = reserved_until;

        Ok(Some(Arc::new(MySqlJob {
            pool: self.pool.clone(),
            jobs_table: self.jobs_table(),
            failed_jobs_table: self.failed_jobs_table(),
            table_id: id,
            queue: queue.to_string(),
            state: JobState::new(decoded, now),
        })))
    }
}

struct MySqlJob {
    pool: MySqlPool,
    jobs_table: String,
    failed_jobs_table: String,
    table_id: u64,
    queue: String,
    state: JobState,
}

#[async_trait]
impl Job for MySqlJob {
    async fn release(&self, delay: i64) -> Result<()> {
        self.state.mark_released();

        let available_at = OffsetDateTime::now_utc().unix_timestamp() + delay.max(0);
        let query = format!(
            "UPDATE {} SET reserved_at = NULL, available_at = ? WHERE id = ?",
            self.jobs_table
        );
        sqlx::query(&query)
            .bind(available_at)
            .bind(self.table_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.state.mark_deleted();

        let query = format!("DELETE FROM {} WHERE id = ?", self.jobs_table);
        sqlx::query(&query)
            .bind(self.table_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn failed(&self, err: &QueueError) {
        let failed_at = OffsetDateTime::now_utc().unix_timestamp();
        let encoded = match payload::encode(self.state.payload()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(encode_err) => {
                warn!(
                    "failed to encode payload for failed job {}: {encode_err}",
                    self.state.payload().id
                );
                return;
            }
        };

        let query = format!(
            "INSERT INTO {} (queue_name, payload, exception, failed_at) VALUES (?, ?, ?, ?)",
            self.failed_jobs_table
        );
        if let Err(db_err) = sqlx::query(&query)
            .bind(&self.queue)
            .bind(encoded)
            .bind(err.to_string())
            .bind(failed_at)
            .execute(&self.pool)
            .await
        {
            warn!("failed to record failed job {}: {db_err}", self.state.payload().id);
        }
    }

    fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    fn is_released(&self) -> bool {
        self.state.is_released()
    }

    fn has_failed(&self) -> bool {
        self.state.has_failed()
    }

    fn mark_as_failed(&self) {
        self.state.mark_failed();
    }

    fn attempts(&self) -> i64 {
        self.state.payload().attempts
    }

    fn pop_time(&self) -> OffsetDateTime {
        self.state.pop_time()
    }

    fn timeout(&self) -> Duration {
        self.state.timeout()
    }

    fn timeout_at(&self) -> OffsetDateTime {
        self.state.timeout_at()
    }

    fn name(&self) -> &str {
        &self.queue
    }

    fn payload(&self) -> &Payload {
        self.state.payload()
    }
}

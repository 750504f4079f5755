use crate::{Payload, QueueError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Durable backend contract. All operations must be safe for concurrent
/// callers; each implementation handles its own locking.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Count of envelopes that are available (no live reservation) or
    /// whose reservation has expired.
    async fn size(&self, queue: &str) -> Result<i64>;

    /// Enqueue an envelope, immediately available.
    async fn push(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Enqueue an envelope that becomes available after `delay`.
    async fn later(&self, queue: &str, delay: Duration, payload: &[u8]) -> Result<()>;

    /// Enqueue an envelope that becomes available at `at`.
    async fn later_at(&self, queue: &str, at: OffsetDateTime, payload: &[u8]) -> Result<()>;

    /// Atomically: reclaim expired reservations, select the oldest
    /// available envelope, install a reservation for its timeout window,
    /// bump the attempt counter (and `PopTime` on first pop), and return
    /// a handle bound to that reservation. Never blocks waiting for work.
    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn Job>>>;
}

/// Per-dequeue handle owned by the worker that popped it. The handle's
/// life ends when the job is released, deleted, or terminally failed.
#[async_trait]
pub trait Job: Send + Sync {
    /// Requeue the job as delayed by `delay` seconds (available now when 0).
    async fn release(&self, delay: i64) -> Result<()>;

    /// Remove the job; it will not run again.
    async fn delete(&self) -> Result<()>;

    /// Driver-specific terminal-failure bookkeeping (e.g. the MySQL
    /// failed-jobs table). Called after the job has been deleted.
    async fn failed(&self, err: &QueueError);

    fn is_deleted(&self) -> bool;

    fn is_released(&self) -> bool;

    fn has_failed(&self) -> bool;

    fn mark_as_failed(&self);

    /// Attempts begun so far, including the pop that produced this handle.
    fn attempts(&self) -> i64;

    /// Moment of the first successful reservation.
    fn pop_time(&self) -> OffsetDateTime;

    /// Wall-clock execution budget per attempt.
    fn timeout(&self) -> Duration;

    /// Moment the current reservation expires.
    fn timeout_at(&self) -> OffsetDateTime;

    /// Queue name the job belongs to.
    fn name(&self) -> &str;

    fn payload(&self) -> &Payload;
}

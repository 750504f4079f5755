use crate::driver::{Job, JobState, QueueDriver};
use crate::{Payload, QueueError, Result, payload};
use async_trait::async_trait;
use log::error;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

/// Internal clock in unix milliseconds, so sub-second delays behave
/// exactly. The persisted envelope keeps second resolution.
fn unix_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Delayed envelope keyed for min-heap ordering (earliest first, FIFO on
/// ties via the insertion sequence).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEnvelope {
    available_at_ms: i64,
    seq: u64,
    bytes: Vec<u8>,
}

impl PartialOrd for DelayedEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering so BinaryHeap pops the earliest entry first.
        (other.available_at_ms, other.seq).cmp(&(self.available_at_ms, self.seq))
    }
}

struct ReservedEnvelope {
    reserved_until_ms: i64,
    payload: Payload,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    delayed: BinaryHeap<DelayedEnvelope>,
    reserved: HashMap<String, ReservedEnvelope>,
    seq: u64,
}

impl QueueState {
    /// Move expired reservations to the head of the ready queue and due
    /// delayed envelopes to the tail.
    fn reclaim(&mut self, now_ms: i64) {
        let expired: Vec<String> = self
            .reserved
            .iter()
            .filter(|(_, entry)| entry.reserved_until_ms <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = self.reserved.remove(&id)
                && let Ok(bytes) = payload::encode(&entry.payload)
            {
                self.ready.push_front(bytes);
            }
        }

        while let Some(entry) = self.delayed.peek() {
            if entry.available_at_ms > now_ms {
                break;
            }
            let entry = self.delayed.pop().expect("peeked entry exists");
            self.ready.push_back(entry.bytes);
        }
    }

    fn push_delayed(&mut self, available_at_ms: i64, bytes: Vec<u8>) {
        self.seq += 1;
        self.delayed.push(DelayedEnvelope {
            available_at_ms,
            seq: self.seq,
            bytes,
        });
    }
}

/// Mutex-protected single-process backend. Suitable for development and
/// tests only: nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    async fn size(&self, queue: &str) -> Result<i64> {
        let now_ms = unix_ms(OffsetDateTime::now_utc());
        let queues = self.queues.lock().expect("memory queue lock poisoned");
        let Some(state) = queues.get(queue) else {
            return Ok(0);
        };

        let due_delayed = state
            .delayed
            .iter()
            .filter(|entry| entry.available_at_ms <= now_ms)
            .count();
        let expired_reserved = state
            .reserved
            .values()
            .filter(|entry| entry.reserved_until_ms <= now_ms)
            .count();

        Ok((state.ready.len() + due_delayed + expired_reserved) as i64)
    }

    async fn push(&self, queue: &str, bytes: &[u8]) -> Result<()> {
        let mut queues = self.queues.lock().expect("memory queue lock poisoned");
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(bytes.to_vec());
        Ok(())
    }

    async fn later(&self, queue: &str, delay: Duration, bytes: &[u8]) -> Result<()> {
        self.later_at(queue, OffsetDateTime::now_utc() + delay, bytes)
            .await
    }

    async fn later_at(&self, queue: &str, at: OffsetDateTime, bytes: &[u8]) -> Result<()> {
        let mut queues = self.queues.lock().expect("memory queue lock poisoned");
        queues
            .entry(queue.to_string())
            .or_default()
            .push_delayed(unix_ms(at), bytes.to_vec());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Arc<dyn Job>>> {
        let now = OffsetDateTime::now_utc();
        let now_ms = unix_ms(now);

        let mut queues = self.queues.lock().expect("memory queue lock poisoned");
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        state.reclaim(now_ms);

        let Some(bytes) = state.ready.pop_front() else {
            return Ok(None);
        };

        // Malformed envelopes are dropped as poison.
        let mut decoded = match payload::decode(&bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!("drop undecodable job on queue {queue}: {err}");
                return Err(QueueError::Storage(format!(
                    "drop undecodable job on queue {queue}: {err}"
                )));
            }
        };

        decoded.attempts += 1;
        if decoded.pop_time == 0 {
            decoded.pop_time = now.unix_timestamp();
        }
        decoded.timeout_at = now.unix_timestamp() + decoded.timeout.max(0);

        state.reserved.insert(
            decoded.id.clone(),
            ReservedEnvelope {
                reserved_until_ms: now_ms + decoded.timeout.max(0) * 1_000,
                payload: decoded.clone(),
            },
        );

        Ok(Some(Arc::new(MemoryJob {
            queues: Arc::clone(&self.queues),
            queue: queue.to_string(),
            state: JobState::new(decoded, now),
        })))
    }
}

struct MemoryJob {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    queue: String,
    state: JobState,
}

#[async_trait]
impl Job for MemoryJob {
    async fn release(&self, delay: i64) -> Result<()> {
        self.state.mark_released();

        let mut queues = self.queues.lock().expect("memory queue lock poisoned");
        let Some(queue) = queues.get_mut(&self.queue) else {
            return Ok(());
        };
        // Nothing to do when the reservation was already reclaimed.
        if queue.reserved.remove(&self.state.payload().id).is_none() {
            return Ok(());
        }

        let bytes = payload::encode(self.state.payload())?;
        if delay <= 0 {
            queue.ready.push_back(bytes);
        } else {
            let available_at_ms = unix_ms(OffsetDateTime::now_utc()) + delay * 1_000;
            queue.push_delayed(available_at_ms, bytes);
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.state.mark_deleted();

        let mut queues = self.queues.lock().expect("memory queue lock poisoned");
        if let Some(queue) = queues.get_mut(&self.queue) {
            queue.reserved.remove(&self.state.payload().id);
        }
        Ok(())
    }

    async fn failed(&self, _err: &QueueError) {}

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

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(queue: &str, timeout: i64) -> Vec<u8> {
        payload::encode(&Payload::new(queue, 3, 0, timeout, b"data".to_vec())).unwrap()
    }

    #[tokio::test]
    async fn push_pop_reserves_and_counts_attempts() {
        let driver = MemoryDriver::new();
        driver.push("q", &envelope("q", 60)).await.unwrap();
        assert_eq!(driver.size("q").await.unwrap(), 1);

        let job = driver.pop("q").await.unwrap().expect("job available");
        assert_eq!(job.attempts(), 1);
        assert!(job.payload().pop_time > 0);

        // Reserved with a live reservation: not available, not counted.
        assert_eq!(driver.size("q").await.unwrap(), 0);
        assert!(driver.pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_reservation() {
        let driver = MemoryDriver::new();
        driver.push("q", &envelope("q", 60)).await.unwrap();

        let job = driver.pop("q").await.unwrap().unwrap();
        job.delete().await.unwrap();
        assert!(job.is_deleted());
        assert_eq!(driver.size("q").await.unwrap(), 0);
        assert!(driver.pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_requeues_with_attempts_kept() {
        let driver = MemoryDriver::new();
        driver.push("q", &envelope("q", 60)).await.unwrap();

        let job = driver.pop("q").await.unwrap().unwrap();
        job.release(0).await.unwrap();
        assert!(job.is_released());

        let again = driver.pop("q").await.unwrap().expect("released job back");
        assert_eq!(again.attempts(), 2);
    }

    #[tokio::test]
    async fn expired_reservation_is_reclaimed_on_next_pop() {
        let driver = MemoryDriver::new();
        // Timeout 0 seconds: the reservation expires immediately.
        driver.push("q", &envelope("q", 0)).await.unwrap();

        let first = driver.pop("q").await.unwrap().unwrap();
        assert_eq!(first.attempts(), 1);

        let second = driver.pop("q").await.unwrap().expect("reclaimed job");
        assert_eq!(second.attempts(), 2);
        assert_eq!(second.payload().pop_time, first.payload().pop_time);
    }

    #[tokio::test]
    async fn reclaimed_job_jumps_ahead_of_new_arrivals() {
        let driver = MemoryDriver::new();
        driver.push("q", &envelope("q", 0)).await.unwrap();
        let stale = driver.pop("q").await.unwrap().unwrap();

        driver.push("q", &envelope("q", 60)).await.unwrap();

        // The reclaimed envelope re-enters at the head of the queue.
        let next = driver.pop("q").await.unwrap().unwrap();
        assert_eq!(next.payload().id, stale.payload().id);
    }

    #[tokio::test]
    async fn delayed_jobs_stay_hidden_until_due() {
        let driver = MemoryDriver::new();
        driver
            .later("q", Duration::from_secs(3600), &envelope("q", 60))
            .await
            .unwrap();

        assert_eq!(driver.size("q").await.unwrap(), 0);
        assert!(driver.pop("q").await.unwrap().is_none());

        driver
            .later_at("q", OffsetDateTime::now_utc(), &envelope("q", 60))
            .await
            .unwrap();
        assert!(driver.pop("q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn poison_envelope_surfaces_as_storage_error_and_is_dropped() {
        let driver = MemoryDriver::new();
        driver.push("q", b"{not json").await.unwrap();

        assert!(driver.pop("q").await.is_err());
        // Dropped: the queue is empty afterwards.
        assert!(driver.pop("q").await.unwrap().is_none());
    }
}

pub mod memory;
pub mod mysql;
pub mod redis;
pub mod traits;

pub use self::memory::MemoryDriver;
pub use self::mysql::MySqlDriver;
pub use self::redis::RedisDriver;
pub use self::traits::{Job, QueueDriver};

use crate::Payload;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

/// Sorted-set key holding delayed envelopes for `queue`.
pub(crate) fn delayed_name(queue: &str) -> String {
    format!("{queue}:delayed")
}

/// Sorted-set key holding reserved envelopes for `queue`.
pub(crate) fn reserved_name(queue: &str) -> String {
    format!("{queue}:reserved")
}

/// State shared by every job handle implementation: the decoded envelope,
/// reservation metadata, and the release/delete/failure flags.
pub(crate) struct JobState {
    payload: Payload,
    pop_time: OffsetDateTime,
    timeout: Duration,
    timeout_at: OffsetDateTime,
    released: AtomicBool,
    deleted: AtomicBool,
    failed: AtomicBool,
}

impl JobState {
    pub(crate) fn new(payload: Payload, reserved_at: OffsetDateTime) -> Self {
        let timeout = Duration::from_secs(payload.timeout.max(0) as u64);
        let pop_time = OffsetDateTime::from_unix_timestamp(payload.pop_time)
            .unwrap_or(reserved_at);
        Self {
            pop_time,
            timeout,
            timeout_at: reserved_at + timeout,
            payload,
            released: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn pop_time(&self) -> OffsetDateTime {
        self.pop_time
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn timeout_at(&self) -> OffsetDateTime {
        self.timeout_at
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

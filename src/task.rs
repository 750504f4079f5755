use crate::{Payload, QueueError, RawBody, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Execution time ceiling applied when a task does not override
/// [`Task::timeout`]: 15 minutes.
pub const DEFAULT_MAX_EXECUTE_DURATION: Duration = Duration::from_secs(900);

/// A unit of background work, registered once and referenced by name.
///
/// The provided methods supply the default settings (single attempt,
/// immediate retry, 900 s timeout); override them per task as needed.
/// Envelope metadata is captured at dispatch time, so changing these
/// values only affects jobs dispatched afterwards.
#[async_trait]
pub trait Task: Send + Sync {
    /// Queue name this task consumes. Must be unique per registry.
    fn name(&self) -> &str;

    /// Maximum attempts for one job.
    fn max_tries(&self) -> i64 {
        1
    }

    /// Seconds to wait before a failed job becomes available again.
    fn retry_interval(&self) -> i64 {
        0
    }

    /// Wall-clock execution budget per attempt.
    fn timeout(&self) -> Duration {
        DEFAULT_MAX_EXECUTE_DURATION
    }

    /// Run one job. The token is cancelled when the attempt deadline
    /// passes; long-running tasks should observe it. Returning an error
    /// triggers release-with-backoff until the attempt cap is reached.
    async fn execute(&self, ctx: CancellationToken, body: RawBody) -> Result<()>;
}

/// Hook invoked once when a job is terminally failed (or aborted by the
/// overlap guard). The returned error is logged and swallowed.
pub type FailedJobHandler =
    Box<dyn Fn(&Payload, &QueueError) -> Result<()> + Send + Sync + 'static>;

use super::Manager;
use crate::driver::Job;
use crate::{QueueError, payload};
use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

impl Manager {
    /// Run one dequeued job: timeout control, attempt accounting, result
    /// routing. The busy flag brackets the whole execution so the
    /// shutdown supervisor can observe quiescence.
    pub(crate) async fn run_job(self: &Arc<Self>, job: Arc<dyn Job>, worker_id: i64, busy: &AtomicBool) {
        busy.store(true, Ordering::SeqCst);
        self.pending_handoff.fetch_sub(1, Ordering::SeqCst);

        self.execute_job(&job, worker_id).await;

        // Only the worker that claimed the in-flight entry may clear it;
        // the overlap-abort path must not evict the running attempt's.
        self.in_working()
            .remove_if(&job.payload().id, |_, owner| *owner == worker_id);
        busy.store(false, Ordering::SeqCst);
    }

    async fn execute_job(self: &Arc<Self>, job: &Arc<dyn Job>, worker_id: i64) {
        let Some(task) = self.get_task(job.name()) else {
            return;
        };

        // The previous attempt for this ID may still be running: its
        // reservation expired and the job was reclaimed. Do not execute;
        // push the job back as delayed and surface the conflict.
        use dashmap::mapref::entry::Entry;
        match self.in_working().entry(job.payload().id.clone()) {
            Entry::Occupied(_) => {
                warn!(
                    "{}: queue {} job {} pop_time {}",
                    QueueError::AbortForWaitingPrevJobFinish,
                    job.name(),
                    job.payload().id,
                    job.pop_time()
                );

                if let Ok(bytes) = payload::encode(job.payload()) {
                    let delay = Duration::from_secs(job.payload().retry_interval.max(0) as u64);
                    if let Err(err) = self.driver.later(job.name(), delay, &bytes).await {
                        warn!("re-enqueue overlapping job {} failed: {err}", job.payload().id);
                    }
                }
                self.record_failed_job(job.payload(), &QueueError::AbortForWaitingPrevJobFinish);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(worker_id);
            }
        }

        if self.mark_job_as_failed_if_already_exceeds_max_attempts(job).await {
            return;
        }

        info!(
            "queue.job.processing: queue {} worker {worker_id} job {} attempt {}",
            job.name(),
            job.payload().id,
            job.attempts()
        );

        // The task runs on its own tokio task so a timeout leaves it
        // running (cancellation is cooperative via the token) and a panic
        // is contained to the join handle.
        let token = CancellationToken::new();
        let exec_token = token.clone();
        let exec_task = Arc::clone(&task);
        let exec_job = Arc::clone(job);
        let exec_manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let body = exec_job.payload().raw_body();
            match exec_task.execute(exec_token, body).await {
                Ok(()) => {
                    info!(
                        "queue.job.processed: queue {} worker {worker_id} job {} duration {:?}",
                        exec_job.name(),
                        exec_job.payload().id,
                        OffsetDateTime::now_utc() - exec_job.pop_time()
                    );
                    if let Err(err) = exec_job.delete().await {
                        warn!("delete processed job {} failed: {err}", exec_job.payload().id);
                    }
                }
                Err(err) => {
                    error!(
                        "queue.job.failed: queue {} worker {worker_id} job {}: {err}",
                        exec_job.name(),
                        exec_job.payload().id
                    );
                    exec_manager
                        .mark_job_as_failed_if_will_exceed_max_attempts(&exec_job, err)
                        .await;
                }
            }
        });

        tokio::select! {
            joined = handle => {
                if let Err(join_err) = joined
                    && join_err.is_panic()
                {
                    let message = panic_message(join_err);
                    error!(
                        "queue.execute.panic: queue {} worker {worker_id} job {}: {message}",
                        job.name(),
                        job.payload().id
                    );
                    self.mark_job_as_failed_if_will_exceed_max_attempts(job, QueueError::Panic(message))
                        .await;
                }
            }
            _ = tokio::time::sleep(job.timeout()) => {
                warn!(
                    "queue.job.timeout: queue {} worker {worker_id} job {} timeout {:?}",
                    job.name(),
                    job.payload().id,
                    job.timeout()
                );
                token.cancel();
                self.mark_job_as_failed_if_will_exceed_max_attempts(job, QueueError::Timeout(job.timeout()))
                    .await;
            }
        }
    }

    /// Pre-execute check. True means the job was terminal before running:
    /// a reservation already pushed `Attempts` past `MaxTries`.
    async fn mark_job_as_failed_if_already_exceeds_max_attempts(&self, job: &Arc<dyn Job>) -> bool {
        self.warn_if_running_too_long(job);

        if job.attempts() <= job.payload().max_tries {
            return false;
        }

        self.fail_job(job, QueueError::MaxAttemptsExceeded).await;
        true
    }

    /// Post-failure routing: terminal once the attempt cap is reached,
    /// otherwise released back with the task's retry backoff.
    pub(crate) async fn mark_job_as_failed_if_will_exceed_max_attempts(
        &self,
        job: &Arc<dyn Job>,
        err: QueueError,
    ) {
        if job.is_deleted() || job.is_released() {
            return;
        }

        self.warn_if_running_too_long(job);

        if job.attempts() >= job.payload().max_tries {
            self.fail_job(job, err).await;
        } else if let Err(release_err) = job.release(job.payload().retry_interval).await {
            warn!("release job {} failed: {release_err}", job.payload().id);
        }
    }

    fn warn_if_running_too_long(&self, job: &Arc<dyn Job>) {
        if OffsetDateTime::now_utc() - job.pop_time() >= job.timeout() {
            warn!(
                "queue.execute.too.long: queue {} job {} pop_time {}",
                job.name(),
                job.payload().id,
                job.pop_time()
            );
        }
    }

    /// Terminal failure: remove the job, then notify the driver-level
    /// failure sink and the user handler exactly once.
    async fn fail_job(&self, job: &Arc<dyn Job>, err: QueueError) {
        job.mark_as_failed();

        if job.is_deleted() {
            return;
        }
        if let Err(delete_err) = job.delete().await {
            warn!("delete failed job {} failed: {delete_err}", job.payload().id);
        }

        error!(
            "queue.failed.log: queue {} job {}: {err}",
            job.name(),
            job.payload().id
        );

        job.failed(&err).await;
        self.record_failed_job(job.payload(), &err);
    }
}

fn panic_message(err: JoinError) -> String {
    let panic = err.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

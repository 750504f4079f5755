use crate::driver::{MemoryDriver, MySqlDriver, QueueDriver, RedisDriver};
use crate::manager::Manager;
use crate::{Config, FailedJobHandler, Payload, QueueError, Result, Statistics, Task, payload};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Backend selection together with its connection handle.
pub enum Driver {
    /// Process-local backend for development and tests.
    Memory,
    /// Redis connection pool; multi-process safe.
    Redis(deadpool_redis::Pool),
    /// MySQL connection pool; multi-process safe. The jobs/failed-jobs
    /// table names are prefixed with `Config::table_prefix`.
    MySql(sqlx::MySqlPool),
}

/// Public queue surface: dispatching on the producer side, task
/// registration and lifecycle control on the consumer side. Cloning is
/// cheap and clones share the same underlying queue.
#[derive(Clone)]
pub struct Queue {
    driver: Arc<dyn QueueDriver>,
    manager: Arc<Manager>,
}

impl Queue {
    pub fn new(driver: Driver, config: Config) -> Self {
        let config = config.normalized();
        let driver: Arc<dyn QueueDriver> = match driver {
            Driver::Memory => Arc::new(MemoryDriver::new()),
            Driver::Redis(pool) => Arc::new(RedisDriver::new(pool)),
            Driver::MySql(pool) => Arc::new(MySqlDriver::new(pool, config.table_prefix.clone())),
        };

        Self {
            driver: Arc::clone(&driver),
            manager: Manager::new(driver, config),
        }
    }

    // region failed-job handling

    /// Register the hook invoked once per terminally failed job. Its
    /// error return is logged and swallowed.
    pub fn set_failed_job_handler(&self, handler: FailedJobHandler) {
        self.manager.set_failed_job_handler(handler);
    }

    // endregion

    // region task registration

    /// Register one task definition. Registering a second task with the
    /// same name replaces the first.
    pub fn bootstrap_one(&self, task: Arc<dyn Task>) -> Result<()> {
        self.manager.bootstrap_one(task)
    }

    /// Register several task definitions at once.
    pub fn bootstrap(&self, tasks: Vec<Arc<dyn Task>>) -> Result<()> {
        self.manager.bootstrap(tasks)
    }

    // endregion

    // region consumer lifecycle

    /// Start the consumer topology: the general looper, one dedicated
    /// looper per allowed task, the initial worker pool and (when
    /// configured) the autoscale monitor. Idempotent; returns
    /// [`QueueError::QueueClosed`] once the queue is shutting down.
    pub fn start(&self) -> Result<()> {
        self.manager.start()
    }

    /// Graceful shutdown: loopers stop polling, then the call waits up to
    /// `timeout` for in-flight jobs to finish. Jobs still reserved at the
    /// deadline are reclaimed by the backend when their reservation
    /// expires.
    pub async fn shut_down(&self, timeout: Duration) -> Result<()> {
        self.manager.shut_down(timeout).await
    }

    // endregion

    // region dispatching

    /// Enqueue a job for immediate execution.
    pub async fn dispatch<P: serde::Serialize>(&self, task: &dyn Task, payload: &P) -> Result<()> {
        let encoded = self.marshal_payload(task, payload)?;
        self.driver.push(task.name(), &encoded).await
    }

    /// Enqueue a job that becomes available after `delay`.
    pub async fn delay<P: serde::Serialize>(
        &self,
        task: &dyn Task,
        payload: &P,
        delay: Duration,
    ) -> Result<()> {
        let encoded = self.marshal_payload(task, payload)?;
        self.driver.later(task.name(), delay, &encoded).await
    }

    /// Enqueue a job that becomes available at `at`.
    pub async fn delay_at<P: serde::Serialize>(
        &self,
        task: &dyn Task,
        payload: &P,
        at: OffsetDateTime,
    ) -> Result<()> {
        let encoded = self.marshal_payload(task, payload)?;
        self.driver.later_at(task.name(), at, &encoded).await
    }

    /// [`Queue::dispatch`] for a task looked up by name; the task must be
    /// bootstrapped first.
    pub async fn dispatch_by_name<P: serde::Serialize>(&self, name: &str, payload: &P) -> Result<()> {
        let task = self.registered(name)?;
        self.dispatch(task.as_ref(), payload).await
    }

    /// [`Queue::delay`] for a task looked up by name.
    pub async fn delay_by_name<P: serde::Serialize>(
        &self,
        name: &str,
        payload: &P,
        delay: Duration,
    ) -> Result<()> {
        let task = self.registered(name)?;
        self.delay(task.as_ref(), payload, delay).await
    }

    /// [`Queue::delay_at`] for a task looked up by name.
    pub async fn delay_at_by_name<P: serde::Serialize>(
        &self,
        name: &str,
        payload: &P,
        at: OffsetDateTime,
    ) -> Result<()> {
        let task = self.registered(name)?;
        self.delay_at(task.as_ref(), payload, at).await
    }

    /// Current backlog for the task's queue: available envelopes plus
    /// expired reservations. Zero for unregistered tasks.
    pub async fn size(&self, task: &dyn Task) -> i64 {
        if self.manager.get_task(task.name()).is_none() {
            return 0;
        }
        match self.driver.size(task.name()).await {
            Ok(size) => size,
            Err(err) => {
                log::warn!("queue {} size failed: {err}", task.name());
                0
            }
        }
    }

    /// Restrict consumption to the given task names. When combined with
    /// the exclude list, the allow list is intersected first.
    pub fn set_allow_tasks(&self, names: &[String]) {
        self.manager.set_allow_tasks(names);
    }

    /// Forbid consumption of the given task names.
    pub fn set_exclude_tasks(&self, names: &[String]) {
        self.manager.set_exclude_tasks(names);
    }

    // endregion

    // region worker management

    /// Snapshot of memory, worker and backlog figures. Collecting memory
    /// statistics touches the whole process, so avoid calling frequently.
    pub async fn get_statistics(&self) -> Statistics {
        self.manager.get_statistics().await
    }

    /// Manual tick of the autoscale decision; only meaningful on a
    /// consumer process (one that called [`Queue::start`]).
    pub async fn auto_scale_workers(&self) -> Result<()> {
        self.manager.auto_scale_workers().await
    }

    // endregion

    fn registered(&self, name: &str) -> Result<Arc<dyn Task>> {
        self.manager
            .get_task(name)
            .ok_or_else(|| QueueError::TaskNotBootstrapped(name.to_string()))
    }

    /// Build and encode the envelope for one dispatch; task metadata is
    /// captured now, so later registration changes do not affect it.
    fn marshal_payload<P: serde::Serialize>(&self, task: &dyn Task, user_payload: &P) -> Result<Vec<u8>> {
        if self.manager.is_closed() {
            return Err(QueueError::QueueClosed);
        }

        let bytes = serde_json::to_vec(user_payload)
            .map_err(|e| QueueError::Codec(format!("queue {} job param marshal failed: {e}", task.name())))?;

        payload::encode(&Payload::new(
            task.name(),
            task.max_tries(),
            task.retry_interval(),
            task.timeout().as_secs() as i64,
            bytes,
        ))
    }
}

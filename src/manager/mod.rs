mod autoscale;
mod runner;

use crate::driver::{Job, QueueDriver};
use crate::{Config, FailedJobHandler, QueueError, Result, Task};
use dashmap::DashMap;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Jitter-table key for the looper that polls every queue.
const GENERAL: &str = "general";
/// Looper sleep starts here and never exceeds one second.
const JITTER_BASE: Duration = Duration::from_millis(450);
/// Graceful-shutdown poll interval ceiling.
const SHUTDOWN_POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

struct WorkerHandle {
    busy: Arc<AtomicBool>,
    stop: CancellationToken,
}

/// Queue scheduler: owns the task registry, the looper/worker topology,
/// and the shutdown machinery. Everything mutable sits behind one mutex
/// with short critical sections; the in-flight map is concurrent so
/// workers never contend on the main lock while checking it.
pub(crate) struct Manager {
    pub(crate) driver: Arc<dyn QueueDriver>,
    pub(crate) config: Config,
    tasks: Mutex<HashMap<String, Arc<dyn Task>>>,
    failed_job_handler: Mutex<Option<FailedJobHandler>>,

    /// Producer half of the looper→worker hand-off. Taken (and thereby
    /// closed) exactly once by the last looper to exit.
    job_tx: Mutex<Option<mpsc::Sender<Arc<dyn Job>>>>,
    job_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<dyn Job>>>,
    /// Jobs sent but not yet picked up by a worker; shutdown waits for
    /// this to drain so no execution starts after it returns.
    pending_handoff: AtomicI64,

    done: CancellationToken,
    started: AtomicBool,
    in_shutdown: AtomicBool,
    /// Set once graceful shutdown has fully completed.
    closed: AtomicBool,
    is_channel_closed: AtomicBool,
    active_loopers: AtomicI64,

    /// Job ID → worker ID for jobs currently executing in this process.
    in_working: DashMap<String, i64>,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
    next_worker_id: AtomicI64,

    jitter: Mutex<HashMap<String, Duration>>,
    allow_tasks: Mutex<HashSet<String>>,
    exclude_tasks: Mutex<HashSet<String>>,
    real_tasks_num: AtomicI64,
}

impl Manager {
    pub(crate) fn new(driver: Arc<dyn QueueDriver>, config: Config) -> Arc<Self> {
        // Capacity 1 keeps the hand-off close to a rendezvous: loopers
        // are paced by worker availability.
        let (job_tx, job_rx) = mpsc::channel(1);

        Arc::new(Self {
            driver,
            config,
            tasks: Mutex::new(HashMap::new()),
            failed_job_handler: Mutex::new(None),
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: tokio::sync::Mutex::new(job_rx),
            pending_handoff: AtomicI64::new(0),
            done: CancellationToken::new(),
            started: AtomicBool::new(false),
            in_shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            is_channel_closed: AtomicBool::new(false),
            active_loopers: AtomicI64::new(0),
            in_working: DashMap::new(),
            workers: Mutex::new(HashMap::new()),
            next_worker_id: AtomicI64::new(0),
            jitter: Mutex::new(HashMap::new()),
            allow_tasks: Mutex::new(HashSet::new()),
            exclude_tasks: Mutex::new(HashSet::new()),
            real_tasks_num: AtomicI64::new(0),
        })
    }

    // region registry

    pub(crate) fn bootstrap_one(&self, task: Arc<dyn Task>) -> Result<()> {
        let name = task.name().to_string();
        debug!(
            "bootstrap task {name}: max_tries={} retry_interval={}s timeout={:?}",
            task.max_tries(),
            task.retry_interval(),
            task.timeout()
        );

        let mut tasks = self.tasks.lock().expect("manager lock poisoned");
        if tasks.insert(name.clone(), task).is_some() {
            warn!("task {name} bootstrapped twice, previous definition replaced");
        }
        Ok(())
    }

    pub(crate) fn bootstrap(&self, tasks: Vec<Arc<dyn Task>>) -> Result<()> {
        for task in tasks {
            self.bootstrap_one(task)?;
        }
        Ok(())
    }

    pub(crate) fn get_task(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks
            .lock()
            .expect("manager lock poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn task_names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .expect("manager lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn set_failed_job_handler(&self, handler: FailedJobHandler) {
        *self
            .failed_job_handler
            .lock()
            .expect("manager lock poisoned") = Some(handler);
    }

    pub(crate) fn record_failed_job(&self, payload: &crate::Payload, err: &QueueError) {
        let handler = self
            .failed_job_handler
            .lock()
            .expect("manager lock poisoned");
        if let Some(handler) = handler.as_ref()
            && let Err(handler_err) = handler(payload, err)
        {
            warn!("failed job handler returned error: {handler_err}");
        }
    }

    // endregion

    // region allow / exclude filter

    pub(crate) fn set_allow_tasks(&self, names: &[String]) {
        let mut allow = self.allow_tasks.lock().expect("manager lock poisoned");
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            info!("queue set-allow-task {name}");
            allow.insert(name.to_string());
        }
    }

    pub(crate) fn set_exclude_tasks(&self, names: &[String]) {
        let mut exclude = self.exclude_tasks.lock().expect("manager lock poisoned");
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            info!("queue set-exclude-task {name}");
            exclude.insert(name.to_string());
        }
    }

    /// Allow-list intersected first, then the exclude-list subtracted.
    pub(crate) fn allow_run(&self, name: &str) -> bool {
        {
            let allow = self.allow_tasks.lock().expect("manager lock poisoned");
            if !allow.is_empty() && !allow.contains(name) {
                return false;
            }
        }
        let exclude = self.exclude_tasks.lock().expect("manager lock poisoned");
        !(!exclude.is_empty() && exclude.contains(name))
    }

    // endregion

    // region lifecycle

    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutting_down() {
            return Err(QueueError::QueueClosed);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Already consuming.
            return Ok(());
        }

        let job_tx = self
            .job_tx
            .lock()
            .expect("manager lock poisoned")
            .clone()
            .ok_or(QueueError::QueueClosed)?;

        // General looper polls every queue in turn.
        self.active_loopers.fetch_add(1, Ordering::SeqCst);
        let general = Arc::clone(self);
        let general_tx = job_tx.clone();
        tokio::spawn(async move { general.general_looper(general_tx).await });

        // One dedicated looper per allowed task, so a noisy queue cannot
        // starve lookups on the others.
        let names = self.task_names();
        for name in &names {
            if !self.allow_run(name) {
                continue;
            }
            self.active_loopers.fetch_add(1, Ordering::SeqCst);
            let looper = Arc::clone(self);
            let looper_tx = job_tx.clone();
            let looper_name = name.clone();
            tokio::spawn(async move { looper.dedicated_looper(looper_name, looper_tx).await });
        }
        drop(job_tx);

        // One worker per allowed task plus one serving the general looper.
        {
            let mut workers = self.workers.lock().expect("manager lock poisoned");
            self.start_worker_locked(&mut workers);
            for name in &names {
                if !self.allow_run(name) {
                    continue;
                }
                self.real_tasks_num.fetch_add(1, Ordering::SeqCst);
                self.start_worker_locked(&mut workers);
            }
        }

        if self.config.auto_scale {
            let monitor = Arc::clone(self);
            tokio::spawn(async move { monitor.auto_scale_monitor().await });
        }

        Ok(())
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn real_tasks_num(&self) -> i64 {
        self.real_tasks_num.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop the loopers, then poll at an exponentially
    /// growing interval until the hand-off channel is closed and drained
    /// and every worker is idle, or the deadline passes.
    pub(crate) async fn shut_down(&self, timeout: Duration) -> Result<()> {
        self.in_shutdown.store(true, Ordering::SeqCst);
        self.done.cancel();

        info!("try graceful shutdown queue, please wait seconds");

        let deadline = Instant::now() + timeout;
        let mut poll_interval_base = Duration::from_millis(1);

        loop {
            if self.is_looper_and_workers_down() {
                self.closed.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(QueueError::Timeout(timeout));
            }

            // 10% jitter on top of the doubling base, clamped at 500 ms.
            let jitter = rand::thread_rng().gen_range(0..=poll_interval_base.as_micros() / 10);
            let interval = poll_interval_base + Duration::from_micros(jitter as u64);
            poll_interval_base = (poll_interval_base * 2).min(SHUTDOWN_POLL_INTERVAL_MAX);

            tokio::time::sleep_until(deadline.min(Instant::now() + interval)).await;
        }
    }

    fn is_looper_and_workers_down(&self) -> bool {
        if !self.is_channel_closed.load(Ordering::SeqCst) {
            return false;
        }
        if self.pending_handoff.load(Ordering::SeqCst) != 0 {
            return false;
        }
        let workers = self.workers.lock().expect("manager lock poisoned");
        workers.values().all(|w| !w.busy.load(Ordering::SeqCst))
    }

    /// Loopers race to close the hand-off channel; only the last one out
    /// actually drops the sender, guarded by the compare-and-set below.
    fn looper_exited(&self) {
        if self.active_loopers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close_channel();
        }
    }

    fn close_channel(&self) {
        if self
            .is_channel_closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // Dropping the last sender closes the channel; workers observe
        // the closure as their stop condition.
        self.job_tx.lock().expect("manager lock poisoned").take();
    }

    // endregion

    // region loopers

    async fn general_looper(self: Arc<Self>, job_tx: mpsc::Sender<Arc<dyn Job>>) {
        loop {
            if self.done.is_cancelled() {
                info!("shutdown, queue general looper exited");
                break;
            }

            let mut dispatched = false;
            for name in self.task_names() {
                if !self.allow_run(&name) {
                    continue;
                }
                if self.done.is_cancelled() {
                    break;
                }
                if self.pop_and_hand_off(&name, &job_tx).await {
                    dispatched = true;
                }
            }

            if !dispatched {
                debug!("no job pop, sleep for a while: general looper");
                self.looper_sleep(GENERAL).await;
            }
        }
        self.looper_exited();
    }

    async fn dedicated_looper(self: Arc<Self>, name: String, job_tx: mpsc::Sender<Arc<dyn Job>>) {
        loop {
            if self.done.is_cancelled() {
                info!("shutdown, queue dedicated looper exited: {name}");
                break;
            }

            if !self.pop_and_hand_off(&name, &job_tx).await {
                debug!("no job pop, sleep for a while: {name} looper");
                self.looper_sleep(&name).await;
            }
        }
        self.looper_exited();
    }

    /// Pop one job from `name` and block it into the hand-off channel.
    /// Returns whether a job was dispatched.
    async fn pop_and_hand_off(&self, name: &str, job_tx: &mpsc::Sender<Arc<dyn Job>>) -> bool {
        match self.driver.pop(name).await {
            Ok(Some(job)) => {
                self.pending_handoff.fetch_add(1, Ordering::SeqCst);
                if job_tx.send(job).await.is_err() {
                    // Receiver gone; the manager itself is being dropped.
                    self.pending_handoff.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("queue {name} pop failed: {err}");
                false
            }
        }
    }

    async fn looper_sleep(&self, name: &str) {
        let interval = self.looper_jitter(name);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.done.cancelled() => {}
        }
    }

    /// Per-looper sleep interval: grows by a random fraction of the base
    /// on each consecutive empty pass, snapping back once above 1 s.
    fn looper_jitter(&self, name: &str) -> Duration {
        let mut jitter = self.jitter.lock().expect("manager lock poisoned");
        let entry = jitter.entry(name.to_string()).or_insert(JITTER_BASE);

        *entry += Duration::from_millis(rand::thread_rng().gen_range(0..(JITTER_BASE.as_millis() / 3) as u64));
        if *entry > Duration::from_secs(1) {
            *entry = JITTER_BASE;
        }
        *entry
    }

    // endregion

    // region workers

    /// Spawn one worker. Callers hold the worker-map lock.
    fn start_worker_locked(self: &Arc<Self>, workers: &mut HashMap<i64, WorkerHandle>) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let busy = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        workers.insert(
            worker_id,
            WorkerHandle {
                busy: Arc::clone(&busy),
                stop: stop.clone(),
            },
        );

        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.worker_loop(worker_id, busy, stop).await });
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: i64,
        busy: Arc<AtomicBool>,
        stop: CancellationToken,
    ) {
        info!("queue worker-{worker_id} started");

        loop {
            let job = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                job = async { self.job_rx.lock().await.recv().await } => job,
            };

            match job {
                Some(job) => self.run_job(job, worker_id, &busy).await,
                // Channel closed by the last looper: stop consuming.
                None => break,
            }
        }

        let mut workers = self.workers.lock().expect("manager lock poisoned");
        workers.remove(&worker_id);
        drop(workers);

        info!("queue worker-{worker_id} exited");
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.lock().expect("manager lock poisoned").len()
    }

    pub(crate) fn increase_workers(self: &Arc<Self>, num: usize) -> Result<()> {
        if self.shutting_down() {
            return Err(QueueError::QueueClosed);
        }

        let mut workers = self.workers.lock().expect("manager lock poisoned");
        for _ in 0..num {
            info!(
                "start.worker {}",
                self.next_worker_id.load(Ordering::SeqCst)
            );
            self.start_worker_locked(&mut workers);
        }
        Ok(())
    }

    /// Stop the `num` highest-numbered workers. They finish their current
    /// job before exiting; worker IDs are never reused.
    pub(crate) fn decrease_workers(&self, num: usize) -> Result<()> {
        if self.shutting_down() {
            return Err(QueueError::QueueClosed);
        }

        let workers = self.workers.lock().expect("manager lock poisoned");
        if workers.len() <= num {
            return Err(QueueError::Config(format!(
                "exist worker num {} less than stop worker num {num}",
                workers.len()
            )));
        }

        let mut ids: Vec<i64> = workers.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for worker_id in ids.into_iter().take(num) {
            if let Some(handle) = workers.get(&worker_id) {
                handle.stop.cancel();
                info!("stop.worker {worker_id}");
            }
        }
        Ok(())
    }

    // endregion

    pub(crate) fn in_working(&self) -> &DashMap<String, i64> {
        &self.in_working
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::{RawBody, Result};
    use async_trait::async_trait;

    struct NoopTask {
        name: &'static str,
        max_tries: i64,
    }

    #[async_trait]
    impl Task for NoopTask {
        fn name(&self) -> &str {
            self.name
        }

        fn max_tries(&self) -> i64 {
            self.max_tries
        }

        async fn execute(&self, _ctx: CancellationToken, _body: RawBody) -> Result<()> {
            Ok(())
        }
    }

    fn manager() -> Arc<Manager> {
        Manager::new(Arc::new(MemoryDriver::new()), Config::default())
    }

    #[test]
    fn allow_list_intersects_before_exclude_subtracts() {
        let manager = manager();
        manager.set_allow_tasks(&["a".to_string(), "b".to_string()]);
        manager.set_exclude_tasks(&["b".to_string(), " ".to_string()]);

        assert!(manager.allow_run("a"));
        assert!(!manager.allow_run("b"));
        assert!(!manager.allow_run("c"));
    }

    #[test]
    fn empty_filters_allow_everything() {
        let manager = manager();
        assert!(manager.allow_run("anything"));
    }

    #[test]
    fn looper_jitter_stays_between_base_and_one_second() {
        let manager = manager();
        for _ in 0..50 {
            let interval = manager.looper_jitter("q");
            assert!(interval >= JITTER_BASE, "below base: {interval:?}");
            assert!(interval <= Duration::from_secs(1), "above clamp: {interval:?}");
        }
    }

    #[test]
    fn duplicate_bootstrap_replaces_previous_task() {
        let manager = manager();
        manager
            .bootstrap_one(Arc::new(NoopTask { name: "dup", max_tries: 1 }))
            .unwrap();
        manager
            .bootstrap_one(Arc::new(NoopTask { name: "dup", max_tries: 7 }))
            .unwrap();

        let task = manager.get_task("dup").expect("registered");
        assert_eq!(task.max_tries(), 7);
        assert_eq!(manager.task_names().len(), 1);
    }
}

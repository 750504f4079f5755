use super::Manager;
use crate::{JobStatistics, MemoryStatistics, QueueError, Result, Statistics, WorkerStatistics};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use sysinfo::System;
use time::OffsetDateTime;

/// System memory used-percent above which scale-up is refused.
const MEMORY_MAX_PERCENT_THRESHOLD: f64 = 90.0;

impl Manager {
    pub(super) async fn auto_scale_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.auto_scale_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("start.autoScale.monitor");
                    if let Err(err) = self.auto_scale_workers().await {
                        warn!("autoScaleWorkers failed: {err}");
                    }
                }
                _ = self.done.cancelled() => return,
            }
        }
    }

    /// One autoscale decision: shrink to the floor when the backlog is
    /// smaller than the pool, grow within the concurrency and memory
    /// budgets when it crosses the threshold. No-op during shutdown.
    pub(crate) async fn auto_scale_workers(self: &Arc<Self>) -> Result<()> {
        let real_tasks = self.real_tasks_num();
        if real_tasks <= 0 {
            return Err(QueueError::Config(
                "queue manager has no workers, maybe this instance is not a consumer process"
                    .to_string(),
            ));
        }

        let memory = self.memory_statistics();
        let jobs = self.job_statistics().await;
        let worker_count = self.worker_count() as i64;

        let max_workers = self.config.max_concurrency * real_tasks + 1;
        let min_workers = real_tasks + 1;
        // Rough price of one more worker, measured by what this process
        // already pays per task.
        let one_worker_memory = (memory.process_memory / real_tasks as u64).max(1);

        let mut decrease_number = 0;
        if jobs.total_jobs < worker_count && worker_count > min_workers {
            decrease_number = worker_count - min_workers;
        }

        let mut increase_number = 0;
        if jobs.total_jobs >= self.config.auto_scale_job_threshold && worker_count < max_workers {
            increase_number = real_tasks.min(max_workers - worker_count);
            increase_number =
                increase_number.min((memory.sys_memory_available / one_worker_memory) as i64);
        }

        if memory.sys_memory_available < one_worker_memory
            || memory.sys_memory_used_percent >= MEMORY_MAX_PERCENT_THRESHOLD
        {
            warn!("autoScaleWorkers.stop: memory usage is too big");
            increase_number = 0;
        }

        if decrease_number > 0 {
            return self.decrease_workers(decrease_number as usize);
        }
        if increase_number > 0 {
            return self.increase_workers(increase_number as usize);
        }
        Ok(())
    }

    pub(crate) fn memory_statistics(&self) -> MemoryStatistics {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory().max(1);
        let used = sys.used_memory();
        let available = sys.available_memory();

        let process_memory = match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_process(pid);
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(err) => {
                warn!("get current process info occur error: {err}");
                0
            }
        };

        MemoryStatistics {
            sys_memory_total: total,
            sys_memory_used: used,
            sys_memory_available: available,
            sys_memory_used_percent: used as f64 / total as f64 * 100.0,
            process_memory,
            process_memory_percent: process_memory as f64 / total as f64 * 100.0,
        }
    }

    pub(crate) fn worker_statistics(&self) -> WorkerStatistics {
        let workers = self.workers.lock().expect("manager lock poisoned");

        let mut active_workers = 0;
        let mut worker_state = HashMap::new();
        for (worker_id, handle) in workers.iter() {
            let busy = handle.busy.load(Ordering::SeqCst);
            if busy {
                active_workers += 1;
            }
            worker_state.insert(*worker_id, busy);
        }

        WorkerStatistics {
            active_workers,
            total_workers: workers.len() as i64,
            worker_state,
        }
    }

    pub(crate) async fn job_statistics(&self) -> JobStatistics {
        let mut total_jobs = 0;
        let mut jobs_statistics = HashMap::new();

        for name in self.task_names() {
            if !self.allow_run(&name) {
                continue;
            }
            let size = match self.driver.size(&name).await {
                Ok(size) => size,
                Err(err) => {
                    warn!("queue {name} size failed: {err}");
                    0
                }
            };
            jobs_statistics.insert(name, size);
            total_jobs += size;
        }

        JobStatistics {
            total_jobs,
            jobs_statistics,
        }
    }

    pub(crate) async fn get_statistics(&self) -> Statistics {
        if self.real_tasks_num() <= 0 {
            warn!("queue manager has no workers, maybe this instance is not a consumer process");
        }

        Statistics {
            statistics_time: OffsetDateTime::now_utc().unix_timestamp(),
            memory: self.memory_statistics(),
            workers: self.worker_statistics(),
            jobs: self.job_statistics().await,
        }
    }
}

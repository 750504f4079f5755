use serde::Serialize;
use std::collections::HashMap;

/// Point-in-time snapshot returned by `Queue::get_statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub statistics_time: i64,
    pub memory: MemoryStatistics,
    pub workers: WorkerStatistics,
    pub jobs: JobStatistics,
}

/// System and process memory figures, all in bytes.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatistics {
    pub sys_memory_total: u64,
    pub sys_memory_used: u64,
    pub sys_memory_available: u64,
    pub sys_memory_used_percent: f64,
    pub process_memory: u64,
    pub process_memory_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatistics {
    pub active_workers: i64,
    pub total_workers: i64,
    /// Busy flag per worker ID.
    pub worker_state: HashMap<i64, bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub total_jobs: i64,
    /// Backlog per queue name, allowed tasks only.
    pub jobs_statistics: HashMap<String, i64>,
}

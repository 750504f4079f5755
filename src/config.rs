use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: i64 = 10;
pub const DEFAULT_AUTO_SCALE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_AUTO_SCALE_JOB_THRESHOLD: i64 = 100;

/// Queue runtime configuration. Zero or negative numeric fields fall back
/// to the defaults above when the queue is constructed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-task worker ceiling used by the autoscaler.
    pub max_concurrency: i64,
    /// Enables the periodic autoscale monitor.
    pub auto_scale: bool,
    /// Tick interval of the autoscale monitor.
    pub auto_scale_interval: Duration,
    /// Backlog size at which the pool scales up.
    pub auto_scale_job_threshold: i64,
    /// Table name prefix, honored by the MySQL driver only.
    pub table_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            auto_scale: false,
            auto_scale_interval: DEFAULT_AUTO_SCALE_INTERVAL,
            auto_scale_job_threshold: DEFAULT_AUTO_SCALE_JOB_THRESHOLD,
            table_prefix: String::new(),
        }
    }
}

impl Config {
    /// Apply defaults to unset or out-of-range fields.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_concurrency <= 0 {
            self.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        if self.auto_scale_job_threshold <= 0 {
            self.auto_scale_job_threshold = DEFAULT_AUTO_SCALE_JOB_THRESHOLD;
        }
        if self.auto_scale_interval.is_zero() {
            self.auto_scale_interval = DEFAULT_AUTO_SCALE_INTERVAL;
        }
        self
    }
}

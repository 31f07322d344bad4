use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    pub max_concurrency: usize,
    pub priority: i32,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            priority: 0,
        }
    }
}

/// Step the pool manager multiplies a kind's allowed concurrency by while
/// a dependent breaker is open.
pub const CASCADE_REDUCTION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Idle,
    Timeout,
    ExcessiveFailures,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub max_wait_time: Duration,
    pub max_failure_rate: f64,
    pub required_idle_checks: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(500),
            max_wait_time: Duration::from_secs(10 * 60),
            max_failure_rate: 0.5,
            required_idle_checks: 3,
        }
    }
}

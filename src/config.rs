use std::time::Duration;

/// Tunables for the schedule control plane.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Budget for a single catalog lookup.
    pub max_query_time: Duration,
    /// Budget for dialling one worker endpoint.
    pub dial_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_query_time: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(2),
        }
    }
}

// Store key layout
//
// {prefix}:{queue}:jobs             hash  job id -> job JSON (live and archived)
// {prefix}:{queue}:completed        list  archived completed job ids, oldest first
// {prefix}:{queue}:failed           list  archived failed job ids, oldest first
// {prefix}:{queue}:completed_total  counter
// {prefix}:{queue}:failed_total     counter
// {prefix}:{queue}:dead_lettered    counter

#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    pub jobs: String,
    pub completed: String,
    pub failed: String,
    pub completed_total: String,
    pub failed_total: String,
    pub dead_lettered: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{}:{}", prefix, queue);
        Self {
            jobs: format!("{}:jobs", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            completed_total: format!("{}:completed_total", base),
            failed_total: format!("{}:failed_total", base),
            dead_lettered: format!("{}:dead_lettered", base),
        }
    }
}

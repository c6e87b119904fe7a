// In-memory job index for one queue
//
// Waiting jobs are ordered by priority (descending) then eligibility sequence;
// delayed jobs by due time. Every live (waiting, delayed, active) job record is
// held in `jobs`; finished jobs leave the index and live only in the store.

use crate::domain::{Job, JobId, Priority};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Bookkeeping for a job currently held by a worker
pub(crate) struct ActiveSlot {
    /// Identifies this particular dispatch; a stale settle is ignored
    pub lease: u64,
    pub heartbeat: Arc<AtomicI64>,
    /// Consecutive sweeps that found the heartbeat stale
    pub stalled_count: u32,
    pub abort: Option<AbortHandle>,
    /// Outcome is being persisted; the stalled sweep leaves it alone
    pub settling: bool,
}

/// A job handed to a worker
pub(crate) struct Claim {
    pub job: Job,
    pub lease: u64,
    pub heartbeat: Arc<AtomicI64>,
}

/// Job evicted by the stalled sweep
pub(crate) struct StalledJob {
    pub job: Job,
    pub stalled_count: u32,
}

#[derive(Default)]
pub(crate) struct QueueIndex {
    jobs: HashMap<JobId, Job>,
    waiting: BTreeMap<(Reverse<Priority>, u64), JobId>,
    delayed: BTreeMap<(i64, u64), JobId>,
    active: HashMap<JobId, ActiveSlot>,
    next_seq: u64,
    next_lease: u64,
}

impl QueueIndex {
    /// Insert a waiting or delayed job
    pub fn insert(&mut self, job: Job, now_millis: i64) {
        let seq = self.bump_seq();
        match job.scheduled_at {
            Some(at) if at > now_millis => {
                self.delayed.insert((at, seq), job.id.clone());
            }
            _ => {
                self.waiting.insert((Reverse(job.priority), seq), job.id.clone());
            }
        }
        self.jobs.insert(job.id.clone(), job);
    }

    /// Move every due delayed job to waiting (fresh sequence, due-time order)
    pub fn promote_due(&mut self, now_millis: i64) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now_millis {
                break;
            }
            let id = entry.remove();
            let Some(priority) = self.jobs.get(&id).map(|j| j.priority) else {
                continue;
            };
            let seq = self.bump_seq();
            self.waiting.insert((Reverse(priority), seq), id);
            promoted += 1;
        }
        promoted
    }

    /// Earliest due time among delayed jobs
    pub fn next_due(&self) -> Option<i64> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }

    /// Pop the highest-priority waiting job and mark it active
    pub fn claim_next(&mut self, now_millis: i64) -> Option<Claim> {
        self.promote_due(now_millis);
        loop {
            let (_, id) = self.waiting.pop_first()?;
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.start(now_millis).is_err() {
                // Not startable (exhausted or already active). Only a record no
                // worker holds leaves the index with it.
                if !self.active.contains_key(&id) {
                    self.jobs.remove(&id);
                }
                continue;
            }

            self.next_lease += 1;
            let lease = self.next_lease;
            let heartbeat = Arc::new(AtomicI64::new(now_millis));
            self.active.insert(
                id.clone(),
                ActiveSlot {
                    lease,
                    heartbeat: Arc::clone(&heartbeat),
                    stalled_count: 0,
                    abort: None,
                    settling: false,
                },
            );
            return Some(Claim {
                job: job.clone(),
                lease,
                heartbeat,
            });
        }
    }

    pub fn set_abort(&mut self, job_id: &str, lease: u64, handle: AbortHandle) {
        if let Some(slot) = self.active.get_mut(job_id).filter(|s| s.lease == lease) {
            slot.abort = Some(handle);
        }
    }

    /// Freeze an active job for settlement and return a copy of it.
    /// `None` if the lease is no longer current.
    pub fn begin_settle(&mut self, job_id: &str, lease: u64) -> Option<Job> {
        let slot = self.active.get_mut(job_id).filter(|s| s.lease == lease)?;
        slot.settling = true;
        self.jobs.get(job_id).cloned()
    }

    /// Release an active job. `None` if the lease is no longer current.
    pub fn release(&mut self, job_id: &str, lease: u64) -> Option<Job> {
        match self.active.get(job_id) {
            Some(slot) if slot.lease == lease => {
                self.active.remove(job_id);
                self.jobs.remove(job_id)
            }
            _ => None,
        }
    }

    /// Stalled sweep: bump counters of stale jobs and evict those beyond `max_stalled`
    pub fn sweep_stalled(
        &mut self,
        now_millis: i64,
        stalled_interval_ms: i64,
        max_stalled: u32,
    ) -> (Vec<(JobId, u32)>, Vec<StalledJob>) {
        let mut stale = Vec::new();
        let mut evict = Vec::new();

        for (id, slot) in self.active.iter_mut().filter(|(_, s)| !s.settling) {
            let last = slot.heartbeat.load(Ordering::SeqCst);
            if now_millis - last >= stalled_interval_ms {
                slot.stalled_count += 1;
                stale.push((id.clone(), slot.stalled_count));
                if slot.stalled_count > max_stalled {
                    evict.push(id.clone());
                }
            } else {
                slot.stalled_count = 0;
            }
        }

        let mut evicted = Vec::with_capacity(evict.len());
        for id in evict {
            let Some(slot) = self.active.remove(&id) else {
                continue;
            };
            if let Some(handle) = &slot.abort {
                handle.abort();
            }
            if let Some(job) = self.jobs.remove(&id) {
                evicted.push(StalledJob {
                    job,
                    stalled_count: slot.stalled_count,
                });
            }
        }
        (stale, evicted)
    }

    /// Abort every running processor task (engine shutdown). Jobs stay active
    /// in the store and are requeued on the next start.
    pub fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        for handle in self.active.values().filter_map(|s| s.abort.as_ref()) {
            handle.abort();
            aborted += 1;
        }
        aborted
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Release spare capacity held by the maps
    pub fn shrink_to_fit(&mut self) {
        self.jobs.shrink_to_fit();
        self.active.shrink_to_fit();
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobName, JobPayload};
    use serde_json::json;

    fn job(id: &str, priority: Priority) -> Job {
        let mut job = Job::new(id, 0, "q", JobName::new("t"), JobPayload::new(json!({})));
        job.priority = priority;
        job
    }

    fn drain_order(index: &mut QueueIndex, now: i64) -> Vec<String> {
        let mut order = Vec::new();
        while let Some(claim) = index.claim_next(now) {
            order.push(claim.job.id.clone());
            index.release(&claim.job.id, claim.lease);
        }
        order
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut index = QueueIndex::default();
        index.insert(job("n1", Priority::NORMAL), 0);
        index.insert(job("h1", Priority::HIGH), 0);
        index.insert(job("n2", Priority::NORMAL), 0);
        index.insert(job("c1", Priority::CRITICAL), 0);

        assert_eq!(drain_order(&mut index, 0), vec!["c1", "h1", "n1", "n2"]);
    }

    #[test]
    fn test_unstartable_job_leaves_the_index() {
        let mut index = QueueIndex::default();
        let mut exhausted = job("spent", Priority::HIGH);
        exhausted.max_attempts = 1;
        exhausted.attempts_made = 1;
        index.insert(exhausted, 0);
        index.insert(job("n1", Priority::NORMAL), 0);

        let claim = index.claim_next(0).unwrap();
        assert_eq!(claim.job.id, "n1");
        assert!(!index.contains("spent"));
        assert!(index.get("spent").is_none());
        assert_eq!(index.waiting_len(), 0);
        assert_eq!(index.active_len(), 1);
    }

    #[test]
    fn test_promoted_delayed_job_queues_behind_waiting_peers() {
        let mut index = QueueIndex::default();
        let mut delayed = job("d1", Priority::NORMAL);
        delayed.scheduled_at = Some(100);
        index.insert(delayed, 0);
        index.insert(job("w1", Priority::NORMAL), 50);

        assert_eq!(index.delayed_len(), 1);
        assert_eq!(index.next_due(), Some(100));
        assert_eq!(drain_order(&mut index, 150), vec!["w1", "d1"]);
    }

    #[test]
    fn test_delayed_job_not_claimed_early() {
        let mut index = QueueIndex::default();
        let mut delayed = job("d1", Priority::HIGH);
        delayed.scheduled_at = Some(1_000);
        index.insert(delayed, 0);

        assert!(index.claim_next(999).is_none());
        assert!(index.claim_next(1_000).is_some());
    }

    #[test]
    fn test_stale_lease_is_ignored() {
        let mut index = QueueIndex::default();
        index.insert(job("a", Priority::NORMAL), 0);
        let claim = index.claim_next(0).unwrap();

        assert!(index.release("a", claim.lease + 1).is_none());
        assert_eq!(index.active_len(), 1);
        assert!(index.release("a", claim.lease).is_some());
        assert_eq!(index.active_len(), 0);
        assert!(!index.contains("a"));
    }

    #[test]
    fn test_settling_job_is_not_swept() {
        let mut index = QueueIndex::default();
        index.insert(job("a", Priority::NORMAL), 0);
        let claim = index.claim_next(0).unwrap();
        assert!(index.begin_settle("a", claim.lease).is_some());

        let (stale, evicted) = index.sweep_stalled(10_000, 1_000, 0);
        assert!(stale.is_empty());
        assert!(evicted.is_empty());
        assert_eq!(index.active_len(), 1);
    }

    #[test]
    fn test_sweep_counts_consecutive_stale_checks() {
        let mut index = QueueIndex::default();
        index.insert(job("a", Priority::NORMAL), 0);
        let claim = index.claim_next(0).unwrap();

        let (stale, evicted) = index.sweep_stalled(1_000, 1_000, 1);
        assert_eq!(stale, vec![("a".to_string(), 1)]);
        assert!(evicted.is_empty());

        // fresh heartbeat resets the counter
        claim.heartbeat.store(1_500, Ordering::SeqCst);
        let (stale, _) = index.sweep_stalled(2_000, 1_000, 1);
        assert!(stale.is_empty());

        let (_, evicted) = index.sweep_stalled(2_500, 1_000, 1);
        assert!(evicted.is_empty());
        let (_, evicted) = index.sweep_stalled(3_500, 1_000, 1);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].stalled_count, 2);
        assert_eq!(index.active_len(), 0);
    }
}

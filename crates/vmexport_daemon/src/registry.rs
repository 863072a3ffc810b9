//! In-memory job registry.
//!
//! A single coarse guard protects every read and write; no caller
//! ever observes a half-updated record. Reads that leave this module
//! return cloned snapshots, so holding one cannot race with worker
//! updates. Jobs are never removed; they stay queryable until the
//! process exits.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use vmexport_protocol::{ExportError, Job, JobCounts, JobStatus};

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, Job>,
    /// Insertion order, for stable listings.
    order: Vec<String>,
}

#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // A poisoned guard means a panic mid-update; the record is
        // still structurally valid, so keep serving.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new job. Ids are unique within a running daemon.
    pub fn insert(&self, job: Job) -> Result<(), ExportError> {
        let id = job.id().to_string();
        let mut inner = self.lock();
        if inner.jobs.contains_key(&id) {
            return Err(ExportError::DuplicateId(id));
        }
        inner.order.push(id.clone());
        inner.jobs.insert(id, job);
        Ok(())
    }

    /// Snapshot of one job.
    pub fn get(&self, id: &str) -> Result<Job, ExportError> {
        self.lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ExportError::NotFound(id.to_string()))
    }

    /// Snapshots in insertion order. An empty status set matches any
    /// status; `limit == 0` means unbounded.
    pub fn list(&self, statuses: &[JobStatus], limit: usize) -> Vec<Job> {
        let inner = self.lock();
        let mut jobs = Vec::new();
        for id in &inner.order {
            let Some(job) = inner.jobs.get(id) else {
                continue;
            };
            if !statuses.is_empty() && !statuses.contains(&job.status) {
                continue;
            }
            jobs.push(job.clone());
            if limit != 0 && jobs.len() >= limit {
                break;
            }
        }
        jobs
    }

    /// Snapshots for the given ids; unknown ids are skipped.
    pub fn get_many(&self, ids: &[String]) -> Vec<Job> {
        let inner = self.lock();
        ids.iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Run `mutator` on the live record under the guard.
    pub fn update<R>(
        &self,
        id: &str,
        mutator: impl FnOnce(&mut Job) -> R,
    ) -> Result<R, ExportError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| ExportError::NotFound(id.to_string()))?;
        Ok(mutator(job))
    }

    pub fn counts(&self) -> JobCounts {
        let inner = self.lock();
        let mut counts = JobCounts {
            total: inner.jobs.len(),
            ..JobCounts::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

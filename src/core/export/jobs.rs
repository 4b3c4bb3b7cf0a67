//! In-memory table of active export jobs.
//!
//! Each entry holds the job's cancel token and live progress. The worker
//! updates it on every chunk, so it is a plain `std` lock held only for the
//! duration of a field update; callers on the async side never wait on it
//! for long. Entries are removed by the worker before it emits its final
//! event.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use super::types::{JobId, JobState};

/// Snapshot of a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub state: JobState,
    pub total_items: usize,
    pub items_done: usize,
    pub current_item: Option<String>,
    pub bytes_transferred: u64,
}

struct JobEntry {
    cancel: CancellationToken,
    progress: JobProgress,
}

#[derive(Clone, Default)]
pub struct JobTable {
    inner: Arc<RwLock<HashMap<JobId, JobEntry>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job in the `Created` state and hand back its cancel token.
    pub fn insert(&self, job_id: &str, total_items: usize) -> CancellationToken {
        let cancel = CancellationToken::new();
        let entry = JobEntry {
            cancel: cancel.clone(),
            progress: JobProgress {
                state: JobState::Created,
                total_items,
                items_done: 0,
                current_item: None,
                bytes_transferred: 0,
            },
        };
        self.write().insert(job_id.to_string(), entry);
        cancel
    }

    pub fn set_running(&self, job_id: &str) {
        self.update(job_id, |p| p.state = JobState::Running);
    }

    pub fn start_item(&self, job_id: &str, name: &str) {
        self.update(job_id, |p| p.current_item = Some(name.to_string()));
    }

    pub fn add_bytes(&self, job_id: &str, bytes: u64) {
        self.update(job_id, |p| p.bytes_transferred += bytes);
    }

    pub fn finish_item(&self, job_id: &str) {
        self.update(job_id, |p| {
            p.items_done += 1;
            p.current_item = None;
        });
    }

    /// Request cancellation. Returns false for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.read().get(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let map = self.read();
        for entry in map.values() {
            entry.cancel.cancel();
        }
        map.len()
    }

    pub fn get(&self, job_id: &str) -> Option<JobProgress> {
        self.read().get(job_id).map(|e| e.progress.clone())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    pub fn remove(&self, job_id: &str) {
        self.write().remove(job_id);
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut JobProgress)) {
        if let Some(entry) = self.write().get_mut(job_id) {
            f(&mut entry.progress);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::error::JobError;
use crate::core::types::{JobId, SourceBackend};
use crate::observability::metrics as obs;

/// Packaging job lifecycle.
///
/// ```text
/// QUEUED → PROCESSING → PUBLISHING → READY
///    │          │            │
///    └──────────┴────────────┴──► FAILED | CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, waiting for a packaging slot.
    Queued,
    /// Renditions encoding into the staging tree.
    Processing,
    /// All renditions done; copying the package into the backend.
    Publishing,
    /// Published; the stream is visible in the catalog.
    Ready,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Processing,
        JobState::Publishing,
        JobState::Ready,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Publishing => "publishing",
            JobState::Ready => "ready",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Failed | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked packaging request.
#[derive(Debug, Clone, Serialize)]
pub struct JobEntry {
    pub job_id: JobId,
    pub stream_name: String,
    pub source: String,
    pub source_backend: SourceBackend,
    pub state: JobState,
    /// Rendition names in encoding priority order.
    pub renditions: Vec<String>,
    /// Completion order.
    pub completed_renditions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Finished jobs kept for inspection by default.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_MAX_RETAINED_JOBS: usize = 1000;

/// What currently holds a stream name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameClaim {
    Job(JobId),
    Deleting,
}

/// In-memory packaging job registry backed by `DashMap`.
///
/// Terminal entries stay for inspection until they are older than the
/// retention window or pushed out by the retained-job cap.
pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
    /// Stream name → the non-terminal job producing it, or a pending delete.
    active: DashMap<String, NameClaim>,
    /// Terminal jobs, oldest finish first.
    finished: Mutex<VecDeque<(DateTime<Utc>, JobId)>>,
    /// Per-state job counts, indexed by `JobState as usize`.
    counts: [AtomicUsize; JobState::ALL.len()],
    retention: Duration,
    max_retained: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION, DEFAULT_MAX_RETAINED_JOBS)
    }

    pub fn with_retention(retention: Duration, max_retained: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            active: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            counts: Default::default(),
            retention,
            max_retained,
        }
    }

    /// Register a new job in QUEUED state, unless another live job already
    /// targets `stream_name` or the stream is being deleted.
    pub fn try_create(
        &self,
        stream_name: &str,
        source: &str,
        source_backend: SourceBackend,
        renditions: Vec<String>,
    ) -> Option<JobEntry> {
        let now = Utc::now();
        self.prune_finished(now);

        let job_id = JobId::new();
        match self.active.entry(stream_name.to_string()) {
            Entry::Occupied(existing) => {
                debug!(stream = %stream_name, claim = ?existing.get(), "stream name is busy");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(NameClaim::Job(job_id));
            }
        }

        let entry = JobEntry {
            job_id,
            stream_name: stream_name.to_string(),
            source: source.to_string(),
            source_backend,
            state: JobState::Queued,
            renditions,
            completed_renditions: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            error_message: None,
        };
        self.jobs.insert(entry.job_id, entry.clone());
        self.shift_count(None, Some(JobState::Queued));

        info!(job_id = %entry.job_id, stream = %stream_name, %source, "packaging job queued");
        Some(entry)
    }

    /// Hold `stream_name` against new jobs while it is deleted. `None` when a
    /// live job or another delete already holds it.
    pub fn claim_for_delete(&self, stream_name: &str) -> Option<DeleteClaim<'_>> {
        match self.active.entry(stream_name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(NameClaim::Deleting);
                Some(DeleteClaim {
                    registry: self,
                    stream_name: stream_name.to_string(),
                })
            }
        }
    }

    /// Move a job to `new_state`, enforcing the lifecycle above.
    pub fn transition(&self, job_id: JobId, new_state: JobState) -> Result<JobEntry, JobError> {
        self.apply(job_id, new_state, None)
    }

    /// Move a job to FAILED, recording why.
    pub fn fail(&self, job_id: JobId, message: impl Into<String>) -> Result<JobEntry, JobError> {
        self.apply(job_id, JobState::Failed, Some(message.into()))
    }

    fn apply(
        &self,
        job_id: JobId,
        new_state: JobState,
        error_message: Option<String>,
    ) -> Result<JobEntry, JobError> {
        let mut entry_ref = self.jobs.get_mut(&job_id).ok_or(JobError::NotFound {
            job_id: job_id.to_string(),
        })?;

        let current = entry_ref.state;
        if !Self::is_valid_transition(current, new_state) {
            return Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current.to_string(),
                to: new_state.to_string(),
            });
        }

        let now = Utc::now();
        entry_ref.state = new_state;
        entry_ref.updated_at = now;
        if new_state.is_terminal() {
            entry_ref.finished_at = Some(now);
        }
        if error_message.is_some() {
            entry_ref.error_message = error_message;
        }
        let updated = entry_ref.clone();
        drop(entry_ref);

        self.shift_count(Some(current), Some(new_state));
        if new_state.is_terminal() {
            self.active.remove_if(&updated.stream_name, |_, claim| {
                *claim == NameClaim::Job(job_id)
            });
            self.lock_finished().push_back((now, job_id));
            self.prune_finished(now);
        }

        match new_state {
            JobState::Failed => warn!(
                %job_id,
                from = %current,
                error = updated.error_message.as_deref().unwrap_or(""),
                "packaging job failed"
            ),
            _ => info!(%job_id, from = %current, to = %new_state, "job state transition"),
        }
        Ok(updated)
    }

    /// Record one finished rendition.
    pub fn record_rendition(&self, job_id: JobId, rendition: &str) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.completed_renditions.push(rendition.to_string());
            entry.updated_at = Utc::now();
            debug!(%job_id, %rendition, "rendition progress updated");
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<JobEntry> {
        self.jobs.get(&job_id).map(|r| r.clone())
    }

    /// All retained jobs, oldest first, optionally filtered by state.
    pub fn list(&self, filter_state: Option<JobState>) -> Vec<JobEntry> {
        let mut jobs: Vec<JobEntry> = self
            .jobs
            .iter()
            .filter(|r| filter_state.map(|s| r.value().state == s).unwrap_or(true))
            .map(|r| r.value().clone())
            .collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.to_string().cmp(&b.job_id.to_string()))
        });
        jobs
    }

    /// Whether a non-terminal job is already producing `stream_name`.
    pub fn is_active(&self, stream_name: &str) -> bool {
        matches!(
            self.active.get(stream_name).map(|claim| *claim),
            Some(NameClaim::Job(_))
        )
    }

    pub fn active_count(&self) -> usize {
        self.count(JobState::Queued) + self.count(JobState::Processing) + self.count(JobState::Publishing)
    }

    /// Retained jobs currently in `state`.
    pub fn count(&self, state: JobState) -> usize {
        self.counts[state as usize].load(Ordering::Relaxed)
    }

    /// Drop terminal jobs past the retention window, then the oldest ones
    /// beyond the retained-job cap.
    fn prune_finished(&self, now: DateTime<Utc>) {
        let expired: Vec<JobId> = {
            let mut finished = self.lock_finished();
            let mut expired = Vec::new();
            while let Some(&(finished_at, job_id)) = finished.front() {
                let too_old = now
                    .signed_duration_since(finished_at)
                    .to_std()
                    .map(|age| age >= self.retention)
                    .unwrap_or(false);
                if !too_old && finished.len() <= self.max_retained {
                    break;
                }
                finished.pop_front();
                expired.push(job_id);
            }
            expired
        };

        for job_id in &expired {
            if let Some((_, entry)) = self.jobs.remove(job_id) {
                self.shift_count(Some(entry.state), None);
            }
        }
        if !expired.is_empty() {
            debug!(pruned = expired.len(), retained = self.jobs.len(), "finished jobs pruned");
        }
    }

    fn lock_finished(&self) -> MutexGuard<'_, VecDeque<(DateTime<Utc>, JobId)>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shift_count(&self, from: Option<JobState>, to: Option<JobState>) {
        if let Some(state) = from {
            let previous = self.counts[state as usize]
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);
            obs::set_jobs_by_state(state.as_str(), previous.saturating_sub(1) as f64);
        }
        if let Some(state) = to {
            let previous = self.counts[state as usize].fetch_add(1, Ordering::Relaxed);
            obs::set_jobs_by_state(state.as_str(), (previous + 1) as f64);
        }
    }

    fn is_valid_transition(from: JobState, to: JobState) -> bool {
        if matches!(to, JobState::Failed | JobState::Cancelled) {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (JobState::Queued, JobState::Processing)
                | (JobState::Processing, JobState::Publishing)
                | (JobState::Publishing, JobState::Ready)
        )
    }
}

/// Keeps a stream name reserved for a delete; released on drop.
pub struct DeleteClaim<'a> {
    registry: &'a JobRegistry,
    stream_name: String,
}

impl Drop for DeleteClaim<'_> {
    fn drop(&mut self) {
        self.registry
            .active
            .remove_if(&self.stream_name, |_, claim| *claim == NameClaim::Deleting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_job() -> (JobRegistry, JobId) {
        let registry = JobRegistry::new();
        let entry = registry
            .try_create(
                "show_1",
                "show.mp4",
                SourceBackend::Local,
                vec!["720p".into(), "480p".into()],
            )
            .unwrap();
        (registry, entry.job_id)
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let (registry, id) = registry_with_job();
        assert_eq!(registry.get(id).unwrap().state, JobState::Queued);
        assert!(registry.is_active("show_1"));

        registry.transition(id, JobState::Processing).unwrap();
        registry.record_rendition(id, "480p");
        registry.record_rendition(id, "720p");
        registry.transition(id, JobState::Publishing).unwrap();
        let entry = registry.transition(id, JobState::Ready).unwrap();

        assert_eq!(entry.state, JobState::Ready);
        assert_eq!(entry.completed_renditions, vec!["480p", "720p"]);
        assert!(entry.finished_at.is_some());
        assert!(!registry.is_active("show_1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let (registry, id) = registry_with_job();
        let err = registry.transition(id, JobState::Ready).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));

        registry.transition(id, JobState::Processing).unwrap();
        assert!(registry.transition(id, JobState::Queued).is_err());
    }

    #[test]
    fn test_fail_from_any_live_state() {
        let (registry, id) = registry_with_job();
        registry.transition(id, JobState::Processing).unwrap();
        let entry = registry.fail(id, "720p: encoder exited with 1").unwrap();
        assert_eq!(entry.state, JobState::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("720p: encoder exited with 1"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let (registry, id) = registry_with_job();
        registry.transition(id, JobState::Cancelled).unwrap();
        assert!(registry.fail(id, "late").is_err());
        assert!(registry.transition(id, JobState::Processing).is_err());
    }

    #[test]
    fn test_one_live_job_per_stream_name() {
        let (registry, id) = registry_with_job();
        assert!(registry
            .try_create("show_1", "again.mp4", SourceBackend::Local, vec![])
            .is_none());

        registry.fail(id, "boom").unwrap();
        assert!(registry
            .try_create("show_1", "again.mp4", SourceBackend::Local, vec![])
            .is_some());
    }

    #[test]
    fn test_unknown_job() {
        let registry = JobRegistry::new();
        let err = registry.transition(JobId::new(), JobState::Processing).unwrap_err();
        assert!(matches!(err, JobError::NotFound { .. }));
    }

    #[test]
    fn test_list_filters_by_state() {
        let registry = JobRegistry::new();
        let a = registry
            .try_create("a", "a.mp4", SourceBackend::Local, vec![])
            .unwrap()
            .job_id;
        registry.try_create("b", "b.mp4", SourceBackend::Remote, vec![]).unwrap();
        registry.transition(a, JobState::Processing).unwrap();

        assert_eq!(registry.list(None).len(), 2);
        let queued = registry.list(Some(JobState::Queued));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].stream_name, "b");
    }

    #[test]
    fn test_retained_job_cap_drops_oldest_finished() {
        let registry = JobRegistry::with_retention(Duration::from_secs(3600), 2);
        let ids: Vec<JobId> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                let id = registry
                    .try_create(name, "clip.mp4", SourceBackend::Local, vec![])
                    .unwrap()
                    .job_id;
                registry.transition(id, JobState::Cancelled).unwrap();
                id
            })
            .collect();

        assert!(registry.get(ids[0]).is_none());
        assert!(registry.get(ids[1]).is_some());
        assert!(registry.get(ids[2]).is_some());
        assert_eq!(registry.list(None).len(), 2);
        assert_eq!(registry.count(JobState::Cancelled), 2);
    }

    #[test]
    fn test_expired_jobs_pruned_but_live_jobs_kept() {
        let registry = JobRegistry::with_retention(Duration::ZERO, 100);
        let live = registry
            .try_create("live", "live.mp4", SourceBackend::Local, vec![])
            .unwrap()
            .job_id;
        let done = registry
            .try_create("done", "done.mp4", SourceBackend::Local, vec![])
            .unwrap()
            .job_id;
        registry.fail(done, "boom").unwrap();

        registry.try_create("next", "next.mp4", SourceBackend::Local, vec![]).unwrap();
        assert!(registry.get(done).is_none());
        assert!(registry.get(live).is_some());
        assert_eq!(registry.count(JobState::Failed), 0);
        assert_eq!(registry.count(JobState::Queued), 2);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_counts_follow_transitions() {
        let (registry, id) = registry_with_job();
        assert_eq!(registry.count(JobState::Queued), 1);
        registry.transition(id, JobState::Processing).unwrap();
        assert_eq!(registry.count(JobState::Queued), 0);
        assert_eq!(registry.count(JobState::Processing), 1);
        registry.transition(id, JobState::Publishing).unwrap();
        registry.transition(id, JobState::Ready).unwrap();
        assert_eq!(registry.count(JobState::Ready), 1);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_delete_claim_blocks_new_jobs_until_released() {
        let registry = JobRegistry::new();
        let claim = registry.claim_for_delete("show").unwrap();
        assert!(registry.claim_for_delete("show").is_none());
        assert!(registry
            .try_create("show", "show.mp4", SourceBackend::Local, vec![])
            .is_none());
        assert!(!registry.is_active("show"));

        drop(claim);
        let id = registry
            .try_create("show", "show.mp4", SourceBackend::Local, vec![])
            .unwrap()
            .job_id;
        assert!(registry.claim_for_delete("show").is_none());

        registry.transition(id, JobState::Cancelled).unwrap();
        assert!(registry.claim_for_delete("show").is_some());
    }
}

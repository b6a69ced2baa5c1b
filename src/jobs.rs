use crate::{pipeline::PipelineState, tokens::DeliveryKind};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug)]
pub struct JobInfo {
    pub url: String,
    pub kind: DeliveryKind,
    pub state: PipelineState,
    pub started_at: Instant,
}

/// Live pipeline runs, for `/status` and state-transition logging.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<DashMap<JobId, JobInfo>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run; it disappears again when the returned guard drops.
    pub fn start(&self, url: &str, kind: DeliveryKind) -> JobGuard {
        let id = JobId::new();
        self.inner.insert(
            id.clone(),
            JobInfo {
                url: url.to_string(),
                kind,
                state: PipelineState::PendingSelection,
                started_at: Instant::now(),
            },
        );
        JobGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn set_state(&self, id: &JobId, state: PipelineState) {
        if let Some(mut job) = self.inner.get_mut(id) {
            debug!(event = "job_state", job = %id, from = job.state.as_str(), to = state.as_str());
            job.state = state;
        }
    }

    pub fn get(&self, id: &JobId) -> Option<JobInfo> {
        self.inner.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &JobId) -> Option<JobInfo> {
        self.inner.remove(id).map(|(_, job)| job)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Live runs, longest-running first.
    pub fn snapshot(&self) -> Vec<(JobId, JobInfo)> {
        let mut jobs: Vec<(JobId, JobInfo)> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        jobs.sort_by_key(|(_, job)| job.started_at);
        jobs
    }

    pub fn counts_by_state(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.inner.iter() {
            *counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

pub struct JobGuard {
    registry: JobRegistry,
    id: JobId,
}

impl JobGuard {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn set_state(&self, state: PipelineState) {
        self.registry.set_state(&self.id, state);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let _ = self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_removes_on_drop() {
        let registry = JobRegistry::new();
        let id = {
            let guard = registry.start("https://youtu.be/x", DeliveryKind::Video);
            assert!(registry.get(guard.id()).is_some());
            guard.id().clone()
        };
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn counts_jobs_per_state() {
        let registry = JobRegistry::new();
        let a = registry.start("https://a", DeliveryKind::Video);
        let b = registry.start("https://b", DeliveryKind::Audio);
        let _c = registry.start("https://c", DeliveryKind::Audio);
        a.set_state(PipelineState::Downloading);
        b.set_state(PipelineState::Downloading);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().any(|(id, job)| id == a.id() && job.url == "https://a"));

        let counts = registry.counts_by_state();
        assert_eq!(counts.get("downloading"), Some(&2));
        assert_eq!(counts.get("pending_selection"), Some(&1));
        assert_eq!(registry.get(a.id()).map(|j| j.kind), Some(DeliveryKind::Video));
    }
}

//! Job registry
//!
//! The single owner of [`JobState`]. Every mutation goes through a registry
//! call that holds the entry's lock for the duration of the patch, so two
//! transitions for the same job never interleave while different jobs proceed
//! independently.

use crate::events::EngineEvent;
use crate::job::{JobRequest, JobState, JobStatus};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("job {0} already exists")]
    AlreadyExists(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("invalid transition for job {job_id}: {from} -> {to} (current status {current})")]
    InvalidTransition {
        job_id: String,
        current: JobStatus,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Outcome of trying to take the right to publish a job's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishClaim {
    /// Caller owns the publication and must report back
    Claimed,
    AlreadyPublished,
    /// Another caller is publishing right now
    InFlight,
}

pub struct JobRegistry {
    jobs: DashMap<String, JobState>,
    events: broadcast::Sender<EngineEvent>,
}

impl JobRegistry {
    pub fn new(events: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            jobs: DashMap::new(),
            events,
        }
    }

    /// Create the `Received` state for an admitted request.
    pub fn create(&self, request: Arc<JobRequest>) -> Result<JobState, RegistryError> {
        let job_id = request.id.clone();
        match self.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(job_id)),
            Entry::Vacant(slot) => {
                let state = JobState::new(request);
                slot.insert(state.clone());
                Ok(state)
            }
        }
    }

    /// Move a job from `from` to `to`, applying `patch` under the same lock.
    ///
    /// Fails if the job's current status is not `from` or the transition is
    /// not allowed.
    pub fn transition<F>(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        patch: F,
    ) -> Result<JobState, RegistryError>
    where
        F: FnOnce(&mut JobState),
    {
        let snapshot = {
            let mut entry = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
            let current = entry.status;
            if current != from || !from.can_transition_to(to) {
                return Err(RegistryError::InvalidTransition {
                    job_id: job_id.to_string(),
                    current,
                    from,
                    to,
                });
            }
            patch(&mut *entry);
            entry.status = to;
            entry.updated_at = Utc::now();
            entry.value().clone()
        };

        tracing::debug!(job_id = %job_id, %from, %to, "job transitioned");
        let _ = self.events.send(EngineEvent::JobTransitioned {
            job_id: job_id.to_string(),
            from,
            to,
            timestamp: snapshot.updated_at,
        });
        Ok(snapshot)
    }

    /// Patch non-status fields of a job.
    pub fn update<F>(&self, job_id: &str, patch: F) -> Result<JobState, RegistryError>
    where
        F: FnOnce(&mut JobState),
    {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        let status = entry.status;
        patch(&mut *entry);
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    pub fn get(&self, job_id: &str) -> Option<JobState> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|entry| entry.status)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn list<P>(&self, predicate: P) -> Vec<JobState>
    where
        P: Fn(&JobState) -> bool,
    {
        let mut jobs: Vec<JobState> = self
            .jobs
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn evict(&self, job_id: &str) -> Option<JobState> {
        let removed = self.jobs.remove(job_id).map(|(_, state)| state);
        if removed.is_some() {
            let _ = self.events.send(EngineEvent::JobEvicted {
                job_id: job_id.to_string(),
                timestamp: Utc::now(),
            });
        }
        removed
    }

    /// Drop every job. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let ids: Vec<String> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.evict(id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Take the right to publish the result of `job_id`.
    pub fn claim_result_publication(&self, job_id: &str) -> Result<PublishClaim, RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        if entry.result_published {
            return Ok(PublishClaim::AlreadyPublished);
        }
        if entry.result_publish_in_flight {
            return Ok(PublishClaim::InFlight);
        }
        entry.result_publish_in_flight = true;
        Ok(PublishClaim::Claimed)
    }

    /// Release a claim taken with [`claim_result_publication`]. `published`
    /// sets the flag permanently.
    ///
    /// [`claim_result_publication`]: JobRegistry::claim_result_publication
    pub fn release_result_publication(
        &self,
        job_id: &str,
        published: bool,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?;
        entry.result_publish_in_flight = false;
        if published {
            entry.result_published = true;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self::new(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::job_request;
    use std::collections::HashSet;

    #[test]
    fn test_create_rejects_duplicates() {
        let registry = JobRegistry::default();
        let request = Arc::new(job_request(5050, "hi"));
        let state = registry.create(request.clone()).unwrap();
        assert_eq!(state.status, JobStatus::Received);
        assert_eq!(
            registry.create(request.clone()).unwrap_err(),
            RegistryError::AlreadyExists(request.id.clone())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_transition_checks_from_status() {
        let registry = JobRegistry::default();
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();

        let err = registry
            .transition(&request.id, JobStatus::Processing, JobStatus::Completed, |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                current: JobStatus::Received,
                ..
            }
        ));

        let state = registry
            .transition(&request.id, JobStatus::Received, JobStatus::Processing, |_| {})
            .unwrap();
        assert_eq!(state.status, JobStatus::Processing);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let registry = JobRegistry::default();
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();
        registry
            .transition(&request.id, JobStatus::Received, JobStatus::Processing, |_| {})
            .unwrap();
        registry
            .transition(&request.id, JobStatus::Processing, JobStatus::Failed, |_| {})
            .unwrap();

        for to in [JobStatus::Processing, JobStatus::Completed, JobStatus::Failed] {
            assert!(registry
                .transition(&request.id, JobStatus::Failed, to, |_| {})
                .is_err());
        }
    }

    #[test]
    fn test_patch_applies_atomically_with_status() {
        let registry = JobRegistry::default();
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();

        registry
            .transition(&request.id, JobStatus::Received, JobStatus::Failed, |job| {
                job.last_error = Some(crate::error::JobError::new(
                    crate::error::ErrorKind::Payment,
                    "wallet down",
                ));
            })
            .unwrap();

        let state = registry.get(&request.id).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.last_error.unwrap().message, "wallet down");
    }

    #[test]
    fn test_update_cannot_change_status() {
        let registry = JobRegistry::default();
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();
        let state = registry
            .update(&request.id, |job| {
                job.status = JobStatus::Completed;
                job.attempts.publish = 2;
            })
            .unwrap();
        assert_eq!(state.status, JobStatus::Received);
        assert_eq!(state.attempts.publish, 2);
    }

    #[test]
    fn test_result_publication_claim() {
        let registry = JobRegistry::default();
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();

        assert_eq!(
            registry.claim_result_publication(&request.id).unwrap(),
            PublishClaim::Claimed
        );
        assert_eq!(
            registry.claim_result_publication(&request.id).unwrap(),
            PublishClaim::InFlight
        );
        registry.release_result_publication(&request.id, false).unwrap();
        assert_eq!(
            registry.claim_result_publication(&request.id).unwrap(),
            PublishClaim::Claimed
        );
        registry.release_result_publication(&request.id, true).unwrap();
        assert_eq!(
            registry.claim_result_publication(&request.id).unwrap(),
            PublishClaim::AlreadyPublished
        );
        assert!(registry.get(&request.id).unwrap().result_published);
    }

    #[test]
    fn test_transition_and_evict_emit_events() {
        let (tx, mut rx) = broadcast::channel(16);
        let registry = JobRegistry::new(tx);
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();
        registry
            .transition(&request.id, JobStatus::Received, JobStatus::Processing, |_| {})
            .unwrap();
        registry.evict(&request.id);

        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::JobTransitioned {
                to: JobStatus::Processing,
                ..
            }
        ));
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::JobEvicted { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_single_winner() {
        let registry = Arc::new(JobRegistry::default());
        let request = Arc::new(job_request(5050, "hi"));
        registry.create(request.clone()).unwrap();

        let mut handles = Vec::new();
        for target in [JobStatus::AwaitingPayment, JobStatus::Processing, JobStatus::Failed] {
            for _ in 0..8 {
                let registry = registry.clone();
                let id = request.id.clone();
                handles.push(tokio::spawn(async move {
                    registry
                        .transition(&id, JobStatus::Received, target, |_| {})
                        .ok()
                        .map(|s| s.status)
                }));
            }
        }

        let mut winners = HashSet::new();
        let mut successes = 0;
        for handle in handles {
            if let Some(status) = handle.await.unwrap() {
                successes += 1;
                winners.insert(status);
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(winners.len(), 1);
    }

    #[test]
    fn test_list_filters_and_orders() {
        let registry = JobRegistry::default();
        let a = Arc::new(job_request(5050, "a"));
        let b = Arc::new(job_request(5050, "b"));
        registry.create(a.clone()).unwrap();
        registry.create(b.clone()).unwrap();
        registry
            .transition(&b.id, JobStatus::Received, JobStatus::Processing, |_| {})
            .unwrap();

        let processing = registry.list(|job| job.status == JobStatus::Processing);
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].job_id, b.id);
        assert_eq!(registry.list(|_| true).len(), 2);
        assert_eq!(registry.clear(), 2);
    }
}

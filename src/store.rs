//! Canonical job records.
//!
//! [`JobStore`] is the only place job records are mutated. Every change goes
//! through [`JobStore::apply`], which runs the state machine and keeps the
//! history bound. A job's local id keeps resolving after the engine assigns
//! its own id. Engine ids of earlier attempts are retired and stop resolving,
//! so late frames for them cannot touch a later attempt.

use std::collections::HashMap;

use serde::Serialize;
use tokio::time::Instant;

use crate::batch::BatchCounts;
use crate::error::OrchestratorError;
use crate::state_machine::{Job, JobId, JobStatus, Mutation, StateMachine, Transition};

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled + self.paused
    }

    pub fn batch(&self) -> BatchCounts {
        BatchCounts {
            processing: self.processing,
            pending: self.pending,
        }
    }
}

#[derive(Debug)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    /// Enqueue order, for listing.
    order: Vec<JobId>,
    /// Local id -> current engine-assigned id.
    aliases: HashMap<JobId, JobId>,
    /// Engine ids of superseded attempts -> local id.
    retired: HashMap<JobId, JobId>,
    max_history: usize,
}

impl JobStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            aliases: HashMap::new(),
            retired: HashMap::new(),
            max_history,
        }
    }

    pub fn insert(&mut self, job: Job) -> JobId {
        let id = job.id.clone();
        self.order.push(id.clone());
        self.jobs.insert(id.clone(), job);
        id
    }

    /// Canonical id for `id`, following a rebinding if there was one.
    pub fn resolve(&self, id: &str) -> Option<JobId> {
        if self.jobs.contains_key(id) {
            return Some(id.to_string());
        }
        self.aliases
            .get(id)
            .filter(|canonical| self.jobs.contains_key(canonical.as_str()))
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        let id = self.resolve(id)?;
        self.jobs.get(&id)
    }

    /// Apply a mutation to one job. Unknown ids are an error; illegal
    /// mutations come back as [`Transition::Ignored`].
    pub fn apply(
        &mut self,
        id: &str,
        mutation: Mutation,
        now: Instant,
    ) -> Result<Transition, OrchestratorError> {
        let canonical = self
            .resolve(id)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
        let job = self
            .jobs
            .get_mut(&canonical)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;

        let name = mutation.name();
        let transition = StateMachine::apply(job, mutation, now);
        match transition {
            Transition::Moved { from, to } => {
                tracing::debug!(job_id = %canonical, mutation = name, %from, %to, "job transition");
            }
            Transition::Ignored { status } => {
                tracing::debug!(job_id = %canonical, mutation = name, %status, "mutation ignored");
            }
            Transition::Updated => {}
        }
        Ok(transition)
    }

    /// Move a job to the id the engine assigned. All accumulated state is
    /// kept and the local id keeps resolving.
    pub fn rebind(&mut self, old: &str, new: &str) -> Result<JobId, OrchestratorError> {
        let canonical = self
            .resolve(old)
            .ok_or_else(|| OrchestratorError::JobNotFound(old.to_string()))?;
        if canonical == new {
            return Ok(canonical);
        }
        if self.jobs.contains_key(new) || self.aliases.contains_key(new) {
            return Err(OrchestratorError::JobIdConflict(new.to_string()));
        }
        self.relocate(&canonical, new)
    }

    /// Put a job back under its local id before it is dispatched again. The
    /// engine id of the previous attempt is retired.
    pub fn retire_engine_id(&mut self, id: &str) -> Result<JobId, OrchestratorError> {
        let canonical = self
            .resolve(id)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
        let local = self
            .jobs
            .get(&canonical)
            .map(|job| job.local_id.clone())
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
        if canonical == local {
            return Ok(local);
        }
        self.relocate(&canonical, &local)
    }

    /// True for engine ids that belonged to a superseded attempt.
    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains_key(id)
    }

    fn relocate(&mut self, canonical: &str, new: &str) -> Result<JobId, OrchestratorError> {
        let Some(mut job) = self.jobs.remove(canonical) else {
            return Err(OrchestratorError::JobNotFound(canonical.to_string()));
        };
        job.id = new.to_string();
        let local = job.local_id.clone();
        self.jobs.insert(new.to_string(), job);
        if let Some(slot) = self.order.iter_mut().find(|id| **id == canonical) {
            *slot = new.to_string();
        }

        if canonical != local {
            tracing::debug!(job_id = %local, engine_job_id = canonical, "retired engine id");
            self.retired.insert(canonical.to_string(), local.clone());
        }
        self.retired.remove(new);
        self.aliases.remove(&local);
        if new != local {
            self.aliases.insert(local, new.to_string());
        }
        Ok(new.to_string())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
                JobStatus::Paused => counts.paused += 1,
            }
        }
        counts
    }

    /// All jobs in enqueue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }

    /// Remove completed and cancelled jobs. Failed jobs stay until retried
    /// or removed one by one.
    pub fn clear_completed(&mut self) -> Vec<JobId> {
        let doomed: Vec<JobId> = self
            .order
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|job| job.status.is_absorbing()))
            .cloned()
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed
    }

    /// Remove a single terminal job.
    pub fn remove_terminal(&mut self, id: &str) -> Result<bool, OrchestratorError> {
        let canonical = self
            .resolve(id)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
        let terminal = self
            .jobs
            .get(&canonical)
            .is_some_and(|job| job.status.is_terminal());
        if terminal {
            self.remove(&canonical);
        }
        Ok(terminal)
    }

    /// Drop the oldest completed/cancelled jobs beyond the history bound.
    pub fn prune_history(&mut self) -> Vec<JobId> {
        let finished: Vec<JobId> = self
            .order
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|job| job.status.is_absorbing()))
            .cloned()
            .collect();
        let excess = finished.len().saturating_sub(self.max_history);
        let doomed = finished[..excess].to_vec();
        for id in &doomed {
            self.remove(id);
        }
        doomed
    }

    fn remove(&mut self, id: &str) {
        if let Some(job) = self.jobs.remove(id) {
            self.aliases.remove(&job.local_id);
            self.retired.retain(|_, local| *local != job.local_id);
        }
        self.order.retain(|existing| existing != id);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

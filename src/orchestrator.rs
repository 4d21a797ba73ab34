use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchController, BatchDecision};
use crate::cache::{CacheStats, ResultCache};
use crate::client::{ClientMetrics, GenerationBackend, SubmissionClient, Submission, SubmitError};
use crate::error::{ErrorKind, OrchestratorError};
use crate::events::{ControlFrame, EventStream, GenerationEvent, SubscriptionRegistry};
use crate::gate::RateGate;
use crate::params::GenerationParams;
use crate::queue::{PriorityQueue, QueueEntry};
use crate::reconciler::{ReconcileOutcome, Reconciler, ReconcilerStats};
use crate::state_machine::{
    GenerationResult, Job, JobError, JobId, JobStatus, Mutation, RetryConfig, Transition,
};
use crate::store::{JobStore, StatusCounts};

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Jobs allowed in `processing` at once.
    pub max_concurrent_jobs: usize,
    /// Dispatch slots held by the gate.
    pub max_concurrent_requests: usize,
    /// Ceiling for a single submission call.
    pub request_timeout: Duration,
    /// Cooldown applied when a rate limit carries no `Retry-After`.
    pub default_rate_limit: Duration,
    pub retry: RetryConfig,
    /// Retry retryable failures automatically with exponential backoff.
    pub auto_retry: bool,
    pub cache_max_size: usize,
    pub cache_ttl: Duration,
    /// Completed/cancelled jobs kept before the oldest are dropped.
    pub max_history: usize,
    /// Safety-net re-evaluation period for [`Orchestrator::spawn_ticker`].
    pub tick_interval: Duration,
    pub max_prompt_length: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_concurrent_requests: 3,
            request_timeout: Duration::from_secs(300),
            default_rate_limit: Duration::from_secs(1),
            retry: RetryConfig::default(),
            auto_retry: false,
            cache_max_size: 50,
            cache_ttl: Duration::from_secs(3600),
            max_history: 100,
            tick_interval: Duration::from_millis(500),
            max_prompt_length: 500,
        }
    }
}

/// Read-only statistics for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub jobs: StatusCounts,
    /// Entries waiting in the priority queue.
    pub queued: usize,
    /// Gate slots currently held.
    pub active_requests: usize,
    pub max_concurrent_jobs: usize,
    /// Remaining pipeline-wide cooldown, if any.
    pub rate_limited_for_ms: Option<u64>,
    pub subscriptions: usize,
    pub cache: CacheStats,
    pub client: ClientMetrics,
    pub events: ReconcilerStats,
}

struct InFlight {
    token: CancellationToken,
    /// Distinguishes this dispatch from later ones of the same job.
    attempt: u64,
    /// Queue position to restore if the submission is rate limited.
    entry: QueueEntry,
}

struct Dispatch {
    job_id: JobId,
    params: GenerationParams,
    token: CancellationToken,
    attempt: u64,
}

struct EngineState {
    store: JobStore,
    queue: PriorityQueue,
    gate: RateGate,
    cache: ResultCache<GenerationResult>,
    batch: BatchController,
    reconciler: Reconciler,
    subscriptions: SubscriptionRegistry,
    in_flight: HashMap<JobId, InFlight>,
    next_attempt: u64,
    wakeup_at: Option<Instant>,
}

struct Shared<B> {
    config: OrchestratorConfig,
    client: SubmissionClient<B>,
    state: Mutex<EngineState>,
    idle: watch::Sender<bool>,
    revision: watch::Sender<u64>,
}

/// Owns the queue, gate, store, cache and batch policy for one engine.
///
/// Cloning yields another handle to the same instance. All state sits behind
/// one lock that is never held across an `.await`, so every mutation is
/// applied whole. Dispatch is re-evaluated after every change, when a rate
/// limit expires, and on the optional safety tick.
///
/// Must be used from within a tokio runtime: dispatch spawns tasks.
pub struct Orchestrator<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for Orchestrator<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: GenerationBackend> Orchestrator<B> {
    pub fn new(config: OrchestratorConfig, backend: B) -> Self {
        let state = EngineState {
            store: JobStore::new(config.max_history),
            queue: PriorityQueue::new(),
            gate: RateGate::new(config.max_concurrent_requests, config.default_rate_limit),
            cache: ResultCache::new(config.cache_max_size, config.cache_ttl),
            batch: BatchController::new(config.max_concurrent_jobs),
            reconciler: Reconciler::new(),
            subscriptions: SubscriptionRegistry::new(),
            in_flight: HashMap::new(),
            next_attempt: 0,
            wakeup_at: None,
        };
        let (idle, _) = watch::channel(true);
        let (revision, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                client: SubmissionClient::new(backend, config.request_timeout),
                config,
                state: Mutex::new(state),
                idle,
                revision,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &B {
        self.shared.client.backend()
    }

    // --- actions ---

    /// Validate and enqueue one request. Identical requests with a live
    /// cached result complete immediately without dispatch.
    pub fn enqueue(
        &self,
        params: GenerationParams,
        priority: i32,
    ) -> Result<JobId, OrchestratorError> {
        params.validate(self.shared.config.max_prompt_length)?;
        let id = {
            let mut st = self.lock();
            self.admit(&mut st, params, priority, Instant::now())
        };
        self.pump();
        Ok(id)
    }

    /// Enqueue several requests before any of them is dispatched, so their
    /// relative priorities decide the dispatch order. Rejects the whole
    /// batch if any request is invalid.
    pub fn enqueue_many(
        &self,
        requests: Vec<(GenerationParams, i32)>,
    ) -> Result<Vec<JobId>, OrchestratorError> {
        for (params, _) in &requests {
            params.validate(self.shared.config.max_prompt_length)?;
        }
        let ids = {
            let mut st = self.lock();
            let now = Instant::now();
            requests
                .into_iter()
                .map(|(params, priority)| self.admit(&mut st, params, priority, now))
                .collect()
        };
        self.pump();
        Ok(ids)
    }

    /// Cancel a pending, processing or paused job. Returns false when the
    /// job had already finished.
    pub fn cancel(&self, id: &str) -> Result<bool, OrchestratorError> {
        self.act(id, Mutation::Cancel, |st, job_id, _| {
            st.queue.remove(job_id);
        })
    }

    /// Pause a processing job, releasing its slot.
    pub fn pause(&self, id: &str) -> Result<bool, OrchestratorError> {
        self.act(id, Mutation::Pause, |_, _, _| {})
    }

    /// Send a paused job back to the queue. Its progress starts over.
    pub fn resume(&self, id: &str) -> Result<bool, OrchestratorError> {
        self.act(id, Mutation::Resume, |st, job_id, _| {
            Self::requeue_fresh(st, job_id);
        })
    }

    /// Retry a failed job. A no-op (`Ok(false)`) once retries are exhausted.
    pub fn retry(&self, id: &str) -> Result<bool, OrchestratorError> {
        self.act(id, Mutation::Retry, |st, job_id, _| {
            let local = Self::requeue_fresh(st, job_id);
            tracing::info!(job_id = %local, "job re-queued for retry");
        })
    }

    /// Change the priority of a job that has not been dispatched yet.
    pub fn set_priority(&self, id: &str, priority: i32) -> Result<bool, OrchestratorError> {
        self.act(id, Mutation::SetPriority(priority), move |st, job_id, _| {
            st.queue.set_priority(job_id, priority);
        })
    }

    /// Drop completed and cancelled jobs. Failed jobs stay visible.
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let removed = st.store.clear_completed();
            for id in &removed {
                st.subscriptions.unsubscribe_job(id);
            }
            self.publish(st);
            removed.len()
        };
        tracing::debug!(removed, "cleared finished jobs");
        removed
    }

    /// Remove one finished job, failed ones included.
    pub fn remove(&self, id: &str) -> Result<bool, OrchestratorError> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let canonical = st
            .store
            .resolve(id)
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
        let removed = st.store.remove_terminal(&canonical)?;
        if removed {
            st.subscriptions.unsubscribe_job(&canonical);
            self.publish(st);
        }
        Ok(removed)
    }

    /// Drop cached results whose key contains `pattern`, or all of them.
    pub fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
        self.lock().cache.invalidate(pattern)
    }

    // --- inbound events ---

    /// Fold one engine event into job state.
    pub fn handle_event(&self, event: GenerationEvent) -> ReconcileOutcome {
        let outcome = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let now = Instant::now();
            let raw_id = event.job_id().to_string();
            let outcome = st
                .reconciler
                .reconcile(&mut st.store, &mut st.cache, event, now);

            if let Some(transition) = outcome.transition() {
                let job_id = st.store.resolve(&raw_id).unwrap_or(raw_id);
                self.settle(st, &job_id, transition);
                if let Transition::Moved {
                    to: JobStatus::Failed,
                    ..
                } = transition
                {
                    self.schedule_auto_retry(st, &job_id);
                }
            }
            outcome
        };
        self.pump();
        outcome
    }

    /// Consume events from a channel until it closes.
    pub fn attach_events(&self, mut events: mpsc::Receiver<GenerationEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_event(event);
            }
            tracing::info!("event channel closed");
        })
    }

    /// Mirror subscribe/unsubscribe changes onto a transport.
    pub fn attach_control(&self, control: mpsc::UnboundedSender<ControlFrame>) {
        self.lock().subscriptions.attach(control);
    }

    /// Wire a WebSocket event stream in both directions.
    pub fn attach_stream(&self, stream: EventStream) -> JoinHandle<()> {
        let (control, events) = stream.into_parts();
        self.attach_control(control);
        self.attach_events(events)
    }

    /// Periodic re-evaluation. Stops once every handle is dropped.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let weak: Weak<Shared<B>> = Arc::downgrade(&self.shared);
        let period = self.shared.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                Orchestrator { shared }.pump();
            }
        })
    }

    // --- read-only views ---

    /// All jobs in enqueue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().store.jobs()
    }

    /// A job by its local or engine-assigned id.
    pub fn job(&self, id: &str) -> Option<Job> {
        self.lock().store.get(id).cloned()
    }

    /// Ids waiting in the queue, in dispatch order.
    pub fn queued(&self) -> Vec<JobId> {
        self.lock().queue.ids()
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.lock();
        let now = Instant::now();
        QueueStats {
            jobs: st.store.counts(),
            queued: st.queue.len(),
            active_requests: st.gate.active_count(),
            max_concurrent_jobs: st.batch.max_concurrent_jobs(),
            rate_limited_for_ms: st
                .gate
                .rate_limited_until(now)
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            subscriptions: st.subscriptions.len(),
            cache: st.cache.stats(),
            client: self.shared.client.metrics(),
            events: st.reconciler.stats(),
        }
    }

    pub fn is_idle(&self) -> bool {
        *self.shared.idle.borrow()
    }

    /// Resolves once nothing is pending or processing.
    pub async fn wait_idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// A receiver that changes after every state update, for redraws.
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    // --- dispatch ---

    /// Promote as many pending jobs as the batch policy and the gate allow.
    pub fn pump(&self) {
        let dispatches = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let now = Instant::now();
            let mut dispatches = Vec::new();

            while let BatchDecision::Promote(_) = st.batch.plan(st.store.counts().batch()) {
                if !st.gate.can_dispatch(now) {
                    break;
                }
                let Some(entry) = st.queue.dequeue_next() else {
                    break;
                };
                let Some(job) = st.store.get(&entry.job_id) else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    continue;
                }
                let job_id = entry.job_id.clone();
                let fingerprint = job.fingerprint.clone();
                let params = job.params.clone();

                // Admission already counted the miss for this request.
                if st.cache.contains(&fingerprint, now)
                    && let Some(result) = st.cache.get(&fingerprint, now)
                {
                    if let Ok(t) = st
                        .store
                        .apply(&job_id, Mutation::CompleteFromCache(result), now)
                    {
                        tracing::info!(job_id = %job_id, "served from cache at dispatch");
                        self.settle(st, &job_id, t);
                    }
                    continue;
                }

                match st.store.apply(&job_id, Mutation::Dispatch, now) {
                    Ok(t) if t.is_applied() => {}
                    _ => continue,
                }
                st.gate.acquire(&job_id);
                st.next_attempt += 1;
                let attempt = st.next_attempt;
                let token = CancellationToken::new();
                tracing::info!(
                    job_id = %job_id,
                    priority = entry.priority,
                    active = st.gate.active_count(),
                    "dispatching job"
                );
                st.in_flight.insert(
                    job_id.clone(),
                    InFlight {
                        token: token.clone(),
                        attempt,
                        entry,
                    },
                );
                dispatches.push(Dispatch {
                    job_id,
                    params,
                    token,
                    attempt,
                });
            }

            if let Some(deadline) = st.gate.rate_limited_until(now)
                && !st.queue.is_empty()
            {
                self.schedule_wakeup(st, deadline);
            }
            self.publish(st);
            dispatches
        };

        for dispatch in dispatches {
            self.spawn_submission(dispatch);
        }
    }

    fn spawn_submission(&self, dispatch: Dispatch) {
        let this = self.clone();
        tokio::spawn(async move {
            let Dispatch {
                job_id,
                params,
                token,
                attempt,
            } = dispatch;
            let outcome = this.shared.client.submit(&job_id, &params, &token).await;
            this.on_submission(job_id, attempt, outcome);
        });
    }

    fn on_submission(
        &self,
        job_id: JobId,
        attempt: u64,
        outcome: Result<Submission, SubmitError>,
    ) {
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let now = Instant::now();

            let current = st
                .in_flight
                .get(&job_id)
                .is_some_and(|flight| flight.attempt == attempt);
            if !current {
                tracing::debug!(job_id = %job_id, "discarding outcome of superseded submission");
                return;
            }

            match outcome {
                Ok(submission) => self.on_accepted(st, &job_id, submission, now),
                Err(SubmitError::Cancelled) => {}
                Err(SubmitError::RateLimited { retry_after_ms }) => {
                    let deadline = st
                        .gate
                        .rate_limit(now, retry_after_ms.map(Duration::from_millis));
                    tracing::warn!(
                        job_id = %job_id,
                        retry_after_ms = ?retry_after_ms,
                        "rate limited, suspending dispatch"
                    );
                    let entry = st.in_flight.get(&job_id).map(|flight| flight.entry.clone());
                    if let Ok(t) = st.store.apply(&job_id, Mutation::Requeue, now)
                        && t.is_applied()
                    {
                        self.settle(st, &job_id, t);
                        if let Some(entry) = entry {
                            st.queue.requeue(entry);
                        }
                    }
                    self.schedule_wakeup(st, deadline);
                }
                Err(err) => {
                    let kind = err.kind().unwrap_or(ErrorKind::Unknown);
                    let error = JobError::new(kind, err.to_string());
                    if let Ok(t) = st.store.apply(&job_id, Mutation::Fail(error), now)
                        && t.is_applied()
                    {
                        self.settle(st, &job_id, t);
                        self.schedule_auto_retry(st, &job_id);
                    }
                }
            }
        }
        self.pump();
    }

    fn on_accepted(
        &self,
        st: &mut EngineState,
        job_id: &str,
        submission: Submission,
        now: Instant,
    ) {
        let _ = st
            .store
            .apply(job_id, Mutation::Estimate(submission.estimated_time_ms), now);

        let mut canonical = job_id.to_string();
        if submission.job_id != job_id {
            match st.store.rebind(job_id, &submission.job_id) {
                Ok(engine_id) => {
                    st.gate.rebind(job_id, &engine_id);
                    if let Some(flight) = st.in_flight.remove(job_id) {
                        st.in_flight.insert(engine_id.clone(), flight);
                    }
                    canonical = engine_id;
                }
                Err(e) => tracing::warn!(
                    job_id,
                    engine_job_id = %submission.job_id,
                    error = %e,
                    "keeping local job id"
                ),
            }
        }
        st.subscriptions.subscribe(&canonical);
    }

    // --- bookkeeping shared by every path ---

    fn act(
        &self,
        id: &str,
        mutation: Mutation,
        on_applied: impl FnOnce(&mut EngineState, &str, Transition),
    ) -> Result<bool, OrchestratorError> {
        let applied = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let job_id = st
                .store
                .resolve(id)
                .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
            let transition = st.store.apply(&job_id, mutation, Instant::now())?;
            if transition.is_applied() {
                on_applied(st, &job_id, transition);
                self.settle(st, &job_id, transition);
            }
            transition.is_applied()
        };
        self.pump();
        Ok(applied)
    }

    /// Queue a job for a new attempt under its local id. The engine id of
    /// the previous attempt stops resolving, so its late frames are dropped.
    fn requeue_fresh(st: &mut EngineState, job_id: &str) -> JobId {
        let local = match st.store.retire_engine_id(job_id) {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "could not retire engine id");
                job_id.to_string()
            }
        };
        let priority = st.store.get(&local).map(|job| job.priority).unwrap_or(0);
        st.queue.enqueue(local.clone(), priority);
        local
    }

    fn admit(
        &self,
        st: &mut EngineState,
        params: GenerationParams,
        priority: i32,
        now: Instant,
    ) -> JobId {
        let job = Job::new(params, priority, self.shared.config.retry.clone());
        let fingerprint = job.fingerprint.clone();
        let job_id = st.store.insert(job);

        match st.cache.get(&fingerprint, now) {
            Some(result) => {
                let _ = st
                    .store
                    .apply(&job_id, Mutation::CompleteFromCache(result), now);
                tracing::info!(job_id = %job_id, "served from cache");
            }
            None => {
                st.queue.enqueue(job_id.clone(), priority);
                tracing::info!(job_id = %job_id, priority, "job enqueued");
            }
        }
        job_id
    }

    /// Follow-up for any applied transition. Every exit from `processing`
    /// passes through here, which is what guarantees the slot is released.
    fn settle(&self, st: &mut EngineState, job_id: &str, transition: Transition) {
        if transition.left_processing() {
            if let Some(flight) = st.in_flight.remove(job_id) {
                flight.token.cancel();
            }
            if st.gate.release(job_id) {
                tracing::debug!(
                    job_id,
                    active = st.gate.active_count(),
                    "released dispatch slot"
                );
            }
        }
        if let Transition::Moved { to, .. } = transition
            && (to.is_terminal() || transition.left_processing())
        {
            st.subscriptions.unsubscribe_job(job_id);
        }
    }

    fn schedule_auto_retry(&self, st: &EngineState, job_id: &str) {
        if !self.shared.config.auto_retry {
            return;
        }
        let Some(job) = st.store.get(job_id) else {
            return;
        };
        let retryable = job.error.as_ref().is_some_and(|e| e.kind.is_retryable());
        if !retryable || !job.can_retry() {
            return;
        }

        let attempt = job.retry_count + 1;
        let delay = Duration::from_millis(job.retry_config.delay_for_attempt(attempt));
        tracing::info!(
            job_id,
            attempt,
            max = job.retry_config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling automatic retry"
        );

        let this = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.retry(&job_id) {
                tracing::debug!(job_id = %job_id, error = %e, "automatic retry skipped");
            }
        });
    }

    fn schedule_wakeup(&self, st: &mut EngineState, deadline: Instant) {
        if st.wakeup_at.is_some_and(|at| at >= deadline) {
            return;
        }
        st.wakeup_at = Some(deadline);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut st = this.lock();
                if st.wakeup_at == Some(deadline) {
                    st.wakeup_at = None;
                }
            }
            tracing::debug!("rate limit cooldown over");
            this.pump();
        });
    }

    fn publish(&self, st: &mut EngineState) {
        for id in st.store.prune_history() {
            st.subscriptions.unsubscribe_job(&id);
        }
        if st.batch.observe(st.store.counts().batch()) {
            tracing::info!("queue idle");
        }
        self.shared.idle.send_replace(st.batch.is_idle());
        self.shared.revision.send_modify(|revision| *revision += 1);
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

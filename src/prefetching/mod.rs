// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Prefetching engine.
//!
//! Keeps, per `(provider, preparer)` pipeline, a backlog of ready databases so
//! the common request is a queue pop instead of a synchronous build.
//!
//! # Request flow
//!
//! ```text
//! request ─► pop queued result ──────────────────────────────► return
//!               │ empty
//!               ▼
//!          sibling pipeline with a strict-prefix preparer and a ready result?
//!               │ yes: apply complement (urgent) ───────────────► return
//!               │ no
//!               ▼
//!          urgent from-scratch build already in flight?
//!               │ no: submit it (urgent) ───────────────────────► return
//!               │ yes
//!               ▼
//!          wait for the next background result ─────────────────► return
//! ```
//!
//! Every request then tops the backlog up to
//! `min(pipeline_cache_size, requests) + waiting requests` and re-prioritizes
//! the not-yet-started background tasks.
//!
//! # Instance budget
//!
//! Before any from-scratch build the engine checks the live instance count
//! (queued ready databases plus builds in progress) against `max_instances`.
//! Over budget, the oldest queued ready database of any pipeline is closed,
//! or handed over directly when it belongs to the pipeline an urgent build is
//! serving. A background build whose own pipeline holds the oldest database
//! stops there: that database already fills the backlog slot.
//!
//! # Backend failures
//!
//! Backend calls run on their own tokio task. A panicking backend fails the
//! request with [`ProviderError::Backend`] and releases its share of the
//! budget like any other failed build.

mod pool;

pub use pool::{TaskHandle, WorkerPool, LOWEST, URGENT};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::database::Database;
use crate::error::ProviderError;
use crate::metrics;
use crate::preparer::Preparer;
use crate::provider::{check_identity, CacheKey, DatabaseProvider, ProviderId};

/// Pipeline lifecycle. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PipelineState {
    /// Created, no request seen yet
    New,
    /// Requested, nothing produced yet
    Initializing,
    /// At least one database produced
    Initialized,
}

type Reply = oneshot::Sender<Result<Database, ProviderError>>;

struct PreparedResult {
    outcome: Result<Database, ProviderError>,
    created_at: Instant,
    sequence: u64,
}

struct PipelineInner {
    state: PipelineState,
    results: VecDeque<PreparedResult>,
    waiters: VecDeque<Reply>,
    /// Background tasks, queued or running
    tasks: Vec<Arc<TaskHandle>>,
    /// Removed by a reset; late results are closed instead of queued
    retired: bool,
}

struct Pipeline {
    key: CacheKey,
    provider: Arc<dyn DatabaseProvider>,
    requests: AtomicU64,
    /// Set and cleared under `inner`; an atomic so a dropped urgent task can
    /// clear it without the lock
    urgent_in_flight: AtomicBool,
    inner: Mutex<PipelineInner>,
}

impl Pipeline {
    fn new(key: CacheKey, provider: Arc<dyn DatabaseProvider>) -> Self {
        Self {
            key,
            provider,
            requests: AtomicU64::new(0),
            urgent_in_flight: AtomicBool::new(false),
            inner: Mutex::new(PipelineInner {
                state: PipelineState::New,
                results: VecDeque::new(),
                waiters: VecDeque::new(),
                tasks: Vec::new(),
                retired: false,
            }),
        }
    }
}

enum Reservation {
    /// The budget victim came from this very pipeline: use it as the result
    Reused(Database),
    /// Go ahead and build; close the victim, if any
    Build(Option<(ProviderId, Database)>),
    /// Background build over budget whose oldest victim is already queued
    /// on this pipeline
    Covered,
}

enum Production {
    Ready(Result<Database, ProviderError>),
    Covered,
}

enum Eviction {
    Victim(Arc<Pipeline>, Database),
    /// The oldest queued database belongs to the asking pipeline and was left
    /// in place
    Own,
}

/// Holds one unit of `running_creations` until dropped.
struct CreationSlot<'a>(&'a AtomicUsize);

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clears the pipeline's urgent flag if the urgent task ends without
/// releasing it (cancelled before running, or unwound).
struct UrgentSlot {
    pipeline: Arc<Pipeline>,
    held: bool,
}

impl UrgentSlot {
    /// Clear the flag. Call with the pipeline lock held.
    fn release(&mut self) {
        self.pipeline.urgent_in_flight.store(false, Ordering::Release);
        self.held = false;
    }
}

impl Drop for UrgentSlot {
    fn drop(&mut self) {
        // May run inside pool or pipeline locks; never lock here
        if self.held {
            self.pipeline.urgent_in_flight.store(false, Ordering::Release);
        }
    }
}

#[derive(Default)]
struct Counters {
    served_from_queue: AtomicU64,
    served_from_sibling: AtomicU64,
    served_synchronously: AtomicU64,
    urgent_tasks: AtomicU64,
    background_tasks: AtomicU64,
    evictions: AtomicU64,
    reused_evictions: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view of the engine, for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub pipelines: usize,
    pub queued_instances: usize,
    pub running_creations: usize,
    pub pending_tasks: usize,
    pub served_from_queue: u64,
    pub served_from_sibling: u64,
    pub served_synchronously: u64,
    pub urgent_tasks: u64,
    pub background_tasks: u64,
    pub evictions: u64,
    pub reused_evictions: u64,
    pub failures: u64,
}

/// Shared prefetching engine. One engine can serve any number of providers;
/// the worker pool and the instance budget span all of them.
pub struct PrefetchingEngine {
    config: ProviderConfig,
    pool: WorkerPool,
    pipelines: DashMap<CacheKey, Arc<Pipeline>>,
    /// Serializes instance budget decisions
    budget: Mutex<()>,
    queued_instances: AtomicUsize,
    running_creations: AtomicUsize,
    next_sequence: AtomicU64,
    counters: Counters,
    shut_down: AtomicBool,
}

impl PrefetchingEngine {
    /// Create an engine with its own worker pool.
    ///
    /// Workers start lazily on the first submitted task, so this can run
    /// outside a tokio runtime. Fails with [`ProviderError::InvalidOption`]
    /// when `config` does not validate.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let engine = PrefetchingEngine::new(ProviderConfig::default())?;
    /// let db = engine.create_database(&backend, &preparer).await?;
    /// ```
    pub fn new(config: ProviderConfig) -> Result<Arc<Self>, ProviderError> {
        config.validate()?;
        let pool = WorkerPool::new(config.concurrency, config.thread_name_prefix.clone());
        Ok(Arc::new(Self {
            config,
            pool,
            pipelines: DashMap::new(),
            budget: Mutex::new(()),
            queued_instances: AtomicUsize::new(0),
            running_creations: AtomicUsize::new(0),
            next_sequence: AtomicU64::new(0),
            counters: Counters::default(),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// The validated configuration this engine was built with.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Get a freshly prepared database for `preparer` from `provider`.
    ///
    /// In order of preference the database comes from:
    /// 1. this pipeline's queue of prefetched results,
    /// 2. a queued result of the longest strict-prefix sibling pipeline, with
    ///    the remaining steps applied through [`DatabaseProvider::apply_steps`],
    /// 3. an urgent from-scratch build, at most one per pipeline at a time,
    /// 4. the next background build, for requests arriving while (3) runs.
    ///
    /// Every call also tops up the pipeline's backlog. A queued failure is
    /// returned to exactly one caller.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Precondition`] if the provider identity is empty
    /// - [`ProviderError::Interrupted`] after [`shutdown`](Self::shutdown), or
    ///   when a reset drops this request while it waits
    /// - whatever the provider or a step action returns, including
    ///   [`ProviderError::Backend`] for a provider that panicked
    pub async fn create_database(
        self: &Arc<Self>,
        provider: &Arc<dyn DatabaseProvider>,
        preparer: &Preparer,
    ) -> Result<Database, ProviderError> {
        let id = provider.identity();
        check_identity(&id)?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ProviderError::Interrupted);
        }
        let key = CacheKey::new(id, preparer.clone());
        let pipeline = self.pipeline(&key, provider);
        let requests = pipeline.requests.fetch_add(1, Ordering::AcqRel) + 1;

        let (popped, was_new) = {
            let mut inner = pipeline.inner.lock();
            let was_new = inner.state == PipelineState::New;
            if was_new {
                inner.state = PipelineState::Initializing;
            }
            (self.pop_result(&mut inner), was_new)
        };

        if let Some(result) = popped {
            debug!(pipeline = %key, requests, "Serving prepared database from queue");
            self.counters.served_from_queue.fetch_add(1, Ordering::Relaxed);
            // Replace what was just taken and rebalance the backlog
            self.refill(&pipeline);
            return self.finish(&key, "queue", result.outcome);
        }

        let (receiver, source) = match self.take_sibling(&key) {
            Some((sibling, database)) => {
                debug!(
                    pipeline = %key,
                    sibling = %sibling.key,
                    "Reusing sibling pipeline result"
                );
                self.counters.served_from_sibling.fetch_add(1, Ordering::Relaxed);
                let receiver = self.submit_complement(&pipeline, &sibling, database);
                self.refill(&sibling);
                if was_new {
                    // Seed this pipeline's own backlog from scratch
                    let task = self.submit_background(&pipeline);
                    pipeline.inner.lock().tasks.push(task);
                }
                (receiver, "sibling")
            }
            None => {
                let mut inner = pipeline.inner.lock();
                if let Some(result) = self.pop_result(&mut inner) {
                    drop(inner);
                    self.counters.served_from_queue.fetch_add(1, Ordering::Relaxed);
                    self.refill(&pipeline);
                    return self.finish(&key, "queue", result.outcome);
                }
                let (tx, rx) = oneshot::channel();
                if pipeline.urgent_in_flight.load(Ordering::Acquire) {
                    debug!(pipeline = %key, "Urgent build in flight, waiting for the backlog");
                    inner.waiters.push_back(tx);
                    (rx, "backlog")
                } else {
                    pipeline.urgent_in_flight.store(true, Ordering::Release);
                    self.counters.served_synchronously.fetch_add(1, Ordering::Relaxed);
                    self.submit_urgent(&pipeline, tx);
                    (rx, "scratch")
                }
            }
        };

        self.refill(&pipeline);
        let outcome = receiver.await.map_err(|_| ProviderError::Interrupted)?;
        self.finish(&key, source, outcome)
    }

    /// Resolve once no prefetch work is queued or running.
    pub async fn wait_for_idle(&self) {
        self.pool.wait_idle().await;
    }

    /// Lifecycle state of the `(provider, preparer)` pipeline, or `None` if
    /// no request for it has been seen since the last reset.
    pub fn pipeline_state(&self, provider: &ProviderId, preparer: &Preparer) -> Option<PipelineState> {
        let key = CacheKey::new(provider.clone(), preparer.clone());
        let pipeline = self.pipelines.get(&key)?;
        let state = pipeline.inner.lock().state;
        Some(state)
    }

    /// Ready (or failed) results waiting in a pipeline's queue.
    pub fn queued_results(&self, provider: &ProviderId, preparer: &Preparer) -> usize {
        let key = CacheKey::new(provider.clone(), preparer.clone());
        self.pipelines
            .get(&key)
            .map_or(0, |pipeline| pipeline.inner.lock().results.len())
    }

    /// Snapshot of gauges and counters across every pipeline.
    ///
    /// `queued_instances` and `running_creations` are the two halves of the
    /// instance budget; the counters only ever grow, even across a reset.
    pub fn stats(&self) -> PrefetchStats {
        let c = &self.counters;
        PrefetchStats {
            pipelines: self.pipelines.len(),
            queued_instances: self.queued_instances.load(Ordering::Acquire),
            running_creations: self.running_creations.load(Ordering::Acquire),
            pending_tasks: self.pool.pending(),
            served_from_queue: c.served_from_queue.load(Ordering::Relaxed),
            served_from_sibling: c.served_from_sibling.load(Ordering::Relaxed),
            served_synchronously: c.served_synchronously.load(Ordering::Relaxed),
            urgent_tasks: c.urgent_tasks.load(Ordering::Relaxed),
            background_tasks: c.background_tasks.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            reused_evictions: c.reused_evictions.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Drop every pipeline: cancel queued tasks, interrupt waiting requests
    /// and close every queued database. Counters are kept.
    pub async fn reset(&self) {
        let pipelines: Vec<Arc<Pipeline>> = self.pipelines.iter().map(|e| Arc::clone(e.value())).collect();
        self.pipelines.clear();

        let mut to_close = Vec::new();
        let mut cancelled = 0usize;
        for pipeline in &pipelines {
            let mut inner = pipeline.inner.lock();
            inner.retired = true;
            for task in inner.tasks.drain(..) {
                if task.cancel() {
                    cancelled += 1;
                }
            }
            inner.waiters.clear();
            for result in inner.results.drain(..) {
                if let Ok(database) = result.outcome {
                    self.queued_instances.fetch_sub(1, Ordering::AcqRel);
                    to_close.push(database);
                }
            }
        }
        self.pool.notify_if_idle();
        metrics::set_queued_instances(self.queued_instances.load(Ordering::Acquire));

        let closed = to_close.len();
        for database in to_close {
            if let Err(e) = database.close().await {
                warn!(database = database.name(), error = %e, "Failed to close queued database during reset");
            }
        }
        info!(pipelines = pipelines.len(), cancelled, closed, "Prefetching engine reset");
    }

    /// Stop the worker pool. Queued tasks are cancelled and their waiting
    /// requests fail with [`ProviderError::Interrupted`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.shutdown();
        for entry in self.pipelines.iter() {
            entry.value().inner.lock().waiters.clear();
        }
        info!("Prefetching engine shut down");
    }

    fn pipeline(&self, key: &CacheKey, provider: &Arc<dyn DatabaseProvider>) -> Arc<Pipeline> {
        self.pipelines
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Pipeline::new(key.clone(), Arc::clone(provider))))
            .clone()
    }

    fn finish(
        &self,
        key: &CacheKey,
        source: &str,
        outcome: Result<Database, ProviderError>,
    ) -> Result<Database, ProviderError> {
        match &outcome {
            Ok(database) => {
                debug!(pipeline = %key, source, database = database.name(), "Database served");
                metrics::record_database_served(key.provider.as_str(), source);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(pipeline = %key, source, error = %e, "Database preparation failed");
                metrics::record_failure(key.provider.as_str(), e.kind());
            }
        }
        outcome
    }

    fn pop_result(&self, inner: &mut PipelineInner) -> Option<PreparedResult> {
        let result = inner.results.pop_front()?;
        if result.outcome.is_ok() {
            self.queued_instances.fetch_sub(1, Ordering::AcqRel);
            metrics::set_queued_instances(self.queued_instances.load(Ordering::Acquire));
        }
        Some(result)
    }

    /// Hand `outcome` to the first live waiter, else queue it. Returns a
    /// database the caller must close when the pipeline has been retired.
    fn store(&self, inner: &mut PipelineInner, outcome: Result<Database, ProviderError>) -> Option<Database> {
        let mut outcome = outcome;
        if outcome.is_ok() {
            inner.state = PipelineState::Initialized;
        }
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(outcome) {
                Ok(()) => return None,
                Err(returned) => outcome = returned,
            }
        }
        if inner.retired {
            return outcome.ok();
        }
        if outcome.is_ok() {
            self.queued_instances.fetch_add(1, Ordering::AcqRel);
            metrics::set_queued_instances(self.queued_instances.load(Ordering::Acquire));
        }
        inner.results.push_back(PreparedResult {
            outcome,
            created_at: Instant::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        });
        None
    }

    /// Pop a ready database from the longest strict-prefix sibling pipeline.
    fn take_sibling(&self, key: &CacheKey) -> Option<(Arc<Pipeline>, Database)> {
        let mut siblings: Vec<Arc<Pipeline>> = self
            .pipelines
            .iter()
            .filter(|e| e.key().provider == key.provider && e.key().preparer.is_strict_prefix_of(&key.preparer))
            .map(|e| Arc::clone(e.value()))
            .collect();
        siblings.sort_by_key(|p| std::cmp::Reverse(p.key.preparer.len()));

        siblings.into_iter().find_map(|sibling| {
            let database = {
                let mut inner = sibling.inner.lock();
                let index = inner.results.iter().position(|r| r.outcome.is_ok())?;
                inner.results.remove(index)?.outcome.ok()?
            };
            self.queued_instances.fetch_sub(1, Ordering::AcqRel);
            metrics::set_queued_instances(self.queued_instances.load(Ordering::Acquire));
            Some((sibling, database))
        })
    }

    fn submit_urgent(self: &Arc<Self>, pipeline: &Arc<Pipeline>, reply: Reply) {
        self.counters.urgent_tasks.fetch_add(1, Ordering::Relaxed);
        metrics::record_task_submitted(true);
        let engine = Arc::clone(self);
        let pipeline = Arc::clone(pipeline);
        let mut slot = UrgentSlot {
            pipeline: Arc::clone(&pipeline),
            held: true,
        };
        self.pool.submit(URGENT, move |_| async move {
            let outcome = match engine.produce(&pipeline, true).await {
                Production::Ready(outcome) => outcome,
                // Urgent reservations never report a covered slot
                Production::Covered => return,
            };
            let leftover = {
                let mut inner = pipeline.inner.lock();
                slot.release();
                if outcome.is_ok() {
                    inner.state = PipelineState::Initialized;
                }
                match reply.send(outcome) {
                    Ok(()) => None,
                    // Requester gave up; keep the database for the next one
                    Err(outcome) => engine.store(&mut inner, outcome),
                }
            };
            close_quietly(leftover).await;
            engine.refill(&pipeline);
        });
    }

    fn submit_complement(self: &Arc<Self>, pipeline: &Arc<Pipeline>, sibling: &Pipeline, database: Database) -> oneshot::Receiver<Result<Database, ProviderError>> {
        self.counters.urgent_tasks.fetch_add(1, Ordering::Relaxed);
        metrics::record_task_submitted(true);
        let (reply, receiver) = oneshot::channel();
        let complement = pipeline.key.preparer.suffix(sibling.key.preparer.len());
        let engine = Arc::clone(self);
        let pipeline = Arc::clone(pipeline);
        self.pool.submit(URGENT, move |_| async move {
            let provider = Arc::clone(&pipeline.provider);
            let outcome = isolate(&pipeline.key, async move {
                match provider.apply_steps(&complement, &database).await {
                    Ok(()) => Ok(database),
                    Err(e) => {
                        close_quietly(Some(database)).await;
                        Err(e)
                    }
                }
            })
            .await;
            if let Err(outcome) = reply.send(outcome) {
                let leftover = engine.store(&mut pipeline.inner.lock(), outcome);
                close_quietly(leftover).await;
            }
        });
        receiver
    }

    fn submit_background(self: &Arc<Self>, pipeline: &Arc<Pipeline>) -> Arc<TaskHandle> {
        self.counters.background_tasks.fetch_add(1, Ordering::Relaxed);
        metrics::record_task_submitted(false);
        let engine = Arc::clone(self);
        let pipeline = Arc::clone(pipeline);
        self.pool.submit(LOWEST, move |task_id| async move {
            let outcome = match engine.produce(&pipeline, false).await {
                Production::Ready(outcome) => outcome,
                Production::Covered => {
                    // No refill: asking again would find the same queued database
                    pipeline.inner.lock().tasks.retain(|t| t.id() != task_id);
                    return;
                }
            };
            let leftover = {
                let mut inner = pipeline.inner.lock();
                inner.tasks.retain(|t| t.id() != task_id);
                engine.store(&mut inner, outcome)
            };
            close_quietly(leftover).await;
            engine.refill(&pipeline);
        })
    }

    /// Top the backlog up to its target and re-prioritize queued tasks.
    fn refill(self: &Arc<Self>, pipeline: &Arc<Pipeline>) {
        let mut inner = pipeline.inner.lock();
        if inner.retired {
            return;
        }
        inner.tasks.retain(|t| !t.is_finished());

        let requests = usize::try_from(pipeline.requests.load(Ordering::Acquire)).unwrap_or(usize::MAX);
        let cache_size = self.config.pipeline_cache_size;
        let waiting = inner.waiters.len();
        let target = cache_size.min(requests) + waiting;
        let mut backlog = inner.results.len() + inner.tasks.len();
        while backlog < target {
            let task = self.submit_background(pipeline);
            inner.tasks.push(task);
            backlog += 1;
        }

        let queued = inner.results.len();
        let limit = cache_size + waiting;
        for (i, task) in inner.tasks.iter().filter(|t| t.is_pending()).enumerate() {
            let position = queued + i;
            let priority = if i < waiting {
                // Someone is already blocked on this one
                URGENT + 1
            } else if position >= limit {
                LOWEST
            } else {
                backlog_priority(requests, position)
            };
            self.pool.reprioritize(task, priority);
        }
    }

    /// Build a database for `pipeline` from scratch, within the instance budget.
    async fn produce(&self, pipeline: &Arc<Pipeline>, urgent: bool) -> Production {
        let victim = match self.reserve(pipeline, urgent) {
            Reservation::Reused(database) => {
                debug!(pipeline = %pipeline.key, "Reusing own queued database instead of evicting it");
                return Production::Ready(Ok(database));
            }
            Reservation::Covered => {
                debug!(pipeline = %pipeline.key, "Instance budget full, backlog slot already queued");
                return Production::Covered;
            }
            Reservation::Build(victim) => victim,
        };
        let _slot = CreationSlot(&self.running_creations);

        if let Some((owner, victim)) = victim {
            debug!(owner = %owner, database = victim.name(), "Instance budget exceeded, evicting oldest queued database");
            metrics::record_instance_evicted(owner.as_str());
            if let Err(e) = victim.close().await {
                warn!(database = victim.name(), error = %e, "Failed to close evicted database");
            }
        }

        let started = Instant::now();
        let provider = Arc::clone(&pipeline.provider);
        let preparer = pipeline.key.preparer.clone();
        let outcome = isolate(&pipeline.key, async move { provider.create_database(&preparer).await }).await;
        metrics::record_creation_latency(pipeline.key.provider.as_str(), "scratch", started.elapsed());
        Production::Ready(outcome)
    }

    fn reserve(&self, pipeline: &Arc<Pipeline>, urgent: bool) -> Reservation {
        let _guard = self.budget.lock();
        let live = self.queued_instances.load(Ordering::Acquire) + self.running_creations.load(Ordering::Acquire);
        let mut victim = None;
        if live >= self.config.max_instances {
            match self.evict_oldest(pipeline, urgent) {
                Some(Eviction::Own) => return Reservation::Covered,
                Some(Eviction::Victim(owner, database)) => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    if Arc::ptr_eq(&owner, pipeline) {
                        self.counters.reused_evictions.fetch_add(1, Ordering::Relaxed);
                        return Reservation::Reused(database);
                    }
                    victim = Some((owner.key.provider.clone(), database));
                }
                None => {}
            }
        }
        self.running_creations.fetch_add(1, Ordering::AcqRel);
        Reservation::Build(victim)
    }

    /// Remove the oldest queued ready database across all pipelines. When it
    /// belongs to `pipeline` and `take_own` is false it stays queued.
    fn evict_oldest(&self, pipeline: &Arc<Pipeline>, take_own: bool) -> Option<Eviction> {
        let pipelines: Vec<Arc<Pipeline>> = self.pipelines.iter().map(|e| Arc::clone(e.value())).collect();
        // A concurrent pop can steal the candidate; look again a few times
        for _ in 0..3 {
            let (_, sequence, owner) = pipelines
                .iter()
                .filter_map(|pipeline| {
                    let inner = pipeline.inner.lock();
                    inner
                        .results
                        .iter()
                        .find(|r| r.outcome.is_ok())
                        .map(|r| (r.created_at, r.sequence, Arc::clone(pipeline)))
                })
                .min_by_key(|(created_at, sequence, _)| (*created_at, *sequence))?;
            if !take_own && Arc::ptr_eq(&owner, pipeline) {
                return Some(Eviction::Own);
            }

            let database = {
                let mut inner = owner.inner.lock();
                let index = inner.results.iter().position(|r| r.sequence == sequence);
                index.and_then(|i| inner.results.remove(i)).and_then(|r| r.outcome.ok())
            };
            if let Some(database) = database {
                self.queued_instances.fetch_sub(1, Ordering::AcqRel);
                metrics::set_queued_instances(self.queued_instances.load(Ordering::Acquire));
                return Some(Eviction::Victim(owner, database));
            }
        }
        None
    }
}

/// Run backend work on its own task so a panic fails this build only.
async fn isolate<F>(key: &CacheKey, work: F) -> Result<Database, ProviderError>
where
    F: Future<Output = Result<Database, ProviderError>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            error!(pipeline = %key, "Provider panicked while preparing a database");
            Err(ProviderError::backend(format!("provider {} panicked", key.provider)))
        }
        Err(_) => Err(ProviderError::Interrupted),
    }
}

/// Later backlog positions get progressively lower priority; busier
/// pipelines outrank quieter ones.
fn backlog_priority(requests: usize, position: usize) -> i64 {
    let share = requests / (position + 1);
    i64::try_from(share).map_or(URGENT + 1, |share| -share)
}

async fn close_quietly(database: Option<Database>) {
    if let Some(database) = database {
        if let Err(e) = database.close().await {
            warn!(database = database.name(), error = %e, "Failed to close orphaned database");
        }
    }
}

/// [`DatabaseProvider`] that serves `inner`'s databases through a
/// [`PrefetchingEngine`].
pub struct PrefetchingProvider {
    engine: Arc<PrefetchingEngine>,
    inner: Arc<dyn DatabaseProvider>,
}

impl PrefetchingProvider {
    pub fn new(engine: Arc<PrefetchingEngine>, inner: Arc<dyn DatabaseProvider>) -> Self {
        Self { engine, inner }
    }

    pub fn engine(&self) -> &Arc<PrefetchingEngine> {
        &self.engine
    }
}

#[async_trait]
impl DatabaseProvider for PrefetchingProvider {
    fn identity(&self) -> ProviderId {
        self.inner.identity()
    }

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError> {
        self.engine.create_database(&self.inner, preparer).await
    }

    async fn apply_steps(&self, steps: &Preparer, database: &Database) -> Result<(), ProviderError> {
        self.inner.apply_steps(steps, database).await
    }
}

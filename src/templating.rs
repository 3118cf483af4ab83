// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Templating engine.
//!
//! Serves a preparer by cloning the template keyed by its longest prefix and
//! applying the remaining steps to the clone. A preparer earns its own
//! template once its cost exceeds `duration_threshold`; when the provider
//! already holds `max_template_count` templates, the cheapest loaded one is
//! evicted, but only if it is cheaper than the candidate by more than the
//! threshold.
//!
//! Cost is the cumulative load time observed so far, raised to the sum of the
//! steps' `estimated_duration` hints when those promise more. A preparer
//! hinted as expensive is therefore templated on its first request.
//!
//! # Template lifecycle
//!
//! ```text
//! promoted ──► loading (shared OnceCell) ──► loaded ──► evicted / reset ──► closed
//!                   │
//!                   └─ failure: memoized for every waiter, entry dropped
//! ```
//!
//! Clones hold the template's read lock and closing takes the write lock, so
//! a template is never closed under an in-flight clone. A clone that finds the
//! template already closed builds the full preparer on the backend instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::database::Database;
use crate::error::ProviderError;
use crate::metrics;
use crate::preparer::Preparer;
use crate::provider::{check_identity, CacheKey, DatabaseProvider, ProviderId, TemplateHandle, TemplatingBackend};

/// Cumulative backend time observed for one `(provider, preparer)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub total: Duration,
    pub loads: u64,
}

/// Snapshot of a template for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub preparer: Preparer,
    pub loaded: bool,
    pub load_time: Duration,
}

struct Template {
    key: CacheKey,
    handle: OnceCell<Result<Arc<dyn TemplateHandle>, ProviderError>>,
    closed: RwLock<bool>,
}

impl Template {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            handle: OnceCell::new(),
            closed: RwLock::new(false),
        }
    }

    fn is_loaded(&self) -> bool {
        matches!(self.handle.get(), Some(Ok(_)))
    }

    fn has_failed(&self) -> bool {
        matches!(self.handle.get(), Some(Err(_)))
    }

    /// Load the template if needed and clone it, all under the read lock.
    async fn clone_database<B>(&self, backend: &B) -> Result<Database, ProviderError>
    where
        B: TemplatingBackend + ?Sized,
    {
        let closed = self.closed.read().await;
        if *closed {
            return Err(ProviderError::TemplateClosed(self.key.to_string()));
        }
        let handle = self
            .handle
            .get_or_init(|| async {
                let started = Instant::now();
                let loaded = backend.create_template(&self.key.preparer).await;
                match &loaded {
                    Ok(handle) => {
                        info!(
                            template = handle.name(),
                            preparer = %self.key.preparer,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Template created"
                        );
                        metrics::record_template_created(self.key.provider.as_str());
                    }
                    Err(e) => warn!(preparer = %self.key.preparer, error = %e, "Template creation failed"),
                }
                loaded.map(Arc::from)
            })
            .await
            .clone()?;
        handle.clone_database().await
    }

    async fn close(&self) -> Result<(), ProviderError> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        match self.handle.get() {
            Some(Ok(handle)) => {
                debug!(template = handle.name(), "Closing template");
                handle.close().await
            }
            _ => Ok(()),
        }
    }
}

/// Shared template cache. Templates are partitioned by provider identity, and
/// `max_template_count` applies per provider.
pub struct TemplatingEngine {
    duration_threshold: Duration,
    max_template_count: usize,
    templates: DashMap<CacheKey, Arc<Template>>,
    stats: DashMap<CacheKey, LoadStats>,
    /// Per-provider lock around promotion and eviction
    admission: DashMap<ProviderId, Arc<Mutex<()>>>,
}

impl TemplatingEngine {
    /// Create an empty template cache using `duration_threshold` and
    /// `max_template_count` from `config`.
    pub fn new(config: &ProviderConfig) -> Arc<Self> {
        Arc::new(Self {
            duration_threshold: config.duration_threshold,
            max_template_count: config.max_template_count,
            templates: DashMap::new(),
            stats: DashMap::new(),
            admission: DashMap::new(),
        })
    }

    /// Build a database for `preparer`, reusing or promoting templates.
    ///
    /// Clones the template of the longest prefix of `preparer` and applies
    /// the remaining steps through [`DatabaseProvider::apply_steps`]. If no
    /// template covers the whole preparer and its cost now exceeds the
    /// threshold, it is promoted first (possibly evicting a cheaper one) and
    /// served from its own template. Without any usable template the backend
    /// builds from scratch. Successful calls add their elapsed time to the
    /// preparer's [`LoadStats`].
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Precondition`] if the backend identity is empty
    /// - a template load failure, reported to every request waiting on it
    /// - whatever the backend returns for the clone, the complementary steps
    ///   or the direct build
    pub async fn create_database<B>(&self, backend: &B, preparer: &Preparer) -> Result<Database, ProviderError>
    where
        B: TemplatingBackend + ?Sized,
    {
        let provider = backend.identity();
        check_identity(&provider)?;
        let key = CacheKey::new(provider, preparer.clone());

        let mut found = self.find_template(&key);
        if found.as_ref().map_or(true, |(_, len)| *len < preparer.len()) {
            if let Some(promoted) = self.promote(&key).await {
                found = Some((promoted, preparer.len()));
            }
        }

        let started = Instant::now();
        let outcome = match found {
            Some((template, prefix_len)) => self.build_from_template(backend, &template, preparer, prefix_len).await,
            None => backend.create_database(preparer).await,
        };
        if outcome.is_ok() {
            self.record_load(&key, started.elapsed());
        }
        outcome
    }

    /// Cumulative load time recorded for `(provider, preparer)`.
    pub fn load_stats(&self, provider: &ProviderId, preparer: &Preparer) -> Option<LoadStats> {
        let key = CacheKey::new(provider.clone(), preparer.clone());
        self.stats.get(&key).map(|s| *s)
    }

    /// Templates currently held for `provider`.
    pub fn templates(&self, provider: &ProviderId) -> Vec<TemplateInfo> {
        self.templates
            .iter()
            .filter(|e| &e.key().provider == provider)
            .map(|e| TemplateInfo {
                preparer: e.key().preparer.clone(),
                loaded: e.value().is_loaded(),
                load_time: self.load_time(e.key()),
            })
            .collect()
    }

    /// Close every template and forget all load statistics.
    pub async fn reset(&self) {
        let templates: Vec<Arc<Template>> = self.templates.iter().map(|e| Arc::clone(e.value())).collect();
        self.templates.clear();
        self.stats.clear();
        for template in &templates {
            if let Err(e) = template.close().await {
                warn!(preparer = %template.key.preparer, error = %e, "Failed to close template during reset");
            }
        }
        info!(closed = templates.len(), "Templating engine reset");
    }

    /// Longest-prefix template lookup, from the full preparer down to the
    /// empty one.
    fn find_template(&self, key: &CacheKey) -> Option<(Arc<Template>, usize)> {
        (0..=key.preparer.len()).rev().find_map(|len| {
            let prefix = CacheKey::new(key.provider.clone(), key.preparer.prefix(len));
            self.templates.get(&prefix).map(|t| (Arc::clone(t.value()), len))
        })
    }

    async fn build_from_template<B>(
        &self,
        backend: &B,
        template: &Arc<Template>,
        preparer: &Preparer,
        prefix_len: usize,
    ) -> Result<Database, ProviderError>
    where
        B: TemplatingBackend + ?Sized,
    {
        let database = match template.clone_database(backend).await {
            Ok(database) => database,
            Err(ProviderError::TemplateClosed(name)) => {
                debug!(template = %name, "Template closed under us, building directly");
                metrics::record_template_fallback(template.key.provider.as_str());
                self.templates.remove_if(&template.key, |_, t| Arc::ptr_eq(t, template));
                return backend.create_database(preparer).await;
            }
            Err(e) => {
                if template.has_failed() {
                    // Keep the failure for current waiters, let later calls decide afresh
                    self.templates.remove_if(&template.key, |_, t| Arc::ptr_eq(t, template));
                }
                return Err(e);
            }
        };

        let complement = preparer.suffix(prefix_len);
        if complement.is_empty() {
            return Ok(database);
        }
        debug!(
            database = database.name(),
            remaining = complement.len(),
            "Applying complementary steps to template clone"
        );
        if let Err(e) = backend.apply_steps(&complement, &database).await {
            if let Err(close_err) = database.close().await {
                warn!(database = database.name(), error = %close_err, "Failed to close partially prepared clone");
            }
            return Err(e);
        }
        Ok(database)
    }

    /// Decide whether `key` deserves a template. Returns the (possibly still
    /// loading) template to clone from.
    async fn promote(&self, key: &CacheKey) -> Option<Arc<Template>> {
        let cost = self.cost(key);
        if cost <= self.duration_threshold {
            return None;
        }

        let lock = Arc::clone(self.admission.entry(key.provider.clone()).or_default().value());
        let (template, victim) = {
            let _guard = lock.lock();
            if let Some(existing) = self.templates.get(key) {
                // Promoted concurrently
                return Some(Arc::clone(existing.value()));
            }

            let owned: Vec<Arc<Template>> = self
                .templates
                .iter()
                .filter(|e| e.key().provider == key.provider)
                .map(|e| Arc::clone(e.value()))
                .collect();

            let victim = if owned.len() >= self.max_template_count {
                let cheapest = owned
                    .into_iter()
                    .filter(|t| t.is_loaded())
                    .map(|t| (self.cost(&t.key), t))
                    .min_by_key(|(time, _)| *time);
                match cheapest {
                    Some((time, t)) if time.saturating_add(self.duration_threshold) < cost => {
                        self.templates.remove(&t.key);
                        Some(t)
                    }
                    _ => {
                        debug!(preparer = %key.preparer, "Template cache full, promotion not justified");
                        return None;
                    }
                }
            } else {
                None
            };

            let template = Arc::new(Template::new(key.clone()));
            self.templates.insert(key.clone(), Arc::clone(&template));
            (template, victim)
        };

        if let Some(victim) = victim {
            info!(
                evicted = %victim.key.preparer,
                promoted = %key.preparer,
                "Evicting template for a costlier preparer"
            );
            metrics::record_template_evicted(key.provider.as_str());
            if let Err(e) = victim.close().await {
                warn!(preparer = %victim.key.preparer, error = %e, "Failed to close evicted template");
            }
        }
        debug!(preparer = %key.preparer, cost_ms = cost.as_millis() as u64, "Promoting preparer to template");
        Some(template)
    }

    fn load_time(&self, key: &CacheKey) -> Duration {
        self.stats.get(key).map_or(Duration::ZERO, |s| s.total)
    }

    /// Admission cost: observed load time, or the steps' own estimate when
    /// that is higher.
    fn cost(&self, key: &CacheKey) -> Duration {
        self.load_time(key).max(key.preparer.estimated_duration())
    }

    fn record_load(&self, key: &CacheKey, elapsed: Duration) {
        let mut stats = self.stats.entry(key.clone()).or_default();
        stats.total += elapsed;
        stats.loads += 1;
    }
}

/// [`DatabaseProvider`] that routes a templating backend through a
/// [`TemplatingEngine`].
pub struct TemplatingProvider<B> {
    engine: Arc<TemplatingEngine>,
    backend: Arc<B>,
}

impl<B: TemplatingBackend> TemplatingProvider<B> {
    pub fn new(engine: Arc<TemplatingEngine>, backend: Arc<B>) -> Self {
        Self { engine, backend }
    }

    pub fn engine(&self) -> &Arc<TemplatingEngine> {
        &self.engine
    }
}

#[async_trait]
impl<B: TemplatingBackend + 'static> DatabaseProvider for TemplatingProvider<B> {
    fn identity(&self) -> ProviderId {
        self.backend.identity()
    }

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError> {
        self.engine.create_database(self.backend.as_ref(), preparer).await
    }

    async fn apply_steps(&self, steps: &Preparer, database: &Database) -> Result<(), ProviderError> {
        self.backend.apply_steps(steps, database).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preparer::Step;
    use crate::testing::{MockBackend, MockOptions};

    fn engine(threshold_ms: u64, max_templates: usize) -> Arc<TemplatingEngine> {
        TemplatingEngine::new(&ProviderConfig {
            duration_threshold: Duration::from_millis(threshold_ms),
            max_template_count: max_templates,
            ..ProviderConfig::default()
        })
    }

    fn slow_backend(delay_ms: u64) -> Arc<MockBackend> {
        MockBackend::with_options(
            "pg",
            MockOptions {
                delay: Duration::from_millis(delay_ms),
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotes_once_threshold_exceeded() {
        let engine = engine(50, 10);
        let backend = slow_backend(20);
        let preparer = Preparer::from(Step::migrate("foo"));

        for _ in 0..6 {
            engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        }

        // 20 + 20 + 20 = 60ms > 50ms: the fourth call promotes
        assert_eq!(backend.templates_created(), 1);
        assert_eq!(backend.created(), 3);
        assert_eq!(backend.clones(), 3);
        let templates = engine.templates(&backend.identity());
        assert_eq!(templates.len(), 1);
        assert!(templates[0].loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefix_template_plus_complement() {
        let engine = engine(10, 10);
        let backend = slow_backend(20);
        let base = Preparer::from(Step::migrate("foo"));
        let seeded = base.then(&Preparer::from(Step::seed("foo", 10)));

        engine.create_database(backend.as_ref(), &base).await.unwrap();
        engine.create_database(backend.as_ref(), &base).await.unwrap();
        assert_eq!(backend.templates_created(), 1);

        // No stats for `seeded` yet: clone the base template, apply the seed step
        let db = engine.create_database(backend.as_ref(), &seeded).await.unwrap();
        assert!(db.name().starts_with("pg-clone-"));
        assert_eq!(backend.templates_created(), 1);
        assert_eq!(backend.created(), 1);
        assert_eq!(backend.steps_applied(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_duration_promotes_before_any_load() {
        let engine = engine(50, 10);
        let backend = slow_backend(1);
        let hinted = Preparer::from(Step::migrate("foo").with_estimated_duration(Duration::from_secs(1)));

        let db = engine.create_database(backend.as_ref(), &hinted).await.unwrap();

        assert!(db.name().starts_with("pg-clone-"));
        assert_eq!(backend.templates_created(), 1);
        assert_eq!(backend.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_duration_counts_against_eviction() {
        let engine = engine(10, 1);
        let backend = slow_backend(20);
        let hinted = Preparer::from(Step::migrate("foo").with_estimated_duration(Duration::from_secs(1)));
        let observed = Preparer::from_steps([Step::migrate("bar"), Step::seed("bar", 1000)]);

        engine.create_database(backend.as_ref(), &hinted).await.unwrap();
        for _ in 0..5 {
            engine.create_database(backend.as_ref(), &observed).await.unwrap();
        }

        // 100ms observed never beats the 1s hint of the resident template
        assert_eq!(backend.templates_created(), 1);
        assert_eq!(engine.templates(&backend.identity())[0].preparer, hinted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_waits_for_in_flight_clone() {
        let engine = engine(10, 1);
        let backend = MockBackend::with_options(
            "pg",
            MockOptions {
                delay: Duration::from_millis(20),
                clone_delay: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let cheap = Preparer::from(Step::migrate("foo"));
        let costly = Preparer::from(Step::migrate("bar").with_estimated_duration(Duration::from_secs(1)));

        engine.create_database(backend.as_ref(), &cheap).await.unwrap();
        engine.create_database(backend.as_ref(), &cheap).await.unwrap();
        assert_eq!(backend.templates_created(), 1);

        let cloning = {
            let engine = Arc::clone(&engine);
            let backend = Arc::clone(&backend);
            let cheap = cheap.clone();
            tokio::spawn(async move { engine.create_database(backend.as_ref(), &cheap).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Evicts the cheap template while the clone above is still running
        engine.create_database(backend.as_ref(), &costly).await.unwrap();
        let cloned = cloning.await.unwrap().unwrap();

        assert_eq!(cloned.name(), "pg-clone-2");
        let events = backend.events();
        let clone_at = events.iter().position(|e| e == "clone:pg-clone-2").unwrap();
        let close_at = events.iter().position(|e| e == "close:pg-template-1").unwrap();
        assert!(clone_at < close_at, "template closed under a running clone: {events:?}");
        assert_eq!(engine.templates(&backend.identity())[0].preparer, costly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_cheaper_template() {
        let engine = engine(10, 1);
        let backend = slow_backend(20);
        let cheap = Preparer::from(Step::migrate("foo"));
        let costly = Preparer::from_steps([Step::migrate("bar"), Step::seed("bar", 1000)]);

        // cheap: 20ms > 10ms after one load, promoted on the second call
        engine.create_database(backend.as_ref(), &cheap).await.unwrap();
        engine.create_database(backend.as_ref(), &cheap).await.unwrap();
        assert_eq!(backend.templates_created(), 1);

        // costly must beat cheap's load time by more than the threshold
        for _ in 0..3 {
            engine.create_database(backend.as_ref(), &costly).await.unwrap();
        }
        assert_eq!(backend.templates_created(), 1, "40ms is not yet costlier than 40ms + 10ms");

        // 60ms > 40ms + 10ms
        engine.create_database(backend.as_ref(), &costly).await.unwrap();
        assert_eq!(backend.templates_created(), 2);
        assert_eq!(backend.templates_closed(), 1);
        let templates = engine.templates(&backend.identity());
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].preparer, costly);
    }

    #[tokio::test]
    async fn test_zero_max_templates_never_promotes() {
        let engine = engine(0, 0);
        let backend = slow_backend(1);
        let preparer = Preparer::from(Step::migrate("foo"));

        for _ in 0..3 {
            engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        }
        assert_eq!(backend.templates_created(), 0);
        assert_eq!(backend.created(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_failure_is_reported_and_forgotten() {
        let engine = engine(10, 10);
        let backend = MockBackend::with_options(
            "pg",
            MockOptions {
                delay: Duration::from_millis(20),
                fail_templates: true,
                ..Default::default()
            },
        );
        let preparer = Preparer::from(Step::migrate("foo"));

        engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        let err = engine.create_database(backend.as_ref(), &preparer).await.unwrap_err();
        assert!(matches!(err, ProviderError::Backend(_)));
        assert!(engine.templates(&backend.identity()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_template_falls_back_to_backend() {
        let engine = engine(10, 10);
        let backend = slow_backend(20);
        let preparer = Preparer::from(Step::migrate("foo"));

        engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        let (template, _) = engine.find_template(&CacheKey::new(backend.identity(), preparer.clone())).unwrap();
        template.close().await.unwrap();

        let db = engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        assert!(!db.name().contains("clone"));
        assert_eq!(backend.created(), 2);
    }

    #[tokio::test]
    async fn test_reset_closes_templates_and_forgets_stats() {
        let engine = engine(0, 10);
        let backend = slow_backend(1);
        let preparer = Preparer::from(Step::migrate("foo"));

        engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        engine.create_database(backend.as_ref(), &preparer).await.unwrap();
        assert_eq!(backend.templates_created(), 1);

        engine.reset().await;

        assert_eq!(backend.templates_closed(), 1);
        assert!(engine.templates(&backend.identity()).is_empty());
        assert!(engine.load_stats(&backend.identity(), &preparer).is_none());
    }
}

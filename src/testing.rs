// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory backend for unit tests.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::database::{Database, DatabaseHandle};
use crate::error::ProviderError;
use crate::preparer::Preparer;
use crate::provider::{DatabaseProvider, ProviderId, TemplateHandle, TemplatingBackend};

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Simulated backend work per creation and per template
    pub delay: Duration,
    /// Creations numbered `>= fail_from` (1-based) fail
    pub fail_from: Option<usize>,
    /// Creation number (1-based) that panics instead of returning
    pub panic_on: Option<usize>,
    pub fail_templates: bool,
    /// Simulated work per template clone
    pub clone_delay: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    clones: AtomicUsize,
    closed: AtomicUsize,
    templates_created: AtomicUsize,
    templates_closed: AtomicUsize,
    steps_applied: AtomicUsize,
    closed_names: Mutex<Vec<String>>,
    /// Clone completions and template closes, in order
    events: Mutex<Vec<String>>,
}

#[derive(Debug)]
pub struct MockDatabase {
    name: String,
    counters: Arc<Counters>,
}

#[async_trait]
impl DatabaseHandle for MockDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.closed_names.lock().push(self.name.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct MockTemplate {
    name: String,
    backend: ProviderId,
    clone_delay: Duration,
    counters: Arc<Counters>,
}

#[async_trait]
impl TemplateHandle for MockTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn clone_database(&self) -> Result<Database, ProviderError> {
        let n = self.counters.clones.fetch_add(1, Ordering::SeqCst) + 1;
        pause(self.clone_delay).await;
        let name = format!("{}-clone-{n}", self.backend);
        self.counters.events.lock().push(format!("clone:{name}"));
        Ok(Database::new(MockDatabase {
            name,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.counters.templates_closed.fetch_add(1, Ordering::SeqCst);
        self.counters.events.lock().push(format!("close:{}", self.name));
        Ok(())
    }
}

pub struct MockBackend {
    id: ProviderId,
    options: MockOptions,
    counters: Arc<Counters>,
}

impl MockBackend {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_options(id, MockOptions::default())
    }

    pub fn with_options(id: &str, options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            id: ProviderId::new(id),
            options,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Calls to `create_database`, failed ones included.
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn clones(&self) -> usize {
        self.counters.clones.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn closed_names(&self) -> Vec<String> {
        self.counters.closed_names.lock().clone()
    }

    pub fn templates_created(&self) -> usize {
        self.counters.templates_created.load(Ordering::SeqCst)
    }

    pub fn templates_closed(&self) -> usize {
        self.counters.templates_closed.load(Ordering::SeqCst)
    }

    /// Steps applied on top of reused databases.
    pub fn steps_applied(&self) -> usize {
        self.counters.steps_applied.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.counters.events.lock().clone()
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl DatabaseProvider for MockBackend {
    fn identity(&self) -> ProviderId {
        self.id.clone()
    }

    async fn create_database(&self, _preparer: &Preparer) -> Result<Database, ProviderError> {
        let n = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        pause(self.options.delay).await;
        if self.options.panic_on == Some(n) {
            panic!("creation {n} panicked");
        }
        if self.options.fail_from.is_some_and(|from| n >= from) {
            return Err(ProviderError::backend(format!("creation {n} refused")));
        }
        Ok(Database::new(MockDatabase {
            name: format!("{}-{n}", self.id),
            counters: Arc::clone(&self.counters),
        }))
    }

    /// Descriptor steps are interpreted here, as a real backend would.
    async fn apply_steps(&self, steps: &Preparer, _database: &Database) -> Result<(), ProviderError> {
        self.counters.steps_applied.fetch_add(steps.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TemplatingBackend for MockBackend {
    async fn create_template(&self, _preparer: &Preparer) -> Result<Box<dyn TemplateHandle>, ProviderError> {
        pause(self.options.delay).await;
        if self.options.fail_templates {
            return Err(ProviderError::backend("template refused"));
        }
        let n = self.counters.templates_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockTemplate {
            name: format!("{}-template-{n}", self.id),
            backend: self.id.clone(),
            clone_delay: self.options.clone_delay,
            counters: Arc::clone(&self.counters),
        }))
    }
}

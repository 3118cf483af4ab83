//! Shared test backends.
//!
//! `TestBackend` is an in-memory provider that actually runs the preparer's
//! step actions against each database it creates, so tests can inspect what
//! ended up applied. Failures are injected by call number, like a flaky
//! container would produce them.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use prepdb::{
    Database, DatabaseHandle, DatabaseProvider, Preparer, ProviderError, ProviderId, Step, StepAction,
    TemplateHandle, TemplatingBackend,
};

#[derive(Debug, Default)]
struct Shared {
    closed: Mutex<Vec<String>>,
    templates_created: AtomicU64,
    templates_closed: AtomicU64,
    clones: AtomicU64,
}

/// A database that remembers which steps were applied to it.
#[derive(Debug)]
pub struct TestDatabase {
    name: String,
    applied: Mutex<Vec<String>>,
    shared: Arc<Shared>,
}

impl TestDatabase {
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl DatabaseHandle for TestDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.shared.closed.lock().push(self.name.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Step action that appends the step to the database's history.
pub struct Record;

#[async_trait]
impl StepAction for Record {
    async fn apply(&self, step: &Step, database: &Database) -> Result<(), ProviderError> {
        let db = database
            .downcast_ref::<TestDatabase>()
            .ok_or_else(|| ProviderError::Precondition("not a test database".to_string()))?;
        db.applied.lock().push(step.to_string());
        Ok(())
    }
}

/// Step action that always fails.
pub struct Explode;

#[async_trait]
impl StepAction for Explode {
    async fn apply(&self, step: &Step, _database: &Database) -> Result<(), ProviderError> {
        Err(ProviderError::backend(format!("{step} exploded")))
    }
}

pub fn recorded(step: Step) -> Step {
    step.with_action(Arc::new(Record))
}

/// History of a database created by a [`TestBackend`].
pub fn applied(database: &Database) -> Vec<String> {
    database.downcast_ref::<TestDatabase>().map(TestDatabase::applied).unwrap_or_default()
}

#[derive(Debug)]
struct TestTemplate {
    name: String,
    backend: ProviderId,
    applied: Vec<String>,
    shared: Arc<Shared>,
}

#[async_trait]
impl TemplateHandle for TestTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn clone_database(&self) -> Result<Database, ProviderError> {
        let n = self.shared.clones.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Database::new(TestDatabase {
            name: format!("{}-clone-{n}", self.backend),
            applied: Mutex::new(self.applied.clone()),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.shared.templates_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestBackend {
    id: ProviderId,
    delay: Duration,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    shared: Arc<Shared>,
}

impl TestBackend {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, Duration::ZERO, Vec::new())
    }

    pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Self::build(id, delay, Vec::new())
    }

    pub fn failing_on(id: &str, fail_on_calls: Vec<u64>) -> Arc<Self> {
        Self::build(id, Duration::ZERO, fail_on_calls)
    }

    fn build(id: &str, delay: Duration, fail_on_calls: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            id: ProviderId::new(id),
            delay,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<String> {
        self.shared.closed.lock().clone()
    }

    pub fn templates_created(&self) -> u64 {
        self.shared.templates_created.load(Ordering::SeqCst)
    }

    pub fn templates_closed(&self) -> u64 {
        self.shared.templates_closed.load(Ordering::SeqCst)
    }

    pub fn clones(&self) -> u64 {
        self.shared.clones.load(Ordering::SeqCst)
    }

    async fn work(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl DatabaseProvider for TestBackend {
    fn identity(&self) -> ProviderId {
        self.id.clone()
    }

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.work().await;
        if self.fail_on_calls.contains(&n) {
            return Err(ProviderError::backend(format!("container {n} failed to start")));
        }
        let database = Database::new(TestDatabase {
            name: format!("{}-{n}", self.id),
            applied: Mutex::new(Vec::new()),
            shared: Arc::clone(&self.shared),
        });
        if let Err(e) = preparer.apply(&database).await {
            database.close().await?;
            return Err(e);
        }
        Ok(database)
    }
}

#[async_trait]
impl TemplatingBackend for TestBackend {
    async fn create_template(&self, preparer: &Preparer) -> Result<Box<dyn TemplateHandle>, ProviderError> {
        let scratch = self.create_database(preparer).await?;
        let applied = applied(&scratch);
        scratch.close().await?;
        let n = self.shared.templates_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(TestTemplate {
            name: format!("{}-template-{n}", self.id),
            backend: self.id.clone(),
            applied,
            shared: Arc::clone(&self.shared),
        }))
    }
}

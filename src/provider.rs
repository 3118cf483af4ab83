// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The provider boundary.
//!
//! Backends implement [`DatabaseProvider`] (and [`TemplatingBackend`] when they
//! can snapshot a prepared database). The engines in this crate implement
//! [`DatabaseProvider`] themselves, so they stack as decorators:
//!
//! ```text
//! OptimizingProvider → PrefetchingProvider → TemplatingProvider → backend
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::database::Database;
use crate::error::ProviderError;
use crate::preparer::Preparer;

/// Stable, comparable identity of a provider. Part of every cache key, so two
/// providers with the same identity must produce interchangeable databases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(provider identity, preparer)`: the key of a prefetch pipeline, a template
/// and a load statistic alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider: ProviderId,
    pub preparer: Preparer,
}

impl CacheKey {
    pub fn new(provider: ProviderId, preparer: Preparer) -> Self {
        Self { provider, preparer }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.provider, self.preparer)
    }
}

/// Turns a preparer into a live, isolated database.
#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    fn identity(&self) -> ProviderId;

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError>;

    /// Apply `steps` on top of a database this provider produced for a prefix
    /// of the full preparer (a sibling result or a template clone).
    ///
    /// The default runs each step's action and fails on descriptor-only
    /// steps. Backends that interpret descriptors in `create_database` must
    /// override this so reused databases end up identical to fresh ones.
    async fn apply_steps(&self, steps: &Preparer, database: &Database) -> Result<(), ProviderError> {
        steps.apply(database).await
    }
}

#[async_trait]
impl<P: DatabaseProvider + ?Sized> DatabaseProvider for Arc<P> {
    fn identity(&self) -> ProviderId {
        (**self).identity()
    }

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError> {
        (**self).create_database(preparer).await
    }

    async fn apply_steps(&self, steps: &Preparer, database: &Database) -> Result<(), ProviderError> {
        (**self).apply_steps(steps, database).await
    }
}

/// A durable snapshot of a prepared database.
#[async_trait]
pub trait TemplateHandle: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Produce a fresh database carrying the template's state.
    async fn clone_database(&self) -> Result<Database, ProviderError>;

    /// Release the template's backend resources.
    async fn close(&self) -> Result<(), ProviderError>;
}

/// A backend that can materialize templates.
#[async_trait]
pub trait TemplatingBackend: DatabaseProvider {
    async fn create_template(&self, preparer: &Preparer) -> Result<Box<dyn TemplateHandle>, ProviderError>;
}

/// Reject identities the caches cannot key on.
pub(crate) fn check_identity(id: &ProviderId) -> Result<(), ProviderError> {
    if id.as_str().trim().is_empty() {
        return Err(ProviderError::Precondition(
            "provider identity must not be empty".to_string(),
        ));
    }
    Ok(())
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Assembly of the standard provider stack.
//!
//! ```text
//! ProvisioningPipeline
//!   └─ OptimizingProvider        drop work a trailing clean would undo
//!        └─ PrefetchingProvider  queue ready databases ahead of demand
//!             └─ TemplatingProvider (optional)  clone from snapshots
//!                  └─ backend
//! ```
//!
//! Engines can be shared between pipelines, in which case the worker pool,
//! the instance budget and the template cache span every provider built on
//! them. Cache keys include the provider identity, so sharing never mixes
//! databases from different backends.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::ProviderConfig;
use crate::database::Database;
use crate::error::ProviderError;
use crate::optimizer::OptimizingProvider;
use crate::prefetching::{PrefetchingEngine, PrefetchingProvider};
use crate::preparer::Preparer;
use crate::provider::{DatabaseProvider, ProviderId, TemplatingBackend};
use crate::templating::{TemplatingEngine, TemplatingProvider};

/// Builder for [`ProvisioningPipeline`].
pub struct ProvisioningBuilder {
    config: ProviderConfig,
    prefetching: Option<Arc<PrefetchingEngine>>,
    templating: Option<Arc<TemplatingEngine>>,
}

impl ProvisioningBuilder {
    /// Reuse an existing prefetching engine (and its worker pool and budget).
    #[must_use]
    pub fn with_prefetching_engine(mut self, engine: Arc<PrefetchingEngine>) -> Self {
        self.prefetching = Some(engine);
        self
    }

    /// Reuse an existing template cache.
    #[must_use]
    pub fn with_templating_engine(mut self, engine: Arc<TemplatingEngine>) -> Self {
        self.templating = Some(engine);
        self
    }

    /// Serve `backend` through optimizing and prefetching layers.
    pub fn build(self, backend: Arc<dyn DatabaseProvider>) -> Result<ProvisioningPipeline, ProviderError> {
        self.config.validate()?;
        let prefetching = match self.prefetching {
            Some(engine) => engine,
            None => PrefetchingEngine::new(self.config)?,
        };
        info!(provider = %backend.identity(), templating = false, "Provisioning pipeline built");
        Ok(ProvisioningPipeline {
            provider: OptimizingProvider::new(PrefetchingProvider::new(Arc::clone(&prefetching), backend)),
            prefetching,
            templating: None,
        })
    }

    /// Serve `backend` through optimizing, prefetching and templating layers.
    pub fn build_templating<B>(self, backend: Arc<B>) -> Result<ProvisioningPipeline, ProviderError>
    where
        B: TemplatingBackend + 'static,
    {
        self.config.validate()?;
        let templating = match self.templating {
            Some(engine) => engine,
            None => TemplatingEngine::new(&self.config),
        };
        let prefetching = match self.prefetching {
            Some(engine) => engine,
            None => PrefetchingEngine::new(self.config)?,
        };
        info!(provider = %backend.identity(), templating = true, "Provisioning pipeline built");
        let templated: Arc<dyn DatabaseProvider> = Arc::new(TemplatingProvider::new(Arc::clone(&templating), backend));
        Ok(ProvisioningPipeline {
            provider: OptimizingProvider::new(PrefetchingProvider::new(Arc::clone(&prefetching), templated)),
            prefetching,
            templating: Some(templating),
        })
    }
}

/// A fully assembled provider for one backend.
pub struct ProvisioningPipeline {
    provider: OptimizingProvider<PrefetchingProvider>,
    prefetching: Arc<PrefetchingEngine>,
    templating: Option<Arc<TemplatingEngine>>,
}

impl ProvisioningPipeline {
    pub fn builder(config: ProviderConfig) -> ProvisioningBuilder {
        ProvisioningBuilder {
            config,
            prefetching: None,
            templating: None,
        }
    }

    pub fn prefetching(&self) -> &Arc<PrefetchingEngine> {
        &self.prefetching
    }

    pub fn templating(&self) -> Option<&Arc<TemplatingEngine>> {
        self.templating.as_ref()
    }

    /// Forget all cached state: queued databases first, then templates.
    pub async fn reset(&self) {
        self.prefetching.reset().await;
        if let Some(templating) = &self.templating {
            templating.reset().await;
        }
    }

    /// Stop prefetching. Pending and later requests fail with
    /// [`ProviderError::Interrupted`].
    pub fn shutdown(&self) {
        self.prefetching.shutdown();
    }
}

#[async_trait]
impl DatabaseProvider for ProvisioningPipeline {
    fn identity(&self) -> ProviderId {
        self.provider.identity()
    }

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError> {
        self.provider.create_database(preparer).await
    }

    async fn apply_steps(&self, steps: &Preparer, database: &Database) -> Result<(), ProviderError> {
        self.provider.apply_steps(steps, database).await
    }
}

//! # prepdb
//!
//! Disposable, fully prepared databases for tests, served at low latency.
//!
//! ## Architecture
//!
//! A test asks a [`DatabaseProvider`] for a database prepared by a
//! [`Preparer`] (an ordered list of migration / seed / script steps). The
//! engines in this crate are providers themselves and stack as decorators:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OptimizingProvider                      │
//! │  • Drops steps a trailing clean would wipe anyway          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PrefetchingProvider                     │
//! │  • Per-preparer queue of ready databases                   │
//! │  • Shared priority worker pool, global instance budget     │
//! │  • Sibling reuse: extend a shorter preparer's database     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TemplatingProvider (optional)              │
//! │  • Snapshots expensive preparers as templates              │
//! │  • Longest-prefix clone + complementary steps              │
//! │  • Cost-based template eviction with hysteresis            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                           backend
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use prepdb::{DatabaseProvider, Preparer, ProviderConfig, ProvisioningPipeline, Step};
//!
//! async fn example(backend: Arc<dyn DatabaseProvider>) -> Result<(), prepdb::ProviderError> {
//!     let pipeline = ProvisioningPipeline::builder(ProviderConfig::default()).build(backend)?;
//!
//!     let preparer = Preparer::from_steps([Step::migrate("app"), Step::seed("app", 100)]);
//!     let database = pipeline.create_database(&preparer).await?;
//!     // ... run the test against `database` ...
//!     database.close().await?;
//!
//!     pipeline.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`preparer`]: steps and preparers, the cache-key vocabulary
//! - [`provider`]: provider and template traits implemented by backends
//! - [`database`]: the handle returned to callers
//! - [`optimizer`]: preparer rewriting
//! - [`templating`]: template cache
//! - [`prefetching`]: prefetch pipelines and the worker pool
//! - [`provisioning`]: assembly of the full stack
//! - [`config`]: tunables
//! - [`metrics`]: instrumentation

pub mod config;
pub mod database;
pub mod error;
pub mod metrics;
pub mod optimizer;
pub mod prefetching;
pub mod preparer;
pub mod provider;
pub mod provisioning;
pub mod templating;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ProviderConfig;
pub use database::{Database, DatabaseHandle};
pub use error::ProviderError;
pub use optimizer::{optimize, OptimizingProvider};
pub use prefetching::{PipelineState, PrefetchStats, PrefetchingEngine, PrefetchingProvider};
pub use preparer::{Preparer, Step, StepAction, StepKind};
pub use provider::{CacheKey, DatabaseProvider, ProviderId, TemplateHandle, TemplatingBackend};
pub use provisioning::{ProvisioningBuilder, ProvisioningPipeline};
pub use templating::{LoadStats, TemplateInfo, TemplatingEngine, TemplatingProvider};

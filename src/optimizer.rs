// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Preparer rewriting ahead of the caches.
//!
//! The only rewrite is the clean collapse: a trailing `clean` step that shares
//! no schema with any earlier step, with no `baseline` step in front of it,
//! leaves nothing of the earlier work worth caching, so the sequence becomes
//! `[clean]`. With the `squash` feature the same rule is tried at every clean
//! step and the longest collapsible prefix is dropped.
//!
//! The pass is pure and idempotent.
//!
//! ```
//! use prepdb::{optimize, Preparer, Step};
//!
//! let preparer = Preparer::from_steps([
//!     Step::migrate("foo"),
//!     Step::seed("foo", 10),
//!     Step::clean(["bar"]),
//! ]);
//! assert_eq!(optimize(&preparer), Preparer::from(Step::clean(["bar"])));
//! ```

use async_trait::async_trait;
use tracing::debug;

use crate::database::Database;
use crate::error::ProviderError;
use crate::preparer::{Preparer, Step, StepKind};
use crate::provider::{DatabaseProvider, ProviderId};

/// Rewrite `preparer` into an equivalent, possibly shorter preparer.
pub fn optimize(preparer: &Preparer) -> Preparer {
    let mut current = preparer.clone();
    // Each collapse can expose another one under `squash`; run to a fixpoint
    loop {
        let start = collapse_point(current.steps());
        if start == 0 {
            return current;
        }
        debug!(
            removed = start,
            remaining = current.len() - start,
            "Collapsed steps erased by a clean step"
        );
        current = current.suffix(start);
    }
}

/// Index of the first step to keep.
#[cfg(not(feature = "squash"))]
fn collapse_point(steps: &[Step]) -> usize {
    match steps.len() {
        0 | 1 => 0,
        n if collapsible(steps, n - 1) => n - 1,
        _ => 0,
    }
}

#[cfg(feature = "squash")]
fn collapse_point(steps: &[Step]) -> usize {
    (1..steps.len())
        .rev()
        .find(|&i| collapsible(steps, i))
        .unwrap_or(0)
}

/// Whether everything before `steps[at]` can be dropped.
fn collapsible(steps: &[Step], at: usize) -> bool {
    let clean = &steps[at];
    clean.kind() == StepKind::Clean
        && steps[..at]
            .iter()
            .all(|step| step.kind() != StepKind::Baseline && !step.shares_schema_with(clean))
}

/// Runs [`optimize`] once per request before handing off to `inner`.
pub struct OptimizingProvider<P> {
    inner: P,
}

impl<P: DatabaseProvider> OptimizingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: DatabaseProvider> DatabaseProvider for OptimizingProvider<P> {
    fn identity(&self) -> ProviderId {
        self.inner.identity()
    }

    async fn create_database(&self, preparer: &Preparer) -> Result<Database, ProviderError> {
        let optimized = optimize(preparer);
        self.inner.create_database(&optimized).await
    }

    async fn apply_steps(&self, steps: &Preparer, database: &Database) -> Result<(), ProviderError> {
        self.inner.apply_steps(steps, database).await
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Preparers: ordered, composable descriptions of setup work.
//!
//! A [`Preparer`] is an immutable sequence of [`Step`]s. Equality and hashing
//! are structural over the step *descriptors* (kind, name, schemas, params),
//! so two independently built requests for the same setup collapse onto the
//! same cache key.
//!
//! # Equality contract
//!
//! The engines assume that equal preparers produce interchangeable databases.
//! A step's [`StepAction`] does not take part in equality; callers attaching
//! actions must keep the descriptor honest (e.g. put a script checksum into
//! the params).
//!
//! # Applying steps
//!
//! Steps either carry an action or are plain descriptors that a backend
//! interprets itself. Complementary steps on top of a reused database always
//! go through [`DatabaseProvider::apply_steps`](crate::DatabaseProvider::apply_steps),
//! whose default runs the actions and rejects descriptor-only steps.
//!
//! # Example
//!
//! ```
//! use prepdb::{Preparer, Step};
//!
//! let migrate = Preparer::from_steps([Step::migrate("foo")]);
//! let seeded = Preparer::compose([migrate.clone(), Preparer::from_steps([Step::seed("foo", 10)])]);
//!
//! assert_eq!(seeded.len(), 2);
//! assert!(migrate.is_strict_prefix_of(&seeded));
//! assert_eq!(seeded.suffix(1), Preparer::from_steps([Step::seed("foo", 10)]));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::database::Database;
use crate::error::ProviderError;

/// What a step does, as far as the optimizer is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    /// Schema migration
    Migrate,
    /// Test data load
    Seed,
    /// Arbitrary script
    Script,
    /// Drops everything in its schemas
    Clean,
    /// Declares an explicit schema baseline; never optimized away
    Baseline,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Migrate => write!(f, "migrate"),
            Self::Seed => write!(f, "seed"),
            Self::Script => write!(f, "script"),
            Self::Clean => write!(f, "clean"),
            Self::Baseline => write!(f, "baseline"),
        }
    }
}

/// Executes a step against a live database.
#[async_trait]
pub trait StepAction: Send + Sync + 'static {
    async fn apply(&self, step: &Step, database: &Database) -> Result<(), ProviderError>;
}

/// One atomic unit of setup work.
#[derive(Clone)]
pub struct Step {
    kind: StepKind,
    name: String,
    schemas: BTreeSet<String>,
    params: BTreeMap<String, String>,
    estimated_duration: Duration,
    action: Option<Arc<dyn StepAction>>,
}

impl Step {
    pub fn new(kind: StepKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            schemas: BTreeSet::new(),
            params: BTreeMap::new(),
            estimated_duration: Duration::ZERO,
            action: None,
        }
    }

    pub fn migrate(schema: impl Into<String>) -> Self {
        Self::new(StepKind::Migrate, "migrate").with_schema(schema)
    }

    pub fn seed(schema: impl Into<String>, rows: u64) -> Self {
        Self::new(StepKind::Seed, "seed")
            .with_schema(schema)
            .with_param("rows", rows.to_string())
    }

    pub fn script(name: impl Into<String>) -> Self {
        Self::new(StepKind::Script, name)
    }

    pub fn clean<I, S>(schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        schemas
            .into_iter()
            .fold(Self::new(StepKind::Clean, "clean"), Self::with_schema)
    }

    pub fn baseline(schema: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(StepKind::Baseline, "baseline")
            .with_schema(schema)
            .with_param("version", version)
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schemas.insert(schema.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: Arc<dyn StepAction>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schemas(&self) -> &BTreeSet<String> {
        &self.schemas
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn estimated_duration(&self) -> Duration {
        self.estimated_duration
    }

    /// True if both steps touch at least one common schema.
    pub fn shares_schema_with(&self, other: &Step) -> bool {
        !self.schemas.is_disjoint(&other.schemas)
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    /// Run the step's action against `database`.
    ///
    /// A descriptor-only step has nothing to run here; only the provider that
    /// interprets descriptors can apply it, so this fails instead of
    /// reporting a no-op as success.
    pub async fn apply(&self, database: &Database) -> Result<(), ProviderError> {
        match &self.action {
            Some(action) => action.apply(self, database).await,
            None => Err(ProviderError::Precondition(format!(
                "step {} has no action and must be applied by its provider",
                self
            ))),
        }
    }
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.schemas == other.schemas
            && self.params == other.params
    }
}

impl Eq for Step {}

impl Hash for Step {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.name.hash(state);
        self.schemas.hash(state);
        self.params.hash(state);
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("schemas", &self.schemas)
            .field("params", &self.params)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        let args: Vec<String> = self
            .schemas
            .iter()
            .map(|s| format!("schema={}", s))
            .chain(self.params.iter().map(|(k, v)| format!("{}={}", k, v)))
            .collect();
        if !args.is_empty() {
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

/// An ordered, immutable sequence of steps. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Preparer {
    steps: Arc<[Step]>,
}

impl Preparer {
    /// The preparer of a blank database.
    pub fn empty() -> Self {
        Self::from_steps(std::iter::empty())
    }

    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// Flatten a list of preparers into one composite preparer.
    pub fn compose(preparers: impl IntoIterator<Item = Preparer>) -> Self {
        Self::from_steps(
            preparers
                .into_iter()
                .flat_map(|p| p.steps.iter().cloned().collect::<Vec<_>>()),
        )
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The first `len` steps (clamped).
    pub fn prefix(&self, len: usize) -> Self {
        Self::from_steps(self.steps[..len.min(self.len())].iter().cloned())
    }

    /// Everything after the first `from` steps (clamped): the complementary
    /// preparer once a prefix of length `from` is already applied.
    pub fn suffix(&self, from: usize) -> Self {
        Self::from_steps(self.steps[from.min(self.len())..].iter().cloned())
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Preparer) -> Self {
        Self::compose([self.clone(), next.clone()])
    }

    pub fn starts_with(&self, prefix: &Preparer) -> bool {
        self.steps.starts_with(&prefix.steps)
    }

    pub fn is_strict_prefix_of(&self, other: &Preparer) -> bool {
        self.len() < other.len() && other.starts_with(self)
    }

    /// Sum of the step duration hints.
    pub fn estimated_duration(&self) -> Duration {
        self.steps.iter().map(Step::estimated_duration).sum()
    }

    /// Run every step, in order, against `database`.
    pub async fn apply(&self, database: &Database) -> Result<(), ProviderError> {
        for step in self.steps.iter() {
            step.apply(database).await?;
        }
        Ok(())
    }
}

impl Default for Preparer {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Step> for Preparer {
    fn from(step: Step) -> Self {
        Self::from_steps([step])
    }
}

impl FromIterator<Step> for Preparer {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self::from_steps(iter)
    }
}

impl fmt::Debug for Preparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.steps.iter()).finish()
    }
}

impl fmt::Display for Preparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", step)?;
        }
        write!(f, "]")
    }
}

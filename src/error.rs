// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the provisioning pipeline.
//!
//! Errors are `Clone` because a single failure is routinely observed by more
//! than one party: every waiter on a template load sees the same outcome, and a
//! failed background task parks its error in a pipeline queue until a request
//! picks it up.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The backend failed to create, clone or prepare a database.
    #[error("Database backend error: {0}")]
    Backend(String),

    /// A template was closed while a clone was being attempted.
    /// Recovered internally by the templating engine; callers never see it.
    #[error("Template '{0}' is closed")]
    TemplateClosed(String),

    /// A blocked request was abandoned before a database became available.
    #[error("Interrupted while waiting for a prepared database")]
    Interrupted,

    /// A call-site contract was violated.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A configuration option could not be accepted.
    #[error("Invalid option '{key}': {message}")]
    InvalidOption { key: String, message: String },
}

impl ProviderError {
    /// Shorthand for a backend failure with any displayable cause.
    pub fn backend(cause: impl std::fmt::Display) -> Self {
        Self::Backend(cause.to_string())
    }

    pub(crate) fn invalid_option(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Label used for the `error_type` metric dimension.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::TemplateClosed(_) => "template_closed",
            Self::Interrupted => "interrupted",
            Self::Precondition(_) => "precondition",
            Self::InvalidOption { .. } => "invalid_option",
        }
    }
}

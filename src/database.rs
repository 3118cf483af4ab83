// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The database handle returned to callers.
//!
//! [`Database`] is a plain decorator around a backend-specific
//! [`DatabaseHandle`]: the engines only need a name and a way to release the
//! instance, while step actions and callers reach the concrete backend type
//! through [`Database::downcast_ref`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Backend side of a live database instance.
#[async_trait]
pub trait DatabaseHandle: Send + Sync + fmt::Debug + 'static {
    /// Backend-unique name of the instance.
    fn name(&self) -> &str;

    /// Release (drop or return to the backend) the instance.
    async fn close(&self) -> Result<(), ProviderError>;

    fn as_any(&self) -> &dyn Any;
}

/// A ready, isolated database.
///
/// Closing is idempotent: only the first [`close`](Self::close) reaches the
/// backend.
pub struct Database {
    delegate: Arc<dyn DatabaseHandle>,
    closed: AtomicBool,
}

impl Database {
    pub fn new(delegate: impl DatabaseHandle) -> Self {
        Self::from_arc(Arc::new(delegate))
    }

    pub fn from_arc(delegate: Arc<dyn DatabaseHandle>) -> Self {
        Self {
            delegate,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.delegate.name()
    }

    #[must_use]
    pub fn delegate(&self) -> &dyn DatabaseHandle {
        self.delegate.as_ref()
    }

    /// Borrow the concrete backend handle, if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: DatabaseHandle>(&self) -> Option<&T> {
        self.delegate.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn close(&self) -> Result<(), ProviderError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.delegate.close().await
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingHandle {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl DatabaseHandle for CountingHandle {
        fn name(&self) -> &str {
            "counting"
        }

        async fn close(&self) -> Result<(), ProviderError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = Database::new(CountingHandle::default());
        assert!(!db.is_closed());

        db.close().await.unwrap();
        db.close().await.unwrap();

        assert!(db.is_closed());
        let handle = db.downcast_ref::<CountingHandle>().unwrap();
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_shows_name() {
        let db = Database::new(CountingHandle::default());
        assert!(format!("{:?}", db).contains("counting"));
    }
}

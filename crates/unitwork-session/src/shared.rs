//! A unit of work shared between tasks.
//!
//! [`UnitOfWork::commit`] takes `&mut self`, so one instance can only flush
//! from one place at a time. [`SharedUnitOfWork`] wraps it in an async mutex:
//! commits issued from concurrent tasks queue on the lock and run one after
//! another instead of interleaving.

use std::fmt;
use std::sync::Arc;

use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};
use unitwork_core::{Driver, Error, MetadataStorage};

use crate::flush::FlushResult;
use crate::unit_of_work::UnitOfWork;

/// Cloneable handle to a unit of work behind an async mutex.
pub struct SharedUnitOfWork<D: Driver> {
    inner: Arc<Mutex<UnitOfWork<D>>>,
}

impl<D: Driver> Clone for SharedUnitOfWork<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for SharedUnitOfWork<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedUnitOfWork")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

impl<D: Driver> SharedUnitOfWork<D> {
    pub fn new(uow: UnitOfWork<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(uow)),
        }
    }

    pub fn from_driver(driver: Arc<D>, metadata: Arc<MetadataStorage>) -> Self {
        Self::new(UnitOfWork::new(driver, metadata))
    }

    pub fn inner(&self) -> &Arc<Mutex<UnitOfWork<D>>> {
        &self.inner
    }

    /// Run a synchronous operation (persist, remove, merge...) under the lock.
    pub async fn with<R>(
        &self,
        cx: &Cx,
        f: impl FnOnce(&mut UnitOfWork<D>) -> R,
    ) -> Outcome<R, Error> {
        let inner = Arc::clone(&self.inner);
        let Ok(mut guard) = inner.lock(cx).await else {
            return Outcome::Err(Error::Cancelled);
        };
        Outcome::Ok(f(&mut guard))
    }

    /// Run an async operation with exclusive access for its whole duration.
    pub async fn run<T, F>(&self, cx: &Cx, work: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut UnitOfWork<D>) -> Outcome<T, Error>,
    {
        let inner = Arc::clone(&self.inner);
        let Ok(mut guard) = inner.lock(cx).await else {
            return Outcome::Err(Error::Cancelled);
        };
        work(&mut *guard).await
    }

    /// Flush pending changes, waiting for any flush already in progress.
    pub async fn commit(&self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let inner = Arc::clone(&self.inner);
        let Ok(mut guard) = inner.lock(cx).await else {
            tracing::debug!("Lock acquisition interrupted before commit");
            return Outcome::Err(Error::Cancelled);
        };
        guard.commit(cx).await
    }
}

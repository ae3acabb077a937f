//! Transaction context carried by a unit of work.

use std::time::{Duration, Instant};

use unitwork_core::TransactionOptions;

/// An open backend transaction and how it was opened.
///
/// Each unit of work owns at most one context, so concurrent units never
/// observe each other's transaction.
#[derive(Debug)]
pub struct TransactionContext<T> {
    tx: T,
    options: TransactionOptions,
    started_at: Instant,
}

impl<T> TransactionContext<T> {
    pub fn new(tx: T, options: TransactionOptions) -> Self {
        Self {
            tx,
            options,
            started_at: Instant::now(),
        }
    }

    pub fn tx(&self) -> &T {
        &self.tx
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Release the backend handle for commit or rollback.
    pub fn into_inner(self) -> T {
        self.tx
    }
}

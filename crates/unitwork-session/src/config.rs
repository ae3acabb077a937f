//! Unit of work configuration.

use serde::{Deserialize, Serialize};
use unitwork_core::IsolationLevel;

/// Tunables for one [`UnitOfWork`](crate::UnitOfWork).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkConfig {
    /// Open a transaction around each flush when none is active.
    pub implicit_transactions: bool,
    /// Maximum rows per batched insert or delete call.
    pub batch_size: usize,
    /// Schema stamped on entities that carry none.
    pub schema: Option<String>,
    /// Isolation level for implicitly opened transactions.
    pub isolation: IsolationLevel,
    /// Only diff entities explicitly passed to `persist`.
    pub disable_change_tracking: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            implicit_transactions: true,
            batch_size: 300,
            schema: None,
            isolation: IsolationLevel::ReadCommitted,
            disable_change_tracking: false,
        }
    }
}

impl UnitOfWorkConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn implicit_transactions(mut self, value: bool) -> Self {
        self.implicit_transactions = value;
        self
    }

    /// Set the batch size. Zero is treated as one.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub fn disable_change_tracking(mut self, value: bool) -> Self {
        self.disable_change_tracking = value;
        self
    }
}

//! Unit of work for the unitwork persistence engine.
//!
//! `unitwork-session` is the **change-tracking layer**. It keeps one
//! in-memory instance per database identity, records what the application
//! changed since the last flush, and writes those changes in an order the
//! database accepts.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one managed instance per `(schema, root, primary key)`.
//! - **Change sets**: create, update and delete records computed by diffing
//!   live entities against their last persisted snapshot.
//! - **Commit order**: a dependency sort over entity types so parents are
//!   inserted before children and deleted after them.
//! - **Flush**: executes the phases inside a transaction and rolls back on
//!   failure, leaving pending work in place for a retry.
//!
//! # Design Philosophy
//!
//! - **Explicit flush**: nothing reaches the backend before `commit`.
//! - **Backend agnostic**: all I/O goes through the [`Driver`] trait; the
//!   engine never builds SQL.
//! - **Cancel-correct**: async operations take `Cx` and return `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(driver, metadata);
//!
//! let author = EntityRef::new(&author_meta).with("name", "Ursula");
//! let book = EntityRef::new(&book_meta).with("title", "The Dispossessed");
//! book.link_reference("author", Some(&author))?;
//!
//! uow.persist(&book)?;
//! let result = uow.commit(&cx).await;
//! ```
//!
//! [`Driver`]: unitwork_core::Driver

pub mod change_set;
pub mod change_set_computer;
pub mod change_set_persister;
pub mod change_tracker;
pub mod commit_order;
pub mod config;
pub mod events;
pub mod flush;
pub mod identity_map;
pub mod shared;
pub mod transaction;
pub mod unit_of_work;

pub use change_set::{
    ChangeSet, ChangeSetKind, CollectionUpdate, CollectionUpdates, EntitySet, ExtraUpdate,
    PendingRef,
};
pub use change_set_computer::ChangeSetComputer;
pub use change_set_persister::ChangeSetPersister;
pub use change_tracker::{ChangeTracker, EntityState, Snapshot};
pub use commit_order::CommitOrderCalculator;
pub use config::UnitOfWorkConfig;
pub use events::{EventArgs, EventManager, EventSubscriber, FlushEventArgs};
pub use flush::{FlushPlan, FlushResult};
pub use identity_map::{IdentityKey, IdentityMap, primary_key_hash, unique_hash};
pub use shared::SharedUnitOfWork;
pub use transaction::TransactionContext;
pub use unit_of_work::{PendingCounts, UnitOfWork};

pub use unitwork_core;

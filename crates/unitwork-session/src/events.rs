//! Lifecycle events.
//!
//! Two kinds of listeners receive events: `fn` hooks registered on entity
//! metadata, which may mutate the entity they fire for, and subscribers
//! registered on the unit of work. Entity events run synchronously around
//! each backend call; flush events receive the whole unit of work.

use std::fmt;
use std::sync::Arc;

use unitwork_core::{Driver, EntityMeta, EntityRef, EventType, Result};

use crate::change_set::ChangeSet;
use crate::unit_of_work::UnitOfWork;

/// Arguments of an entity-level event.
pub struct EventArgs<'a> {
    pub entity: &'a EntityRef,
    pub change_set: Option<&'a ChangeSet>,
}

/// Arguments of a flush-level event.
pub struct FlushEventArgs<'a, D: Driver> {
    pub uow: &'a mut UnitOfWork<D>,
}

/// Receives lifecycle events from a unit of work.
///
/// Every method defaults to doing nothing. An `Err` aborts the flush.
pub trait EventSubscriber<D: Driver>: Send + Sync {
    /// Entity names this subscriber listens to; empty means all.
    fn entities(&self) -> &[&'static str] {
        &[]
    }

    fn before_create(&self, _args: &EventArgs<'_>) -> Result<()> {
        Ok(())
    }

    fn after_create(&self, _args: &EventArgs<'_>) -> Result<()> {
        Ok(())
    }

    fn before_update(&self, _args: &EventArgs<'_>) -> Result<()> {
        Ok(())
    }

    fn after_update(&self, _args: &EventArgs<'_>) -> Result<()> {
        Ok(())
    }

    fn before_delete(&self, _args: &EventArgs<'_>) -> Result<()> {
        Ok(())
    }

    fn after_delete(&self, _args: &EventArgs<'_>) -> Result<()> {
        Ok(())
    }

    fn before_flush(&self, _args: &mut FlushEventArgs<'_, D>) -> Result<()> {
        Ok(())
    }

    /// Fired after change sets are computed, before anything is written.
    fn on_flush(&self, _args: &mut FlushEventArgs<'_, D>) -> Result<()> {
        Ok(())
    }

    fn after_flush(&self, _args: &mut FlushEventArgs<'_, D>) -> Result<()> {
        Ok(())
    }
}

/// Dispatches events to metadata hooks and subscribers.
pub struct EventManager<D: Driver> {
    subscribers: Vec<Arc<dyn EventSubscriber<D>>>,
}

impl<D: Driver> Default for EventManager<D> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<D: Driver> fmt::Debug for EventManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

fn listens_to<D: Driver>(subscriber: &dyn EventSubscriber<D>, entity: &str) -> bool {
    let scope = subscriber.entities();
    scope.is_empty() || scope.contains(&entity)
}

impl<D: Driver> EventManager<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subscriber: Arc<dyn EventSubscriber<D>>) {
        self.subscribers.push(subscriber);
    }

    /// Snapshot of the registered subscribers.
    ///
    /// Flush events hand out the unit of work mutably, so they iterate a
    /// copy of the list rather than the manager itself.
    pub fn subscribers(&self) -> Vec<Arc<dyn EventSubscriber<D>>> {
        self.subscribers.clone()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Would `event` reach anything for entities of this type?
    pub fn has_listeners(&self, event: EventType, meta: &EntityMeta) -> bool {
        meta.has_hooks(event)
            || self
                .subscribers
                .iter()
                .any(|s| listens_to(s.as_ref(), meta.name))
    }

    /// Fire an entity event: metadata hooks first, then subscribers.
    pub fn dispatch(
        &self,
        event: EventType,
        entity: &EntityRef,
        change_set: Option<&ChangeSet>,
    ) -> Result<()> {
        let meta = entity.meta();
        let hooks = meta.hooks_for(event);
        if !hooks.is_empty() {
            let mut data = entity.write();
            for hook in hooks {
                hook(&mut data)?;
            }
        }

        let args = EventArgs { entity, change_set };
        for subscriber in &self.subscribers {
            if !listens_to(subscriber.as_ref(), meta.name) {
                continue;
            }
            match event {
                EventType::BeforeCreate => subscriber.before_create(&args)?,
                EventType::AfterCreate => subscriber.after_create(&args)?,
                EventType::BeforeUpdate => subscriber.before_update(&args)?,
                EventType::AfterUpdate => subscriber.after_update(&args)?,
                EventType::BeforeDelete => subscriber.before_delete(&args)?,
                EventType::AfterDelete => subscriber.after_delete(&args)?,
                EventType::BeforeFlush | EventType::OnFlush | EventType::AfterFlush => {}
            }
        }
        Ok(())
    }
}

/// Fire a flush event on each subscriber in `subscribers`.
pub fn dispatch_flush<D: Driver>(
    subscribers: &[Arc<dyn EventSubscriber<D>>],
    event: EventType,
    uow: &mut UnitOfWork<D>,
) -> Result<()> {
    for subscriber in subscribers {
        let mut args = FlushEventArgs { uow: &mut *uow };
        match event {
            EventType::BeforeFlush => subscriber.before_flush(&mut args)?,
            EventType::OnFlush => subscriber.on_flush(&mut args)?,
            EventType::AfterFlush => subscriber.after_flush(&mut args)?,
            _ => {}
        }
    }
    Ok(())
}

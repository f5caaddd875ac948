//! Event type → delivery metadata.
//!
//! New event types are made durable by registering a resolver at startup,
//! not by growing a central `match`:
//!
//! ```ignore
//! let mut registry = EventRegistry::new();
//! registry.register::<OrderPaid>(|e| {
//!     EventMetadata::new("Order", e.order_id.to_string(), "market.order.paid")
//! })?;
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;

use thiserror::Error;

use crate::event::DomainEvent;

/// Where an event goes and which aggregate it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMetadata {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub topic: String,
}

impl EventMetadata {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            topic: topic.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a resolver is already registered for event type {0}")]
    Duplicate(&'static str),
}

type Resolver = Box<dyn Fn(&dyn Any) -> Option<EventMetadata> + Send + Sync>;

struct Registration {
    event_type: &'static str,
    resolve: Resolver,
}

/// Lookup table from event type to [`EventMetadata`] resolver.
#[derive(Default)]
pub struct EventRegistry {
    resolvers: HashMap<TypeId, Registration>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the resolver for `E`.
    ///
    /// Fails if `E` is already registered, or if another type already uses
    /// the tag `E::EVENT_TYPE`.
    pub fn register<E, F>(&mut self, resolver: F) -> Result<&mut Self, RegistryError>
    where
        E: DomainEvent,
        F: Fn(&E) -> EventMetadata + Send + Sync + 'static,
    {
        let taken = self.resolvers.contains_key(&TypeId::of::<E>())
            || self
                .resolvers
                .values()
                .any(|registration| registration.event_type == E::EVENT_TYPE);
        if taken {
            return Err(RegistryError::Duplicate(E::EVENT_TYPE));
        }

        self.resolvers.insert(
            TypeId::of::<E>(),
            Registration {
                event_type: E::EVENT_TYPE,
                resolve: Box::new(move |event: &dyn Any| event.downcast_ref::<E>().map(&resolver)),
            },
        );
        Ok(self)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<E, F>(mut self, resolver: F) -> Result<Self, RegistryError>
    where
        E: DomainEvent,
        F: Fn(&E) -> EventMetadata + Send + Sync + 'static,
    {
        self.register::<E, F>(resolver)?;
        Ok(self)
    }

    /// Metadata for `event`, or `None` when its type has no resolver.
    pub fn resolve<E: DomainEvent>(&self, event: &E) -> Option<EventMetadata> {
        self.resolvers
            .get(&TypeId::of::<E>())
            .and_then(|registration| (registration.resolve)(event))
    }

    pub fn contains<E: DomainEvent>(&self) -> bool {
        self.resolvers.contains_key(&TypeId::of::<E>())
    }

    /// Registered event type tags, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.resolvers.values().map(|r| r.event_type).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

//! Domain events the engine emits towards the external event bus. The sink
//! is a collaborator seam; publishing failures are the sink's problem, the
//! engine fires and forgets.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::node::ResourceId;

#[derive(Clone, Debug)]
pub enum Event {
    ContainerCreated {
        resource: ResourceId,
        parent: Option<ResourceId>,
        timestamp: OffsetDateTime,
    },
    FileTouched {
        resource: ResourceId,
        parent: Option<ResourceId>,
        timestamp: OffsetDateTime,
    },
    UploadReady {
        resource: ResourceId,
        parent: Option<ResourceId>,
        timestamp: OffsetDateTime,
    },
    ItemMoved {
        resource: ResourceId,
        old_reference: String,
        timestamp: OffsetDateTime,
    },
    ItemTrashed {
        owner: Option<String>,
        executant: Option<String>,
        resource: Option<ResourceId>,
        parent: Option<ResourceId>,
        timestamp: OffsetDateTime,
    },
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event);
}

/// Default sink for deployments without an event bus.
#[derive(Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _event: Event) {}
}

/// Records every published event; the test suites assert against it.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(
            &mut self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

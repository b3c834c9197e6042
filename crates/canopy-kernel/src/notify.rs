//! Change notification.
//!
//! Listeners register with an [`EventKind`] mask and are called in
//! registration order once per committed operation. A failing or panicking
//! listener does not stop delivery to the others; failures are collected and
//! returned to the committer after the round.
//!
//! Besides trait-object listeners, [`NotificationDispatcher::subscribe`]
//! hands out a bounded channel. Delivery waits for queue space, so a slow
//! consumer holds back the committing task rather than losing events.
//! Subscriptions whose receiver is gone are pruned on the next delivery.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bitflags::bitflags;
use canopy_types::ResourcePath;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::delta::ResourceDelta;

bitflags! {
    /// Phases a listener can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct EventKind: u32 {
        const POST_CHANGE = 1;
        const PRE_CLOSE = 2;
        const PRE_DELETE = 4;
    }
}

/// One notification.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceChangeEvent {
    pub kind: EventKind,
    /// The project about to be closed or deleted, for `PRE_*` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourcePath>,
    /// The committed changes, for `POST_CHANGE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ResourceDelta>,
}

impl ResourceChangeEvent {
    pub fn post_change(delta: ResourceDelta) -> Self {
        Self {
            kind: EventKind::POST_CHANGE,
            resource: None,
            delta: Some(delta),
        }
    }

    pub fn pre_close(project: ResourcePath) -> Self {
        Self {
            kind: EventKind::PRE_CLOSE,
            resource: Some(project),
            delta: None,
        }
    }

    pub fn pre_delete(project: ResourcePath) -> Self {
        Self {
            kind: EventKind::PRE_DELETE,
            resource: Some(project),
            delta: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),

    #[error("listener disconnected")]
    Disconnected,

    #[error("listener panicked: {0}")]
    Panicked(String),
}

/// Receives change events.
#[async_trait]
pub trait ResourceChangeListener: Send + Sync {
    async fn resource_changed(&self, event: &ResourceChangeEvent) -> Result<(), ListenerError>;
}

/// Registration handle, used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A listener that failed during one delivery round.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    pub kind: EventKind,
    pub error: ListenerError,
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    mask: EventKind,
    listener: Arc<dyn ResourceChangeListener>,
}

/// Fans events out to registered listeners.
pub struct NotificationDispatcher {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("listeners", &self.listeners.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl NotificationDispatcher {
    /// `capacity` bounds each channel subscription.
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ResourceChangeListener>, mask: EventKind) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration { id, mask, listener });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Channel-backed listener.
    pub fn subscribe(&self, mask: EventKind) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.add_listener(Arc::new(ChannelListener { tx }), mask);
        Subscription { id, rx }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every interested listener in registration order.
    pub async fn dispatch(&self, event: &ResourceChangeEvent) -> Vec<ListenerFailure> {
        // Snapshot so listeners may (un)register while we deliver.
        let targets: Vec<Registration> = self
            .listeners
            .read()
            .iter()
            .filter(|r| r.mask.intersects(event.kind))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        let mut disconnected = Vec::new();
        for registration in targets {
            let outcome = AssertUnwindSafe(registration.listener.resource_changed(event))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(ListenerError::Disconnected)) => {
                    disconnected.push(registration.id);
                    continue;
                }
                Ok(Err(error)) => error,
                Err(panic) => ListenerError::Panicked(panic_message(panic.as_ref())),
            };
            warn!(listener = registration.id.0, kind = ?event.kind, %error, "listener failed");
            failures.push(ListenerFailure {
                listener: registration.id,
                kind: event.kind,
                error,
            });
        }

        if !disconnected.is_empty() {
            debug!(count = disconnected.len(), "pruning disconnected subscriptions");
            self.listeners
                .write()
                .retain(|r| !disconnected.contains(&r.id));
        }
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct ChannelListener {
    tx: mpsc::Sender<ResourceChangeEvent>,
}

#[async_trait]
impl ResourceChangeListener for ChannelListener {
    async fn resource_changed(&self, event: &ResourceChangeEvent) -> Result<(), ListenerError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| ListenerError::Disconnected)
    }
}

/// Receiving end of [`NotificationDispatcher::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    rx: mpsc::Receiver<ResourceChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next event. `None` once the dispatcher dropped the listener.
    pub async fn recv(&mut self) -> Option<ResourceChangeEvent> {
        self.rx.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<ResourceChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event.
    pub fn drain(&mut self) -> Vec<ResourceChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

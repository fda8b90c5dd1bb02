use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::broker::protocol::Event;

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Process-wide pub/sub keyed by command id. One-shot HTTP handlers
/// subscribe here to stream a single in-flight command's events without
/// touching socket internals.
#[derive(Clone, Default)]
pub struct CommandEventStream {
    inner: Arc<StreamInner>,
}

#[derive(Default)]
struct StreamInner {
    subscribers: RwLock<HashMap<Uuid, HashMap<u64, EventHandler>>>,
    next_handler_id: AtomicU64,
}

/// Handle returned by [`CommandEventStream::add_subscriber`]. Calling
/// `unsubscribe` is idempotent; once it returns, the handler sees no
/// further events.
pub struct CommandEventSubscription {
    inner: Arc<StreamInner>,
    command_id: Uuid,
    handler_id: u64,
}

impl CommandEventSubscription {
    pub fn unsubscribe(&self) {
        if let Ok(mut subscribers) = self.inner.subscribers.write() {
            if let Some(handlers) = subscribers.get_mut(&self.command_id) {
                handlers.remove(&self.handler_id);
                if handlers.is_empty() {
                    subscribers.remove(&self.command_id);
                }
            }
        }
    }
}

impl CommandEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscriber(
        &self,
        command_id: Uuid,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> CommandEventSubscription {
        let handler_id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.inner.subscribers.write() {
            subscribers
                .entry(command_id)
                .or_default()
                .insert(handler_id, Arc::new(handler));
        }

        CommandEventSubscription {
            inner: self.inner.clone(),
            command_id,
            handler_id,
        }
    }

    /// Invokes every handler registered for the event's command id.
    /// Handlers run on a snapshot, so an unsubscribe during dispatch only
    /// takes effect for the next event.
    pub fn dispatch(&self, event: &Event) {
        let Some(command_id) = event.command_id else {
            return;
        };

        let handlers: Vec<EventHandler> = match self.inner.subscribers.read() {
            Ok(subscribers) => subscribers
                .get(&command_id)
                .map(|h| h.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        if handlers.is_empty() {
            return;
        }

        debug!(
            "Dispatching {} event to {} subscriber(s) of command {}",
            event.event_type(),
            handlers.len(),
            command_id
        );
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self, command_id: Uuid) -> usize {
        self.inner
            .subscribers
            .read()
            .map(|s| s.get(&command_id).map(|h| h.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut subscribers) = self.inner.subscribers.write() {
            subscribers.clear();
        }
    }
}

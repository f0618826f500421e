//! Typed pub/sub dispatch of incoming messages

use huddle_protocol::{Message, MessageKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback invoked for a received message. Must not block.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// What a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(MessageKind),
    /// Every message
    All,
}

impl From<MessageKind> for Topic {
    fn from(kind: MessageKind) -> Self {
        Topic::Kind(kind)
    }
}

/// Handle returned by [`HandlerRegistry::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handler lists keyed by message kind
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic`
    pub fn on<F>(&self, topic: impl Into<Topic>, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(topic.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one subscription. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;

        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });

        removed
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `message` to the handlers of its kind, then to wildcard
    /// handlers. Returns the number of handlers invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        // Handlers may subscribe or unsubscribe while running
        let targets: Vec<Handler> = {
            let handlers = self.handlers.read();
            [Topic::Kind(message.kind()), Topic::All]
                .iter()
                .filter_map(|topic| handlers.get(topic))
                .flat_map(|list| list.iter().map(|(_, h)| h.clone()))
                .collect()
        };

        for handler in &targets {
            handler(message);
        }

        targets.len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;

use tracing::{debug, warn};

use crate::error::Result;

/// A publish/subscribe transport.
///
/// Implementations must be non-blocking: commands are published from within
/// message handlers. A publication is never delivered to the handlers before
/// `publish` returns.
pub trait Transport: Send + Sync {
    /// Subscribes to `topic`.
    ///
    /// # Errors
    ///
    /// Fails when the subscription cannot be requested.
    fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publishes `payload` on `topic`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::ErrorKind::PublishFailure`] when the
    /// transport is not connected or the message cannot be queued.
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Whether the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Receives the messages published on its topics.
pub trait MessageHandler: Send + Sync {
    /// Returns the topics the handler listens to.
    fn topics(&self) -> Vec<String>;

    /// Handles `payload` received on `topic`.
    fn on_message(&self, topic: &str, payload: &[u8]);

    /// Called once a [`Dispatcher`] routes the topics of the handler.
    ///
    /// Subscriptions belong here, so that no message is received before it
    /// can be routed.
    fn on_register(&self) {}

    /// Called once the transport is connected, or reconnected.
    fn on_connect(&self) {}

    /// Called once the transport has lost its connection.
    fn on_disconnect(&self) {}
}

#[derive(Default)]
struct Routes {
    handlers: Vec<Arc<dyn MessageHandler>>,
    topics: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

/// Routes incoming messages to the handlers registered for their topic.
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<Routes>,
}

impl Dispatcher {
    /// Creates an empty [`Dispatcher`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for each of its topics and then calls
    /// [`MessageHandler::on_register`].
    pub fn register(&self, handler: Arc<dyn MessageHandler>) {
        {
            let mut routes = self.write();
            for topic in handler.topics() {
                routes.topics.entry(topic).or_default().push(handler.clone());
            }
            routes.handlers.push(handler.clone());
        }
        handler.on_register();
    }

    /// Returns every routed topic.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.read().topics.keys().cloned().collect()
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().handlers.is_empty()
    }

    /// Delivers `payload` to the handlers of `topic`.
    ///
    /// Returns whether at least one handler received the message.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(handlers) = self.read().topics.get(topic).cloned() else {
            debug!("No handler for `{topic}`, message discarded");
            return false;
        };

        for handler in &handlers {
            handler.on_message(topic, payload);
        }
        true
    }

    /// Notifies every handler of a connection.
    pub fn on_connect(&self) {
        let handlers = self.read().handlers.clone();
        for handler in handlers {
            handler.on_connect();
        }
    }

    /// Notifies every handler of a disconnection.
    pub fn on_disconnect(&self) {
        let handlers = self.read().handlers.clone();
        if handlers.is_empty() {
            warn!("Disconnected with no handler registered");
        }
        for handler in handlers {
            handler.on_disconnect();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

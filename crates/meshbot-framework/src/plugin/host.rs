//! The handle plugins use to act outside of an event.

use std::sync::{Arc, Weak};

use meshbot_core::{MessageSink, OutboundMessage, Origin, SendResult, SharedStore};

/// Passed to `on_start` and `on_tick` so a plugin can send on its own and
/// read the store.
///
/// Holds the sink weakly: a plugin keeping the host does not keep the
/// dispatcher alive, and sends after shutdown fail instead of hanging.
#[derive(Clone)]
pub struct PluginHost {
    sink: Weak<dyn MessageSink>,
    store: SharedStore,
}

impl PluginHost {
    /// Creates a host sending through `sink`.
    pub fn new(sink: &Arc<dyn MessageSink>, store: SharedStore) -> Self {
        Self {
            sink: Arc::downgrade(sink),
            store,
        }
    }

    /// Sends `message` through the dispatcher's outbound path.
    pub async fn send(&self, message: OutboundMessage) -> SendResult {
        match self.sink.upgrade() {
            Some(sink) => sink.deliver(message, Origin::Plugin).await,
            None => SendResult::failed("dispatcher is gone"),
        }
    }

    /// The persistence store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("connected", &(self.sink.strong_count() > 0))
            .finish_non_exhaustive()
    }
}

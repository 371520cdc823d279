//! Per-event context shared by the router and every plugin.
//!
//! One [`EventContext`] is created per dispatched event. Commands and plugins
//! see the same instance, so:
//!
//! - replies queued by any of them end up in one outbox, sent in order once
//!   the plugin chain is done;
//! - [`stop_propagation`](EventContext::stop_propagation) called by one plugin
//!   is visible to the dispatch loop before the next plugin runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use meshbot_core::{ConversationId, InboundEvent, OutboundMessage};

/// Context for one inbound event.
pub struct EventContext {
    event: Arc<InboundEvent>,
    channel_name: String,
    is_propagating: AtomicBool,
    outbox: Mutex<Vec<OutboundMessage>>,
}

impl EventContext {
    /// Creates a context for `event`. `channel_name` is `DM` for direct messages.
    pub fn new(event: Arc<InboundEvent>, channel_name: impl Into<String>) -> Self {
        Self {
            event,
            channel_name: channel_name.into(),
            is_propagating: AtomicBool::new(true),
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// The event being processed.
    pub fn event(&self) -> &InboundEvent {
        &self.event
    }

    /// Trimmed text of a text event.
    pub fn text(&self) -> Option<&str> {
        self.event.text_body()
    }

    /// Sender node id.
    pub fn sender(&self) -> &str {
        &self.event.source_id
    }

    /// Friendly channel name, or `DM`.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// `true` for direct messages.
    pub fn is_direct(&self) -> bool {
        self.event.is_direct()
    }

    /// Conversation the event belongs to.
    pub fn conversation(&self) -> ConversationId {
        self.event.conversation()
    }

    /// Queues a reply routed back to where the event came from.
    pub fn reply(&self, text: impl Into<String>) {
        self.send(self.event.reply(text));
    }

    /// Queues an arbitrary outbound message.
    pub fn send(&self, message: OutboundMessage) {
        self.outbox.lock().push(message);
    }

    /// Number of messages queued so far.
    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Stops the plugin chain after the current plugin.
    pub fn stop_propagation(&self) {
        self.is_propagating.store(false, Ordering::SeqCst);
    }

    /// `false` once any handler called [`stop_propagation`](Self::stop_propagation).
    pub fn is_propagating(&self) -> bool {
        self.is_propagating.load(Ordering::SeqCst)
    }

    pub(crate) fn take_outbox(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("event", &self.event.id)
            .field("channel_name", &self.channel_name)
            .field("is_propagating", &self.is_propagating())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbot_core::Destination;

    #[test]
    fn test_replies_follow_the_event() {
        let event = InboundEvent::text("!abc", 3, "/ping")
            .with_destination(Destination::Node("!bot".into()))
            .with_node_key("home");
        let ctx = EventContext::new(Arc::new(event), "DM");
        ctx.reply("pong");
        ctx.send(OutboundMessage::broadcast(0, "hello all"));

        let out = ctx.take_outbox();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, Destination::Node("!abc".into()));
        assert_eq!(out[0].channel, 3);
        assert_eq!(out[0].node.as_deref(), Some("home"));
        assert!(out[1].target.is_broadcast());
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_stop_propagation() {
        let ctx = EventContext::new(Arc::new(InboundEvent::text("!a", 0, "hi")), "ch0");
        assert!(ctx.is_propagating());
        ctx.stop_propagation();
        assert!(!ctx.is_propagating());
    }
}

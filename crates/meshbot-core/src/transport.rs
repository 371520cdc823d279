//! Seams to the collaborators around the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportResult;
use crate::event::{InboundEvent, Origin};
use crate::message::{OutboundMessage, SendReceipt, SendResult};

/// Sends frames to the mesh.
///
/// Implementations may confirm synchronously ([`SendReceipt::sent`]) or hand
/// the frame off and confirm later ([`SendReceipt::queued`]); the dispatcher
/// treats both as success.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Sends one frame. `message.text` already fits a single packet.
    async fn send(&self, message: &OutboundMessage) -> TransportResult<SendReceipt>;

    /// Names of the radio nodes behind this transport.
    fn nodes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Shared handle to a radio transport.
pub type SharedRadio = Arc<dyn RadioTransport>;

/// Receives every persisted inbound text event, after persistence and before
/// the command router. Must not block; long work belongs on a spawned task.
pub trait EventObserver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once per inbound text event.
    fn observe(&self, event: &InboundEvent, channel_name: &str);
}

/// Accepts outbound messages on behalf of a producer such as the scheduler.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Delivers `message`, reporting the overall result.
    async fn deliver(&self, message: OutboundMessage, origin: Origin) -> SendResult;
}

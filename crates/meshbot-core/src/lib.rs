//! # meshbot core
//!
//! Data model and collaborator contracts shared by every meshbot crate.
//!
//! ## Layout
//!
//! - **Events**: [`InboundEvent`] and its addressing types ([`Destination`],
//!   [`ConversationId`]).
//! - **Sends**: [`OutboundMessage`], [`SendReceipt`], [`SendResult`].
//! - **Records**: stations, name history, conversation messages and history
//!   queries, as read and written by a [`Store`].
//! - **Seams**: [`Store`], [`RadioTransport`], [`EventObserver`] and
//!   [`MessageSink`], implemented by the store, transport and framework crates.
//! - **Errors**: the [`StoreError`] / [`PluginError`] / [`TransportError`] /
//!   [`DispatchError`] taxonomy.
//!
//! ## Data flow
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌──────────────┐
//! │   Radio   │────▶│            │────▶│   Commands   │
//! │ Scheduler │────▶│ Dispatcher │────▶│   Plugins    │
//! │  HTTP API │────▶│            │     └──────────────┘
//! └───────────┘     └────────────┘
//!                         │
//!                         ▼
//!                   ┌───────────┐
//!                   │   Store   │
//!                   └───────────┘
//! ```

pub mod error;
pub mod event;
pub mod message;
pub mod record;
pub mod store;
pub mod text;
pub mod transport;

pub use error::{
    DispatchError, DispatchResult, PluginError, PluginResult, StoreError, StoreResult,
    TransportError, TransportResult,
};
pub use event::{
    BROADCAST_ID, BROADCAST_NUM, ConversationId, Destination, Direction, EventKind, InboundEvent,
    Origin, PacketMeta, ParseConversationError, Payload, SenderNames, is_broadcast_id,
};
pub use message::{OutboundMessage, SendReceipt, SendResult, SendStatus};
pub use record::{
    ConversationMessage, HistoryPage, HistoryQuery, InboundRecord, MAX_HISTORY_PAGE, NameRecord,
    NewMessage, RecordOutcome, SortKey, SortOrder, Station, StationInfo, StationUpdate,
    StationUpsert, StoreStats,
};
pub use store::{SharedStore, Store};
pub use text::{MAX_TEXT_LEN, chunk_text, render_template};
pub use transport::{EventObserver, MessageSink, RadioTransport, SharedRadio};

/// Prelude for common imports.
pub mod prelude {
    pub use super::event::*;
    pub use super::message::*;
    pub use super::{PluginError, PluginResult};
}

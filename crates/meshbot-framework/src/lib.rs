//! # meshbot framework
//!
//! The pieces between a radio packet and a reply:
//!
//! - [`Dispatcher`]: persists every inbound event, runs observers, the
//!   command router and plugins, then sends queued replies. All outbound
//!   traffic (replies, scheduled jobs, API sends) goes through it.
//! - [`CommandRouter`]: built-in commands (`/help`, `/ping`, `/user`,
//!   `/stats`), template commands from config and plugin commands, with
//!   per-channel allow-lists and blocks.
//! - [`PluginRegistry`]: manifest discovery, the compiled-in plugin catalog,
//!   lifecycle hooks and sequential, fault-isolated dispatch.
//! - [`ApiFacade`]: read and send operations for the HTTP layer.
//!
//! The crate knows nothing about SQLite or sockets; it works against the
//! [`Store`](meshbot_core::Store) and
//! [`RadioTransport`](meshbot_core::RadioTransport) traits from
//! `meshbot-core`.

pub mod api;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod router;
pub mod settings;
pub mod stats;

pub use api::{ApiFacade, ApiScope};
pub use context::EventContext;
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherBuilder};
pub use error::{RegistryError, RegistryResult};
pub use plugin::{
    CommandProvider, CommandSpec, EventHandler, Outcome, PLUGIN_KINDS, Plugin, PluginDescriptor,
    PluginHost, PluginKind, PluginLifecycle, PluginRegistry, PluginSpec,
};
pub use router::{CommandMatch, CommandRouter};
pub use settings::{
    ChannelNames, ChannelRef, CommandBlocks, DispatchSettings, RouterSettings, TemplateCommand,
};
pub use stats::{DispatchCounters, StatsSnapshot, format_uptime};

/// Re-exported for `#[distributed_slice(PLUGIN_KINDS)]` in downstream crates.
pub use linkme;

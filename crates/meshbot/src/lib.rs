//! # meshbot
//!
//! A chat bot for mesh radio networks.
//!
//! ## Architecture
//!
//! ```text
//! radio nodes ──▶ RadioHub ──▶ Dispatcher ──┬──▶ SQLite store
//!                    ▲             │        ├──▶ command router ──▶ replies
//!                    │             │        ├──▶ plugins (event hooks, commands)
//!                    │             │        └──▶ webhook
//!                    └─────────────┴── sends ◀── scheduler, HTTP API
//! ```
//!
//! - **Dispatcher**: persists every packet, runs the matching command, then
//!   plugins in load order
//! - **Plugins**: manifest files in the plugin directory naming a registered kind
//! - **Scheduler**: daily, weekly, interval and cron jobs plus the heartbeat
//! - **HTTP API**: token-authenticated history, stats and send routes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meshbot::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     MeshRuntime::builder()
//!         .config_file("config.toml")
//!         .create_missing()
//!         .build()?
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `json-log`: JSON log lines (default)

pub use meshbot_core as core;
pub use meshbot_framework as framework;
pub use meshbot_runtime as runtime;
pub use meshbot_store as store;
pub use meshbot_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use meshbot::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use meshbot_runtime::{MeshConfig, MeshRuntime, RuntimeBuilder};

    // Plugin system
    pub use meshbot_framework::linkme::{self, distributed_slice};
    pub use meshbot_framework::{
        CommandProvider, CommandSpec, EventContext, EventHandler, Outcome, PLUGIN_KINDS, Plugin,
        PluginHost, PluginKind, PluginLifecycle, PluginSpec,
    };

    // Data model
    pub use meshbot_core::{
        ConversationId, Destination, InboundEvent, OutboundMessage, PluginError, PluginResult,
        SendResult,
    };
}

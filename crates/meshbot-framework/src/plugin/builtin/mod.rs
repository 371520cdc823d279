//! Plugins compiled into the catalog.
//!
//! Enabled by the `builtin-plugins` feature (on by default). Each plugin
//! registers its kind in [`PLUGIN_KINDS`](crate::plugin::PLUGIN_KINDS), so a
//! manifest only needs to name it:
//!
//! ```toml
//! # /plugins/10-greeter.plugin
//! kind = "greeter"
//!
//! [config]
//! throttle_seconds = 600
//! ```
//!
//! | Kind | Commands | Description |
//! |------|----------|-------------|
//! | [`greeter`] | `/hi2` | Answers `/hi2`, greets channels that say hello |

pub mod greeter;

//! Link-time catalog of plugin kinds.
//!
//! Each compiled-in plugin contributes one [`PluginKind`] entry:
//!
//! ```rust,ignore
//! #[distributed_slice(PLUGIN_KINDS)]
//! static GREETER: PluginKind = PluginKind {
//!     name: "greeter",
//!     description: "Greets the channel",
//!     create: Greeter::create,
//! };
//! ```

use linkme::distributed_slice;
use tracing::warn;

use meshbot_core::PluginResult;

use super::{Plugin, PluginSpec};

/// Creates a plugin from its manifest spec.
pub type PluginFactory = fn(&PluginSpec) -> PluginResult<Plugin>;

/// A compiled-in plugin kind.
#[derive(Debug, Clone, Copy)]
pub struct PluginKind {
    /// Name used by manifests (`kind = "..."`).
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// Factory.
    pub create: PluginFactory,
}

/// Every plugin kind linked into the binary.
#[distributed_slice]
pub static PLUGIN_KINDS: [PluginKind];

/// Looks up a compiled-in kind. The first registration of a name wins.
pub(crate) fn find(name: &str) -> Option<&'static PluginKind> {
    let mut matches = PLUGIN_KINDS.iter().filter(|k| k.name == name);
    let first = matches.next()?;
    let extra = matches.count();
    if extra > 0 {
        warn!(
            kind = name,
            count = extra + 1,
            "Multiple plugin kinds registered under one name, using first"
        );
    }
    Some(first)
}

//! Plugin descriptor: one discovered manifest.

use std::path::PathBuf;
use std::sync::Arc;

use super::Plugin;

/// One manifest found in the plugin directory.
///
/// `enabled` is computed once at discovery: files whose name starts with `_`
/// are listed but never loaded.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// File name, e.g. `10-greeter.plugin`. Determines load order.
    pub file_name: String,
    /// Full path to the manifest.
    pub path: PathBuf,
    /// Plugin name: the file stem.
    pub name: String,
    /// Position in byte-lexical file name order.
    pub load_order: usize,
    /// `false` for `_`-prefixed files.
    pub enabled: bool,
    /// Resolved kind, once the manifest was read.
    pub kind: Option<String>,
    /// The live plugin, for enabled manifests that loaded.
    pub plugin: Option<Arc<Plugin>>,
}

impl PluginDescriptor {
    /// `true` when the plugin loaded and participates in dispatch.
    pub fn is_active(&self) -> bool {
        self.enabled && self.plugin.is_some()
    }
}

//! Immutable settings handed to the router and dispatcher at construction.
//!
//! The runtime builds these from its configuration snapshot; tests build them
//! directly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshbot_core::MAX_TEXT_LEN;

// =============================================================================
// Channel names
// =============================================================================

/// Friendly names for channel indices.
#[derive(Debug, Clone, Default)]
pub struct ChannelNames {
    names: HashMap<u32, String>,
}

impl ChannelNames {
    /// Creates the lookup from an index -> name map. Blank names are ignored.
    pub fn new(names: HashMap<u32, String>) -> Self {
        let names = names
            .into_iter()
            .filter(|(_, name)| !name.trim().is_empty())
            .map(|(idx, name)| (idx, name.trim().to_string()))
            .collect();
        Self { names }
    }

    /// The configured name for `channel`, or `ch<n>`.
    pub fn name(&self, channel: u32) -> String {
        self.names
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| format!("ch{channel}"))
    }

    /// The index whose name matches `name` case-insensitively.
    pub fn index_of(&self, name: &str) -> Option<u32> {
        let wanted = name.trim().to_lowercase();
        self.names
            .iter()
            .find(|(_, n)| n.to_lowercase() == wanted)
            .map(|(idx, _)| *idx)
    }
}

/// A channel given either by index or by configured name.
///
/// Numeric strings (`"7"`, `"0x07"`) are read as indices. The marker `dm`
/// stands for direct messages where a list allows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelRef {
    /// Channel index.
    Index(u32),
    /// Channel name, numeric string or `dm`.
    Name(String),
}

impl ChannelRef {
    /// `true` for the `dm` marker.
    pub fn is_dm(&self) -> bool {
        matches!(self, Self::Name(s) if s.trim().eq_ignore_ascii_case("dm"))
    }

    /// Resolves to a channel index. `None` for `dm`, blanks and unknown names.
    pub fn resolve(&self, names: &ChannelNames) -> Option<u32> {
        match self {
            Self::Index(idx) => Some(*idx),
            Self::Name(raw) => {
                let s = raw.trim();
                if s.is_empty() || self.is_dm() {
                    return None;
                }
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    return u32::from_str_radix(hex, 16).ok();
                }
                if s.bytes().all(|b| b.is_ascii_digit()) {
                    return s.parse().ok();
                }
                names.index_of(s)
            }
        }
    }
}

/// Resolves a list of channel references into unique indices, preserving order.
pub fn resolve_channels(refs: &[ChannelRef], names: &ChannelNames) -> Vec<u32> {
    let mut out = Vec::new();
    for idx in refs.iter().filter_map(|r| r.resolve(names)) {
        if !out.contains(&idx) {
            out.push(idx);
        }
    }
    out
}

// =============================================================================
// Command settings
// =============================================================================

/// A configured command that answers with a rendered template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCommand {
    /// Exact text prefix that triggers the command.
    pub trigger: String,
    /// Response template (`{text}`, `{fromId}`, `{channel}`, `{channelName}`, `{node}`).
    pub response: String,
}

/// Per-command blocks, keyed by lowercased trigger.
#[derive(Debug, Clone, Default)]
pub struct CommandBlocks {
    channels: HashMap<String, Vec<u32>>,
    dm: HashSet<String>,
}

impl CommandBlocks {
    /// Builds blocks from `trigger -> [channel index | channel name | "dm"]`.
    pub fn resolve(raw: &HashMap<String, Vec<ChannelRef>>, names: &ChannelNames) -> Self {
        let mut blocks = Self::default();
        for (trigger, refs) in raw {
            let key = trigger.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            if refs.iter().any(ChannelRef::is_dm) {
                blocks.dm.insert(key.clone());
            }
            let channels = resolve_channels(refs, names);
            if !channels.is_empty() {
                blocks.channels.insert(key, channels);
            }
        }
        blocks
    }

    /// `true` when `key` may not run in this context.
    pub fn is_blocked(&self, key: &str, channel: u32, is_dm: bool) -> bool {
        if is_dm {
            return self.dm.contains(key);
        }
        self.channels
            .get(key)
            .is_some_and(|channels| channels.contains(&channel))
    }
}

/// Settings consumed by [`CommandRouter`](crate::router::CommandRouter).
#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    /// Global switch. When off nothing matches.
    pub commands_enabled: bool,
    /// Channels on which commands are answered. Empty means all. DMs are always allowed.
    pub allowed_channels: Vec<u32>,
    /// Configured template commands, in configuration order.
    pub templates: Vec<TemplateCommand>,
    /// Per-command blocks.
    pub blocks: CommandBlocks,
}

// =============================================================================
// Dispatch settings
// =============================================================================

/// Settings consumed by [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// How long `submit` waits for an event to finish processing.
    pub submit_timeout: Duration,
    /// Budget for one plugin hook or command invocation.
    pub plugin_timeout: Duration,
    /// Pause between the parts of a split message.
    pub part_delay: Duration,
    /// Longest text sent in one frame, prefix included.
    pub max_text_len: usize,
    /// Skip plugins after any matched command.
    pub command_halts_plugins: bool,
    /// Skip plugins for text that is not a command.
    pub strict: bool,
    /// Channel naming used for contexts and stored messages.
    pub channel_names: ChannelNames,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            plugin_timeout: Duration::from_secs(5),
            part_delay: Duration::from_secs(2),
            max_text_len: MAX_TEXT_LEN,
            command_halts_plugins: false,
            strict: false,
            channel_names: ChannelNames::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ChannelNames {
        ChannelNames::new(HashMap::from([(7, "Trusted".to_string()), (1, " ".to_string())]))
    }

    #[test]
    fn test_channel_name_fallback() {
        let names = names();
        assert_eq!(names.name(7), "Trusted");
        assert_eq!(names.name(1), "ch1");
        assert_eq!(names.name(3), "ch3");
        assert_eq!(names.index_of("trusted"), Some(7));
    }

    #[test]
    fn test_channel_ref_resolution() {
        let names = names();
        let refs = vec![
            ChannelRef::Index(2),
            ChannelRef::Name("Trusted".into()),
            ChannelRef::Name("0x07".into()),
            ChannelRef::Name("4".into()),
            ChannelRef::Name("nope".into()),
            ChannelRef::Name("dm".into()),
        ];
        assert_eq!(resolve_channels(&refs, &names), vec![2, 7, 4]);
    }

    #[test]
    fn test_command_blocks() {
        let raw = HashMap::from([
            (
                "/Ping".to_string(),
                vec![ChannelRef::Name("Trusted".into()), ChannelRef::Name("DM".into())],
            ),
            ("/stats".to_string(), vec![ChannelRef::Index(0)]),
        ]);
        let blocks = CommandBlocks::resolve(&raw, &names());
        assert!(blocks.is_blocked("/ping", 7, false));
        assert!(blocks.is_blocked("/ping", 0, true));
        assert!(!blocks.is_blocked("/ping", 0, false));
        assert!(blocks.is_blocked("/stats", 0, false));
        assert!(!blocks.is_blocked("/stats", 0, true));
    }
}

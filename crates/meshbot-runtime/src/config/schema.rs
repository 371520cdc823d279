//! Configuration schema definitions.
//!
//! Every section has defaults, so a partial file (or none at all, with
//! environment overrides only) still extracts.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshbot_framework::{
    ApiScope, ChannelNames, ChannelRef, CommandBlocks, DispatchSettings, RouterSettings,
    TemplateCommand, settings::resolve_channels,
};
use meshbot_store::StoreOptions;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Radio nodes to connect to.
    pub nodes: Vec<NodeConfig>,
    /// Bot behaviour.
    pub bot: BotConfig,
    /// Template commands.
    pub commands: CommandsConfig,
    /// Per-command blocks: trigger -> channel indices, names or `dm`.
    pub command_blocks: BTreeMap<String, Vec<ChannelRef>>,
    /// HTTP API.
    pub api: ApiConfig,
    /// SQLite store.
    pub db: DbConfig,
    /// Webhook forwarding of inbound text.
    pub webhook: WebhookConfig,
    /// Periodic heartbeat message.
    pub heartbeat: HeartbeatConfig,
    /// Scheduled messages.
    pub schedules: SchedulesConfig,
    /// Plugin loading.
    pub plugins: PluginsConfig,
    /// Dispatcher budgets.
    pub dispatch: DispatchConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl MeshConfig {
    /// Channel index to name mapping from `bot.channel_names`.
    pub fn channel_names(&self) -> ChannelNames {
        ChannelNames::new(self.bot.channel_index_names())
    }

    /// Settings for the command router.
    pub fn router_settings(&self) -> RouterSettings {
        let names = self.channel_names();
        let blocks: HashMap<String, Vec<ChannelRef>> = self
            .command_blocks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        RouterSettings {
            commands_enabled: self.bot.commands_enabled,
            allowed_channels: resolve_channels(&self.bot.channels, &names),
            templates: self
                .commands
                .list
                .iter()
                .filter(|c| !c.trigger.trim().is_empty() && !c.response.is_empty())
                .cloned()
                .collect(),
            blocks: CommandBlocks::resolve(&blocks, &names),
        }
    }

    /// Settings for the dispatcher.
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            submit_timeout: Duration::from_millis(self.dispatch.submit_timeout_ms),
            plugin_timeout: Duration::from_millis(self.plugins.timeout_ms),
            part_delay: Duration::from_millis(self.dispatch.part_delay_ms),
            max_text_len: self.dispatch.max_text_len,
            command_halts_plugins: self.dispatch.command_halts_plugins,
            strict: self.bot.strict,
            channel_names: self.channel_names(),
        }
    }

    /// Options for the SQLite store.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            history_limit: self.db.keep_per_conversation,
            busy_timeout: Duration::from_millis(self.db.busy_timeout_ms),
            pool_size: self.db.pool_size,
        }
    }
}

// =============================================================================
// Nodes & bot
// =============================================================================

/// One radio node, reached through a WebSocket bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name, used for routing sends and in stored messages.
    pub name: String,
    /// Bridge URL (`ws://` or `wss://`).
    pub url: String,
}

/// Bot behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Display name, used in logs.
    pub name: String,
    /// Channels on which commands are answered. Empty means all.
    pub channels: Vec<ChannelRef>,
    /// Channel index (as a string key, decimal or `0x` hex) to display name.
    pub channel_names: BTreeMap<String, String>,
    /// Skip plugins for text that is not a command.
    pub strict: bool,
    /// Global command switch.
    pub commands_enabled: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "meshbot".to_string(),
            channels: Vec::new(),
            channel_names: BTreeMap::new(),
            strict: false,
            commands_enabled: false,
        }
    }
}

impl BotConfig {
    /// `channel_names` with parsed keys. Unparseable keys are dropped.
    pub fn channel_index_names(&self) -> HashMap<u32, String> {
        self.channel_names
            .iter()
            .filter_map(|(k, v)| parse_index(k).map(|idx| (idx, v.clone())))
            .collect()
    }
}

/// Parses a decimal or `0x` hexadecimal channel index.
pub(crate) fn parse_index(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Template command list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Commands in matching order.
    pub list: Vec<TemplateCommand>,
}

// =============================================================================
// API, DB, webhook
// =============================================================================

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Whether to serve the API at all.
    pub enabled: bool,
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Tokens with full (send) access.
    pub tokens: Vec<String>,
    /// Tokens with read-only access.
    pub read_tokens: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            tokens: Vec::new(),
            read_tokens: Vec::new(),
        }
    }
}

impl ApiConfig {
    /// Token to scope map. A token listed in both lists gets full access.
    pub fn token_scopes(&self) -> HashMap<String, ApiScope> {
        let mut scopes = HashMap::new();
        let clean = |t: &String| Some(t.trim().to_string()).filter(|t| !t.is_empty());
        for token in self.read_tokens.iter().filter_map(clean) {
            scopes.insert(token, ApiScope::Read);
        }
        for token in self.tokens.iter().filter_map(clean) {
            scopes.insert(token, ApiScope::Send);
        }
        scopes
    }
}

/// SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Database file.
    pub path: PathBuf,
    /// Messages kept per conversation.
    pub keep_per_conversation: u32,
    /// Connection pool size.
    pub pool_size: u32,
    /// How long a writer waits for the database lock.
    pub busy_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/config/bot.db"),
            keep_per_conversation: 10_000,
            pool_size: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Webhook forwarding. An empty URL disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Target URL.
    pub url: String,
    /// Request timeout.
    pub timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_seconds: 5,
        }
    }
}

// =============================================================================
// Heartbeat & schedules
// =============================================================================

/// How the heartbeat is addressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatMode {
    /// Broadcast on `channel`.
    #[default]
    Broadcast,
    /// A direct message to each of `targets`.
    Dm,
}

/// Periodic heartbeat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Off by default.
    pub enabled: bool,
    /// Seconds between heartbeats.
    pub interval_seconds: u64,
    /// Message text; supports the schedule placeholders.
    pub message: String,
    /// Broadcast or direct messages.
    pub mode: HeartbeatMode,
    /// DM recipients in `dm` mode.
    pub targets: Vec<String>,
    /// Broadcast channel in `broadcast` mode.
    pub channel: u32,
    /// Radio node to send through.
    pub node: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 300,
            message: "❤️ heartbeat".to_string(),
            mode: HeartbeatMode::Broadcast,
            targets: Vec::new(),
            channel: 0,
            node: None,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulesConfig {
    /// Master switch for `items` (the heartbeat has its own).
    pub enabled: bool,
    /// IANA timezone the triggers are evaluated in.
    pub timezone: String,
    /// Scheduled jobs.
    pub items: Vec<ScheduleItemConfig>,
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "Europe/Berlin".to_string(),
            items: Vec::new(),
        }
    }
}

/// One scheduled message.
///
/// Exactly one trigger is used, checked in this order: `cron`,
/// `every_seconds`, `time` (daily, optionally limited to `days`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleItemConfig {
    /// Job name for logs and the `{job}` placeholder. Defaults to `job<n>`.
    pub name: String,
    /// Set to false to keep a job in the file without running it.
    pub enabled: bool,
    /// Daily `HH:MM`.
    pub time: String,
    /// Weekdays (`mon`..`sun`, longer spellings accepted). Empty means every day.
    pub days: Vec<String>,
    /// 5 or 6 field cron expression.
    pub cron: Option<String>,
    /// Fixed interval.
    pub every_seconds: Option<u64>,
    /// Channel to send on.
    pub channel: u32,
    /// Single destination, `^all` for broadcast.
    pub destination_id: String,
    /// Several destinations; overrides `destination_id` when non-empty.
    pub targets: Vec<String>,
    /// Message template.
    pub text: String,
    /// Radio node to send through.
    pub node: Option<String>,
}

impl Default for ScheduleItemConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            time: String::new(),
            days: Vec::new(),
            cron: None,
            every_seconds: None,
            channel: 0,
            destination_id: "^all".to_string(),
            targets: Vec::new(),
            text: String::new(),
            node: None,
        }
    }
}

impl ScheduleItemConfig {
    /// Destinations this job sends to.
    pub fn destinations(&self) -> Vec<String> {
        let targets: Vec<String> = self
            .targets
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if targets.is_empty() {
            vec![self.destination_id.clone()]
        } else {
            targets
        }
    }
}

// =============================================================================
// Plugins & dispatch
// =============================================================================

/// Plugin loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Whether to load manifests at all.
    pub enabled: bool,
    /// Manifest directory.
    pub path: PathBuf,
    /// Seconds between `on_tick` calls. 0 disables ticking.
    pub tick_interval_seconds: u64,
    /// Budget for one plugin hook.
    pub timeout_ms: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/plugins"),
            tick_interval_seconds: 60,
            timeout_ms: 5_000,
        }
    }
}

/// Dispatcher budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long a producer waits for one event.
    pub submit_timeout_ms: u64,
    /// Pause between parts of a split message.
    pub part_delay_ms: u64,
    /// Longest frame text, part prefix included.
    pub max_text_len: usize,
    /// Skip plugins after a matched command.
    pub command_halts_plugins: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: 30_000,
            part_delay_ms: 2_000,
            max_text_len: meshbot_core::MAX_TEXT_LEN,
            command_halts_plugins: false,
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    #[default]
    Info,
    /// Warnings.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Parses a level name case-insensitively; `warning` is accepted.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Lowercase name, as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// The matching `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line, abbreviated.
    #[default]
    Compact,
    /// Single-line, with all span fields.
    Full,
    /// Multi-line, human friendly.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
    /// `file_path`.
    File,
}

/// Logging settings. `RUST_LOG` overrides `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level name (`trace`..`error`, `WARNING` accepted).
    pub level: String,
    /// Line format.
    pub format: LogFormat,
    /// Destination.
    pub output: LogOutput,
    /// Log file for `output = "file"`.
    pub file_path: Option<PathBuf>,
    /// Per-module levels, e.g. `meshbot_store = "debug"`.
    pub filters: BTreeMap<String, String>,
    /// Log span open and close events.
    pub span_events: bool,
    /// Include thread ids.
    pub thread_ids: bool,
    /// Include source file and line.
    pub file_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            filters: BTreeMap::new(),
            span_events: false,
            thread_ids: false,
            file_location: false,
        }
    }
}

impl LoggingConfig {
    /// Parsed level, falling back to info.
    pub fn level(&self) -> LogLevel {
        LogLevel::parse(&self.level).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_accept_hex_keys() {
        let bot = BotConfig {
            channel_names: BTreeMap::from([
                ("7".to_string(), "Trusted".to_string()),
                ("0x02".to_string(), "Ops".to_string()),
                ("bogus".to_string(), "Nope".to_string()),
            ]),
            ..BotConfig::default()
        };
        let names = bot.channel_index_names();
        assert_eq!(names.len(), 2);
        assert_eq!(names[&2], "Ops");
        assert_eq!(names[&7], "Trusted");
    }

    #[test]
    fn test_router_settings_resolve_names() {
        let mut config = MeshConfig::default();
        config.bot.commands_enabled = true;
        config.bot.channel_names = BTreeMap::from([("7".to_string(), "Trusted".to_string())]);
        config.bot.channels = vec![ChannelRef::Name("Trusted".into()), ChannelRef::Index(0)];
        config.command_blocks.insert(
            "/ping".to_string(),
            vec![ChannelRef::Name("dm".into()), ChannelRef::Index(7)],
        );

        let router = config.router_settings();
        assert_eq!(router.allowed_channels, [7, 0]);
        assert!(router.blocks.is_blocked("/ping", 7, false));
        assert!(router.blocks.is_blocked("/ping", 0, true));
        assert!(!router.blocks.is_blocked("/ping", 0, false));
    }

    #[test]
    fn test_token_scopes() {
        let api = ApiConfig {
            tokens: vec!["full".into(), " ".into()],
            read_tokens: vec!["ro".into(), "full".into()],
            ..ApiConfig::default()
        };
        let scopes = api.token_scopes();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes["full"], ApiScope::Send);
        assert_eq!(scopes["ro"], ApiScope::Read);
    }

    #[test]
    fn test_schedule_destinations() {
        let item = ScheduleItemConfig::default();
        assert_eq!(item.destinations(), ["^all"]);
        let item = ScheduleItemConfig {
            targets: vec!["!a".into(), "".into(), "!b".into()],
            ..ScheduleItemConfig::default()
        };
        assert_eq!(item.destinations(), ["!a", "!b"]);
    }

    #[test]
    fn test_log_level_accepts_warning() {
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("Trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
    }
}

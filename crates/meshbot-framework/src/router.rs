//! Command matching and built-in commands.
//!
//! [`CommandRouter::match_text`] walks a fixed priority list and returns the
//! first hit:
//!
//! 1. built-ins (`/help`, `/ping`, `/user`, `/stats`), matched
//!    case-insensitively by prefix;
//! 2. configured template commands, matched by exact prefix;
//! 3. plugin commands, by exact prefix, in plugin load order.
//!
//! [`route`](CommandRouter::route) adds scoping on top: the channel allow-list
//! and per-command blocks. A blocked command is treated as no match.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use meshbot_core::{PluginError, PluginResult, SharedStore, SortOrder, render_template};

use crate::context::EventContext;
use crate::plugin::{CommandSpec, Outcome, PluginRegistry};
use crate::settings::RouterSettings;
use crate::stats::{DispatchCounters, StatsSnapshot};

/// Name history entries shown by `/user`.
const USER_NAME_LIMIT: u32 = 20;

/// Built-in commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Help,
    Ping,
    User,
    Stats,
}

impl Builtin {
    const ALL: [Builtin; 4] = [Builtin::Help, Builtin::Ping, Builtin::User, Builtin::Stats];

    /// The trigger, e.g. `/ping`.
    pub fn trigger(&self) -> &'static str {
        match self {
            Self::Help => "/help",
            Self::Ping => "/ping",
            Self::User => "/user",
            Self::Stats => "/stats",
        }
    }
}

/// Who answers a matched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandHandler {
    /// A built-in command.
    Builtin(Builtin),
    /// A configured template, by index.
    Template(usize),
    /// A plugin-declared command.
    Plugin(String),
}

/// A successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMatch {
    /// Lowercased trigger, used for blocks and logs.
    pub key: String,
    /// The trigger as declared.
    pub trigger: String,
    /// Text after the trigger, trimmed.
    pub args: String,
    /// Who answers.
    pub handler: CommandHandler,
}

/// Matches inbound text against built-in, template and plugin commands.
pub struct CommandRouter {
    settings: RouterSettings,
    store: SharedStore,
    counters: Arc<DispatchCounters>,
    plugins: Arc<PluginRegistry>,
    plugin_commands: Vec<(String, CommandSpec)>,
}

impl CommandRouter {
    /// Creates a router. Plugin commands are read from `plugins` once, here.
    pub fn new(
        settings: RouterSettings,
        store: SharedStore,
        counters: Arc<DispatchCounters>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        let plugin_commands: Vec<_> = plugins
            .command_specs()
            .into_iter()
            .filter(|(_, spec)| !spec.trigger.trim().is_empty())
            .collect();
        info!(
            enabled = settings.commands_enabled,
            templates = settings.templates.len(),
            plugin_commands = plugin_commands.len(),
            "Command router ready"
        );
        Self {
            settings,
            store,
            counters,
            plugins,
            plugin_commands,
        }
    }

    /// Whether commands are answered at all.
    pub fn commands_enabled(&self) -> bool {
        self.settings.commands_enabled
    }

    /// Finds the command `text` invokes. Always `None` when commands are off.
    pub fn match_text(&self, text: &str) -> Option<CommandMatch> {
        if !self.settings.commands_enabled {
            return None;
        }
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let lower = text.to_lowercase();

        for builtin in Builtin::ALL {
            let trigger = builtin.trigger();
            if lower.starts_with(trigger) {
                return Some(CommandMatch {
                    key: trigger.to_string(),
                    trigger: trigger.to_string(),
                    args: text.get(trigger.len()..).unwrap_or_default().trim().to_string(),
                    handler: CommandHandler::Builtin(builtin),
                });
            }
        }

        let exact = |trigger: &str, handler: CommandHandler| {
            let trigger = trigger.trim();
            let args = text.strip_prefix(trigger)?;
            (!trigger.is_empty()).then(|| CommandMatch {
                key: trigger.to_lowercase(),
                trigger: trigger.to_string(),
                args: args.trim().to_string(),
                handler,
            })
        };

        self.settings
            .templates
            .iter()
            .enumerate()
            .find_map(|(idx, t)| exact(&t.trigger, CommandHandler::Template(idx)))
            .or_else(|| {
                self.plugin_commands.iter().find_map(|(plugin, spec)| {
                    exact(&spec.trigger, CommandHandler::Plugin(plugin.clone()))
                })
            })
    }

    /// Matches the context's text and applies the allow-list and blocks.
    pub fn route(&self, ctx: &EventContext) -> Option<CommandMatch> {
        let text = ctx.text()?;
        let event = ctx.event();
        let is_dm = ctx.is_direct();

        if !is_dm
            && !self.settings.allowed_channels.is_empty()
            && !self.settings.allowed_channels.contains(&event.channel_id)
        {
            return None;
        }

        let matched = self.match_text(text)?;
        if self
            .settings
            .blocks
            .is_blocked(&matched.key, event.channel_id, is_dm)
        {
            info!(
                command = %matched.key,
                channel = event.channel_id,
                dm = is_dm,
                "Command blocked"
            );
            return None;
        }
        Some(matched)
    }

    /// Runs a matched command. Replies are queued on `ctx`.
    pub async fn invoke(&self, matched: &CommandMatch, ctx: &EventContext) -> PluginResult<Outcome> {
        debug!(command = %matched.key, "Invoking command");
        match &matched.handler {
            CommandHandler::Builtin(builtin) => {
                let reply = self.builtin(*builtin, matched, ctx).await?;
                ctx.reply(reply);
                Ok(Outcome::Continue)
            }
            CommandHandler::Template(idx) => {
                let Some(template) = self.settings.templates.get(*idx) else {
                    return Ok(Outcome::Continue);
                };
                ctx.reply(self.render(&template.response, ctx));
                Ok(Outcome::Continue)
            }
            CommandHandler::Plugin(plugin) => {
                self.plugins
                    .invoke_command(plugin, &matched.trigger, &matched.args, ctx)
                    .await
            }
        }
    }

    fn render(&self, template: &str, ctx: &EventContext) -> String {
        let event = ctx.event();
        let text = ctx.text().unwrap_or_default();
        let channel = event.channel_id.to_string();
        let node = event.node_key.as_deref().unwrap_or_default();
        render_template(
            template,
            &[
                ("text", text),
                ("fromId", &event.source_id),
                ("channel", &channel),
                ("channelName", ctx.channel_name()),
                ("node", node),
            ],
        )
    }

    // ─── Built-ins ───────────────────────────────────────────────────────────

    async fn builtin(
        &self,
        builtin: Builtin,
        matched: &CommandMatch,
        ctx: &EventContext,
    ) -> PluginResult<String> {
        let failed = |e: meshbot_core::StoreError| PluginError::failed(builtin.trigger(), e);
        match builtin {
            Builtin::Help => Ok(self.help()),
            Builtin::Ping => self.ping(ctx).await.map_err(failed),
            Builtin::Stats => StatsSnapshot::collect(self.store.as_ref(), &self.counters)
                .await
                .map(|s| s.summary())
                .map_err(failed),
            Builtin::User => {
                let target = matched
                    .args
                    .split_whitespace()
                    .next()
                    .unwrap_or_else(|| ctx.sender());
                self.user(target).await.map_err(failed)
            }
        }
    }

    fn help(&self) -> String {
        let mut lines = vec![
            format!("Help (v{})", env!("CARGO_PKG_VERSION")),
            "/ping".to_string(),
            "/user".to_string(),
            "/user <!idxxx>".to_string(),
            "/stats".to_string(),
        ];
        lines.extend(self.settings.templates.iter().map(|t| t.trigger.clone()));
        lines.extend(self.plugin_commands.iter().map(|(_, spec)| {
            if spec.description.is_empty() {
                spec.trigger.clone()
            } else {
                format!("{} - {}", spec.trigger, spec.description)
            }
        }));
        lines.join("\n")
    }

    async fn ping(&self, ctx: &EventContext) -> meshbot_core::StoreResult<String> {
        let event = ctx.event();
        let mut short = event.sender.short.clone().unwrap_or_default();
        if short.is_empty() {
            short = self
                .store
                .latest_names(&event.source_id)
                .await?
                .and_then(|names| names.short)
                .unwrap_or_default();
        }
        if short.is_empty() {
            short = if event.source_id.is_empty() {
                "unknown".to_string()
            } else {
                event.source_id.clone()
            };
        }
        Ok(format!(
            "Pong {short} | hops={} | via={}",
            event.meta.hops(),
            event.meta.via()
        ))
    }

    async fn user(&self, node_id: &str) -> meshbot_core::StoreResult<String> {
        let Some(info) = self
            .store
            .station_info(node_id, USER_NAME_LIMIT, SortOrder::Desc)
            .await?
        else {
            return Ok(format!("No data for {node_id}"));
        };

        let mut lines = vec![
            format!("ID: {node_id}"),
            format!("First: {}", utc(info.station.first_seen_at)),
            format!("Names: {}", info.name_entries),
            "History:".to_string(),
        ];
        if info.name_history.is_empty() {
            lines.push("- (no names recorded yet)".to_string());
        }
        for entry in &info.name_history {
            lines.push(format!(
                "- {} | ({}) {}",
                utc(entry.changed_at),
                entry.short_name.as_deref().unwrap_or("-"),
                entry.long_name.as_deref().unwrap_or("-"),
            ));
        }
        Ok(lines.join("\n"))
    }
}

fn utc(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

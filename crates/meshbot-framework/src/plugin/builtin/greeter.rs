//! Greeter plugin.
//!
//! - `/hi2` answers with a fixed reply.
//! - Channel text containing `hello` triggers a greeting on that channel, at
//!   most once per `throttle_seconds` across all channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkme::distributed_slice;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use meshbot_core::{OutboundMessage, PluginResult};

use crate::context::EventContext;
use crate::plugin::{
    CommandProvider, CommandSpec, EventHandler, Outcome, PLUGIN_KINDS, Plugin, PluginHost,
    PluginKind, PluginLifecycle, PluginSpec,
};

#[distributed_slice(PLUGIN_KINDS)]
static GREETER: PluginKind = PluginKind {
    name: "greeter",
    description: "Answers /hi2 and greets channels that say hello",
    create: Greeter::create,
};

/// `[config]` table of a greeter manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GreeterConfig {
    /// Command trigger.
    pub trigger: String,
    /// Reply to the trigger.
    pub reply: String,
    /// Greeting sent when a channel says hello.
    pub greeting: String,
    /// Minimum seconds between greetings.
    pub throttle_seconds: u64,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            trigger: "/hi2".to_string(),
            reply: "Hi from /hi2 (plugin)!".to_string(),
            greeting: "👋 Hello from the greeter plugin!".to_string(),
            throttle_seconds: 600,
        }
    }
}

/// The greeter plugin.
#[derive(Debug)]
pub struct Greeter {
    config: GreeterConfig,
    last_greeting: Mutex<Option<Instant>>,
}

impl Greeter {
    /// Creates a greeter with `config`.
    pub fn new(config: GreeterConfig) -> Self {
        Self {
            config,
            last_greeting: Mutex::new(None),
        }
    }

    /// Catalog factory.
    pub fn create(spec: &PluginSpec) -> PluginResult<Plugin> {
        let greeter = Arc::new(Self::new(spec.config()?));
        Plugin::builder(&spec.name)
            .events(greeter.clone())
            .commands(greeter.clone())
            .lifecycle(greeter)
            .build()
    }

    /// Claims the greeting slot if the throttle window has passed.
    fn try_claim(&self) -> bool {
        let window = Duration::from_secs(self.config.throttle_seconds);
        let now = Instant::now();
        let mut last = self.last_greeting.lock();
        match *last {
            Some(at) if now.duration_since(at) < window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl EventHandler for Greeter {
    async fn on_event(&self, ctx: &EventContext) -> PluginResult<Outcome> {
        let Some(text) = ctx.text() else {
            return Ok(Outcome::Continue);
        };
        if ctx.is_direct() || !text.to_lowercase().contains("hello") {
            return Ok(Outcome::Continue);
        }
        if !self.try_claim() {
            debug!("Greeting throttled");
            return Ok(Outcome::Continue);
        }

        let event = ctx.event();
        let mut greeting = OutboundMessage::broadcast(event.channel_id, &self.config.greeting);
        if let Some(node) = &event.node_key {
            greeting = greeting.with_node(node);
        }
        ctx.send(greeting);
        Ok(Outcome::Continue)
    }
}

#[async_trait]
impl CommandProvider for Greeter {
    fn commands(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::new(&self.config.trigger, "say hi")]
    }

    async fn on_command(
        &self,
        _trigger: &str,
        _args: &str,
        ctx: &EventContext,
    ) -> PluginResult<Outcome> {
        ctx.reply(&self.config.reply);
        Ok(Outcome::Stop)
    }
}

#[async_trait]
impl PluginLifecycle for Greeter {
    async fn on_start(&self, _host: &PluginHost) -> PluginResult<()> {
        info!(trigger = %self.config.trigger, "Greeter ready");
        Ok(())
    }

    async fn on_stop(&self) -> PluginResult<()> {
        info!("Greeter stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbot_core::{Destination, InboundEvent};

    fn channel_ctx(text: &str) -> EventContext {
        EventContext::new(
            Arc::new(InboundEvent::text("!a", 2, text).with_node_key("roof")),
            "ch2",
        )
    }

    #[test]
    fn test_kind_is_in_catalog() {
        assert!(PLUGIN_KINDS.iter().any(|k| k.name == "greeter"));
        let plugin = Greeter::create(&PluginSpec::new("10-greeter", "greeter")).unwrap();
        assert_eq!(plugin.name(), "10-greeter");
        assert!(plugin.events().is_some());
        assert!(plugin.commands().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_is_throttled() {
        let greeter = Greeter::new(GreeterConfig::default());

        let first = channel_ctx("Hello mesh");
        greeter.on_event(&first).await.unwrap();
        let sent = first.take_outbox();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, 2);
        assert_eq!(sent[0].node.as_deref(), Some("roof"));
        assert!(sent[0].target.is_broadcast());

        let second = channel_ctx("hello again");
        greeter.on_event(&second).await.unwrap();
        assert_eq!(second.pending(), 0);

        tokio::time::advance(Duration::from_secs(601)).await;
        let third = channel_ctx("HELLO");
        greeter.on_event(&third).await.unwrap();
        assert_eq!(third.pending(), 1);
    }

    #[tokio::test]
    async fn test_direct_messages_are_not_greeted() {
        let greeter = Greeter::new(GreeterConfig::default());
        let ctx = EventContext::new(
            Arc::new(
                InboundEvent::text("!a", 0, "hello bot")
                    .with_destination(Destination::Node("!bot".into())),
            ),
            "DM",
        );
        greeter.on_event(&ctx).await.unwrap();
        assert_eq!(ctx.pending(), 0);
    }

    #[tokio::test]
    async fn test_hi2_replies_and_stops() {
        let greeter = Greeter::new(GreeterConfig::default());
        let ctx = channel_ctx("/hi2");
        let outcome = greeter.on_command("/hi2", "", &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Stop);
        let sent = ctx.take_outbox();
        assert_eq!(sent[0].text, "Hi from /hi2 (plugin)!");
    }
}

//! Plugin contract and loading.
//!
//! A plugin is a named set of capabilities:
//!
//! - [`EventHandler`]: sees every dispatched event, may reply or stop the chain;
//!   optionally observes every outbound frame.
//! - [`CommandProvider`]: declares command triggers and answers them.
//! - [`PluginLifecycle`]: `on_start` / `on_stop` / `on_tick`. Start and tick
//!   receive a [`PluginHost`] for sends that answer no event.
//!
//! A plugin declares the capabilities it implements when it is built:
//!
//! ```rust,ignore
//! let greeter = Arc::new(Greeter::new(cfg));
//! let plugin = Plugin::builder("greeter")
//!     .events(greeter.clone())
//!     .commands(greeter.clone())
//!     .lifecycle(greeter)
//!     .build()?;
//! ```
//!
//! Plugins are created from manifest files by the [`PluginRegistry`], which
//! resolves each manifest's `kind` against the compiled-in [`PLUGIN_KINDS`]
//! catalog and any kinds registered at runtime.

mod catalog;
mod descriptor;
mod host;
mod registry;

#[cfg(feature = "builtin-plugins")]
pub mod builtin;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use meshbot_core::{OutboundMessage, Origin, PluginError, PluginResult};

use crate::context::EventContext;

pub use catalog::{PLUGIN_KINDS, PluginFactory, PluginKind};
pub use descriptor::PluginDescriptor;
pub use host::PluginHost;
pub use registry::{PluginRegistry, PluginRun};

// =============================================================================
// Capability traits
// =============================================================================

/// What the dispatcher does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Keep going.
    #[default]
    Continue,
    /// End the plugin chain for this event.
    Stop,
}

/// Receives dispatched events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once per event, in plugin load order.
    async fn on_event(&self, ctx: &EventContext) -> PluginResult<Outcome>;

    /// Called after each outbound frame reached the radio.
    async fn on_outbound(&self, _message: &OutboundMessage, _origin: Origin) {}
}

/// A command trigger declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Exact text prefix, e.g. `/hi2`.
    pub trigger: String,
    /// One-line description for `/help`.
    #[serde(default)]
    pub description: String,
}

impl CommandSpec {
    /// Creates a command spec.
    pub fn new(trigger: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            description: description.into(),
        }
    }
}

/// Declares and answers commands.
#[async_trait]
pub trait CommandProvider: Send + Sync {
    /// Triggers this plugin answers. Read once when the router is built.
    fn commands(&self) -> Vec<CommandSpec>;

    /// Handles a matched trigger. `args` is the text after the trigger, trimmed.
    async fn on_command(
        &self,
        trigger: &str,
        args: &str,
        ctx: &EventContext,
    ) -> PluginResult<Outcome>;
}

/// Start, stop and periodic hooks.
#[async_trait]
pub trait PluginLifecycle: Send + Sync {
    /// Called once after loading, in load order. `host` may be kept.
    async fn on_start(&self, _host: &PluginHost) -> PluginResult<()> {
        Ok(())
    }

    /// Called once at shutdown, in reverse load order.
    async fn on_stop(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Called once per tick interval.
    async fn on_tick(&self, _now: DateTime<Utc>, _host: &PluginHost) -> PluginResult<()> {
        Ok(())
    }
}

// =============================================================================
// Plugin
// =============================================================================

/// A loaded plugin: a name plus the capabilities it declared.
#[derive(Clone)]
pub struct Plugin {
    name: String,
    events: Option<Arc<dyn EventHandler>>,
    commands: Option<Arc<dyn CommandProvider>>,
    lifecycle: Option<Arc<dyn PluginLifecycle>>,
}

impl Plugin {
    /// Starts building a plugin named `name`.
    pub fn builder(name: impl Into<String>) -> PluginBuilder {
        PluginBuilder {
            name: name.into(),
            events: None,
            commands: None,
            lifecycle: None,
        }
    }

    /// Plugin name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event handler capability, if declared.
    pub fn events(&self) -> Option<&Arc<dyn EventHandler>> {
        self.events.as_ref()
    }

    /// The command capability, if declared.
    pub fn commands(&self) -> Option<&Arc<dyn CommandProvider>> {
        self.commands.as_ref()
    }

    /// The lifecycle capability, if declared.
    pub fn lifecycle(&self) -> Option<&Arc<dyn PluginLifecycle>> {
        self.lifecycle.as_ref()
    }

    pub(crate) fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("events", &self.events.is_some())
            .field("commands", &self.commands.is_some())
            .field("lifecycle", &self.lifecycle.is_some())
            .finish()
    }
}

/// Builder returned by [`Plugin::builder`].
pub struct PluginBuilder {
    name: String,
    events: Option<Arc<dyn EventHandler>>,
    commands: Option<Arc<dyn CommandProvider>>,
    lifecycle: Option<Arc<dyn PluginLifecycle>>,
}

impl PluginBuilder {
    /// Declares the event handler capability.
    pub fn events(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// Declares the command capability.
    pub fn commands(mut self, provider: Arc<dyn CommandProvider>) -> Self {
        self.commands = Some(provider);
        self
    }

    /// Declares the lifecycle capability.
    pub fn lifecycle(mut self, hooks: Arc<dyn PluginLifecycle>) -> Self {
        self.lifecycle = Some(hooks);
        self
    }

    /// Finishes the plugin. Fails when no capability was declared.
    pub fn build(self) -> PluginResult<Plugin> {
        if self.events.is_none() && self.commands.is_none() && self.lifecycle.is_none() {
            return Err(PluginError::invalid_config(
                self.name,
                "plugin declares no capabilities",
            ));
        }
        Ok(Plugin {
            name: self.name,
            events: self.events,
            commands: self.commands,
            lifecycle: self.lifecycle,
        })
    }
}

// =============================================================================
// Plugin spec
// =============================================================================

/// What a factory receives: the manifest's name, kind and `[config]` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSpec {
    /// Plugin name (the manifest's file stem).
    pub name: String,
    /// Kind that selected the factory.
    pub kind: String,
    /// The manifest's `[config]` table, or an empty object.
    pub config: serde_json::Value,
}

impl PluginSpec {
    /// Creates a spec with an empty config.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            config: serde_json::Value::Object(Default::default()),
        }
    }

    /// Replaces the config table.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Deserializes the config table into `T`.
    ///
    /// Use `#[serde(default)]` on `T` to make every field optional.
    pub fn config<T: DeserializeOwned>(&self) -> PluginResult<T> {
        T::deserialize(&self.config).map_err(|e| PluginError::invalid_config(&self.name, e))
    }
}

// =============================================================================
// Guarded invocation
// =============================================================================

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one plugin hook, turning a panic or a budget overrun into a
/// [`PluginError`].
pub(crate) async fn guarded<T, F>(plugin: &str, budget: Duration, hook: F) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>>,
{
    match tokio::time::timeout(budget, AssertUnwindSafe(hook).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(PluginError::Panicked {
            plugin: plugin.to_string(),
            message: panic_message(payload.as_ref()),
        }),
        Err(_) => Err(PluginError::TimedOut {
            plugin: plugin.to_string(),
            budget,
        }),
    }
}

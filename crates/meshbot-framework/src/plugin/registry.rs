//! Plugin discovery, loading, lifecycle and per-event dispatch.
//!
//! [`PluginRegistry`] owns every loaded plugin. It:
//!
//! - Discovers manifests (`*.plugin`, `*.toml`) in one directory, ordered by
//!   byte-lexical file name. Files starting with `_` are listed as disabled.
//! - Resolves each manifest's `kind` against runtime-registered factories
//!   first, then the link-time [`PLUGIN_KINDS`](super::PLUGIN_KINDS) catalog.
//! - Skips (and logs) manifests that fail to parse, name an unknown kind, or
//!   whose factory fails or panics; the rest still load.
//! - Dispatches events to active plugins **sequentially** in load order,
//!   honouring [`Outcome::Stop`] and
//!   [`EventContext::stop_propagation`]. Every hook runs under the plugin time
//!   budget with panics caught, so one faulty plugin never affects another.
//!
//! The registry is built mutably at startup and then shared read-only
//! (`Arc<PluginRegistry>`) by the router and the dispatcher.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use figment::Figment;
use figment::providers::{Format, Toml};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{Instrument, Level, debug, info, span, warn};

use meshbot_core::{OutboundMessage, Origin, PluginError, PluginResult};

use super::catalog;
use super::descriptor::PluginDescriptor;
use super::{CommandSpec, Outcome, Plugin, PluginHost, PluginSpec, guarded};
use crate::context::EventContext;
use crate::error::{RegistryError, RegistryResult};

/// File extensions recognised as plugin manifests.
const MANIFEST_EXTENSIONS: &[&str] = &["plugin", "toml"];

type DynFactory = Arc<dyn Fn(&PluginSpec) -> PluginResult<Plugin> + Send + Sync>;

/// Manifest file contents.
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    kind: Option<String>,
    #[serde(default)]
    config: Map<String, Value>,
}

/// What one plugin's event hook returned.
#[derive(Debug)]
pub struct PluginRun {
    /// Plugin name.
    pub plugin: String,
    /// Hook result.
    pub result: PluginResult<Outcome>,
}

// =============================================================================
// PluginRegistry
// =============================================================================

/// Ordered set of loaded plugins.
pub struct PluginRegistry {
    kinds: HashMap<String, DynFactory>,
    descriptors: Vec<PluginDescriptor>,
    hook_timeout: Duration,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("descriptors", &self.descriptors)
            .field("hook_timeout", &self.hook_timeout)
            .finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry with a 5 s hook budget.
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
            descriptors: Vec::new(),
            hook_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the budget for each plugin hook invocation.
    pub fn with_hook_timeout(mut self, budget: Duration) -> Self {
        self.hook_timeout = budget;
        self
    }

    /// Budget for each plugin hook invocation.
    pub fn hook_timeout(&self) -> Duration {
        self.hook_timeout
    }

    // ─── Kinds ───────────────────────────────────────────────────────────────

    /// Registers a factory for `kind`. Overrides a compiled-in kind of the same name.
    pub fn register_kind<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&PluginSpec) -> PluginResult<Plugin> + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!(kind = %kind, "Plugin kind registered");
        self.kinds.insert(kind, Arc::new(factory));
    }

    /// `true` if manifests may use `kind`.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind) || catalog::find(kind).is_some()
    }

    fn factory(&self, kind: &str) -> Option<DynFactory> {
        if let Some(f) = self.kinds.get(kind) {
            return Some(Arc::clone(f));
        }
        catalog::find(kind).map(|k| {
            let create = k.create;
            Arc::new(move |spec: &PluginSpec| create(spec)) as DynFactory
        })
    }

    // ─── Discovery and loading ───────────────────────────────────────────────

    /// Lists manifests in `dir` in load order without loading them.
    ///
    /// A missing directory yields an empty list.
    pub fn discover(dir: &Path) -> RegistryResult<Vec<PluginDescriptor>> {
        if !dir.is_dir() {
            info!(path = %dir.display(), "Plugin directory not found");
            return Ok(Vec::new());
        }

        let read_err = |e: std::io::Error| RegistryError::Directory {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let is_manifest = path
                .extension()
                .and_then(OsStr::to_str)
                .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext));
            if !path.is_file() || !is_manifest {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
                warn!(path = %path.display(), "Skipping plugin file with non UTF-8 name");
                continue;
            };
            files.push((file_name.to_string(), path.clone()));
        }
        files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        Ok(files
            .into_iter()
            .enumerate()
            .map(|(load_order, (file_name, path))| {
                let name = path
                    .file_stem()
                    .and_then(OsStr::to_str)
                    .unwrap_or(file_name.as_str())
                    .to_string();
                PluginDescriptor {
                    enabled: !file_name.starts_with('_'),
                    file_name,
                    path,
                    name,
                    load_order,
                    kind: None,
                    plugin: None,
                }
            })
            .collect())
    }

    /// Discovers and loads every enabled manifest in `dir`, replacing any
    /// previously loaded set.
    pub fn load(&mut self, dir: &Path) -> RegistryResult<&[PluginDescriptor]> {
        let mut descriptors = Self::discover(dir)?;
        info!(
            path = %dir.display(),
            files = descriptors.len(),
            "Loading plugins"
        );

        for desc in descriptors.iter_mut() {
            if !desc.enabled {
                info!(file = %desc.file_name, "Plugin disabled by file name");
                continue;
            }
            match self.instantiate(desc) {
                Ok(plugin) => {
                    info!(plugin = %plugin.name(), file = %desc.file_name, "Plugin loaded");
                    desc.plugin = Some(Arc::new(plugin));
                }
                Err(e) => {
                    warn!(file = %desc.file_name, error = %e, "Skipping plugin");
                }
            }
        }

        self.descriptors = descriptors;
        Ok(&self.descriptors)
    }

    fn instantiate(&self, desc: &mut PluginDescriptor) -> RegistryResult<Plugin> {
        let raw = std::fs::read_to_string(&desc.path)
            .map_err(|e| RegistryError::manifest(&desc.file_name, e))?;
        let manifest: Manifest = Figment::from(Toml::string(&raw))
            .extract()
            .map_err(|e| RegistryError::manifest(&desc.file_name, e))?;

        let kind = manifest
            .kind
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| desc.name.clone());
        desc.kind = Some(kind.clone());

        let factory = self.factory(&kind).ok_or_else(|| RegistryError::UnknownKind {
            file: desc.file_name.clone(),
            kind: kind.clone(),
        })?;

        let spec = PluginSpec::new(&desc.name, &kind).with_config(Value::Object(manifest.config));
        match catch_unwind(AssertUnwindSafe(|| factory(&spec))) {
            Ok(Ok(plugin)) => Ok(plugin.renamed(&desc.name)),
            Ok(Err(e)) => Err(RegistryError::factory(&desc.file_name, e)),
            Err(_) => Err(RegistryError::factory(&desc.file_name, "factory panicked")),
        }
    }

    /// Appends an already built plugin after the loaded ones.
    pub fn add(&mut self, plugin: Plugin) {
        let name = plugin.name().to_string();
        self.descriptors.push(PluginDescriptor {
            file_name: name.clone(),
            path: Default::default(),
            name,
            load_order: self.descriptors.len(),
            enabled: true,
            kind: None,
            plugin: Some(Arc::new(plugin)),
        });
    }

    /// Every discovered manifest, in load order, including disabled ones.
    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    /// Loaded plugins, in load order.
    pub fn active(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.descriptors
            .iter()
            .filter(|d| d.enabled)
            .filter_map(|d| d.plugin.as_ref())
    }

    /// Number of loaded plugins.
    pub fn len(&self) -> usize {
        self.active().count()
    }

    /// `true` when no plugin is loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands declared by loaded plugins, in load order.
    pub fn command_specs(&self) -> Vec<(String, CommandSpec)> {
        self.active()
            .filter_map(|p| p.commands().map(|c| (p.name().to_string(), c.commands())))
            .flat_map(|(name, specs)| specs.into_iter().map(move |s| (name.clone(), s)))
            .collect()
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Runs every event handler in load order until one stops the chain.
    pub async fn dispatch(&self, ctx: &EventContext) -> Vec<PluginRun> {
        let mut runs = Vec::new();

        for plugin in self.active() {
            if !ctx.is_propagating() {
                break;
            }
            let Some(handler) = plugin.events() else {
                continue;
            };

            let span = span!(Level::DEBUG, "plugin", plugin = %plugin.name());
            let result = guarded(plugin.name(), self.hook_timeout, handler.on_event(ctx))
                .instrument(span)
                .await;

            match &result {
                Ok(Outcome::Stop) => {
                    debug!(plugin = %plugin.name(), "Plugin stopped propagation");
                    ctx.stop_propagation();
                }
                Ok(Outcome::Continue) => {}
                Err(e) => warn!(plugin = %plugin.name(), error = %e, "Plugin event hook failed"),
            }

            runs.push(PluginRun {
                plugin: plugin.name().to_string(),
                result,
            });
        }

        runs
    }

    /// Runs a plugin's command handler.
    pub async fn invoke_command(
        &self,
        plugin: &str,
        trigger: &str,
        args: &str,
        ctx: &EventContext,
    ) -> PluginResult<Outcome> {
        let provider = self
            .active()
            .find(|p| p.name() == plugin)
            .and_then(|p| p.commands())
            .ok_or_else(|| PluginError::failed(plugin, "plugin has no command handler"))?;

        guarded(
            plugin,
            self.hook_timeout,
            provider.on_command(trigger, args, ctx),
        )
        .await
    }

    /// Tells every event handler about a frame that reached the radio.
    pub async fn notify_outbound(&self, message: &OutboundMessage, origin: Origin) {
        for plugin in self.active() {
            let Some(handler) = plugin.events() else {
                continue;
            };
            let hook = async {
                handler.on_outbound(message, origin).await;
                Ok(())
            };
            if let Err(e) = guarded(plugin.name(), self.hook_timeout, hook).await {
                warn!(plugin = %plugin.name(), error = %e, "Plugin outbound hook failed");
            }
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Calls `on_start` in load order. Returns the failures.
    pub async fn start_all(&self, host: &PluginHost) -> Vec<PluginError> {
        let mut failures = Vec::new();
        for plugin in self.active() {
            let Some(hooks) = plugin.lifecycle() else {
                continue;
            };
            match guarded(plugin.name(), self.hook_timeout, hooks.on_start(host)).await {
                Ok(()) => info!(plugin = %plugin.name(), "Plugin started"),
                Err(e) => {
                    warn!(plugin = %plugin.name(), error = %e, "Plugin failed to start");
                    failures.push(e);
                }
            }
        }
        failures
    }

    /// Calls `on_stop` in reverse load order. Returns the failures.
    pub async fn stop_all(&self) -> Vec<PluginError> {
        let plugins: Vec<_> = self.active().collect();
        let mut failures = Vec::new();
        for plugin in plugins.into_iter().rev() {
            let Some(hooks) = plugin.lifecycle() else {
                continue;
            };
            match guarded(plugin.name(), self.hook_timeout, hooks.on_stop()).await {
                Ok(()) => info!(plugin = %plugin.name(), "Plugin stopped"),
                Err(e) => {
                    warn!(plugin = %plugin.name(), error = %e, "Plugin failed to stop");
                    failures.push(e);
                }
            }
        }
        failures
    }

    /// Calls `on_tick` in load order. Returns the failures.
    pub async fn tick_all(&self, now: DateTime<Utc>, host: &PluginHost) -> Vec<PluginError> {
        let mut failures = Vec::new();
        for plugin in self.active() {
            let Some(hooks) = plugin.lifecycle() else {
                continue;
            };
            if let Err(e) = guarded(plugin.name(), self.hook_timeout, hooks.on_tick(now, host)).await {
                warn!(plugin = %plugin.name(), error = %e, "Plugin tick failed");
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use meshbot_core::{InboundEvent, MessageSink, SendResult};
    use meshbot_store::{SqliteStore, StoreOptions};
    use parking_lot::Mutex;

    use crate::plugin::{EventHandler, PluginLifecycle};

    /// Records its name into a shared log on every hook.
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        outcome: Outcome,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_event(&self, _ctx: &EventContext) -> PluginResult<Outcome> {
            self.log.lock().push(format!("event:{}", self.name));
            Ok(self.outcome)
        }
    }

    #[async_trait]
    impl PluginLifecycle for Recorder {
        async fn on_start(&self, _host: &PluginHost) -> PluginResult<()> {
            self.log.lock().push(format!("start:{}", self.name));
            Ok(())
        }

        async fn on_stop(&self) -> PluginResult<()> {
            self.log.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    struct NoRadio;

    #[async_trait]
    impl MessageSink for NoRadio {
        async fn deliver(&self, _message: OutboundMessage, _origin: Origin) -> SendResult {
            SendResult::failed("no radio")
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn on_event(&self, _ctx: &EventContext) -> PluginResult<Outcome> {
            Err(PluginError::failed("failing", "always"))
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, outcome: Outcome) -> Plugin {
        let rec = Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            outcome,
        });
        Plugin::builder(name)
            .events(rec.clone())
            .lifecycle(rec)
            .build()
            .unwrap()
    }

    fn registry_with_recorder(log: &Arc<Mutex<Vec<String>>>) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        let log = Arc::clone(log);
        registry.register_kind("recorder", move |spec: &PluginSpec| {
            Ok(recorder(&spec.name, &log, Outcome::Continue))
        });
        registry
    }

    fn write(dir: &Path, file: &str, body: &str) {
        fs::write(dir.join(file), body).unwrap();
    }

    fn names(registry: &PluginRegistry) -> Vec<String> {
        registry.active().map(|p| p.name().to_string()).collect()
    }

    fn ctx() -> EventContext {
        EventContext::new(Arc::new(InboundEvent::text("!a", 0, "hi")), "ch0")
    }

    #[test]
    fn test_load_order_skips_underscore_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "gamma.plugin", "kind = \"recorder\"");
        write(dir.path(), "alpha.plugin", "kind = \"recorder\"");
        write(dir.path(), "_beta.plugin", "kind = \"recorder\"");
        write(dir.path(), "notes.md", "not a plugin");

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = registry_with_recorder(&log);
        let descriptors = registry.load(dir.path()).unwrap();
        assert_eq!(descriptors.len(), 3);
        assert!(!descriptors[0].enabled);
        assert_eq!(descriptors[0].file_name, "_beta.plugin");
        assert_eq!(names(&registry), ["alpha", "gamma"]);

        // Reloading an unchanged directory yields the same order.
        registry.load(dir.path()).unwrap();
        assert_eq!(names(&registry), ["alpha", "gamma"]);

        fs::rename(dir.path().join("_beta.plugin"), dir.path().join("beta.plugin")).unwrap();
        registry.load(dir.path()).unwrap();
        assert_eq!(names(&registry), ["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_bad_manifests_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10-good.toml", "kind = \"recorder\"");
        write(dir.path(), "20-broken.plugin", "kind = [unterminated");
        write(dir.path(), "30-unknown.plugin", "kind = \"nope\"");
        write(dir.path(), "40-panics.plugin", "kind = \"panics\"");
        write(dir.path(), "50-fails.plugin", "kind = \"fails\"");
        write(dir.path(), "recorder.plugin", "");

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = registry_with_recorder(&log);
        registry.register_kind("panics", |_: &PluginSpec| -> PluginResult<Plugin> {
            panic!("factory exploded")
        });
        registry.register_kind("fails", |spec: &PluginSpec| {
            Err(PluginError::invalid_config(&spec.name, "missing token"))
        });

        let descriptors = registry.load(dir.path()).unwrap();
        assert_eq!(descriptors.len(), 6);
        assert_eq!(descriptors[2].kind.as_deref(), Some("nope"));
        // The kind defaults to the file stem.
        assert_eq!(descriptors[5].kind.as_deref(), Some("recorder"));
        assert_eq!(names(&registry), ["10-good", "recorder"]);
    }

    #[test]
    fn test_manifest_config_reaches_factory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "cfg.plugin",
            "kind = \"configured\"\n[config]\ngreeting = \"moin\"\nlimit = 3\n",
        );

        let seen = Arc::new(Mutex::new(None));
        let mut registry = PluginRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register_kind("configured", move |spec: &PluginSpec| {
            *sink.lock() = Some(spec.config.clone());
            Ok(Plugin::builder(&spec.name).events(Arc::new(Failing)).build()?)
        });
        registry.load(dir.path()).unwrap();

        let config = seen.lock().clone().unwrap();
        assert_eq!(config["greeting"], "moin");
        assert_eq!(config["limit"], 3);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = PluginRegistry::new();
        let loaded = registry.load(&dir.path().join("absent")).unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_failing_plugin_does_not_stop_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(recorder("first", &log, Outcome::Continue));
        registry.add(Plugin::builder("failing").events(Arc::new(Failing)).build().unwrap());
        registry.add(recorder("last", &log, Outcome::Continue));

        let runs = registry.dispatch(&ctx()).await;
        assert_eq!(runs.len(), 3);
        assert!(runs[1].result.is_err());
        assert_eq!(*log.lock(), ["event:first", "event:last"]);
    }

    #[tokio::test]
    async fn test_stop_outcome_ends_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(recorder("first", &log, Outcome::Stop));
        registry.add(recorder("second", &log, Outcome::Continue));

        let ctx = ctx();
        let runs = registry.dispatch(&ctx).await;
        assert_eq!(runs.len(), 1);
        assert!(!ctx.is_propagating());
        assert_eq!(*log.lock(), ["event:first"]);
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.add(recorder("a", &log, Outcome::Continue));
        registry.add(recorder("b", &log, Outcome::Continue));

        let sink: Arc<dyn MessageSink> = Arc::new(NoRadio);
        let store = Arc::new(SqliteStore::open_in_memory(StoreOptions::default()).unwrap());
        let host = PluginHost::new(&sink, store);

        assert!(registry.start_all(&host).await.is_empty());
        assert!(registry.stop_all().await.is_empty());
        assert_eq!(*log.lock(), ["start:a", "start:b", "stop:b", "stop:a"]);
    }

    #[tokio::test]
    async fn test_slow_plugin_times_out() {
        struct Slow(Arc<AtomicUsize>);

        #[async_trait]
        impl EventHandler for Slow {
            async fn on_event(&self, _ctx: &EventContext) -> PluginResult<Outcome> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Outcome::Continue)
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new().with_hook_timeout(Duration::from_millis(20));
        registry.add(Plugin::builder("slow").events(Arc::new(Slow(calls.clone()))).build().unwrap());

        let runs = registry.dispatch(&ctx()).await;
        assert!(matches!(runs[0].result, Err(PluginError::TimedOut { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

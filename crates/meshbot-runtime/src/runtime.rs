//! Wires the store, radio, plugins, dispatcher, scheduler and HTTP API
//! together and runs them until shutdown.
//!
//! ```rust,ignore
//! use meshbot_runtime::MeshRuntime;
//!
//! let runtime = MeshRuntime::builder()
//!     .config_file("/config/config.toml")
//!     .create_missing()
//!     .build()?;
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use meshbot_core::{InboundEvent, MessageSink, SharedStore};
use meshbot_framework::{ApiFacade, Dispatcher, PluginHost, PluginRegistry};
use meshbot_store::SqliteStore;
use meshbot_transport::{
    ApiState, BackoffConfig, HttpServer, HttpServerHandle, RadioHub, WebhookForwarder,
};

use crate::config::{ConfigLoader, ConfigResult, MeshConfig, validate_config};
use crate::error::RuntimeResult;
use crate::logging;
use crate::scheduler::Scheduler;

/// The bot, configured and ready to run.
pub struct MeshRuntime {
    config: Arc<MeshConfig>,
}

impl MeshRuntime {
    /// Creates a runtime builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Validates `config` and initializes logging from it.
    pub fn from_config(config: MeshConfig) -> ConfigResult<Self> {
        validate_config(&config)?;
        logging::init_from_config(&config.logging);

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            nodes = config.nodes.len(),
            "Runtime initialized from configuration"
        );
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// The validated configuration snapshot.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Starts every service. The returned handle stops them again.
    pub async fn start(&self) -> RuntimeResult<Services> {
        let config = Arc::clone(&self.config);

        let store: SharedStore = Arc::new(SqliteStore::open(&config.db.path, config.store_options())?);

        let mut registry = PluginRegistry::new()
            .with_hook_timeout(Duration::from_millis(config.plugins.timeout_ms));
        if config.plugins.enabled {
            registry.load(&config.plugins.path)?;
        }
        let plugins = Arc::new(registry);

        let (hub, events) = RadioHub::connect(
            config.nodes.iter().map(|n| (n.name.clone(), n.url.clone())),
            BackoffConfig::default(),
        );
        let hub = Arc::new(hub);

        let mut builder = Dispatcher::builder(Arc::clone(&store), hub.clone())
            .settings(config.dispatch_settings())
            .router(config.router_settings())
            .plugins(Arc::clone(&plugins));
        let webhook_url = config.webhook.url.trim();
        if !webhook_url.is_empty() {
            let forwarder = WebhookForwarder::new(
                webhook_url,
                Duration::from_secs(config.webhook.timeout_seconds.max(1)),
            )?
            .with_node_urls(hub.node_urls());
            builder = builder.observer(Arc::new(forwarder));
            info!(url = %webhook_url, "Webhook forwarding enabled");
        }
        let dispatcher = Arc::new(builder.build());
        let host = dispatcher.plugin_host();
        plugins.start_all(&host).await;

        let cancel = CancellationToken::new();
        let pump = spawn_pump(events, Arc::clone(&dispatcher), cancel.clone());
        let ticker = spawn_ticker(&config, Arc::clone(&plugins), host, cancel.clone());

        let sink: Arc<dyn MessageSink> = dispatcher.clone();
        let scheduler = Scheduler::from_config(&config, sink)?;
        scheduler.start();

        let http = if config.api.enabled {
            let tokens = config.api.token_scopes();
            if tokens.is_empty() {
                warn!("No API tokens configured; protected routes answer 401");
            }
            let state = ApiState::new(ApiFacade::new(Arc::clone(&dispatcher)), tokens);
            let addr = format!("{}:{}", config.api.host, config.api.port);
            Some(HttpServer::bind(&addr, state).await?.spawn()?)
        } else {
            None
        };

        info!(
            plugins = plugins.len(),
            jobs = scheduler.len(),
            api = config.api.enabled,
            "meshbot is running"
        );

        Ok(Services {
            store,
            plugins,
            hub,
            dispatcher,
            scheduler,
            http,
            cancel,
            pump,
            ticker,
        })
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.run_until(wait_for_shutdown()).await
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        let services = self.start().await?;
        shutdown.await;
        services.shutdown().await;
        Ok(())
    }
}

/// Running services, stopped in dependency order by [`Services::shutdown`].
pub struct Services {
    store: SharedStore,
    plugins: Arc<PluginRegistry>,
    hub: Arc<RadioHub>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    http: Option<HttpServerHandle>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
}

impl Services {
    /// The dispatcher all producers feed.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Address the HTTP API listens on, when enabled.
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        self.http.as_ref().map(HttpServerHandle::local_addr)
    }

    /// Stops producers, drains in-flight events, stops plugins, closes the store.
    pub async fn shutdown(self) {
        info!("Shutting down");

        if let Some(http) = self.http {
            http.shutdown().await;
        }
        self.hub.shutdown().await;
        self.cancel.cancel();
        for task in std::iter::once(self.pump).chain(self.ticker) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }
        self.scheduler.shutdown().await;

        self.dispatcher.shutdown().await;
        for failure in self.plugins.stop_all().await {
            debug!(error = %failure, "Plugin stop failure");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close store");
        }
        info!("Shutdown complete");
    }
}

/// Feeds radio packets to the dispatcher, one tracked task per packet.
fn spawn_pump(
    mut events: mpsc::Receiver<InboundEvent>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let tracker = TaskTracker::new();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let dispatcher = Arc::clone(&dispatcher);
                tracker.spawn(async move {
                    if let Err(e) = dispatcher.submit(event).await {
                        warn!(error = %e, "Inbound event not processed");
                    }
                });
            }
            tracker.close();
            tracker.wait().await;
            debug!("Inbound pump stopped");
        }
        .instrument(info_span!("pump")),
    )
}

/// Calls the plugin tick hooks every `plugins.tick_interval_seconds`.
fn spawn_ticker(
    config: &MeshConfig,
    plugins: Arc<PluginRegistry>,
    host: PluginHost,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = config.plugins.tick_interval_seconds;
    if !config.plugins.enabled || period == 0 || plugins.is_empty() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(period));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    plugins.tick_all(Utc::now(), &host).await;
                }
            }
        }
    }))
}

/// Waits for Ctrl+C or, on Unix, SIGTERM.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl+C"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Cannot listen for Ctrl+C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Loads configuration and creates a [`MeshRuntime`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
        }
    }

    /// Sets the configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Writes the bundled default config when the file is missing.
    pub fn create_missing(mut self) -> Self {
        self.config_loader = self.config_loader.create_missing();
        self
    }

    /// Enables `MESHBOT_*` environment overrides (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    /// Disables environment overrides.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration programmatically, below the file and environment.
    pub fn merge(mut self, config: MeshConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads, validates and builds the runtime.
    pub fn build(self) -> ConfigResult<MeshRuntime> {
        let config = self.config_loader.load()?;
        MeshRuntime::from_config(config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbot_core::{ConversationId, StoreError};

    fn test_config(dir: &std::path::Path) -> MeshConfig {
        let mut config = MeshConfig::default();
        config.db.path = dir.join("bot.db");
        config.plugins.path = dir.join("plugins");
        config.api.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_start_process_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins")).unwrap();
        std::fs::write(dir.path().join("plugins/greeter.plugin"), "kind = \"greeter\"\n").unwrap();

        let runtime = MeshRuntime::from_config(test_config(dir.path())).unwrap();
        let services = runtime.start().await.unwrap();
        assert_eq!(services.dispatcher().plugins().descriptors().len(), 1);
        assert!(services.http_addr().is_none());

        let report = services
            .dispatcher()
            .submit(InboundEvent::text("!a1", 0, "status report"))
            .await
            .unwrap();
        assert!(report.message_id.is_some());

        let store = Arc::clone(services.dispatcher().store());
        let history = store
            .read_history(&ConversationId::Channel(0), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);

        services.shutdown().await;
        assert!(matches!(
            store.read_stats().await,
            Err(StoreError::Closed)
        ));
        assert!(dir.path().join("bot.db").exists());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_future() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.plugins.enabled = false;
        let runtime = MeshRuntime::from_config(config).unwrap();

        let run = runtime.run_until(tokio::time::sleep(Duration::from_millis(50)));
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(dir.path().join("bot.db").exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = MeshConfig::default();
        config.logging.level = "loud".into();
        assert!(MeshRuntime::from_config(config).is_err());
    }
}

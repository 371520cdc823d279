//! Event dispatcher: the single entry point for inbound events and the single
//! exit point for outbound messages.
//!
//! # Inbound
//!
//! [`Dispatcher::submit`] runs each event on its own tracked task, in a fixed
//! order:
//!
//! 1. **Persistence**: one `record_inbound` transaction (station upsert, name
//!    history, conversation message). A failure here drops the event.
//! 2. **Observers** (webhook), text events only.
//! 3. **Command router**, text events only, when commands are enabled.
//! 4. **Plugins**, every event kind, sequentially in load order, unless the
//!    command stopped the chain, `command_halts_plugins` is set, or strict mode
//!    skips text that is not a command.
//! 5. **Outbox**: replies queued on the [`EventContext`] are sent in order.
//!
//! # Outbound
//!
//! [`Dispatcher::send`] splits long text into `i/N` parts, sends them with a
//! pause in between, stores each sent part as an `out` message and notifies
//! plugins. Command replies, plugin replies, scheduler jobs and the HTTP API
//! all go through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use meshbot_core::{
    ConversationId, Direction, DispatchError, DispatchResult, EventObserver, InboundEvent,
    InboundRecord, MessageSink, NewMessage, OutboundMessage, Origin, PluginError, SendResult,
    SendStatus, SharedRadio, SharedStore, StationUpdate, chunk_text,
};

use crate::context::EventContext;
use crate::plugin::{Outcome, PluginHost, PluginRegistry, guarded};
use crate::router::CommandRouter;
use crate::settings::{DispatchSettings, RouterSettings};
use crate::stats::DispatchCounters;

/// What happened to one submitted event.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// The event's id.
    pub event_id: Uuid,
    /// Conversation the event was stored in.
    pub conversation: ConversationId,
    /// Row id of the stored message, for text events.
    pub message_id: Option<i64>,
    /// Lowercased trigger of the matched command.
    pub command: Option<String>,
    /// Failure of the matched command.
    pub command_error: Option<PluginError>,
    /// Plugins whose event hook ran, in order.
    pub plugins_run: Vec<String>,
    /// Plugin hooks that failed.
    pub plugin_errors: Vec<PluginError>,
    /// One entry per queued reply.
    pub replies: Vec<SendResult>,
}

impl DispatchReport {
    fn new(event: &InboundEvent) -> Self {
        Self {
            event_id: event.id,
            conversation: event.conversation(),
            message_id: None,
            command: None,
            command_error: None,
            plugins_run: Vec::new(),
            plugin_errors: Vec::new(),
            replies: Vec::new(),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    store: SharedStore,
    radio: SharedRadio,
    settings: DispatchSettings,
    router_settings: RouterSettings,
    plugins: Arc<PluginRegistry>,
    observers: Vec<Arc<dyn EventObserver>>,
    counters: Arc<DispatchCounters>,
}

impl DispatcherBuilder {
    /// Sets dispatch settings.
    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets command router settings.
    pub fn router(mut self, settings: RouterSettings) -> Self {
        self.router_settings = settings;
        self
    }

    /// Sets the loaded plugins.
    pub fn plugins(mut self, plugins: Arc<PluginRegistry>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Adds an observer, called for every stored text event.
    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Shares existing counters instead of fresh ones.
    pub fn counters(mut self, counters: Arc<DispatchCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Builds the dispatcher and its command router.
    pub fn build(self) -> Dispatcher {
        let router = CommandRouter::new(
            self.router_settings,
            Arc::clone(&self.store),
            Arc::clone(&self.counters),
            Arc::clone(&self.plugins),
        );
        Dispatcher {
            inner: Arc::new(Inner {
                settings: self.settings,
                store: self.store,
                radio: self.radio,
                plugins: self.plugins,
                router,
                observers: self.observers,
                counters: self.counters,
            }),
            tracker: TaskTracker::new(),
            accepting: AtomicBool::new(true),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Coordinates persistence, commands, plugins and sends.
pub struct Dispatcher {
    inner: Arc<Inner>,
    tracker: TaskTracker,
    accepting: AtomicBool,
}

struct Inner {
    settings: DispatchSettings,
    store: SharedStore,
    radio: SharedRadio,
    plugins: Arc<PluginRegistry>,
    router: CommandRouter,
    observers: Vec<Arc<dyn EventObserver>>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    /// Starts building a dispatcher over `store` and `radio`.
    pub fn builder(store: SharedStore, radio: SharedRadio) -> DispatcherBuilder {
        DispatcherBuilder {
            store,
            radio,
            settings: DispatchSettings::default(),
            router_settings: RouterSettings::default(),
            plugins: Arc::new(PluginRegistry::new()),
            observers: Vec::new(),
            counters: Arc::new(DispatchCounters::new()),
        }
    }

    /// Processes one inbound event.
    ///
    /// Waits at most `submit_timeout`; past that it returns
    /// [`DispatchError::Timeout`] while processing finishes in the background.
    pub async fn submit(&self, event: InboundEvent) -> DispatchResult<DispatchReport> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        self.inner.counters.record_rx();

        let budget = self.inner.settings.submit_timeout;
        let inner = Arc::clone(&self.inner);
        let task = self.tracker.spawn(async move { inner.process(event).await });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(DispatchError::TaskFailed(join.to_string())),
            Err(_) => {
                self.inner.counters.record_timeout();
                warn!(?budget, "Dispatch exceeded its budget, finishing in background");
                Err(DispatchError::Timeout { budget })
            }
        }
    }

    /// Sends `message`, split into parts as needed.
    pub async fn send(&self, message: OutboundMessage, origin: Origin) -> SendResult {
        self.inner.send(message, origin).await
    }

    /// Loaded plugins.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.inner.plugins
    }

    /// The command router.
    pub fn router(&self) -> &CommandRouter {
        &self.inner.router
    }

    /// Live counters.
    pub fn counters(&self) -> &Arc<DispatchCounters> {
        &self.inner.counters
    }

    /// The store events are written to.
    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// A handle plugins use to send outside of an event, with [`Origin::Plugin`].
    pub fn plugin_host(self: &Arc<Self>) -> PluginHost {
        let sink: Arc<dyn MessageSink> = self.clone();
        PluginHost::new(&sink, Arc::clone(&self.inner.store))
    }

    /// Names of the radio nodes behind the transport.
    pub fn radio_nodes(&self) -> Vec<String> {
        self.inner.radio.nodes()
    }

    /// Number of events still being processed.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting events and waits for in-flight ones to finish.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!(in_flight = self.tracker.len(), "Dispatcher draining");
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("Dispatcher stopped");
    }
}

#[async_trait]
impl MessageSink for Dispatcher {
    async fn deliver(&self, message: OutboundMessage, origin: Origin) -> SendResult {
        self.send(message, origin).await
    }
}

impl Inner {
    fn channel_name(&self, conversation: &ConversationId) -> String {
        match conversation {
            ConversationId::Channel(idx) => self.settings.channel_names.name(*idx),
            ConversationId::Direct(_) => "DM".to_string(),
        }
    }

    async fn process(&self, event: InboundEvent) -> DispatchResult<DispatchReport> {
        let conversation = event.conversation();
        let span = info_span!(
            "dispatch",
            event_id = %event.id,
            conversation = %conversation,
            origin = event.origin.as_str(),
        );
        self.process_inner(Arc::new(event), conversation)
            .instrument(span)
            .await
    }

    async fn process_inner(
        &self,
        event: Arc<InboundEvent>,
        conversation: ConversationId,
    ) -> DispatchResult<DispatchReport> {
        let mut report = DispatchReport::new(&event);
        let channel_name = self.channel_name(&conversation);
        let text = event.text_body();

        // ── 1. Persistence ──────────────────────────────────────────────────
        let message = text.map(|body| {
            let mut message = NewMessage::new(conversation.clone(), Direction::In, body, event.received_at);
            message.sender_id = Some(event.source_id.clone());
            message.channel_name = Some(channel_name.clone());
            message.node_key = event.node_key.clone();
            message.sender = event.sender.clone();
            message
        });
        let record = InboundRecord {
            station: StationUpdate::seen(&event.source_id, event.received_at)
                .with_names(event.sender.clone()),
            message,
        };
        let outcome = self.store.record_inbound(record).await.map_err(|e| {
            error!(error = %e, "Failed to persist inbound event, dropping it");
            DispatchError::from(e)
        })?;
        report.message_id = outcome.message_id;
        if outcome.name_changed {
            info!(node = %event.source_id, names = ?event.sender, "Station names changed");
        }

        // ── 2. Observers and 3. command router, text events only ───────────
        let (ctx, run_plugins) = match text {
            Some(text) => {
                debug!(from = %event.source_id, text, "Inbound text");
                for observer in &self.observers {
                    observer.observe(&event, &channel_name);
                }
                let ctx = EventContext::new(Arc::clone(&event), channel_name);
                let run_plugins = self.run_command(&ctx, &mut report).await;
                (ctx, run_plugins)
            }
            None => {
                debug!(kind = ?event.kind, "Inbound non-text event");
                (EventContext::new(Arc::clone(&event), channel_name), true)
            }
        };

        // ── 4. Plugins ──────────────────────────────────────────────────────
        if run_plugins {
            for run in self.plugins.dispatch(&ctx).await {
                report.plugins_run.push(run.plugin);
                if let Err(e) = run.result {
                    self.counters.record_plugin_failure();
                    report.plugin_errors.push(e);
                }
            }
        }

        // ── 5. Outbox ───────────────────────────────────────────────────────
        for reply in ctx.take_outbox() {
            report.replies.push(self.send(reply, Origin::Reply).await);
        }

        Ok(report)
    }

    /// Routes a text event to its command. Returns whether plugins still run.
    async fn run_command(&self, ctx: &EventContext, report: &mut DispatchReport) -> bool {
        let Some(matched) = self.router.route(ctx) else {
            if self.settings.strict {
                debug!("Strict mode, not a command");
                return false;
            }
            return true;
        };

        report.command = Some(matched.key.clone());
        let result = guarded(
            &matched.key,
            self.settings.plugin_timeout,
            self.router.invoke(&matched, ctx),
        )
        .await;
        match result {
            Ok(Outcome::Stop) => false,
            Ok(Outcome::Continue) => !self.settings.command_halts_plugins,
            Err(e) => {
                warn!(command = %matched.key, error = %e, "Command failed");
                self.counters.record_plugin_failure();
                report.command_error = Some(e);
                !self.settings.command_halts_plugins
            }
        }
    }

    async fn send(&self, message: OutboundMessage, origin: Origin) -> SendResult {
        let text = message.text.trim();
        if text.is_empty() {
            return SendResult::failed("message text is empty");
        }

        let conversation = message.conversation();
        let channel_name = self.channel_name(&conversation);
        let parts = chunk_text(text, self.settings.max_text_len);
        let total = parts.len();

        let mut result = SendResult {
            status: SendStatus::Sent,
            message_id: None,
            parts: 0,
            error: None,
        };

        for (idx, part) in parts.into_iter().enumerate() {
            if idx > 0 && !self.settings.part_delay.is_zero() {
                tokio::time::sleep(self.settings.part_delay).await;
            }

            let frame = OutboundMessage {
                text: part,
                ..message.clone()
            };
            let receipt = match self.radio.send(&frame).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(
                        target_id = %frame.target,
                        channel = frame.channel,
                        part = idx + 1,
                        total,
                        error = %e,
                        "Send failed"
                    );
                    result.status = SendStatus::Failed;
                    result.error = Some(e.to_string());
                    return result;
                }
            };

            self.counters.record_tx();
            result.parts += 1;
            result.message_id = receipt.message_id.or(result.message_id);
            if receipt.status == SendStatus::Queued {
                result.status = SendStatus::Queued;
            }
            debug!(
                target_id = %frame.target,
                channel = frame.channel,
                origin = origin.as_str(),
                part = idx + 1,
                total,
                "Sent"
            );

            let mut stored = NewMessage::new(conversation.clone(), Direction::Out, &frame.text, Utc::now());
            stored.channel_name = Some(channel_name.clone());
            stored.node_key = frame.node.clone();
            if let Err(e) = self.store.append_message(stored).await {
                warn!(error = %e, "Failed to store outbound message");
            }

            self.plugins.notify_outbound(&frame, origin).await;
        }

        result
    }
}

//! # Pepeunit Client
//!
//! The facade a unit application talks to. It wires the collaborators
//! together, routes inbound messages, and runs the main cycle.
//!
//! ## Message routing
//!
//! ```text
//! transport ─► ConnectionManager ─► dispatch task ─┬─► base handlers
//!                                                  │   (update, env, schema, log sync)
//!                                                  └─► user InputHandler
//! ```
//!
//! Every message passes the base handlers first, then the user handler.
//! A handler that fails or panics is logged and the next message is
//! delivered as usual. Update cycles run on their own task so the reader
//! path keeps draining while firmware downloads.
//!
//! ## Unit log mirror
//!
//! [`UnitLogger`] pushes its entries into a channel; a mirror task drains it
//! onto `log/pepeunit` once the client is started.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cipher;
use crate::config::ClientConfig;
use crate::cycle::{self, MainCycle};
use crate::error::{PepeunitError, Result};
use crate::identity::{IdentityProvider, JwtIdentity};
use crate::logger::{LogEntry, UnitLogger};
use crate::mqtt::{ConnectionManager, InboundMessage, RetryingExecutor, RumqttTransport, Transport};
use crate::rest::{PepeunitRestClient, RestClient};
use crate::schema::{BaseInputTopic, BaseOutputTopic, SchemaStore};
use crate::settings::SettingsStore;
use crate::update::{
    ProcessControl, SystemProcessControl, UpdateDeps, UpdateHandler, UpdateOrchestrator,
    UpdateTargets,
};

/// Application callback for inbound messages.
#[async_trait]
pub trait InputHandler: Send + Sync {
    async fn handle_input(
        &self,
        client: &PepeunitClient,
        message: &InboundMessage,
    ) -> color_eyre::Result<()>;
}

/// Collaborators the client is assembled from.
pub struct ClientParts {
    pub settings: Arc<SettingsStore>,
    pub schema: Arc<SchemaStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub rest: Arc<dyn RestClient>,
    pub transport: Arc<dyn Transport>,
    pub process: Arc<dyn ProcessControl>,
    pub targets: UpdateTargets,
}

pub struct PepeunitClient {
    config: ClientConfig,
    settings: Arc<SettingsStore>,
    schema: Arc<SchemaStore>,
    identity: Arc<dyn IdentityProvider>,
    rest: Arc<dyn RestClient>,
    logger: Arc<UnitLogger>,
    connection: Arc<ConnectionManager>,
    executor: RetryingExecutor,
    cycle: Arc<MainCycle>,
    updates: Arc<UpdateOrchestrator>,
    input_handler: RwLock<Option<Arc<dyn InputHandler>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    log_mirror: Mutex<Option<mpsc::UnboundedReceiver<LogEntry>>>,
    cancel: CancellationToken,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl PepeunitClient {
    /// Loads env and schema from the configured paths and builds the real
    /// MQTT, REST and process collaborators.
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let settings = Arc::new(SettingsStore::load(&config.env_path)?);
        let schema = Arc::new(SchemaStore::load(&config.schema_path)?);
        let identity: Arc<dyn IdentityProvider> = Arc::new(JwtIdentity::new(settings.clone()));
        let rest = Arc::new(PepeunitRestClient::new(settings.clone(), identity.clone())?);
        let targets = UpdateTargets::current(config.program_dir.clone())?;

        let parts = ClientParts {
            settings,
            schema,
            identity,
            rest,
            transport: Arc::new(RumqttTransport::new()),
            process: Arc::new(SystemProcessControl),
            targets,
        };
        Ok(Self::from_parts(config, parts))
    }

    /// Must be called inside a tokio runtime.
    pub fn from_parts(config: ClientConfig, parts: ClientParts) -> Arc<Self> {
        let logger = Arc::new(UnitLogger::new(
            config.log_path.clone(),
            parts.settings.clone(),
            config.console_log,
        ));
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        logger.set_mirror(log_tx);

        let (connection, inbound) =
            ConnectionManager::new(parts.transport, parts.settings.clone(), config.mqtt.clone());
        let executor = RetryingExecutor::new(connection.clone());
        let cycle = Arc::new(MainCycle::new(config.cycle_period()));

        let deps = UpdateDeps {
            rest: parts.rest.clone(),
            settings: parts.settings.clone(),
            schema: parts.schema.clone(),
            executor: executor.clone(),
            cycle: cycle.clone(),
            logger: logger.clone(),
            process: parts.process,
        };
        let updates = Arc::new(UpdateOrchestrator::new(
            deps,
            config.restart_mode,
            parts.targets,
        ));

        Arc::new(Self {
            config,
            settings: parts.settings,
            schema: parts.schema,
            identity: parts.identity,
            rest: parts.rest,
            logger,
            connection,
            executor,
            cycle,
            updates,
            input_handler: RwLock::new(None),
            inbound: Mutex::new(Some(inbound)),
            log_mirror: Mutex::new(Some(log_rx)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn schema(&self) -> &Arc<SchemaStore> {
        &self.schema
    }

    pub fn logger(&self) -> &Arc<UnitLogger> {
        &self.logger
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn executor(&self) -> &RetryingExecutor {
        &self.executor
    }

    pub fn cycle(&self) -> &Arc<MainCycle> {
        &self.cycle
    }

    pub fn updates(&self) -> &Arc<UpdateOrchestrator> {
        &self.updates
    }

    pub fn set_input_handler(&self, handler: Arc<dyn InputHandler>) {
        match self.input_handler.write() {
            Ok(mut guard) => *guard = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    fn input_handler(&self) -> Option<Arc<dyn InputHandler>> {
        match self.input_handler.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_custom_update_handler(&self, handler: Arc<dyn UpdateHandler>) {
        self.updates.set_custom_handler(handler);
    }

    /// Spawns the dispatch and log mirror tasks, connects and subscribes
    /// every schema input topic.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(inbound) = take(&self.inbound) {
            tokio::spawn(Self::dispatch_loop(self.clone(), inbound));
        }
        if let Some(entries) = take(&self.log_mirror) {
            tokio::spawn(Self::mirror_loop(self.clone(), entries));
        }

        self.connection.connect().await?;
        self.subscribe_all().await?;
        self.logger.info("Pepeunit client started");
        Ok(())
    }

    /// Stops the main cycle and the background tasks, then closes the session.
    pub async fn stop(&self) {
        self.logger.info("Pepeunit client stopping");
        self.cycle.stop();
        self.cancel.cancel();
        self.connection.disconnect().await;
    }

    async fn dispatch_loop(client: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        loop {
            tokio::select! {
                _ = client.cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => client.dispatch(message).await,
                    None => break,
                },
            }
        }
        debug!("Dispatch task finished");
    }

    async fn mirror_loop(client: Arc<Self>, mut entries: mpsc::UnboundedReceiver<LogEntry>) {
        loop {
            tokio::select! {
                _ = client.cancel.cancelled() => break,
                entry = entries.recv() => match entry {
                    Some(entry) => client.mirror_entry(&entry).await,
                    None => break,
                },
            }
        }
        debug!("Log mirror task finished");
    }

    async fn mirror_entry(&self, entry: &LogEntry) {
        let Some(topic) = self.base_output(BaseOutputTopic::Log) else {
            return;
        };
        let payload = match serde_json::to_vec(entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode log entry: {}", e);
                return;
            }
        };
        // Never through the unit logger, or a failing publish would feed itself.
        if let Err(e) = self.executor.publish(&topic, &payload).await {
            warn!("Failed to mirror log entry: {}", e);
        }
    }

    fn base_output(&self, topic: BaseOutputTopic) -> Option<String> {
        self.schema
            .snapshot()
            .base_output_topic(topic)
            .map(str::to_string)
    }

    /// Routes one inbound message as if the transport had delivered it.
    pub async fn handle_inbound_message(&self, topic: &str, payload: &[u8]) {
        self.dispatch(InboundMessage::from_topic(topic, payload.to_vec()))
            .await;
    }

    async fn dispatch(&self, message: InboundMessage) {
        debug!("Inbound {}", message);

        let base = self.schema.snapshot().find_base_input(&message.topic);
        if let Some(base) = base {
            if let Err(panic) = AssertUnwindSafe(self.handle_base_input(base, &message))
                .catch_unwind()
                .await
            {
                self.logger.error(format!(
                    "Base handler panicked on {}: {}",
                    message.topic,
                    panic_message(panic.as_ref())
                ));
            }
        }

        let Some(handler) = self.input_handler() else {
            return;
        };
        match AssertUnwindSafe(handler.handle_input(self, &message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self
                .logger
                .error(format!("Input handler failed on {}: {}", message.topic, e)),
            Err(panic) => self.logger.error(format!(
                "Input handler panicked on {}: {}",
                message.topic,
                panic_message(panic.as_ref())
            )),
        }
    }

    async fn handle_base_input(&self, base: BaseInputTopic, message: &InboundMessage) {
        match base {
            BaseInputTopic::Update => {
                let updates = self.updates.clone();
                let payload = message.payload_str();
                tokio::spawn(async move {
                    if let Err(e) = updates.handle_update(&payload).await {
                        debug!("Update cycle ended with {}", e);
                    }
                });
            }
            BaseInputTopic::EnvUpdate => {
                self.logger.info("Env update request received");
                if let Err(e) = self.download_env().await {
                    self.logger.error(format!("Env update failed: {e}"));
                }
            }
            BaseInputTopic::SchemaUpdate => {
                self.logger.info("Schema update request received");
                let result = match self.download_schema().await {
                    Ok(()) => self.subscribe_all().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.logger.error(format!("Schema update failed: {e}"));
                }
            }
            BaseInputTopic::LogSync => {
                if let Err(e) = self.sync_log().await {
                    self.logger.error(format!("Log sync failed: {e}"));
                }
            }
        }
    }

    /// Publishes the whole unit log as one JSON array on `log/pepeunit`.
    pub async fn sync_log(&self) -> Result<()> {
        let Some(topic) = self.base_output(BaseOutputTopic::Log) else {
            return Ok(());
        };
        let log = Value::Array(self.logger.full_log());
        self.executor.publish(&topic, log.to_string().as_bytes()).await?;
        self.logger.info("Log sync completed");
        Ok(())
    }

    /// Subscribes base input and input topics of the current schema.
    pub async fn subscribe_all(&self) -> Result<()> {
        let topics = self.schema.snapshot().subscription_topics();
        self.executor.subscribe_topics(&topics).await
    }

    /// Publishes `payload` on every topic of the logical output `name`.
    ///
    /// All topics are attempted; the first failure is returned.
    pub async fn publish_by_logical_name(&self, name: &str, payload: &str) -> Result<()> {
        let topics = self.schema.snapshot().output_topics(name);
        if topics.is_empty() {
            return Err(PepeunitError::TopicNotFound(name.to_string()));
        }

        let mut first_error = None;
        for topic in &topics {
            if let Err(e) = self.executor.publish(topic, payload.as_bytes()).await {
                self.logger
                    .error(format!("Failed to publish to topic {topic}: {e}"));
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs the base output step and then `step` on every tick until stopped.
    pub async fn run_main_cycle<F, Fut>(&self, mut step: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let this = self;
        self.cycle
            .run(&self.cancel, move || {
                let user = step();
                async move {
                    this.base_output_step().await;
                    user.await;
                }
            })
            .await;
    }

    async fn base_output_step(&self) {
        let Some(topic) = self.base_output(BaseOutputTopic::State) else {
            return;
        };
        let now = Instant::now();
        let interval = self.settings.snapshot().state_send_interval();
        if !self.cycle.state_send_due(interval, now) {
            return;
        }

        let state = self.system_state();
        match self.executor.publish(&topic, state.to_string().as_bytes()).await {
            Ok(()) => self.cycle.mark_state_sent(now),
            Err(e) => self.logger.error(format!("Failed to publish state: {e}")),
        }
    }

    pub fn system_state(&self) -> Value {
        cycle::system_state(&self.settings.snapshot().commit_version)
    }

    pub fn unit_id(&self) -> Result<String> {
        self.identity.unit_id()
    }

    /// Downloads the env file over the live one and reloads settings.
    pub async fn download_env(&self) -> Result<()> {
        self.rest.download_env(self.settings.path()).await?;
        self.settings.reload()?;
        self.logger.info("Env updated");
        Ok(())
    }

    /// Downloads the schema over the live one and reloads it.
    pub async fn download_schema(&self) -> Result<()> {
        self.rest.download_schema(self.schema.path()).await?;
        self.schema.update_from_file()?;
        self.logger.info("Schema updated");
        Ok(())
    }

    pub async fn set_state_storage(&self, state: &Value) -> Result<()> {
        self.rest.set_state(&state.to_string()).await
    }

    /// Stored state; an empty store reads as `{}` and non-JSON text is
    /// returned as a string value.
    pub async fn get_state_storage(&self) -> Result<Value> {
        let raw = self.rest.get_state().await?;
        if raw.trim().is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }

    /// Encrypts with `PU_ENCRYPT_KEY`.
    pub fn aes_gcm_encode(&self, data: &str) -> Result<String> {
        cipher::aes_gcm_encode(data, &self.settings.snapshot().encrypt_key)
    }

    pub fn aes_gcm_decode(&self, encoded: &str) -> Result<String> {
        cipher::aes_gcm_decode(encoded, &self.settings.snapshot().encrypt_key)
    }
}

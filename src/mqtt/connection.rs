//! # Connection Manager
//!
//! Owns the single transport session, its [`ConnectionState`] and the
//! subscription journal.
//!
//! ## Journal
//!
//! The journal is the set of topics the unit *wants* to be subscribed to.
//! Subscribing and unsubscribing edit it before touching the network, and
//! connection loss never clears it. Every successful connect, and every
//! reconnect the transport performs on its own, replays it.
//!
//! ## Epochs
//!
//! Each connect attempt bumps an epoch and hands the transport an event sink
//! stamped with it. The event pump drops anything stamped with an older
//! epoch, so a late notification from a torn-down session cannot mark the
//! fresh one as lost.
//!
//! ## Locking
//!
//! State and journal sit behind short-held `std::sync::RwLock`s. Only the
//! `connect_lock` (a `tokio::sync::Mutex`) is held across network calls; it
//! serializes `connect`, `force_reconnect` and `disconnect` so at most one
//! handshake is ever in flight.
//!
//! Callers that saw a session fail report its session epoch through
//! [`ConnectionManager::reconnect_after`]. Whoever gets the lock first
//! reconnects; the rest find a newer connected session and reuse it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{ConnectParams, MqttTuning};
use super::message_manager::InboundMessage;
use super::transport::{EventSink, Transport, TransportEvent};
use crate::error::{PepeunitError, Result};
use crate::settings::SettingsStore;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: Arc<SettingsStore>,
    tuning: MqttTuning,
    state: RwLock<ConnectionState>,
    journal: RwLock<BTreeSet<String>>,
    connect_lock: Mutex<()>,
    epoch: AtomicU64,
    live_epoch: AtomicU64,
    events: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl ConnectionManager {
    /// Creates the manager and spawns its event pump.
    ///
    /// The returned receiver yields every inbound message of the current
    /// session, in arrival order.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: Arc<SettingsStore>,
        tuning: MqttTuning,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            transport,
            settings,
            tuning,
            state: RwLock::new(ConnectionState::Disconnected),
            journal: RwLock::new(BTreeSet::new()),
            connect_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            live_epoch: AtomicU64::new(0),
            events: events_tx,
        });
        tokio::spawn(Self::pump(Arc::downgrade(&manager), events_rx, inbound_tx));
        (manager, inbound_rx)
    }

    async fn pump(
        manager: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) {
        while let Some((epoch, event)) = events.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if epoch != manager.current_epoch() {
                debug!("Dropping event of stale session {}: {:?}", epoch, event);
                continue;
            }
            match event {
                TransportEvent::Message(message) => {
                    if inbound.send(message).is_err() {
                        debug!("Inbound receiver closed");
                    }
                }
                TransportEvent::ConnectionLost(reason) => {
                    warn!("MQTT connection lost: {}", reason);
                    manager.set_state(ConnectionState::Disconnected);
                }
                TransportEvent::Reconnected => {
                    info!("MQTT connection restored, replaying subscriptions");
                    manager.set_state(ConnectionState::Connected);
                    let replayer = manager.clone();
                    tokio::spawn(async move { replayer.replay_journal(epoch).await });
                }
            }
        }
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn operation_timeout(&self) -> Duration {
        self.tuning.operation_timeout()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn journal(&self) -> BTreeSet<String> {
        match self.journal.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn edit_journal(&self, edit: impl FnOnce(&mut BTreeSet<String>)) {
        match self.journal.write() {
            Ok(mut guard) => edit(&mut *guard),
            Err(poisoned) => edit(&mut *poisoned.into_inner()),
        }
    }

    pub fn journal_add<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edit_journal(|journal| journal.extend(topics.into_iter().map(Into::into)));
    }

    pub fn journal_remove<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.edit_journal(|journal| {
            for topic in topics {
                journal.remove(topic.as_ref());
            }
        });
    }

    /// Opens a session and replays the journal before returning.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// Tears down whatever session exists and connects again.
    pub async fn force_reconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        info!("Forcing MQTT reconnect");
        if let Err(e) = self.transport.disconnect(Duration::ZERO).await {
            debug!("Ignoring teardown error: {}", e);
        }
        self.connect_locked().await
    }

    /// Epoch of the last session that completed its handshake, 0 before any.
    pub fn session_epoch(&self) -> u64 {
        self.live_epoch.load(Ordering::SeqCst)
    }

    /// Reconnects unless a session newer than `observed` is already up.
    pub async fn reconnect_after(&self, observed: u64) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        let live = self.session_epoch();
        if live != observed && self.is_connected() {
            debug!("Session {} already replaced by {}, not reconnecting", observed, live);
            return Ok(());
        }
        info!("Reconnecting MQTT session {}", observed);
        if let Err(e) = self.transport.disconnect(Duration::ZERO).await {
            debug!("Ignoring teardown error: {}", e);
        }
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let params = ConnectParams::new(
            &self.settings.snapshot(),
            &self.tuning,
            Uuid::new_v4().to_string(),
        );
        info!(
            "Connecting to MQTT broker {}:{} (session {})",
            params.host, params.port, epoch
        );

        let sink = EventSink::new(epoch, self.events.clone());
        let limit = self.tuning.connect_timeout();
        match timeout(limit, self.transport.connect(params, sink)).await {
            Err(_) => {
                warn!("MQTT handshake timed out after {:?}", limit);
                if let Err(e) = self.transport.disconnect(Duration::ZERO).await {
                    debug!("Ignoring teardown error: {}", e);
                }
                self.set_state(ConnectionState::Disconnected);
                Err(PepeunitError::ConnectTimeout(limit))
            }
            Ok(Err(e)) => {
                warn!("MQTT connect failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                Err(PepeunitError::ConnectFailed(e))
            }
            Ok(Ok(())) => {
                info!("MQTT connected");
                self.live_epoch.store(epoch, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                self.replay_journal(epoch).await;
                Ok(())
            }
        }
    }

    /// Resubscribes every journaled topic. Failures are logged, never returned.
    async fn replay_journal(&self, epoch: u64) {
        let topics = self.journal();
        if topics.is_empty() {
            return;
        }
        debug!("Replaying {} subscriptions", topics.len());
        for topic in topics {
            if self.current_epoch() != epoch {
                debug!("Session {} superseded, abandoning replay", epoch);
                return;
            }
            match timeout(self.operation_timeout(), self.transport.subscribe(&topic)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Resubscribe to {} failed: {}", topic, e),
                Err(_) => warn!("Resubscribe to {} timed out", topic),
            }
        }
    }

    /// Graceful teardown. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        // Events of the closed session are stale from here on.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.transport.disconnect(self.tuning.disconnect_linger()).await {
            debug!("Ignoring teardown error: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

//! The seam between the connectivity layer and a concrete broker client.
//!
//! A [`Transport`] owns at most one live session. It reports asynchronous
//! happenings (inbound messages, connection loss, its own automatic
//! reconnects) through the [`EventSink`] handed to `connect`; the sink is
//! stamped with the epoch of the connect attempt so the receiver can drop
//! events of sessions that were already torn down.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::config::ConnectParams;
use super::message_manager::InboundMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request rejected by broker: {0}")]
    Rejected(String),

    #[error("client request failed: {0}")]
    Client(String),

    #[error("session closed before acknowledgement")]
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// The transport re-established the session on its own
    Reconnected,
    ConnectionLost(String),
    Message(InboundMessage),
}

#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the receiving side is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a session and resolves once the broker acknowledged the handshake.
    async fn connect(&self, params: ConnectParams, events: EventSink) -> Result<(), TransportError>;

    /// Closes the current session, giving in-flight acknowledgements up to
    /// `linger` to drain. Without a session this is a no-op.
    async fn disconnect(&self, linger: Duration) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
}

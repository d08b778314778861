//! In-memory [`Transport`] that records every call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::config::ConnectParams;
use super::message_manager::InboundMessage;
use super::transport::{EventSink, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect(ConnectParams),
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, Vec<u8>),
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    sink: Mutex<Option<EventSink>>,
    connected: AtomicBool,
    active_handshakes: AtomicUsize,
    max_handshakes: AtomicUsize,
    teardowns: AtomicUsize,
    pub publish_delay: Mutex<Duration>,
    pub connect_delay: Mutex<Duration>,
    pub refuse_connect: AtomicBool,
    pub failing_topics: Mutex<HashSet<String>>,
    pub failing_publishes: AtomicUsize,
}

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        locked(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        locked(&self.calls).clear();
    }

    pub fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .count()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Subscribe(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish(t, p) => Some((t, p)),
                _ => None,
            })
            .collect()
    }

    pub fn max_concurrent_handshakes(&self) -> usize {
        self.max_handshakes.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn current_sink(&self) -> Option<EventSink> {
        locked(&self.sink).clone()
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *locked(&self.connect_delay) = delay;
    }

    /// Publishes wait this long and fail if the session is torn down meanwhile.
    pub fn set_publish_delay(&self, delay: Duration) {
        *locked(&self.publish_delay) = delay;
    }

    pub fn fail_topic(&self, topic: &str) {
        locked(&self.failing_topics).insert(topic.to_string());
    }

    /// Simulates the broker dropping the session.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sink) = self.current_sink() {
            sink.send(TransportEvent::ConnectionLost("reset by peer".into()));
        }
    }

    /// Simulates the client's event loop re-establishing the session.
    pub fn auto_reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        if let Some(sink) = self.current_sink() {
            sink.send(TransportEvent::Reconnected);
        }
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        if let Some(sink) = self.current_sink() {
            sink.send(TransportEvent::Message(InboundMessage::from_topic(
                topic,
                payload.to_vec(),
            )));
        }
    }

    fn record(&self, call: Call) {
        locked(&self.calls).push(call);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, params: ConnectParams, events: EventSink) -> Result<(), TransportError> {
        self.record(Call::Connect(params));
        let active = self.active_handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_handshakes.fetch_max(active, Ordering::SeqCst);

        let delay = *locked(&self.connect_delay);
        tokio::time::sleep(delay).await;
        self.active_handshakes.fetch_sub(1, Ordering::SeqCst);

        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("not authorized".into()));
        }
        *locked(&self.sink) = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, _linger: Duration) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Subscribe(topic.to_string()));
        self.ensure_connected()?;
        if locked(&self.failing_topics).contains(topic) {
            return Err(TransportError::Rejected(topic.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Unsubscribe(topic.to_string()));
        self.ensure_connected()
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.record(Call::Publish(topic.to_string(), payload.to_vec()));
        self.ensure_connected()?;
        let delay = *locked(&self.publish_delay);
        if !delay.is_zero() {
            let teardowns = self.teardowns.load(Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            if self.teardowns.load(Ordering::SeqCst) != teardowns {
                return Err(TransportError::Connection("session closed in flight".into()));
            }
        }
        let failing = self.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_publishes.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Connection("publish dropped".into()));
        }
        Ok(())
    }
}

/// Polls `check` until it holds or a second passes.
pub(crate) async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

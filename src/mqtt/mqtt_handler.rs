//! [`Transport`] backed by `rumqttc`.
//!
//! Each `connect` builds a new `AsyncClient`/`EventLoop` pair and hands the
//! event loop to a poll task. The poll task resolves the handshake, forwards
//! publishes, and matches broker acknowledgements to the requests waiting on
//! them. After the first `ConnAck` the event loop keeps reconnecting by
//! itself; every later `ConnAck` is reported as [`TransportEvent::Reconnected`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport as MqttTransport,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ConnectParams;
use super::message_manager::InboundMessage;
use super::transport::{EventSink, Transport, TransportError, TransportEvent};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const POLL_BACKOFF: Duration = Duration::from_secs(1);

type AckResult = Result<(), TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Pairs requests with their acknowledgements.
///
/// Requests are queued per kind in the order they are handed to the client;
/// the event loop emits `Outgoing` packets in that same order, which is when
/// a queued waiter learns its packet id.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    queued: HashMap<AckKind, VecDeque<oneshot::Sender<AckResult>>>,
    inflight: HashMap<(AckKind, u16), oneshot::Sender<AckResult>>,
}

impl AckTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, AckState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueue(&self, kind: AckKind) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().queued.entry(kind).or_default().push_back(tx);
        rx
    }

    /// Drops the most recent waiter of `kind` after its request never left.
    fn cancel_last(&self, kind: AckKind) {
        if let Some(queue) = self.lock().queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    fn assign(&self, kind: AckKind, pkid: u16) {
        let mut state = self.lock();
        if let Some(waiter) = state.queued.get_mut(&kind).and_then(VecDeque::pop_front) {
            state.inflight.insert((kind, pkid), waiter);
        }
    }

    fn complete(&self, kind: AckKind, pkid: u16, result: AckResult) {
        if let Some(waiter) = self.lock().inflight.remove(&(kind, pkid)) {
            let _ = waiter.send(result);
        }
    }

    fn fail_all(&self, reason: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut waiters: Vec<_> = state.queued.drain().flat_map(|(_, queue)| queue).collect();
        waiters.extend(state.inflight.drain().map(|(_, waiter)| waiter));
        for waiter in waiters {
            let _ = waiter.send(Err(TransportError::Connection(reason.to_string())));
        }
    }
}

struct Session {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    closing: Arc<AtomicBool>,
    poller: JoinHandle<()>,
}

#[derive(Default)]
pub struct RumqttTransport {
    session: Mutex<Option<Session>>,
    /// Keeps enqueue and hand-off of one request atomic with respect to others.
    request_order: tokio::sync::Mutex<()>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn handle(&self) -> Result<(AsyncClient, Arc<AckTracker>), TransportError> {
        self.lock_session()
            .as_ref()
            .map(|s| (s.client.clone(), s.acks.clone()))
            .ok_or(TransportError::NotConnected)
    }

    async fn request(&self, kind: AckKind, topic: &str, payload: Option<&[u8]>) -> AckResult {
        let (client, acks) = self.handle()?;
        let ack = {
            let _order = self.request_order.lock().await;
            let ack = acks.enqueue(kind);
            let sent = match kind {
                AckKind::Subscribe => client.subscribe(topic, QoS::AtLeastOnce).await,
                AckKind::Unsubscribe => client.unsubscribe(topic).await,
                AckKind::Publish => {
                    let payload = payload.unwrap_or_default().to_vec();
                    client.publish(topic, QoS::AtLeastOnce, false, payload).await
                }
            };
            if let Err(e) = sent {
                acks.cancel_last(kind);
                return Err(TransportError::Client(e.to_string()));
            }
            ack
        };
        ack.await.unwrap_or(Err(TransportError::Closed))
    }
}

fn mqtt_options(params: ConnectParams) -> MqttOptions {
    let mut options = MqttOptions::new(params.client_id, params.host, params.port);
    options
        .set_credentials(params.username, params.password)
        .set_keep_alive(params.keep_alive)
        .set_clean_session(true);
    if params.use_tls {
        options.set_transport(MqttTransport::tls_with_default_config());
    }
    options
}

async fn poll_loop(
    mut eventloop: EventLoop,
    events: EventSink,
    acks: Arc<AckTracker>,
    closing: Arc<AtomicBool>,
    ready: oneshot::Sender<AckResult>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let accepted = ack.code == ConnectReturnCode::Success;
                match ready.take() {
                    Some(tx) if accepted => {
                        let _ = tx.send(Ok(()));
                    }
                    Some(tx) => {
                        let _ = tx.send(Err(TransportError::Refused(format!("{:?}", ack.code))));
                        return;
                    }
                    None if accepted => {
                        info!("MQTT session re-established by event loop");
                        events.send(TransportEvent::Reconnected);
                    }
                    None => {
                        events.send(TransportEvent::ConnectionLost(format!("{:?}", ack.code)));
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::from_topic(publish.topic, publish.payload.to_vec());
                if !events.send(TransportEvent::Message(message)) {
                    debug!("Event receiver dropped, stopping poll task");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err(TransportError::Rejected(format!("suback {}", ack.pkid)))
                } else {
                    Ok(())
                };
                acks.complete(AckKind::Subscribe, ack.pkid, result);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                acks.complete(AckKind::Unsubscribe, ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                acks.complete(AckKind::Publish, ack.pkid, Ok(()));
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => acks.assign(AckKind::Subscribe, pkid),
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                acks.assign(AckKind::Unsubscribe, pkid)
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.assign(AckKind::Publish, pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                acks.fail_all("disconnected");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                acks.fail_all(&reason);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(TransportError::Refused(reason)));
                    return;
                }
                if closing.load(Ordering::SeqCst) {
                    return;
                }
                warn!("MQTT connection error: {}", reason);
                events.send(TransportEvent::ConnectionLost(reason));
                tokio::time::sleep(POLL_BACKOFF).await;
            }
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, params: ConnectParams, events: EventSink) -> Result<(), TransportError> {
        self.disconnect(Duration::ZERO).await?;

        debug!(
            "Connecting to {}:{} as {} (tls: {})",
            params.host, params.port, params.client_id, params.use_tls
        );
        let (client, eventloop) = AsyncClient::new(mqtt_options(params), REQUEST_CHANNEL_CAPACITY);
        let acks = Arc::new(AckTracker::default());
        let closing = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_loop(
            eventloop,
            events,
            acks.clone(),
            closing.clone(),
            ready_tx,
        ));

        // Stored before the handshake resolves so a caller that gives up
        // waiting can still tear the session down.
        *self.lock_session() = Some(Session {
            client,
            acks,
            closing,
            poller,
        });

        let outcome = ready_rx.await.unwrap_or(Err(TransportError::Closed));
        if outcome.is_err() {
            if let Some(session) = self.lock_session().take() {
                session.poller.abort();
            }
        }
        outcome
    }

    async fn disconnect(&self, linger: Duration) -> Result<(), TransportError> {
        let session = self.lock_session().take();
        let Some(mut session) = session else {
            return Ok(());
        };
        session.closing.store(true, Ordering::SeqCst);
        if session.client.try_disconnect().is_ok() && !linger.is_zero() {
            let _ = tokio::time::timeout(linger, &mut session.poller).await;
        }
        session.poller.abort();
        session.acks.fail_all("disconnected");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request(AckKind::Subscribe, topic, None).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.request(AckKind::Unsubscribe, topic, None).await
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.request(AckKind::Publish, topic, Some(payload)).await
    }
}

//! # MQTT Connectivity Layer
//!
//! Keeps a field unit reachable over an unreliable broker link. The unit may
//! lose its session at any moment; the layer guarantees that the next
//! operation finds a usable session and that every topic the unit asked for
//! is subscribed again afterwards.
//!
//! ## Why This Module Exists
//!
//! Units run unattended on flaky networks. A broker restart, a NAT timeout or
//! a Wi-Fi drop must never leave a unit deaf to its update topic. Recovery is
//! lazy: a lost session is only marked as such, and the next publish or
//! subscribe reconnects before it runs.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Per-attempt connect parameters and timeouts
//! ├── message_manager.rs  - Inbound message representation
//! ├── transport.rs        - Transport trait, events and errors
//! ├── mqtt_handler.rs     - rumqttc-backed transport
//! ├── connection.rs       - Session state, subscription journal, epochs
//! └── retry.rs            - Retry-then-reconnect policy
//! ```
//!
//! ## Flow
//!
//! Outbound: caller → [`RetryingExecutor`] → [`ConnectionManager`] →
//! [`Transport`]. Inbound: transport poll task → epoch filter in the
//! connection manager → unbounded channel → the client's dispatch task.

pub mod config;
pub mod connection;
pub mod message_manager;
pub mod mqtt_handler;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConnectParams, MqttTuning};
pub use connection::{ConnectionManager, ConnectionState};
pub use message_manager::InboundMessage;
pub use mqtt_handler::RumqttTransport;
pub use retry::RetryingExecutor;
pub use transport::{EventSink, Transport, TransportError, TransportEvent};

//! # pepeunit-client
//!
//! Device-side runtime for Pepeunit units: keeps a unit reachable over MQTT
//! and lets it replace its own program when the server says so.
//!
//! ## Module Architecture
//!
//! ```text
//! src/
//! ├── client.rs     - PepeunitClient facade, message routing, main cycle glue
//! ├── mqtt/         - Connection state, subscription journal, retry policy
//! ├── update/       - Update cycle and restart strategies
//! ├── schema/       - Logical topic names to wire topics
//! ├── cycle.rs      - Fixed-period scheduler and state snapshot
//! ├── rest/         - Backend file transfers and state storage
//! ├── settings.rs   - Server-issued env JSON
//! ├── config.rs     - Local client.toml
//! ├── logger.rs     - Unit log (NDJSON file, mirrored to the broker)
//! ├── identity.rs   - Unit id from the auth token
//! ├── cipher.rs     - AES-GCM helper
//! ├── files.rs      - JSON files, archives, copies
//! └── error.rs      - Error taxonomy
//! ```

pub mod cipher;
pub mod client;
pub mod config;
pub mod cycle;
pub mod error;
pub mod files;
pub mod identity;
pub mod logger;
pub mod mqtt;
pub mod rest;
pub mod schema;
pub mod settings;
pub mod update;

pub use client::{ClientParts, InputHandler, PepeunitClient};
pub use config::ClientConfig;
pub use error::{PepeunitError, Result};
pub use mqtt::InboundMessage;
pub use update::{RestartMode, UpdateHandler};

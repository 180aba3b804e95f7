//! LoRa gateway bridge: drives an RN2483/RN2903 transceiver over serial,
//! decodes the framed payloads it receives, and forwards them to a cloud
//! ingestion service.

pub mod codec;
pub mod config;
pub mod exit_codes;
pub mod queue;
pub mod radio;
pub mod service;
pub mod snapshot;
pub mod supervisor;
pub mod telecast;

pub use config::GatewayConfig;
pub use radio::{CommandStateMachine, GatewayIdentity, Region};
pub use service::{IpInfo, ServiceClient};
pub use snapshot::SnapshotStore;

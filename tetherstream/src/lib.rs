//! TetherStream -- reliability and ordering over unreliable datagrams.
//!
//! Layers three delivery guarantees on top of a datagram socket:
//! - **Unreliable**: sent once, delivered if it arrives
//! - **Reliable-Unordered**: acknowledged and resent until acknowledged
//! - **Reliable-Ordered**: reliable, and released to the application in send order
//!
//! Payloads above the fragment size are split and reassembled transparently.
//! A handshake opens each connection and a ping/pong keep-alive detects dead
//! peers.

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod rtt;
pub mod sequence;
pub mod transport;

// Re-export key public types at crate root.
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionState, DisconnectReason};
pub use driver::{spawn_driver, spawn_receiver};
pub use error::{Result, TetherStreamError};
pub use packet::{Packet, SendOption};
pub use rtt::RttEstimator;
pub use transport::{DatagramSink, DeliveryGuarantee};

//! Point-to-point UDP virtual tunnel client
//!
//! This crate provides the core of the tunnel client:
//! - Binary wire protocol codec with shared-key authentication
//! - Optional AEAD payload encryption (ring)
//! - Packet relay between the tunnel device and the peer
//! - Connection lifecycle: keepalives, liveness timeout, reconnect
//! - Routing-table introspection for picking the source address
//!
//! The binary crate owns argument parsing and the tunnel device itself and
//! hands both to [`client::run_client`].

// ============================================================================
// Modules
// ============================================================================

#[cfg(unix)]
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod process;
pub mod protocol;
pub mod relay;
pub mod route;
pub mod stats;

#[cfg(unix)]
pub use client::run_client;
pub use config::{parse_net, ClientConfig};
pub use error::ClientError;
pub use frame::{Family, PacketInfo, TunnelDevice, TunnelFrame};

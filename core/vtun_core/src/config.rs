//! Client configuration
//!
//! Built once at startup (by the binary's argument parser) and then passed
//! by reference to every component. Nothing mutates it afterwards.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use ipnet::{AddrParseError, IpNet};

use crate::crypto::{AeadCipher, Cipher, CipherKind, CryptoError, SharedKey};
use crate::protocol::{Codec, MAX_IP_PAYLOAD};

// ============================================================================
// Constants
// ============================================================================

/// Seconds without any valid datagram before the link is rebuilt
pub const DEFAULT_RECONNECT_TIMEOUT: u64 = 47;

/// Seconds between keepalives
pub const DEFAULT_KEEPALIVE_TIMEOUT: u64 = 7;

/// Tunnel interface MTU
pub const DEFAULT_MTU: u32 = 1300;

/// Smallest MTU an IPv4 link may have
pub const MIN_MTU: u32 = 68;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroTimeout(&'static str),
    InvalidMtu(u32),
    WrongFamily { option: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroTimeout(name) => write!(f, "{} timeout must be positive", name),
            ConfigError::InvalidMtu(mtu) => write!(
                f,
                "MTU {} out of range ({}..={})",
                mtu, MIN_MTU, MAX_IP_PAYLOAD
            ),
            ConfigError::WrongFamily { option, value } => {
                write!(f, "{} expects a different address family: '{}'", option, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Address With Prefix
// ============================================================================

/// Parse `ADDR/PREFIX`, or a bare `ADDR` as a host network
pub fn parse_net(s: &str) -> Result<IpNet, AddrParseError> {
    let s = s.trim();
    s.parse::<IpNet>()
        .or_else(|e| s.parse::<IpAddr>().map(IpNet::from).map_err(|_| e))
}

// ============================================================================
// Client Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seconds of silence before reconnecting
    pub reconnect_timeout: u64,
    /// Seconds between keepalives
    pub keepalive_timeout: u64,
    pub shared_key: SharedKey,
    /// Payload encryption, `None` sends plaintext
    pub cipher: Option<CipherKind>,
    /// Local tunnel IPv4 address (also advertised in keepalives)
    pub tunnel_ipv4: Option<IpNet>,
    /// Local tunnel IPv6 address (also advertised in keepalives)
    pub tunnel_ipv6: Option<IpNet>,
    /// Explicit local source address for the UDP socket
    pub bind_addr: Option<String>,
    /// Interface whose first IPv4 address is used as the source, re-read on every connect
    pub bind_if: Option<String>,
    /// Defer an initial resolution/connect failure instead of exiting
    pub wait_dns: bool,
    /// Requested tunnel device name
    pub ifname: Option<String>,
    pub mtu: u32,
    pub pid_file: Option<PathBuf>,
    pub daemon: bool,
    /// Extra routes pointed at the tunnel device
    pub routes: Vec<IpNet>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            shared_key: SharedKey::from_password(None),
            cipher: None,
            tunnel_ipv4: None,
            tunnel_ipv6: None,
            bind_addr: None,
            bind_if: None,
            wait_dns: false,
            ifname: None,
            mtu: DEFAULT_MTU,
            pid_file: None,
            daemon: false,
            routes: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_timeout == 0 {
            return Err(ConfigError::ZeroTimeout("reconnect"));
        }
        if self.keepalive_timeout == 0 {
            return Err(ConfigError::ZeroTimeout("keepalive"));
        }
        if self.mtu < MIN_MTU || self.mtu as usize > MAX_IP_PAYLOAD {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        if let Some(net) = &self.tunnel_ipv4 {
            if !matches!(net, IpNet::V4(_)) {
                return Err(ConfigError::WrongFamily {
                    option: "--ipv4-addr",
                    value: net.to_string(),
                });
            }
        }
        if let Some(net) = &self.tunnel_ipv6 {
            if !matches!(net, IpNet::V6(_)) {
                return Err(ConfigError::WrongFamily {
                    option: "--ipv6-addr",
                    value: net.to_string(),
                });
            }
        }
        Ok(())
    }

    /// IPv4 address advertised in keepalives
    pub fn advertised_ipv4(&self) -> Ipv4Addr {
        match self.tunnel_ipv4.map(|net| net.addr()) {
            Some(IpAddr::V4(addr)) => addr,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }

    /// IPv6 address advertised in keepalives
    pub fn advertised_ipv6(&self) -> Ipv6Addr {
        match self.tunnel_ipv6.map(|net| net.addr()) {
            Some(IpAddr::V6(addr)) => addr,
            _ => Ipv6Addr::UNSPECIFIED,
        }
    }

    /// Codec for the configured key and cipher
    pub fn codec(&self) -> Result<Codec, CryptoError> {
        let cipher = match self.cipher {
            Some(kind) => Some(Box::new(AeadCipher::new(kind, &self.shared_key)?) as Box<dyn Cipher>),
            None => None,
        };
        Ok(Codec::new(self.shared_key.auth_key(), cipher))
    }
}

// ============================================================================
// Tests
// ============================================================================

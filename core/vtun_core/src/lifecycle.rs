//! Connection lifecycle: connect, keepalive, reconnect
//!
//! Owns the UDP link to the peer and the liveness bookkeeping. The event
//! loop calls in on every poll return and on readable descriptors; all
//! decisions about when to send keepalives and when to rebuild the link
//! are made here.
//!
//! # State Machine
//!
//! ```text
//! Unestablished ──start──→ Connected ←──────────────┐
//!       │                      │ silence / recv error│
//!       │ transient+wait_dns   ↓                     │
//!       ├──────────→ WaitingForDns ──→ Reconnecting ─┘
//!       │ otherwise
//!       ↓
//!     Fatal
//! ```
//!
//! Timestamps are wall-clock seconds. A clock that jumps backwards is
//! tolerated by clamping stored timestamps to the current time.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::frame::{TunnelDevice, PI_HEADER_LEN};
use crate::protocol::MAX_MESSAGE_LEN;
use crate::relay::{Inbound, Relay};
use crate::stats::Stats;

// ============================================================================
// Constants
// ============================================================================

/// Pause between failed reconnect attempts
pub const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Receive buffer: largest message plus room for cipher overhead
const RECV_BUFFER_SIZE: usize = MAX_MESSAGE_LEN + 64;

/// Tunnel read buffer: header plus the largest payload we could forward
const TUNNEL_BUFFER_SIZE: usize = PI_HEADER_LEN + MAX_MESSAGE_LEN;

// ============================================================================
// Seams
// ============================================================================

/// Time source
pub trait Clock {
    /// Current time in whole seconds
    fn now(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

/// Wall-clock time, as the peer sees it
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A connected datagram transport
pub trait Link {
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl Link for mio::net::UdpSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        mio::net::UdpSocket::send(self, buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        mio::net::UdpSocket::recv(self, buf)
    }
}

/// Errors opening a link to the peer
#[derive(Debug)]
pub enum DialError {
    /// Not a `host:port` pair
    InvalidAddress(String),
    /// Name resolution failed or returned nothing usable
    Resolve(io::Error),
    /// Local bind address could not be bound
    BindUnavailable { addr: SocketAddr, source: io::Error },
    /// Socket could not be created or configured
    Socket(io::Error),
    /// Connect to the resolved address failed
    Connect(io::Error),
}

impl DialError {
    /// Failures that may go away on their own (DNS, routing)
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::Resolve(_) | DialError::Connect(_))
    }
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::InvalidAddress(s) => write!(f, "invalid address pair '{}'", s),
            DialError::Resolve(e) => write!(f, "resolution failed: {}", e),
            DialError::BindUnavailable { addr, source } => {
                write!(f, "cannot bind to address {}: {}", addr, source)
            }
            DialError::Socket(e) => write!(f, "socket setup failed: {}", e),
            DialError::Connect(e) => write!(f, "connect failed: {}", e),
        }
    }
}

impl std::error::Error for DialError {}

/// Opens links to the peer
pub trait Dialer {
    type Link: Link;

    /// Resolve `peer` (`host:port`) and open a fresh connected link
    fn dial(&mut self, peer: &str) -> Result<(Self::Link, SocketAddr), DialError>;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `start` not called yet
    Unestablished,
    /// Initial connect deferred; no link yet
    WaitingForDns,
    Connected,
    /// Inside the blocking retry loop
    Reconnecting,
    /// Initial connect failed for good
    Fatal,
}

/// Outcome of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Continue,
    /// Link was rebuilt; pending events belong to the old socket
    Reconnected,
}

/// Outcome of draining the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Ok,
    /// Transport error; caller should reconnect
    Failed,
}

pub struct Lifecycle<D: Dialer, C: Clock> {
    dialer: D,
    clock: C,
    relay: Relay,
    peer: String,
    reconnect_timeout: u64,
    keepalive_timeout: u64,
    wait_dns: bool,
    state: ConnectionState,
    link: Option<D::Link>,
    peer_addr: Option<SocketAddr>,
    last_received_at: u64,
    last_keepalive_sent_at: u64,
    /// Tunnel reported readable but not drained yet
    tunnel_pending: bool,
    stats: Stats,
    recv_buf: Vec<u8>,
    tunnel_buf: Vec<u8>,
}

impl<D: Dialer, C: Clock> Lifecycle<D, C> {
    pub fn new(dialer: D, clock: C, relay: Relay, peer: &str, config: &ClientConfig) -> Self {
        Lifecycle {
            dialer,
            clock,
            relay,
            peer: peer.to_string(),
            reconnect_timeout: config.reconnect_timeout,
            keepalive_timeout: config.keepalive_timeout,
            wait_dns: config.wait_dns,
            state: ConnectionState::Unestablished,
            link: None,
            peer_addr: None,
            last_received_at: 0,
            last_keepalive_sent_at: 0,
            tunnel_pending: false,
            stats: Stats::new(),
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            tunnel_buf: vec![0u8; TUNNEL_BUFFER_SIZE],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link(&self) -> Option<&D::Link> {
        self.link.as_ref()
    }

    pub fn link_mut(&mut self) -> Option<&mut D::Link> {
        self.link.as_mut()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn last_received_at(&self) -> u64 {
        self.last_received_at
    }

    pub fn last_keepalive_sent_at(&self) -> u64 {
        self.last_keepalive_sent_at
    }

    /// A tunnel drain was deferred; the caller should wake again promptly
    pub fn has_pending_tunnel(&self) -> bool {
        self.tunnel_pending
    }

    /// Initial connect
    ///
    /// A transient failure is deferred when waiting for DNS is enabled; the
    /// first heartbeat then finds the link overdue and reconnects.
    pub fn start(&mut self) -> Result<(), ClientError> {
        // Forces a keepalive on the first heartbeat
        self.last_keepalive_sent_at = 0;

        match self.dialer.dial(&self.peer) {
            Ok((link, addr)) => {
                self.link = Some(link);
                self.peer_addr = Some(addr);
                self.last_received_at = self.clock.now();
                self.state = ConnectionState::Connected;
                log::info!("Tunnel client connected to {}", addr);
                Ok(())
            }
            Err(e) if e.is_transient() && self.wait_dns => {
                self.last_received_at = 0;
                self.state = ConnectionState::WaitingForDns;
                log::warn!(
                    "Connection to '{}' temporarily unavailable ({}), to be tried later",
                    self.peer,
                    e
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Fatal;
                log::error!("Unable to connect to '{}': {}", self.peer, e);
                Err(ClientError::Dial(e))
            }
        }
    }

    /// One wake of the event loop
    ///
    /// The heartbeat runs first. If it rebuilt the link, or the link failed
    /// while being drained, nothing else is relayed on this wake and a
    /// readable tunnel is remembered for the next one (readiness is
    /// edge-triggered, so it would not be reported again).
    pub fn on_events<T: TunnelDevice + ?Sized>(
        &mut self,
        link_readable: bool,
        tunnel_readable: bool,
        tunnel: &mut T,
    ) -> Wake {
        self.tunnel_pending |= tunnel_readable;

        if self.on_wake() == Wake::Reconnected {
            return Wake::Reconnected;
        }

        if link_readable && self.on_link_readable(tunnel) == LinkStatus::Failed {
            self.reconnect();
            return Wake::Reconnected;
        }

        if self.tunnel_pending {
            self.tunnel_pending = false;
            self.on_tunnel_readable(tunnel);
        }
        Wake::Continue
    }

    /// Heartbeat, run on every poll return before any data is relayed
    pub fn on_wake(&mut self) -> Wake {
        let now = self.clock.now();

        if self.last_received_at > now {
            self.last_received_at = now;
        }
        if self.last_keepalive_sent_at > now {
            self.last_keepalive_sent_at = now;
        }

        if now - self.last_keepalive_sent_at > self.keepalive_timeout {
            self.send_keepalive(now);
        }

        if now - self.last_received_at > self.reconnect_timeout {
            log::warn!(
                "No valid datagram from peer for {}s, reconnecting",
                now - self.last_received_at
            );
            self.reconnect();
            return Wake::Reconnected;
        }

        Wake::Continue
    }

    fn send_keepalive(&mut self, now: u64) {
        let link = match &self.link {
            Some(link) => link,
            None => return,
        };

        let msg = match self.relay.make_keepalive() {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to build keepalive: {}", e);
                return;
            }
        };

        match link.send(msg) {
            // Timestamp only moves when the keepalive actually left
            Ok(n) if n > 0 => {
                self.last_keepalive_sent_at = now;
                self.stats.keepalives_sent += 1;
                self.stats.record_tx(n);
                log::trace!("Keepalive sent ({} bytes)", n);
            }
            Ok(_) => log::debug!("Keepalive send wrote nothing"),
            Err(e) => log::debug!("Keepalive send failed: {}", e),
        }
    }

    /// Drain the link, writing accepted packets to the tunnel device
    pub fn on_link_readable<T: TunnelDevice + ?Sized>(&mut self, tunnel: &mut T) -> LinkStatus {
        loop {
            let link = match &self.link {
                Some(link) => link,
                None => return LinkStatus::Ok,
            };

            let n = match link.recv(&mut self.recv_buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return LinkStatus::Ok,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Connection went bad ({}), about to reconnect", e);
                    return LinkStatus::Failed;
                }
            };

            match self.relay.network_to_tunnel(&mut self.recv_buf[..n]) {
                Ok(inbound) => {
                    self.last_received_at = self.clock.now();
                    self.stats.record_rx(n);

                    match inbound {
                        Inbound::Packet(frame) => {
                            log::trace!("Peer → tunnel: {:?} {} bytes", frame.family, frame.payload.len());
                            if let Err(e) = tunnel.write_frame(&frame) {
                                log::debug!("Tunnel write failed: {}", e);
                            }
                        }
                        Inbound::Keepalive => log::trace!("Keepalive from peer"),
                    }
                }
                Err(reason) => {
                    self.stats.rx_rejected += 1;
                    log::trace!("Dropped datagram ({} bytes): {}", n, reason);
                }
            }
        }
    }

    /// Drain the tunnel device, forwarding packets to the peer
    pub fn on_tunnel_readable<T: TunnelDevice + ?Sized>(&mut self, tunnel: &mut T) {
        loop {
            let frame = match tunnel.read_frame(&mut self.tunnel_buf) {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.stats.tx_dropped += 1;
                    log::debug!("Dropping unreadable tunnel frame: {}", e);
                    continue;
                }
                Err(e) => {
                    log::warn!("Tunnel read failed: {}", e);
                    return;
                }
            };

            let link = match &self.link {
                Some(link) => link,
                None => {
                    self.stats.tx_dropped += 1;
                    continue;
                }
            };

            match self.relay.tunnel_to_network(&frame) {
                Some(msg) => match link.send(msg) {
                    Ok(n) => {
                        self.stats.record_tx(n);
                        log::trace!("Tunnel → peer: {:?} {} bytes", frame.family, n);
                    }
                    Err(e) => log::debug!("Send to peer failed: {}", e),
                },
                None => self.stats.tx_dropped += 1,
            }
        }
    }

    /// Drop the link and dial until it works, 5 s between attempts
    ///
    /// Blocks all relaying while it runs.
    pub fn reconnect(&mut self) {
        self.state = ConnectionState::Reconnecting;
        self.link = None;
        log::info!("Link statistics: {}", self.stats);

        let addr = loop {
            match self.dialer.dial(&self.peer) {
                Ok((link, addr)) => {
                    self.link = Some(link);
                    break addr;
                }
                Err(e) => {
                    log::warn!(
                        "Unable to connect to '{}' ({}), retrying in {}s",
                        self.peer,
                        e,
                        RECONNECT_RETRY_DELAY.as_secs()
                    );
                    self.clock.sleep(RECONNECT_RETRY_DELAY);
                }
            }
        };

        self.peer_addr = Some(addr);
        self.last_keepalive_sent_at = 0;
        self.last_received_at = self.clock.now();
        self.state = ConnectionState::Connected;
        self.stats.reconnections += 1;
        log::info!("Reconnected to {}", addr);
    }
}

// ============================================================================
// Tests
// ============================================================================

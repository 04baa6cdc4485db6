//! Client runner
//!
//! Wires the pieces together and runs the single-threaded event loop:
//!
//! ```text
//!            ┌──────────────┐   IpData/Keepalive    ┌──────────┐
//!  tunnel ──→│  Lifecycle   │──────── UDP ─────────→│   peer   │
//!  device ←──│  + Relay     │←───────────────────── │          │
//!            └──────────────┘                       └──────────┘
//! ```
//!
//! One mio `Poll` watches the tunnel descriptor and the UDP socket with a
//! 2 s timeout. Every return runs the keepalive/reconnect heartbeat first,
//! then drains whichever descriptors are readable (`Lifecycle::on_events`).

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::frame::TunnelDevice;
use crate::lifecycle::{DialError, Dialer, Lifecycle, SystemClock, Wake};
use crate::process;
use crate::relay::Relay;
use crate::route::{validate_and_resolve_bind_address, RouteError, RouteTable, SystemRouteTable};

// ============================================================================
// Constants
// ============================================================================

const TUNNEL_TOKEN: Token = Token(0);
const LINK_TOKEN: Token = Token(1);

/// Heartbeat interval: keepalive/reconnect checks run at least this often
pub const POLL_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// UDP Dialer
// ============================================================================

/// Split `host:port` (IPv6 literals in brackets)
pub fn split_host_port(pair: &str) -> Option<(&str, u16)> {
    let (host, port) = pair.trim().rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };

    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Opens connected, non-blocking UDP sockets to the peer
///
/// The peer name is resolved afresh on every dial. When a bind interface
/// is known its first IPv4 address is looked up again too, so the socket
/// follows address changes on that interface.
pub struct UdpDialer<R: RouteTable> {
    table: R,
    bind_if: Option<String>,
    bind_addr: Option<Ipv4Addr>,
}

impl<R: RouteTable> UdpDialer<R> {
    /// Work out the local binding from the configuration
    ///
    /// An explicit bind address must be valid and on a default-route
    /// interface. With neither address nor interface configured the
    /// default-route interface is tracked; if there is none the socket is
    /// left unbound.
    pub fn from_config(table: R, config: &ClientConfig) -> Result<Self, RouteError> {
        let mut dialer = UdpDialer {
            table,
            bind_if: config.bind_if.clone(),
            bind_addr: None,
        };

        match (config.bind_addr.as_deref(), config.bind_if.as_deref()) {
            (Some(explicit), _) => {
                let target = validate_and_resolve_bind_address(&dialer.table, Some(explicit))?;
                log::info!("Binding to {} on {}", target.addr, target.interface);
                dialer.bind_addr = Some(target.addr);
            }
            (None, Some(name)) => log::info!("Binding to the first IPv4 address of {}", name),
            (None, None) => match validate_and_resolve_bind_address(&dialer.table, None) {
                Ok(target) => {
                    log::info!(
                        "Default route via {} ({}), binding to it",
                        target.interface,
                        target.addr
                    );
                    dialer.bind_addr = Some(target.addr);
                    dialer.bind_if = Some(target.interface);
                }
                Err(e) => {
                    log::warn!("No usable default route ({}), socket left unbound", e);
                }
            },
        }

        Ok(dialer)
    }

    pub fn bind_addr(&self) -> Option<Ipv4Addr> {
        self.bind_addr
    }

    fn refresh_bind_addr(&mut self) {
        let name = match &self.bind_if {
            Some(name) => name,
            None => return,
        };
        match self.table.ip_of_interface(name) {
            Ok(addr) => {
                if self.bind_addr != Some(addr) {
                    log::info!("Bind address is now {} ({})", addr, name);
                }
                self.bind_addr = Some(addr);
            }
            Err(e) => log::debug!("No IPv4 address on {} ({}), keeping previous", name, e),
        }
    }
}

impl<R: RouteTable> Dialer for UdpDialer<R> {
    type Link = UdpSocket;

    fn dial(&mut self, peer: &str) -> Result<(UdpSocket, SocketAddr), DialError> {
        let (host, port) =
            split_host_port(peer).ok_or_else(|| DialError::InvalidAddress(peer.to_string()))?;

        self.refresh_bind_addr();

        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(DialError::Resolve)?
            .collect();

        // An IPv4 source address can only reach an IPv4 peer
        let preferred = match self.bind_addr {
            Some(_) => candidates.iter().find(|a| a.is_ipv4()),
            None => None,
        };
        let peer_addr = preferred.or_else(|| candidates.first()).copied().ok_or_else(|| {
            DialError::Resolve(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ))
        })?;

        let local = match (self.bind_addr, peer_addr) {
            (Some(addr), SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(addr), 0),
            (_, SocketAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            (_, SocketAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = std::net::UdpSocket::bind(local).map_err(|e| {
            if local.ip().is_unspecified() {
                DialError::Socket(e)
            } else {
                DialError::BindUnavailable {
                    addr: local,
                    source: e,
                }
            }
        })?;
        socket.connect(peer_addr).map_err(DialError::Connect)?;
        socket.set_nonblocking(true).map_err(DialError::Socket)?;

        log::debug!("UDP socket {:?} → {}", socket.local_addr().ok(), peer_addr);
        Ok((UdpSocket::from_std(socket), peer_addr))
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Run the tunnel client until a fatal error
///
/// Connects to `peer` (`host:port`), optionally daemonizes and writes the
/// PID file, then relays packets forever.
pub fn run_client<T>(mut tunnel: T, peer: &str, config: &ClientConfig) -> Result<Infallible, ClientError>
where
    T: TunnelDevice + AsRawFd,
{
    config.validate()?;

    let relay = Relay::new(config.codec()?, config.advertised_ipv4(), config.advertised_ipv6());
    let dialer = UdpDialer::from_config(SystemRouteTable::default(), config)?;
    let mut lifecycle = Lifecycle::new(dialer, SystemClock, relay, peer, config);

    lifecycle.start()?;
    log::info!(
        "Tunnel client to {}, interface {}, cipher {}",
        peer,
        tunnel.name(),
        config.cipher.map_or("none", |c| c.name())
    );

    if config.daemon {
        process::daemonize().map_err(ClientError::Daemonize)?;
    }
    if let Some(path) = &config.pid_file {
        if let Err(e) = process::write_pid_file(path) {
            log::warn!("Failed to write PID file {}: {}", path.display(), e);
        }
    }

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);

    let tunnel_fd = tunnel.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&tunnel_fd), TUNNEL_TOKEN, Interest::READABLE)?;
    register_link(&poll, &mut lifecycle)?;

    loop {
        // A tunnel drain deferred by a reconnect will not be signalled again
        let timeout = if lifecycle.has_pending_tunnel() {
            Duration::ZERO
        } else {
            POLL_TIMEOUT
        };
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ClientError::Poll(e));
        }

        let mut link_readable = false;
        let mut tunnel_readable = false;
        for event in events.iter() {
            match event.token() {
                LINK_TOKEN => link_readable = true,
                TUNNEL_TOKEN => tunnel_readable = true,
                _ => {}
            }
        }

        if lifecycle.on_events(link_readable, tunnel_readable, &mut tunnel) == Wake::Reconnected {
            register_link(&poll, &mut lifecycle)?;
        }
    }
}

/// Register the current socket; the previous one was closed on drop
fn register_link<R: RouteTable>(
    poll: &Poll,
    lifecycle: &mut Lifecycle<UdpDialer<R>, SystemClock>,
) -> io::Result<()> {
    if let Some(link) = lifecycle.link_mut() {
        poll.registry().register(link, LINK_TOKEN, Interest::READABLE)?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

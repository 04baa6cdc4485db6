//! Linux routing backend (rtnetlink)
//!
//! Sends one `RTM_GETROUTE` dump request for the IPv4 family on a
//! `NETLINK_ROUTE` socket and collects the `RTM_NEWROUTE` replies until
//! `NLMSG_DONE`. Only the main table is kept; the destination comes from
//! `RTA_DST` plus the prefix length, the interface from `RTA_OIF`.
//!
//! ```text
//! nlmsghdr (16B): len u32 | type u16 | flags u16 | seq u32 | pid u32
//! rtmsg    (12B): family | dst_len | src_len | tos | table | proto | scope | type | flags u32
//! rtattr   (4B+): len u16 | type u16 | data, padded to 4 bytes
//! ```
//!
//! Netlink integers are in host byte order.

use std::io;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::{ifaddrs, InterfaceAddr, RouteEntry, RouteTable};

// ============================================================================
// Constants
// ============================================================================

const NLMSG_HDR_LEN: usize = 16;
const RTMSG_LEN: usize = 12;
const RTA_HDR_LEN: usize = 4;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWROUTE: u16 = 24;
const RTM_GETROUTE: u16 = 26;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x300;

const AF_INET: u8 = 2;
const RT_TABLE_MAIN: u32 = 254;

const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_TABLE: u16 = 15;

/// Receive buffer for one batch of dump replies
const RECV_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Parsing
// ============================================================================

/// A main-table IPv4 route before its interface index is resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkRoute {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub oif: u32,
}

impl NetlinkRoute {
    /// `None` for a prefix length the kernel should never report
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        Ipv4Net::new(self.destination, self.prefix_len)
            .ok()
            .map(|net| net.netmask())
    }
}

/// Whether a batch of replies finished the dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpProgress {
    More,
    Done,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Serialize the `RTM_GETROUTE` dump request
pub fn build_dump_request(seq: u32) -> Vec<u8> {
    let len = NLMSG_HDR_LEN + RTMSG_LEN;
    let mut req = Vec::with_capacity(len);

    req.extend_from_slice(&(len as u32).to_ne_bytes());
    req.extend_from_slice(&RTM_GETROUTE.to_ne_bytes());
    req.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    req.extend_from_slice(&seq.to_ne_bytes());
    req.extend_from_slice(&0u32.to_ne_bytes());

    let mut rtm = [0u8; RTMSG_LEN];
    rtm[0] = AF_INET;
    rtm[4] = RT_TABLE_MAIN as u8;
    req.extend_from_slice(&rtm);

    req
}

/// Parse one `recv` worth of netlink messages, appending routes to `out`
pub fn parse_route_dump(buf: &[u8], out: &mut Vec<NetlinkRoute>) -> io::Result<DumpProgress> {
    let mut offset = 0;

    while offset + NLMSG_HDR_LEN <= buf.len() {
        let len = read_u32(buf, offset) as usize;
        let kind = read_u16(buf, offset + 4);

        if len < NLMSG_HDR_LEN || offset + len > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed netlink message",
            ));
        }

        let payload = &buf[offset + NLMSG_HDR_LEN..offset + len];
        match kind {
            NLMSG_DONE => return Ok(DumpProgress::Done),
            NLMSG_ERROR => {
                if payload.len() >= 4 {
                    let code = read_u32(payload, 0) as i32;
                    if code != 0 {
                        return Err(io::Error::from_raw_os_error(-code));
                    }
                }
            }
            RTM_NEWROUTE => {
                if let Some(route) = parse_route(payload) {
                    out.push(route);
                }
            }
            _ => {}
        }

        offset += align4(len);
    }

    Ok(DumpProgress::More)
}

fn parse_route(payload: &[u8]) -> Option<NetlinkRoute> {
    if payload.len() < RTMSG_LEN || payload[0] != AF_INET {
        return None;
    }

    let prefix_len = payload[1];
    let mut table = payload[4] as u32;
    let mut destination = Ipv4Addr::UNSPECIFIED;
    let mut oif = None;

    let mut offset = RTMSG_LEN;
    while offset + RTA_HDR_LEN <= payload.len() {
        let rta_len = read_u16(payload, offset) as usize;
        let rta_type = read_u16(payload, offset + 2);
        if rta_len < RTA_HDR_LEN || offset + rta_len > payload.len() {
            break;
        }

        let data = &payload[offset + RTA_HDR_LEN..offset + rta_len];
        match rta_type {
            RTA_DST if data.len() == 4 => {
                destination = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            }
            RTA_OIF if data.len() == 4 => oif = Some(read_u32(data, 0)),
            RTA_TABLE if data.len() == 4 => table = read_u32(data, 0),
            _ => {}
        }

        offset += align4(rta_len);
    }

    if table != RT_TABLE_MAIN {
        return None;
    }

    // Unreachable/blackhole routes have no output interface
    Some(NetlinkRoute {
        destination,
        prefix_len,
        oif: oif?,
    })
}

// ============================================================================
// Socket I/O
// ============================================================================

#[cfg(target_os = "linux")]
fn dump_routes() -> io::Result<Vec<NetlinkRoute>> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let req = build_dump_request(1);
    let sent = unsafe {
        libc::send(
            socket.as_raw_fd(),
            req.as_ptr() as *const libc::c_void,
            req.len(),
            0,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut routes = Vec::new();

    loop {
        let n = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }

        if parse_route_dump(&buf[..n as usize], &mut routes)? == DumpProgress::Done {
            break;
        }
    }

    log::trace!("Netlink dump returned {} main-table IPv4 routes", routes.len());
    Ok(routes)
}

#[cfg(not(target_os = "linux"))]
fn dump_routes() -> io::Result<Vec<NetlinkRoute>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "netlink is only available on Linux",
    ))
}

// ============================================================================
// Route Table
// ============================================================================

/// Routing table read through rtnetlink
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkRouteTable;

impl RouteTable for NetlinkRouteTable {
    fn routes(&self) -> io::Result<Vec<RouteEntry>> {
        let routes = dump_routes()?
            .into_iter()
            .filter_map(|r| {
                let interface = ifaddrs::interface_name(r.oif)?;
                Some(RouteEntry {
                    destination: r.destination,
                    netmask: r.netmask(),
                    interface,
                })
            })
            .collect();
        Ok(routes)
    }

    fn interface_addrs(&self) -> io::Result<Vec<InterfaceAddr>> {
        ifaddrs::ipv4_interface_addrs()
    }
}

// ============================================================================
// Tests
// ============================================================================

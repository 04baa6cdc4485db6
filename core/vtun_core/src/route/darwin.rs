//! macOS routing backend (`sysctl` `NET_RT_DUMP2`)
//!
//! The dump is a sequence of `rt_msghdr2` records, each followed by the
//! socket addresses flagged in `rtm_addrs`, in `RTAX_*` order. Every
//! sockaddr is padded to a 4-byte boundary, and a zero-length one still
//! takes 4 bytes:
//!
//! ```text
//! rt_msghdr2 (92B): msglen u16 | version | type | index u16 | pad | flags i32 | addrs i32 | ...
//! sockaddr:         sa_len | sa_family | data ...   (padded to 4)
//! ```
//!
//! Netmask sockaddrs are often truncated to the significant bytes; missing
//! bytes read as zero.

use std::io;
use std::net::Ipv4Addr;

use super::{ifaddrs, InterfaceAddr, RouteEntry, RouteTable};

// ============================================================================
// Constants
// ============================================================================

const RT_MSGHDR2_LEN: usize = 92;

const AF_INET: u8 = 2;

const RTAX_DST: usize = 0;
const RTAX_NETMASK: usize = 2;
const RTAX_MAX: usize = 8;

#[cfg(any(target_os = "macos", target_os = "ios"))]
const CTL_NET: libc::c_int = 4;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const PF_ROUTE: libc::c_int = 17;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const NET_RT_DUMP2: libc::c_int = 7;

// ============================================================================
// Parsing
// ============================================================================

/// An IPv4 route with its interface still as a kernel index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysctlRoute {
    pub destination: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub index: u16,
}

/// Space a sockaddr of length `len` occupies in a routing message
fn roundup(len: usize) -> usize {
    if len > 0 {
        1 + ((len - 1) | 3)
    } else {
        4
    }
}

/// Read the IPv4 address out of a (possibly truncated) sockaddr_in
fn sockaddr_ipv4(sa: &[u8]) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        if let Some(b) = sa.get(4 + i) {
            *octet = *b;
        }
    }
    Ipv4Addr::from(octets)
}

/// Parse a full `NET_RT_DUMP2` buffer into IPv4 routes
pub fn parse_route_dump(buf: &[u8]) -> Vec<SysctlRoute> {
    let mut routes = Vec::new();
    let mut offset = 0;

    while offset + RT_MSGHDR2_LEN <= buf.len() {
        let msglen = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        if msglen < RT_MSGHDR2_LEN || offset + msglen > buf.len() {
            log::debug!("Truncated routing message at offset {}", offset);
            break;
        }

        if let Some(route) = parse_message(&buf[offset..offset + msglen]) {
            routes.push(route);
        }
        offset += msglen;
    }

    routes
}

fn parse_message(msg: &[u8]) -> Option<SysctlRoute> {
    let index = u16::from_ne_bytes([msg[4], msg[5]]);
    let addrs = i32::from_ne_bytes([msg[12], msg[13], msg[14], msg[15]]);

    let mut sockaddrs: [Option<&[u8]>; RTAX_MAX] = [None; RTAX_MAX];
    let mut at = RT_MSGHDR2_LEN;
    for (i, slot) in sockaddrs.iter_mut().enumerate() {
        if addrs & (1 << i) == 0 {
            continue;
        }
        if at >= msg.len() {
            break;
        }
        let sa_len = msg[at] as usize;
        let end = (at + sa_len).min(msg.len());
        *slot = Some(&msg[at..end]);
        at += roundup(sa_len);
    }

    let dst = sockaddrs[RTAX_DST]?;
    if dst.len() < 2 || dst[1] != AF_INET {
        return None;
    }

    // Zero-length netmask means "no mask bits set"
    let netmask = sockaddrs[RTAX_NETMASK].map(sockaddr_ipv4);

    Some(SysctlRoute {
        destination: sockaddr_ipv4(dst),
        netmask,
        index,
    })
}

// ============================================================================
// sysctl I/O
// ============================================================================

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn dump_routes() -> io::Result<Vec<SysctlRoute>> {
    let mut mib = [CTL_NET, PF_ROUTE, 0, 0, NET_RT_DUMP2, 0];
    let mut size: libc::size_t = 0;

    let rv = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            std::ptr::null_mut(),
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }

    // Leave room for routes added between the two calls
    size += size / 8;
    let mut buf = vec![0u8; size];
    let rv = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(size);

    Ok(parse_route_dump(&buf))
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn dump_routes() -> io::Result<Vec<SysctlRoute>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "NET_RT_DUMP2 is only available on Darwin",
    ))
}

// ============================================================================
// Route Table
// ============================================================================

/// Routing table read through `sysctl`
#[derive(Debug, Default, Clone, Copy)]
pub struct SysctlRouteTable;

impl RouteTable for SysctlRouteTable {
    fn routes(&self) -> io::Result<Vec<RouteEntry>> {
        let routes = dump_routes()?
            .into_iter()
            .filter_map(|r| {
                let interface = ifaddrs::interface_name(r.index as u32)?;
                Some(RouteEntry {
                    destination: r.destination,
                    netmask: r.netmask,
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

#[cfg(test)]
mod tests {
    use super::*;

    const RTA_DST_BIT: i32 = 1 << RTAX_DST;
    const RTA_GATEWAY_BIT: i32 = 1 << 1;
    const RTA_NETMASK_BIT: i32 = 1 << RTAX_NETMASK;

    fn sockaddr_in(addr: [u8; 4]) -> Vec<u8> {
        let mut sa = vec![16u8, AF_INET, 0, 0];
        sa.extend_from_slice(&addr);
        sa.extend_from_slice(&[0u8; 8]);
        sa
    }

    fn rt_msg(index: u16, addrs: i32, sockaddrs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for sa in sockaddrs {
            let mut padded = sa.clone();
            padded.resize(roundup(sa.first().copied().unwrap_or(0) as usize), 0);
            body.extend(padded);
        }

        let msglen = RT_MSGHDR2_LEN + body.len();
        let mut msg = vec![0u8; RT_MSGHDR2_LEN];
        msg[0..2].copy_from_slice(&(msglen as u16).to_ne_bytes());
        msg[2] = 5;
        msg[3] = 0x14;
        msg[4..6].copy_from_slice(&index.to_ne_bytes());
        msg[12..16].copy_from_slice(&addrs.to_ne_bytes());
        msg.extend(body);
        msg
    }

    #[test]
    fn test_roundup() {
        assert_eq!(roundup(0), 4);
        assert_eq!(roundup(1), 4);
        assert_eq!(roundup(4), 4);
        assert_eq!(roundup(5), 8);
        assert_eq!(roundup(16), 16);
        assert_eq!(roundup(17), 20);
    }

    #[test]
    fn test_parse_default_route_without_mask() {
        let buf = rt_msg(
            4,
            RTA_DST_BIT | RTA_GATEWAY_BIT,
            &[sockaddr_in([0, 0, 0, 0]), sockaddr_in([192, 168, 1, 1])],
        );

        let routes = parse_route_dump(&buf);
        assert_eq!(
            routes,
            vec![SysctlRoute {
                destination: Ipv4Addr::UNSPECIFIED,
                netmask: None,
                index: 4,
            }]
        );
    }

    #[test]
    fn test_parse_truncated_and_empty_netmasks() {
        let mut buf = Vec::new();
        // 192.168.1.0 mask 255.255.255.0, mask sockaddr cut after 3 octets
        buf.extend(rt_msg(
            4,
            RTA_DST_BIT | RTA_GATEWAY_BIT | RTA_NETMASK_BIT,
            &[
                sockaddr_in([192, 168, 1, 0]),
                sockaddr_in([0, 0, 0, 0]),
                vec![7, 0, 0, 0, 255, 255, 255],
            ],
        ));
        // default with a zero-length mask
        buf.extend(rt_msg(
            6,
            RTA_DST_BIT | RTA_GATEWAY_BIT | RTA_NETMASK_BIT,
            &[
                sockaddr_in([0, 0, 0, 0]),
                sockaddr_in([10, 0, 0, 1]),
                vec![0],
            ],
        ));

        let routes = parse_route_dump(&buf);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(routes[0].netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(routes[1].destination, Ipv4Addr::UNSPECIFIED);
        assert_eq!(routes[1].netmask, Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(routes[1].index, 6);
    }

    #[test]
    fn test_parse_skips_non_ipv4() {
        let mut sa6 = vec![28u8, 30];
        sa6.extend_from_slice(&[0u8; 26]);
        let buf = rt_msg(4, RTA_DST_BIT, &[sa6]);

        assert!(parse_route_dump(&buf).is_empty());
    }

    #[test]
    fn test_parse_stops_on_bad_length() {
        let mut buf = rt_msg(4, RTA_DST_BIT, &[sockaddr_in([0, 0, 0, 0])]);
        buf[0..2].copy_from_slice(&4000u16.to_ne_bytes());

        assert!(parse_route_dump(&buf).is_empty());
    }

    #[test]
    fn test_entries_feed_default_detection() {
        let buf = rt_msg(
            4,
            RTA_DST_BIT | RTA_NETMASK_BIT,
            &[sockaddr_in([0, 0, 0, 0]), vec![0]],
        );
        let route = &parse_route_dump(&buf)[0];
        let entry = RouteEntry {
            destination: route.destination,
            netmask: route.netmask,
            interface: "en0".to_string(),
        };
        assert!(entry.is_default());
    }
}

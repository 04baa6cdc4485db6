//! Frames exchanged with the local tunnel device
//!
//! A tunnel device hands us whole IP packets, each prefixed by a small
//! packet-information header announcing the packet's family. The header
//! format depends on the platform:
//!
//! ```text
//! Linux (struct tun_pi):  flags (2B) | ethertype (2B, BE)
//! macOS (utun):           address family (4B, BE)   AF_INET=2, AF_INET6=30
//! ```
//!
//! Everything here is pure byte handling so both layouts are testable on
//! any host; the device implementations live in the binary.

use std::io;

use crate::protocol::EtherType;

/// Length of the packet-information header on every supported platform
pub const PI_HEADER_LEN: usize = 4;

/// Darwin address family numbers (fixed by the utun ABI)
const DARWIN_AF_INET: u32 = 2;
const DARWIN_AF_INET6: u32 = 30;

/// Family of a tunnel frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
    /// Anything else, with the raw tag from the packet-information header
    Other(u16),
}

impl Family {
    /// Wire ethertype for this family, if it can be tunneled
    pub fn ethertype(self) -> Option<EtherType> {
        match self {
            Family::Ipv4 => Some(EtherType::Ipv4),
            Family::Ipv6 => Some(EtherType::Ipv6),
            Family::Other(_) => None,
        }
    }
}

impl From<EtherType> for Family {
    fn from(ethertype: EtherType) -> Self {
        match ethertype {
            EtherType::Ipv4 => Family::Ipv4,
            EtherType::Ipv6 => Family::Ipv6,
        }
    }
}

/// One packet read from or written to the tunnel device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelFrame<'a> {
    pub family: Family,
    pub payload: &'a [u8],
}

impl<'a> TunnelFrame<'a> {
    pub fn new(family: Family, payload: &'a [u8]) -> Self {
        TunnelFrame { family, payload }
    }
}

// ============================================================================
// Packet-Information Header
// ============================================================================

/// Packet-information header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInfo {
    /// `struct tun_pi`: 16-bit flags then the ethertype
    Linux,
    /// utun: 32-bit address family
    Darwin,
}

impl PacketInfo {
    pub fn encode(self, family: Family) -> [u8; PI_HEADER_LEN] {
        match self {
            PacketInfo::Linux => {
                let proto = match family {
                    Family::Ipv4 => EtherType::IPV4,
                    Family::Ipv6 => EtherType::IPV6,
                    Family::Other(raw) => raw,
                };
                let p = proto.to_be_bytes();
                [0, 0, p[0], p[1]]
            }
            PacketInfo::Darwin => {
                let af = match family {
                    Family::Ipv4 => DARWIN_AF_INET,
                    Family::Ipv6 => DARWIN_AF_INET6,
                    Family::Other(raw) => raw as u32,
                };
                af.to_be_bytes()
            }
        }
    }

    pub fn decode(self, header: [u8; PI_HEADER_LEN]) -> Family {
        match self {
            PacketInfo::Linux => match u16::from_be_bytes([header[2], header[3]]) {
                EtherType::IPV4 => Family::Ipv4,
                EtherType::IPV6 => Family::Ipv6,
                raw => Family::Other(raw),
            },
            PacketInfo::Darwin => match u32::from_be_bytes(header) {
                DARWIN_AF_INET => Family::Ipv4,
                DARWIN_AF_INET6 => Family::Ipv6,
                raw => Family::Other(raw as u16),
            },
        }
    }

    /// Split a raw device read into header and payload
    ///
    /// Returns `None` when the read is shorter than the header.
    pub fn parse<'a>(self, raw: &'a [u8]) -> Option<TunnelFrame<'a>> {
        if raw.len() < PI_HEADER_LEN {
            return None;
        }
        let mut header = [0u8; PI_HEADER_LEN];
        header.copy_from_slice(&raw[..PI_HEADER_LEN]);

        Some(TunnelFrame {
            family: self.decode(header),
            payload: &raw[PI_HEADER_LEN..],
        })
    }
}

// ============================================================================
// Tunnel Device
// ============================================================================

/// A virtual network interface carrying whole IP packets
///
/// Implementations are expected to be non-blocking: both I/O methods
/// return `io::ErrorKind::WouldBlock` when nothing can be done right now.
pub trait TunnelDevice {
    /// Interface name as the OS knows it (e.g. `tun0`, `utun3`)
    fn name(&self) -> &str;

    /// Read one packet into `buf` and return it as a frame borrowing `buf`
    fn read_frame<'a>(&mut self, buf: &'a mut [u8]) -> io::Result<TunnelFrame<'a>>;

    /// Write one packet, prefixing the platform header
    fn write_frame(&mut self, frame: &TunnelFrame<'_>) -> io::Result<usize>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_header_layout() {
        assert_eq!(PacketInfo::Linux.encode(Family::Ipv4), [0, 0, 0x08, 0x00]);
        assert_eq!(PacketInfo::Linux.encode(Family::Ipv6), [0, 0, 0x86, 0xdd]);
        assert_eq!(PacketInfo::Linux.decode([0, 0, 0x08, 0x06]), Family::Other(0x0806));
        // Flags are ignored on decode
        assert_eq!(PacketInfo::Linux.decode([0xff, 0xff, 0x08, 0x00]), Family::Ipv4);
    }

    #[test]
    fn test_darwin_header_layout() {
        assert_eq!(PacketInfo::Darwin.encode(Family::Ipv4), [0, 0, 0, 2]);
        assert_eq!(PacketInfo::Darwin.encode(Family::Ipv6), [0, 0, 0, 30]);
        assert_eq!(PacketInfo::Darwin.decode([0, 0, 0, 30]), Family::Ipv6);
        assert_eq!(PacketInfo::Darwin.decode([0, 0, 0, 17]), Family::Other(17));
    }

    #[test]
    fn test_parse_splits_header() {
        let raw = [0u8, 0, 0x86, 0xdd, 1, 2, 3];
        let frame = PacketInfo::Linux.parse(&raw).unwrap();
        assert_eq!(frame.family, Family::Ipv6);
        assert_eq!(frame.payload, &[1, 2, 3]);

        assert!(PacketInfo::Darwin.parse(&raw[..3]).is_none());
    }

    #[test]
    fn test_family_ethertype_mapping() {
        assert_eq!(Family::from(EtherType::Ipv6), Family::Ipv6);
        assert_eq!(Family::Ipv4.ethertype(), Some(EtherType::Ipv4));
        assert_eq!(Family::Other(0x0806).ethertype(), None);
    }
}

//! Wire protocol codec
//!
//! Every UDP datagram exchanged with the peer carries exactly one message:
//!
//! ```text
//! ┌────────┬──────────┬──────────────┬──────────────────────────────────┐
//! │ Opcode │ Reserved │ Auth key     │ Payload (opcode-dependent)       │
//! │ 1B     │ 3B       │ 16B          │                                  │
//! └────────┴──────────┴──────────────┴──────────────────────────────────┘
//!
//! IpData payload:    ethertype (2B) | length (2B) | IP packet (<= 8168B)
//! Keepalive payload: local tunnel IPv4 (4B) | local tunnel IPv6 (16B)
//! ```
//!
//! All multi-byte integers are big-endian. When a cipher is configured the
//! whole message above is sealed before it leaves the host, and opened
//! before any field is inspected.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::crypto::{Cipher, CryptoError};

// ============================================================================
// Constants
// ============================================================================

/// Length of the common header (opcode + reserved + auth key)
pub const HEADER_LEN: usize = 20;

/// Length of the shared authentication key carried in every header
pub const AUTH_KEY_LEN: usize = 16;

/// Offset of the IP packet inside an IpData message
pub const IPDATA_PREFIX_LEN: usize = 24;

/// Total length of a Keepalive message
pub const KEEPALIVE_LEN: usize = HEADER_LEN + 4 + 16;

/// Largest IP packet one IpData message can carry
pub const MAX_IP_PAYLOAD: usize = 8168;

/// Largest plaintext message (8 KiB)
pub const MAX_MESSAGE_LEN: usize = IPDATA_PREFIX_LEN + MAX_IP_PAYLOAD;

/// No IPv4 packet is shorter than its 20-byte header
pub const MIN_IPV4_PACKET: usize = 20;

/// No IPv6 packet is shorter than its 40-byte header
pub const MIN_IPV6_PACKET: usize = 40;

/// Shared authentication key
pub type AuthKey = [u8; AUTH_KEY_LEN];

// ============================================================================
// Message Types
// ============================================================================

/// Message opcode (first byte of every message)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Keepalive = 0,
    IpData = 1,
    /// Defined by the protocol, never sent by this client
    Disconnect = 2,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Opcode::Keepalive),
            1 => Some(Opcode::IpData),
            2 => Some(Opcode::Disconnect),
            _ => None,
        }
    }
}

/// Protocol of the IP packet carried in an IpData message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
}

impl EtherType {
    pub const IPV4: u16 = 0x0800;
    pub const IPV6: u16 = 0x86DD;

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            Self::IPV4 => Some(EtherType::Ipv4),
            Self::IPV6 => Some(EtherType::Ipv6),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            EtherType::Ipv4 => Self::IPV4,
            EtherType::Ipv6 => Self::IPV6,
        }
    }

    /// Minimum length of a packet of this protocol (its fixed header)
    pub fn min_packet_len(self) -> usize {
        match self {
            EtherType::Ipv4 => MIN_IPV4_PACKET,
            EtherType::Ipv6 => MIN_IPV6_PACKET,
        }
    }
}

/// A decoded (or to-be-encoded) wire message
///
/// The auth key and reserved bytes are not part of the value: the codec
/// writes them on encode and checks/ignores them on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage<'a> {
    /// Liveness message advertising our tunnel addresses
    Keepalive {
        local_ipv4: Ipv4Addr,
        local_ipv6: Ipv6Addr,
    },
    /// One tunneled IP packet (`data.len()` is the length field)
    IpData { ethertype: EtherType, data: &'a [u8] },
}

impl WireMessage<'_> {
    pub fn opcode(&self) -> Opcode {
        match self {
            WireMessage::Keepalive { .. } => Opcode::Keepalive,
            WireMessage::IpData { .. } => Opcode::IpData,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Reasons a received datagram is dropped
///
/// None of these are fatal; the relay treats them all as "drop this
/// datagram" without telling the peer anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    /// Fewer than `HEADER_LEN` bytes after decryption
    TooShort(usize),
    /// Cipher could not open the datagram
    DecryptFailed,
    /// Auth key field differs from the configured key
    AuthMismatch,
    /// Opcode byte is not a known message type
    UnknownOpcode(u8),
    /// IpData ethertype is neither IPv4 nor IPv6
    UnknownProtocol(u16),
    /// IpData length is too small for its protocol or exceeds the bytes present
    Truncated { declared: usize, available: usize },
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejected::TooShort(len) => {
                write!(f, "datagram too short: {} bytes (min {})", len, HEADER_LEN)
            }
            Rejected::DecryptFailed => write!(f, "decryption failed"),
            Rejected::AuthMismatch => write!(f, "auth key mismatch"),
            Rejected::UnknownOpcode(op) => write!(f, "unknown opcode 0x{:02x}", op),
            Rejected::UnknownProtocol(proto) => write!(f, "invalid protocol 0x{:04x}", proto),
            Rejected::Truncated {
                declared,
                available,
            } => write!(
                f,
                "truncated IP packet: declared {} bytes, {} available",
                declared, available
            ),
        }
    }
}

impl std::error::Error for Rejected {}

/// Errors that can occur during message encoding
#[derive(Debug)]
pub enum EncodeError {
    /// IP packet does not fit a single message
    PayloadTooLarge(usize),
    /// Cipher failed to seal the message
    Encryption(CryptoError),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::PayloadTooLarge(len) => write!(
                f,
                "IP packet too large: {} bytes (max {})",
                len, MAX_IP_PAYLOAD
            ),
            EncodeError::Encryption(e) => write!(f, "encryption failed: {}", e),
        }
    }
}

impl std::error::Error for EncodeError {}

// ============================================================================
// Codec
// ============================================================================

/// Encodes and decodes wire messages for one shared key
pub struct Codec {
    auth_key: AuthKey,
    cipher: Option<Box<dyn Cipher>>,
}

impl Codec {
    pub fn new(auth_key: AuthKey, cipher: Option<Box<dyn Cipher>>) -> Self {
        Codec { auth_key, cipher }
    }

    /// Serialize `msg` into `out` (cleared first), sealing it if a cipher is set
    pub fn encode(&self, msg: &WireMessage<'_>, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        out.clear();

        out.push(msg.opcode() as u8);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.auth_key);

        match msg {
            WireMessage::Keepalive {
                local_ipv4,
                local_ipv6,
            } => {
                out.extend_from_slice(&local_ipv4.octets());
                out.extend_from_slice(&local_ipv6.octets());
            }
            WireMessage::IpData { ethertype, data } => {
                if data.len() > MAX_IP_PAYLOAD {
                    return Err(EncodeError::PayloadTooLarge(data.len()));
                }
                out.extend_from_slice(&ethertype.as_u16().to_be_bytes());
                out.extend_from_slice(&(data.len() as u16).to_be_bytes());
                out.extend_from_slice(data);
            }
        }

        if let Some(cipher) = &self.cipher {
            cipher.seal(out).map_err(EncodeError::Encryption)?;
        }

        Ok(())
    }

    /// Decode one received datagram
    ///
    /// Decryption happens in place, so the returned message borrows from
    /// `datagram`.
    pub fn decode<'a>(&self, datagram: &'a mut [u8]) -> Result<WireMessage<'a>, Rejected> {
        let plain: &'a [u8] = match &self.cipher {
            Some(cipher) => cipher.open(datagram).map_err(|_| Rejected::DecryptFailed)?,
            None => datagram,
        };

        parse_message(plain, &self.auth_key)
    }
}

/// Validate and parse a plaintext message
fn parse_message<'a>(buf: &'a [u8], auth_key: &AuthKey) -> Result<WireMessage<'a>, Rejected> {
    if buf.len() < HEADER_LEN {
        return Err(Rejected::TooShort(buf.len()));
    }

    // Plain byte comparison, same as the peer does
    if buf[4..HEADER_LEN] != auth_key[..] {
        return Err(Rejected::AuthMismatch);
    }

    match Opcode::from_u8(buf[0]) {
        Some(Opcode::Keepalive) => Ok(parse_keepalive(buf)),
        Some(Opcode::IpData) => parse_ipdata(buf),
        // Disconnect has no handler on this side
        Some(Opcode::Disconnect) | None => Err(Rejected::UnknownOpcode(buf[0])),
    }
}

fn parse_keepalive(buf: &[u8]) -> WireMessage<'static> {
    // Fixed-size payload, taken as-is. A header-only keepalive still counts.
    if buf.len() < KEEPALIVE_LEN {
        return WireMessage::Keepalive {
            local_ipv4: Ipv4Addr::UNSPECIFIED,
            local_ipv6: Ipv6Addr::UNSPECIFIED,
        };
    }

    let mut v4 = [0u8; 4];
    v4.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 4]);
    let mut v6 = [0u8; 16];
    v6.copy_from_slice(&buf[HEADER_LEN + 4..KEEPALIVE_LEN]);

    WireMessage::Keepalive {
        local_ipv4: Ipv4Addr::from(v4),
        local_ipv6: Ipv6Addr::from(v6),
    }
}

fn parse_ipdata(buf: &[u8]) -> Result<WireMessage<'_>, Rejected> {
    if buf.len() < IPDATA_PREFIX_LEN {
        return Err(Rejected::Truncated {
            declared: 0,
            available: 0,
        });
    }

    let proto = u16::from_be_bytes([buf[HEADER_LEN], buf[HEADER_LEN + 1]]);
    let ethertype = EtherType::from_u16(proto).ok_or(Rejected::UnknownProtocol(proto))?;

    let declared = u16::from_be_bytes([buf[HEADER_LEN + 2], buf[HEADER_LEN + 3]]) as usize;
    let available = buf.len() - IPDATA_PREFIX_LEN;

    if declared < ethertype.min_packet_len() || declared > available {
        return Err(Rejected::Truncated {
            declared,
            available,
        });
    }

    Ok(WireMessage::IpData {
        ethertype,
        data: &buf[IPDATA_PREFIX_LEN..IPDATA_PREFIX_LEN + declared],
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AuthKey = *b"0123456789abcdef";

    fn plain_codec() -> Codec {
        Codec::new(KEY, None)
    }

    fn ipdata_bytes(ethertype: u16, declared: u16, data_len: usize) -> Vec<u8> {
        let mut buf = vec![Opcode::IpData as u8, 0, 0, 0];
        buf.extend_from_slice(&KEY);
        buf.extend_from_slice(&ethertype.to_be_bytes());
        buf.extend_from_slice(&declared.to_be_bytes());
        buf.extend(std::iter::repeat(0x45).take(data_len));
        buf
    }

    #[test]
    fn test_keepalive_wire_layout() {
        let codec = plain_codec();
        let msg = WireMessage::Keepalive {
            local_ipv4: Ipv4Addr::new(10, 0, 0, 2),
            local_ipv6: Ipv6Addr::UNSPECIFIED,
        };

        let mut out = Vec::new();
        codec.encode(&msg, &mut out).unwrap();

        assert_eq!(out.len(), 40);
        assert_eq!(out[0], 0x00);
        assert_eq!(&out[1..4], &[0, 0, 0]);
        assert_eq!(&out[4..20], &KEY);
        assert_eq!(&out[20..24], &[10, 0, 0, 2]);
        assert_eq!(&out[24..40], &[0u8; 16]);
    }

    #[test]
    fn test_ipdata_wire_layout() {
        let codec = plain_codec();
        let packet = [0x45u8; 20];
        let msg = WireMessage::IpData {
            ethertype: EtherType::Ipv4,
            data: &packet,
        };

        let mut out = Vec::new();
        codec.encode(&msg, &mut out).unwrap();

        assert_eq!(out.len(), 44);
        assert_eq!(out[0], 0x01);
        assert_eq!(&out[20..22], &[0x08, 0x00]);
        assert_eq!(&out[22..24], &[0x00, 20]);
        assert_eq!(&out[24..], &packet);
    }

    #[test]
    fn test_ipdata_round_trip_sizes() {
        let codec = plain_codec();
        let mut out = Vec::new();

        for len in [40usize, 41, 1280, 1500, MAX_IP_PAYLOAD] {
            let packet: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let msg = WireMessage::IpData {
                ethertype: EtherType::Ipv6,
                data: &packet,
            };
            codec.encode(&msg, &mut out).unwrap();

            let decoded = codec.decode(&mut out).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_keepalive_round_trip() {
        let codec = plain_codec();
        let msg = WireMessage::Keepalive {
            local_ipv4: Ipv4Addr::new(172, 16, 0, 9),
            local_ipv6: "fd00::9".parse().unwrap(),
        };

        let mut out = Vec::new();
        codec.encode(&msg, &mut out).unwrap();
        assert_eq!(codec.decode(&mut out).unwrap(), msg);
    }

    #[test]
    fn test_encode_rejects_oversized_packet() {
        let codec = plain_codec();
        let packet = vec![0u8; MAX_IP_PAYLOAD + 1];
        let msg = WireMessage::IpData {
            ethertype: EtherType::Ipv4,
            data: &packet,
        };

        let mut out = Vec::new();
        assert!(matches!(
            codec.encode(&msg, &mut out),
            Err(EncodeError::PayloadTooLarge(n)) if n == MAX_IP_PAYLOAD + 1
        ));
    }

    #[test]
    fn test_decode_too_short() {
        let codec = plain_codec();
        let mut buf = [0u8; 10];
        assert_eq!(codec.decode(&mut buf), Err(Rejected::TooShort(10)));

        // Content does not matter below 20 bytes
        for len in 0..HEADER_LEN {
            let mut buf = vec![0xffu8; len];
            assert!(matches!(codec.decode(&mut buf), Err(Rejected::TooShort(_))));
        }
    }

    #[test]
    fn test_decode_auth_mismatch_each_byte() {
        let codec = plain_codec();
        let good = ipdata_bytes(EtherType::IPV4, 20, 20);

        for i in 4..HEADER_LEN {
            let mut bad = good.clone();
            bad[i] ^= 0x01;
            assert_eq!(codec.decode(&mut bad), Err(Rejected::AuthMismatch));
        }
    }

    #[test]
    fn test_decode_reserved_ignored() {
        let codec = plain_codec();
        let mut buf = ipdata_bytes(EtherType::IPV4, 20, 20);
        buf[1] = 0xaa;
        buf[3] = 0x55;
        assert!(codec.decode(&mut buf).is_ok());
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let codec = plain_codec();
        let mut buf = ipdata_bytes(EtherType::IPV4, 20, 20);
        buf[0] = 0x07;
        assert_eq!(codec.decode(&mut buf), Err(Rejected::UnknownOpcode(0x07)));
    }

    #[test]
    fn test_decode_unknown_protocol() {
        let codec = plain_codec();
        let mut buf = ipdata_bytes(0x0806, 28, 28);
        assert_eq!(codec.decode(&mut buf), Err(Rejected::UnknownProtocol(0x0806)));
    }

    #[test]
    fn test_decode_declared_below_minimum() {
        let codec = plain_codec();

        let mut v4 = ipdata_bytes(EtherType::IPV4, 10, 40);
        assert!(matches!(
            codec.decode(&mut v4),
            Err(Rejected::Truncated { declared: 10, .. })
        ));

        let mut v6 = ipdata_bytes(EtherType::IPV6, 30, 60);
        assert!(matches!(
            codec.decode(&mut v6),
            Err(Rejected::Truncated { declared: 30, .. })
        ));
    }

    #[test]
    fn test_decode_declared_exceeds_available() {
        let codec = plain_codec();
        let mut buf = ipdata_bytes(EtherType::IPV4, 100, 60);
        assert_eq!(
            codec.decode(&mut buf),
            Err(Rejected::Truncated {
                declared: 100,
                available: 60
            })
        );
    }

    #[test]
    fn test_decode_ipdata_without_prefix() {
        let codec = plain_codec();
        let mut buf = ipdata_bytes(EtherType::IPV4, 20, 0);
        buf.truncate(22);
        assert!(matches!(codec.decode(&mut buf), Err(Rejected::Truncated { .. })));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let codec = plain_codec();
        let mut buf = ipdata_bytes(EtherType::IPV4, 20, 32);

        match codec.decode(&mut buf).unwrap() {
            WireMessage::IpData { ethertype, data } => {
                assert_eq!(ethertype, EtherType::Ipv4);
                assert_eq!(data.len(), 20);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_header_only_keepalive() {
        let codec = plain_codec();
        let mut buf = vec![Opcode::Keepalive as u8, 0, 0, 0];
        buf.extend_from_slice(&KEY);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            WireMessage::Keepalive {
                local_ipv4: Ipv4Addr::UNSPECIFIED,
                local_ipv6: Ipv6Addr::UNSPECIFIED,
            }
        );
    }

    #[test]
    fn test_disconnect_opcode_rejected() {
        let codec = plain_codec();
        let mut buf = vec![0x02, 0, 0, 0];
        buf.extend_from_slice(&KEY);

        assert_eq!(codec.decode(&mut buf), Err(Rejected::UnknownOpcode(2)));
    }

    #[test]
    fn test_rejected_display() {
        assert_eq!(
            Rejected::UnknownProtocol(0x0806).to_string(),
            "invalid protocol 0x0806"
        );
        assert_eq!(Rejected::AuthMismatch.to_string(), "auth key mismatch");
    }
}

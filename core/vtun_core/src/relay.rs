//! Packet relay between the tunnel device and the peer
//!
//! Translates in both directions without doing any I/O itself:
//! - network → tunnel: decode a datagram into a keepalive or a tunnel frame
//! - tunnel → network: wrap a tunnel frame into an IpData message
//!
//! Outbound messages are encoded into one reusable buffer owned by the
//! relay, so the returned slices stay valid until the next encode.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::frame::{Family, TunnelFrame};
use crate::protocol::{Codec, EncodeError, Rejected, WireMessage, MAX_IP_PAYLOAD, MAX_MESSAGE_LEN};

/// What a received datagram turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Peer liveness signal
    Keepalive,
    /// IP packet to write to the tunnel device
    Packet(TunnelFrame<'a>),
}

pub struct Relay {
    codec: Codec,
    local_ipv4: Ipv4Addr,
    local_ipv6: Ipv6Addr,
    out: Vec<u8>,
}

impl Relay {
    pub fn new(codec: Codec, local_ipv4: Ipv4Addr, local_ipv6: Ipv6Addr) -> Self {
        Relay {
            codec,
            local_ipv4,
            local_ipv6,
            out: Vec::with_capacity(MAX_MESSAGE_LEN + 64),
        }
    }

    /// Decode a datagram received from the peer
    pub fn network_to_tunnel<'a>(&self, datagram: &'a mut [u8]) -> Result<Inbound<'a>, Rejected> {
        match self.codec.decode(datagram)? {
            WireMessage::Keepalive { .. } => Ok(Inbound::Keepalive),
            WireMessage::IpData { ethertype, data } => {
                Ok(Inbound::Packet(TunnelFrame::new(Family::from(ethertype), data)))
            }
        }
    }

    /// Encode a frame read from the tunnel device
    ///
    /// Returns `None` if the frame cannot be tunneled: unknown family,
    /// payload shorter than the family's header, or larger than one message.
    pub fn tunnel_to_network(&mut self, frame: &TunnelFrame<'_>) -> Option<&[u8]> {
        let ethertype = match frame.family.ethertype() {
            Some(ethertype) => ethertype,
            None => {
                log::debug!("Dropping tunnel frame of unknown family {:?}", frame.family);
                return None;
            }
        };

        let len = frame.payload.len();
        if len < ethertype.min_packet_len() || len > MAX_IP_PAYLOAD {
            log::debug!("Dropping {:?} tunnel frame of {} bytes", frame.family, len);
            return None;
        }

        let msg = WireMessage::IpData {
            ethertype,
            data: frame.payload,
        };
        match self.codec.encode(&msg, &mut self.out) {
            Ok(()) => Some(&self.out),
            Err(e) => {
                log::debug!("Failed to encode tunnel frame: {}", e);
                None
            }
        }
    }

    /// Encode a keepalive advertising our tunnel addresses
    pub fn make_keepalive(&mut self) -> Result<&[u8], EncodeError> {
        let msg = WireMessage::Keepalive {
            local_ipv4: self.local_ipv4,
            local_ipv6: self.local_ipv6,
        };
        self.codec.encode(&msg, &mut self.out)?;
        Ok(&self.out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AeadCipher, CipherKind, SharedKey};
    use crate::protocol::{EtherType, KEEPALIVE_LEN};
    use etherparse::PacketBuilder;

    fn relay_with_key(password: &str, cipher: Option<CipherKind>) -> Relay {
        let shared = SharedKey::from_password(Some(password));
        let cipher = cipher.map(|kind| {
            Box::new(AeadCipher::new(kind, &shared).unwrap()) as Box<dyn crate::crypto::Cipher>
        });
        Relay::new(
            Codec::new(shared.auth_key(), cipher),
            Ipv4Addr::new(10, 7, 0, 2),
            Ipv6Addr::UNSPECIFIED,
        )
    }

    fn udp_ipv4_packet(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ipv4([10, 7, 0, 2], [10, 7, 0, 1], 64).udp(5000, 6000);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    fn udp_ipv6_packet(payload: &[u8]) -> Vec<u8> {
        let src = [0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let dst = [0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let builder = PacketBuilder::ipv6(src, dst, 64).udp(5000, 6000);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }

    #[test]
    fn test_outbound_ipv4_wire_bytes() {
        let mut relay = relay_with_key("pw", None);
        let packet = udp_ipv4_packet(b"hello");

        let out = relay
            .tunnel_to_network(&TunnelFrame::new(Family::Ipv4, &packet))
            .unwrap()
            .to_vec();

        assert_eq!(out.len(), 24 + packet.len());
        assert_eq!(out[0], 0x01);
        assert_eq!(&out[20..22], &EtherType::IPV4.to_be_bytes());
        assert_eq!(&out[22..24], &(packet.len() as u16).to_be_bytes());
        assert_eq!(&out[24..], &packet[..]);
    }

    #[test]
    fn test_outbound_drops_invalid_frames() {
        let mut relay = relay_with_key("pw", None);

        // Non-IP family
        let arp = [0u8; 28];
        assert!(relay
            .tunnel_to_network(&TunnelFrame::new(Family::Other(0x0806), &arp))
            .is_none());

        // Shorter than an IPv4 header
        let short = [0x45u8; 19];
        assert!(relay
            .tunnel_to_network(&TunnelFrame::new(Family::Ipv4, &short))
            .is_none());

        // Shorter than an IPv6 header
        let short6 = [0x60u8; 39];
        assert!(relay
            .tunnel_to_network(&TunnelFrame::new(Family::Ipv6, &short6))
            .is_none());

        // Larger than one message
        let huge = vec![0x45u8; MAX_IP_PAYLOAD + 1];
        assert!(relay
            .tunnel_to_network(&TunnelFrame::new(Family::Ipv4, &huge))
            .is_none());
    }

    #[test]
    fn test_round_trip_through_two_relays() {
        let mut sender = relay_with_key("shared", None);
        let receiver = relay_with_key("shared", None);
        let packet = udp_ipv6_packet(&[9u8; 300]);

        let mut wire = sender
            .tunnel_to_network(&TunnelFrame::new(Family::Ipv6, &packet))
            .unwrap()
            .to_vec();

        match receiver.network_to_tunnel(&mut wire).unwrap() {
            Inbound::Packet(frame) => {
                assert_eq!(frame.family, Family::Ipv6);
                assert_eq!(frame.payload, &packet[..]);
            }
            other => panic!("unexpected inbound: {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_round_trip() {
        let mut sender = relay_with_key("shared", Some(CipherKind::Aes256Gcm));
        let receiver = relay_with_key("shared", Some(CipherKind::Aes256Gcm));
        let packet = udp_ipv4_packet(b"secret payload");

        let mut wire = sender
            .tunnel_to_network(&TunnelFrame::new(Family::Ipv4, &packet))
            .unwrap()
            .to_vec();
        assert_eq!(wire.len(), 24 + packet.len() + 16 + 12);

        match receiver.network_to_tunnel(&mut wire).unwrap() {
            Inbound::Packet(frame) => assert_eq!(frame.payload, &packet[..]),
            other => panic!("unexpected inbound: {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_wrong_key_rejected() {
        let mut sender = relay_with_key("one", Some(CipherKind::ChaCha20Poly1305));
        let receiver = relay_with_key("two", Some(CipherKind::ChaCha20Poly1305));

        let mut wire = sender.make_keepalive().unwrap().to_vec();
        assert_eq!(
            receiver.network_to_tunnel(&mut wire),
            Err(Rejected::DecryptFailed)
        );
    }

    #[test]
    fn test_plain_wrong_key_rejected() {
        let mut sender = relay_with_key("one", None);
        let receiver = relay_with_key("two", None);

        let mut wire = sender.make_keepalive().unwrap().to_vec();
        assert_eq!(
            receiver.network_to_tunnel(&mut wire),
            Err(Rejected::AuthMismatch)
        );
    }

    #[test]
    fn test_keepalive_advertises_local_addresses() {
        let mut relay = relay_with_key("pw", None);
        let wire = relay.make_keepalive().unwrap();

        assert_eq!(wire.len(), KEEPALIVE_LEN);
        assert_eq!(wire[0], 0x00);
        assert_eq!(&wire[20..24], &[10, 7, 0, 2]);
        assert_eq!(&wire[24..40], &[0u8; 16]);
    }

    #[test]
    fn test_inbound_keepalive_accepted_disconnect_rejected() {
        let mut sender = relay_with_key("pw", None);
        let receiver = relay_with_key("pw", None);

        let mut keepalive = sender.make_keepalive().unwrap().to_vec();
        let inbound = receiver.network_to_tunnel(&mut keepalive).unwrap();
        assert_eq!(inbound, Inbound::Keepalive);

        let mut disconnect = keepalive.clone();
        disconnect.truncate(20);
        disconnect[0] = 0x02;
        assert_eq!(
            receiver.network_to_tunnel(&mut disconnect),
            Err(Rejected::UnknownOpcode(2))
        );
    }
}

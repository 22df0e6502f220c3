//! Flow identity.
//!
//! A [`FlowKey`] is the canonical 5-tuple extracted from an IPv4 packet. The
//! sender of the packet becomes the source endpoint; [`FlowKey::reverse`]
//! yields the identity of the opposite direction of the same conversation.

use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::ethernet::Ethernet;
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::tcp::{Tcp, TCP_PROTOCOL};
use crate::protocols::packet::udp::{Udp, UDP_PROTOCOL};
use crate::protocols::packet::Packet;

use std::fmt;
use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use serde::Serialize;

/// Flow 5-tuple.
///
/// Ports are zero when the encapsulated protocol is neither TCP nor UDP.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FlowKey {
    /// Source IPv4 address.
    pub saddr: Ipv4Addr,
    /// Destination IPv4 address.
    pub daddr: Ipv4Addr,
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// Encapsulated protocol identifier.
    pub proto: u8,
}

impl FlowKey {
    /// Extracts the 5-tuple from an Ethernet frame carrying IPv4.
    ///
    /// Fails when the frame is too short for the headers it claims to carry
    /// or does not carry IPv4 at all.
    pub fn from_mbuf(mbuf: &Mbuf) -> Result<Self> {
        if let Ok(eth) = mbuf.parse_to::<Ethernet>() {
            if let Ok(ipv4) = eth.parse_to::<Ipv4>() {
                match ipv4.protocol() {
                    TCP_PROTOCOL => {
                        let tcp = ipv4.parse_to::<Tcp>()?;
                        Ok(FlowKey {
                            saddr: ipv4.src_addr(),
                            daddr: ipv4.dst_addr(),
                            sport: tcp.src_port(),
                            dport: tcp.dst_port(),
                            proto: TCP_PROTOCOL,
                        })
                    }
                    UDP_PROTOCOL => {
                        let udp = ipv4.parse_to::<Udp>()?;
                        Ok(FlowKey {
                            saddr: ipv4.src_addr(),
                            daddr: ipv4.dst_addr(),
                            sport: udp.src_port(),
                            dport: udp.dst_port(),
                            proto: UDP_PROTOCOL,
                        })
                    }
                    _ => Ok(FlowKey {
                        saddr: ipv4.src_addr(),
                        daddr: ipv4.dst_addr(),
                        sport: 0,
                        dport: 0,
                        proto: ipv4.protocol(),
                    }),
                }
            } else {
                bail!("Not IPv4");
            }
        } else {
            bail!("Not Ethernet");
        }
    }

    /// Returns the identity of the opposite direction: addresses and ports
    /// swapped, protocol unchanged.
    pub fn reverse(&self) -> FlowKey {
        FlowKey {
            saddr: self.daddr,
            daddr: self.saddr,
            sport: self.dport,
            dport: self.sport,
            proto: self.proto,
        }
    }

    /// Canonical 13-byte serialization used for hashing.
    fn bytes(&self) -> [u8; 13] {
        let mut buf = [0u8; 13];
        buf[0..4].copy_from_slice(&self.saddr.octets());
        buf[4..8].copy_from_slice(&self.daddr.octets());
        buf[8..10].copy_from_slice(&self.sport.to_be_bytes());
        buf[10..12].copy_from_slice(&self.dport.to_be_bytes());
        buf[12] = self.proto;
        buf
    }

    /// Deterministic signature over the 13 key bytes.
    #[inline]
    pub(crate) fn signature(&self) -> u32 {
        crc32c(&self.bytes())
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> ", self.saddr, self.sport)?;
        write!(f, "{}:{}", self.daddr, self.dport)?;
        write!(f, " protocol {}", self.proto)?;
        Ok(())
    }
}

// CRC-32C (Castagnoli), reflected form, table built at compile time.
const CRC32C_POLY: u32 = 0x82f6_3b78;

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

fn crc32c(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for b in bytes {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ *b as u32) & 0xff) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{tcp_pkt, udp_pkt};
    use crate::protocols::packet::tcp::SYN;

    #[test]
    fn reverse_symmetry() {
        let key = FlowKey {
            saddr: Ipv4Addr::new(10, 0, 0, 1),
            daddr: Ipv4Addr::new(10, 0, 0, 2),
            sport: 1000,
            dport: 80,
            proto: TCP_PROTOCOL,
        };
        let rev = key.reverse();
        assert_eq!(rev.saddr, key.daddr);
        assert_eq!(rev.sport, key.dport);
        assert_eq!(rev.proto, key.proto);
        assert_eq!(rev.reverse(), key);
    }

    #[test]
    fn signature_is_stable_and_direction_sensitive() {
        let key = FlowKey {
            saddr: Ipv4Addr::new(192, 168, 1, 1),
            daddr: Ipv4Addr::new(192, 168, 1, 2),
            sport: 4242,
            dport: 443,
            proto: TCP_PROTOCOL,
        };
        assert_eq!(key.signature(), key.signature());
        assert_ne!(key.signature(), key.reverse().signature());
    }

    #[test]
    fn crc32c_known_vector() {
        // "123456789" -> 0xe3069283 for CRC-32C.
        assert_eq!(crc32c(b"123456789"), 0xe306_9283);
    }

    #[test]
    fn parse_tcp_and_udp() {
        let pkt = tcp_pkt("10.0.0.1", 1000, "10.0.0.2", 80, SYN);
        let key = FlowKey::from_mbuf(&pkt).unwrap();
        assert_eq!(key.saddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(key.sport, 1000);
        assert_eq!(key.dport, 80);
        assert_eq!(key.proto, TCP_PROTOCOL);

        let pkt = udp_pkt("10.0.0.3", 53, "10.0.0.4", 5353);
        let key = FlowKey::from_mbuf(&pkt).unwrap();
        assert_eq!(key.proto, UDP_PROTOCOL);
        assert_eq!(key.sport, 53);
    }

    #[test]
    fn parse_rejects_short_frame() {
        let mbuf = Mbuf::from_bytes(&[0u8; 20]).unwrap();
        assert!(FlowKey::from_mbuf(&mbuf).is_err());
    }

    #[test]
    fn parse_other_protocol_zeroes_ports() {
        let pkt = crate::testutils::ipv4_pkt("10.0.0.1", "10.0.0.2", 47, &[0u8; 8]);
        let key = FlowKey::from_mbuf(&pkt).unwrap();
        assert_eq!(key.proto, 47);
        assert_eq!(key.sport, 0);
        assert_eq!(key.dport, 0);
    }
}

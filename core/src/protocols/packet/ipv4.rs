//! IPv4 header view.

use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};
use crate::utils::types::*;

use std::net::Ipv4Addr;

use anyhow::{bail, Result};

/// IPv4 EtherType.
const ETHERTYPE_IPV4: u16 = 0x0800;

/// An IPv4 packet.
///
/// Only the fields flow identity needs are exposed; options are accounted
/// for in the payload offset but not parsed.
#[derive(Debug)]
pub struct Ipv4<'a> {
    /// Fixed header.
    header: Ipv4Header,
    /// Offset to `header` from the start of `mbuf`.
    offset: usize,
    /// Packet buffer.
    mbuf: &'a Mbuf,
}

impl Ipv4<'_> {
    /// Returns the encapsulated protocol identifier.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.header.protocol
    }

    /// Returns the source IPv4 address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.src_addr))
    }

    /// Returns the destination IPv4 address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.dst_addr))
    }
}

impl<'a> Packet<'a> for Ipv4<'a> {
    fn mbuf(&self) -> &Mbuf {
        self.mbuf
    }

    fn payload_offset(&self) -> usize {
        self.offset + self.header.length()
    }

    fn next_proto(&self) -> Option<u16> {
        Some(self.protocol() as u16)
    }

    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        let offset = outer.payload_offset();
        if let Ok(header) = outer.mbuf().get_data(offset) {
            match outer.next_proto() {
                Some(ETHERTYPE_IPV4) => Ok(Ipv4 {
                    header: unsafe { *header },
                    offset,
                    mbuf: outer.mbuf(),
                }),
                _ => bail!(PacketParseError::UnexpectedProtocol),
            }
        } else {
            bail!(PacketParseError::Truncated)
        }
    }
}

/// Fixed portion of an IPv4 header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Ipv4Header {
    version_ihl: u8,
    dscp_ecn: u8,
    total_length: u16be,
    identification: u16be,
    flags_to_fragment_offset: u16be,
    time_to_live: u8,
    protocol: u8,
    header_checksum: u16be,
    src_addr: u32be,
    dst_addr: u32be,
}

impl PacketHeader for Ipv4Header {
    /// Header length in bytes, computed from the IHL field so options are
    /// skipped.
    fn length(&self) -> usize {
        ((self.version_ihl & 0x0f) << 2).into()
    }
}

//! UDP header view.

use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};
use crate::utils::types::*;

use anyhow::{bail, Result};

/// UDP assigned protocol number.
pub const UDP_PROTOCOL: u8 = 17;

/// A UDP packet.
///
/// Exposes the port pair for flow identity.
#[derive(Debug)]
pub struct Udp<'a> {
    /// Fixed header.
    header: UdpHeader,
    /// Offset to `header` from the start of `mbuf`.
    offset: usize,
    /// Packet buffer.
    mbuf: &'a Mbuf,
}

impl Udp<'_> {
    /// Returns the sending port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        self.header.src_port.into()
    }

    /// Returns the receiving port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.header.dst_port.into()
    }
}

impl<'a> Packet<'a> for Udp<'a> {
    fn mbuf(&self) -> &Mbuf {
        self.mbuf
    }

    fn payload_offset(&self) -> usize {
        self.offset + self.header.length()
    }

    fn next_proto(&self) -> Option<u16> {
        None
    }

    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        let offset = outer.payload_offset();
        if let Ok(header) = outer.mbuf().get_data(offset) {
            match outer.next_proto() {
                Some(proto) if proto == UDP_PROTOCOL as u16 => Ok(Udp {
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

/// Fixed portion of a UDP header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct UdpHeader {
    src_port: u16be,
    dst_port: u16be,
    length: u16be,
    checksum: u16be,
}

impl PacketHeader for UdpHeader {
    fn length(&self) -> usize {
        UdpHeader::size_of()
    }
}

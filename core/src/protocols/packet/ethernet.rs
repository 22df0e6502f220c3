//! Ethernet frame view.

use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};
use crate::utils::types::*;

use anyhow::{bail, Result};
use pnet::datalink::MacAddr;

const VLAN_802_1Q: u16 = 0x8100;
const VLAN_802_1AD: u16 = 0x88a8;

const TAG_SIZE: usize = 4;
const HDR_SIZE: usize = 14;
const HDR_SIZE_802_1Q: usize = HDR_SIZE + TAG_SIZE;
const HDR_SIZE_802_1AD: usize = HDR_SIZE_802_1Q + TAG_SIZE;

/// An Ethernet frame.
///
/// On networks that support virtual LANs, the frame may include a VLAN tag
/// after the source MAC address; the view skips it when locating the
/// payload. Double-tagged frames (QinQ) are not yet supported.
#[derive(Debug)]
pub struct Ethernet<'a> {
    /// Fixed header.
    header: EthernetHeader,
    /// Offset to `header` from the start of `mbuf`.
    offset: usize,
    /// Packet buffer.
    mbuf: &'a Mbuf,
}

impl Ethernet<'_> {
    /// Returns the EtherType of the frame, ignoring any VLAN tags.
    #[inline]
    pub fn ether_type(&self) -> u16 {
        self.header.ether_type.into()
    }

    /// Returns the EtherType following any VLAN tags.
    fn payload_ether_type(&self) -> Option<u16> {
        match self.ether_type() {
            VLAN_802_1Q => self
                .mbuf
                .get_data_slice(HDR_SIZE + 2, 2)
                .ok()
                .map(|b| u16::from_be_bytes([b[0], b[1]])),
            VLAN_802_1AD => self
                .mbuf
                .get_data_slice(HDR_SIZE_802_1Q + 2, 2)
                .ok()
                .map(|b| u16::from_be_bytes([b[0], b[1]])),
            ether_type => Some(ether_type),
        }
    }
}

impl<'a> Packet<'a> for Ethernet<'a> {
    fn mbuf(&self) -> &Mbuf {
        self.mbuf
    }

    fn payload_offset(&self) -> usize {
        self.offset + self.header.length()
    }

    fn next_proto(&self) -> Option<u16> {
        self.payload_ether_type()
    }

    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        if let Ok(header) = outer.mbuf().get_data(outer.payload_offset()) {
            Ok(Ethernet {
                header: unsafe { *header },
                offset: outer.payload_offset(),
                mbuf: outer.mbuf(),
            })
        } else {
            bail!(PacketParseError::Truncated)
        }
    }
}

/// Fixed portion of an Ethernet header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct EthernetHeader {
    dst: MacAddr,
    src: MacAddr,
    ether_type: u16be,
}

impl PacketHeader for EthernetHeader {
    fn length(&self) -> usize {
        match self.ether_type.into() {
            VLAN_802_1Q => HDR_SIZE_802_1Q,
            VLAN_802_1AD => HDR_SIZE_802_1AD,
            _ => HDR_SIZE,
        }
    }
}

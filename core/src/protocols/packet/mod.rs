//! Header views used by the classifier.
//!
//! The core reads exactly the layers flow identity needs — Ethernet, IPv4,
//! and the TCP/UDP port words — so the parse chain is deliberately small.
//! Each view borrows the underlying [`Mbuf`], knows where its payload
//! starts, and names the protocol that payload carries; parsing a view
//! checks that identifier against the enclosing layer. The borrow-a-buffer
//! layout takes after capsule and pnet, but this is not a general protocol
//! stack.

pub mod ethernet;
pub mod ipv4;
pub mod tcp;
pub mod udp;
use crate::memory::mbuf::Mbuf;

use anyhow::Result;
use thiserror::Error;

/// A typed view over one header layer of a frame.
pub trait Packet<'a> {
    /// The underlying packet buffer.
    fn mbuf(&self) -> &Mbuf;

    /// Offset from the start of the buffer to this layer's payload.
    fn payload_offset(&self) -> usize;

    /// Identifier of the protocol carried in the payload: an EtherType for
    /// the link layer, an IP protocol number for the network layer, `None`
    /// where the chain ends.
    fn next_proto(&self) -> Option<u16>;

    /// Parses this view's payload as a `T`.
    fn parse_to<T: Packet<'a>>(&'a self) -> Result<T>
    where
        Self: Sized,
    {
        T::parse_from(self)
    }

    /// Parses a view from the payload of the enclosing layer.
    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized;
}

/// A fixed-layout wire header that knows its own length.
pub trait PacketHeader {
    /// Bytes from the start of the header to its payload, including any
    /// options or tags.
    fn length(&self) -> usize;

    /// Size of the fixed portion of the header.
    fn size_of() -> usize
    where
        Self: Sized,
    {
        std::mem::size_of::<Self>()
    }
}

#[derive(Error, Debug)]
pub(crate) enum PacketParseError {
    #[error("Enclosing header carries a different protocol")]
    UnexpectedProtocol,

    #[error("Frame truncated")]
    Truncated,
}

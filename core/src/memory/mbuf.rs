//! Packet buffer manipulation.
//!
//! ## Remarks
//! Packet I/O is an external collaborator: upstream drivers hand the core
//! fully-received frames, so an `Mbuf` here owns its bytes on the heap rather
//! than wrapping a driver descriptor. The accessor surface is adapted from
//! [capsule::Mbuf](https://docs.rs/capsule/0.1.5/capsule/struct.Mbuf.html).
//!
//! Every `Mbuf` carries a writable 64-bit aggregate annotation that upstream
//! and downstream stages may use as scratch; the core itself never reads it.

use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};

use std::fmt;
use std::slice;

use anyhow::{bail, Result};
use thiserror::Error;

/// A packet buffer.
///
/// Represents a single Ethernet frame.
#[derive(Clone)]
pub struct Mbuf {
    data: Box<[u8]>,
    anno: u64,
}

impl Mbuf {
    /// Creates a new Mbuf from a byte slice.
    pub fn from_bytes(data: &[u8]) -> Result<Mbuf> {
        if data.is_empty() {
            bail!(MbufError::Empty);
        }
        Ok(Mbuf {
            data: data.into(),
            anno: 0,
        })
    }

    /// Returns the length of the data in the Mbuf.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Returns the contents of the Mbuf as a byte slice.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the aggregate annotation.
    pub fn anno(&self) -> u64 {
        self.anno
    }

    /// Sets the aggregate annotation.
    pub fn set_anno(&mut self, anno: u64) {
        self.anno = anno;
    }

    /// Returns a byte slice of data with length count at offset.
    ///
    /// Errors if `offset` is greater than or equal to the buffer length or `count` exceeds the size
    /// of the data stored at `offset`.
    pub fn get_data_slice(&self, offset: usize, count: usize) -> Result<&[u8]> {
        if offset < self.data_len() {
            if offset + count <= self.data_len() {
                let ptr = self.get_data_address(offset);
                unsafe { Ok(slice::from_raw_parts(ptr, count) as &[u8]) }
            } else {
                bail!(MbufError::ReadPastBuffer)
            }
        } else {
            bail!(MbufError::BadOffset)
        }
    }

    /// Reads the data at `offset` as `T` and returns it as a raw pointer. Errors if `offset` is
    /// greater than or equal to the buffer length or the size of `T` exceeds the size of the data
    /// stored at `offset`.
    pub(crate) fn get_data<T: PacketHeader>(&self, offset: usize) -> Result<*const T> {
        if offset < self.data_len() {
            if offset + T::size_of() <= self.data_len() {
                Ok(self.get_data_address(offset) as *const T)
            } else {
                bail!(MbufError::ReadPastBuffer)
            }
        } else {
            bail!(MbufError::BadOffset)
        }
    }

    /// Returns the raw address of the data at `offset`. `offset` must be within the buffer.
    fn get_data_address(&self, offset: usize) -> *const u8 {
        unsafe { self.data.as_ptr().add(offset) }
    }
}

/// The root of the parse chain: the raw frame itself.
impl<'a> Packet<'a> for Mbuf {
    fn mbuf(&self) -> &Mbuf {
        self
    }

    fn payload_offset(&self) -> usize {
        0
    }

    fn next_proto(&self) -> Option<u16> {
        None
    }

    fn parse_from(_outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        // parse_from should never be called for Mbuf.
        bail!(PacketParseError::UnexpectedProtocol)
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("data_len", &self.data_len())
            .field("anno", &self.anno)
            .finish()
    }
}

#[derive(Error, Debug)]
pub(crate) enum MbufError {
    #[error("Empty frame")]
    Empty,

    #[error("Data read requested at bad offset")]
    BadOffset,

    #[error("Data read requested beyond buffer")]
    ReadPastBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bounds() {
        let mbuf = Mbuf::from_bytes(&[1, 2, 3, 4]).unwrap();
        assert_eq!(mbuf.data_len(), 4);
        assert_eq!(mbuf.get_data_slice(1, 3).unwrap(), &[2, 3, 4]);
        assert!(mbuf.get_data_slice(1, 4).is_err());
        assert!(mbuf.get_data_slice(4, 1).is_err());
        assert!(Mbuf::from_bytes(&[]).is_err());
    }

    #[test]
    fn annotation_roundtrip() {
        let mut mbuf = Mbuf::from_bytes(&[0; 64]).unwrap();
        assert_eq!(mbuf.anno(), 0);
        mbuf.set_anno(0xdead_beef);
        assert_eq!(mbuf.anno(), 0xdead_beef);
    }
}

//! Flow control block arena.
//!
//! A flat, pre-allocated array of per-flow records. The manager-owned fields
//! (timestamps, wheel links, stored key) live in the typed [`Fcb`] header;
//! the opaque user region configured with `reserve` is a separate flat slab
//! addressed with a fixed stride. Neither allocation grows after
//! construction.

use crate::flowtrack::key::FlowKey;

use std::net::Ipv4Addr;

/// Dense integer identifying an FCB slot. Doubles as the flow table position
/// of the flow's key.
pub type FlowId = u32;

/// User-region stride granularity, also the record alignment.
const CACHE_LINE: usize = 64;

/// Per-flow record header.
///
/// The index of an `Fcb` is stable for the lifetime of its flow; the wheel
/// and the quarantine list borrow slots by id through `next_idx`.
#[derive(Debug, Clone)]
#[repr(align(64))]
pub struct Fcb {
    /// Timestamp of the last packet emitted for this flow, in milliseconds
    /// since the owning manager's epoch.
    pub(crate) last_seen: u64,
    /// Intrusive link: next FCB in the current timer bucket or quarantine
    /// list.
    pub(crate) next_idx: Option<FlowId>,
    /// This slot's flow id.
    pub(crate) flow_id: FlowId,
    /// Stored key, kept for table deletion at expiry.
    pub(crate) key: FlowKey,
    /// Table position recorded at deletion for the deferred key release.
    pub(crate) table_pos: u32,
    /// Set while the FCB sits in a wheel bucket.
    pub(crate) scheduled: bool,
    /// Set while the flow owns this slot.
    pub(crate) active: bool,
}

impl Fcb {
    /// Timestamp of the last packet emitted for this flow (ms).
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// The flow's 5-tuple.
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// The flow's dense id.
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }
}

impl Default for Fcb {
    fn default() -> Self {
        Fcb {
            last_seen: 0,
            next_idx: None,
            flow_id: 0,
            key: FlowKey {
                saddr: Ipv4Addr::UNSPECIFIED,
                daddr: Ipv4Addr::UNSPECIFIED,
                sport: 0,
                dport: 0,
                proto: 0,
            },
            table_pos: 0,
            scheduled: false,
            active: false,
        }
    }
}

/// Pre-allocated arena of `capacity` FCBs plus their user regions.
pub struct FcbArena {
    entries: Box<[Fcb]>,
    user: Box<[u8]>,
    stride: usize,
}

impl FcbArena {
    /// Allocates and zeroes the arena. `reserve` is rounded up to a multiple
    /// of the cache line so user regions never share lines.
    pub(crate) fn new(capacity: u32, reserve: usize) -> Self {
        let stride = reserve.div_ceil(CACHE_LINE) * CACHE_LINE;
        FcbArena {
            entries: vec![Fcb::default(); capacity as usize].into_boxed_slice(),
            user: vec![0u8; stride * capacity as usize].into_boxed_slice(),
            stride,
        }
    }

    /// Number of FCB slots.
    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Bytes of user region per slot.
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub(crate) fn slot(&self, id: FlowId) -> &Fcb {
        &self.entries[id as usize]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, id: FlowId) -> &mut Fcb {
        &mut self.entries[id as usize]
    }

    /// Zeroes the user region of one slot, for reuse by a new flow.
    pub(crate) fn reset_user(&mut self, id: FlowId) {
        let start = id as usize * self.stride;
        self.user[start..start + self.stride].fill(0);
    }

    /// Borrows a slot and its user region together for a downstream stage.
    #[inline]
    pub(crate) fn context(&mut self, id: FlowId) -> FlowContext<'_> {
        let start = id as usize * self.stride;
        FlowContext {
            flow_id: id,
            fcb: &mut self.entries[id as usize],
            user: &mut self.user[start..start + self.stride],
        }
    }

    /// Resets every slot and user byte to the freshly-constructed state.
    pub(crate) fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = Fcb::default();
        }
        self.user.fill(0);
    }
}

/// The FCB selected by the manager for the batch currently being handed
/// downstream. Stages read and mutate per-flow state here instead of
/// re-consulting the flow table.
pub struct FlowContext<'a> {
    /// Dense flow id.
    pub flow_id: FlowId,
    /// The flow's record header.
    pub fcb: &'a mut Fcb,
    /// The flow's opaque user region.
    pub user: &'a mut [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_rounds_to_cache_line() {
        let arena = FcbArena::new(4, 1);
        assert_eq!(arena.stride(), 64);
        let arena = FcbArena::new(4, 0);
        assert_eq!(arena.stride(), 0);
        let arena = FcbArena::new(4, 65);
        assert_eq!(arena.stride(), 128);
    }

    #[test]
    fn context_addresses_disjoint_regions() {
        let mut arena = FcbArena::new(2, 8);
        {
            let ctx = arena.context(0);
            ctx.user[0] = 0xaa;
            ctx.fcb.last_seen = 7;
        }
        {
            let ctx = arena.context(1);
            assert_eq!(ctx.user[0], 0);
        }
        assert_eq!(arena.slot(0).last_seen, 7);
        arena.reset_user(0);
        assert_eq!(arena.context(0).user[0], 0);
    }
}

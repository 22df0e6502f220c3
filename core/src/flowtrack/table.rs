//! Concurrent 5-tuple flow table.
//!
//! A bucketized cuckoo hash mapping [`FlowKey`] to a dense position in
//! `[0, capacity)`. Positions are handed out from an internal free stack, so
//! the position returned by [`FlowTable::add`] doubles as the flow id and the
//! FCB index of the flow. Capacity is fixed at construction; the table never
//! rehashes.
//!
//! Readers are lock-free: every bucket slot is a single atomic word packing
//! the key signature and its position, and key memory for a position is only
//! rewritten once the position has been through the free stack. Writers
//! serialize on an internal mutex, uncontended in the single-writer
//! configuration. With `lf` enabled, [`FlowTable::delete_key`] removes the
//! mapping but keeps the position (and its key memory) allocated until
//! [`FlowTable::free_key_at`], giving concurrent readers a grace period.

use crate::flowtrack::arena::FlowId;
use crate::flowtrack::key::FlowKey;

use std::cell::UnsafeCell;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Keys per cuckoo bucket.
pub(crate) const SLOTS_PER_BUCKET: usize = 4;

/// Bound on the breadth-first kick-path search frontier.
const BFS_MAX_NODES: usize = 512;

/// Position marker for a vacant slot.
const EMPTY_IDX: u32 = u32::MAX;
const EMPTY_SLOT: u64 = EMPTY_IDX as u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    /// No slot and no kick chain fits, or all positions are taken.
    #[error("flow table is full")]
    Full,

    /// The key (or position) has no current mapping.
    #[error("key not present")]
    Missing,
}

/// One bucket slot: `(signature << 32) | position`, or [`EMPTY_SLOT`].
struct Slot(AtomicU64);

impl Slot {
    #[inline]
    fn load(&self) -> (u32, u32) {
        let v = self.0.load(Ordering::Acquire);
        ((v >> 32) as u32, v as u32)
    }

    #[inline]
    fn store(&self, sig: u32, idx: u32) {
        self.0
            .store(((sig as u64) << 32) | idx as u64, Ordering::Release);
    }

    #[inline]
    fn clear(&self) {
        self.0.store(EMPTY_SLOT, Ordering::Release);
    }
}

#[repr(align(64))]
struct Bucket {
    slots: [Slot; SLOTS_PER_BUCKET],
}

impl Bucket {
    fn empty() -> Self {
        Bucket {
            slots: [
                Slot(AtomicU64::new(EMPTY_SLOT)),
                Slot(AtomicU64::new(EMPTY_SLOT)),
                Slot(AtomicU64::new(EMPTY_SLOT)),
                Slot(AtomicU64::new(EMPTY_SLOT)),
            ],
        }
    }
}

/// Dense key storage cell. Written only by the writer path for positions
/// that no reader can observe (fresh from the free stack, or past the
/// deferred-release grace period).
struct KeyCell(UnsafeCell<FlowKey>);

// SAFETY: concurrent access is governed by the table protocol above; a cell
// is never written while its position is visible in any bucket slot.
unsafe impl Send for KeyCell {}
unsafe impl Sync for KeyCell {}

struct WriterState {
    /// Free positions, LIFO.
    free: Vec<u32>,
}

/// BFS node for the kick-path search.
#[derive(Clone, Copy)]
struct PathNode {
    bucket: u32,
    parent: i32,
    parent_slot: u8,
}

/// Concurrent mapping from [`FlowKey`] to dense flow position.
pub struct FlowTable {
    buckets: Box<[Bucket]>,
    bucket_mask: u32,
    keys: Box<[KeyCell]>,
    writer: Mutex<WriterState>,
    count: AtomicU32,
    lf: bool,
}

impl FlowTable {
    /// Creates a table for `capacity` flows (rounded up to a power of two)
    /// with immediate key release on delete.
    pub fn new(capacity: u32) -> Self {
        Self::with_options(capacity, false)
    }

    /// Creates a table for `capacity` flows. With `lf`, deletes defer key
    /// release until [`FlowTable::free_key_at`].
    pub fn with_options(capacity: u32, lf: bool) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        // Twice as many slots as positions keeps the cuckoo load factor at
        // one half.
        let nb_buckets = (capacity as usize * 2 / SLOTS_PER_BUCKET)
            .next_power_of_two()
            .max(2);
        let zero_key = FlowKey {
            saddr: Ipv4Addr::UNSPECIFIED,
            daddr: Ipv4Addr::UNSPECIFIED,
            sport: 0,
            dport: 0,
            proto: 0,
        };
        FlowTable {
            buckets: (0..nb_buckets).map(|_| Bucket::empty()).collect(),
            bucket_mask: (nb_buckets - 1) as u32,
            keys: (0..capacity)
                .map(|_| KeyCell(UnsafeCell::new(zero_key)))
                .collect(),
            writer: Mutex::new(WriterState {
                free: (0..capacity).rev().collect(),
            }),
            count: AtomicU32::new(0),
            lf,
        }
    }

    /// Maximum number of flows the table can hold.
    pub fn capacity(&self) -> u32 {
        self.keys.len() as u32
    }

    /// Approximate number of live mappings.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Looks up `key`, multi-reader safe.
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowId> {
        let sig = key.signature();
        let b1 = sig & self.bucket_mask;
        if let Some(idx) = self.scan_bucket(b1, sig, key) {
            return Some(idx);
        }
        let b2 = alt_bucket(b1, sig, self.bucket_mask);
        self.scan_bucket(b2, sig, key)
    }

    /// Inserts `key` and returns its position. Adding a key that is already
    /// present returns the existing position.
    pub fn add(&self, key: &FlowKey) -> Result<FlowId, TableError> {
        let sig = key.signature();
        let b1 = sig & self.bucket_mask;
        let b2 = alt_bucket(b1, sig, self.bucket_mask);
        let mut writer = self.writer_lock();

        if let Some(idx) = self.scan_bucket(b1, sig, key) {
            return Ok(idx);
        }
        if let Some(idx) = self.scan_bucket(b2, sig, key) {
            return Ok(idx);
        }

        let idx = writer.free.pop().ok_or(TableError::Full)?;
        // SAFETY: idx came off the free stack, so no bucket slot names it and
        // no reader is comparing against this cell.
        unsafe { *self.keys[idx as usize].0.get() = *key };

        if self.place(b1, sig, idx) || self.place(b2, sig, idx) || self.kick_insert(b1, b2, sig, idx)
        {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(idx)
        } else {
            writer.free.push(idx);
            Err(TableError::Full)
        }
    }

    /// Removes the mapping for `key` and returns the vacated position.
    ///
    /// Without `lf` the position returns to the free stack immediately; with
    /// `lf` the caller must hand it back via [`FlowTable::free_key_at`] once
    /// no reader can be observing it.
    pub fn delete_key(&self, key: &FlowKey) -> Result<u32, TableError> {
        let sig = key.signature();
        let b1 = sig & self.bucket_mask;
        let b2 = alt_bucket(b1, sig, self.bucket_mask);
        let mut writer = self.writer_lock();

        for b in [b1, b2] {
            for slot in &self.buckets[b as usize].slots {
                let (s_sig, idx) = slot.load();
                if idx != EMPTY_IDX && s_sig == sig && self.key_at(idx) == *key {
                    slot.clear();
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    if !self.lf {
                        writer.free.push(idx);
                    }
                    return Ok(idx);
                }
            }
        }
        Err(TableError::Missing)
    }

    /// Removes the mapping stored at `pos`.
    pub fn delete_at(&self, pos: u32) -> Result<u32, TableError> {
        if pos >= self.capacity() {
            return Err(TableError::Missing);
        }
        let key = self.key_at(pos);
        let sig = key.signature();
        let b1 = sig & self.bucket_mask;
        let b2 = alt_bucket(b1, sig, self.bucket_mask);
        let mut writer = self.writer_lock();

        for b in [b1, b2] {
            for slot in &self.buckets[b as usize].slots {
                let (_, idx) = slot.load();
                if idx == pos {
                    slot.clear();
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    if !self.lf {
                        writer.free.push(idx);
                    }
                    return Ok(idx);
                }
            }
        }
        Err(TableError::Missing)
    }

    /// Returns a position vacated by a deferred delete to the free stack.
    pub fn free_key_at(&self, pos: u32) {
        let mut writer = self.writer_lock();
        debug_assert!(!writer.free.contains(&pos));
        writer.free.push(pos);
    }

    fn writer_lock(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    fn key_at(&self, idx: u32) -> FlowKey {
        // SAFETY: idx is visible in a bucket slot (or held by the caller
        // under the deferred-release protocol), so its cell is not being
        // written.
        unsafe { *self.keys[idx as usize].0.get() }
    }

    #[inline]
    fn scan_bucket(&self, b: u32, sig: u32, key: &FlowKey) -> Option<u32> {
        for slot in &self.buckets[b as usize].slots {
            let (s_sig, idx) = slot.load();
            if idx != EMPTY_IDX && s_sig == sig && self.key_at(idx) == *key {
                return Some(idx);
            }
        }
        None
    }

    /// Places `(sig, idx)` into a vacant slot of bucket `b`, if any.
    fn place(&self, b: u32, sig: u32, idx: u32) -> bool {
        for slot in &self.buckets[b as usize].slots {
            let (_, cur) = slot.load();
            if cur == EMPTY_IDX {
                slot.store(sig, idx);
                return true;
            }
        }
        false
    }

    /// Breadth-first search for a chain of displacements ending in a vacant
    /// slot, then shifts entries backwards along the chain. Every move
    /// writes the destination before the source is overwritten, so a kicked
    /// key is always visible in at least one of its buckets.
    fn kick_insert(&self, b1: u32, b2: u32, sig: u32, idx: u32) -> bool {
        let mut queue: Vec<PathNode> = Vec::with_capacity(BFS_MAX_NODES);
        queue.push(PathNode {
            bucket: b1,
            parent: -1,
            parent_slot: 0,
        });
        queue.push(PathNode {
            bucket: b2,
            parent: -1,
            parent_slot: 0,
        });

        let mut head = 0;
        while head < queue.len() {
            let node = queue[head];
            if let Some(empty) = self.vacant_slot(node.bucket) {
                // A path that touches the same slot twice would displace an
                // entry it already moved; skip such leaves.
                if path_is_simple(&queue, head) {
                    let (hole_bucket, hole_slot) = self.shift_path(&queue, head, empty);
                    self.buckets[hole_bucket as usize].slots[hole_slot].store(sig, idx);
                    return true;
                }
            }
            if queue.len() >= BFS_MAX_NODES {
                head += 1;
                continue;
            }
            for s in 0..SLOTS_PER_BUCKET {
                let (v_sig, _) = self.buckets[node.bucket as usize].slots[s].load();
                queue.push(PathNode {
                    bucket: alt_bucket(node.bucket, v_sig, self.bucket_mask),
                    parent: head as i32,
                    parent_slot: s as u8,
                });
                if queue.len() >= BFS_MAX_NODES {
                    break;
                }
            }
            head += 1;
        }
        false
    }

    fn vacant_slot(&self, b: u32) -> Option<usize> {
        for (s, slot) in self.buckets[b as usize].slots.iter().enumerate() {
            let (_, cur) = slot.load();
            if cur == EMPTY_IDX {
                return Some(s);
            }
        }
        None
    }

    /// Moves each victim on the path into the hole below it, leaf first, and
    /// returns the hole that surfaces in the root bucket.
    fn shift_path(&self, queue: &[PathNode], leaf: usize, empty: usize) -> (u32, usize) {
        let mut hole_bucket = queue[leaf].bucket;
        let mut hole_slot = empty;
        let mut node = leaf;
        while queue[node].parent >= 0 {
            let parent = queue[node].parent as usize;
            let src_bucket = queue[parent].bucket;
            let src_slot = queue[node].parent_slot as usize;
            let (v_sig, v_idx) = self.buckets[src_bucket as usize].slots[src_slot].load();
            self.buckets[hole_bucket as usize].slots[hole_slot].store(v_sig, v_idx);
            self.buckets[src_bucket as usize].slots[src_slot].clear();
            hole_bucket = src_bucket;
            hole_slot = src_slot;
            node = parent;
        }
        (hole_bucket, hole_slot)
    }
}

/// Returns `true` if no (bucket, slot) pair repeats on the path from `leaf`
/// to its root. Kick paths are short, so the quadratic scan is fine.
fn path_is_simple(queue: &[PathNode], leaf: usize) -> bool {
    let mut edges: Vec<(u32, u8)> = Vec::new();
    let mut node = leaf;
    while queue[node].parent >= 0 {
        let parent = queue[node].parent as usize;
        let edge = (queue[parent].bucket, queue[node].parent_slot);
        if edges.contains(&edge) {
            return false;
        }
        edges.push(edge);
        node = parent;
    }
    true
}

/// The alternate bucket of a key, derived from its signature. Involutive:
/// applying it twice returns the original bucket.
#[inline]
fn alt_bucket(cur: u32, sig: u32, mask: u32) -> u32 {
    (cur ^ ((sig >> 16).wrapping_add(1).wrapping_mul(0x5bd1_e995))) & mask
}

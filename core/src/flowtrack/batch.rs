//! Packet batches and run-length batch building.
//!
//! Consecutive packets of the same flow are compacted into a single run so
//! downstream stages pay the per-flow cost once per run instead of once per
//! packet.

use crate::flowtrack::arena::FlowId;
use crate::flowtrack::key::FlowKey;
use crate::memory::mbuf::Mbuf;

/// An ordered sequence of packets handed between pipeline stages.
#[derive(Debug, Default)]
pub struct PacketBatch {
    pkts: Vec<Mbuf>,
}

impl PacketBatch {
    pub fn new() -> Self {
        PacketBatch { pkts: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PacketBatch {
            pkts: Vec::with_capacity(capacity),
        }
    }

    /// Appends a packet at the end of the batch.
    pub fn push(&mut self, mbuf: Mbuf) {
        self.pkts.push(mbuf);
    }

    /// Number of packets in the batch.
    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Mbuf> {
        self.pkts.iter()
    }
}

impl From<Vec<Mbuf>> for PacketBatch {
    fn from(pkts: Vec<Mbuf>) -> Self {
        PacketBatch { pkts }
    }
}

impl IntoIterator for PacketBatch {
    type Item = Mbuf;
    type IntoIter = std::vec::IntoIter<Mbuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.pkts.into_iter()
    }
}

impl FromIterator<Mbuf> for PacketBatch {
    fn from_iter<T: IntoIterator<Item = Mbuf>>(iter: T) -> Self {
        PacketBatch {
            pkts: iter.into_iter().collect(),
        }
    }
}

/// Accumulates the current same-flow run during classification.
#[derive(Debug, Default)]
pub(crate) struct BatchBuilder {
    /// Packets of the run being built.
    pending: Vec<Mbuf>,
    /// Flow id of the run being built (and of the last emitted run).
    pub(crate) last: Option<FlowId>,
    /// 5-tuple shortcut for the run being built.
    pub(crate) last_key: Option<FlowKey>,
}

impl BatchBuilder {
    pub(crate) fn new() -> Self {
        BatchBuilder::default()
    }

    /// Attaches a packet to the current run.
    #[inline]
    pub(crate) fn append(&mut self, mbuf: Mbuf) {
        self.pending.push(mbuf);
    }

    /// Starts a new run after the previous one has been finished.
    #[inline]
    pub(crate) fn start(&mut self, id: FlowId, key: Option<FlowKey>, mbuf: Mbuf) {
        self.last = Some(id);
        self.last_key = key;
        self.pending.push(mbuf);
    }

    /// Returns and clears the accumulated run, if any, together with its
    /// flow id.
    #[inline]
    pub(crate) fn finish(&mut self) -> Option<(FlowId, PacketBatch)> {
        if self.pending.is_empty() {
            return None;
        }
        let id = self.last?;
        Some((id, std::mem::take(&mut self.pending).into()))
    }
}

//! Test-only helpers: byte-exact frame builders and a recording sink.

use crate::flowtrack::batch::PacketBatch;
use crate::flowtrack::{DropReason, FlowContext, FlowId, FlowSink};
use crate::memory::mbuf::Mbuf;

use std::net::Ipv4Addr;

/// Builds an Ethernet frame carrying an IPv4 packet with the given protocol
/// and L4 bytes.
pub(crate) fn ipv4_pkt(src: &str, dst: &str, proto: u8, l4: &[u8]) -> Mbuf {
    let saddr: Ipv4Addr = src.parse().unwrap();
    let daddr: Ipv4Addr = dst.parse().unwrap();
    let mut bytes = Vec::with_capacity(14 + 20 + l4.len());
    // Ethernet: zero MACs, EtherType IPv4.
    bytes.extend_from_slice(&[0u8; 12]);
    bytes.extend_from_slice(&0x0800u16.to_be_bytes());
    // IPv4 header, no options.
    bytes.push(0x45);
    bytes.push(0);
    bytes.extend_from_slice(&((20 + l4.len()) as u16).to_be_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.push(64);
    bytes.push(proto);
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&saddr.octets());
    bytes.extend_from_slice(&daddr.octets());
    bytes.extend_from_slice(l4);
    Mbuf::from_bytes(&bytes).unwrap()
}

/// Builds a TCP packet with `flags` and `payload`.
pub(crate) fn tcp_data_pkt(
    src: &str,
    sport: u16,
    dst: &str,
    dport: u16,
    flags: u8,
    payload: &[u8],
) -> Mbuf {
    let mut l4 = Vec::with_capacity(20 + payload.len());
    l4.extend_from_slice(&sport.to_be_bytes());
    l4.extend_from_slice(&dport.to_be_bytes());
    l4.extend_from_slice(&0u32.to_be_bytes());
    l4.extend_from_slice(&0u32.to_be_bytes());
    l4.push(0x50);
    l4.push(flags);
    l4.extend_from_slice(&1024u16.to_be_bytes());
    l4.extend_from_slice(&[0, 0]);
    l4.extend_from_slice(&[0, 0]);
    l4.extend_from_slice(payload);
    ipv4_pkt(src, dst, 6, &l4)
}

/// Builds an empty TCP packet with `flags`.
pub(crate) fn tcp_pkt(src: &str, sport: u16, dst: &str, dport: u16, flags: u8) -> Mbuf {
    tcp_data_pkt(src, sport, dst, dport, flags, &[])
}

/// Builds an empty UDP packet.
pub(crate) fn udp_pkt(src: &str, sport: u16, dst: &str, dport: u16) -> Mbuf {
    let mut l4 = Vec::with_capacity(8);
    l4.extend_from_slice(&sport.to_be_bytes());
    l4.extend_from_slice(&dport.to_be_bytes());
    l4.extend_from_slice(&8u16.to_be_bytes());
    l4.extend_from_slice(&[0, 0]);
    ipv4_pkt(src, dst, 17, &l4)
}

/// A sink that records everything the manager hands it.
#[derive(Default)]
pub(crate) struct CollectSink {
    /// Emitted runs: flow id and the raw bytes of each packet.
    pub(crate) runs: Vec<(FlowId, Vec<Vec<u8>>)>,
    /// `last_seen` of the run's FCB at delivery time.
    pub(crate) stamps: Vec<(FlowId, u64)>,
    pub(crate) new_flows: Vec<FlowId>,
    pub(crate) released: Vec<FlowId>,
    pub(crate) drops: Vec<DropReason>,
}

impl FlowSink for CollectSink {
    fn new_flow(&mut self, ctx: &mut FlowContext<'_>, _first: &Mbuf) {
        self.new_flows.push(ctx.flow_id);
    }

    fn deliver(&mut self, ctx: &mut FlowContext<'_>, batch: PacketBatch) {
        self.stamps.push((ctx.flow_id, ctx.fcb.last_seen()));
        self.runs.push((
            ctx.flow_id,
            batch.iter().map(|pkt| pkt.data().to_vec()).collect(),
        ));
    }

    fn flow_released(&mut self, ctx: &mut FlowContext<'_>) {
        self.released.push(ctx.flow_id);
    }

    fn packet_dropped(&mut self, _pkt: Mbuf, reason: DropReason) {
        self.drops.push(reason);
    }
}

//! Bidirectional TCP connection tracking.
//!
//! Two [`TcpStateIn`] instances sit downstream of the two flow managers
//! handling the opposite directions of the same traffic. The pair shares
//! per-connection reference-counted state ([`TcpCommon`]) so SYN/FIN/RST
//! handshakes release both directions early instead of waiting for the idle
//! timeout.
//!
//! The side that sees a connection first allocates the common state with two
//! references (its own FCB and a slot in its handoff map, keyed by the
//! reversed tuple). The peer direction's first packet claims the map slot by
//! looking up its own forward tuple; from then on each direction holds one
//! reference and the last one to drop it frees the connection.

use crate::config::TcpTrackerConfig;
use crate::flowtrack::batch::PacketBatch;
use crate::flowtrack::key::FlowKey;
use crate::flowtrack::{DropReason, FlowContext, FlowSink};
use crate::memory::mbuf::Mbuf;
use crate::protocols::packet::ethernet::Ethernet;
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::tcp::{Tcp, TCP_PROTOCOL};
use crate::protocols::packet::Packet;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use hashlink::LinkedHashMap;

/// Default idle timeout for tracked TCP flows, in seconds. Shorter than the
/// generic flow timeout because the tracker closes most connections itself.
pub const TCP_STATE_FLOW_TIMEOUT: u32 = 16;

/// State shared between the two directions of one connection.
pub(crate) struct TcpCommon {
    /// Logical reference count: holders are the two directions' entries and,
    /// until adoption, the inserter's handoff map slot.
    use_count: AtomicU32,
    /// Has one side sent its FIN?
    closing: AtomicBool,
}

/// Per-direction, per-flow tracker state.
#[derive(Default, Clone)]
struct TcpEntry {
    common: Option<Arc<TcpCommon>>,
    /// A FIN was already seen from this side; later FINs are retransmits.
    fin_seen: bool,
    /// The flow was refused at creation by the non-SYN policy.
    rejected: bool,
}

type HandoffMap = Mutex<LinkedHashMap<FlowKey, Arc<TcpCommon>>>;

/// Tracker failure counters.
#[derive(Debug, Default, Clone)]
pub struct TcpTrackerStats {
    /// Packets dropped because their connection has no live common state.
    pub dropped_stale: u64,
    /// Flows rejected because they did not start with a SYN.
    pub protocol_violations: u64,
}

/// Read-only handler ids exposed by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpHandler {
    /// Entries waiting in this direction's handoff map.
    MapSize,
    /// Established connections of the pair.
    Established,
}

/// One direction of the bidirectional TCP state tracker.
///
/// Plugs into its direction's [`FlowManager`](crate::flowtrack::FlowManager)
/// as the [`FlowSink`]; batches it lets through are forwarded to the
/// downstream sink `D`.
pub struct TcpStateIn<D: FlowSink> {
    entries: Vec<TcpEntry>,
    /// Handoff slots this direction published for its peer.
    map: Arc<HandoffMap>,
    /// The peer direction's handoff map.
    peer_map: Arc<HandoffMap>,
    /// Established connections, shared by the pair.
    established: Arc<AtomicU32>,
    accept_nonsyn: bool,
    verbose: u8,
    stats: TcpTrackerStats,
    downstream: D,
}

impl<D: FlowSink> TcpStateIn<D> {
    /// Creates the two paired directions. `capacity` must cover the FCB
    /// arenas of the two managers the trackers are plugged into; it is
    /// rounded up to a power of two the same way.
    pub fn pair<D2: FlowSink>(
        config: &TcpTrackerConfig,
        capacity: u32,
        fwd_downstream: D,
        rev_downstream: D2,
    ) -> (TcpStateIn<D>, TcpStateIn<D2>) {
        let capacity = capacity.next_power_of_two() as usize;
        let fwd_map: Arc<HandoffMap> = Arc::new(Mutex::new(LinkedHashMap::new()));
        let rev_map: Arc<HandoffMap> = Arc::new(Mutex::new(LinkedHashMap::new()));
        let established = Arc::new(AtomicU32::new(0));
        (
            TcpStateIn {
                entries: vec![TcpEntry::default(); capacity],
                map: Arc::clone(&fwd_map),
                peer_map: Arc::clone(&rev_map),
                established: Arc::clone(&established),
                accept_nonsyn: config.accept_nonsyn,
                verbose: config.verbose,
                stats: TcpTrackerStats::default(),
                downstream: fwd_downstream,
            },
            TcpStateIn {
                entries: vec![TcpEntry::default(); capacity],
                map: rev_map,
                peer_map: fwd_map,
                established,
                accept_nonsyn: config.accept_nonsyn,
                verbose: config.verbose,
                stats: TcpTrackerStats::default(),
                downstream: rev_downstream,
            },
        )
    }

    /// Tracker failure counters.
    pub fn stats(&self) -> &TcpTrackerStats {
        &self.stats
    }

    /// Typed read handler dispatch.
    pub fn read_handler(&self, handler: TcpHandler) -> u64 {
        match handler {
            TcpHandler::MapSize => lock(&self.map).len() as u64,
            TcpHandler::Established => self.established.load(Ordering::Relaxed) as u64,
        }
    }

    /// Access to the downstream sink.
    pub fn downstream(&self) -> &D {
        &self.downstream
    }

    /// Wires up the connection state for a flow that just received its first
    /// packet.
    fn handle_new_flow(&mut self, id: usize, key: &FlowKey, first: &Mbuf) {
        self.entries[id] = TcpEntry::default();

        // Adopt the common the peer direction published for us, if any. The
        // map removal is the synchronization point with the peer's expiry.
        let adopted = match lock(&self.peer_map).remove(key) {
            Some(common) => {
                if common.use_count.load(Ordering::Acquire) == 1 {
                    // The inserting side already expired; the reference the
                    // map transferred to us is the last one.
                    common.use_count.fetch_sub(1, Ordering::AcqRel);
                    None
                } else {
                    Some(common)
                }
            }
            None => None,
        };
        if let Some(common) = adopted {
            if self.verbose > 0 {
                log::debug!("Adopted connection state for flow {}", id);
            }
            self.entries[id].common = Some(common);
            self.established.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let flags = tcp_flags(first).unwrap_or_default();
        if !self.accept_nonsyn && !flags.syn {
            self.stats.protocol_violations += 1;
            self.entries[id].rejected = true;
            if self.verbose > 0 {
                log::debug!("Flow {} does not start with a SYN", id);
            }
            return;
        }

        let common = Arc::new(TcpCommon {
            // One reference for this entry, one for the handoff map slot.
            use_count: AtomicU32::new(2),
            closing: AtomicBool::new(false),
        });
        self.entries[id].common = Some(Arc::clone(&common));
        lock(&self.map).insert(key.reverse(), common);
        if self.verbose > 1 {
            log::debug!("New connection on flow {}, map has {} entries", id, lock(&self.map).len());
        }
    }

    /// Drops this direction's reference on the connection. The decrement
    /// that reaches zero is the unique releaser.
    fn release(&mut self, id: usize) {
        if let Some(common) = self.entries[id].common.take() {
            if common.use_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.established.fetch_sub(1, Ordering::AcqRel);
                if self.verbose > 1 {
                    log::debug!("Released shared connection state of flow {}", id);
                }
            }
        }
    }
}

impl<D: FlowSink> FlowSink for TcpStateIn<D> {
    fn new_flow(&mut self, ctx: &mut FlowContext<'_>, first: &Mbuf) {
        if ctx.fcb.key().proto == TCP_PROTOCOL {
            let key = *ctx.fcb.key();
            self.handle_new_flow(ctx.flow_id as usize, &key, first);
        }
        self.downstream.new_flow(ctx, first);
    }

    fn deliver(&mut self, ctx: &mut FlowContext<'_>, batch: PacketBatch) {
        if ctx.fcb.key().proto != TCP_PROTOCOL {
            self.downstream.deliver(ctx, batch);
            return;
        }
        let id = ctx.flow_id as usize;
        let mut out = PacketBatch::with_capacity(batch.len());
        for pkt in batch {
            let common = match self.entries[id].common.clone() {
                Some(common) => common,
                None => {
                    // Seen flow without a common: refused at creation, or
                    // connection reuse, or a late retransmit from long ago.
                    let reason = if self.entries[id].rejected {
                        DropReason::NonSyn
                    } else {
                        self.stats.dropped_stale += 1;
                        DropReason::StaleConnection
                    };
                    self.downstream.packet_dropped(pkt, reason);
                    continue;
                }
            };
            let flags = tcp_flags(&pkt).unwrap_or_default();
            if flags.rst {
                // This side will never see another useful packet.
                self.release(id);
                out.push(pkt);
            } else if flags.fin {
                if !self.entries[id].fin_seen {
                    self.entries[id].fin_seen = true;
                    if common.closing.load(Ordering::Acquire) && flags.ack {
                        // The answering FIN; the peer already started the
                        // close.
                        self.release(id);
                    } else {
                        // First FIN of the connection; this side now waits
                        // for the final ACK.
                        common.closing.store(true, Ordering::Release);
                    }
                }
                out.push(pkt);
            } else if common.closing.load(Ordering::Acquire)
                && flags.ack
                && self.entries[id].fin_seen
            {
                self.release(id);
                out.push(pkt);
            } else {
                out.push(pkt);
            }
        }
        if !out.is_empty() {
            self.downstream.deliver(ctx, out);
        }
    }

    fn flow_released(&mut self, ctx: &mut FlowContext<'_>) {
        self.release(ctx.flow_id as usize);
        self.downstream.flow_released(ctx);
    }

    fn packet_dropped(&mut self, pkt: Mbuf, reason: DropReason) {
        self.downstream.packet_dropped(pkt, reason);
    }
}

fn lock(map: &HandoffMap) -> MutexGuard<'_, LinkedHashMap<FlowKey, Arc<TcpCommon>>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// The flag bits the close state machine follows.
#[derive(Debug, Default, Clone, Copy)]
struct TcpFlags {
    syn: bool,
    ack: bool,
    rst: bool,
    fin: bool,
}

/// Re-reads the TCP flags of a classified packet.
fn tcp_flags(mbuf: &Mbuf) -> Result<TcpFlags> {
    let eth = mbuf.parse_to::<Ethernet>()?;
    let ipv4 = eth.parse_to::<Ipv4>()?;
    let tcp = ipv4.parse_to::<Tcp>()?;
    Ok(TcpFlags {
        syn: tcp.syn(),
        ack: tcp.ack(),
        rst: tcp.rst(),
        fin: tcp.fin(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::flowtrack::{FlowId, FlowManager};
    use crate::protocols::packet::tcp::{ACK, FIN, RST, SYN};
    use crate::testutils::{tcp_pkt, udp_pkt, CollectSink};

    const A: &str = "10.0.0.1";
    const B: &str = "10.0.0.2";

    type Tracker = TcpStateIn<CollectSink>;

    struct Pair {
        fwd_mgr: FlowManager,
        rev_mgr: FlowManager,
        fwd: Tracker,
        rev: Tracker,
    }

    fn setup(accept_nonsyn: bool) -> Pair {
        let tcfg = TcpTrackerConfig {
            accept_nonsyn,
            timeout: TCP_STATE_FLOW_TIMEOUT,
            verbose: 0,
        };
        let fcfg = FlowConfig {
            capacity: 8,
            verbose: 0,
            ..tcfg.flow_config(8)
        };
        let (fwd, rev) =
            TcpStateIn::pair(&tcfg, 8, CollectSink::default(), CollectSink::default());
        Pair {
            fwd_mgr: FlowManager::new(&fcfg).unwrap(),
            rev_mgr: FlowManager::new(&fcfg).unwrap(),
            fwd,
            rev,
        }
    }

    fn established(pair: &Pair) -> u64 {
        pair.fwd.read_handler(TcpHandler::Established)
    }

    fn push_fwd(pair: &mut Pair, now: u64, flags: u8) {
        let pkt = tcp_pkt(A, 1000, B, 80, flags);
        pair.fwd_mgr
            .push_batch(vec![pkt].into(), now, &mut pair.fwd);
    }

    fn push_rev(pair: &mut Pair, now: u64, flags: u8) {
        let pkt = tcp_pkt(B, 80, A, 1000, flags);
        pair.rev_mgr
            .push_batch(vec![pkt].into(), now, &mut pair.rev);
    }

    fn handshake(pair: &mut Pair) {
        push_fwd(pair, 0, SYN);
        push_rev(pair, 1, SYN | ACK);
        push_fwd(pair, 2, ACK);
    }

    #[test]
    fn handshake_establishes_shared_state() {
        let mut pair = setup(true);
        push_fwd(&mut pair, 0, SYN);
        assert_eq!(established(&pair), 0);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 1);

        push_rev(&mut pair, 1, SYN | ACK);
        assert_eq!(established(&pair), 1);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 0);
        assert_eq!(pair.rev.read_handler(TcpHandler::MapSize), 0);

        // Both directions forwarded their packet downstream.
        assert_eq!(pair.fwd.downstream().runs.len(), 1);
        assert_eq!(pair.rev.downstream().runs.len(), 1);
    }

    #[test]
    fn fin_handshake_releases_both_directions() {
        let mut pair = setup(true);
        handshake(&mut pair);
        assert_eq!(established(&pair), 1);

        push_fwd(&mut pair, 10, FIN | ACK);
        assert_eq!(established(&pair), 1);
        push_rev(&mut pair, 11, FIN | ACK);
        assert_eq!(established(&pair), 1);
        push_fwd(&mut pair, 12, ACK);
        assert_eq!(established(&pair), 0);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 0);
        assert_eq!(pair.rev.read_handler(TcpHandler::MapSize), 0);

        // The FCBs stay until the idle wheel reclaims them.
        assert_eq!(pair.fwd_mgr.flow_count(), 1);
        assert_eq!(pair.rev_mgr.flow_count(), 1);
        for t in 1..=(TCP_STATE_FLOW_TIMEOUT as u64 + 1) {
            let now = 12 + t * 1000;
            pair.fwd_mgr.recycle(now, &mut pair.fwd);
            pair.rev_mgr.recycle(now, &mut pair.rev);
        }
        assert_eq!(pair.fwd_mgr.flow_count(), 0);
        assert_eq!(pair.rev_mgr.flow_count(), 0);
    }

    #[test]
    fn fin_retransmit_is_suppressed() {
        let mut pair = setup(true);
        handshake(&mut pair);

        push_fwd(&mut pair, 10, FIN | ACK);
        // Retransmit of the same FIN must not count as the answering FIN.
        push_fwd(&mut pair, 11, FIN | ACK);
        assert_eq!(established(&pair), 1);

        push_rev(&mut pair, 12, FIN | ACK);
        push_fwd(&mut pair, 13, ACK);
        assert_eq!(established(&pair), 0);

        // The retransmitted FIN was still forwarded downstream.
        let forwarded: usize = pair
            .fwd
            .downstream()
            .runs
            .iter()
            .map(|(_, pkts)| pkts.len())
            .sum();
        assert_eq!(forwarded, 5);
    }

    #[test]
    fn simultaneous_rst_releases_exactly_once() {
        let mut pair = setup(true);
        handshake(&mut pair);
        assert_eq!(established(&pair), 1);

        push_fwd(&mut pair, 10, RST);
        assert_eq!(established(&pair), 1);
        push_rev(&mut pair, 10, RST);
        assert_eq!(established(&pair), 0);

        // Anything after the close is a stale packet and is dropped.
        push_fwd(&mut pair, 11, ACK);
        assert_eq!(pair.fwd.stats().dropped_stale, 1);
        assert_eq!(
            pair.fwd.downstream().drops,
            vec![DropReason::StaleConnection]
        );
    }

    #[test]
    fn non_syn_flow_rejected_when_policy_strict() {
        let mut pair = setup(false);
        push_fwd(&mut pair, 0, ACK);

        assert_eq!(pair.fwd.stats().protocol_violations, 1);
        assert_eq!(established(&pair), 0);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 0);
        assert!(pair.fwd.downstream().runs.is_empty());
        assert_eq!(pair.fwd.downstream().drops, vec![DropReason::NonSyn]);
    }

    #[test]
    fn non_syn_flow_accepted_by_default() {
        let mut pair = setup(true);
        push_fwd(&mut pair, 0, ACK);
        assert_eq!(pair.fwd.stats().protocol_violations, 0);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 1);
        assert_eq!(pair.fwd.downstream().runs.len(), 1);
    }

    #[test]
    fn adoption_of_expired_peer_state_is_stale() {
        let mut pair = setup(true);
        push_fwd(&mut pair, 0, SYN);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 1);

        // The forward flow idles out before the reverse direction ever
        // answers; its map slot now holds the last reference.
        for t in 1..=(TCP_STATE_FLOW_TIMEOUT as u64) {
            pair.fwd_mgr.recycle(t * 1000, &mut pair.fwd);
        }
        assert_eq!(pair.fwd_mgr.flow_count(), 0);

        let late = TCP_STATE_FLOW_TIMEOUT as u64 * 1000 + 500;
        push_rev(&mut pair, late, SYN | ACK);
        assert_eq!(established(&pair), 0);
        // The stale state was discarded and a fresh connection was opened in
        // the reverse direction.
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 0);
        assert_eq!(pair.rev.read_handler(TcpHandler::MapSize), 1);
    }

    #[test]
    fn references_balance_at_quiescence() {
        let mut pair = setup(true);
        handshake(&mut pair);
        push_fwd(&mut pair, 10, FIN | ACK);
        push_rev(&mut pair, 11, FIN | ACK);
        push_fwd(&mut pair, 12, ACK);

        assert_eq!(established(&pair), 0);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 0);
        assert_eq!(pair.rev.read_handler(TcpHandler::MapSize), 0);
        assert!(pair.fwd.entries.iter().all(|e| e.common.is_none()));
        assert!(pair.rev.entries.iter().all(|e| e.common.is_none()));
    }

    #[test]
    fn non_tcp_flows_pass_through_untracked() {
        let mut pair = setup(true);
        let pkt = udp_pkt(A, 5000, B, 53);
        pair.fwd_mgr
            .push_batch(vec![pkt].into(), 0, &mut pair.fwd);
        assert_eq!(pair.fwd.downstream().runs.len(), 1);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 0);
        assert_eq!(established(&pair), 0);
    }

    #[test]
    fn stale_ids_do_not_leak_across_flows() {
        let mut pair = setup(true);
        handshake(&mut pair);
        push_fwd(&mut pair, 10, RST);
        push_rev(&mut pair, 10, RST);

        // Reclaim both FCBs, then open a different connection that reuses
        // the same slot ids.
        for t in 1..=(TCP_STATE_FLOW_TIMEOUT as u64 + 1) {
            let now = 10 + t * 1000;
            pair.fwd_mgr.recycle(now, &mut pair.fwd);
            pair.rev_mgr.recycle(now, &mut pair.rev);
        }
        assert_eq!(pair.fwd_mgr.flow_count(), 0);

        let base = TCP_STATE_FLOW_TIMEOUT as u64 * 1000 + 2000;
        let pkt = tcp_pkt("10.0.0.9", 4000, B, 80, SYN);
        pair.fwd_mgr
            .push_batch(vec![pkt].into(), base, &mut pair.fwd);
        let reused: FlowId = *pair.fwd.downstream().new_flows.last().unwrap();
        assert_eq!(reused, 0);
        assert_eq!(pair.fwd.read_handler(TcpHandler::MapSize), 1);
        assert_eq!(established(&pair), 0);
    }
}

//! Flow classification and per-flow state management.
//!
//! Packets are grouped into flows by IPv4 5-tuple. Each flow is assigned a
//! [`Fcb`] from a pre-allocated arena for the lifetime of the flow;
//! downstream stages read and mutate it through the [`FlowContext`] handed
//! along with every emitted batch. One [`FlowManager`] is owned per worker;
//! shared-table deployments wrap the same manager around a table built with
//! the deferred-key-release option.

pub mod arena;
pub mod batch;
pub mod key;
pub mod table;
pub mod tcp_state;
mod timerwheel;

pub use self::arena::{Fcb, FcbArena, FlowContext, FlowId};
pub use self::batch::PacketBatch;
pub use self::key::FlowKey;
pub use self::table::{FlowTable, TableError};

use self::batch::BatchBuilder;
use self::timerwheel::{TimerAction, TimerWheel};
use crate::config::FlowConfig;
use crate::memory::mbuf::Mbuf;

use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::{tick, Receiver};

/// Why the manager discarded a packet instead of emitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The flow table had no room for a new flow.
    TableFull,
    /// The frame was too short for its headers, or not IPv4 at all.
    TooShort,
    /// TCP packet for a connection with no live shared state.
    StaleConnection,
    /// Non-SYN packet attempting to open a connection.
    NonSyn,
}

/// Downstream consumer of classified batches.
///
/// Replaces output ports: emitted runs go to [`FlowSink::deliver`] together
/// with the flow's [`FlowContext`], and the optional drop side band is
/// [`FlowSink::packet_dropped`].
pub trait FlowSink {
    /// Called once when a flow is assigned a fresh FCB, with the packet that
    /// created it.
    fn new_flow(&mut self, _ctx: &mut FlowContext<'_>, _first: &Mbuf) {}

    /// Called with each emitted same-flow run.
    fn deliver(&mut self, ctx: &mut FlowContext<'_>, batch: PacketBatch);

    /// Called when the flow's FCB is reclaimed (idle expiry or drain).
    fn flow_released(&mut self, _ctx: &mut FlowContext<'_>) {}

    /// Called for every packet the manager discards.
    fn packet_dropped(&mut self, _pkt: Mbuf, _reason: DropReason) {}
}

/// Terminal sink that consumes batches without forwarding them.
impl FlowSink for () {
    fn deliver(&mut self, _ctx: &mut FlowContext<'_>, _batch: PacketBatch) {}
}

/// Data-path failure counters.
#[derive(Debug, Default, Clone)]
pub struct FlowStats {
    /// Packets dropped because the table was full.
    pub dropped_capacity: u64,
    /// Packets dropped because they were too short to classify.
    pub dropped_too_short: u64,
}

/// Read-only handler ids exposed by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowHandler {
    /// Live flows in the table.
    Count,
    /// Packets dropped for lack of capacity.
    DroppedCapacity,
    /// Packets dropped as unparseable.
    DroppedTooShort,
}

/// Classifier and FCB allocator: the entry point of the core.
///
/// `push_batch` classifies a batch, compacts consecutive same-flow packets
/// into runs, and emits each run downstream exactly once. A cooperative
/// recycle pass, driven by [`FlowManager::check_recycle`] between batches,
/// expires idle flows through the timing wheel.
pub struct FlowManager {
    table: FlowTable,
    arena: FcbArena,
    wheel: Option<TimerWheel>,
    builder: BatchBuilder,
    /// Head of the list of FCBs whose table position awaits the one-tick
    /// grace period before key release.
    quarantine: Option<FlowId>,
    epoch: Instant,
    ticker: Option<Receiver<Instant>>,
    timeout_ms: u64,
    recycle_ms: u64,
    timeout_ticks: u32,
    cache: bool,
    lf: bool,
    verbose: u8,
    stats: FlowStats,
}

impl FlowManager {
    /// Creates a manager from `config`. Fails on invalid configuration.
    pub fn new(config: &FlowConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.capacity.next_power_of_two();
        if capacity != config.capacity && config.verbose > 0 {
            log::info!("Real capacity will be {}", capacity);
        }
        let timeout_ms = config.timeout as u64 * 1000;
        let recycle_ms = config.recycle_ms();
        let (wheel, ticker, timeout_ticks) = if config.timeout > 0 {
            let ticks = timeout_ms.div_ceil(recycle_ms) as u32;
            let wheel = TimerWheel::new(ticks);
            if config.verbose > 1 {
                log::debug!(
                    "Timer wheel: {} buckets for {} ticks of {} ms",
                    wheel.num_buckets(),
                    ticks,
                    recycle_ms
                );
            }
            (
                Some(wheel),
                Some(tick(Duration::from_millis(recycle_ms))),
                ticks,
            )
        } else {
            (None, None, 0)
        };
        Ok(FlowManager {
            table: FlowTable::with_options(capacity, config.lf),
            arena: FcbArena::new(capacity, config.reserve as usize),
            wheel,
            builder: BatchBuilder::new(),
            quarantine: None,
            epoch: Instant::now(),
            ticker,
            timeout_ms,
            recycle_ms,
            timeout_ticks,
            cache: config.cache,
            lf: config.lf,
            verbose: config.verbose,
            stats: FlowStats::default(),
        })
    }

    /// Milliseconds elapsed since the manager was created. The `now` values
    /// fed to [`FlowManager::push_batch`] and [`FlowManager::recycle`] are on
    /// this clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Number of live flows.
    pub fn flow_count(&self) -> u32 {
        self.table.count()
    }

    /// Data-path failure counters.
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Typed read handler dispatch.
    pub fn read_handler(&self, handler: FlowHandler) -> u64 {
        match handler {
            FlowHandler::Count => self.table.count() as u64,
            FlowHandler::DroppedCapacity => self.stats.dropped_capacity,
            FlowHandler::DroppedTooShort => self.stats.dropped_too_short,
        }
    }

    /// Classifies `batch` and emits its runs to `sink`. `now` is the batch
    /// timestamp in milliseconds on the manager's clock.
    pub fn push_batch<S: FlowSink>(&mut self, batch: PacketBatch, now: u64, sink: &mut S) {
        for pkt in batch {
            self.process(pkt, now, sink);
        }
        if let Some((id, run)) = self.builder.finish() {
            self.emit(id, run, now, sink);
        }
    }

    fn process<S: FlowSink>(&mut self, pkt: Mbuf, now: u64, sink: &mut S) {
        let key = match FlowKey::from_mbuf(&pkt) {
            Ok(key) => key,
            Err(_) => {
                self.stats.dropped_too_short += 1;
                if self.verbose > 0 {
                    log::debug!(
                        "Dropping unclassifiable frame ({} bytes)",
                        pkt.data_len()
                    );
                }
                sink.packet_dropped(pkt, DropReason::TooShort);
                return;
            }
        };

        if self.cache && self.builder.last_key == Some(key) {
            self.builder.append(pkt);
            return;
        }

        let idx = match self.table.lookup(&key) {
            Some(idx) => idx,
            None => match self.table.add(&key) {
                Ok(idx) => {
                    if self.verbose > 1 {
                        log::debug!("New flow {}", idx);
                    }
                    {
                        let fcb = self.arena.slot_mut(idx);
                        fcb.flow_id = idx;
                        fcb.key = key;
                        fcb.table_pos = idx;
                        fcb.last_seen = now;
                        fcb.active = true;
                    }
                    self.arena.reset_user(idx);
                    if let Some(wheel) = self.wheel.as_mut() {
                        wheel.schedule_after(&mut self.arena, idx, self.timeout_ticks);
                    }
                    let mut ctx = self.arena.context(idx);
                    sink.new_flow(&mut ctx, &pkt);
                    idx
                }
                Err(_) => {
                    self.stats.dropped_capacity += 1;
                    if self.verbose > 0 {
                        log::debug!("Cannot add key (have {} flows)", self.table.count());
                    }
                    sink.packet_dropped(pkt, DropReason::TableFull);
                    return;
                }
            },
        };

        if self.builder.last == Some(idx) {
            self.builder.append(pkt);
        } else {
            if let Some((prev, run)) = self.builder.finish() {
                self.emit(prev, run, now, sink);
            }
            let cached = if self.cache { Some(key) } else { None };
            self.builder.start(idx, cached, pkt);
        }
    }

    fn emit<S: FlowSink>(&mut self, id: FlowId, run: PacketBatch, now: u64, sink: &mut S) {
        let mut ctx = self.arena.context(id);
        ctx.fcb.last_seen = now;
        sink.deliver(&mut ctx, run);
    }

    /// Runs the recycle pass if the ticker has fired. Call between batches
    /// on the owning worker.
    pub fn check_recycle<S: FlowSink>(&mut self, sink: &mut S) {
        let fired = self
            .ticker
            .as_ref()
            .map(|t| t.try_recv().is_ok())
            .unwrap_or(false);
        if fired {
            let now = self.now_ms();
            self.recycle(now, sink);
        }
    }

    /// One recycle tick: drains the quarantine list, then advances the wheel
    /// and expires or reschedules every entry in the current bucket.
    pub fn recycle<S: FlowSink>(&mut self, now: u64, sink: &mut S) {
        // The run cache may name a flow this pass is about to reclaim.
        self.builder.last = None;
        self.builder.last_key = None;

        // Positions quarantined on the previous pass have had their one-tick
        // grace period; readers can no longer observe them.
        let mut cur = self.quarantine.take();
        while let Some(id) = cur {
            let fcb = self.arena.slot_mut(id);
            cur = fcb.next_idx.take();
            let pos = fcb.table_pos;
            self.table.free_key_at(pos);
        }

        let wheel = match self.wheel.as_mut() {
            Some(wheel) => wheel,
            None => return,
        };
        let timeout_ms = self.timeout_ms;
        let recycle_ms = self.recycle_ms;
        let lf = self.lf;
        let verbose = self.verbose;
        let table = &self.table;
        let quarantine = &mut self.quarantine;
        let mut released = 0u32;
        wheel.tick(&mut self.arena, |arena, id| {
            if !arena.slot(id).active {
                return TimerAction::Expire;
            }
            let idle = now.saturating_sub(arena.slot(id).last_seen);
            if idle + recycle_ms >= timeout_ms {
                if verbose > 1 {
                    log::debug!("Releasing flow {} idle for {} ms", id, idle);
                }
                match table.delete_key(&arena.slot(id).key) {
                    Ok(pos) => {
                        {
                            let mut ctx = arena.context(id);
                            sink.flow_released(&mut ctx);
                        }
                        let fcb = arena.slot_mut(id);
                        fcb.active = false;
                        if lf {
                            fcb.table_pos = pos;
                            fcb.next_idx = *quarantine;
                            *quarantine = Some(id);
                        }
                        released += 1;
                    }
                    Err(_) => {
                        log::error!("Expired flow {} missing from table", id);
                    }
                }
                TimerAction::Expire
            } else {
                let residual = timeout_ms - idle;
                TimerAction::Reschedule(residual.div_ceil(recycle_ms) as u32)
            }
        });
        if verbose > 0 && released > 0 {
            log::debug!("Recycled {} flows, {} live", released, self.table.count());
        }
    }

    /// Releases every live flow, e.g. at shutdown.
    pub fn drain<S: FlowSink>(&mut self, sink: &mut S) {
        log::info!("Draining flow table");
        if let Some(wheel) = self.wheel.as_mut() {
            wheel.clear(&mut self.arena);
        }
        let mut cur = self.quarantine.take();
        while let Some(id) = cur {
            let fcb = self.arena.slot_mut(id);
            cur = fcb.next_idx.take();
            let pos = fcb.table_pos;
            self.table.free_key_at(pos);
        }
        for id in 0..self.arena.capacity() {
            if !self.arena.slot(id).active {
                continue;
            }
            match self.table.delete_key(&self.arena.slot(id).key) {
                Ok(pos) => {
                    if self.lf {
                        // No readers remain at drain time.
                        self.table.free_key_at(pos);
                    }
                }
                Err(_) => log::error!("Drained flow {} missing from table", id),
            }
            {
                let mut ctx = self.arena.context(id);
                sink.flow_released(&mut ctx);
            }
            self.arena.slot_mut(id).active = false;
        }
        self.arena.zero();
        self.builder = BatchBuilder::new();
    }
}

//! A multi-threaded IP flow classification and per-flow state management
//! core.
//!
//! Packets arriving from upstream drivers are grouped into flows by IPv4
//! 5-tuple. Each flow is assigned a Flow Control Block (FCB), a small
//! fixed-size record that downstream stages may read and mutate while
//! handling packets of that flow. The core provides:
//!
//! - an indexable flow table mapping 5-tuple to FCB index;
//! - FCB lifecycle management with per-flow idle timeout reclamation;
//! - batched processing that amortises table work across consecutive
//!   packets of the same flow;
//! - an optional bidirectional TCP tracker that follows SYN/FIN/RST
//!   handshakes to release connection state early.
//!
//! Each worker owns a private [`FlowManager`] instance group; see
//! [`lcore::ManagerSet`]. Downstream consumers implement [`FlowSink`]:
//!
//! ```rust
//! use rivulet_core::config::default_config;
//! use rivulet_core::{FlowContext, FlowManager, FlowSink, PacketBatch};
//!
//! struct Printer;
//!
//! impl FlowSink for Printer {
//!     fn deliver(&mut self, ctx: &mut FlowContext<'_>, batch: PacketBatch) {
//!         println!("flow {}: {} packets", ctx.flow_id, batch.len());
//!     }
//! }
//!
//! let config = default_config();
//! let mut manager = FlowManager::new(&config.flow).unwrap();
//! let mut sink = Printer;
//! let now = manager.now_ms();
//! manager.push_batch(PacketBatch::new(), now, &mut sink);
//! ```
//!
//! Packet I/O, header rewriting, and forwarding policy are out of scope: the
//! core exposes flow identity and per-flow storage, and consumers implement
//! application semantics on top.

pub mod config;
pub mod flowtrack;
pub mod lcore;
pub mod memory;
pub mod protocols;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutils;

pub use self::flowtrack::key::FlowKey;
pub use self::flowtrack::tcp_state::{TcpHandler, TcpStateIn};
pub use self::flowtrack::{
    DropReason, Fcb, FlowContext, FlowHandler, FlowId, FlowManager, FlowSink, PacketBatch,
};
pub use self::lcore::CoreId;
pub use self::memory::mbuf::Mbuf;

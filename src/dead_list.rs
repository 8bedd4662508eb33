//! Per-socket dead-RPC queue (spec §2, §4.2).
//!
//! Pulled out as its own type even though only `Socket` ever owns one,
//! matching spec §2's component list, which names `DeadList` alongside
//! `BucketTable`/`BufferPool` as a first-class piece of socket state rather
//! than just "a field" — grounded in `homa_utils.c`'s `hsk->dead_rpcs` list
//! plus the `dead_skbs`/`max_dead_buffs` counters `homa_rpc_free`/
//! `homa_rpc_reap` maintain alongside it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::external::{PacketBuffer, Peer};
use crate::rpc::RpcRecord;

/// RPCs made unreachable by `free` but not yet reaped.
pub struct DeadList<P: Peer, Pk: PacketBuffer> {
    entries: Vec<Arc<RpcRecord<P, Pk>>>,
    /// Outstanding packet buffers owed by dead-but-unreaped RPCs (spec
    /// §4.2 `dead_skbs`).
    pub dead_skbs: u32,
    /// High-water mark of `dead_skbs`. Updated without strict atomicity —
    /// a statistic only (spec §4.2: "updated without strict atomicity").
    pub max_dead_buffs: u32,
}

impl<P: Peer, Pk: PacketBuffer> DeadList<P, Pk> {
    pub fn new() -> Self {
        DeadList {
            entries: Vec::new(),
            dead_skbs: 0,
            max_dead_buffs: 0,
        }
    }

    pub fn push(&mut self, rpc: Arc<RpcRecord<P, Pk>>) {
        self.entries.push(rpc);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<RpcRecord<P, Pk>>> {
        self.entries.get(index)
    }

    pub fn remove(&mut self, index: usize) -> Arc<RpcRecord<P, Pk>> {
        self.entries.remove(index)
    }

    pub fn contains(&self, id: crate::ids::RpcId) -> bool {
        self.entries.iter().any(|r| r.id == id)
    }

    /// Called by `free`, under the socket lock, when a new RPC dies.
    pub fn record_freed_buffers(&mut self, n: u32) {
        self.dead_skbs = self.dead_skbs.saturating_add(n);
        if self.dead_skbs > self.max_dead_buffs {
            self.max_dead_buffs = self.dead_skbs;
        }
    }

    /// Called by `reap`, under the socket lock, once buffers are reclaimed.
    pub fn record_reaped_buffers(&mut self, n: u32) {
        self.dead_skbs = self.dead_skbs.saturating_sub(n);
    }
}

impl<P: Peer, Pk: PacketBuffer> Default for DeadList<P, Pk> {
    fn default() -> Self {
        Self::new()
    }
}

//! Interfaces consumed by the core (spec §6).
//!
//! Wire parsing, the pacer/grant scheduler, the peer table, socket table
//! indexing, and the clock are all out of scope for this crate (spec §1);
//! we depend on them only through these traits, generalizing the teacher
//! kernel's habit of depending on free functions reaching into global
//! kernel state (`crate::context::current()`, `crate::time::monotonic()`)
//! into an explicit, testable dependency instead, per the "Global mutable
//! state" design note (spec §9).

use alloc::sync::Arc;
use core::fmt::Debug;

use crate::error::{Error, Result};
use crate::ids::RpcId;

/// A resolved remote peer. Stable for the lifetime of any RPC referencing
/// it (spec §3: "stable for the RPC's lifetime").
pub trait Peer: Debug + Send + Sync {
    /// Address this peer represents, used to disambiguate server RPCs that
    /// share a numeric id with a different remote host (spec §4.1).
    fn addr(&self) -> u32;
}

/// Peer registry: resolves addresses to shared, stable `Peer` handles.
pub trait PeerResolver: Send + Sync {
    type P: Peer;

    fn find(&self, addr: u32) -> Result<Arc<Self::P>>;

    fn get_all(&self) -> alloc::vec::Vec<Arc<Self::P>>;
}

/// Grant scheduler hooks invoked from the RPC lifecycle.
///
/// `free_rpc` may internally drop and retake the record's bucket lock, which
/// is exactly why spec §4.2 requires calling it *before* the socket lock is
/// taken in `free`.
pub trait GrantScheduler: Send + Sync {
    fn free_rpc(&self, id: RpcId);

    /// Remove the RPC from the throttle list (spec §4.2, "external").
    fn remove_from_throttle(&self, id: RpcId);

    fn check_waiting(&self);

    fn log_tt(&self) {}
}

/// Outbound packet buffer, opaque to this crate beyond its size.
pub trait PacketBuffer: Send {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allocates/frees outbound packet buffers and drains inbound packet
/// queues; wire formats are out of scope (spec §1).
pub trait PacketPool: Send + Sync {
    type Packet: PacketBuffer;

    fn alloc_outbound(&self, len: usize) -> Result<Self::Packet>;

    fn free_outbound(&self, packets: alloc::vec::Vec<Self::Packet>);
}

/// Monotonic cycle clock, used by bpage lease expiration and timer ticks.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;

    fn cycles_per_usec(&self) -> u64 {
        1
    }
}

/// Socket table lookups; only the parts the core depends on.
pub trait SocketTable<S>: Send + Sync {
    fn find(&self, port: u16) -> Option<Arc<S>>;
}

/// Placeholder error conversions so adapters can map their own types into
/// ours without the core needing to know about them.
impl From<core::convert::Infallible> for Error {
    fn from(inf: core::convert::Infallible) -> Self {
        match inf {}
    }
}

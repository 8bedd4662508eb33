//! RPC identifiers (spec §3).

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit RPC id. The low bit distinguishes client-initiated (0) from
/// server-initiated (1) ids; client ids are allocated monotonically from a
/// socket-global counter that advances by 2, so two ids allocated by
/// `new_client` are never equal and never have the low bit set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RpcId(u64);

impl RpcId {
    pub const fn new(raw: u64) -> Self {
        RpcId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_client(self) -> bool {
        self.0 & 1 == 0
    }

    pub const fn is_server(self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({:#x})", self.0)
    }
}

/// Allocates client-initiated ids: starts at 2 and advances by 2, matching
/// `homa_init()`'s `atomic64_set(&homa->next_outgoing_id, 2)`.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub const fn new() -> Self {
        IdAllocator {
            next: AtomicU64::new(2),
        }
    }

    /// Allocate the next client id. Always even (low bit 0); distinct
    /// concurrent callers always observe distinct ids (spec §8, property 3).
    pub fn next_client_id(&self) -> RpcId {
        RpcId(self.next.fetch_add(2, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

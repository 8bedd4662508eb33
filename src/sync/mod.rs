//! Synchronization primitives.
//!
//! `ordered` gives every lock in this crate a compile-time level so the
//! bucket → socket → pool-descriptor hierarchy (spec §5) can't be violated
//! by accident. `lockfree_queue` is a plain mutex-guarded queue used for
//! msgin/msgout packet lists, where ordering against other locks doesn't
//! matter.

mod lockfree_queue;
mod ordered;

pub use lockfree_queue::LockFreeQueue;
pub use ordered::{
    check_no_locks, Bucket, CleanLockToken, Higher, Level, LockToken, Lower, OrderedMutex,
    OrderedMutexGuard, Pool, Sock, L0, L1, L2, L3,
};

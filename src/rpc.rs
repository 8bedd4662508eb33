//! Per-RPC state container (spec §3, §4.4).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use core::task::Waker;

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use crate::bucket::Bucket;
use crate::external::{Peer, PacketBuffer};
use crate::ids::RpcId;
use crate::sync::LockFreeQueue;

/// Sentinel value for "length not yet known" on `MsgIn`/`MsgOut`, matching
/// the C source's use of a negative length.
pub const LENGTH_UNKNOWN: i64 = -1;

bitflags! {
    /// Recognized bits of `RpcRecord::flags` (spec §3 names exactly these
    /// two; nothing else is named anywhere in the source material, so we
    /// don't invent further bits).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RpcFlags: u32 {
        /// At least one packet is ready for the application to read.
        const PKTS_READY = 1 << 0;
        /// Reaping is temporarily forbidden (e.g. a diagnostic holds a
        /// pointer to this record outside any lock).
        const CANT_REAP  = 1 << 1;
    }
}

/// RPC lifecycle state (spec §3). Transitions to `Dead` are monotonic: once
/// dead, a record never re-enters another state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcState {
    Outgoing = 0,
    Incoming = 1,
    InService = 2,
    Dead = 3,
}

impl RpcState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RpcState::Outgoing,
            1 => RpcState::Incoming,
            2 => RpcState::InService,
            _ => RpcState::Dead,
        }
    }
}

/// An out-of-order reception gap in `MsgIn`: bytes in `[start, end)` have
/// not yet arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gap {
    pub start: usize,
    pub end: usize,
}

/// Inbound message state (spec §4.4).
pub struct MsgIn<Pk: PacketBuffer> {
    /// Declared total length; `LENGTH_UNKNOWN` until the first data packet
    /// tells us.
    pub length: i64,
    pub bytes_remaining: i64,
    /// Watermark up to which the sender has been granted.
    pub granted: i64,
    pub gaps: Vec<Gap>,
    pub packets: LockFreeQueue<Pk>,
    /// Scheduler rank; opaque to this crate beyond being carried along.
    pub rank: i32,
    /// Byte offsets into the buffer pool region, one per bpage borrowed
    /// for this message (spec §4.3 `allocate`).
    pub bpage_offsets: Vec<usize>,
}

impl<Pk: PacketBuffer> MsgIn<Pk> {
    pub fn new() -> Self {
        MsgIn {
            length: LENGTH_UNKNOWN,
            bytes_remaining: 0,
            granted: 0,
            gaps: Vec::new(),
            packets: LockFreeQueue::new(),
            rank: -1,
            bpage_offsets: Vec::new(),
        }
    }

    pub fn num_bpages(&self) -> usize {
        self.bpage_offsets.len()
    }
}

impl<Pk: PacketBuffer> Default for MsgIn<Pk> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound message state (spec §4.4).
pub struct MsgOut<Pk: PacketBuffer> {
    pub length: i64,
    pub next_xmit_offset: i64,
    pub granted: i64,
    pub packets: LockFreeQueue<Pk>,
    pub num_skbs: usize,
    /// Transmits currently in flight for this message; nonzero forbids
    /// reaping (spec §3 invariants, §4.2).
    pub active_xmits: AtomicU32,
}

impl<Pk: PacketBuffer> MsgOut<Pk> {
    pub fn new() -> Self {
        MsgOut {
            length: LENGTH_UNKNOWN,
            next_xmit_offset: 0,
            granted: 0,
            packets: LockFreeQueue::new(),
            num_skbs: 0,
            active_xmits: AtomicU32::new(0),
        }
    }
}

impl<Pk: PacketBuffer> Default for MsgOut<Pk> {
    fn default() -> Self {
        Self::new()
    }
}

/// The mutable body of an `RpcRecord`, protected in practice by the owning
/// bucket's lock: every caller that can see the record via `find_client`/
/// `find_server`/bucket iteration already holds that lock. The inner mutex
/// here is the safe-Rust realization of that invariant (spec never
/// prescribes a specific locking primitive, only the ordering — §1
/// Non-goals, §9) and avoids unsafe interior mutability on data that's also
/// reachable through a bare `Arc`.
pub(crate) struct RpcBody<Pk: PacketBuffer> {
    pub msgin: MsgIn<Pk>,
    pub msgout: MsgOut<Pk>,
}

/// Sentinel written at construction and zeroed during reap (spec §4.2:
/// "zero a sentinel magic field"), so a stray access to a record mid-reap
/// shows up as corrupted state instead of silently succeeding.
const RPC_MAGIC: u32 = 0x686f_6d61; // "homa"

pub struct RpcRecord<P: Peer, Pk: PacketBuffer> {
    pub id: RpcId,
    pub dport: u16,
    pub peer: Arc<P>,
    pub bucket: Arc<Bucket<P, Pk>>,

    state: AtomicU8,
    flags: AtomicU32,
    pub grants_in_progress: AtomicU32,

    interest: SpinMutex<Option<Waker>>,
    pub(crate) body: SpinMutex<RpcBody<Pk>>,

    pub resend_timer_ticks: AtomicU32,
    pub silent_ticks: AtomicU32,
    pub done_timer_ticks: AtomicU32,
    pub start_cycles: u64,

    magic: AtomicU32,
}

impl<P: Peer, Pk: PacketBuffer> RpcRecord<P, Pk> {
    pub(crate) fn new(
        id: RpcId,
        dport: u16,
        peer: Arc<P>,
        bucket: Arc<Bucket<P, Pk>>,
        state: RpcState,
        start_cycles: u64,
        timer_ticks_now: u32,
    ) -> Self {
        RpcRecord {
            id,
            dport,
            peer,
            bucket,
            state: AtomicU8::new(state as u8),
            flags: AtomicU32::new(0),
            grants_in_progress: AtomicU32::new(0),
            interest: SpinMutex::new(None),
            body: SpinMutex::new(RpcBody {
                msgin: MsgIn::new(),
                msgout: MsgOut::new(),
            }),
            resend_timer_ticks: AtomicU32::new(timer_ticks_now),
            silent_ticks: AtomicU32::new(0),
            done_timer_ticks: AtomicU32::new(0),
            start_cycles,
            magic: AtomicU32::new(RPC_MAGIC),
        }
    }

    pub fn state(&self) -> RpcState {
        RpcState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state(), RpcState::Dead)
    }

    /// Monotonic transition to a non-dead state. No-op (returns `false`) if
    /// already dead, enforcing spec §3's "transitions to DEAD are
    /// monotonic; no record re-enters a non-DEAD state".
    pub fn set_state(&self, new: RpcState) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur == RpcState::Dead as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(cur, new as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Mark the record dead. Returns `true` the first time this happens
    /// (used by `free` to detect the already-dead no-op case).
    pub(crate) fn mark_dead(&self) -> bool {
        self.state.swap(RpcState::Dead as u8, Ordering::AcqRel) != RpcState::Dead as u8
    }

    pub fn flags(&self) -> RpcFlags {
        RpcFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, bit: RpcFlags) {
        self.flags.fetch_or(bit.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, bit: RpcFlags) {
        self.flags.fetch_and(!bit.bits(), Ordering::AcqRel);
    }

    /// `true` once `grants_in_progress == 0 && msgout.active_xmits == 0 &&
    /// !CANT_REAP` — the minimum reap precondition from spec §3.
    pub(crate) fn reapable(&self) -> bool {
        if self.flags().contains(RpcFlags::CANT_REAP) {
            return false;
        }
        if self.grants_in_progress.load(Ordering::Acquire) != 0 {
            return false;
        }
        let body = self.body.lock();
        body.msgout.active_xmits.load(Ordering::Acquire) == 0
    }

    /// Register a waker to be woken when this RPC dies (spec glossary:
    /// "hand-off"). Only one waker is tracked at a time, matching the
    /// single `interest` back-link in spec §3.
    pub fn register_interest(&self, waker: Waker) {
        *self.interest.lock() = Some(waker);
    }

    /// Clear and wake any registered interest. Called by `free`.
    pub(crate) fn wake_interest(&self) {
        if let Some(waker) = self.interest.lock().take() {
            waker.wake();
        }
    }

    pub(crate) fn zero_magic(&self) {
        self.magic.store(0, Ordering::Release);
    }

    pub fn magic_intact(&self) -> bool {
        self.magic.load(Ordering::Acquire) == RPC_MAGIC
    }

    pub(crate) fn with_body<R>(&self, f: impl FnOnce(&mut RpcBody<Pk>) -> R) -> R {
        let mut body = self.body.lock();
        f(&mut body)
    }
}

impl<P: Peer, Pk: PacketBuffer> core::fmt::Debug for RpcRecord<P, Pk> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcRecord")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dport", &self.dport)
            .finish()
    }
}

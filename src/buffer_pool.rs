//! Zero-copy receive buffer pool (spec §4.3).
//!
//! Grounded in `original_source/test/unit_homa_pool.c`, which pins down the
//! exact arithmetic `homa_pool_get_pages`/`homa_pool_allocate` use (candidate
//! scanning order, the `set_owner` refs bump, tail-bpage reuse via a core's
//! `page_hint`). The region is modeled as an opaque base address plus length
//! rather than an actual mapped buffer — this crate has no notion of "user
//! memory" (out of scope per spec §1), so `get_buffer` reports offsets into
//! the region and an optional raw pointer for callers that do have one.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use crate::config::Metrics;
use crate::error::{Error, Result};
use crate::external::{PacketBuffer, Peer};
use crate::rpc::RpcRecord;
use crate::sync::{self, Lower, LockToken, OrderedMutex};

/// Value of `Descriptor::owner` for a bpage with no current owning core.
const NO_OWNER: i32 = -1;
/// Owner value that marks a bpage as permanently unallocatable: only the
/// trailing sentinel bpage ever gets this (spec §4.3: "the last bpage is
/// reserved as a sentinel and never allocated").
const SENTINEL_OWNER: i32 = -2;

/// Per-bpage bookkeeping. `guard` is the non-blocking descriptor lock spec
/// §4.3/§9 calls for ("a try-acquire primitive, not a blocking mutex"); it
/// reuses the crate's compile-time lock-level machinery at the `Pool` level,
/// the lowest rung of the §5 hierarchy (bucket → socket → pool).
struct Descriptor {
    refs: AtomicI32,
    owner: AtomicI32,
    expiration: AtomicU64,
    guard: OrderedMutex<sync::Pool, ()>,
}

impl Descriptor {
    fn new() -> Self {
        Descriptor {
            refs: AtomicI32::new(0),
            owner: AtomicI32::new(NO_OWNER),
            expiration: AtomicU64::new(0),
            guard: OrderedMutex::new(()),
        }
    }

    fn is_sentinel(&self) -> bool {
        self.owner.load(Ordering::Acquire) == SENTINEL_OWNER
    }

    /// Eligible for allocation: either fully free, or owned by an expired
    /// lease with no outstanding refs (spec §4.3 `get_pages`).
    fn eligible(&self, now: u64) -> bool {
        let owner = self.owner.load(Ordering::Acquire);
        let refs = self.refs.load(Ordering::Acquire);
        if refs != 0 {
            return false;
        }
        if owner == NO_OWNER {
            return true;
        }
        if owner == SENTINEL_OWNER {
            return false;
        }
        owner != NO_OWNER && self.expiration.load(Ordering::Acquire) <= now
    }
}

/// Per-core allocation cursor (spec §4.3 `cores` field).
///
/// Touched almost exclusively by its owning core in the fast path; modeling
/// it behind a `SpinMutex` rather than unsynchronized `UnsafeCell` access
/// keeps the crate free of unsafe aliasing while costing nothing under the
/// intended access pattern (no cross-core contention on a core's own slot,
/// matching the generalization `bucket.rs` already makes for intrusive
/// lists — see that module's doc comment).
#[derive(Clone, Copy, Debug, Default)]
struct CoreState {
    page_hint: usize,
    allocated: usize,
    next_candidate: usize,
}

/// Per-socket zero-copy receive-buffer allocator (spec §4.3).
pub struct BufferPool {
    bpage_size: usize,
    num_bpages: usize,
    /// 0 once uninitialized or after `destroy` (spec §4.3: "nulls the
    /// region pointer so subsequent operations become no-ops").
    region_base: AtomicUsize,
    descriptors: Vec<Descriptor>,
    cores: Vec<SpinMutex<CoreState>>,
    /// Approximate count of free bpages (spec §3 `free_bpages`, §9 Open
    /// Question: advisory only, correctness rests on per-descriptor state).
    free_bpages: AtomicI64,
    metrics: Arc<Metrics>,
}

/// Absolute location of a message offset within the pool's region, plus the
/// number of contiguous bytes available from there (spec §4.3 `get_buffer`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLocation {
    pub offset: usize,
    pub available: usize,
}

impl BufferPool {
    /// `init` (spec §4.3): fails `InvalidArgument` unless `region_len` is
    /// bpage-aligned and at least `2 * bpage_size`, and unless `region_base`
    /// is itself bpage-aligned.
    pub fn init(
        num_cores: usize,
        bpage_size: usize,
        region_base: usize,
        region_len: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if bpage_size == 0
            || region_base % bpage_size != 0
            || region_len % bpage_size != 0
            || region_len < 2 * bpage_size
        {
            return Err(Error::InvalidArgument);
        }
        let num_bpages = region_len / bpage_size;
        let mut descriptors = Vec::with_capacity(num_bpages);
        for _ in 0..num_bpages {
            descriptors.push(Descriptor::new());
        }
        // Sentinel: the last bpage is never allocatable.
        descriptors[num_bpages - 1]
            .owner
            .store(SENTINEL_OWNER, Ordering::Release);

        let cores = (0..num_cores.max(1))
            .map(|_| SpinMutex::new(CoreState::default()))
            .collect();

        Ok(BufferPool {
            bpage_size,
            num_bpages,
            region_base: AtomicUsize::new(region_base),
            descriptors,
            cores,
            free_bpages: AtomicI64::new((num_bpages - 1) as i64),
            metrics,
        })
    }

    pub fn num_bpages(&self) -> usize {
        self.num_bpages
    }

    pub fn bpage_size(&self) -> usize {
        self.bpage_size
    }

    /// Approximate free-bpage gauge (spec §3/§9: advisory, may transiently
    /// under/overcount under concurrent stealing).
    pub fn free_bpages(&self) -> i64 {
        self.free_bpages.load(Ordering::Acquire)
    }

    fn initialized(&self) -> bool {
        self.region_base.load(Ordering::Acquire) != 0
    }

    /// `destroy` (spec §4.3): idempotent; nulls the region so later calls
    /// become no-ops.
    pub fn destroy(&self) {
        self.region_base.store(0, Ordering::Release);
    }

    /// `get_pages` (spec §4.3). Scans the calling core's `next_candidate`
    /// cursor for `count` eligible bpages, claiming each via the
    /// descriptor's non-blocking lock. Returns `ResourceExhausted` if the
    /// approximate gauge shows too few free pages, or if the scan exhausts
    /// `num_bpages` attempts per requested page without finding one.
    pub fn get_pages<LP: Lower<sync::Pool>>(
        &self,
        core_id: usize,
        count: usize,
        out: &mut Vec<usize>,
        set_owner: bool,
        now: u64,
        lease_cycles: u64,
        mut token: LockToken<'_, LP>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self.free_bpages.load(Ordering::Acquire) < count as i64 {
            return Err(Error::ResourceExhausted);
        }
        let mut core = self.cores[core_id].lock();
        let start_len = out.len();
        for _ in 0..count {
            let mut claimed = None;
            for _attempt in 0..self.num_bpages {
                let idx = core.next_candidate % self.num_bpages;
                core.next_candidate = (core.next_candidate + 1) % self.num_bpages;
                let desc = &self.descriptors[idx];
                if desc.is_sentinel() || !desc.eligible(now) {
                    continue;
                }
                let guard = match desc.guard.try_lock(token.token()) {
                    Some(g) => g,
                    None => continue,
                };
                if !desc.eligible(now) {
                    drop(guard);
                    continue;
                }
                let was_owned = desc.owner.load(Ordering::Acquire) != NO_OWNER;
                if was_owned {
                    self.metrics
                        .bpages_stolen
                        .fetch_add(1, Ordering::Relaxed);
                    log::debug!("get_pages: core {core_id} stole expired bpage {idx}");
                }
                desc.refs
                    .store(if set_owner { 2 } else { 1 }, Ordering::Release);
                if set_owner {
                    desc.owner.store(core_id as i32, Ordering::Release);
                    desc.expiration.store(now + lease_cycles, Ordering::Release);
                } else if was_owned {
                    desc.owner.store(NO_OWNER, Ordering::Release);
                }
                drop(guard);
                // Only a page that was genuinely free (no owner) and is
                // being handed out unowned leaves the free count: an
                // owned claim (set_owner) keeps the page out of the
                // reclaimable pool under its new owner rather than the
                // gauge, and a stolen page was never counted as free to
                // begin with (its owner was non-`-1`), so claiming it
                // doesn't change the gauge either. This keeps
                // `free_bpages` symmetric with `release_buffers`, which
                // only credits a release back when the descriptor ends
                // up both ref-free *and* ownerless.
                if !set_owner && !was_owned {
                    self.free_bpages.fetch_sub(1, Ordering::AcqRel);
                }
                claimed = Some(idx);
                break;
            }
            match claimed {
                Some(idx) => out.push(idx),
                None => {
                    out.truncate(start_len);
                    log::warn!(
                        "get_pages: core {core_id} could not find a free bpage after {} attempts",
                        self.num_bpages
                    );
                    return Err(Error::ResourceExhausted);
                }
            }
        }
        Ok(())
    }

    /// `allocate` (spec §4.3): size a per-RPC buffer out of whole bpages
    /// plus, optionally, a shared partial-bpage tail.
    pub fn allocate<P: Peer, Pk: PacketBuffer, LP: Lower<sync::Pool>>(
        &self,
        rpc: &RpcRecord<P, Pk>,
        core_id: usize,
        now: u64,
        lease_cycles: u64,
        mut token: LockToken<'_, LP>,
    ) -> Result<()> {
        if !self.initialized() {
            return Err(Error::ResourceExhausted);
        }
        let length = rpc.with_body(|b| b.msgin.length);
        if length < 0 {
            return Err(Error::MsginInitFailed);
        }
        let length = length as usize;
        let full = length / self.bpage_size;
        let tail = length % self.bpage_size;
        let required = full + if tail > 0 { 1 } else { 0 };
        if self.free_bpages.load(Ordering::Acquire) < required as i64 {
            return Err(Error::ResourceExhausted);
        }

        // `acquired` accumulates absolute byte offsets into the region,
        // matching the units `release_raw`/`release_buffers` and
        // `msgin.bpage_offsets` use throughout; `get_pages` itself deals
        // in bpage indices, so full-page indices are converted here.
        let mut acquired: Vec<usize> = Vec::with_capacity(required);

        if full > 0 {
            let mut full_pages: Vec<usize> = Vec::with_capacity(full);
            if self
                .get_pages(core_id, full, &mut full_pages, false, now, lease_cycles, token.token())
                .is_err()
            {
                self.release_raw(&acquired);
                return Err(Error::ResourceExhausted);
            }
            acquired.extend(full_pages.into_iter().map(|idx| idx * self.bpage_size));
        }

        if tail > 0 {
            if let Some(offset) = self.try_reuse_hint(core_id, tail, now, &mut token) {
                acquired.push(offset);
            } else {
                let mut page = Vec::with_capacity(1);
                if self
                    .get_pages(core_id, 1, &mut page, true, now, lease_cycles, token.token())
                    .is_err()
                {
                    self.release_raw(&acquired);
                    return Err(Error::ResourceExhausted);
                }
                let idx = page[0];
                let mut core = self.cores[core_id].lock();
                core.page_hint = idx;
                core.allocated = tail;
                acquired.push(idx * self.bpage_size);
            }
        }

        rpc.with_body(|b| {
            for offset in &acquired {
                b.msgin.bpage_offsets.push(*offset);
            }
        });
        Ok(())
    }

    /// Try to satisfy a tail allocation by reusing the core's `page_hint`
    /// bpage, matching `homa_pool_allocate`'s reuse path. Returns the
    /// absolute offset on success.
    fn try_reuse_hint<LP: Lower<sync::Pool>>(
        &self,
        core_id: usize,
        tail: usize,
        now: u64,
        token: &mut LockToken<'_, LP>,
    ) -> Option<usize> {
        let (hint, allocated) = {
            let core = self.cores[core_id].lock();
            (core.page_hint, core.allocated)
        };
        let desc = self.descriptors.get(hint)?;
        if desc.owner.load(Ordering::Acquire) != core_id as i32 {
            return None;
        }
        if desc.expiration.load(Ordering::Acquire) <= now {
            return None;
        }
        if allocated + tail > self.bpage_size {
            return None;
        }
        let guard = desc.guard.try_lock(token.token())?;
        if desc.owner.load(Ordering::Acquire) != core_id as i32 {
            drop(guard);
            return None;
        }
        desc.refs.fetch_add(1, Ordering::AcqRel);
        drop(guard);
        self.metrics.bpage_reuses.fetch_add(1, Ordering::Relaxed);
        let mut core = self.cores[core_id].lock();
        let offset = hint * self.bpage_size + core.allocated;
        core.allocated += tail;
        Some(offset)
    }

    /// Unwind partially-acquired bpages on an allocation failure (no lock
    /// token needed: this only decrements refs the caller already owns
    /// exclusively, same as `release_raw`'s callers in `release_buffers`).
    fn release_raw(&self, offsets: &[usize]) {
        for &offset in offsets {
            let idx = offset / self.bpage_size;
            let desc = &self.descriptors[idx];
            let prev = desc.refs.fetch_sub(1, Ordering::AcqRel);
            if prev == 1 && desc.owner.load(Ordering::Acquire) == NO_OWNER {
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// `get_buffer` (spec §4.3): pure arithmetic, no locks.
    pub fn get_buffer<P: Peer, Pk: PacketBuffer>(
        &self,
        rpc: &RpcRecord<P, Pk>,
        offset_into_message: usize,
    ) -> Option<BufferLocation> {
        rpc.with_body(|b| {
            let page_idx = offset_into_message / self.bpage_size;
            let page_offset = b.msgin.bpage_offsets.get(page_idx).copied()?;
            let within = offset_into_message % self.bpage_size;
            let in_page = self.bpage_size - within;
            let remaining_in_message = (b.msgin.length as usize)
                .saturating_sub(offset_into_message);
            let available = in_page.min(remaining_in_message.max(1));
            Some(BufferLocation {
                offset: page_offset + within,
                available,
            })
        })
    }

    /// Absolute address for an offset into the region, for callers that
    /// have real backing memory. `None` if the pool has been destroyed.
    pub fn region_ptr(&self, offset: usize) -> Option<usize> {
        let base = self.region_base.load(Ordering::Acquire);
        if base == 0 {
            None
        } else {
            Some(base + offset)
        }
    }

    /// `release_buffers` (spec §4.3): no-op if the pool's region is null.
    pub fn release_buffers(&self, offsets: &[usize]) {
        if !self.initialized() {
            return;
        }
        for &offset in offsets {
            let idx = offset / self.bpage_size;
            let Some(desc) = self.descriptors.get(idx) else {
                continue;
            };
            let prev = desc.refs.fetch_sub(1, Ordering::AcqRel);
            if prev == 1 && desc.owner.load(Ordering::Acquire) == NO_OWNER {
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CleanLockToken;

    const BPAGE: usize = 64 * 1024;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    #[test]
    fn init_basics() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        assert_eq!(pool.num_bpages(), 100);
        assert!(pool.descriptors[98].owner.load(Ordering::Acquire) == NO_OWNER);
        assert_eq!(pool.free_bpages(), 99);
    }

    #[test]
    fn init_rejects_undersized_region() {
        let err = BufferPool::init(4, BPAGE, 0x1000, 2 * BPAGE - 1, metrics()).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn init_rejects_misaligned_region() {
        let err = BufferPool::init(4, BPAGE, 0x1000 + 1, 4 * BPAGE, metrics()).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn get_pages_basics() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        let mut clean = unsafe { CleanLockToken::new() };
        let mut out = Vec::new();
        pool.get_pages(0, 2, &mut out, false, 0, 0, clean.token())
            .unwrap();
        assert_eq!(out, vec![0, 1]);
        assert_eq!(pool.free_bpages(), 97);
    }

    #[test]
    fn get_pages_not_enough_space() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        pool.free_bpages.store(1, Ordering::Release);
        let mut clean = unsafe { CleanLockToken::new() };
        let mut out = Vec::new();
        assert_eq!(
            pool.get_pages(0, 2, &mut out, false, 0, 0, clean.token()),
            Err(Error::ResourceExhausted)
        );
        pool.free_bpages.store(2, Ordering::Release);
        assert!(pool
            .get_pages(0, 2, &mut out, false, 0, 0, clean.token())
            .is_ok());
    }

    #[test]
    fn get_pages_steals_expired_owner() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        pool.descriptors[0].owner.store(5, Ordering::Release);
        pool.descriptors[0].expiration.store(0, Ordering::Release);
        pool.free_bpages.store(20, Ordering::Release);
        let mut clean = unsafe { CleanLockToken::new() };
        let mut out = Vec::new();
        pool.get_pages(0, 2, &mut out, false, 1, 0, clean.token())
            .unwrap();
        assert_eq!(out, vec![0, 1]);
        assert_eq!(pool.descriptors[0].owner.load(Ordering::Acquire), NO_OWNER);
        assert_eq!(pool.free_bpages(), 19);
    }

    #[test]
    fn get_pages_skips_locked_owned_bpages() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        // Bpage 1 is owned and unexpired: ineligible.
        pool.descriptors[1].owner.store(3, Ordering::Release);
        pool.descriptors[1].expiration.store(1000, Ordering::Release);
        let mut clean = unsafe { CleanLockToken::new() };
        let mut out = Vec::new();
        pool.get_pages(0, 2, &mut out, false, 0, 0, clean.token())
            .unwrap();
        assert_eq!(out, vec![0, 2]);
    }

    #[test]
    fn get_pages_set_owner_bumps_refs_to_two() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        let mut clean = unsafe { CleanLockToken::new() };
        let mut out = Vec::new();
        pool.get_pages(1, 2, &mut out, true, 5000, 1000, clean.token())
            .unwrap();
        for idx in &out {
            assert_eq!(pool.descriptors[*idx].owner.load(Ordering::Acquire), 1);
            assert_eq!(
                pool.descriptors[*idx].expiration.load(Ordering::Acquire),
                6000
            );
            assert_eq!(pool.descriptors[*idx].refs.load(Ordering::Acquire), 2);
        }
    }

    #[test]
    fn release_returns_refs_to_zero() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        let mut clean = unsafe { CleanLockToken::new() };
        let mut a = Vec::new();
        pool.get_pages(0, 2, &mut a, false, 0, 0, clean.token())
            .unwrap();
        let before = pool.free_bpages();
        let offsets: Vec<usize> = a.iter().map(|i| i * BPAGE).collect();
        pool.release_buffers(&offsets);
        assert_eq!(pool.free_bpages(), before + 2);
        for idx in &a {
            assert_eq!(pool.descriptors[*idx].refs.load(Ordering::Acquire), 0);
        }
    }

    #[test]
    fn release_buffers_noop_after_destroy() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        let mut clean = unsafe { CleanLockToken::new() };
        let mut a = Vec::new();
        pool.get_pages(0, 1, &mut a, false, 0, 0, clean.token())
            .unwrap();
        pool.destroy();
        let offsets: Vec<usize> = a.iter().map(|i| i * BPAGE).collect();
        pool.release_buffers(&offsets);
        assert_eq!(pool.descriptors[a[0]].refs.load(Ordering::Acquire), 1);
    }

    #[test]
    fn destroy_is_idempotent() {
        let pool = BufferPool::init(4, BPAGE, 0x1000000, 100 * BPAGE, metrics()).unwrap();
        pool.destroy();
        pool.destroy();
        assert!(!pool.initialized());
    }
}

//! Configuration surface (spec §6).
//!
//! Mirrors the tunables `homa_init()` sets up in `original_source/homa_utils.c`:
//! unscheduled bytes, grant window, link speed, polling interval, priority
//! count, overcommit, incoming-bytes cap, reap batching and the bpage lease.

use core::sync::atomic::{AtomicU32, Ordering};

/// Numeric tunables for a `Socket`/`BufferPool` pair.
///
/// Changing `max_priorities` (or anything that changes derived priority
/// cutoffs) must go through [`Config::bump_cutoff_version`] so peers can be
/// told their cached cutoffs are stale.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bytes granted to a new message before the receiver has to grant
    /// explicitly.
    pub unscheduled_bytes: u32,
    /// Outstanding-grant window in bytes.
    pub grant_window: u32,
    /// Link speed, used to convert byte budgets into cycles.
    pub link_mbps: u32,
    /// Polling interval for the pacer, in microseconds.
    pub poll_usecs: u32,
    /// Number of distinct network priorities available.
    pub max_priorities: u8,
    /// Maximum number of RPCs simultaneously granted ("overcommit").
    pub max_overcommit: u8,
    /// Cap on total incoming (ungranted + granted) bytes across all RPCs.
    pub max_incoming_bytes: u32,
    /// Maximum number of dead-list entries reaped per `reap()` call.
    ///
    /// Production default is 10; test harnesses typically use a much
    /// smaller batch (spec §4.2 mentions 20 in production vs. 3 under
    /// test) to make batching/yielding observable in a handful of calls.
    pub reap_batch: u32,
    /// Soft cap on buffered-but-unreaped outbound packets before other
    /// paths start forcing reap progress.
    pub dead_buffers_limit: u32,
    /// Lease duration for an owned bpage, in microseconds, after which it
    /// becomes eligible for theft by another core.
    pub bpage_lease_usecs: u32,

    cutoff_version: AtomicU32,
}

impl Config {
    /// Defaults taken from spec §6 / `homa_init()`.
    pub fn production_defaults() -> Self {
        Config {
            unscheduled_bytes: 10_000,
            grant_window: 10_000,
            link_mbps: 25_000,
            poll_usecs: 50,
            max_priorities: 8,
            max_overcommit: 8,
            max_incoming_bytes: 400_000,
            reap_batch: 10,
            dead_buffers_limit: 5_000,
            bpage_lease_usecs: 10_000,
            cutoff_version: AtomicU32::new(0),
        }
    }

    /// Smaller batching for tests, matching the production-vs-test split
    /// called out in spec §4.2.
    pub fn test_defaults() -> Self {
        Config {
            reap_batch: 3,
            ..Self::production_defaults()
        }
    }

    /// Current priority-cutoff version, broadcast to peers whenever
    /// priority configuration changes.
    pub fn cutoff_version(&self) -> u32 {
        self.cutoff_version.load(Ordering::Acquire)
    }

    /// Recompute derived priority cutoffs and bump the version seen by
    /// [`Config::cutoff_version`]. Called after `max_priorities` changes.
    pub fn bump_cutoff_version(&self) {
        self.cutoff_version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::production_defaults()
    }
}

/// Free-running counters, analogous to the plain fields Homa increments
/// directly on `struct homa` (e.g. `grant_recalc_count`). Untyped increments
/// only; no percentile/histogram machinery (out of scope per spec §1).
#[derive(Debug, Default)]
pub struct Metrics {
    pub bucket_lock_slow_path: core::sync::atomic::AtomicU64,
    pub bpage_reuses: core::sync::atomic::AtomicU64,
    pub bpages_stolen: core::sync::atomic::AtomicU64,
    pub rpcs_reaped: core::sync::atomic::AtomicU64,
    pub buffers_reaped: core::sync::atomic::AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &core::sync::atomic::AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

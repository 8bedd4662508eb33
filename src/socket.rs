//! Socket: owns the bucket tables, buffer pool and dead list, and drives
//! the RPC lifecycle (spec §2, §4.1, §4.2).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::buffer_pool::BufferPool;
use crate::bucket::{Bucket, BucketGuard, BucketTable};
use crate::config::{Config, Metrics};
use crate::dead_list::DeadList;
use crate::error::{Error, Result};
use crate::external::{GrantScheduler, PacketBuffer, Peer, PeerResolver};
use crate::ids::{IdAllocator, RpcId};
use crate::rpc::{RpcFlags, RpcRecord, RpcState};
use crate::sync::{self, CleanLockToken, LockToken, OrderedMutex};

struct SocketState<P: Peer, Pk: PacketBuffer> {
    active: Vec<Arc<RpcRecord<P, Pk>>>,
    dead: DeadList<P, Pk>,
}

impl<P: Peer, Pk: PacketBuffer> SocketState<P, Pk> {
    fn new() -> Self {
        SocketState {
            active: Vec::new(),
            dead: DeadList::new(),
        }
    }
}

/// Per-socket state: one client bucket table, one server bucket table, one
/// buffer pool, one dead list, a list of active RPCs, and a shutdown flag
/// (spec §2).
pub struct Socket<P: Peer, Pk: PacketBuffer> {
    pub client_table: BucketTable<P, Pk>,
    pub server_table: BucketTable<P, Pk>,
    pub pool: BufferPool,
    pub ids: IdAllocator,
    pub config: Config,
    pub metrics: Arc<Metrics>,
    state: OrderedMutex<sync::Sock, SocketState<P, Pk>>,
    shutdown: AtomicBool,
    protect_count: AtomicU32,
}

/// RAII guard inhibiting `reap` while a diagnostic/snapshot walker iterates
/// the active list (spec §4.2, §5, glossary "protect count"). Generalizes
/// the teacher's `LockToken`/`CleanLockToken` RAII idiom to a plain
/// reference-counted guard since there's no kernel lock-token system to
/// piggyback on outside a kernel build.
pub struct ProtectGuard<'a, P: Peer, Pk: PacketBuffer> {
    sock: &'a Socket<P, Pk>,
}

impl<'a, P: Peer, Pk: PacketBuffer> Drop for ProtectGuard<'a, P, Pk> {
    fn drop(&mut self) {
        self.sock.protect_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<P: Peer, Pk: PacketBuffer> Socket<P, Pk> {
    pub fn new(
        num_buckets: usize,
        num_cores: usize,
        bpage_size: usize,
        region_base: usize,
        region_len: usize,
        config: Config,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let pool = BufferPool::init(num_cores, bpage_size, region_base, region_len, metrics.clone())?;
        Ok(Socket {
            client_table: BucketTable::new(num_buckets),
            server_table: BucketTable::new(num_buckets),
            pool,
            ids: IdAllocator::new(),
            config,
            metrics,
            state: OrderedMutex::new(SocketState::new()),
            shutdown: AtomicBool::new(false),
            protect_count: AtomicU32::new(0),
        })
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        let mut clean = unsafe { CleanLockToken::new() };
        self.state.lock(clean.token()).active.len()
    }

    pub fn dead_count(&self) -> usize {
        let mut clean = unsafe { CleanLockToken::new() };
        self.state.lock(clean.token()).dead.len()
    }

    /// Inhibit `reap` until the returned guard is dropped (spec glossary
    /// "protect count").
    pub fn protect(&self) -> ProtectGuard<'_, P, Pk> {
        self.protect_count.fetch_add(1, Ordering::AcqRel);
        ProtectGuard { sock: self }
    }

    pub fn find_client<'a>(
        &'a self,
        id: RpcId,
        clean: &mut CleanLockToken,
    ) -> Option<(Arc<RpcRecord<P, Pk>>, BucketGuard<'a, P, Pk>)> {
        self.client_table.find_client(id, clean.token())
    }

    pub fn find_server<'a>(
        &'a self,
        id: RpcId,
        dport: u16,
        peer_addr: u32,
        clean: &mut CleanLockToken,
    ) -> Option<(Arc<RpcRecord<P, Pk>>, BucketGuard<'a, P, Pk>)> {
        self.server_table.find_server(id, dport, peer_addr, clean.token())
    }

    /// `new_client` (spec §4.1): allocate a client-initiated RPC, publish
    /// it to the client bucket table and active list, and return it with
    /// its bucket lock still held.
    pub fn new_client<'a, Pr: PeerResolver<P = P>>(
        &'a self,
        dest_addr: u32,
        dport: u16,
        peers: &Pr,
        now: u64,
        timer_ticks_now: u32,
        clean: &mut CleanLockToken,
    ) -> Result<(Arc<RpcRecord<P, Pk>>, BucketGuard<'a, P, Pk>)> {
        let id = self.ids.next_client_id();
        let peer = peers.find(dest_addr)?;
        let bucket_arc = self.client_table.bucket(id);
        let rpc = Arc::new(RpcRecord::new(
            id,
            dport,
            peer,
            bucket_arc,
            RpcState::Outgoing,
            now,
            timer_ticks_now,
        ));

        let (_bucket, mut bguard) = self.client_table.lock(id, clean.token());
        {
            let (list, btoken) = bguard.token_split();
            let mut sock_guard = self.state.lock(btoken);
            if self.shutdown.load(Ordering::Acquire) {
                log::debug!("new_client: id={id:?} observed shutdown under socket lock, dropping");
                return Err(Error::Shutdown);
            }
            list.push(rpc.clone());
            sock_guard.active.push(rpc.clone());
        }
        log::trace!("new_client: published id={id:?} dport={dport}");
        Ok((rpc, bguard))
    }

    /// `new_server` (spec §4.1): resolve or create a server-initiated RPC.
    /// `first_packet_offset` is the wire offset of the packet that
    /// triggered this call; when it's zero and buffers were obtained, the
    /// record is handed off immediately (spec glossary "hand-off").
    #[allow(clippy::too_many_arguments)]
    pub fn new_server<'a, Pr: PeerResolver<P = P>>(
        &'a self,
        peer_addr: u32,
        dport: u16,
        id: RpcId,
        declared_length: i64,
        unsched_bytes: u32,
        core_id: usize,
        now: u64,
        timer_ticks_now: u32,
        first_packet_offset: usize,
        peers: &Pr,
        clean: &mut CleanLockToken,
    ) -> Result<(Arc<RpcRecord<P, Pk>>, bool, BucketGuard<'a, P, Pk>)> {
        let (_bucket, mut bguard) = self.server_table.lock(id, clean.token());

        if let Some(existing) = bguard
            .guard
            .iter()
            .find(|r| r.id == id && r.dport == dport && r.peer.addr() == peer_addr)
            .cloned()
        {
            return Ok((existing, false, bguard));
        }

        let peer = peers.find(peer_addr)?;
        let bucket_arc = self.server_table.bucket(id);
        let rpc = Arc::new(RpcRecord::new(
            id,
            dport,
            peer,
            bucket_arc,
            RpcState::Incoming,
            now,
            timer_ticks_now,
        ));

        self.init_msgin(
            &rpc,
            declared_length,
            unsched_bytes,
            core_id,
            now,
            self.config.bpage_lease_usecs as u64,
            bguard.token(),
        )?;

        {
            let (list, btoken) = bguard.token_split();
            let mut sock_guard = self.state.lock(btoken);
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            list.push(rpc.clone());
            sock_guard.active.push(rpc.clone());

            let got_buffers = rpc.with_body(|b| !b.msgin.bpage_offsets.is_empty());
            if first_packet_offset == 0 && got_buffers {
                rpc.set_flag(RpcFlags::PKTS_READY);
                rpc.wake_interest();
                log::trace!("new_server: hand-off id={id:?} (first packet at offset 0)");
            }
        }
        log::trace!("new_server: created id={id:?} dport={dport} length={declared_length}");
        Ok((rpc, true, bguard))
    }

    /// msgin initialization (spec §4.1 "invoke msgin initialization
    /// (external) with declared length and unscheduled-bytes budget"),
    /// including the buffer acquisition `homa_message_in_init` performs
    /// internally in `original_source`.
    fn init_msgin(
        &self,
        rpc: &RpcRecord<P, Pk>,
        declared_length: i64,
        unsched_bytes: u32,
        core_id: usize,
        now: u64,
        lease_cycles: u64,
        bucket_token: LockToken<'_, sync::Bucket>,
    ) -> Result<()> {
        if declared_length < 0 {
            return Err(Error::MsginInitFailed);
        }
        rpc.with_body(|b| {
            b.msgin.length = declared_length;
            b.msgin.bytes_remaining = declared_length;
            b.msgin.granted = (unsched_bytes as i64).min(declared_length);
        });
        self.pool
            .allocate(rpc, core_id, now, lease_cycles, bucket_token)
            .map_err(|_| Error::MsginInitFailed)
    }

    /// `free` (spec §4.2): make `rpc` unreachable. Must be called with the
    /// bucket list/token the caller obtained `rpc` under (bucket lock
    /// held); the socket must not be locked. No-op if already dead.
    pub fn free<G: GrantScheduler>(
        &self,
        rpc: &Arc<RpcRecord<P, Pk>>,
        grant: &G,
        bucket_list: &mut Vec<Arc<RpcRecord<P, Pk>>>,
        mut bucket_token: LockToken<'_, sync::Bucket>,
    ) {
        if !rpc.mark_dead() {
            return;
        }
        log::debug!("free: id={:?} -> DEAD", rpc.id);

        // Must precede taking the socket lock: the scheduler may itself
        // drop and retake this record's bucket lock (spec §4.2).
        grant.free_rpc(rpc.id);

        {
            let mut sock_guard = self.state.lock(bucket_token.token());
            bucket_list.retain(|r| r.id != rpc.id);
            sock_guard.active.retain(|r| r.id != rpc.id);
            rpc.wake_interest();

            let extra_in = rpc.with_body(|b| {
                if b.msgin.length >= 0 {
                    b.msgin.packets.len_approx() as u32
                } else {
                    0
                }
            });
            let extra_out = rpc.with_body(|b| b.msgout.num_skbs as u32);
            sock_guard
                .dead
                .record_freed_buffers(extra_in + extra_out);
            sock_guard.dead.push(rpc.clone());
        }

        grant.remove_from_throttle(rpc.id);
    }

    /// `reap` (spec §4.2): budgeted, off-critical-path release of dead
    /// RPCs' resources. Returns `true` if more work remains.
    pub fn reap(&self, budget: u32, clean: &mut CleanLockToken) -> bool {
        let mut remaining = budget;
        let mut more_work = false;

        while remaining > 0 {
            let batch_size = remaining.min(self.config.reap_batch).max(1);
            remaining = remaining.saturating_sub(batch_size);

            let mut reaped: Vec<Arc<RpcRecord<P, Pk>>> = Vec::new();
            let mut freed = 0u32;
            let dead_remaining;
            {
                let mut sock_guard = self.state.lock(clean.token());
                if self.protect_count.load(Ordering::Acquire) > 0 {
                    log::trace!("reap: deferring, a walker holds protect_count");
                    return false;
                }

                let mut i = 0;
                while i < sock_guard.dead.len() && freed < batch_size {
                    let rpc = sock_guard.dead.get(i).unwrap().clone();
                    if !rpc.reapable() {
                        i += 1;
                        continue;
                    }
                    rpc.zero_magic();

                    let drained_out = rpc.with_body(|b| {
                        let n = b.msgout.num_skbs.min((batch_size - freed) as usize);
                        b.msgout.num_skbs -= n;
                        n as u32
                    });
                    freed += drained_out;

                    rpc.with_body(|b| while b.msgin.packets.dequeue().is_some() {});

                    let fully_drained = rpc.with_body(|b| b.msgout.num_skbs == 0);
                    if fully_drained {
                        sock_guard.dead.remove(i);
                        reaped.push(rpc);
                    } else {
                        i += 1;
                    }
                }
                sock_guard.dead.record_reaped_buffers(freed);
                dead_remaining = !sock_guard.dead.is_empty();
            }

            self.metrics
                .rpcs_reaped
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
            self.metrics
                .buffers_reaped
                .fetch_add(freed as u64, Ordering::Relaxed);

            for rpc in &reaped {
                // Barrier: acquiring and releasing the bucket lock once
                // synchronizes with any straggler reader still inside a
                // critical section that obtained `rpc` before `free`
                // unlinked it (spec §4.2 rationale).
                let guard = rpc.bucket.rpcs.lock(clean.token());
                drop(guard);

                let offsets = rpc.with_body(|b| core::mem::take(&mut b.msgin.bpage_offsets));
                self.pool.release_buffers(&offsets);
                rpc.with_body(|b| b.msgin.gaps.clear());
            }

            if !reaped.is_empty() || freed > 0 {
                more_work = true;
            }
            if !dead_remaining {
                break;
            }
        }
        log::trace!("reap: budget={budget} more_work={more_work}");
        more_work
    }
}

//! Homa core runtime: the RPC lifecycle/lookup state machine and the
//! zero-copy receive buffer pool (see `SPEC_FULL.md`).
//!
//! `no_std` (`alloc`-using) outside tests, matching the teacher kernel's
//! `#![cfg_attr(not(test), no_std)]` convention so this crate can be
//! embedded in a kernel-style build while still being exercised with
//! ordinary `cargo test`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer_pool;
pub mod bucket;
pub mod config;
pub mod dead_list;
pub mod error;
pub mod external;
pub mod ids;
pub mod rpc;
pub mod socket;
pub mod sync;

pub use buffer_pool::{BufferLocation, BufferPool};
pub use bucket::{Bucket, BucketGuard, BucketTable};
pub use config::{Config, Metrics};
pub use dead_list::DeadList;
pub use error::{Error, Result};
pub use external::{Clock, GrantScheduler, PacketBuffer, PacketPool, Peer, PeerResolver, SocketTable};
pub use ids::{IdAllocator, RpcId};
pub use rpc::{Gap, MsgIn, MsgOut, RpcFlags, RpcRecord, RpcState, LENGTH_UNKNOWN};
pub use socket::{ProtectGuard, Socket};

#[cfg(test)]
mod tests {
    //! Crate-level fixtures and the literal end-to-end scenarios from
    //! spec §8, plus the scenarios original_source/test/unit_homa_pool.c
    //! supplements with.

    extern crate std;

    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use crate::config::Config;
    use crate::error::Error;
    use crate::external::{GrantScheduler, PacketBuffer, Peer, PeerResolver};
    use crate::ids::RpcId;
    use crate::rpc::RpcState;
    use crate::sync::CleanLockToken;
    use crate::Socket;

    const BPAGE: usize = 64 * 1024;

    /// Turns on `log` output (via `env_logger`) for whichever test runs
    /// first; harmless if called more than once.
    fn init_logging() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    #[derive(Debug)]
    struct FakePeer {
        addr: u32,
    }
    impl Peer for FakePeer {
        fn addr(&self) -> u32 {
            self.addr
        }
    }

    struct FakeResolver {
        fail: bool,
    }
    impl PeerResolver for FakeResolver {
        type P = FakePeer;
        fn find(&self, addr: u32) -> crate::Result<Arc<FakePeer>> {
            if self.fail {
                Err(Error::PeerResolutionFailed)
            } else {
                Ok(Arc::new(FakePeer { addr }))
            }
        }
        fn get_all(&self) -> Vec<Arc<FakePeer>> {
            Vec::new()
        }
    }

    #[derive(Debug)]
    struct FakePacket {
        len: usize,
    }
    impl PacketBuffer for FakePacket {
        fn len(&self) -> usize {
            self.len
        }
    }

    #[derive(Default)]
    struct FakeGrantScheduler {
        freed: AtomicU32,
        unthrottled: AtomicU32,
    }
    impl GrantScheduler for FakeGrantScheduler {
        fn free_rpc(&self, _id: RpcId) {
            self.freed.fetch_add(1, Ordering::Relaxed);
        }
        fn remove_from_throttle(&self, _id: RpcId) {
            self.unthrottled.fetch_add(1, Ordering::Relaxed);
        }
        fn check_waiting(&self) {}
    }

    fn fresh_socket() -> Socket<FakePeer, FakePacket> {
        init_logging();
        Socket::new(16, 4, BPAGE, 0x2000_0000, 100 * BPAGE, Config::test_defaults()).unwrap()
    }

    /// Scenario 1 (spec §8): basic pool init.
    #[test]
    fn scenario_basic_pool_init() {
        let sock = fresh_socket();
        assert_eq!(sock.pool.num_bpages(), 100);
        assert_eq!(sock.pool.free_bpages(), 99);
    }

    /// Scenario 3 (spec §8): client ids are distinct and always even.
    #[test]
    fn client_ids_are_distinct_and_even() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let mut clean = unsafe { CleanLockToken::new() };
        let (rpc1, guard1) = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap();
        drop(guard1);
        let (rpc2, guard2) = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap();
        drop(guard2);
        assert!(rpc1.id.is_client());
        assert!(rpc2.id.is_client());
        assert_ne!(rpc1.id, rpc2.id);
    }

    /// Scenario 5 (spec §8): two-phase teardown. Create a client RPC, free
    /// it, reap, and confirm it's gone from both tables and memory-released.
    #[test]
    fn scenario_two_phase_teardown() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let grant = FakeGrantScheduler::default();
        let mut clean = unsafe { CleanLockToken::new() };

        let (rpc, mut guard) = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap();
        let id = rpc.id;
        assert_eq!(sock.active_count(), 1);

        {
            let (list, token) = guard.token_split();
            sock.free(&rpc, &grant, list, token);
        }
        drop(guard);

        assert!(rpc.is_dead());
        assert!(sock.find_client(id, &mut clean).is_none());
        assert_eq!(sock.active_count(), 0);
        assert_eq!(sock.dead_count(), 1);

        drop(rpc);
        let more = sock.reap(10, &mut clean);
        assert!(!more);
        assert_eq!(sock.dead_count(), 0);
        assert!(sock.find_client(id, &mut clean).is_none());
    }

    /// Freeing an already-dead RPC is a no-op (spec §8 round-trip property).
    #[test]
    fn free_of_dead_record_is_noop() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let grant = FakeGrantScheduler::default();
        let mut clean = unsafe { CleanLockToken::new() };

        let (rpc, mut guard) = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap();
        {
            let (list, token) = guard.token_split();
            sock.free(&rpc, &grant, list, token);
        }
        assert_eq!(grant.freed.load(Ordering::Relaxed), 1);
        {
            let (list, token) = guard.token_split();
            sock.free(&rpc, &grant, list, token);
        }
        // free_rpc must not be invoked a second time for an already-dead RPC.
        assert_eq!(grant.freed.load(Ordering::Relaxed), 1);
    }

    /// Scenario 6 (spec §8): shutdown race. No record is published once
    /// shutdown is observed under the socket lock.
    #[test]
    fn scenario_shutdown_race() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let mut clean = unsafe { CleanLockToken::new() };

        sock.begin_shutdown();
        let err = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap_err();
        assert_eq!(err, Error::Shutdown);
        assert_eq!(sock.active_count(), 0);
    }

    #[test]
    fn new_client_propagates_peer_resolution_failure() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: true };
        let mut clean = unsafe { CleanLockToken::new() };
        let err = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap_err();
        assert_eq!(err, Error::PeerResolutionFailed);
    }

    #[test]
    fn new_server_returns_existing_record_with_created_false() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let mut clean = unsafe { CleanLockToken::new() };
        let id = RpcId::new(1);

        let (first, created1, guard1) = sock
            .new_server(0x0100_0001, 80, id, 1000, 10_000, 0, 0, 0, 0, &resolver, &mut clean)
            .unwrap();
        drop(guard1);
        assert!(created1);
        assert_eq!(first.state(), RpcState::Incoming);

        let (second, created2, guard2) = sock
            .new_server(0x0100_0001, 80, id, 1000, 10_000, 0, 0, 0, 0, &resolver, &mut clean)
            .unwrap();
        drop(guard2);
        assert!(!created2);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn new_server_hands_off_when_first_packet_at_offset_zero() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let mut clean = unsafe { CleanLockToken::new() };
        let id = RpcId::new(1);

        let (rpc, _created, guard) = sock
            .new_server(0x0100_0001, 80, id, 1000, 10_000, 0, 0, 0, 0, &resolver, &mut clean)
            .unwrap();
        drop(guard);
        assert!(rpc.flags().contains(crate::RpcFlags::PKTS_READY));
    }

    #[test]
    fn new_server_rejects_negative_declared_length() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let mut clean = unsafe { CleanLockToken::new() };
        let id = RpcId::new(1);

        let err = sock
            .new_server(0x0100_0001, 80, id, -1, 10_000, 0, 0, 0, 0, &resolver, &mut clean)
            .unwrap_err();
        assert_eq!(err, Error::MsginInitFailed);
    }

    #[test]
    fn reap_refuses_while_protected() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let grant = FakeGrantScheduler::default();
        let mut clean = unsafe { CleanLockToken::new() };

        let (rpc, mut guard) = sock
            .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
            .unwrap();
        {
            let (list, token) = guard.token_split();
            sock.free(&rpc, &grant, list, token);
        }
        drop(guard);
        drop(rpc);

        let _protect = sock.protect();
        assert!(!sock.reap(10, &mut clean));
        assert_eq!(sock.dead_count(), 1);
    }

    #[test]
    fn reap_budget_bounds_buffers_freed_per_call() {
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let grant = FakeGrantScheduler::default();
        let mut clean = unsafe { CleanLockToken::new() };

        for _ in 0..5 {
            let (rpc, mut guard) = sock
                .new_client(0x0100_0001, 80, &resolver, 0, 0, &mut clean)
                .unwrap();
            rpc.with_body(|b| b.msgout.num_skbs = 10);
            {
                let (list, token) = guard.token_split();
                sock.free(&rpc, &grant, list, token);
            }
        }

        // Budget 3, batch 3 (test config): first call frees at most 3 skbs.
        let freed_before = sock.metrics.buffers_reaped.load(Ordering::Relaxed);
        sock.reap(3, &mut clean);
        let freed_after = sock.metrics.buffers_reaped.load(Ordering::Relaxed);
        assert!(freed_after - freed_before <= 3);
    }

    #[test]
    fn allocate_release_round_trip_matches_literal_scenario() {
        // Spec §8 scenario 4 numbers, reproduced against a live socket.
        let sock = fresh_socket();
        let resolver = FakeResolver { fail: false };
        let mut clean = unsafe { CleanLockToken::new() };

        let (rpc_a, _c, guard_a) = sock
            .new_server(0x0100_0001, 80, RpcId::new(1), 150000, 10_000, 0, 0, 0, 1, &resolver, &mut clean)
            .unwrap();
        drop(guard_a);
        let (rpc_b, _c, guard_b) = sock
            .new_server(0x0100_0002, 80, RpcId::new(3), 2000, 10_000, 0, 0, 0, 1, &resolver, &mut clean)
            .unwrap();
        drop(guard_b);

        let offsets_a = rpc_a.with_body(|b| b.msgin.bpage_offsets.clone());
        assert_eq!(offsets_a, alloc::vec![0, BPAGE, 2 * BPAGE]);
        let offsets_b = rpc_b.with_body(|b| b.msgin.bpage_offsets.clone());
        assert_eq!(offsets_b, alloc::vec![2 * BPAGE + 18928]);

        sock.pool.release_buffers(&offsets_a);
        assert_eq!(sock.pool.free_bpages(), 99);
    }
}

//! BucketTable and RPC lookup (spec §4.1).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::external::{PacketBuffer, Peer};
use crate::ids::RpcId;
use crate::rpc::RpcRecord;
use crate::sync::{self, LockToken, OrderedMutex, OrderedMutexGuard};

/// One hash bucket: a lock plus the RPCs that hash to it.
///
/// Represented as a plain `Vec` under a spinlock rather than a hand-rolled
/// intrusive singly-linked list — it preserves every lock-discipline rule
/// spec.md §4.1/§5 requires ("all read and write traversals... performed
/// under that bucket's lock", "a found record is returned still locked")
/// without unsafe pointer-chasing.
pub struct Bucket<P: Peer, Pk: PacketBuffer> {
    pub(crate) rpcs: OrderedMutex<sync::Bucket, Vec<Arc<RpcRecord<P, Pk>>>>,
}

impl<P: Peer, Pk: PacketBuffer> Bucket<P, Pk> {
    fn new() -> Self {
        Bucket {
            rpcs: OrderedMutex::new(Vec::new()),
        }
    }
}

/// A guard proving the caller holds a bucket's lock; returned by lookup and
/// publication so the caller can see the record it found/created while
/// still holding that lock, as spec §4.1 requires.
pub struct BucketGuard<'a, P: Peer, Pk: PacketBuffer> {
    pub(crate) guard: OrderedMutexGuard<'a, sync::Bucket, Vec<Arc<RpcRecord<P, Pk>>>>,
}

impl<'a, P: Peer, Pk: PacketBuffer> BucketGuard<'a, P, Pk> {
    pub fn token_split(
        &mut self,
    ) -> (
        &mut Vec<Arc<RpcRecord<P, Pk>>>,
        LockToken<'_, sync::Bucket>,
    ) {
        self.guard.token_split()
    }

    /// A token proving this bucket's lock is held, without touching the
    /// list — used by callers that need to take a lower-priority lock
    /// (e.g. the pool descriptor lock) while the bucket lock is held.
    pub fn token(&mut self) -> LockToken<'_, sync::Bucket> {
        self.guard.token()
    }
}

/// A fixed-cardinality array of hash buckets. Client and server tables use
/// disjoint `BucketTable` instances so a client id and server id with the
/// same numeric value never share a lock (spec §4.1).
pub struct BucketTable<P: Peer, Pk: PacketBuffer> {
    buckets: Vec<Arc<Bucket<P, Pk>>>,
}

impl<P: Peer, Pk: PacketBuffer> BucketTable<P, Pk> {
    pub fn new(num_buckets: usize) -> Self {
        assert!(num_buckets > 0, "BucketTable needs at least one bucket");
        let buckets = (0..num_buckets).map(|_| Arc::new(Bucket::new())).collect();
        BucketTable { buckets }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Deterministic bucket assignment from id (spec §4.1: "typically
    /// `id % num_buckets`").
    pub fn index_of(&self, id: RpcId) -> usize {
        (id.raw() as usize) % self.buckets.len()
    }

    pub fn bucket(&self, id: RpcId) -> Arc<Bucket<P, Pk>> {
        self.buckets[self.index_of(id)].clone()
    }

    /// Lock the bucket for `id`, blocking until available. Lock-ordering
    /// level `L0`, the base level: callers have no other crate lock held
    /// yet (spec §5: bucket is the topmost lock).
    pub fn lock<'a>(
        &self,
        id: RpcId,
        token: LockToken<'a, sync::L0>,
    ) -> (Arc<Bucket<P, Pk>>, BucketGuard<'a, P, Pk>) {
        let bucket = self.bucket(id);
        // SAFETY-free: `OrderedMutex::lock` borrows `bucket`, but we need
        // the guard to outlive this function while keeping `bucket` alive
        // too, so we lock through the Arc's inner reference directly.
        let guard = unsafe { &*(Arc::as_ptr(&bucket)) }.rpcs.lock(token);
        (bucket, BucketGuard { guard })
    }

    /// Find a client-side record by id. Returns the record and the bucket
    /// guard still held, per spec §4.1.
    pub fn find_client<'a>(
        &self,
        id: RpcId,
        token: LockToken<'a, sync::L0>,
    ) -> Option<(Arc<RpcRecord<P, Pk>>, BucketGuard<'a, P, Pk>)> {
        let (_bucket, guard) = self.lock(id, token);
        let found = guard.guard.iter().find(|r| r.id == id).cloned();
        found.map(|rpc| (rpc, guard))
    }

    /// Find a server-side record by `(id, dport, peer addr)`. spec §4.1:
    /// the extra fields disambiguate ids that collide numerically across
    /// distinct peers.
    pub fn find_server<'a>(
        &self,
        id: RpcId,
        dport: u16,
        peer_addr: u32,
        token: LockToken<'a, sync::L0>,
    ) -> Option<(Arc<RpcRecord<P, Pk>>, BucketGuard<'a, P, Pk>)> {
        let (_bucket, guard) = self.lock(id, token);
        let found = guard
            .guard
            .iter()
            .find(|r| r.id == id && r.dport == dport && r.peer.addr() == peer_addr)
            .cloned();
        found.map(|rpc| (rpc, guard))
    }

    /// Remove a record from its bucket's list (called by `free`, under the
    /// bucket lock).
    pub(crate) fn unlink(list: &mut Vec<Arc<RpcRecord<P, Pk>>>, id: RpcId) {
        list.retain(|r| r.id != id);
    }
}

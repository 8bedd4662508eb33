// Adapted from the kernel's `sync::ordered` module, itself adapted from the
// MIT licensed https://github.com/antialize/ordered-locks. The kernel version
// ties lock acquisition to priority-inheritance bookkeeping on a scheduler
// context; this crate has no scheduler, so the phantom-typed level machinery
// is kept and the context-specific payload is dropped. Unlike the kernel
// version (which wraps `spin::Mutex`), the inner lock here is hand-rolled so
// that an Arc-owning guard (`lock_arc`) can be built without relying on
// private layout of a third-party mutex — the kernel's own
// `ArcRwLockWriteGuard` needs exactly this trick for `spin::RwLock`, via
// `as_mut_ptr`/`force_write_unlock`.

//! Compile-time ordering of locks into levels.
//!
//! In order to acquire a lock at level `i`, the caller must hold a
//! [`LockToken`] for some level below `i`. Spec §5 fixes the hierarchy as
//! bucket lock (`Bucket`) → socket lock (`Sock`) → pool descriptor lock
//! (`Pool`); expressing that as `Bucket: Lower<Sock>`, `Sock: Lower<Pool>`
//! turns "acquired out of order" into a compile error instead of a runtime
//! deadlock.

#![allow(dead_code)]

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Lock level marker.
pub trait Level {}

/// `Self` may be held while acquiring a lock at level `O`.
pub trait Lower<O: Level>: Level {}

/// `Self` may only be acquired while holding a lock at level `O` or below.
pub trait Higher<O: Level>: Level {}
impl<A: Level, B: Level> Higher<B> for A where B: Lower<A> {}

/// No locks held.
#[derive(Debug)]
pub struct L0;
/// Bucket lock level.
#[derive(Debug)]
pub struct L1;
/// Socket lock level.
#[derive(Debug)]
pub struct L2;
/// BufferPool descriptor lock level.
#[derive(Debug)]
pub struct L3;

impl Level for L0 {}
impl Level for L1 {}
impl Level for L2 {}
impl Level for L3 {}

impl Lower<L1> for L0 {}
impl Lower<L2> for L0 {}
impl Lower<L3> for L0 {}
impl Lower<L2> for L1 {}
impl Lower<L3> for L1 {}
impl Lower<L3> for L2 {}

/// Aliases matching the spec's own vocabulary (§5 lock hierarchy).
pub type Bucket = L1;
pub type Sock = L2;
pub type Pool = L3;

/// Zero-sized proof that no lock above level `L` is held on the current
/// call stack. Passed by `&mut` so it can't be duplicated behind your back.
pub struct LockToken<'a, L: Level>(PhantomData<&'a mut L>);

impl<'a, L: Level> LockToken<'a, L> {
    /// Reborrow at the same level.
    pub fn token(&mut self) -> LockToken<'_, L> {
        LockToken(PhantomData)
    }

    /// Reborrow at a higher (more-restrictive) level after acquiring a lock.
    pub fn downgrade<LC: Higher<L>>(&mut self) -> LockToken<'_, LC> {
        LockToken(PhantomData)
    }

    fn downgraded<LP: Lower<L>>(_: LockToken<'a, LP>) -> Self {
        LockToken(PhantomData)
    }
}

/// Proof that the calling thread holds no locks from this module at all.
/// Every call chain starts from one.
pub struct CleanLockToken(());

impl CleanLockToken {
    /// Create a zero-level token.
    pub fn token(&mut self) -> LockToken<'_, L0> {
        LockToken(PhantomData)
    }

    /// # Safety
    ///
    /// The caller must not already hold any lock obtained through this
    /// module on the current call stack.
    pub unsafe fn new() -> Self {
        CleanLockToken(())
    }
}

/// A non-blocking, try-acquire-first spinlock primitive (spec §4.3/§9: the
/// bpage descriptor lock is "a try-acquire primitive, not a blocking
/// mutex"). `OrderedMutex::lock` busy-waits on top of this; `try_lock` never
/// waits at all.
struct RawSpinLock(AtomicBool);

impl RawSpinLock {
    const fn new() -> Self {
        RawSpinLock(AtomicBool::new(false))
    }

    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn lock(&self) {
        while !self.try_lock() {
            core::hint::spin_loop();
        }
    }

    /// # Safety
    /// Caller must currently hold the lock.
    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A spinlock whose acquisition is statically ordered relative to other
/// locks via `L`.
pub struct OrderedMutex<L: Level, T: ?Sized> {
    _level: PhantomData<L>,
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<L: Level, T: ?Sized + Send> Send for OrderedMutex<L, T> {}
unsafe impl<L: Level, T: ?Sized + Send> Sync for OrderedMutex<L, T> {}

impl<L: Level, T> OrderedMutex<L, T> {
    pub const fn new(val: T) -> Self {
        OrderedMutex {
            _level: PhantomData,
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Acquire the lock, spinning until it is free. `LP` is the level of
    /// the caller's current token; it must be strictly lower than `L`, so
    /// the type system rejects out-of-order acquisition.
    pub fn lock<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> OrderedMutexGuard<'a, L, T> {
        self.raw.lock();
        OrderedMutexGuard {
            mutex: self,
            lock_token: LockToken::downgraded(lock_token),
        }
    }

    /// Non-blocking acquisition.
    pub fn try_lock<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> Option<OrderedMutexGuard<'a, L, T>> {
        if !self.raw.try_lock() {
            return None;
        }
        Some(OrderedMutexGuard {
            mutex: self,
            lock_token: LockToken::downgraded(lock_token),
        })
    }

    /// Arc-owning, non-blocking acquisition: the returned guard keeps
    /// `owner` alive and may be returned across function boundaries,
    /// matching spec §4.1's "a found record is returned still locked" and
    /// §4.2's contract that the caller later releases the bucket lock.
    /// Generalizes the kernel's `RwLock::write_arc`/`ArcRwLockWriteGuard`.
    pub fn try_lock_arc<Owner, LP: Lower<L>>(
        owner: Arc<Owner>,
        project: impl Fn(&Owner) -> &OrderedMutex<L, T>,
        _lock_token: LockToken<'_, LP>,
    ) -> Option<ArcOrderedMutexGuard<Owner, L, T>> {
        if !project(&owner).raw.try_lock() {
            return None;
        }
        Some(ArcOrderedMutexGuard {
            owner,
            project,
            _level: PhantomData,
        })
    }

    /// Arc-owning, blocking acquisition.
    pub fn lock_arc<Owner, LP: Lower<L>>(
        owner: Arc<Owner>,
        project: impl Fn(&Owner) -> &OrderedMutex<L, T>,
        _lock_token: LockToken<'_, LP>,
    ) -> ArcOrderedMutexGuard<Owner, L, T> {
        project(&owner).raw.lock();
        ArcOrderedMutexGuard {
            owner,
            project,
            _level: PhantomData,
        }
    }
}

impl<L: Level, T: ?Sized + core::fmt::Debug> core::fmt::Debug for OrderedMutex<L, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.raw.try_lock() {
            let r = write!(f, "OrderedMutex {{ data: {:?} }}", unsafe { &*self.data.get() });
            unsafe { self.raw.unlock() };
            r
        } else {
            write!(f, "OrderedMutex {{ <locked> }}")
        }
    }
}

pub struct OrderedMutexGuard<'a, L: Level, T: ?Sized + 'a> {
    mutex: &'a OrderedMutex<L, T>,
    lock_token: LockToken<'a, L>,
}

impl<'a, L: Level, T: ?Sized + 'a> OrderedMutexGuard<'a, L, T> {
    /// Split the guard into the data and a token usable to take further
    /// (lower-priority, i.e. higher-level) locks while this one is held.
    pub fn token_split(&mut self) -> (&mut T, LockToken<'_, L>) {
        (unsafe { &mut *self.mutex.data.get() }, self.lock_token.token())
    }

    /// Just the token half of [`Self::token_split`], for callers that only
    /// need to prove the lock is held (e.g. to take a lower-priority lock)
    /// without touching the guarded data.
    pub fn token(&mut self) -> LockToken<'_, L> {
        self.lock_token.token()
    }
}

impl<'a, L: Level, T: ?Sized + 'a> Deref for OrderedMutexGuard<'a, L, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, L: Level, T: ?Sized + 'a> DerefMut for OrderedMutexGuard<'a, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, L: Level, T: ?Sized + 'a> Drop for OrderedMutexGuard<'a, L, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() };
    }
}

/// An Arc-owning lock guard: holds `owner` alive itself instead of
/// borrowing it, so it can outlive the scope that acquired the lock.
pub struct ArcOrderedMutexGuard<Owner, L: Level, T> {
    owner: Arc<Owner>,
    project: fn(&Owner) -> &OrderedMutex<L, T>,
    _level: PhantomData<L>,
}

// `project` above is a function item type written as `impl Fn...` at the
// call site; Rust infers it down to a concrete, capture-free fn pointer
// whenever the caller passes a plain function/closure literal with no
// captures, which is how every call site in this crate uses it.

impl<Owner, L: Level, T> ArcOrderedMutexGuard<Owner, L, T> {
    pub fn owner(&self) -> &Arc<Owner> {
        &self.owner
    }
}

impl<Owner, L: Level, T> Deref for ArcOrderedMutexGuard<Owner, L, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(self.project)(&self.owner).data.get() }
    }
}

impl<Owner, L: Level, T> DerefMut for ArcOrderedMutexGuard<Owner, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *(self.project)(&self.owner).data.get() }
    }
}

impl<Owner, L: Level, T> Drop for ArcOrderedMutexGuard<Owner, L, T> {
    fn drop(&mut self) {
        unsafe { (self.project)(&self.owner).raw.unlock() };
    }
}

/// This function can only be called if no lock is held by the calling
/// thread.
#[inline]
pub fn check_no_locks(_: LockToken<'_, L0>) {}

//! Epoch-Based Memory Reclamation
//!
//! This module implements the reclamation clock shared by the hash index and
//! the region layout. Each engine owns one [`EpochManager`]; nothing here is a
//! process-wide singleton, so tests and recovery stay hermetic.
//!
//! # How it works
//!
//! 1. A thread "pins" the current global epoch before touching shared data and
//!    gets back a [`Guard`]. Dropping the guard marks the slot inactive again.
//! 2. Retired items are tagged with the global epoch at retirement time and
//!    pushed onto one of three garbage lists (`epoch % 3`).
//! 3. [`EpochManager::try_advance`] moves the global epoch forward only when
//!    every active slot has observed the current epoch. Items tagged `e` are
//!    run once the global epoch reaches `e + 2`, at which point no thread can
//!    still hold a reference obtained before the retirement.
//!
//! Guards must be short-lived. A guard that is never dropped blocks every
//! advance; that condition is surfaced through [`EpochStats`] and a `warn!`
//! from [`EpochManager::bump_and_wait`], never by panicking.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use crossbeam::utils::{Backoff, CachePadded};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Slot value for a thread slot that is not pinned
const FREE: u64 = 0;
/// Low bit of a slot value; the remaining bits hold the pinned epoch
const ACTIVE: u64 = 1;
/// Number of garbage lists
const LISTS: usize = 3;

thread_local! {
    /// Last slot index used by this thread, as a starting point for the scan
    static SLOT_HINT: Cell<usize> = const { Cell::new(0) };
}

/// Configuration for the epoch manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochConfig {
    /// Number of thread slots; bounds the number of simultaneously pinned guards
    pub max_threads: usize,
    /// Pending garbage count at which `defer` opportunistically advances
    pub gc_threshold: usize,
    /// How long `bump_and_wait` waits before reporting a stall
    #[serde(with = "crate::config::duration_millis")]
    pub stall_timeout: Duration,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            max_threads: 256,
            gc_threshold: 1024,
            stall_timeout: Duration::from_secs(5),
        }
    }
}

/// A deferred destructor together with the epoch it was retired in
struct Deferred {
    epoch: u64,
    task: Box<dyn FnOnce() + Send>,
}

/// Point-in-time view of the epoch manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochStats {
    /// Current global epoch
    pub global_epoch: u64,
    /// Oldest epoch recorded by an active guard
    pub oldest_active_epoch: Option<u64>,
    /// Number of currently pinned guards
    pub active_guards: usize,
    /// Items waiting in garbage lists
    pub pending_garbage: usize,
    /// Items freed since creation
    pub reclaimed: u64,
    /// Successful advances
    pub advances: u64,
    /// Advances refused because a guard lagged behind
    pub failed_advances: u64,
    /// `bump_and_wait` calls that timed out
    pub stalls: u64,
    /// Time since the last successful advance
    pub since_last_advance: Duration,
}

/// Epoch-based reclamation clock
pub struct EpochManager {
    /// Monotonic global epoch; `epoch % 3` selects the garbage list
    global: CachePadded<AtomicU64>,
    /// Per-participant (epoch, active) pairs, encoded as `epoch << 1 | ACTIVE`
    slots: Box<[CachePadded<AtomicU64>]>,
    /// Garbage lists indexed by epoch modulo 3
    garbage: [SegQueue<Deferred>; LISTS],
    pending: AtomicUsize,
    reclaimed: AtomicU64,
    advances: AtomicU64,
    failed_advances: AtomicU64,
    stalls: AtomicU64,
    /// Milliseconds since `created` at the last successful advance
    last_advance_ms: AtomicU64,
    created: Instant,
    config: EpochConfig,
}

impl EpochManager {
    /// Create a manager with the given configuration
    pub fn new(config: EpochConfig) -> Self {
        let slot_count = config.max_threads.max(1);
        let slots = (0..slot_count)
            .map(|_| CachePadded::new(AtomicU64::new(FREE)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            global: CachePadded::new(AtomicU64::new(0)),
            slots,
            garbage: [SegQueue::new(), SegQueue::new(), SegQueue::new()],
            pending: AtomicUsize::new(0),
            reclaimed: AtomicU64::new(0),
            advances: AtomicU64::new(0),
            failed_advances: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            last_advance_ms: AtomicU64::new(0),
            created: Instant::now(),
            config,
        }
    }

    /// Current global epoch
    pub fn current(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Number of items waiting for reclamation
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Pin the current epoch
    ///
    /// Claims a free slot, records the global epoch in it and returns a guard
    /// that releases the slot on drop. Spins with backoff if every slot is
    /// taken.
    pub fn pin(&self) -> Guard<'_> {
        let backoff = Backoff::new();
        let n = self.slots.len();
        let start = SLOT_HINT.with(|h| h.get()) % n;

        loop {
            for i in 0..n {
                let idx = (start + i) % n;
                let slot = &self.slots[idx];
                if slot.load(Ordering::Relaxed) != FREE {
                    continue;
                }

                let epoch = self.global.load(Ordering::Relaxed);
                if slot
                    .compare_exchange(FREE, encode(epoch), Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // Publish the pin before any shared pointer is loaded.
                    fence(Ordering::SeqCst);
                    SLOT_HINT.with(|h| h.set(idx));
                    return Guard {
                        manager: self,
                        slot: idx,
                        epoch,
                        _not_send: PhantomData,
                    };
                }
            }
            backoff.snooze();
        }
    }

    /// Try to advance the global epoch
    ///
    /// Succeeds only if every active slot has observed the current epoch.
    /// On success the garbage list that is now two epochs old is run.
    pub fn try_advance(&self) -> bool {
        fence(Ordering::SeqCst);
        let global = self.global.load(Ordering::SeqCst);

        for slot in self.slots.iter() {
            let state = slot.load(Ordering::SeqCst);
            if state & ACTIVE != 0 && decode(state) != global {
                self.failed_advances.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        if self
            .global
            .compare_exchange(global, global + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.failed_advances.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.advances.fetch_add(1, Ordering::Relaxed);
        self.last_advance_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.collect();
        true
    }

    /// Advance the epoch twice, waiting for lagging guards
    ///
    /// When this returns `true`, every guard that was pinned before the call
    /// has been dropped. Returns `false` if `timeout` elapsed first; the stall
    /// is counted and logged.
    pub fn bump_and_wait(&self, timeout: Duration) -> bool {
        let target = self.current() + 2;
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();

        while self.current() < target {
            if self.try_advance() {
                continue;
            }
            if Instant::now() >= deadline {
                self.stalls.fetch_add(1, Ordering::Relaxed);
                let stats = self.stats();
                warn!(
                    global_epoch = stats.global_epoch,
                    oldest_active = ?stats.oldest_active_epoch,
                    active_guards = stats.active_guards,
                    pending_garbage = stats.pending_garbage,
                    "Epoch stall: a pinned guard is blocking reclamation"
                );
                return false;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
        true
    }

    /// Advance until all garbage retired so far has been run, or no progress
    /// can be made
    pub fn flush(&self) {
        for _ in 0..LISTS {
            if self.pending() == 0 || !self.try_advance() {
                break;
            }
        }
    }

    /// Stall timeout from the configuration
    pub fn stall_timeout(&self) -> Duration {
        self.config.stall_timeout
    }

    /// Time since the last successful advance
    pub fn since_last_advance(&self) -> Duration {
        let last = Duration::from_millis(self.last_advance_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Snapshot the manager state
    pub fn stats(&self) -> EpochStats {
        let mut oldest: Option<u64> = None;
        let mut active = 0;
        for slot in self.slots.iter() {
            let state = slot.load(Ordering::Relaxed);
            if state & ACTIVE != 0 {
                active += 1;
                let epoch = decode(state);
                oldest = Some(oldest.map_or(epoch, |o| o.min(epoch)));
            }
        }

        EpochStats {
            global_epoch: self.current(),
            oldest_active_epoch: oldest,
            active_guards: active,
            pending_garbage: self.pending(),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            advances: self.advances.load(Ordering::Relaxed),
            failed_advances: self.failed_advances.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            since_last_advance: self.since_last_advance(),
        }
    }

    fn defer_task(&self, task: Box<dyn FnOnce() + Send>) {
        fence(Ordering::SeqCst);
        let epoch = self.global.load(Ordering::SeqCst);
        self.garbage[(epoch % LISTS as u64) as usize].push(Deferred { epoch, task });

        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= self.config.gc_threshold {
            self.try_advance();
        }
    }

    /// Run every deferred item that is at least two epochs old
    fn collect(&self) {
        let now = self.current();
        if now < 2 {
            return;
        }

        let list = &self.garbage[((now - 2) % LISTS as u64) as usize];
        let mut requeue = Vec::new();
        let mut freed = 0usize;

        for _ in 0..list.len() {
            match list.pop() {
                Some(item) if item.epoch + 2 <= now => {
                    (item.task)();
                    freed += 1;
                }
                Some(item) => requeue.push(item),
                None => break,
            }
        }
        for item in requeue {
            list.push(item);
        }

        if freed > 0 {
            self.pending.fetch_sub(freed, Ordering::Relaxed);
            self.reclaimed.fetch_add(freed as u64, Ordering::Relaxed);
            debug!(epoch = now, freed = freed, "Reclaimed deferred items");
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new(EpochConfig::default())
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // No guard can outlive the manager, so everything left is unreachable.
        for list in &self.garbage {
            while let Some(item) = list.pop() {
                (item.task)();
            }
        }
    }
}

impl std::fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochManager")
            .field("global", &self.current())
            .field("slots", &self.slots.len())
            .field("pending", &self.pending())
            .finish()
    }
}

#[inline]
fn encode(epoch: u64) -> u64 {
    (epoch << 1) | ACTIVE
}

#[inline]
fn decode(state: u64) -> u64 {
    state >> 1
}

/// A pinned epoch
///
/// Keeps the thread's slot active at the epoch observed when pinning; any
/// item retired after that point stays alive until the guard is dropped.
pub struct Guard<'a> {
    manager: &'a EpochManager,
    slot: usize,
    epoch: u64,
    /// Guards are tied to the pinning thread
    _not_send: PhantomData<*const ()>,
}

impl<'a> Guard<'a> {
    /// Epoch recorded when this guard was pinned
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The manager this guard belongs to
    pub fn manager(&self) -> &'a EpochManager {
        self.manager
    }

    /// Defer a function until no pinned thread can observe what it frees
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.manager.defer_task(Box::new(f));
    }

    /// Defer dropping `value`
    pub fn defer_drop<T: Send + 'static>(&self, value: T) {
        self.defer(move || drop(value));
    }

    /// Defer freeing a pointer produced by `Box::into_raw`
    ///
    /// # Safety
    /// `ptr` must come from `Box::into_raw`, must already be unreachable for
    /// threads that pin after this call, and must not be freed elsewhere.
    pub unsafe fn defer_destroy<T: Send + 'static>(&self, ptr: *mut T) {
        let retired = Retired(ptr);
        self.defer(move || {
            let retired = retired;
            // SAFETY: guaranteed by the caller; the epoch protocol ensures no
            // reader still holds the pointer when this runs.
            unsafe { drop(Box::from_raw(retired.0)) };
        });
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.manager.slots[self.slot].store(FREE, Ordering::Release);
    }
}

impl std::fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("slot", &self.slot)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A retired raw pointer travelling to the reclaiming thread
struct Retired<T>(*mut T);

// SAFETY: the pointee is `Send` and ownership moves with the wrapper; only the
// reclaiming closure dereferences it.
unsafe impl<T: Send> Send for Retired<T> {}

/// An atomically replaceable, never-null pointer protected by an epoch manager
///
/// Readers borrow the current value for the lifetime of their guard;
/// replacing it defers the old value instead of freeing it.
pub struct EpochPtr<T> {
    inner: AtomicPtr<T>,
    _owns: PhantomData<Box<T>>,
}

impl<T: Send + 'static> EpochPtr<T> {
    /// Create a pointer holding `value`
    pub fn new(value: T) -> Self {
        Self {
            inner: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _owns: PhantomData,
        }
    }

    /// Borrow the current value
    pub fn load<'g>(&'g self, _guard: &'g Guard<'_>) -> &'g T {
        // SAFETY: the pointer is never null, and a replaced value is only
        // freed after every guard pinned before the replacement is dropped.
        unsafe { &*self.inner.load(Ordering::Acquire) }
    }

    /// Replace the value, deferring the previous one
    pub fn swap(&self, value: T, guard: &Guard<'_>) {
        let new = Box::into_raw(Box::new(value));
        let old = self.inner.swap(new, Ordering::AcqRel);
        // SAFETY: `old` came from `Box::into_raw` and is now unlinked.
        unsafe { guard.defer_destroy(old) };
    }

    /// Replace the value only if it is still `current`
    ///
    /// Returns the rejected value on failure.
    pub fn compare_and_swap(&self, current: &T, value: T, guard: &Guard<'_>) -> Result<(), T> {
        let expected = current as *const T as *mut T;
        let new = Box::into_raw(Box::new(value));
        match self
            .inner
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) => {
                // SAFETY: `old` came from `Box::into_raw` and is now unlinked.
                unsafe { guard.defer_destroy(old) };
                Ok(())
            }
            Err(_) => {
                // SAFETY: `new` was never published.
                Err(*unsafe { Box::from_raw(new) })
            }
        }
    }
}

impl<T> Drop for EpochPtr<T> {
    fn drop(&mut self) {
        let ptr = self.inner.swap(ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            // SAFETY: exclusive access; the value came from `Box::into_raw`.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

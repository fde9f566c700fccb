//! Lock-free hash index
//!
//! Maps keys to the [`LogAddress`] of their current record. The bucket array
//! has a fixed power-of-two size; each bucket is a singly linked chain of
//! immutable entries.
//!
//! Chains are persistent: a change builds a new prefix (copies of the entries
//! in front of the affected one, plus the replacement if any) that links to
//! the unchanged suffix, then installs it with a single CAS on the bucket
//! head. Published entries are never written again, so readers traverse
//! without locks or retries. Unlinked entries are handed to the epoch
//! manager and freed once no guard can still see them.
//!
//! A deleted key may keep a marker entry (invalid, pointing at its Delete
//! record) so that a Set appended earlier but published later cannot bring
//! the key back. Markers are invisible to lookups and iteration.
//!
//! Every method takes a [`Guard`] from the epoch manager that owns this
//! index's reclamation; mixing managers is a use-after-free.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bytes::Bytes;
use crossbeam::utils::Backoff;

use super::address::LogAddress;
use crate::storage::epoch::Guard;

/// An immutable chain link
struct Entry {
    /// High 16 bits of the key hash
    tag: u16,
    key: Bytes,
    address: LogAddress,
    /// False for a delete marker
    valid: bool,
    next: *mut Entry,
}

// SAFETY: entries are immutable after publication and only freed through the
// epoch protocol; the raw `next` link is never dereferenced after free.
unsafe impl Send for Entry {}

/// What the index holds for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Current {
    address: LogAddress,
    valid: bool,
}

/// What a modification decided to do with the key's entry
enum Action {
    Keep,
    Put(LogAddress),
    Mark(LogAddress),
    Remove,
}

/// Result of [`HashIndex::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// Key was absent
    Inserted,
    /// Replaced an older address
    Replaced(LogAddress),
    /// The index already held a newer address; nothing changed
    Superseded(LogAddress),
}

/// Lock-free key → address map
pub struct HashIndex {
    buckets: Box<[AtomicPtr<Entry>]>,
    mask: usize,
    hasher: RandomState,
    len: AtomicUsize,
    markers: AtomicUsize,
}

impl HashIndex {
    /// Create an index with at least `buckets` buckets (rounded up to a power of two)
    pub fn with_buckets(buckets: usize) -> Self {
        let count = buckets.max(1).next_power_of_two();
        let buckets = (0..count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: count - 1,
            hasher: RandomState::new(),
            len: AtomicUsize::new(0),
            markers: AtomicUsize::new(0),
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the index holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of delete markers still chained
    pub fn markers(&self) -> usize {
        self.markers.load(Ordering::Relaxed)
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Average chain length
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.buckets.len() as f64
    }

    fn hash(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    fn bucket(&self, hash: u64) -> &AtomicPtr<Entry> {
        &self.buckets[hash as usize & self.mask]
    }

    /// Current address for `key`
    pub fn lookup(&self, key: &[u8], _guard: &Guard<'_>) -> Option<LogAddress> {
        let hash = self.hash(key);
        let tag = tag_of(hash);
        let mut cur = self.bucket(hash).load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: reachable from a bucket head under a guard; entries are
            // freed only after every guard that could see them is dropped.
            let entry = unsafe { &*cur };
            if entry.tag == tag && entry.key.as_ref() == key {
                return entry.valid.then_some(entry.address);
            }
            cur = entry.next;
        }
        None
    }

    /// Point `key` at `address` unconditionally, returning the previous address
    pub fn upsert(&self, key: Bytes, address: LogAddress, guard: &Guard<'_>) -> Option<LogAddress> {
        live(self.modify(key, guard, |_| Action::Put(address)).0)
    }

    /// Point `key` at `address` unless it already holds a newer one
    ///
    /// Keeps the index in log order when appends for the same key race. A
    /// delete marker counts as a newer address.
    pub fn publish(&self, key: Bytes, address: LogAddress, guard: &Guard<'_>) -> Publish {
        let (previous, applied) = self.modify(key, guard, |current| match current {
            Some(existing) if existing.address > address => Action::Keep,
            _ => Action::Put(address),
        });
        match previous {
            Some(newer) if !applied => Publish::Superseded(newer.address),
            Some(old) if old.valid => Publish::Replaced(old.address),
            _ => Publish::Inserted,
        }
    }

    /// Remove `key` and any marker, returning the address it held
    pub fn remove(&self, key: &[u8], guard: &Guard<'_>) -> Option<LogAddress> {
        let key = Bytes::copy_from_slice(key);
        let (previous, applied) = self.modify(key, guard, |current| match current {
            Some(_) => Action::Remove,
            None => Action::Keep,
        });
        live(previous.filter(|_| applied))
    }

    /// Replace `key` with a delete marker at `at` unless it already holds a
    /// newer address
    ///
    /// Returns the live address the marker replaced.
    pub fn mark_deleted(&self, key: &[u8], at: LogAddress, guard: &Guard<'_>) -> Option<LogAddress> {
        let key = Bytes::copy_from_slice(key);
        let (previous, applied) = self.modify(key, guard, |current| match current {
            Some(existing) if existing.address >= at => Action::Keep,
            _ => Action::Mark(at),
        });
        live(previous.filter(|_| applied))
    }

    /// Drop the delete marker at `at`, if `key` still holds exactly that
    pub fn clear_marker(&self, key: &[u8], at: LogAddress, guard: &Guard<'_>) -> bool {
        let key = Bytes::copy_from_slice(key);
        let marker = Current {
            address: at,
            valid: false,
        };
        self.modify(key, guard, |current| {
            if current == Some(marker) {
                Action::Remove
            } else {
                Action::Keep
            }
        })
        .1
    }

    /// Repoint `key` from `expected` to `new`; fails if the key moved
    pub fn compare_exchange(
        &self,
        key: Bytes,
        expected: LogAddress,
        new: LogAddress,
        guard: &Guard<'_>,
    ) -> bool {
        let expected = Current {
            address: expected,
            valid: true,
        };
        let (_, applied) = self.modify(key, guard, |current| {
            if current == Some(expected) {
                Action::Put(new)
            } else {
                Action::Keep
            }
        });
        applied
    }

    /// Visit every entry
    ///
    /// Each bucket is observed atomically; the walk as a whole is only
    /// consistent if writers are held off.
    pub fn for_each<F>(&self, _guard: &Guard<'_>, mut f: F)
    where
        F: FnMut(&Bytes, LogAddress),
    {
        for bucket in self.buckets.iter() {
            let mut cur = bucket.load(Ordering::Acquire);
            while !cur.is_null() {
                // SAFETY: see `lookup`.
                let entry = unsafe { &*cur };
                if entry.valid {
                    f(&entry.key, entry.address);
                }
                cur = entry.next;
            }
        }
    }

    /// Collect every `(key, address)` pair
    pub fn entries(&self, guard: &Guard<'_>) -> Vec<(Bytes, LogAddress)> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(guard, |k, a| out.push((k.clone(), a)));
        out
    }

    /// Core CAS loop shared by every mutation
    ///
    /// Returns the entry seen when the decision was made and whether the
    /// change was installed.
    fn modify<F>(&self, key: Bytes, guard: &Guard<'_>, mut decide: F) -> (Option<Current>, bool)
    where
        F: FnMut(Option<Current>) -> Action,
    {
        let hash = self.hash(&key);
        let tag = tag_of(hash);
        let bucket = self.bucket(hash);
        let backoff = Backoff::new();
        let mut prefix: Vec<*mut Entry> = Vec::new();

        loop {
            prefix.clear();
            let head = bucket.load(Ordering::Acquire);

            let mut found = ptr::null_mut();
            let mut cur = head;
            while !cur.is_null() {
                // SAFETY: see `lookup`.
                let entry = unsafe { &*cur };
                if entry.tag == tag && entry.key == key {
                    found = cur;
                    break;
                }
                prefix.push(cur);
                cur = entry.next;
            }

            // SAFETY: `found` is reachable under the guard.
            let current = unsafe { found.as_ref() }.map(|e| Current {
                address: e.address,
                valid: e.valid,
            });

            let (address, valid) = match decide(current) {
                Action::Keep => return (current, false),
                Action::Remove if found.is_null() => return (current, false),
                Action::Put(address) => (address, true),
                Action::Mark(address) => (address, false),
                Action::Remove => (LogAddress::NULL, false),
            };
            let removing = address.is_null();

            if found.is_null() {
                // Fresh key: push in front of the unchanged chain.
                let node = Box::into_raw(Box::new(Entry {
                    tag,
                    key: key.clone(),
                    address,
                    valid,
                    next: head,
                }));
                if self.install(bucket, head, node, &[], ptr::null_mut(), guard) {
                    self.account(None, Some(valid));
                    return (None, true);
                }
                // SAFETY: `node` was never published.
                unsafe { drop(Box::from_raw(node)) };
                backoff.spin();
                continue;
            }

            // SAFETY: non-null and reachable under the guard.
            let next = unsafe { (*found).next };
            // `replacement` is what the last prefix copy links to; `fresh`
            // is set when it is a new node this attempt owns.
            let (replacement, fresh) = if removing {
                (next, false)
            } else {
                let node = Box::into_raw(Box::new(Entry {
                    tag,
                    key: key.clone(),
                    address,
                    valid,
                    next,
                }));
                (node, true)
            };

            // Copy the prefix, innermost first, so it ends in `replacement`.
            let mut created = Vec::with_capacity(prefix.len() + 1);
            if fresh {
                created.push(replacement);
            }
            let mut new_head = replacement;
            for &original in prefix.iter().rev() {
                // SAFETY: reachable under the guard.
                let e = unsafe { &*original };
                let copy = Box::into_raw(Box::new(Entry {
                    tag: e.tag,
                    key: e.key.clone(),
                    address: e.address,
                    valid: e.valid,
                    next: new_head,
                }));
                created.push(copy);
                new_head = copy;
            }

            if self.install(bucket, head, new_head, &prefix, found, guard) {
                self.account(current.map(|c| c.valid), (!removing).then_some(valid));
                return (current, true);
            }

            for node in created {
                // SAFETY: none of these nodes were published.
                unsafe { drop(Box::from_raw(node)) };
            }
            backoff.spin();
        }
    }

    /// Adjust the key and marker counts for an installed change
    ///
    /// `before`/`after` are the validity of the key's entry, `None` when
    /// there is no entry.
    fn account(&self, before: Option<bool>, after: Option<bool>) {
        match before {
            Some(true) => self.len.fetch_sub(1, Ordering::Relaxed),
            Some(false) => self.markers.fetch_sub(1, Ordering::Relaxed),
            None => 0,
        };
        match after {
            Some(true) => self.len.fetch_add(1, Ordering::Relaxed),
            Some(false) => self.markers.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };
    }

    /// CAS the bucket head and retire the replaced entries on success
    fn install(
        &self,
        bucket: &AtomicPtr<Entry>,
        head: *mut Entry,
        new_head: *mut Entry,
        prefix: &[*mut Entry],
        found: *mut Entry,
        guard: &Guard<'_>,
    ) -> bool {
        if bucket
            .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        for &old in prefix {
            // SAFETY: unlinked by the CAS above; new readers reach the copy.
            unsafe { guard.defer_destroy(old) };
        }
        if !found.is_null() {
            // SAFETY: as above.
            unsafe { guard.defer_destroy(found) };
        }
        true
    }
}

fn live(current: Option<Current>) -> Option<LogAddress> {
    current.filter(|c| c.valid).map(|c| c.address)
}

fn tag_of(hash: u64) -> u16 {
    (hash >> 48) as u16
}

impl Drop for HashIndex {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut cur = bucket.swap(ptr::null_mut(), Ordering::AcqRel);
            while !cur.is_null() {
                // SAFETY: exclusive access; every chained entry came from
                // `Box::into_raw` and is linked exactly once.
                let entry = unsafe { Box::from_raw(cur) };
                cur = entry.next;
            }
        }
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("len", &self.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

//! Write notification hooks
//!
//! Replication and change-data-capture sit outside the engine and follow it
//! through [`WriteObserver`]: every set and delete is announced before it is
//! logged and again once it is durable in the log and visible in the index.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::hybridlog::LogAddress;

/// Kind of write being announced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Delete,
}

/// A write as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEvent<'a> {
    /// Type of write
    pub op: WriteOp,
    /// Affected key
    pub key: &'a [u8],
    /// New value, `None` for deletes
    pub value: Option<&'a [u8]>,
}

impl<'a> WriteEvent<'a> {
    /// A set of `key` to `value`
    pub fn set(key: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            op: WriteOp::Set,
            key,
            value: Some(value),
        }
    }

    /// A delete of `key`
    pub fn delete(key: &'a [u8]) -> Self {
        Self {
            op: WriteOp::Delete,
            key,
            value: None,
        }
    }
}

/// Receives every write the engine performs
///
/// Callbacks run inline on the writing thread and must not call back into
/// the engine's write path.
pub trait WriteObserver: Send + Sync {
    /// Called before the write is logged
    fn before_write(&self, _event: &WriteEvent<'_>) {}

    /// Called after the write is logged and published at `address`
    ///
    /// Not called for a delete of an absent key or a failed write.
    fn after_write(&self, _event: &WriteEvent<'_>, _address: LogAddress) {}
}

/// The set of observers attached to one engine
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn WriteObserver>>>,
    count: AtomicUsize,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer
    pub fn register(&self, observer: Arc<dyn WriteObserver>) {
        let mut observers = self.observers.write();
        observers.push(observer);
        self.count.store(observers.len(), Ordering::Release);
    }

    /// Number of attached observers
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn before_write(&self, event: &WriteEvent<'_>) {
        if self.is_empty() {
            return;
        }
        for observer in self.observers.read().iter() {
            observer.before_write(event);
        }
    }

    pub(crate) fn after_write(&self, event: &WriteEvent<'_>, address: LogAddress) {
        if self.is_empty() {
            return;
        }
        for observer in self.observers.read().iter() {
            observer.after_write(event, address);
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

//! Bounded allocator of network slots.

use super::slot::{NetworkSlot, MAX_SLOT_INDEX};
use crate::error::{CoreError, Result};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Default upper bound on concurrently attached sandboxes.
pub const DEFAULT_MAX_SLOTS: u32 = 256 * 60;

#[derive(Debug)]
struct PoolInner {
    /// Next never-used index. Indices start at 1.
    next: u32,
    /// Released indices, reused first.
    free: VecDeque<u32>,
    in_use: HashSet<u32>,
}

/// Hands out unique slot indices in `1..=max`.
///
/// Allocation and release are atomic from callers' point of view; an index
/// is never held by two sandboxes at once. `max` is capped at
/// [`MAX_SLOT_INDEX`].
#[derive(Debug)]
pub struct SlotPool {
    max: u32,
    inner: Mutex<PoolInner>,
}

impl SlotPool {
    pub fn new(max: u32) -> Self {
        if max > MAX_SLOT_INDEX {
            tracing::warn!(requested = max, cap = MAX_SLOT_INDEX, "Capping network slot pool");
        }
        Self {
            max: max.min(MAX_SLOT_INDEX),
            inner: Mutex::new(PoolInner {
                next: 1,
                free: VecDeque::new(),
                in_use: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn allocate(&self) -> Result<NetworkSlot> {
        let mut inner = self.lock();
        while let Some(idx) = inner.free.pop_front() {
            // A reserved index may still sit in the free list.
            if inner.in_use.insert(idx) {
                return Ok(NetworkSlot::new(idx));
            }
        }
        while inner.next <= self.max {
            let idx = inner.next;
            inner.next += 1;
            if inner.in_use.insert(idx) {
                return Ok(NetworkSlot::new(idx));
            }
        }
        Err(CoreError::NetworkExhausted(self.max))
    }

    /// Return a slot. Releasing a slot that is not held is ignored.
    pub fn release(&self, slot: NetworkSlot) {
        let mut inner = self.lock();
        if inner.in_use.remove(&slot.idx()) {
            inner.free.push_back(slot.idx());
        } else {
            tracing::warn!(slot = slot.idx(), "Released a network slot that was not allocated");
        }
    }

    /// Mark `slot` as held by something this pool did not hand out.
    ///
    /// Returns false when the index is out of range or already held.
    pub fn reserve(&self, slot: NetworkSlot) -> bool {
        let idx = slot.idx();
        if idx == 0 || idx > self.max {
            return false;
        }
        let mut inner = self.lock();
        if !inner.in_use.insert(idx) {
            return false;
        }
        if idx >= inner.next {
            // Everything skipped over becomes free.
            for skipped in inner.next..idx {
                inner.free.push_back(skipped);
            }
            inner.next = idx + 1;
        }
        true
    }

    pub fn is_held(&self, slot: NetworkSlot) -> bool {
        self.lock().in_use.contains(&slot.idx())
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use.len()
    }

    /// Held indices in ascending order.
    pub fn held(&self) -> BTreeSet<u32> {
        self.lock().in_use.iter().copied().collect()
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SLOTS)
    }
}

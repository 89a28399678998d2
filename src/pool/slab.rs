// Slab - atomic index over append-only storage
//
// Invariants:
// - `request` claims a slot with a single `fetch_add`; a slot that already
//   exists is read without taking any lock.
// - Growth always takes the growth lock. Objects never move once pushed.
// - `reset` takes the growth lock too and must not overlap requests.
//   The frame ring guarantees this by resetting only in `begin_frame`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Slab<T> {
    index: AtomicUsize,
    objects: boxcar::Vec<T>,
    growth: Mutex<()>,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
            objects: boxcar::Vec::new(),
            growth: Mutex::new(()),
        }
    }

    /// Hand out the next object, creating it (and any missing slot below it)
    /// with `create` when the slab has not grown that far yet.
    ///
    /// Every call claims a distinct slot, so concurrent callers never share
    /// an object between resets. A failed `create` leaves its slot empty; the
    /// next request that grows the slab fills it.
    pub fn request<F>(&self, mut create: F) -> Result<&T>
    where
        F: FnMut() -> Result<T>,
    {
        let slot = self.index.fetch_add(1, Ordering::AcqRel);

        if let Some(object) = self.objects.get(slot) {
            return Ok(object);
        }

        let _growth = self.growth.lock();
        while self.objects.count() <= slot {
            self.objects.push(create()?);
        }
        self.objects
            .get(slot)
            .ok_or_else(|| Error::InvalidHandle(format!("slab slot {} missing after growth", slot)))
    }

    /// Run `reset` over every allocated object, then rewind the index so the
    /// next request starts at slot 0.
    pub fn reset_with<F>(&self, reset: F) -> Result<()>
    where
        F: FnOnce(Vec<&T>) -> Result<()>,
    {
        let _growth = self.growth.lock();
        let result = reset(self.iter().collect());
        self.index.store(0, Ordering::Release);
        result
    }

    /// Every object backing the slab, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.objects.iter().map(|(_, object)| object)
    }

    /// Requests made since the last reset.
    pub fn in_use(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Objects currently backing the slab.
    pub fn allocated(&self) -> usize {
        self.objects.count()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

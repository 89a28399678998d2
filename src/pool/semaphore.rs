// Semaphore pool - binary and timeline semaphores for one ring slot
//
// Binary semaphores go back to unsignalled once their wait completes, so they
// are reused in place. Timeline semaphores cannot be rearmed to zero and are
// recreated instead.

use super::Slab;
use crate::backend::{GpuDevice, TimelineSemaphore};
use crate::error::Result;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Slot of a binary semaphore. The handle only changes when a retired
/// semaphore is replaced during `reset`.
struct BinarySlot(AtomicU64);

impl BinarySlot {
    fn new(semaphore: vk::Semaphore) -> Self {
        Self(AtomicU64::new(semaphore.as_raw()))
    }

    fn get(&self) -> vk::Semaphore {
        vk::Semaphore::from_raw(self.0.load(Ordering::Acquire))
    }

    fn replace(&self, semaphore: vk::Semaphore) -> vk::Semaphore {
        vk::Semaphore::from_raw(self.0.swap(semaphore.as_raw(), Ordering::AcqRel))
    }
}

/// Slot of a timeline semaphore, emptied by `reset`. Only the request that
/// claimed the slot and `reset` ever lock it.
type TimelineSlot<D> = Mutex<Option<Arc<TimelineSemaphore<D>>>>;

/// Pooled semaphores of one frame.
///
/// `reset` drops every pooled timeline semaphore and new ones are created on
/// demand, so a frame that requests N timelines creates N native semaphores
/// per use. Timelines handed out after a reset always start from 0.
pub struct SemaphorePool<D: GpuDevice> {
    device: Arc<D>,
    wait_timeout: Duration,
    semaphores: Slab<BinarySlot>,
    timelines: Slab<TimelineSlot<D>>,
    /// Handed out, signalled, never waited on; replaced at the next reset
    retired: Mutex<Vec<vk::Semaphore>>,
    /// Replaced handles, destroyed with the pool once the device is idle
    discarded: Mutex<Vec<vk::Semaphore>>,
}

impl<D: GpuDevice> SemaphorePool<D> {
    pub fn new(device: Arc<D>, wait_timeout: Duration) -> Self {
        Self {
            device,
            wait_timeout,
            semaphores: Slab::new(),
            timelines: Slab::new(),
            retired: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }

    /// Next binary semaphore. Safe to call from any thread.
    pub fn request_semaphore(&self) -> Result<vk::Semaphore> {
        let slot = self.semaphores.request(|| {
            let semaphore = self.create_semaphore()?;
            log::debug!("Created pooled semaphore {:?}", semaphore);
            Ok(BinarySlot::new(semaphore))
        })?;
        Ok(slot.get())
    }

    /// Next timeline semaphore, counting from 0 if it was created since the last reset.
    pub fn request_timeline_semaphore(&self) -> Result<Arc<TimelineSemaphore<D>>> {
        let slot = self.timelines.request(|| Ok(Mutex::new(None)))?;
        let mut current = slot.lock();
        if let Some(timeline) = current.as_ref() {
            return Ok(timeline.clone());
        }
        let timeline = Arc::new(TimelineSemaphore::new(
            self.device.clone(),
            0,
            self.wait_timeout,
        )?);
        *current = Some(timeline.clone());
        Ok(timeline)
    }

    /// Take a binary semaphore out of circulation.
    ///
    /// For a semaphore that was signalled but will never be waited on, which
    /// makes it unusable for another signal. Its slot gets a fresh semaphore
    /// at the next `reset`.
    pub fn retire(&self, semaphore: vk::Semaphore) {
        log::warn!("Retiring pooled semaphore {:?}", semaphore);
        self.retired.lock().push(semaphore);
    }

    /// Rewind both pools, replace retired semaphores and drop the timelines.
    ///
    /// Both slabs are held for the whole reset, so no request can see one
    /// pool cleared and the other not.
    pub fn reset(&self) -> Result<()> {
        self.semaphores.reset_with(|slots| {
            self.replace_retired(&slots)?;
            self.timelines.reset_with(|timelines| {
                let dropped = timelines
                    .into_iter()
                    .filter_map(|slot| slot.lock().take())
                    .count();
                if dropped > 0 {
                    log::trace!("Dropping {} pooled timeline semaphores", dropped);
                }
                Ok(())
            })
        })
    }

    fn replace_retired(&self, slots: &[&BinarySlot]) -> Result<()> {
        let mut retired = self.retired.lock();
        if retired.is_empty() {
            return Ok(());
        }

        for slot in slots {
            let semaphore = slot.get();
            let Some(position) = retired.iter().position(|&r| r == semaphore) else {
                continue;
            };
            // A failure leaves the handle retired for the next reset
            let fresh = self.create_semaphore()?;
            let old = slot.replace(fresh);
            retired.swap_remove(position);
            self.discarded.lock().push(old);
            log::debug!("Replaced retired semaphore {:?} with {:?}", old, fresh);
        }
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        self.device.create_semaphore().map_err(|e| {
            log::error!("Failed to create pooled semaphore: {}", e);
            e
        })
    }

    pub fn semaphores_in_use(&self) -> usize {
        self.semaphores.in_use()
    }

    pub fn timelines_in_use(&self) -> usize {
        self.timelines.in_use()
    }

    /// Semaphores waiting to be replaced at the next reset.
    pub fn retired(&self) -> usize {
        self.retired.lock().len()
    }
}

impl<D: GpuDevice> Drop for SemaphorePool<D> {
    fn drop(&mut self) {
        for slot in self.semaphores.iter() {
            self.device.destroy_semaphore(slot.get());
        }
        for semaphore in self.discarded.get_mut().drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
        // Timelines release themselves once the last holder lets go
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostDevice;
    use std::collections::HashSet;
    use std::thread;

    fn pool(device: &Arc<HostDevice>) -> SemaphorePool<HostDevice> {
        SemaphorePool::new(device.clone(), Duration::from_millis(100))
    }

    #[test]
    fn timeline_after_reset_starts_from_zero() {
        let device = HostDevice::new();
        let pool = pool(&device);

        let before = pool.request_timeline_semaphore().unwrap();
        before.signal(5).unwrap();
        let stale = before.handle();
        drop(before);

        pool.reset().unwrap();
        let after = pool.request_timeline_semaphore().unwrap();
        assert_eq!(after.value(), Some(0));
        assert_ne!(after.handle(), stale);
        assert_eq!(device.stats().timeline_semaphores_destroyed, 1);
    }

    #[test]
    fn binary_semaphores_are_reused_in_place() {
        let device = HostDevice::new();
        let pool = pool(&device);

        let first = pool.request_semaphore().unwrap();
        let second = pool.request_semaphore().unwrap();
        assert_ne!(first, second);

        pool.reset().unwrap();
        assert_eq!(pool.semaphores_in_use(), 0);
        assert_eq!(pool.request_semaphore().unwrap(), first);
        assert_eq!(device.stats().semaphores, 2);
    }

    #[test]
    fn concurrent_requests_yield_distinct_semaphores() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 32;

        let device = HostDevice::new();
        let pool = pool(&device);

        let handles: Vec<vk::Semaphore> = thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| pool.request_semaphore().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(unique.len(), THREADS * PER_THREAD);
        assert_eq!(pool.semaphores_in_use(), THREADS * PER_THREAD);
        assert_eq!(device.stats().semaphores, THREADS * PER_THREAD);
    }

    #[test]
    fn dropping_the_pool_releases_everything() {
        let device = HostDevice::new();
        {
            let pool = pool(&device);
            pool.request_semaphore().unwrap();
            pool.request_timeline_semaphore().unwrap();
        }
        assert_eq!(device.stats().timeline_semaphores_destroyed, 1);
    }

    #[test]
    fn concurrent_requests_after_reset_are_distinct() {
        const THREADS: usize = 6;
        const PER_THREAD: usize = 16;

        let device = HostDevice::new();
        let pool = pool(&device);
        for _ in 0..40 {
            pool.request_semaphore().unwrap();
            pool.request_timeline_semaphore().unwrap();
        }
        pool.reset().unwrap();

        let (binaries, timelines): (Vec<_>, Vec<_>) = thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| {
                                let timeline = pool.request_timeline_semaphore().unwrap();
                                (pool.request_semaphore().unwrap(), timeline.handle())
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .unzip()
        });

        let binaries: HashSet<_> = binaries.into_iter().collect();
        let timelines: HashSet<_> = timelines.into_iter().collect();
        assert_eq!(binaries.len(), THREADS * PER_THREAD);
        assert_eq!(timelines.len(), THREADS * PER_THREAD);
        assert_eq!(device.stats().semaphores, THREADS * PER_THREAD);
    }

    #[test]
    fn retired_semaphore_is_replaced_at_reset() {
        let device = HostDevice::new();
        let pool = pool(&device);

        let stuck = pool.request_semaphore().unwrap();
        let healthy = pool.request_semaphore().unwrap();
        pool.retire(stuck);
        assert_eq!(pool.retired(), 1);

        pool.reset().unwrap();
        assert_eq!(pool.retired(), 0);
        let first = pool.request_semaphore().unwrap();
        assert_ne!(first, stuck);
        assert_eq!(pool.request_semaphore().unwrap(), healthy);
        assert_eq!(device.stats().semaphores, 3);

        // Same slot, same replacement from now on
        pool.reset().unwrap();
        assert_eq!(pool.request_semaphore().unwrap(), first);
    }

    #[test]
    fn failed_replacement_keeps_the_semaphore_retired() {
        let device = HostDevice::new();
        let pool = pool(&device);

        let stuck = pool.request_semaphore().unwrap();
        pool.retire(stuck);

        device.fail_allocations(true);
        assert!(pool.reset().is_err());
        assert_eq!(pool.retired(), 1);

        device.fail_allocations(false);
        pool.reset().unwrap();
        assert_ne!(pool.request_semaphore().unwrap(), stuck);
    }
}

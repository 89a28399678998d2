// Command pool - per-thread command buffer cache
//
// Native command pools are externally synchronised, so every recording thread
// gets its own pool and buffer lists. The per-entry mutex is only contended by
// `reset`. An entry outlives its thread and is handed to the next thread that
// takes over the same slot, so short-lived recording threads do not pile up
// native pools.

use crate::backend::{GpuDevice, QueueFamily};
use crate::error::Result;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;
use thread_local::ThreadLocal;

/// Command buffers one thread has allocated from one queue family.
pub struct CommandPoolData {
    pub primary_index: usize,
    pub secondary_index: usize,
    pool: vk::CommandPool,
    primary: Vec<vk::CommandBuffer>,
    secondary: Vec<vk::CommandBuffer>,
}

impl CommandPoolData {
    fn new(pool: vk::CommandPool) -> Self {
        Self {
            primary_index: 0,
            secondary_index: 0,
            pool,
            primary: Vec::new(),
            secondary: Vec::new(),
        }
    }

    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn allocated(&self, level: vk::CommandBufferLevel) -> usize {
        match level {
            vk::CommandBufferLevel::SECONDARY => self.secondary.len(),
            _ => self.primary.len(),
        }
    }
}

pub struct CommandPool<D: GpuDevice> {
    device: Arc<D>,
    family: QueueFamily,
    entries: ThreadLocal<Mutex<CommandPoolData>>,
}

impl<D: GpuDevice> CommandPool<D> {
    pub fn new(device: Arc<D>, family: QueueFamily) -> Self {
        Self {
            device,
            family,
            entries: ThreadLocal::new(),
        }
    }

    #[inline]
    pub fn family(&self) -> QueueFamily {
        self.family
    }

    /// Hand out the calling thread's next unused command buffer of `level`.
    ///
    /// The buffer stays valid until the next `reset`. A native allocation
    /// failure is logged and returned; the thread's index does not move.
    pub fn request_command_buffer(
        &self,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let entry = self.entry_for_current_thread()?;
        let mut data = entry.lock();
        let CommandPoolData {
            primary_index,
            secondary_index,
            pool,
            primary,
            secondary,
        } = &mut *data;

        let (index, buffers) = match level {
            vk::CommandBufferLevel::SECONDARY => (secondary_index, secondary),
            _ => (primary_index, primary),
        };

        let command_buffer = match buffers.get(*index) {
            Some(&command_buffer) => command_buffer,
            None => {
                let command_buffer = self
                    .device
                    .allocate_command_buffer(*pool, level)
                    .map_err(|e| {
                        log::error!(
                            "Failed to allocate {:?} {} command buffer: {}",
                            level,
                            self.family.name(),
                            e
                        );
                        e
                    })?;
                buffers.push(command_buffer);
                command_buffer
            }
        };
        *index += 1;

        log::trace!(
            "{} pool: {:?} #{} -> {:?}",
            self.family.name(),
            level,
            *index - 1,
            command_buffer
        );
        Ok(command_buffer)
    }

    /// Reset every thread's native pool and rewind both indices.
    ///
    /// Must not overlap `request_command_buffer` on any thread. Every entry is
    /// attempted; the first failure is returned.
    pub fn reset(&self) -> Result<()> {
        let mut result = Ok(());
        for entry in self.entries.iter() {
            let mut data = entry.lock();
            if let Err(e) = self.device.reset_command_pool(data.pool) {
                log::error!(
                    "Failed to reset {} command pool {:?}: {}",
                    self.family.name(),
                    data.pool,
                    e
                );
                if result.is_ok() {
                    result = Err(e);
                }
                continue;
            }
            data.primary_index = 0;
            data.secondary_index = 0;
        }
        result
    }

    /// Threads that have requested at least one buffer.
    pub fn thread_count(&self) -> usize {
        self.entries.iter().count()
    }

    /// Buffers of `level` allocated across all threads.
    pub fn allocated(&self, level: vk::CommandBufferLevel) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.lock().allocated(level))
            .sum()
    }

    fn entry_for_current_thread(&self) -> Result<&Mutex<CommandPoolData>> {
        self.entries.get_or_try(|| {
            let pool = self.device.create_command_pool(self.family).map_err(|e| {
                log::error!("Failed to create {} command pool: {}", self.family.name(), e);
                e
            })?;
            log::debug!(
                "Created {} command pool {:?} for {:?}",
                self.family.name(),
                pool,
                std::thread::current().id()
            );
            Ok(Mutex::new(CommandPoolData::new(pool)))
        })
    }
}

impl<D: GpuDevice> Drop for CommandPool<D> {
    fn drop(&mut self) {
        for entry in self.entries.iter_mut() {
            self.device.destroy_command_pool(entry.get_mut().pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostDevice;
    use crate::error::Error;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    const PRIMARY: vk::CommandBufferLevel = vk::CommandBufferLevel::PRIMARY;
    const SECONDARY: vk::CommandBufferLevel = vk::CommandBufferLevel::SECONDARY;

    #[test]
    fn requests_between_resets_are_distinct() {
        let device = HostDevice::new();
        let pool = CommandPool::new(device.clone(), QueueFamily::Graphics);

        for calls in [1, 3, 5] {
            let handles: HashSet<_> = (0..calls)
                .map(|_| pool.request_command_buffer(PRIMARY).unwrap())
                .collect();
            assert_eq!(handles.len(), calls);
            assert!(pool.allocated(PRIMARY) <= 5);
            pool.reset().unwrap();
        }
        assert_eq!(device.stats().command_buffers, 5);
    }

    #[test]
    fn reset_reuses_first_buffer_without_allocating() {
        let device = HostDevice::new();
        let pool = CommandPool::new(device.clone(), QueueFamily::Compute);

        let first: Vec<_> = (0..4)
            .map(|_| pool.request_command_buffer(PRIMARY).unwrap())
            .collect();
        pool.reset().unwrap();

        assert_eq!(pool.request_command_buffer(PRIMARY).unwrap(), first[0]);
        assert_eq!(pool.request_command_buffer(PRIMARY).unwrap(), first[1]);
        assert_eq!(device.stats().command_buffers, 4);
        assert_eq!(device.stats().command_pools, 1);
    }

    #[test]
    fn reset_makes_buffers_recordable_again() {
        let device = HostDevice::new();
        let pool = CommandPool::new(device.clone(), QueueFamily::Graphics);

        let cb = pool.request_command_buffer(PRIMARY).unwrap();
        device.begin_command_buffer(cb, PRIMARY).unwrap();
        device.end_command_buffer(cb).unwrap();
        pool.reset().unwrap();

        let again = pool.request_command_buffer(PRIMARY).unwrap();
        assert_eq!(again, cb);
        device.begin_command_buffer(again, PRIMARY).unwrap();
    }

    #[test]
    fn levels_are_counted_separately() {
        let device = HostDevice::new();
        let pool = CommandPool::new(device, QueueFamily::Graphics);

        let primary = pool.request_command_buffer(PRIMARY).unwrap();
        let secondary = pool.request_command_buffer(SECONDARY).unwrap();
        assert_ne!(primary, secondary);
        assert_eq!(pool.allocated(PRIMARY), 1);
        assert_eq!(pool.allocated(SECONDARY), 1);
    }

    #[test]
    fn each_thread_gets_its_own_pool() {
        let device = HostDevice::new();
        let pool = CommandPool::new(device.clone(), QueueFamily::Transfer);
        // Keeps every thread alive until all of them have recorded
        let barrier = Barrier::new(4);

        let per_thread: Vec<Vec<vk::CommandBuffer>> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let buffers = (0..3)
                            .map(|_| pool.request_command_buffer(PRIMARY).unwrap())
                            .collect::<Vec<_>>();
                        barrier.wait();
                        buffers
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: HashSet<_> = per_thread.iter().flatten().copied().collect();
        assert_eq!(all.len(), 12);
        assert_eq!(pool.thread_count(), 4);
        assert_eq!(device.stats().command_pools, 4);
    }

    #[test]
    fn allocation_failure_is_reported_and_recoverable() {
        let device = HostDevice::new();
        let pool = CommandPool::new(device.clone(), QueueFamily::Graphics);
        pool.request_command_buffer(PRIMARY).unwrap();

        device.fail_allocations(true);
        assert!(matches!(
            pool.request_command_buffer(PRIMARY),
            Err(Error::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));

        device.fail_allocations(false);
        pool.request_command_buffer(PRIMARY).unwrap();
        assert_eq!(pool.allocated(PRIMARY), 2);
    }

    #[test]
    fn exited_threads_hand_their_pool_on() {
        const THREADS: usize = 8;

        let device = HostDevice::new();
        let pool = CommandPool::new(device.clone(), QueueFamily::Graphics);

        let mut recorded = HashSet::new();
        for _ in 0..THREADS {
            // One short-lived recording thread at a time
            let cb = thread::scope(|s| {
                s.spawn(|| pool.request_command_buffer(PRIMARY).unwrap())
                    .join()
                    .unwrap()
            });
            recorded.insert(cb);
        }

        // An inherited entry keeps its index, so nothing is handed out twice
        assert_eq!(recorded.len(), THREADS);
        assert!(pool.thread_count() < THREADS);
        assert_eq!(device.stats().command_pools, pool.thread_count());

        pool.reset().unwrap();
        assert_eq!(pool.allocated(PRIMARY), THREADS);
    }
}

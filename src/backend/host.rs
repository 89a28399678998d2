// Host device - CPU simulation of the GPU contract
//
// Handles are minted from a counter, timeline semaphores are mutex+condvar
// counters and queue work "executes" by signalling whatever the submission
// asked for. Completion is either immediate or held back until the owner
// retires it, which is how tests play the part of a slow GPU.

use super::{
    timeout_nanos, BufferDesc, DescriptorBinding, DescriptorSet, GpuDevice, QueueFamily,
    Submission,
};
use crate::error::{Error, Result};
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When submitted work counts as finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Signals are applied inside `submit`.
    Immediate,
    /// Signals are applied by `retire_next` / `retire_all`.
    Manual,
}

/// Creation counters, mostly for tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub command_pools: usize,
    pub command_buffers: usize,
    pub fences: usize,
    pub semaphores: usize,
    pub timeline_semaphores: usize,
    pub timeline_semaphores_destroyed: usize,
    pub buffers: usize,
    pub descriptor_sets: usize,
    pub submissions: usize,
}

/// What a queue was asked to do.
#[derive(Clone, Debug)]
pub struct SubmissionRecord {
    pub family: QueueFamily,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<(vk::Semaphore, u64)>,
    pub signals: Vec<(vk::Semaphore, u64)>,
}

#[derive(Default)]
struct Counters {
    command_pools: AtomicUsize,
    command_buffers: AtomicUsize,
    fences: AtomicUsize,
    semaphores: AtomicUsize,
    timeline_semaphores: AtomicUsize,
    timeline_semaphores_destroyed: AtomicUsize,
    buffers: AtomicUsize,
    descriptor_sets: AtomicUsize,
    submissions: AtomicUsize,
}

struct Timeline {
    value: Mutex<u64>,
    reached: Condvar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

struct Pending {
    signals: Vec<(vk::Semaphore, u64)>,
    fence: vk::Fence,
}

pub struct HostDevice {
    completion: Completion,
    next_handle: AtomicU64,
    fail_allocations: AtomicBool,
    timelines: Mutex<HashMap<vk::Semaphore, Arc<Timeline>>>,
    binaries: Mutex<HashSet<vk::Semaphore>>,
    fences: Mutex<HashMap<vk::Fence, bool>>,
    fence_signaled: Condvar,
    command_pools: Mutex<HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>>,
    command_buffers: Mutex<HashMap<vk::CommandBuffer, RecordState>>,
    buffers: Mutex<HashMap<vk::Buffer, Vec<u8>>>,
    descriptor_sets: Mutex<HashSet<vk::DescriptorSet>>,
    pending: Mutex<VecDeque<Pending>>,
    history: Mutex<Vec<SubmissionRecord>>,
    counters: Counters,
}

impl HostDevice {
    /// Device whose queues finish work the moment it is submitted.
    pub fn new() -> Arc<Self> {
        Self::with_completion(Completion::Immediate)
    }

    /// Device whose queues only finish work when told to.
    pub fn manual() -> Arc<Self> {
        Self::with_completion(Completion::Manual)
    }

    pub fn with_completion(completion: Completion) -> Arc<Self> {
        log::info!("Creating host device ({:?} completion)", completion);
        Arc::new(Self {
            completion,
            next_handle: AtomicU64::new(1),
            fail_allocations: AtomicBool::new(false),
            timelines: Mutex::new(HashMap::new()),
            binaries: Mutex::new(HashSet::new()),
            fences: Mutex::new(HashMap::new()),
            fence_signaled: Condvar::new(),
            command_pools: Mutex::new(HashMap::new()),
            command_buffers: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            descriptor_sets: Mutex::new(HashSet::new()),
            pending: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Make every subsequent object creation fail with out-of-memory.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Release);
    }

    /// Finish the oldest outstanding submission. Returns false if none was pending.
    pub fn retire_next(&self) -> bool {
        let next = self.pending.lock().pop_front();
        match next {
            Some(pending) => {
                self.complete(&pending);
                true
            }
            None => false,
        }
    }

    /// Finish every outstanding submission, oldest first.
    pub fn retire_all(&self) -> usize {
        let mut retired = 0;
        while self.retire_next() {
            retired += 1;
        }
        retired
    }

    pub fn pending_submissions(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.history.lock().clone()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.buffers.lock().get(&buffer).cloned()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.fences.lock().get(&fence).copied()
    }

    pub fn stats(&self) -> HostStats {
        let c = &self.counters;
        HostStats {
            command_pools: c.command_pools.load(Ordering::Relaxed),
            command_buffers: c.command_buffers.load(Ordering::Relaxed),
            fences: c.fences.load(Ordering::Relaxed),
            semaphores: c.semaphores.load(Ordering::Relaxed),
            timeline_semaphores: c.timeline_semaphores.load(Ordering::Relaxed),
            timeline_semaphores_destroyed: c.timeline_semaphores_destroyed.load(Ordering::Relaxed),
            buffers: c.buffers.load(Ordering::Relaxed),
            descriptor_sets: c.descriptor_sets.load(Ordering::Relaxed),
            submissions: c.submissions.load(Ordering::Relaxed),
        }
    }

    fn mint<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn check_allocation(&self) -> Result<()> {
        if self.fail_allocations.load(Ordering::Acquire) {
            Err(Error::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        } else {
            Ok(())
        }
    }

    fn timeline(&self, semaphore: vk::Semaphore) -> Result<Arc<Timeline>> {
        self.timelines
            .lock()
            .get(&semaphore)
            .cloned()
            .ok_or_else(|| Error::InvalidHandle(format!("timeline semaphore {:?}", semaphore)))
    }

    fn is_known_semaphore(&self, semaphore: vk::Semaphore) -> bool {
        self.timelines.lock().contains_key(&semaphore) || self.binaries.lock().contains(&semaphore)
    }

    fn complete(&self, pending: &Pending) {
        for &(semaphore, value) in &pending.signals {
            // Binary semaphores carry no host-visible state here
            if let Ok(timeline) = self.timeline(semaphore) {
                let mut current = timeline.value.lock();
                if value > *current {
                    *current = value;
                } else {
                    log::warn!(
                        "Submission signals {:?} to {} but it is already at {}",
                        semaphore,
                        value,
                        *current
                    );
                }
                timeline.reached.notify_all();
            }
        }

        if pending.fence != vk::Fence::null() {
            if let Some(signaled) = self.fences.lock().get_mut(&pending.fence) {
                *signaled = true;
            }
            self.fence_signaled.notify_all();
        }
    }
}

impl GpuDevice for HostDevice {
    fn create_command_pool(&self, family: QueueFamily) -> Result<vk::CommandPool> {
        self.check_allocation()?;
        let pool: vk::CommandPool = self.mint();
        self.command_pools.lock().insert(pool, Vec::new());
        self.counters.command_pools.fetch_add(1, Ordering::Relaxed);
        log::debug!("Host: created {} command pool {:?}", family.name(), pool);
        Ok(pool)
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        self.check_allocation()?;
        let buffer: vk::CommandBuffer = self.mint();
        self.command_pools
            .lock()
            .get_mut(&pool)
            .ok_or_else(|| Error::InvalidHandle(format!("command pool {:?}", pool)))?
            .push(buffer);
        self.command_buffers.lock().insert(buffer, RecordState::Initial);
        self.counters.command_buffers.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        let pools = self.command_pools.lock();
        let buffers = pools
            .get(&pool)
            .ok_or_else(|| Error::InvalidHandle(format!("command pool {:?}", pool)))?;
        let mut states = self.command_buffers.lock();
        for buffer in buffers {
            states.insert(*buffer, RecordState::Initial);
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Some(buffers) = self.command_pools.lock().remove(&pool) {
            let mut states = self.command_buffers.lock();
            for buffer in buffers {
                states.remove(&buffer);
            }
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _level: vk::CommandBufferLevel,
    ) -> Result<()> {
        let mut states = self.command_buffers.lock();
        match states.get_mut(&command_buffer) {
            Some(state) if *state == RecordState::Initial => {
                *state = RecordState::Recording;
                Ok(())
            }
            Some(state) => Err(Error::InvalidHandle(format!(
                "command buffer {:?} cannot begin from {:?}",
                command_buffer, state
            ))),
            None => Err(Error::InvalidHandle(format!("command buffer {:?}", command_buffer))),
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut states = self.command_buffers.lock();
        match states.get_mut(&command_buffer) {
            Some(state) if *state == RecordState::Recording => {
                *state = RecordState::Executable;
                Ok(())
            }
            Some(state) => Err(Error::InvalidHandle(format!(
                "command buffer {:?} cannot end from {:?}",
                command_buffer, state
            ))),
            None => Err(Error::InvalidHandle(format!("command buffer {:?}", command_buffer))),
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        self.check_allocation()?;
        let fence: vk::Fence = self.mint();
        self.fences.lock().insert(fence, signaled);
        self.counters.fences.fetch_add(1, Ordering::Relaxed);
        Ok(fence)
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        let mut states = self.fences.lock();
        for fence in fences {
            match states.get_mut(fence) {
                Some(signaled) => *signaled = false,
                None => return Err(Error::InvalidHandle(format!("fence {:?}", fence))),
            }
        }
        Ok(())
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut states = self.fences.lock();
        loop {
            let mut all_signaled = true;
            for fence in fences {
                match states.get(fence) {
                    Some(true) => {}
                    Some(false) => all_signaled = false,
                    None => return Err(Error::InvalidHandle(format!("fence {:?}", fence))),
                }
            }
            if all_signaled {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut states, deadline).timed_out() {
                        return Err(Error::Vulkan(vk::Result::TIMEOUT));
                    }
                }
                None => self.fence_signaled.wait(&mut states),
            }
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.lock().remove(&fence);
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        self.check_allocation()?;
        let semaphore: vk::Semaphore = self.mint();
        self.binaries.lock().insert(semaphore);
        self.counters.semaphores.fetch_add(1, Ordering::Relaxed);
        Ok(semaphore)
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        self.check_allocation()?;
        let semaphore: vk::Semaphore = self.mint();
        let timeline = Arc::new(Timeline {
            value: Mutex::new(initial_value),
            reached: Condvar::new(),
        });
        self.timelines.lock().insert(semaphore, timeline);
        self.counters.timeline_semaphores.fetch_add(1, Ordering::Relaxed);
        Ok(semaphore)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let timeline = self.timeline(semaphore)?;
        let mut current = timeline.value.lock();
        if value <= *current {
            return Err(Error::NonMonotonicSignal {
                current: *current,
                requested: value,
            });
        }
        *current = value;
        timeline.reached.notify_all();
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Duration,
    ) -> Result<()> {
        let timeline = self.timeline(semaphore)?;
        let deadline = Instant::now().checked_add(timeout);
        let mut current = timeline.value.lock();
        while *current < value {
            match deadline {
                Some(deadline) => {
                    if timeline.reached.wait_until(&mut current, deadline).timed_out()
                        && *current < value
                    {
                        log::trace!(
                            "Host: wait for {:?} >= {} timed out after {}ns",
                            semaphore,
                            value,
                            timeout_nanos(timeout)
                        );
                        return Err(Error::Vulkan(vk::Result::TIMEOUT));
                    }
                }
                None => timeline.reached.wait(&mut current),
            }
        }
        Ok(())
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        let timeline = self.timeline(semaphore)?;
        let value = *timeline.value.lock();
        Ok(value)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        if self.timelines.lock().remove(&semaphore).is_some() {
            self.counters
                .timeline_semaphores_destroyed
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.binaries.lock().remove(&semaphore);
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        self.check_allocation()?;
        let size = usize::try_from(desc.size)
            .map_err(|_| Error::InvalidHandle(format!("buffer size {}", desc.size)))?;
        let buffer: vk::Buffer = self.mint();
        self.buffers.lock().insert(buffer, vec![0; size]);
        self.counters.buffers.fetch_add(1, Ordering::Relaxed);
        log::debug!("Host: created buffer '{}' ({} bytes)", desc.label, desc.size);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let contents = buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let size = contents.len() as u64;
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::OutOfRange { offset, len, size });
        }
        let start = offset as usize;
        contents[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.buffers.lock().remove(&buffer);
    }

    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSet> {
        self.check_allocation()?;
        {
            let buffers = self.buffers.lock();
            if let Some(missing) = bindings.iter().find(|b| !buffers.contains_key(&b.buffer)) {
                return Err(Error::InvalidHandle(format!(
                    "descriptor binding {} refers to unknown buffer {:?}",
                    missing.binding, missing.buffer
                )));
            }
        }
        let set = DescriptorSet {
            pool: self.mint(),
            layout: self.mint(),
            set: self.mint(),
        };
        self.descriptor_sets.lock().insert(set.set);
        self.counters.descriptor_sets.fetch_add(1, Ordering::Relaxed);
        Ok(set)
    }

    fn destroy_descriptor_set(&self, set: &DescriptorSet) {
        self.descriptor_sets.lock().remove(&set.set);
    }

    fn submit(&self, family: QueueFamily, submission: &Submission<'_>) -> Result<()> {
        {
            let mut states = self.command_buffers.lock();
            for buffer in submission.command_buffers {
                match states.get_mut(buffer) {
                    Some(state) if *state == RecordState::Executable => {
                        *state = RecordState::Submitted
                    }
                    Some(state) => {
                        return Err(Error::InvalidHandle(format!(
                            "command buffer {:?} submitted while {:?}",
                            buffer, state
                        )))
                    }
                    None => {
                        return Err(Error::InvalidHandle(format!("command buffer {:?}", buffer)))
                    }
                }
            }
        }

        for op in submission.waits.iter().chain(submission.signals) {
            if !self.is_known_semaphore(op.semaphore) {
                return Err(Error::InvalidHandle(format!("semaphore {:?}", op.semaphore)));
            }
        }

        let signals: Vec<_> = submission
            .signals
            .iter()
            .map(|s| (s.semaphore, s.value))
            .collect();

        self.history.lock().push(SubmissionRecord {
            family,
            command_buffers: submission.command_buffers.to_vec(),
            waits: submission
                .waits
                .iter()
                .map(|w| (w.semaphore, w.value))
                .collect(),
            signals: signals.clone(),
        });
        self.counters.submissions.fetch_add(1, Ordering::Relaxed);

        let pending = Pending {
            signals,
            fence: submission.fence,
        };
        match self.completion {
            Completion::Immediate => self.complete(&pending),
            Completion::Manual => self.pending.lock().push_back(pending),
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        // Nothing else will retire manual work once the owner is shutting down
        self.retire_all();
        Ok(())
    }
}

// Backend module - GPU device seam
//
// Design: the pools and frames only ever talk to a `GpuDevice`. Handles are
// plain ash `vk::*` values so the Vulkan backend is zero-cost, and the host
// backend mints them from a counter.

pub mod buffer;
pub mod device;
pub mod host;
pub mod sync;

pub use buffer::GpuBuffer;
pub use device::VulkanDevice;
pub use host::HostDevice;
pub use sync::TimelineSemaphore;

use crate::error::Result;
use ash::vk;
use std::time::Duration;

/// Queue families a frame records work for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueFamily {
    Graphics,
    Compute,
    Transfer,
}

impl QueueFamily {
    /// Submission order within a frame: uploads first, presentation-bound work last.
    pub const ALL: [QueueFamily; 3] = [
        QueueFamily::Transfer,
        QueueFamily::Compute,
        QueueFamily::Graphics,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QueueFamily::Graphics => "graphics",
            QueueFamily::Compute => "compute",
            QueueFamily::Transfer => "transfer",
        }
    }
}

/// One semaphore operation of a submission. `value` is ignored for binary semaphores.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags,
}

impl SemaphoreSubmit {
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            value: 0,
            stage,
        }
    }

    pub fn timeline(semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            value,
            stage,
        }
    }
}

/// A batch handed to one queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [SemaphoreSubmit],
    pub signals: &'a [SemaphoreSubmit],
    /// `vk::Fence::null()` when no fence is wanted
    pub fence: vk::Fence,
}

/// Host-visible buffer request.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// A whole-buffer binding inside a descriptor set.
#[derive(Clone, Copy, Debug)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub range: vk::DeviceSize,
}

/// A descriptor set together with the pool and layout it was carved from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    pub pool: vk::DescriptorPool,
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

/// The Device/Queue collaborator.
///
/// Implementations must be callable from any thread. Queue access is
/// synchronised by the implementation; command pools are not, which is why
/// `CommandPool` keeps one native pool per recording thread.
pub trait GpuDevice: Send + Sync + 'static {
    // Commands
    fn create_command_pool(&self, family: QueueFamily) -> Result<vk::CommandPool>;
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
    ) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    // Fences
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    // Semaphores
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()>;
    /// Blocks until the counter reaches `value`. Expiry is `Error::Vulkan(vk::Result::TIMEOUT)`.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout: Duration)
        -> Result<()>;
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Frame-local memory
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer>;
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSet>;
    fn destroy_descriptor_set(&self, set: &DescriptorSet);

    // Queues
    fn submit(&self, family: QueueFamily, submission: &Submission<'_>) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}

/// Nanoseconds for Vulkan wait calls, saturating instead of wrapping.
pub(crate) fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

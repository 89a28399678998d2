// Render frame - one slot of the frame ring
//
// Owns every short-lived object a frame uses: command pools per queue family,
// fence and semaphore pools, frame-local buffers and their descriptor sets.
// A timeline semaphore gates reuse: `reset` waits for the last value this
// slot's submissions signal before anything is recycled.

use crate::backend::buffer::{CameraUniform, DrawRecord, MaterialRecord, TransformRecord};
use crate::backend::{
    DescriptorBinding, DescriptorSet, GpuBuffer, GpuDevice, QueueFamily, SemaphoreSubmit,
    Submission, TimelineSemaphore,
};
use crate::config::BufferConfig;
use crate::error::Result;
use crate::pool::{CommandPool, FencePool, SemaphorePool};
use ash::vk;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Record capacities of the frame-local buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSizes {
    pub draws: usize,
    pub transforms: usize,
    pub materials: usize,
}

impl From<&BufferConfig> for FrameSizes {
    fn from(config: &BufferConfig) -> Self {
        Self {
            draws: config.max_draws,
            transforms: config.max_transforms,
            materials: config.max_materials,
        }
    }
}

impl Default for FrameSizes {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}

/// Host-written data the shaders read this frame.
pub struct FrameBuffers<D: GpuDevice> {
    pub draws: GpuBuffer<D, DrawRecord>,
    pub transforms: GpuBuffer<D, TransformRecord>,
    pub materials: GpuBuffer<D, MaterialRecord>,
    pub camera: GpuBuffer<D, CameraUniform>,
}

impl<D: GpuDevice> FrameBuffers<D> {
    fn new(device: &Arc<D>, index: usize, sizes: &FrameSizes) -> Result<Self> {
        let storage = vk::BufferUsageFlags::STORAGE_BUFFER;
        Ok(Self {
            draws: GpuBuffer::new(device.clone(), &format!("frame{}-draws", index), sizes.draws, storage)?,
            transforms: GpuBuffer::new(
                device.clone(),
                &format!("frame{}-transforms", index),
                sizes.transforms,
                storage,
            )?,
            materials: GpuBuffer::new(
                device.clone(),
                &format!("frame{}-materials", index),
                sizes.materials,
                storage,
            )?,
            camera: GpuBuffer::new(
                device.clone(),
                &format!("frame{}-camera", index),
                1,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?,
        })
    }
}

/// Set 0 binds the storage buffers (draws, transforms, materials), set 1 the camera.
pub struct FrameDescriptors<D: GpuDevice> {
    device: Arc<D>,
    pub storage: DescriptorSet,
    pub camera: DescriptorSet,
}

impl<D: GpuDevice> FrameDescriptors<D> {
    fn new(device: &Arc<D>, buffers: &FrameBuffers<D>) -> Result<Self> {
        let storage_binding = |binding, buffer: vk::Buffer, range| DescriptorBinding {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            buffer,
            range,
        };
        let storage = device
            .create_descriptor_set(&[
                storage_binding(0, buffers.draws.handle(), buffers.draws.size_bytes()),
                storage_binding(1, buffers.transforms.handle(), buffers.transforms.size_bytes()),
                storage_binding(2, buffers.materials.handle(), buffers.materials.size_bytes()),
            ])
            .map_err(|e| {
                log::error!("Failed to create storage descriptor set: {}", e);
                e
            })?;

        let camera = device.create_descriptor_set(&[DescriptorBinding {
            binding: 0,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            buffer: buffers.camera.handle(),
            range: buffers.camera.size_bytes(),
        }]);
        let camera = match camera {
            Ok(camera) => camera,
            Err(e) => {
                log::error!("Failed to create camera descriptor set: {}", e);
                device.destroy_descriptor_set(&storage);
                return Err(e);
            }
        };

        Ok(Self {
            device: device.clone(),
            storage,
            camera,
        })
    }
}

impl<D: GpuDevice> Drop for FrameDescriptors<D> {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set(&self.camera);
        self.device.destroy_descriptor_set(&self.storage);
    }
}

/// Binary semaphores tying a frame's graphics work to presentation.
#[derive(Clone, Copy, Debug)]
pub struct PresentSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

pub struct RenderFrame<D: GpuDevice> {
    index: usize,
    device: Arc<D>,
    wait_timeout: Duration,
    timeline: TimelineSemaphore<D>,
    /// Last timeline value signalled by this slot's submissions
    submitted: AtomicU64,
    semaphores: SemaphorePool<D>,
    fences: FencePool<D>,
    graphics: CommandPool<D>,
    compute: CommandPool<D>,
    transfer: CommandPool<D>,
    queued: Mutex<Vec<(QueueFamily, vk::CommandBuffer)>>,
    // Sets are released before the buffers they point at
    descriptors: FrameDescriptors<D>,
    buffers: FrameBuffers<D>,
}

impl<D: GpuDevice> RenderFrame<D> {
    pub fn new(
        device: Arc<D>,
        index: usize,
        sizes: &FrameSizes,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let timeline = TimelineSemaphore::new(device.clone(), 0, wait_timeout)?;
        let buffers = FrameBuffers::new(&device, index, sizes)?;
        let descriptors = FrameDescriptors::new(&device, &buffers)?;

        log::info!(
            "Created render frame {} ({} draws, {} transforms, {} materials)",
            index,
            sizes.draws,
            sizes.transforms,
            sizes.materials
        );

        Ok(Self {
            index,
            wait_timeout,
            timeline,
            submitted: AtomicU64::new(0),
            semaphores: SemaphorePool::new(device.clone(), wait_timeout),
            fences: FencePool::new(device.clone()),
            graphics: CommandPool::new(device.clone(), QueueFamily::Graphics),
            compute: CommandPool::new(device.clone(), QueueFamily::Compute),
            transfer: CommandPool::new(device.clone(), QueueFamily::Transfer),
            queued: Mutex::new(Vec::new()),
            descriptors,
            buffers,
            device,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Block until the GPU has retired this slot's previous use, then recycle
    /// every pooled object.
    ///
    /// Must run before anything in the frame is touched and never while
    /// tasks are still requesting from its pools.
    pub fn reset(&self) -> Result<()> {
        let target = self.submitted.load(Ordering::Acquire);
        if target > 0 {
            log::trace!("Frame {}: waiting for timeline value {}", self.index, target);
            self.timeline.wait(target)?;
        }

        self.semaphores.reset()?;
        self.fences.reset()?;
        for pool in [&self.graphics, &self.compute, &self.transfer] {
            pool.reset()?;
        }

        let stale = std::mem::take(&mut *self.queued.lock());
        if !stale.is_empty() {
            log::warn!(
                "Frame {}: dropping {} command buffers that were never submitted",
                self.index,
                stale.len()
            );
        }
        Ok(())
    }

    pub fn command_pool(&self, family: QueueFamily) -> &CommandPool<D> {
        match family {
            QueueFamily::Graphics => &self.graphics,
            QueueFamily::Compute => &self.compute,
            QueueFamily::Transfer => &self.transfer,
        }
    }

    /// The calling thread's next command buffer for `family`.
    pub fn request_command_buffer(
        &self,
        family: QueueFamily,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        self.command_pool(family).request_command_buffer(level)
    }

    pub fn request_semaphore(&self) -> Result<vk::Semaphore> {
        self.semaphores.request_semaphore()
    }

    pub fn request_timeline_semaphore(&self) -> Result<Arc<TimelineSemaphore<D>>> {
        self.semaphores.request_timeline_semaphore()
    }

    pub fn request_fence(&self) -> Result<vk::Fence> {
        self.fences.request_fence()
    }

    /// Wait on a fence handed out by this frame, bounded by the frame's timeout.
    pub fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        self.device
            .wait_for_fences(&[fence], self.wait_timeout)
            .map_err(|e| {
                log::error!("Frame {}: wait on fence {:?} failed: {}", self.index, fence, e);
                e
            })
    }

    pub fn semaphore_pool(&self) -> &SemaphorePool<D> {
        &self.semaphores
    }

    pub fn fence_pool(&self) -> &FencePool<D> {
        &self.fences
    }

    pub fn timeline(&self) -> &TimelineSemaphore<D> {
        &self.timeline
    }

    /// Timeline value the next `reset` of this slot waits for.
    pub fn submitted_value(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Hand a recorded (ended) command buffer to the frame for submission.
    pub fn enqueue(&self, family: QueueFamily, command_buffer: vk::CommandBuffer) {
        self.queued.lock().push((family, command_buffer));
    }

    pub fn take_queued(&self) -> Vec<(QueueFamily, vk::CommandBuffer)> {
        std::mem::take(&mut *self.queued.lock())
    }

    pub fn queued_len(&self) -> usize {
        self.queued.lock().len()
    }

    /// Submit everything enqueued: transfer, then compute, then graphics.
    ///
    /// Each batch signals the next timeline value and waits on the previous
    /// batch's value, so the last value covers the whole frame. The graphics
    /// batch is always submitted, even empty, and carries the present
    /// semaphores when given. Returns the last value signalled.
    pub fn submit(&self, present: Option<PresentSync>) -> Result<u64> {
        let queued = self.take_queued();
        let timeline = self.timeline.handle();
        let stage = vk::PipelineStageFlags::ALL_COMMANDS;
        let mut value = self.submitted.load(Ordering::Acquire);
        let mut previous: Option<u64> = None;

        for family in QueueFamily::ALL {
            let command_buffers: Vec<_> = queued
                .iter()
                .filter(|(f, _)| *f == family)
                .map(|&(_, cb)| cb)
                .collect();
            let is_graphics = family == QueueFamily::Graphics;
            if command_buffers.is_empty() && !is_graphics {
                continue;
            }

            let mut waits = Vec::with_capacity(2);
            let mut signals = vec![SemaphoreSubmit::timeline(timeline, value + 1, stage)];
            if let Some(previous) = previous {
                waits.push(SemaphoreSubmit::timeline(timeline, previous, stage));
            }
            if let (true, Some(sync)) = (is_graphics, present) {
                waits.push(SemaphoreSubmit::binary(
                    sync.image_available,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                ));
                signals.push(SemaphoreSubmit::binary(sync.render_finished, stage));
            }

            self.device
                .submit(
                    family,
                    &Submission {
                        command_buffers: &command_buffers,
                        waits: &waits,
                        signals: &signals,
                        fence: vk::Fence::null(),
                    },
                )
                .map_err(|e| {
                    log::error!(
                        "Frame {}: {} submission of {} buffers failed: {}",
                        self.index,
                        family.name(),
                        command_buffers.len(),
                        e
                    );
                    e
                })?;

            // Record per batch so a later failure still leaves an accurate target
            value += 1;
            previous = Some(value);
            self.submitted.store(value, Ordering::Release);
        }

        log::trace!("Frame {}: submitted up to timeline value {}", self.index, value);
        Ok(value)
    }

    pub fn buffers(&self) -> &FrameBuffers<D> {
        &self.buffers
    }

    pub fn descriptors(&self) -> &FrameDescriptors<D> {
        &self.descriptors
    }

    pub fn write_camera(&self, camera: &CameraUniform) -> Result<()> {
        self.buffers.camera.write(0, std::slice::from_ref(camera))
    }

    pub fn write_draws(&self, first: usize, draws: &[DrawRecord]) -> Result<()> {
        write_logged(self.index, "draws", &self.buffers.draws, first, draws)
    }

    pub fn write_transforms(&self, first: usize, transforms: &[TransformRecord]) -> Result<()> {
        write_logged(self.index, "transforms", &self.buffers.transforms, first, transforms)
    }

    pub fn write_materials(&self, first: usize, materials: &[MaterialRecord]) -> Result<()> {
        write_logged(self.index, "materials", &self.buffers.materials, first, materials)
    }
}

fn write_logged<D: GpuDevice, T: Pod>(
    frame: usize,
    what: &str,
    buffer: &GpuBuffer<D, T>,
    first: usize,
    records: &[T],
) -> Result<()> {
    buffer.write(first, records).map_err(|e| {
        log::warn!("Frame {}: {} write rejected: {}", frame, what, e);
        e
    })
}

impl<D: GpuDevice> std::fmt::Debug for RenderFrame<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderFrame")
            .field("index", &self.index)
            .field("timeline", &self.timeline)
            .field("submitted", &self.submitted_value())
            .finish()
    }
}

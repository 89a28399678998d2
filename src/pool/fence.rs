// Fence pool - single-use fences for one ring slot
//
// Fences are reused in place: `reset` puts every allocated fence back to the
// unsignalled state and rewinds the index.

use super::Slab;
use crate::backend::GpuDevice;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

pub struct FencePool<D: GpuDevice> {
    device: Arc<D>,
    fences: Slab<vk::Fence>,
}

impl<D: GpuDevice> FencePool<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            fences: Slab::new(),
        }
    }

    /// Next unsignalled fence. Safe to call from any thread.
    pub fn request_fence(&self) -> Result<vk::Fence> {
        self.fences.request(|| {
            let fence = self.device.create_fence(false).map_err(|e| {
                log::error!("Failed to create pooled fence: {}", e);
                e
            })?;
            log::debug!("Created pooled fence {:?}", fence);
            Ok(fence)
        })
        .copied()
    }

    /// Unsignal every fence for reuse. Only valid once the GPU is done with them.
    pub fn reset(&self) -> Result<()> {
        self.fences.reset_with(|fences| {
            let fences: Vec<vk::Fence> = fences.into_iter().copied().collect();
            self.device.reset_fences(&fences).map_err(|e| {
                log::error!("Failed to reset {} pooled fences: {}", fences.len(), e);
                e
            })
        })
    }

    pub fn in_use(&self) -> usize {
        self.fences.in_use()
    }

    pub fn allocated(&self) -> usize {
        self.fences.allocated()
    }
}

impl<D: GpuDevice> Drop for FencePool<D> {
    fn drop(&mut self) {
        for &fence in self.fences.iter() {
            self.device.destroy_fence(fence);
        }
    }
}

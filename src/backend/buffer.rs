// Buffer utilities for frame-local storage and uniform buffers
//
// A `GpuBuffer` owns its native buffer for as long as it lives; dropping it
// releases the buffer on every exit path. Contents are plain-old-data records
// written from the host.

use super::{BufferDesc, GpuDevice};
use crate::error::{Error, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::marker::PhantomData;
use std::sync::Arc;

/// One draw the shaders look up by index.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DrawRecord {
    pub mesh: u32,
    pub material: u32,
    pub transform: u32,
    pub instance_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TransformRecord {
    pub model: Mat4,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color: Vec4,
    /// x = metallic, y = roughness, z = emissive strength, w unused
    pub params: Vec4,
}

/// Per-frame camera uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    /// xyz = world position, w = 1
    pub position: Vec4,
}

impl CameraUniform {
    pub fn new(view: Mat4, projection: Mat4, position: Vec3) -> Self {
        Self {
            view,
            projection,
            view_projection: projection * view,
            position: position.extend(1.0),
        }
    }
}

/// A host-visible buffer holding up to `capacity` records of `T`.
pub struct GpuBuffer<D: GpuDevice, T: Pod> {
    device: Arc<D>,
    handle: vk::Buffer,
    capacity: usize,
    _records: PhantomData<T>,
}

impl<D: GpuDevice, T: Pod> GpuBuffer<D, T> {
    pub fn new(
        device: Arc<D>,
        label: &str,
        capacity: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let size = (std::mem::size_of::<T>() * capacity) as vk::DeviceSize;
        let handle = device
            .create_buffer(&BufferDesc { label, size, usage })
            .map_err(|e| {
                log::error!("Failed to create buffer '{}' ({} bytes): {}", label, size, e);
                e
            })?;

        Ok(Self {
            device,
            handle,
            capacity,
            _records: PhantomData,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size_bytes(&self) -> vk::DeviceSize {
        (std::mem::size_of::<T>() * self.capacity) as vk::DeviceSize
    }

    /// Write `records` starting at record index `first`.
    pub fn write(&self, first: usize, records: &[T]) -> Result<()> {
        let stride = std::mem::size_of::<T>() as u64;
        let offset = (first as u64).checked_mul(stride);
        let len = (records.len() as u64).saturating_mul(stride);
        let fits = first
            .checked_add(records.len())
            .map_or(false, |end| end <= self.capacity);

        match offset {
            Some(offset) if fits => {
                self.device
                    .write_buffer(self.handle, offset, bytemuck::cast_slice(records))
            }
            _ => Err(Error::OutOfRange {
                offset: offset.unwrap_or(u64::MAX),
                len,
                size: self.size_bytes(),
            }),
        }
    }
}

impl<D: GpuDevice, T: Pod> Drop for GpuBuffer<D, T> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
    }
}

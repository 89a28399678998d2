// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, require timeline semaphores)
// - Graphics / compute / transfer queue discovery
// - Logical device + one externally synchronised queue per family
// - Memory allocator for frame-local buffers

use super::{
    timeout_nanos, BufferDesc, DescriptorBinding, DescriptorSet, GpuDevice, QueueFamily,
    Submission,
};
use crate::error::{Error, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;
use std::time::Duration;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices chosen for each kind of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Pick families from what the GPU reports.
    ///
    /// Compute prefers a family without graphics (async compute), transfer
    /// prefers a DMA-only family. Both fall back to the graphics family.
    pub fn select(families: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            families
                .iter()
                .position(|f| {
                    f.queue_count > 0
                        && f.queue_flags.contains(required)
                        && !f.queue_flags.intersects(excluded)
                })
                .map(|i| i as u32)
        };

        let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())?;
        let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
        let transfer = find(
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
        .or_else(|| find(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS))
        .unwrap_or(graphics);

        Some(Self {
            graphics,
            compute,
            transfer,
        })
    }

    pub fn get(&self, family: QueueFamily) -> u32 {
        match family {
            QueueFamily::Graphics => self.graphics,
            QueueFamily::Compute => self.compute,
            QueueFamily::Transfer => self.transfer,
        }
    }

    fn unique(&self) -> Vec<u32> {
        let mut indices = vec![self.graphics, self.compute, self.transfer];
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (released manually in Drop, allocator first)
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<HashMap<vk::Buffer, Allocation>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles; families that share an index share the lock
    pub queue_families: QueueFamilyIndices,
    queues: HashMap<u32, Arc<Mutex<vk::Queue>>>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create a headless Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (if installed)
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }?;

        // Step 2: Create instance
        let enable_validation = enable_validation && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, queue_families) = Self::pick_physical_device(&instance)?;

        // Step 5: Create logical device and fetch queues
        let device = Self::create_logical_device(&instance, physical_device, &queue_families)?;
        let queues = queue_families
            .unique()
            .into_iter()
            .map(|index| {
                let queue = unsafe { device.get_device_queue(index, 0) };
                (index, Arc::new(Mutex::new(queue)))
            })
            .collect();

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} compute={} transfer={}",
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer
        );

        // Step 7: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            device,
            physical_device,
            instance,
            _entry: entry,
            queue_families,
            queues,
            debug_utils,
            properties,
        }))
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Failed to enumerate instance layers: {}", e);
                return false;
            }
        };
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|_| Error::InvalidConfig(format!("app name {:?} contains NUL", app_name)))?;
        let engine_name = c"frame-ring";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Headless: no surface extensions
        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            log::error!("Failed to create Vulkan instance: {}", e);
            e
        })?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            // Timeline semaphores are core in 1.2 but still an opt-in feature
            if props.api_version < vk::API_VERSION_1_2 || !Self::supports_timeline(instance, device)
            {
                continue;
            }

            let families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let Some(indices) = QueueFamilyIndices::select(&families) else {
                continue;
            };

            // Score device (prefer discrete GPU)
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, indices));
            }
        }

        best_device.ok_or(Error::NoSuitableGpu)
    }

    fn supports_timeline(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
        }
        features12.timeline_semaphore == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut features12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| {
                log::error!("Failed to create logical device: {}", e);
                e
            })?;

        Ok(device)
    }

    fn queue(&self, family: QueueFamily) -> Result<&Arc<Mutex<vk::Queue>>> {
        let index = self.queue_families.get(family);
        self.queues
            .get(&index)
            .ok_or_else(|| Error::InvalidHandle(format!("no queue for family {}", index)))
    }
}

impl GpuDevice for VulkanDevice {
    fn create_command_pool(&self, family: QueueFamily) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_families.get(family))
            // TRANSIENT: buffers live for one frame and are recycled by pool reset
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        Ok(unsafe { self.device.create_command_pool(&pool_info, None) }?)
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or(Error::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }?;
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
    ) -> Result<()> {
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if level == vk::CommandBufferLevel::SECONDARY {
            begin_info = begin_info.inheritance_info(&inheritance);
        }
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }?;
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }?;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&fence_info, None) }?)
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe { self.device.reset_fences(fences) }?;
        Ok(())
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration) -> Result<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device
                .wait_for_fences(fences, true, timeout_nanos(timeout))
        }?;
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&semaphore_info, None) }?)
    }

    fn create_timeline_semaphore(&self, initial_value: u64) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        Ok(unsafe { self.device.create_semaphore(&semaphore_info, None) }?)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(semaphore)
            .value(value);
        unsafe { self.device.signal_semaphore(&signal_info) }?;
        Ok(())
    }

    fn wait_semaphore(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout: Duration,
    ) -> Result<()> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, timeout_nanos(timeout)) }?;
        Ok(())
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore) }?)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut guard = self.allocator.lock();
            let allocated = match guard.as_mut() {
                Some(allocator) => allocator
                    .allocate(&AllocationCreateDesc {
                        name: desc.label,
                        requirements,
                        location: MemoryLocation::CpuToGpu,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(Error::from),
                None => Err(Error::InvalidHandle("allocator already released".into())),
            };
            match allocated {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            if let Some(allocator) = self.allocator.lock().as_mut() {
                let _ = allocator.free(allocation);
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        self.allocations.lock().insert(buffer, allocation);
        log::debug!("Created buffer '{}' ({} bytes)", desc.label, desc.size);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(&buffer)
            .ok_or_else(|| Error::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| Error::InvalidHandle(format!("buffer {:?} is not host visible", buffer)))?;

        let size = mapped.len() as u64;
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::OutOfRange { offset, len, size });
        }
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if let Some(allocation) = self.allocations.lock().remove(&buffer) {
            if let Some(allocator) = self.allocator.lock().as_mut() {
                if let Err(e) = allocator.free(allocation) {
                    log::warn!("Failed to free memory of buffer {:?}: {}", buffer, e);
                }
            }
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_descriptor_set(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSet> {
        let layout_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }?;

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for b in bindings {
            match pool_sizes.iter_mut().find(|s| s.ty == b.ty) {
                Some(size) => size.descriptor_count += 1,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty: b.ty,
                    descriptor_count: 1,
                }),
            }
        }
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { self.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) if !sets.is_empty() => sets[0],
            result => {
                unsafe {
                    self.device.destroy_descriptor_pool(pool, None);
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(result
                    .err()
                    .unwrap_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                    .into());
            }
        };

        let buffer_infos: Vec<_> = bindings
            .iter()
            .map(|b| vk::DescriptorBufferInfo {
                buffer: b.buffer,
                offset: 0,
                range: b.range,
            })
            .collect();
        let writes: Vec<_> = bindings
            .iter()
            .zip(&buffer_infos)
            .map(|(b, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(b.binding)
                    .descriptor_type(b.ty)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        Ok(DescriptorSet { pool, layout, set })
    }

    fn destroy_descriptor_set(&self, set: &DescriptorSet) {
        // Destroying the pool frees the set
        unsafe {
            self.device.destroy_descriptor_pool(set.pool, None);
            self.device.destroy_descriptor_set_layout(set.layout, None);
        }
    }

    fn submit(&self, family: QueueFamily, submission: &Submission<'_>) -> Result<()> {
        let wait_semaphores: Vec<_> = submission.waits.iter().map(|w| w.semaphore).collect();
        let wait_values: Vec<_> = submission.waits.iter().map(|w| w.value).collect();
        let wait_stages: Vec<_> = submission.waits.iter().map(|w| w.stage).collect();
        let signal_semaphores: Vec<_> = submission.signals.iter().map(|s| s.semaphore).collect();
        let signal_values: Vec<_> = submission.signals.iter().map(|s| s.value).collect();

        // Binary semaphores ignore their entry in these arrays
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let queue = self.queue(family)?.lock();
        unsafe {
            self.device
                .queue_submit(*queue, std::slice::from_ref(&submit_info), submission.fence)
        }
        .map_err(|e| {
            log::error!("{} queue submission failed: {}", family.name(), e);
            e
        })?;
        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    fn wait_idle(&self) -> Result<()> {
        // Queue locks keep submissions out while we wait
        let _locks: Vec<_> = self.queues.values().map(|q| q.lock()).collect();
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = unsafe { self.device.device_wait_idle() };

        // Memory must go back to the allocator before the device disappears
        let allocations: Vec<_> = self.allocations.lock().drain().collect();
        if let Some(mut allocator) = self.allocator.lock().take() {
            for (buffer, allocation) in allocations {
                let _ = allocator.free(allocation);
                unsafe { self.device.destroy_buffer(buffer, None) };
            }
        }

        // Cleanup in reverse order
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_compute_and_transfer_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::select(&families).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                compute: 1,
                transfer: 2,
            }
        );
        assert_eq!(indices.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn falls_back_to_graphics_family() {
        let families =
            [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::select(&families).unwrap();
        assert_eq!(indices.compute, 0);
        assert_eq!(indices.transfer, 0);
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn no_graphics_family_means_no_device() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(QueueFamilyIndices::select(&families).is_none());
    }
}

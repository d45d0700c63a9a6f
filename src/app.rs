#![allow(unsafe_op_in_unsafe_fn)]

use std::{collections::HashSet, ffi::CStr, sync::Arc};

use derive_more::Deref;
use itertools::Itertools;
use thiserror::Error;
use vulkanalia::{
    loader::{LIBRARY, LibloadingLoader},
    prelude::v1_4::*,
};

use crate::memory::MemoryTable;

const VALIDATION_ENABLED: bool = cfg!(debug_assertions);
const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

const INSTANCE_EXTENSIONS: [vk::Extension; 1] = [vk::KHR_PORTABILITY_ENUMERATION_EXTENSION];

/// Queries reserved for the dispatch start and end timestamps.
pub const QUERY_POOL_SIZE: usize = 2;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to load vulkan: {0}")]
    Loader(String),
    #[error("no vulkan physical device found")]
    NoDevice,
    #[error("no physical device exposes a compute queue family")]
    NoComputeQueue,
    #[error(transparent)]
    Vulkan(#[from] vk::ErrorCode),
}

fn parse_version(version: &str) -> u32 {
    let mut parts = version.split('.').map(|s| s.parse().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    vk::make_version(major, minor, patch)
}

/// The compute queue and the command pool recording for it.
#[derive(Debug, Clone)]
pub struct Submit {
    pub queue: vk::Queue,
    pub pool: vk::CommandPool,
    pub family: u32,
}

impl Submit {
    /// # Safety
    ///
    /// `family` must be a queue family the device was created with.
    pub unsafe fn new(device: &Device, family: u32, queue: u32) -> Result<Self, vk::ErrorCode> {
        let queue = device.get_device_queue(family, queue);
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let pool = device.create_command_pool(&info, None)?;
        Ok(Self {
            queue,
            pool,
            family,
        })
    }
}

/// Creates the command pool, pipeline cache and timestamp pool of a fresh device.
///
/// Whatever was created before a failure is destroyed again.
///
/// # Safety
///
/// `family` must be a queue family the device was created with.
unsafe fn create_device_objects(
    device: &Device,
    family: u32,
) -> Result<(Submit, vk::PipelineCache, vk::QueryPool), vk::ErrorCode> {
    let compute = Submit::new(device, family, 0)?;

    let info = vk::PipelineCacheCreateInfo::builder();
    let pipeline_cache = match device.create_pipeline_cache(&info, None) {
        Ok(cache) => cache,
        Err(err) => {
            device.destroy_command_pool(compute.pool, None);
            return Err(err);
        }
    };

    let info = vk::QueryPoolCreateInfo::builder()
        .query_type(vk::QueryType::TIMESTAMP)
        .query_count(QUERY_POOL_SIZE as u32);
    match device.create_query_pool(&info, None) {
        Ok(query_pool) => Ok((compute, pipeline_cache, query_pool)),
        Err(err) => {
            device.destroy_pipeline_cache(pipeline_cache, None);
            device.destroy_command_pool(compute.pool, None);
            Err(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Properties {
    pub device_name: String,
    pub memory: MemoryTable,
    pub limits: vk::PhysicalDeviceLimits,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    /// Meaningful low bits of a timestamp written on the compute queue.
    pub timestamp_valid_bits: u32,
}

mod inner {
    use vulkanalia::prelude::v1_4::*;

    #[derive(Debug)]
    pub struct Context {
        pub instance: Instance,
        pub device: Device,
        pub physical_device: vk::PhysicalDevice,
        pub properties: super::Properties,
        pub compute: super::Submit,
        pub pipeline_cache: vk::PipelineCache,
        pub query_pool: vk::QueryPool,
    }

    #[derive(Debug)]
    pub struct CommandBuffer {
        pub context: super::Context,
        pub pool: vk::CommandPool,
        pub handle: vk::CommandBuffer,
    }

    #[derive(Debug)]
    pub struct Fence {
        pub context: super::Context,
        pub handle: vk::Fence,
    }
}

impl Drop for inner::Context {
    fn drop(&mut self) {
        let device = &self.device;
        let instance = &self.instance;
        unsafe {
            device.destroy_command_pool(self.compute.pool, None);
            device.destroy_pipeline_cache(self.pipeline_cache, None);
            device.destroy_query_pool(self.query_pool, None);
            device.destroy_device(None);
            instance.destroy_instance(None);
        }
    }
}

impl Drop for inner::CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .free_command_buffers(self.pool, &[self.handle]);
        }
    }
}

impl Drop for inner::Fence {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_fence(self.handle, None);
        }
    }
}

/// Owns the instance, the logical device and its compute queue.
///
/// Every resource keeps a clone, so the context is destroyed last.
#[derive(Debug, Clone, Deref)]
pub struct Context(Arc<inner::Context>);

impl Context {
    unsafe fn new_unsafe() -> Result<Self, ContextError> {
        let loader =
            LibloadingLoader::new(LIBRARY).map_err(|err| ContextError::Loader(err.to_string()))?;
        let entry = Entry::new(loader).map_err(|err| ContextError::Loader(err.to_string()))?;
        log::info!("{}", entry.version()?);

        let available: HashSet<_> = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .map(|properties| properties.layer_name)
            .collect();
        if VALIDATION_ENABLED && !available.contains(&VALIDATION_LAYER) {
            log::warn!("validation layer {VALIDATION_LAYER} not found");
        }
        let layers = match VALIDATION_ENABLED && available.contains(&VALIDATION_LAYER) {
            true => vec![VALIDATION_LAYER],
            false => vec![],
        };
        let layers = layers.iter().map(|name| name.as_ptr()).collect_vec();

        let supported: HashSet<_> = entry
            .enumerate_instance_extension_properties(None)?
            .into_iter()
            .map(|property| property.extension_name)
            .collect();
        let extensions = INSTANCE_EXTENSIONS
            .iter()
            .filter(|ext| supported.contains(&ext.name))
            .map(|ext| ext.name.as_ptr())
            .collect_vec();
        let flags = match supported.contains(&vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name) {
            true => vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR,
            false => vk::InstanceCreateFlags::empty(),
        };

        let info = vk::ApplicationInfo::builder()
            .application_name(env!("CARGO_PKG_NAME").as_bytes())
            .application_version(parse_version(env!("CARGO_PKG_VERSION")))
            .api_version(vk::make_version(1, 1, 0));
        let info = vk::InstanceCreateInfo::builder()
            .application_info(&info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions)
            .flags(flags);
        let instance = entry.create_instance(&info, None)?;

        let devices = instance.enumerate_physical_devices()?;
        if devices.is_empty() {
            instance.destroy_instance(None);
            return Err(ContextError::NoDevice);
        }

        // first device with a compute-capable queue family
        let found = devices.into_iter().find_map(|device| {
            instance
                .get_physical_device_queue_family_properties(device)
                .iter()
                .enumerate()
                .find(|(_, p)| p.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|(index, p)| (device, index as u32, p.timestamp_valid_bits))
        });
        let Some((physical_device, family, timestamp_valid_bits)) = found else {
            instance.destroy_instance(None);
            return Err(ContextError::NoComputeQueue);
        };

        let properties = instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_bytes_until_nul(properties.device_name.as_bytes())
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("invalid device name")
            .to_string();
        let limits = properties.limits;

        log::info!("GPU information:");
        log::info!("\tdevice name: {device_name}");
        log::info!("\tdevice type: {:?}", properties.device_type);
        log::info!(
            "\tdriver version: {}.{}.{}",
            vk::version_major(properties.driver_version),
            vk::version_minor(properties.driver_version),
            vk::version_patch(properties.driver_version)
        );
        log::info!(
            "\tAPI version: {}.{}.{}",
            vk::version_major(properties.api_version),
            vk::version_minor(properties.api_version),
            vk::version_patch(properties.api_version)
        );
        log::info!("\tvendor ID: 0x{:04X}", properties.vendor_id);
        log::info!("\tdevice ID: 0x{:04X}", properties.device_id);
        log::info!(
            "\tmax compute workgroup count: {:?}",
            limits.max_compute_work_group_count
        );
        log::info!(
            "\tmax compute workgroup size: {:?}",
            limits.max_compute_work_group_size
        );
        log::info!(
            "\tmax compute workgroup invocations: {}",
            limits.max_compute_work_group_invocations
        );
        log::info!(
            "\tmax compute shared memory: {} bytes",
            limits.max_compute_shared_memory_size
        );
        log::info!("\ttimestamp period: {} ns", limits.timestamp_period);
        log::info!("\ttimestamp valid bits: {timestamp_valid_bits}");

        let memory = instance.get_physical_device_memory_properties(physical_device);
        log::info!("\tmemory heaps: {} heap(s)", memory.memory_heap_count);
        for (i, heap) in memory
            .memory_heaps
            .iter()
            .take(memory.memory_heap_count as usize)
            .enumerate()
        {
            let size = heap.size / 1024 / 1024;
            log::info!("\t\theap {i}: {size} MB, flags: {:?}", heap.flags);
        }
        log::info!("\tmemory types: {} type(s)", memory.memory_type_count);
        for (i, r#type) in memory
            .memory_types
            .iter()
            .take(memory.memory_type_count as usize)
            .enumerate()
        {
            log::info!(
                "\t\ttype {i}: heap {}, flags: {:?}",
                r#type.heap_index,
                r#type.property_flags
            );
        }

        let properties = Properties {
            device_name,
            memory: memory.into(),
            limits,
            timestamp_period: limits.timestamp_period,
            timestamp_valid_bits,
        };

        let infos = &[vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&[1.0])];
        let info = vk::DeviceCreateInfo::builder().queue_create_infos(infos);
        let device = match instance.create_device(physical_device, &info, None) {
            Ok(device) => device,
            Err(err) => {
                instance.destroy_instance(None);
                return Err(err.into());
            }
        };

        let (compute, pipeline_cache, query_pool) = match create_device_objects(&device, family) {
            Ok(objects) => objects,
            Err(err) => {
                device.destroy_device(None);
                instance.destroy_instance(None);
                return Err(err.into());
            }
        };
        log::info!("\tcompute queue family: {}", compute.family);

        Ok(Self(Arc::new(inner::Context {
            instance,
            device,
            physical_device,
            properties,
            compute,
            pipeline_cache,
            query_pool,
        })))
    }

    unsafe fn allocate_command_buffer_unsafe(&self) -> Result<CommandBuffer, vk::ErrorCode> {
        let pool = self.compute.pool;
        let info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1)
            .command_pool(pool);
        let handle = self.device.allocate_command_buffers(&info)?[0];
        let context = self.clone();
        Ok(CommandBuffer(Arc::new(inner::CommandBuffer {
            context,
            pool,
            handle,
        })))
    }

    unsafe fn create_fence_unsafe(&self) -> Result<Fence, vk::ErrorCode> {
        let info = vk::FenceCreateInfo::builder();
        let handle = self.device.create_fence(&info, None)?;
        let context = self.clone();
        Ok(Fence(Arc::new(inner::Fence { context, handle })))
    }

    unsafe fn submit_unsafe(&self, cmd: &CommandBuffer, fence: &Fence) -> Result<(), vk::ErrorCode> {
        let buffers = [cmd.handle()];
        let info = vk::SubmitInfo::builder().command_buffers(&buffers);
        self.device
            .queue_submit(self.compute.queue, &[info], fence.handle())?;
        Ok(())
    }

    unsafe fn query_timestamps_unsafe(&self) -> Result<[u64; QUERY_POOL_SIZE], vk::ErrorCode> {
        let mut data = [0u64; QUERY_POOL_SIZE];
        self.device.get_query_pool_results(
            self.query_pool,
            0,
            QUERY_POOL_SIZE as u32,
            bytemuck::cast_slice_mut(&mut data),
            size_of::<u64>() as u64,
            vk::QueryResultFlags::_64 | vk::QueryResultFlags::WAIT,
        )?;
        Ok(data)
    }

    /// Opens the first physical device with a compute queue family.
    ///
    /// # Errors
    ///
    /// - [`ContextError::Loader`] if the Vulkan library cannot be loaded
    /// - [`ContextError::NoDevice`] if no physical device is present
    /// - [`ContextError::NoComputeQueue`] if no device has a compute queue family
    #[inline]
    pub fn new() -> Result<Self, ContextError> {
        unsafe { Self::new_unsafe() }
    }

    #[inline]
    pub fn allocate_command_buffer(&self) -> Result<CommandBuffer, vk::ErrorCode> {
        unsafe { self.allocate_command_buffer_unsafe() }
    }

    #[inline]
    pub fn create_fence(&self) -> Result<Fence, vk::ErrorCode> {
        unsafe { self.create_fence_unsafe() }
    }

    /// Submits one recorded command buffer to the compute queue, signaling `fence`.
    #[inline]
    pub fn submit(&self, cmd: &CommandBuffer, fence: &Fence) -> Result<(), vk::ErrorCode> {
        unsafe { self.submit_unsafe(cmd, fence) }
    }

    /// Records `record` into a fresh command buffer, submits it with a fresh fence and
    /// blocks until the device signals completion.
    ///
    /// The fence and the command buffer are released before returning, on error too.
    pub fn one_shot<T, E>(
        &self,
        record: impl FnOnce(vk::CommandBuffer) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<vk::ErrorCode>,
    {
        let cmd = self.allocate_command_buffer()?;
        let output = unsafe {
            let info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd.handle(), &info)?;
            let output = record(cmd.handle())?;
            self.device.end_command_buffer(cmd.handle())?;
            output
        };

        let fence = self.create_fence()?;
        self.submit(&cmd, &fence)?;
        fence.wait()?;
        Ok(output)
    }

    /// Whether `format` can back a storage image with optimal tiling.
    pub fn supports_storage_image(&self, format: vk::Format) -> bool {
        let properties = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
    }

    /// Resets a range of the timestamp query pool.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state and `first + count` within [`QUERY_POOL_SIZE`].
    #[inline]
    pub unsafe fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, first: u32, count: u32) {
        self.device
            .cmd_reset_query_pool(cmd, self.query_pool, first, count);
    }

    /// Writes a timestamp to query `query` once `stage` completes.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state and the query must have been reset.
    #[inline]
    pub unsafe fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query: u32,
    ) {
        self.device
            .cmd_write_timestamp(cmd, stage, self.query_pool, query);
    }

    /// Reads back both timestamps, waiting for them to become available.
    pub fn query_timestamps(&self) -> Result<[u64; QUERY_POOL_SIZE], vk::ErrorCode> {
        unsafe { self.query_timestamps_unsafe() }
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuffer(Arc<inner::CommandBuffer>);

impl CommandBuffer {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.0.handle
    }
}

#[derive(Debug, Clone)]
pub struct Fence(Arc<inner::Fence>);

impl Fence {
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.0.handle
    }

    /// Blocks without timeout until the fence is signaled.
    pub fn wait(&self) -> Result<(), vk::ErrorCode> {
        unsafe {
            self.0
                .context
                .device
                .wait_for_fences(&[self.0.handle], true, u64::MAX)?;
        }
        Ok(())
    }
}

/// Opens a context for device tests, or `None` on machines without Vulkan.
#[cfg(test)]
pub(crate) fn try_context() -> Option<Context> {
    match Context::new() {
        Ok(context) => Some(context),
        Err(err) => {
            eprintln!("skipping device test: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use vulkanalia::prelude::v1_4::*;

    use super::{create_device_objects, parse_version, try_context};

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("0.1.0"), vk::make_version(0, 1, 0));
        assert_eq!(parse_version("1.2"), vk::make_version(1, 2, 0));
        assert_eq!(parse_version("x.3.4"), vk::make_version(0, 3, 4));
    }

    #[test]
    fn test_device_objects_created_and_released() {
        let Some(context) = try_context() else {
            return;
        };
        let device = &context.device;
        let family = context.compute.family;
        unsafe {
            let (compute, pipeline_cache, query_pool) =
                create_device_objects(device, family).unwrap();
            assert_eq!(compute.family, family);
            assert_ne!(compute.pool, context.compute.pool);

            device.destroy_query_pool(query_pool, None);
            device.destroy_pipeline_cache(pipeline_cache, None);
            device.destroy_command_pool(compute.pool, None);
        }
    }
}

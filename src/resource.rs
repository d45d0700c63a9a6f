#![allow(unsafe_op_in_unsafe_fn)]

use std::sync::{Arc, Mutex};

use derive_more::Deref;
use thiserror::Error;
use vulkanalia::prelude::v1_4::*;

use crate::{
    app::Context,
    format::{Extent, PixelFormat},
    memory::{self, MappedMemory, MemoryError, MemoryKind, MemoryType, RowPitch},
    state::{self, Barrier, ResourceKind, ResourceState, StateCell, StateError, Transition},
};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("format {0} does not support storage images on this device")]
    UnsupportedFormat(PixelFormat),
    #[error("image extent {0} is empty")]
    Empty(Extent),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Vulkan(#[from] vk::ErrorCode),
}

mod inner {
    use vulkanalia::prelude::v1_4::*;

    use crate::{
        app::Context,
        format::{Extent, PixelFormat},
        memory::MemoryType,
        state::StateCell,
    };

    #[derive(Debug)]
    pub struct Buffer {
        pub context: Context,
        pub buffer: vk::Buffer,
        pub memory: vk::DeviceMemory,
        pub memory_type: MemoryType,
        /// Requested size in bytes.
        pub size: usize,
        /// Size of the bound allocation, at least `size`.
        pub allocation: usize,
        pub state: StateCell,
    }

    #[derive(Debug)]
    pub struct Image {
        pub context: Context,
        pub image: vk::Image,
        pub view: vk::ImageView,
        pub memory: vk::DeviceMemory,
        pub format: PixelFormat,
        pub extent: Extent,
        pub state: StateCell,
    }

    #[derive(Debug)]
    pub struct LinearImage {
        pub context: Context,
        pub image: vk::Image,
        pub memory: vk::DeviceMemory,
        pub memory_type: MemoryType,
        pub format: PixelFormat,
        pub extent: Extent,
        pub allocation: usize,
    }

    #[derive(Debug)]
    pub struct Sampler {
        pub context: Context,
        pub image: super::Image,
        pub sampler: vk::Sampler,
    }
}

impl Drop for inner::Buffer {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl Drop for inner::Image {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl Drop for inner::LinearImage {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl Drop for inner::Sampler {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_sampler(self.sampler, None);
        }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build()
}

fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
        .build()
}

unsafe fn cmd_buffer_barrier(
    device: &Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    barrier: &Barrier,
) {
    let info = vk::BufferMemoryBarrier::builder()
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE as vk::DeviceSize)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access);
    device.cmd_pipeline_barrier(
        cmd,
        barrier.src_stage,
        barrier.dst_stage,
        vk::DependencyFlags::empty(),
        &[] as &[vk::MemoryBarrier],
        &[info],
        &[] as &[vk::ImageMemoryBarrier],
    );
}

unsafe fn cmd_image_barrier(
    device: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    barrier: &Barrier,
) {
    let info = vk::ImageMemoryBarrier::builder()
        .image(image)
        .old_layout(barrier.old_layout())
        .new_layout(barrier.new_layout())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access)
        .subresource_range(color_subresource_range());
    device.cmd_pipeline_barrier(
        cmd,
        barrier.src_stage,
        barrier.dst_stage,
        vk::DependencyFlags::empty(),
        &[] as &[vk::MemoryBarrier],
        &[] as &[vk::BufferMemoryBarrier],
        &[info],
    );
}

/// A device resource whose synchronization state is tracked.
pub trait Tracked: std::fmt::Debug {
    fn kind(&self) -> ResourceKind;

    fn state_cell(&self) -> &StateCell;

    /// Records one barrier on this resource.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state.
    unsafe fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier);

    fn state(&self) -> Result<ResourceState, StateError> {
        self.state_cell()
            .lock()
            .map(|state| *state)
            .map_err(|_| StateError::Lock)
    }

    /// Looks up the barriers for moving to `to` without changing the state.
    fn plan(&self, to: ResourceState) -> Result<Transition, StateError> {
        state::transition(self.kind(), self.state()?, to)
    }

    /// Moves the resource to `to` and returns the barriers the step must record.
    ///
    /// The state is left untouched when the step is illegal.
    fn advance(&self, to: ResourceState) -> Result<Transition, StateError> {
        let mut state = self.state_cell().lock().map_err(|_| StateError::Lock)?;
        let transition = state::transition(self.kind(), *state, to)?;
        log::debug!("{} {:?}: {} -> {}", self.kind(), self.handle(), *state, to);
        *state = to;
        Ok(transition)
    }

    /// Raw handle, for logging.
    fn handle(&self) -> u64;

    /// Records the barriers in `barriers` that target this resource.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state.
    unsafe fn cmd_barriers(&self, cmd: vk::CommandBuffer, barriers: &[Barrier]) {
        barriers
            .iter()
            .filter(|barrier| barrier.target == state::Target::Resource)
            .for_each(|barrier| self.cmd_barrier(cmd, barrier));
    }
}

impl Context {
    unsafe fn allocate_memory_unsafe(
        &self,
        req: vk::MemoryRequirements,
        kind: MemoryKind,
    ) -> Result<(vk::DeviceMemory, MemoryType), MemoryError> {
        let memory_type = self.properties.memory.find(req.memory_type_bits, kind)?;
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(req.size)
            .memory_type_index(memory_type.index);
        let memory = self.device.allocate_memory(&info, None)?;
        log::debug!(
            "allocated {} bytes of {kind} memory from type {} ({:?})",
            req.size,
            memory_type.index,
            memory_type.flags
        );
        Ok((memory, memory_type))
    }

    unsafe fn create_buffer_unsafe(
        &self,
        usage: vk::BufferUsageFlags,
        kind: MemoryKind,
        size: usize,
        data: Option<&[u8]>,
    ) -> Result<Buffer, MemoryError> {
        let info = vk::BufferCreateInfo::builder()
            .size(size as u64)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = self.device.create_buffer(&info, None)?;
        let req = self.device.get_buffer_memory_requirements(buffer);

        // nothing is mapped or copied unless a matching memory type exists
        let (memory, memory_type) = match self.allocate_memory_unsafe(req, kind) {
            Ok(memory) => memory,
            Err(err) => {
                self.device.destroy_buffer(buffer, None);
                return Err(err);
            }
        };

        let context = self.clone();
        let buffer = Buffer(Arc::new(inner::Buffer {
            context,
            buffer,
            memory,
            memory_type,
            size,
            allocation: req.size as usize,
            state: Arc::new(Mutex::new(ResourceState::Uninitialized)),
        }));
        self.device
            .bind_buffer_memory(buffer.buffer, buffer.memory, 0)?;

        if let Some(data) = data {
            buffer.write(data)?;
        }
        Ok(buffer)
    }

    unsafe fn create_image_unsafe(
        &self,
        extent: Extent,
        format: PixelFormat,
        usage: vk::ImageUsageFlags,
    ) -> Result<Image, ImageError> {
        if extent.is_empty() {
            return Err(ImageError::Empty(extent));
        }
        if usage.contains(vk::ImageUsageFlags::STORAGE) && !self.supports_storage_image(format.to_vk())
        {
            return Err(ImageError::UnsupportedFormat(format));
        }

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(extent.to_vk())
            .format(format.to_vk())
            .mip_levels(1)
            .array_layers(1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = self.device.create_image(&info, None)?;

        let req = self.device.get_image_memory_requirements(image);
        let memory = match self.allocate_memory_unsafe(req, MemoryKind::DeviceLocal) {
            Ok((memory, _)) => memory,
            Err(err) => {
                self.device.destroy_image(image, None);
                return Err(err.into());
            }
        };
        if let Err(err) = self.device.bind_image_memory(image, memory, 0) {
            self.device.destroy_image(image, None);
            self.device.free_memory(memory, None);
            return Err(err.into());
        }

        let components = vk::ComponentMapping::builder()
            .r(vk::ComponentSwizzle::IDENTITY)
            .g(vk::ComponentSwizzle::IDENTITY)
            .b(vk::ComponentSwizzle::IDENTITY)
            .a(vk::ComponentSwizzle::IDENTITY);
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::_2D)
            .format(format.to_vk())
            .components(components)
            .subresource_range(color_subresource_range());
        let view = match self.device.create_image_view(&info, None) {
            Ok(view) => view,
            Err(err) => {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
                return Err(err.into());
            }
        };

        let context = self.clone();
        Ok(Image(Arc::new(inner::Image {
            context,
            image,
            view,
            memory,
            format,
            extent,
            state: Arc::new(Mutex::new(ResourceState::Uninitialized)),
        })))
    }

    unsafe fn create_linear_image_unsafe(
        &self,
        extent: Extent,
        format: PixelFormat,
    ) -> Result<LinearImage, ImageError> {
        if extent.is_empty() {
            return Err(ImageError::Empty(extent));
        }

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(extent.to_vk())
            .format(format.to_vk())
            .mip_levels(1)
            .array_layers(1)
            .tiling(vk::ImageTiling::LINEAR)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .samples(vk::SampleCountFlags::_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = self.device.create_image(&info, None)?;

        let req = self.device.get_image_memory_requirements(image);
        let (memory, memory_type) = match self.allocate_memory_unsafe(req, MemoryKind::HostCoherent)
        {
            Ok(memory) => memory,
            Err(err) => {
                self.device.destroy_image(image, None);
                return Err(err.into());
            }
        };

        let context = self.clone();
        let image = LinearImage(Arc::new(inner::LinearImage {
            context,
            image,
            memory,
            memory_type,
            format,
            extent,
            allocation: req.size as usize,
        }));
        self.device.bind_image_memory(image.image, image.memory, 0)?;
        Ok(image)
    }

    /// Creates a linear buffer, optionally filled with `data`.
    ///
    /// The memory type is the first one allowed by the buffer whose flags are a superset
    /// of `kind`. When `data` is given the memory is mapped, written, flushed if the type
    /// is not host-coherent, and unmapped.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::NoMatchingMemoryType`] before any memory is allocated or written
    /// - [`MemoryError::Unmapped`] if `data` is given for device-local memory
    /// - [`MemoryError::Size`] if `data` is larger than the buffer
    #[inline]
    pub fn create_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        kind: MemoryKind,
        size: usize,
        data: Option<&[u8]>,
    ) -> Result<Buffer, MemoryError> {
        unsafe { self.create_buffer_unsafe(usage, kind, size, data) }
    }

    /// Creates a device-local optimal-tiling 2-D image in `UNDEFINED` layout.
    ///
    /// Storage usage is refused up front for formats the device cannot store to.
    #[inline]
    pub fn create_image(
        &self,
        extent: Extent,
        format: PixelFormat,
        usage: vk::ImageUsageFlags,
    ) -> Result<Image, ImageError> {
        unsafe { self.create_image_unsafe(extent, format, usage) }
    }

    /// Creates a host-visible linear-tiling image to copy device images into.
    #[inline]
    pub fn create_linear_image(
        &self,
        extent: Extent,
        format: PixelFormat,
    ) -> Result<LinearImage, ImageError> {
        unsafe { self.create_linear_image_unsafe(extent, format) }
    }
}

#[derive(Debug, Clone, Deref)]
#[deref(forward)]
pub struct Buffer(Arc<inner::Buffer>);

impl Buffer {
    fn mapping(&self) -> Result<MappedMemory<'_>, MemoryError> {
        if !self.memory_type.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(MemoryError::Unmapped);
        }
        let coherent = self.memory_type.is_coherent();
        unsafe {
            MappedMemory::new(
                &self.context.device,
                self.memory,
                self.allocation,
                coherent,
            )
        }
    }

    /// Writes `data` to the start of the buffer through a temporary mapping.
    pub fn write(&self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() > self.size {
            return Err(MemoryError::Size(self.size, data.len()));
        }
        memory::write_mapped(&mut self.mapping()?, data)
    }

    /// Reads the start of the buffer into `data` through a temporary mapping.
    pub fn read(&self, data: &mut [u8]) -> Result<(), MemoryError> {
        if data.len() > self.size {
            return Err(MemoryError::Size(self.size, data.len()));
        }
        memory::read_mapped(&mut self.mapping()?, data)
    }

    /// Records a whole-buffer copy from `src`.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state; both buffers must outlive its execution.
    pub unsafe fn cmd_copy_from(&self, cmd: vk::CommandBuffer, src: &Buffer) {
        if self.size != src.size {
            log::warn!("size mismatch: {} != {}", self.size, src.size);
        }
        let size = self.size.min(src.size) as u64;
        let copy = vk::BufferCopy::builder().size(size);
        self.context
            .device
            .cmd_copy_buffer(cmd, src.buffer, self.buffer, &[copy]);
    }
}

impl Tracked for Buffer {
    #[inline]
    fn kind(&self) -> ResourceKind {
        ResourceKind::Buffer
    }

    #[inline]
    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    unsafe fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier) {
        cmd_buffer_barrier(&self.context.device, cmd, self.buffer, barrier);
    }

    #[inline]
    fn handle(&self) -> u64 {
        vk::Handle::as_raw(self.buffer)
    }
}

#[derive(Debug, Clone, Deref)]
#[deref(forward)]
pub struct Image(Arc<inner::Image>);

impl Image {
    /// The texel region a copy of this image's logical extent addresses.
    #[inline]
    pub fn copy_extent(&self) -> Extent {
        self.format.copy_extent(self.extent)
    }

    /// Records a tightly packed buffer-to-image copy; the image must be in
    /// `TRANSFER_DST_OPTIMAL` layout.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state; `src` must hold at least
    /// `format.copy_size(extent)` bytes.
    pub unsafe fn cmd_copy_from_buffer(&self, cmd: vk::CommandBuffer, src: &Buffer) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(color_subresource_layers())
            .image_offset(vk::Offset3D::default())
            .image_extent(self.copy_extent().to_vk());
        self.context.device.cmd_copy_buffer_to_image(
            cmd,
            src.buffer,
            self.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }

    unsafe fn create_sampler_unsafe(&self) -> Result<Sampler, ImageError> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .mip_lod_bias(0.0)
            .compare_enable(false)
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(1.0)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .unnormalized_coordinates(false);
        let sampler = self.context.device.create_sampler(&info, None)?;

        let context = self.context.clone();
        let image = self.clone();
        Ok(Sampler(Arc::new(inner::Sampler {
            context,
            image,
            sampler,
        })))
    }

    /// Creates a linear, clamp-to-border sampler over this image's view.
    #[inline]
    pub fn create_sampler(&self) -> Result<Sampler, ImageError> {
        unsafe { self.create_sampler_unsafe() }
    }
}

impl Tracked for Image {
    #[inline]
    fn kind(&self) -> ResourceKind {
        ResourceKind::Image
    }

    #[inline]
    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    unsafe fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier) {
        cmd_image_barrier(&self.context.device, cmd, self.image, barrier);
    }

    #[inline]
    fn handle(&self) -> u64 {
        vk::Handle::as_raw(self.image)
    }
}

/// Host-visible staging image for device-to-host image copies.
#[derive(Debug, Clone, Deref)]
#[deref(forward)]
pub struct LinearImage(Arc<inner::LinearImage>);

impl LinearImage {
    /// Where the texels live in the mapped allocation, as reported by the device.
    pub fn row_pitch(&self) -> RowPitch {
        let subresource = vk::ImageSubresource::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .array_layer(0);
        let layout = unsafe {
            self.context
                .device
                .get_image_subresource_layout(self.image, &subresource)
        };
        RowPitch {
            offset: layout.offset as usize,
            row_pitch: layout.row_pitch as usize,
            row_size: self.extent.width as usize * self.format.bytes_per_pixel(),
            rows: self.extent.height as usize,
        }
    }

    /// Reads the texels row by row into a tightly packed `data`.
    pub fn read(&self, data: &mut [u8]) -> Result<(), MemoryError> {
        let pitch = self.row_pitch();
        let coherent = self.memory_type.is_coherent();
        let mut mapping = unsafe {
            MappedMemory::new(&self.context.device, self.memory, self.allocation, coherent)?
        };
        memory::read_mapped_pitched(&mut mapping, pitch, data)
    }

    /// Records a copy of `src`'s copy extent into this image.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state; `src` must be in `TRANSFER_SRC_OPTIMAL` and
    /// this image in `TRANSFER_DST_OPTIMAL` layout when the copy executes.
    pub unsafe fn cmd_copy_from_image(&self, cmd: vk::CommandBuffer, src: &Image) {
        let region = vk::ImageCopy::builder()
            .src_subresource(color_subresource_layers())
            .src_offset(vk::Offset3D::default())
            .dst_subresource(color_subresource_layers())
            .dst_offset(vk::Offset3D::default())
            .extent(self.extent.to_vk());
        self.context.device.cmd_copy_image(
            cmd,
            src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }

    /// # Safety
    ///
    /// `cmd` must be in the recording state.
    pub unsafe fn cmd_barrier(&self, cmd: vk::CommandBuffer, barrier: &Barrier) {
        cmd_image_barrier(&self.context.device, cmd, self.image, barrier);
    }
}

#[derive(Debug, Clone, Deref)]
#[deref(forward)]
pub struct Sampler(Arc<inner::Sampler>);

#[cfg(test)]
mod tests {
    use vulkanalia::prelude::v1_4::*;

    use super::{ImageError, Tracked};
    use crate::{
        app::try_context,
        format::{Extent, PixelFormat},
        memory::{MemoryError, MemoryKind},
        state::ResourceState,
    };

    #[test]
    fn test_host_buffer_write_read() {
        let Some(context) = try_context() else {
            return;
        };
        let data: Vec<u8> = (0..=255).collect();
        let buffer = context
            .create_buffer(
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryKind::HostVisible,
                data.len(),
                Some(&data),
            )
            .unwrap();
        assert!(buffer.allocation >= buffer.size);
        assert_eq!(buffer.state().unwrap(), ResourceState::Uninitialized);

        let mut output = vec![0u8; data.len()];
        buffer.read(&mut output).unwrap();
        assert_eq!(output, data);

        assert!(matches!(
            buffer.write(&[0u8; 257]),
            Err(MemoryError::Size(256, 257))
        ));
    }

    #[test]
    fn test_device_local_buffer_is_not_mapped() {
        let Some(context) = try_context() else {
            return;
        };
        let buffer = context
            .create_buffer(
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryKind::DeviceLocal,
                64,
                None,
            )
            .unwrap();
        // unified-memory devices expose device-local memory to the host
        if !buffer.memory_type.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            assert!(matches!(buffer.read(&mut [0u8; 4]), Err(MemoryError::Unmapped)));
        }
    }

    #[test]
    fn test_image_and_sampler() {
        let Some(context) = try_context() else {
            return;
        };
        let usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        let image = context
            .create_image(Extent::new(4, 8), PixelFormat::R32G32B32A32Float, usage)
            .unwrap();
        assert_eq!(image.copy_extent(), Extent::new(2, 4));
        assert_eq!(image.state().unwrap(), ResourceState::Uninitialized);

        let sampler = image.create_sampler().unwrap();
        assert_eq!(sampler.image.image, image.image);

        assert!(matches!(
            context.create_image(Extent::new(0, 8), PixelFormat::R32Float, usage),
            Err(ImageError::Empty(_))
        ));
    }

    #[test]
    fn test_storage_support_checked() {
        let Some(context) = try_context() else {
            return;
        };
        let format = PixelFormat::R16Float;
        let result = context.create_image(Extent::new(4, 4), format, vk::ImageUsageFlags::STORAGE);
        match context.supports_storage_image(format.to_vk()) {
            true => assert!(result.is_ok()),
            false => assert!(matches!(result, Err(ImageError::UnsupportedFormat(_)))),
        }
    }
}

#![allow(unsafe_op_in_unsafe_fn)]

use std::{
    path::PathBuf,
    pin::Pin,
    sync::{Arc, Mutex},
};

use derive_more::Display;
use itertools::Itertools;
use thiserror::Error;
use vulkanalia::prelude::v1_4::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    app::Context,
    format::Extent,
    resource::{Buffer, Image, Sampler},
};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to load kernel {}: {}", .0.display(), .1)]
    KernelLoadFailed(PathBuf, String),
    #[error("a pipeline needs at least one binding slot")]
    NoSlots,
    #[error("binding {binding} out of range for {count} slot(s)")]
    NoSuchSlot { binding: u32, count: usize },
    #[error("binding {binding} expects {expected}, got {found}")]
    SlotMismatch {
        binding: u32,
        expected: SlotKind,
        found: SlotKind,
    },
    #[error("binding {0} left unbound")]
    Unbound(u32),
    #[error("failed to lock pipeline resources")]
    Lock,
    #[error(transparent)]
    Vulkan(#[from] vk::ErrorCode),
}

/// What a kernel expects at one descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SlotKind {
    #[display("storage buffer")]
    StorageBuffer,
    #[display("storage image")]
    StorageImage,
    #[display("combined image sampler")]
    CombinedImageSampler,
}

impl SlotKind {
    pub const fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            SlotKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            SlotKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            SlotKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// Local size of a kernel invocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{x}x{y}x{z}")]
pub struct Workgroup {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Workgroup {
    #[inline]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

impl Default for Workgroup {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Constants baked into the kernel at pipeline creation.
///
/// | id | value         |
/// |----|---------------|
/// | 0  | input width   |
/// | 1  | input height  |
/// | 2  | filter width  |
/// | 3  | filter height |
/// | 4  | output width  |
/// | 5  | output height |
/// | 6  | local size x  |
/// | 7  | local size y  |
/// | 8  | local size z  |
///
/// Ids a kernel does not declare are ignored by the driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Specialization {
    pub input: Extent,
    pub filter: Extent,
    pub output: Extent,
    pub workgroup: Workgroup,
}

impl Specialization {
    pub const COUNT: usize = 9;

    pub fn constants(&self) -> [u32; Self::COUNT] {
        let Self {
            input,
            filter,
            output,
            workgroup,
        } = *self;
        [
            input.width,
            input.height,
            filter.width,
            filter.height,
            output.width,
            output.height,
            workgroup.x,
            workgroup.y,
            workgroup.z,
        ]
    }

    pub fn map_entries() -> Vec<vk::SpecializationMapEntry> {
        (0..Self::COUNT as u32)
            .map(|id| {
                let size = size_of::<u32>();
                vk::SpecializationMapEntry::builder()
                    .constant_id(id)
                    .offset(id * size as u32)
                    .size(size)
                    .build()
            })
            .collect()
    }
}

/// Checks size and magic number of a SPIR-V binary and returns its words.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.is_empty() || bytes.len() % size_of::<u32>() != 0 {
        return Err(format!("size {} is not a positive multiple of 4", bytes.len()));
    }
    let mut words = vec![0u32; bytes.len() / size_of::<u32>()];
    bytemuck::cast_slice_mut::<u32, u8>(&mut words).copy_from_slice(bytes);
    match words[0] {
        SPIRV_MAGIC => Ok(words),
        magic => Err(format!("bad magic number {magic:#010x}")),
    }
}

/// A compiled kernel addressed relative to an asset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub root: PathBuf,
    pub path: PathBuf,
}

impl KernelSource {
    pub fn new(root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
        }
    }

    #[inline]
    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.path)
    }

    #[inline]
    pub fn exists(&self) -> bool {
        self.full_path().is_file()
    }

    /// Reads and checks the binary.
    ///
    /// Every failure, from a missing file to a corrupt header, is
    /// [`KernelError::KernelLoadFailed`].
    pub fn load(&self) -> Result<Vec<u32>, KernelError> {
        let path = self.full_path();
        let bytes = std::fs::read(&path)
            .map_err(|err| KernelError::KernelLoadFailed(path.clone(), err.to_string()))?;
        let words = parse_spirv(&bytes)
            .map_err(|reason| KernelError::KernelLoadFailed(path.clone(), reason))?;
        log::debug!("loaded kernel {} ({} words)", path.display(), words.len());
        Ok(words)
    }
}

mod inner {
    use std::sync::Mutex;

    use vulkanalia::prelude::v1_4::*;

    #[derive(Debug)]
    pub struct Pipeline {
        pub context: crate::app::Context,
        pub slots: Vec<super::SlotKind>,
        pub module: vk::ShaderModule,
        pub descriptor_pool: vk::DescriptorPool,
        pub descriptor_set_layout: vk::DescriptorSetLayout,
        pub descriptor_set: vk::DescriptorSet,
        pub pipeline_layout: vk::PipelineLayout,
        pub pipeline: vk::Pipeline,
        pub resources: Mutex<Vec<super::BoundResource>>,
    }
}

impl Drop for inner::Pipeline {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            // frees the descriptor set with it
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            device.destroy_shader_module(self.module, None);
        }
    }
}

/// Builds the descriptor layout, set and compute pipeline for one slot list.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    context: Context,
    slots: Vec<SlotKind>,
    specialization: Specialization,
}

impl PipelineBuilder {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            slots: vec![],
            specialization: Specialization::default(),
        }
    }

    /// Binding `i` of set 0 gets `slots[i]`.
    pub fn slots(mut self, slots: &[SlotKind]) -> Self {
        self.slots = slots.to_vec();
        self
    }

    pub fn specialization(mut self, specialization: Specialization) -> Self {
        self.specialization = specialization;
        self
    }

    unsafe fn build_unsafe(self, code: &[u32]) -> Result<Pipeline, KernelError> {
        if self.slots.is_empty() {
            return Err(KernelError::NoSlots);
        }
        let device = &self.context.device;

        // null handles are skipped on drop, so every early return below cleans up
        let mut pipeline = inner::Pipeline {
            context: self.context.clone(),
            slots: self.slots.clone(),
            module: Default::default(),
            descriptor_pool: Default::default(),
            descriptor_set_layout: Default::default(),
            descriptor_set: Default::default(),
            pipeline_layout: Default::default(),
            pipeline: Default::default(),
            resources: Mutex::new(vec![]),
        };

        let info = vk::ShaderModuleCreateInfo::builder()
            .code_size(size_of_val(code))
            .code(code);
        pipeline.module = device.create_shader_module(&info, None)?;

        let sizes = self
            .slots
            .iter()
            .map(|slot| slot.descriptor_type())
            .counts()
            .into_iter()
            .map(|(r#type, count)| {
                vk::DescriptorPoolSize::builder()
                    .type_(r#type)
                    .descriptor_count(count as u32)
            })
            .collect_vec();
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1);
        pipeline.descriptor_pool = device.create_descriptor_pool(&info, None)?;

        let bindings = self
            .slots
            .iter()
            .enumerate()
            .map(|(binding, slot)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding as u32)
                    .descriptor_type(slot.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect_vec();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        pipeline.descriptor_set_layout = device.create_descriptor_set_layout(&info, None)?;

        let set_layouts = [pipeline.descriptor_set_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pipeline.descriptor_pool)
            .set_layouts(&set_layouts);
        pipeline.descriptor_set = device.allocate_descriptor_sets(&info)?[0];

        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        pipeline.pipeline_layout = device.create_pipeline_layout(&info, None)?;

        let constants = self.specialization.constants();
        let entries = Specialization::map_entries();
        let specialization_info = vk::SpecializationInfo::builder()
            .data(bytemuck::cast_slice(&constants))
            .map_entries(&entries);

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(pipeline.module)
            .name(c"main".to_bytes())
            .specialization_info(&specialization_info);
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline.pipeline_layout);
        pipeline.pipeline =
            device.create_compute_pipelines(self.context.pipeline_cache, &[info], None)?.0[0];

        log::debug!(
            "built pipeline with slots [{}], specialization {:?}",
            self.slots.iter().join(", "),
            constants
        );
        Ok(Pipeline(Arc::new(pipeline)))
    }

    /// Creates the pipeline from SPIR-V `code` with entry point `main`.
    #[inline]
    pub fn build(self, code: &[u32]) -> Result<Pipeline, KernelError> {
        unsafe { self.build_unsafe(code) }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline(Arc<inner::Pipeline>);

impl Pipeline {
    #[inline]
    pub fn slots(&self) -> &[SlotKind] {
        &self.0.slots
    }

    /// Binds the descriptor set and the compute pipeline.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state and every slot must have been bound.
    pub unsafe fn cmd_bind(&self, cmd: vk::CommandBuffer) {
        let device = &self.0.context.device;
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            self.0.pipeline_layout,
            0,
            &[self.0.descriptor_set],
            &[],
        );
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.0.pipeline);
    }

    /// Starts wiring resources to the pipeline's slots.
    ///
    /// ```ignore
    /// pipeline
    ///     .binder()
    ///     .bind_buffer(0, &output)?
    ///     .bind_buffer(1, &input)?
    ///     .bind_buffer(2, &filter)?
    ///     .build()?;
    /// ```
    #[inline]
    pub fn binder(&self) -> Binder {
        Binder {
            pipeline: self.clone(),
            writes: vec![],
            infos: vec![],
            resources: vec![],
            bound: vec![false; self.slots().len()],
        }
    }
}

/// A resource kept alive by the pipeline it is bound to.
#[derive(Debug, Clone)]
pub enum BoundResource {
    Buffer(Buffer),
    Image(Image),
    Sampler(Sampler),
}

#[derive(Debug, Clone)]
enum DescriptorInfo {
    Buffer(#[allow(dead_code)] Pin<Box<[vk::DescriptorBufferInfo]>>),
    Image(#[allow(dead_code)] Pin<Box<[vk::DescriptorImageInfo]>>),
}

/// Checks that `binding` exists in `slots` and expects `kind`.
pub fn check_slot(slots: &[SlotKind], binding: u32, kind: SlotKind) -> Result<(), KernelError> {
    let expected = *slots
        .get(binding as usize)
        .ok_or(KernelError::NoSuchSlot {
            binding,
            count: slots.len(),
        })?;
    match expected == kind {
        true => Ok(()),
        false => Err(KernelError::SlotMismatch {
            binding,
            expected,
            found: kind,
        }),
    }
}

/// Fails on the first slot never bound.
pub fn check_bound(bound: &[bool]) -> Result<(), KernelError> {
    match bound.iter().position(|bound| !bound) {
        Some(binding) => Err(KernelError::Unbound(binding as u32)),
        None => Ok(()),
    }
}

#[derive(Debug)]
pub struct Binder {
    pipeline: Pipeline,
    writes: Vec<vk::WriteDescriptorSet>,
    infos: Vec<DescriptorInfo>,
    resources: Vec<BoundResource>,
    bound: Vec<bool>,
}

impl Binder {
    fn push_buffer(
        mut self,
        binding: u32,
        kind: SlotKind,
        info: vk::DescriptorBufferInfo,
        resource: BoundResource,
    ) -> Result<Self, KernelError> {
        check_slot(self.pipeline.slots(), binding, kind)?;
        let info: Pin<Box<[_]>> = Box::pin([info]);
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.pipeline.0.descriptor_set)
            .dst_binding(binding)
            .descriptor_type(kind.descriptor_type())
            .buffer_info(&info)
            .build();
        self.infos.push(DescriptorInfo::Buffer(info));
        self.writes.push(write);
        self.resources.push(resource);
        self.bound[binding as usize] = true;
        Ok(self)
    }

    fn push_image(
        mut self,
        binding: u32,
        kind: SlotKind,
        info: vk::DescriptorImageInfo,
        resource: BoundResource,
    ) -> Result<Self, KernelError> {
        check_slot(self.pipeline.slots(), binding, kind)?;
        let info: Pin<Box<[_]>> = Box::pin([info]);
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.pipeline.0.descriptor_set)
            .dst_binding(binding)
            .descriptor_type(kind.descriptor_type())
            .image_info(&info)
            .build();
        self.infos.push(DescriptorInfo::Image(info));
        self.writes.push(write);
        self.resources.push(resource);
        self.bound[binding as usize] = true;
        Ok(self)
    }

    /// Binds a whole buffer to a [`SlotKind::StorageBuffer`] slot.
    pub fn bind_buffer(self, binding: u32, buffer: &Buffer) -> Result<Self, KernelError> {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer.buffer)
            .offset(0)
            .range(buffer.size as u64)
            .build();
        let resource = BoundResource::Buffer(buffer.clone());
        self.push_buffer(binding, SlotKind::StorageBuffer, info, resource)
    }

    /// Binds an image in `GENERAL` layout to a [`SlotKind::StorageImage`] slot.
    pub fn bind_image(self, binding: u32, image: &Image) -> Result<Self, KernelError> {
        let info = vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::GENERAL)
            .image_view(image.view)
            .build();
        let resource = BoundResource::Image(image.clone());
        self.push_image(binding, SlotKind::StorageImage, info, resource)
    }

    /// Binds a sampler and its image to a [`SlotKind::CombinedImageSampler`] slot.
    pub fn bind_sampler(self, binding: u32, sampler: &Sampler) -> Result<Self, KernelError> {
        let info = vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::GENERAL)
            .image_view(sampler.image.view)
            .sampler(sampler.sampler)
            .build();
        let resource = BoundResource::Sampler(sampler.clone());
        self.push_image(binding, SlotKind::CombinedImageSampler, info, resource)
    }

    unsafe fn build_unsafe(mut self) -> Result<(), KernelError> {
        check_bound(&self.bound)?;
        let pipeline = &self.pipeline.0;
        pipeline
            .context
            .device
            .update_descriptor_sets(&self.writes, &[] as &[vk::CopyDescriptorSet]);
        pipeline
            .resources
            .lock()
            .map_err(|_| KernelError::Lock)?
            .append(&mut self.resources);
        Ok(())
    }

    /// Writes every queued binding into the descriptor set.
    ///
    /// Fails with [`KernelError::Unbound`] unless every slot got a resource.
    pub fn build(self) -> Result<(), KernelError> {
        unsafe { self.build_unsafe() }
    }
}

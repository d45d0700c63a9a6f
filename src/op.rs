//! A compute operation: validate, upload, bind, dispatch, read back.

use std::time::Instant;

use derive_more::Display;
use thiserror::Error;

use crate::{
    app::Context,
    dispatch::{DispatchError, DispatchShape, Orchestrator},
    format::{Extent, PixelFormat},
    kernel::{KernelError, KernelSource, PipelineBuilder, SlotKind, Specialization, Workgroup},
    num::{DataType, Element},
    transfer::{
        TransferError, create_buffer_target, create_storage_target, download_buffer,
        download_image, upload_buffer, upload_image,
    },
};

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("{name} extent {extent} is empty")]
    Empty { name: &'static str, extent: Extent },
    #[error("workgroup {0} has a zero axis")]
    Workgroup(Workgroup),
    #[error("filter {filter} is larger than input {input}")]
    FilterTooLarge { input: Extent, filter: Extent },
    #[error("output extent {found} does not match the kernel's footprint {expected}")]
    Output { expected: Extent, found: Extent },
    #[error("{name} has {found} elements, expected {expected}")]
    Length {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("dispatch grid {shape} with workgroup {workgroup} does not cover output {output}")]
    Grid {
        shape: DispatchShape,
        workgroup: Workgroup,
        output: Extent,
    },
    #[error("packed format {format} needs an even extent, got {extent}")]
    Packed { format: PixelFormat, extent: Extent },
    #[error("no {operation} kernel reads {format} in the {variant} layout")]
    Unsupported {
        operation: Operation,
        variant: Variant,
        format: PixelFormat,
    },
    #[error("format {format} holds {expected} elements, got {found}")]
    Element {
        format: PixelFormat,
        expected: DataType,
        found: DataType,
    },
}

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What the kernel computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Operation {
    #[display("add")]
    Add,
    #[display("conv2d")]
    Conv2d,
}

/// Where input, filter and output live.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, clap::ValueEnum)]
pub enum Variant {
    /// Storage buffers throughout.
    #[default]
    #[display("buffer")]
    Buffer,
    /// Storage images in, storage buffer out.
    #[display("mixed")]
    Mixed,
    /// Storage images throughout.
    #[display("image")]
    Image,
}

impl Variant {
    /// Binding slots in kernel order: output, input, filter.
    pub const fn slots(self) -> [SlotKind; 3] {
        use SlotKind::{StorageBuffer, StorageImage};
        match self {
            Variant::Buffer => [StorageBuffer; 3],
            Variant::Mixed => [StorageBuffer, StorageImage, StorageImage],
            Variant::Image => [StorageImage; 3],
        }
    }

    #[inline]
    pub const fn has_images(self) -> bool {
        !matches!(self, Variant::Buffer)
    }

    /// Kernel shipped under the asset root for `operation` in this layout, if one reads
    /// `format`.
    ///
    /// Buffer kernels take `float` elements; image kernels declare `r32f`, except the
    /// packed `rgba32f` add.
    pub const fn default_kernel(
        self,
        operation: Operation,
        format: PixelFormat,
    ) -> Option<&'static str> {
        use PixelFormat::{R32Float, R32G32B32A32Float};

        let path = match (operation, self, format) {
            (Operation::Add, Variant::Buffer, R32Float | R32G32B32A32Float) => {
                "shaders/add/add_float.comp.spv"
            }
            (Operation::Add, Variant::Mixed, R32Float) => {
                "shaders/add_imager32f/add_imager32f.comp.spv"
            }
            (Operation::Add, Variant::Mixed, R32G32B32A32Float) => {
                "shaders/add_image/add_image.comp.spv"
            }
            (Operation::Add, Variant::Image, R32Float) => {
                "shaders/add_image2image/add_image2image.comp.spv"
            }
            (Operation::Conv2d, Variant::Buffer, R32Float | R32G32B32A32Float) => {
                "shaders/conv2d_buffer.comp.spv"
            }
            (Operation::Conv2d, Variant::Mixed, R32Float) => "shaders/conv2d_image.comp.spv",
            (Operation::Conv2d, Variant::Image, R32Float) => "shaders/conv2d_image2image.comp.spv",
            _ => return None,
        };
        Some(path)
    }
}

/// Everything one dispatch needs besides the data itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeParams {
    pub operation: Operation,
    pub variant: Variant,
    pub input: Extent,
    pub filter: Extent,
    pub output: Extent,
    pub workgroup: Workgroup,
    pub shape: DispatchShape,
    pub format: PixelFormat,
    pub kernel: KernelSource,
    pub timestamps: bool,
}

impl ComputeParams {
    /// Element-wise `output = input + filter`, all three of `extent`.
    pub fn elementwise(
        variant: Variant,
        extent: Extent,
        workgroup: Workgroup,
        format: PixelFormat,
        kernel: KernelSource,
    ) -> Self {
        Self {
            operation: Operation::Add,
            variant,
            input: extent,
            filter: extent,
            output: extent,
            workgroup,
            shape: DispatchShape::grid(extent, workgroup),
            format,
            kernel,
            timestamps: false,
        }
    }

    /// Valid 2-D convolution; the output shrinks by `filter - 1` on each axis.
    pub fn convolution(
        variant: Variant,
        input: Extent,
        filter: Extent,
        workgroup: Workgroup,
        format: PixelFormat,
        kernel: KernelSource,
    ) -> Self {
        let output = conv_output(input, filter);
        Self {
            operation: Operation::Conv2d,
            variant,
            input,
            filter,
            output,
            workgroup,
            shape: DispatchShape::grid(output, workgroup),
            format,
            kernel,
            timestamps: false,
        }
    }

    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn specialization(&self) -> Specialization {
        Specialization {
            input: self.input,
            filter: self.filter,
            output: self.output,
            workgroup: self.workgroup,
        }
    }

    /// The output extent the kernel writes, given input and filter.
    pub fn expected_output(&self) -> Extent {
        match self.operation {
            Operation::Add => self.input,
            Operation::Conv2d => conv_output(self.input, self.filter),
        }
    }

    /// Checks sizing consistency before any device work.
    pub fn validate<T: Element>(&self, input: &[T], filter: &[T]) -> Result<(), ParamsError> {
        for (name, extent) in [
            ("input", self.input),
            ("filter", self.filter),
            ("output", self.output),
        ] {
            if extent.is_empty() {
                return Err(ParamsError::Empty { name, extent });
            }
        }
        if self.workgroup.is_empty() {
            return Err(ParamsError::Workgroup(self.workgroup));
        }
        if self.variant.default_kernel(self.operation, self.format).is_none() {
            return Err(ParamsError::Unsupported {
                operation: self.operation,
                variant: self.variant,
                format: self.format,
            });
        }
        if self.operation == Operation::Conv2d
            && (self.filter.width > self.input.width || self.filter.height > self.input.height)
        {
            return Err(ParamsError::FilterTooLarge {
                input: self.input,
                filter: self.filter,
            });
        }

        let expected = self.expected_output();
        if self.output != expected {
            return Err(ParamsError::Output {
                expected,
                found: self.output,
            });
        }

        for (name, data, extent) in [("input", input, self.input), ("filter", filter, self.filter)] {
            if data.len() != extent.len() {
                return Err(ParamsError::Length {
                    name,
                    expected: extent.len(),
                    found: data.len(),
                });
            }
        }

        if !self.shape.covers(self.output, self.workgroup) {
            return Err(ParamsError::Grid {
                shape: self.shape,
                workgroup: self.workgroup,
                output: self.output,
            });
        }

        if self.variant.has_images() {
            for extent in [self.input, self.filter, self.output] {
                check_packed(self.format, extent)?;
            }
        }
        check_element::<T>(self.format)
    }
}

fn conv_output(input: Extent, filter: Extent) -> Extent {
    Extent::new(
        (input.width + 1).saturating_sub(filter.width),
        (input.height + 1).saturating_sub(filter.height),
    )
}

fn check_packed(format: PixelFormat, extent: Extent) -> Result<(), ParamsError> {
    match format.is_packed() && (extent.width % 2 != 0 || extent.height % 2 != 0) {
        true => Err(ParamsError::Packed { format, extent }),
        false => Ok(()),
    }
}

fn check_element<T: Element>(format: PixelFormat) -> Result<(), ParamsError> {
    match format.element() == T::DATA_TYPE {
        true => Ok(()),
        false => Err(ParamsError::Element {
            format,
            expected: format.element(),
            found: T::DATA_TYPE,
        }),
    }
}

fn timed<T>(stage: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let output = f();
    log::debug!("{stage}: {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);
    output
}

/// Data read back from a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Output<T> {
    pub data: Vec<T>,
    pub extent: Extent,
    /// GPU time of the dispatch alone, when timestamps were requested.
    pub dispatch_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ComputeOp {
    context: Context,
    params: ComputeParams,
}

impl ComputeOp {
    pub fn new(context: &Context, params: ComputeParams) -> Self {
        Self {
            context: context.clone(),
            params,
        }
    }

    #[inline]
    pub fn params(&self) -> &ComputeParams {
        &self.params
    }

    /// Runs the kernel once over `input` and `filter`.
    ///
    /// Every resource is created for this call and released before it returns.
    pub fn execute<T: Element>(&self, input: &[T], filter: &[T]) -> Result<Output<T>, OpError> {
        let params = &self.params;
        params.validate(input, filter)?;
        log::info!(
            "{} ({}): input {}, filter {}, output {}, workgroup {}, grid {}",
            params.operation,
            params.variant,
            params.input,
            params.filter,
            params.output,
            params.workgroup,
            params.shape
        );

        let code = timed("load kernel", || params.kernel.load())?;
        let pipeline = timed("build pipeline", || {
            PipelineBuilder::new(&self.context)
                .slots(&params.variant.slots())
                .specialization(params.specialization())
                .build(&code)
        })?;
        let mut orchestrator = Orchestrator::new(&self.context, params.timestamps)?;

        let context = &self.context;
        let format = params.format;
        let mut data = vec![T::zeroed(); params.output.len()];
        let input = bytemuck::cast_slice(input);
        let filter = bytemuck::cast_slice(filter);

        let dispatch_ms = match params.variant {
            Variant::Buffer => {
                let (input, filter, output) = timed("upload", || {
                    let input = upload_buffer(context, input)?;
                    let filter = upload_buffer(context, filter)?;
                    let output = create_buffer_target(context, size_of_val(data.as_slice()))?;
                    Ok::<_, TransferError>((input, filter, output))
                })?;
                pipeline
                    .binder()
                    .bind_buffer(0, &output)?
                    .bind_buffer(1, &input)?
                    .bind_buffer(2, &filter)?
                    .build()?;
                let ms = timed("dispatch", || {
                    orchestrator.run(&pipeline, params.shape, &[&input, &filter], &[&output])
                })?;
                timed("download", || {
                    download_buffer(context, &output, bytemuck::cast_slice_mut(&mut data))
                })?;
                ms
            }
            Variant::Mixed => {
                let (input, filter, output) = timed("upload", || {
                    let input = upload_image(context, input, params.input, format)?;
                    let filter = upload_image(context, filter, params.filter, format)?;
                    let output = create_buffer_target(context, size_of_val(data.as_slice()))?;
                    Ok::<_, TransferError>((input, filter, output))
                })?;
                pipeline
                    .binder()
                    .bind_buffer(0, &output)?
                    .bind_image(1, &input)?
                    .bind_image(2, &filter)?
                    .build()?;
                let ms = timed("dispatch", || {
                    orchestrator.run(&pipeline, params.shape, &[&input, &filter], &[&output])
                })?;
                timed("download", || {
                    download_buffer(context, &output, bytemuck::cast_slice_mut(&mut data))
                })?;
                ms
            }
            Variant::Image => {
                let (input, filter, output) = timed("upload", || {
                    let input = upload_image(context, input, params.input, format)?;
                    let filter = upload_image(context, filter, params.filter, format)?;
                    let output = create_storage_target(context, params.output, format)?;
                    Ok::<_, TransferError>((input, filter, output))
                })?;
                pipeline
                    .binder()
                    .bind_image(0, &output)?
                    .bind_image(1, &input)?
                    .bind_image(2, &filter)?
                    .build()?;
                let ms = timed("dispatch", || {
                    orchestrator.run(&pipeline, params.shape, &[&input, &filter], &[&output])
                })?;
                timed("download", || {
                    download_image(context, &output, bytemuck::cast_slice_mut(&mut data))
                })?;
                ms
            }
        };

        Ok(Output {
            data,
            extent: params.output,
            dispatch_ms,
        })
    }
}

/// Uploads `data` as an image and reads it straight back, with no dispatch in between.
pub fn copy_image<T: Element>(
    context: &Context,
    data: &[T],
    extent: Extent,
    format: PixelFormat,
) -> Result<Vec<T>, OpError> {
    if extent.is_empty() {
        return Err(ParamsError::Empty {
            name: "image",
            extent,
        }
        .into());
    }
    if data.len() != extent.len() {
        return Err(ParamsError::Length {
            name: "image",
            expected: extent.len(),
            found: data.len(),
        }
        .into());
    }
    check_packed(format, extent)?;
    check_element::<T>(format)?;

    log::info!("copy image: {extent} {format}");
    let image = timed("upload", || {
        upload_image(context, bytemuck::cast_slice(data), extent, format)
    })?;
    let mut output = vec![T::zeroed(); data.len()];
    timed("download", || {
        download_image(context, &image, bytemuck::cast_slice_mut(&mut output))
    })?;
    Ok(output)
}

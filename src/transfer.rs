//! Host/device transfers through transient staging resources.
//!
//! Every function here records one command buffer, submits it with its own fence and
//! blocks until the device is done, so a staging resource is never shared by two
//! transfers in flight.

use thiserror::Error;
use vulkanalia::prelude::v1_4::*;

use crate::{
    app::Context,
    format::{Extent, PixelFormat},
    memory::{MemoryError, MemoryKind},
    resource::{Buffer, Image, ImageError, Tracked},
    state::{Barrier, ResourceState, StateError, Target},
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer size mismatch: expected {0} bytes, got {1}")]
    Size(usize, usize),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Vulkan(#[from] vk::ErrorCode),
}

/// Usage of device-local buffers that kernels read or write.
pub const DEVICE_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_bits_truncate(
    vk::BufferUsageFlags::STORAGE_BUFFER.bits()
        | vk::BufferUsageFlags::TRANSFER_SRC.bits()
        | vk::BufferUsageFlags::TRANSFER_DST.bits(),
);

/// Usage of device-local images that kernels sample, read or write.
pub const DEVICE_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_bits_truncate(
    vk::ImageUsageFlags::TRANSFER_DST.bits()
        | vk::ImageUsageFlags::TRANSFER_SRC.bits()
        | vk::ImageUsageFlags::SAMPLED.bits()
        | vk::ImageUsageFlags::STORAGE.bits(),
);

/// Records `barriers`, routing staging-side ones to `staging`.
unsafe fn cmd_barriers(
    cmd: vk::CommandBuffer,
    resource: &impl Tracked,
    barriers: &[Barrier],
    staging: impl Fn(&Barrier),
) {
    for barrier in barriers {
        match barrier.target {
            Target::Resource => unsafe { resource.cmd_barrier(cmd, barrier) },
            Target::Staging => staging(barrier),
        }
    }
}

/// Copies `data` into a new device-local storage buffer.
///
/// The returned buffer is [`ResourceState::HostWritten`].
pub fn upload_buffer(context: &Context, data: &[u8]) -> Result<Buffer, TransferError> {
    let staging = context.create_buffer(
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryKind::HostVisible,
        data.len(),
        Some(data),
    )?;
    let buffer = context.create_buffer(DEVICE_BUFFER_USAGE, MemoryKind::DeviceLocal, data.len(), None)?;

    let transition = buffer.advance(ResourceState::HostWritten)?;
    context.one_shot(|cmd| unsafe {
        let staged = |barrier: &Barrier| staging.cmd_barrier(cmd, barrier);
        cmd_barriers(cmd, &buffer, &transition.before, staged);
        buffer.cmd_copy_from(cmd, &staging);
        cmd_barriers(cmd, &buffer, &transition.after, staged);
        Ok::<_, TransferError>(())
    })?;

    log::debug!("uploaded {} bytes to buffer", data.len());
    Ok(buffer)
}

/// Copies the start of `buffer` into `data`.
///
/// The buffer must be [`ResourceState::DeviceWritten`] or [`ResourceState::HostWritten`]
/// and ends up [`ResourceState::HostReadable`].
pub fn download_buffer(
    context: &Context,
    buffer: &Buffer,
    data: &mut [u8],
) -> Result<(), TransferError> {
    if data.len() > buffer.size {
        return Err(TransferError::Size(buffer.size, data.len()));
    }
    let staging = context.create_buffer(
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryKind::HostVisible,
        buffer.size,
        None,
    )?;

    let transition = buffer.advance(ResourceState::HostReadable)?;
    context.one_shot(|cmd| unsafe {
        let staged = |barrier: &Barrier| staging.cmd_barrier(cmd, barrier);
        cmd_barriers(cmd, buffer, &transition.before, staged);
        staging.cmd_copy_from(cmd, buffer);
        cmd_barriers(cmd, buffer, &transition.after, staged);
        Ok::<_, TransferError>(())
    })?;

    staging.read(data)?;
    log::debug!("downloaded {} bytes from buffer", data.len());
    Ok(())
}

/// Copies `data` into a new device-local image and leaves it in `GENERAL` layout.
///
/// `data` is the host array for the logical `extent`; for packed formats it covers the
/// halved copy region (see [`PixelFormat::copy_extent`]).
pub fn upload_image(
    context: &Context,
    data: &[u8],
    extent: Extent,
    format: PixelFormat,
) -> Result<Image, TransferError> {
    let size = format.copy_size(extent);
    if data.len() != size {
        return Err(TransferError::Size(size, data.len()));
    }
    let staging = context.create_buffer(
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryKind::HostVisible,
        size,
        Some(data),
    )?;
    let image = context.create_image(extent, format, DEVICE_IMAGE_USAGE)?;

    let transition = image.advance(ResourceState::HostWritten)?;
    context.one_shot(|cmd| unsafe {
        let staged = |barrier: &Barrier| staging.cmd_barrier(cmd, barrier);
        cmd_barriers(cmd, &image, &transition.before, staged);
        image.cmd_copy_from_buffer(cmd, &staging);
        cmd_barriers(cmd, &image, &transition.after, staged);
        Ok::<_, TransferError>(())
    })?;

    log::debug!("uploaded {size} bytes to {extent} {format} image");
    Ok(image)
}

/// Copies the copy region of `image` into `data`, honoring the device row pitch.
pub fn download_image(
    context: &Context,
    image: &Image,
    data: &mut [u8],
) -> Result<(), TransferError> {
    let size = image.format.copy_size(image.extent);
    if data.len() != size {
        return Err(TransferError::Size(size, data.len()));
    }
    let staging = context.create_linear_image(image.copy_extent(), image.format)?;

    let transition = image.advance(ResourceState::HostReadable)?;
    context.one_shot(|cmd| unsafe {
        let staged = |barrier: &Barrier| staging.cmd_barrier(cmd, barrier);
        cmd_barriers(cmd, image, &transition.before, staged);
        staging.cmd_copy_from_image(cmd, image);
        cmd_barriers(cmd, image, &transition.after, staged);
        Ok::<_, TransferError>(())
    })?;

    let pitch = staging.row_pitch();
    log::debug!(
        "downloading {size} bytes from {} {} image, row pitch {} for {} bytes per row",
        image.extent,
        image.format,
        pitch.row_pitch,
        pitch.row_size
    );
    staging.read(data)?;
    Ok(())
}

/// Moves a fresh resource to [`ResourceState::DeviceReadable`], recording whatever
/// layout change that needs.
fn prepare_target(context: &Context, resource: &impl Tracked) -> Result<(), TransferError> {
    let transition = resource.advance(ResourceState::DeviceReadable)?;
    if transition.is_empty() {
        return Ok(());
    }
    context.one_shot(|cmd| unsafe {
        resource.cmd_barriers(cmd, &transition.before);
        resource.cmd_barriers(cmd, &transition.after);
        Ok::<_, TransferError>(())
    })
}

/// Creates a device-local buffer of `size` bytes for a kernel to write.
pub fn create_buffer_target(context: &Context, size: usize) -> Result<Buffer, TransferError> {
    let buffer = context.create_buffer(DEVICE_BUFFER_USAGE, MemoryKind::DeviceLocal, size, None)?;
    prepare_target(context, &buffer)?;
    Ok(buffer)
}

/// Creates a device-local storage image for a kernel to write, already in `GENERAL` layout.
///
/// Fails with [`ImageError::UnsupportedFormat`] when the device cannot use `format` as a
/// storage image.
pub fn create_storage_target(
    context: &Context,
    extent: Extent,
    format: PixelFormat,
) -> Result<Image, TransferError> {
    let image = context.create_image(extent, format, DEVICE_IMAGE_USAGE)?;
    prepare_target(context, &image)?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use crate::{
        app::try_context,
        format::{Extent, PixelFormat},
        resource::Tracked,
        state::{ResourceState, StateError},
    };

    use super::{
        TransferError, create_buffer_target, download_buffer, download_image, upload_buffer,
        upload_image,
    };

    #[test]
    fn test_buffer_round_trip() {
        let Some(context) = try_context() else {
            return;
        };
        let data: Vec<f32> = (0..64).map(|x| x as f32 * 0.5).collect();
        let buffer = upload_buffer(&context, bytemuck::cast_slice(&data)).unwrap();
        assert_eq!(buffer.state().unwrap(), ResourceState::HostWritten);

        let mut output = vec![0f32; data.len()];
        download_buffer(&context, &buffer, bytemuck::cast_slice_mut(&mut output)).unwrap();
        assert_eq!(buffer.state().unwrap(), ResourceState::HostReadable);
        assert_eq!(output, data);
    }

    #[test]
    fn test_image_round_trip() {
        let Some(context) = try_context() else {
            return;
        };
        let extent = Extent::new(4, 8);
        let data: Vec<f32> = (0..extent.len()).map(|x| x as f32).collect();
        let image =
            upload_image(&context, bytemuck::cast_slice(&data), extent, PixelFormat::R32Float)
                .unwrap();

        let mut output = vec![0f32; data.len()];
        download_image(&context, &image, bytemuck::cast_slice_mut(&mut output)).unwrap();
        assert_eq!(output, data);
    }

    #[test]
    fn test_packed_image_round_trip() {
        let Some(context) = try_context() else {
            return;
        };
        // 4x8 logical elements travel as 2x4 RGBA texels
        let extent = Extent::new(4, 8);
        let data: Vec<f32> = (0..extent.len()).map(|x| x as f32).collect();
        let format = PixelFormat::R32G32B32A32Float;
        let image = upload_image(&context, bytemuck::cast_slice(&data), extent, format).unwrap();
        assert_eq!(image.copy_extent(), Extent::new(2, 4));

        let mut output = vec![0f32; data.len()];
        download_image(&context, &image, bytemuck::cast_slice_mut(&mut output)).unwrap();
        assert_eq!(output, data);
    }

    #[test]
    fn test_odd_width_image_round_trip() {
        let Some(context) = try_context() else {
            return;
        };
        let format = PixelFormat::R32Uint;
        // the first odd width whose readback rows the device pads
        let extent = [3, 5, 7, 13, 33]
            .map(|width| Extent::new(width, 5))
            .into_iter()
            .find(|&extent| {
                let pitch = context
                    .create_linear_image(extent, format)
                    .unwrap()
                    .row_pitch();
                pitch.row_pitch > pitch.row_size
            })
            .expect("linear image rows are never padded on this device");
        let pitch = context
            .create_linear_image(extent, format)
            .unwrap()
            .row_pitch();
        assert!(pitch.row_pitch > pitch.row_size);
        assert_eq!(pitch.row_size, extent.width as usize * 4);

        let data: Vec<u32> = (0..extent.len() as u32).map(|x| x * 7 + 1).collect();
        let image = upload_image(&context, bytemuck::cast_slice(&data), extent, format).unwrap();

        let mut output = vec![0u32; data.len()];
        download_image(&context, &image, bytemuck::cast_slice_mut(&mut output)).unwrap();
        assert_eq!(output, data);
    }

    #[test]
    fn test_image_size_mismatch() {
        let Some(context) = try_context() else {
            return;
        };
        let err = upload_image(&context, &[0u8; 12], Extent::new(2, 2), PixelFormat::R32Float)
            .unwrap_err();
        assert!(matches!(err, TransferError::Size(16, 12)));
    }

    #[test]
    fn test_unwritten_target_cannot_be_read() {
        let Some(context) = try_context() else {
            return;
        };
        let buffer = create_buffer_target(&context, 64).unwrap();
        assert_eq!(buffer.state().unwrap(), ResourceState::DeviceReadable);

        let mut output = [0u8; 64];
        let err = download_buffer(&context, &buffer, &mut output).unwrap_err();
        assert!(matches!(
            err,
            TransferError::State(StateError::IllegalTransition {
                from: ResourceState::DeviceReadable,
                to: ResourceState::HostReadable,
                ..
            })
        ));
        // refused steps leave the state alone
        assert_eq!(buffer.state().unwrap(), ResourceState::DeviceReadable);
    }
}

use derive_more::Display;
use vulkanalia::prelude::v1_4::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::num::DataType;

/// Width and height of a 2-D problem, image or copy region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{width}x{height}")]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of elements covered.
    #[inline]
    pub const fn len(self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn to_vk(self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: 1,
        }
    }
}

impl From<[u32; 2]> for Extent {
    #[inline]
    fn from([width, height]: [u32; 2]) -> Self {
        Self { width, height }
    }
}

/// Pixel formats an image-mode operation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, clap::ValueEnum)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PixelFormat {
    #[display("r32_sfloat")]
    #[value(name = "r32_sfloat")]
    R32Float,
    #[display("r32_uint")]
    #[value(name = "r32_uint")]
    R32Uint,
    #[display("r32_sint")]
    #[value(name = "r32_sint")]
    R32Sint,
    #[display("r16_sfloat")]
    #[value(name = "r16_sfloat")]
    R16Float,
    #[display("r32g32b32a32_sfloat")]
    #[value(name = "r32g32b32a32_sfloat")]
    R32G32B32A32Float,
}

impl PixelFormat {
    pub const fn to_vk(self) -> vk::Format {
        match self {
            PixelFormat::R32Float => vk::Format::R32_SFLOAT,
            PixelFormat::R32Uint => vk::Format::R32_UINT,
            PixelFormat::R32Sint => vk::Format::R32_SINT,
            PixelFormat::R16Float => vk::Format::R16_SFLOAT,
            PixelFormat::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        }
    }

    /// Bytes of one texel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::R32Float | PixelFormat::R32Uint | PixelFormat::R32Sint => 4,
            PixelFormat::R16Float => 2,
            PixelFormat::R32G32B32A32Float => 16,
        }
    }

    /// Scalar type of a single component.
    pub const fn element(self) -> DataType {
        match self {
            PixelFormat::R32Float | PixelFormat::R32G32B32A32Float => DataType::F32,
            PixelFormat::R32Uint => DataType::U32,
            PixelFormat::R32Sint => DataType::I32,
            PixelFormat::R16Float => DataType::F16,
        }
    }

    /// Whether one texel packs several logical elements of the host array.
    ///
    /// For these formats a `width x height` host array addresses only
    /// `width/2 x height/2` texels on copy.
    pub const fn is_packed(self) -> bool {
        matches!(self, PixelFormat::R32G32B32A32Float)
    }

    /// The region a buffer/image copy addresses for a logical `extent`.
    pub const fn copy_extent(self, extent: Extent) -> Extent {
        match self.is_packed() {
            true => Extent::new(extent.width / 2, extent.height / 2),
            false => extent,
        }
    }

    /// Bytes moved by one copy of a logical `extent`.
    pub const fn copy_size(self, extent: Extent) -> usize {
        self.copy_extent(extent).len() * self.bytes_per_pixel()
    }
}

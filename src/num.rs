use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F16,
    F32,
    I32,
    U32,
}

impl DataType {
    /// Element Size in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
        }
    }
}

/// A host-side array element that can be copied to and from device memory.
pub trait Element: Sized + Copy + PartialEq + Pod + Zeroable + Send + Sync + std::fmt::Debug {
    const DATA_TYPE: DataType;

    /// The value placed at `index` by a sequential fill.
    fn from_index(index: usize) -> Self;

    fn from_i8(value: i8) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    fn from_index(index: usize) -> Self {
        index as f32
    }

    fn from_i8(value: i8) -> Self {
        value as f32
    }
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    fn from_index(index: usize) -> Self {
        f16::from_f32(index as f32)
    }

    fn from_i8(value: i8) -> Self {
        f16::from_f32(value as f32)
    }
}

impl Element for u32 {
    const DATA_TYPE: DataType = DataType::U32;

    fn from_index(index: usize) -> Self {
        index as u32
    }

    fn from_i8(value: i8) -> Self {
        value as u32
    }
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::I32;

    fn from_index(index: usize) -> Self {
        index as i32
    }

    fn from_i8(value: i8) -> Self {
        value as i32
    }
}

/// How input and filter arrays are populated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Fill {
    /// `0, 1, 2, ...`
    #[default]
    Sequential,
    /// Small integers in `-2..=2` from the global `fastrand` generator.
    Random,
}

impl Fill {
    pub fn generate<T: Element>(self, len: usize) -> Vec<T> {
        match self {
            Fill::Sequential => (0..len).map(T::from_index).collect(),
            Fill::Random => (0..len)
                .map(|_| fastrand::i8(-2..=2))
                .map(T::from_i8)
                .collect(),
        }
    }
}

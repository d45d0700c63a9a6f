use std::ptr::NonNull;

use derive_more::Display;
use thiserror::Error;
use vulkanalia::prelude::v1_4::*;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no memory type matches {kind} (allowed type bits {bits:#b})")]
    NoMatchingMemoryType { kind: MemoryKind, bits: u32 },
    #[error("mapped range too small: {0} < {1}")]
    Size(usize, usize),
    #[error("memory is not host visible")]
    Unmapped,
    #[error(transparent)]
    Vulkan(#[from] vk::ErrorCode),
}

/// The requested class of memory for a resource.
///
/// A resource is either device-local or host-visible, never both. The chosen
/// memory type may still carry extra flags (e.g. a device-local type on a
/// unified-memory device is usually host-visible too).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MemoryKind {
    #[display("device-local")]
    DeviceLocal,
    /// Mappable, coherence not required.
    #[display("host-visible")]
    HostVisible,
    #[display("host-visible coherent")]
    HostCoherent,
}

impl MemoryKind {
    pub fn flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryKind::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryKind::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE,
            MemoryKind::HostCoherent => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// A memory type picked from the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub index: u32,
    pub flags: vk::MemoryPropertyFlags,
}

impl MemoryType {
    #[inline]
    pub fn is_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// The device's memory-type property table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub types: Vec<vk::MemoryPropertyFlags>,
}

impl MemoryTable {
    /// Builds a table from bare property flags, one entry per type index.
    pub fn from_flags(types: impl IntoIterator<Item = vk::MemoryPropertyFlags>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }

    /// Picks the first type allowed by `bits` whose flags are a superset of `kind`.
    pub fn find(&self, bits: u32, kind: MemoryKind) -> Result<MemoryType, MemoryError> {
        let required = kind.flags();
        self.types
            .iter()
            .enumerate()
            .filter(|&(index, _)| index < 32 && (1u32 << index) & bits != 0)
            .find(|(_, flags)| flags.contains(required))
            .map(|(index, &flags)| MemoryType {
                index: index as u32,
                flags,
            })
            .ok_or(MemoryError::NoMatchingMemoryType { kind, bits })
    }
}

impl From<vk::PhysicalDeviceMemoryProperties> for MemoryTable {
    fn from(value: vk::PhysicalDeviceMemoryProperties) -> Self {
        let types = value
            .memory_types
            .iter()
            .take(value.memory_type_count as usize)
            .map(|r#type| r#type.property_flags)
            .collect();
        Self { types }
    }
}

/// Host access to a mapped range of device memory.
pub trait HostMapping {
    /// Whether host and device see each other's writes without explicit flush/invalidate.
    fn is_coherent(&self) -> bool;

    fn as_bytes(&self) -> &[u8];

    fn as_bytes_mut(&mut self) -> &mut [u8];

    /// Makes host writes to the mapped range available to the device.
    fn flush(&mut self) -> Result<(), MemoryError>;

    /// Makes device writes to the mapped range visible to the host.
    fn invalidate(&mut self) -> Result<(), MemoryError>;
}

/// Copies `data` into the start of a mapping, flushing when the memory is not coherent.
pub fn write_mapped(mapping: &mut impl HostMapping, data: &[u8]) -> Result<(), MemoryError> {
    let dst = mapping.as_bytes_mut();
    if dst.len() < data.len() {
        return Err(MemoryError::Size(dst.len(), data.len()));
    }
    dst[..data.len()].copy_from_slice(data);
    if !mapping.is_coherent() {
        mapping.flush()?;
    }
    Ok(())
}

/// Copies the start of a mapping into `data`, invalidating first when the memory is not coherent.
pub fn read_mapped(mapping: &mut impl HostMapping, data: &mut [u8]) -> Result<(), MemoryError> {
    if !mapping.is_coherent() {
        mapping.invalidate()?;
    }
    let src = mapping.as_bytes();
    if src.len() < data.len() {
        return Err(MemoryError::Size(src.len(), data.len()));
    }
    data.copy_from_slice(&src[..data.len()]);
    Ok(())
}

/// Placement of a 2-D region inside mapped linear-image memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPitch {
    /// Byte offset of the first row.
    pub offset: usize,
    /// Stride between rows as reported by the device; at least `row_size`.
    pub row_pitch: usize,
    /// Bytes of payload per row.
    pub row_size: usize,
    pub rows: usize,
}

/// Gathers `rows` rows of `row_size` bytes strided by `row_pitch` into a tight `dst`.
pub fn copy_pitched_rows(src: &[u8], pitch: RowPitch, dst: &mut [u8]) -> Result<(), MemoryError> {
    let RowPitch {
        offset,
        row_pitch,
        row_size,
        rows,
    } = pitch;
    if rows == 0 || row_size == 0 {
        return Ok(());
    }

    let required = offset + (rows - 1) * row_pitch.max(row_size) + row_size;
    if src.len() < required {
        return Err(MemoryError::Size(src.len(), required));
    }
    if dst.len() < rows * row_size {
        return Err(MemoryError::Size(dst.len(), rows * row_size));
    }

    for (row, chunk) in dst.chunks_exact_mut(row_size).take(rows).enumerate() {
        let start = offset + row * row_pitch.max(row_size);
        chunk.copy_from_slice(&src[start..start + row_size]);
    }
    Ok(())
}

/// Like [`read_mapped`], but honoring the device row pitch.
pub fn read_mapped_pitched(
    mapping: &mut impl HostMapping,
    pitch: RowPitch,
    data: &mut [u8],
) -> Result<(), MemoryError> {
    if !mapping.is_coherent() {
        mapping.invalidate()?;
    }
    copy_pitched_rows(mapping.as_bytes(), pitch, data)
}

/// A whole-allocation mapping of Vulkan device memory, unmapped on drop.
#[derive(Debug)]
pub struct MappedMemory<'a> {
    device: &'a Device,
    memory: vk::DeviceMemory,
    ptr: NonNull<u8>,
    size: usize,
    coherent: bool,
}

impl<'a> MappedMemory<'a> {
    /// Maps `memory` from offset 0 to its end.
    ///
    /// # Safety
    ///
    /// - `memory` must be a host-visible allocation of at least `size` bytes made from `device`
    /// - `memory` must not be mapped already
    /// - the device must not access the range while the mapping is read or written
    pub unsafe fn new(
        device: &'a Device,
        memory: vk::DeviceMemory,
        size: usize,
        coherent: bool,
    ) -> Result<Self, MemoryError> {
        let whole = vk::WHOLE_SIZE as vk::DeviceSize;
        let ptr = device.map_memory(memory, 0, whole, vk::MemoryMapFlags::empty())?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(MemoryError::Unmapped)?;
        Ok(Self {
            device,
            memory,
            ptr,
            size,
            coherent,
        })
    }

    fn range(&self) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE as vk::DeviceSize)
            .build()
    }
}

impl HostMapping for MappedMemory<'_> {
    #[inline]
    fn is_coherent(&self) -> bool {
        self.coherent
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapping covers `size` bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    fn flush(&mut self) -> Result<(), MemoryError> {
        let range = self.range();
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn invalidate(&mut self) -> Result<(), MemoryError> {
        let range = self.range();
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

#[cfg(test)]
mod tests {
    use vulkanalia::prelude::v1_4::*;

    use super::{
        HostMapping, MemoryError, MemoryKind, MemoryTable, RowPitch, copy_pitched_rows,
        read_mapped, read_mapped_pitched, write_mapped,
    };

    /// Host-visible memory with a host-side cache in front of the device copy.
    ///
    /// When coherent, the cache is the device copy. Otherwise the two only meet on
    /// `flush` (host to device) and `invalidate` (device to host).
    struct SimulatedMemory {
        coherent: bool,
        cache: Vec<u8>,
        device: Vec<u8>,
        flushes: usize,
        invalidations: usize,
    }

    impl SimulatedMemory {
        fn new(size: usize, coherent: bool) -> Self {
            Self {
                coherent,
                cache: vec![0; size],
                device: vec![0; size],
                flushes: 0,
                invalidations: 0,
            }
        }

        /// What the device observes.
        fn device_view(&self) -> &[u8] {
            match self.coherent {
                true => &self.cache,
                false => &self.device,
            }
        }

        /// A kernel or transfer writing the allocation.
        fn device_write(&mut self, data: &[u8]) {
            match self.coherent {
                true => self.cache[..data.len()].copy_from_slice(data),
                false => self.device[..data.len()].copy_from_slice(data),
            }
        }
    }

    impl HostMapping for SimulatedMemory {
        fn is_coherent(&self) -> bool {
            self.coherent
        }

        fn as_bytes(&self) -> &[u8] {
            &self.cache
        }

        fn as_bytes_mut(&mut self) -> &mut [u8] {
            &mut self.cache
        }

        fn flush(&mut self) -> Result<(), MemoryError> {
            self.flushes += 1;
            self.device.copy_from_slice(&self.cache);
            Ok(())
        }

        fn invalidate(&mut self) -> Result<(), MemoryError> {
            self.invalidations += 1;
            self.cache.copy_from_slice(&self.device);
            Ok(())
        }
    }

    fn desktop_table() -> MemoryTable {
        MemoryTable::from_flags([
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ])
    }

    #[test]
    fn test_find_first_superset() {
        let table = desktop_table();

        let r#type = table.find(u32::MAX, MemoryKind::DeviceLocal).unwrap();
        assert_eq!(r#type.index, 0);
        assert!(!r#type.is_coherent());

        let r#type = table.find(u32::MAX, MemoryKind::HostVisible).unwrap();
        assert_eq!(r#type.index, 1);
        assert!(!r#type.is_coherent());

        let r#type = table.find(u32::MAX, MemoryKind::HostCoherent).unwrap();
        assert_eq!(r#type.index, 2);
        assert!(r#type.is_coherent());
    }

    #[test]
    fn test_find_honors_requirement_bits() {
        let table = desktop_table();

        // type 2 is excluded by the resource, type 3 is the next superset
        let r#type = table.find(0b1001, MemoryKind::HostCoherent).unwrap();
        assert_eq!(r#type.index, 3);

        // only type 3 allowed, which is a superset of plain host-visible
        let r#type = table.find(0b1000, MemoryKind::HostVisible).unwrap();
        assert_eq!(r#type.index, 3);
    }

    #[test]
    fn test_unified_memory_device_local_superset() {
        let table = MemoryTable::from_flags([vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT]);
        assert_eq!(table.find(1, MemoryKind::DeviceLocal).unwrap().index, 0);
        assert_eq!(table.find(1, MemoryKind::HostCoherent).unwrap().index, 0);
    }

    #[test]
    fn test_missing_memory_type_fails() {
        let table = MemoryTable::from_flags([vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = table.find(u32::MAX, MemoryKind::HostVisible).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::NoMatchingMemoryType {
                kind: MemoryKind::HostVisible,
                ..
            }
        ));

        // a matching type the resource cannot use is as good as none
        let err = desktop_table().find(0b0001, MemoryKind::HostCoherent).unwrap_err();
        assert!(matches!(err, MemoryError::NoMatchingMemoryType { bits: 1, .. }));

        // empty table: nothing is ever picked
        assert!(MemoryTable::default().find(u32::MAX, MemoryKind::DeviceLocal).is_err());
    }

    #[test]
    fn test_write_flushes_non_coherent_memory() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut memory = SimulatedMemory::new(16, false);
        write_mapped(&mut memory, &data).unwrap();
        assert_eq!(memory.flushes, 1);
        assert_eq!(&memory.device_view()[..8], &data);
    }

    #[test]
    fn test_skipped_flush_leaves_device_stale() {
        let data = [9u8; 8];
        let mut memory = SimulatedMemory::new(8, false);

        // the host copy without the flush step
        memory.as_bytes_mut().copy_from_slice(&data);
        assert_ne!(memory.device_view(), &data);
        assert_eq!(memory.device_view(), &[0u8; 8]);

        memory.flush().unwrap();
        assert_eq!(memory.device_view(), &data);
    }

    #[test]
    fn test_coherent_write_skips_flush() {
        let data = [7u8; 4];
        let mut memory = SimulatedMemory::new(4, true);
        write_mapped(&mut memory, &data).unwrap();
        assert_eq!(memory.flushes, 0);
        assert_eq!(memory.device_view(), &data);
    }

    #[test]
    fn test_read_invalidates_non_coherent_memory() {
        let mut memory = SimulatedMemory::new(4, false);
        memory.device_write(&[4, 3, 2, 1]);

        // without invalidation the host still sees its cached zeros
        assert_eq!(memory.as_bytes(), &[0u8; 4]);

        let mut out = [0u8; 4];
        read_mapped(&mut memory, &mut out).unwrap();
        assert_eq!(memory.invalidations, 1);
        assert_eq!(out, [4, 3, 2, 1]);

        let mut memory = SimulatedMemory::new(4, true);
        memory.device_write(&[1, 1, 2, 2]);
        read_mapped(&mut memory, &mut out).unwrap();
        assert_eq!(memory.invalidations, 0);
        assert_eq!(out, [1, 1, 2, 2]);
    }

    #[test]
    fn test_padded_row_pitch() {
        // 3 texels of 4 bytes per row, padded to a 16-byte pitch after a 8-byte offset
        let pitch = RowPitch {
            offset: 8,
            row_pitch: 16,
            row_size: 12,
            rows: 2,
        };
        let mut src = vec![0xffu8; 8 + 16 + 12];
        src[8..20].copy_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        src[24..36].copy_from_slice(&[4, 4, 4, 4, 5, 5, 5, 5, 6, 6, 6, 6]);

        let mut dst = vec![0u8; 24];
        copy_pitched_rows(&src, pitch, &mut dst).unwrap();
        assert_eq!(&dst[..12], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(&dst[12..], &[4, 4, 4, 4, 5, 5, 5, 5, 6, 6, 6, 6]);
        assert!(!dst.contains(&0xff));

        // striding by the logical row size would have picked up padding
        let naive = &src[8..8 + 24];
        assert_ne!(naive, dst.as_slice());
    }

    #[test]
    fn test_pitched_read_invalidates() {
        let pitch = RowPitch {
            offset: 0,
            row_pitch: 8,
            row_size: 4,
            rows: 2,
        };
        let mut memory = SimulatedMemory::new(16, false);
        memory.device_write(&[1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8]);

        let mut out = [0u8; 8];
        read_mapped_pitched(&mut memory, pitch, &mut out).unwrap();
        assert_eq!(memory.invalidations, 1);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

        let short = RowPitch { rows: 3, ..pitch };
        assert!(matches!(
            copy_pitched_rows(memory.as_bytes(), short, &mut [0u8; 12]),
            Err(MemoryError::Size(16, 20))
        ));
    }

    #[test]
    fn test_mapping_too_small() {
        let mut memory = SimulatedMemory::new(4, false);
        let err = write_mapped(&mut memory, &[0u8; 5]).unwrap_err();
        assert!(matches!(err, MemoryError::Size(4, 5)));
        assert_eq!(memory.flushes, 0);

        let mut out = [0u8; 8];
        assert!(matches!(
            read_mapped(&mut memory, &mut out),
            Err(MemoryError::Size(4, 8))
        ));
    }
}

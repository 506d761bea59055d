//! CPU mappings of GPU resources.

use std::ptr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
    ReadWrite,
    /// Previous contents are discarded; the GPU may still be reading them.
    WriteDiscard,
    /// The caller promises not to overwrite data the GPU is using.
    WriteNoOverwrite,
}

impl MapMode {
    pub fn reads(self) -> bool {
        matches!(self, MapMode::Read | MapMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        !matches!(self, MapMode::Read)
    }
}

/// Pointer and pitches of a mapped subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBox {
    pub data_pointer: *mut u8,
    pub row_pitch: u32,
    pub slice_pitch: u32,
}

impl DataBox {
    pub const EMPTY: Self = Self {
        data_pointer: ptr::null_mut(),
        row_pitch: 0,
        slice_pitch: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.data_pointer.is_null()
    }
}

/// Result of `map_subresource`.
///
/// A non-blocking map of data the GPU has not produced yet returns an empty
/// mapping; callers retry on a later frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedResource {
    pub subresource: u32,
    pub data: DataBox,
    /// Byte offset of the mapped range inside the resource.
    pub offset: u64,
    /// Bytes addressable through `data.data_pointer`.
    pub size: u64,
}

impl MappedResource {
    pub fn empty(subresource: u32) -> Self {
        Self {
            subresource,
            data: DataBox::EMPTY,
            offset: 0,
            size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// # Safety
    ///
    /// The mapping must still be live (not unmapped) and nothing may write
    /// through it while the slice is borrowed.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        std::slice::from_raw_parts(self.data.data_pointer, self.size as usize)
    }

    /// # Safety
    ///
    /// The mapping must be live and writable, and must not be aliased.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.data.data_pointer, self.size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mapping_has_no_bytes() {
        let mapped = MappedResource::empty(3);
        assert!(mapped.is_empty());
        assert_eq!(unsafe { mapped.as_slice() }.len(), 0);
    }

    #[test]
    fn live_mapping_exposes_bytes() {
        let mut storage = vec![7u8; 8];
        let mapped = MappedResource {
            subresource: 0,
            data: DataBox {
                data_pointer: storage.as_mut_ptr(),
                row_pitch: 8,
                slice_pitch: 8,
            },
            offset: 0,
            size: 8,
        };
        assert_eq!(unsafe { mapped.as_slice() }, &[7u8; 8]);
    }
}

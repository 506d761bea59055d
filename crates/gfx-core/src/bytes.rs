//! Byte views of plain-old-data values for buffer uploads.

use crate::state::Color4;

/// View a `#[repr(C)]` value as raw bytes.
///
/// # Safety
///
/// Only implement on `#[repr(C)]` types whose fields are all plain numeric
/// types (f32, i32, u32, etc.) with no pointers, references or padding.
pub unsafe trait AsBytes: Sized {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: implementors guarantee a padding-free POD layout.
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, std::mem::size_of::<Self>())
        }
    }
}

unsafe impl AsBytes for Color4 {}
unsafe impl AsBytes for [f32; 2] {}
unsafe impl AsBytes for [f32; 4] {}
unsafe impl AsBytes for [[f32; 4]; 4] {}
unsafe impl AsBytes for [u32; 4] {}
unsafe impl AsBytes for [u16; 4] {}

/// Reinterpret a slice of POD values as bytes.
pub fn slice_as_bytes<T: AsBytes>(values: &[T]) -> &[u8] {
    // SAFETY: `T: AsBytes` has no padding; the length covers the whole slice.
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_bytes_are_four_floats() {
        let bytes = Color4::new(1.0, 0.0, 0.0, 1.0).as_bytes().to_vec();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn slices_flatten() {
        let quad: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        assert_eq!(slice_as_bytes(&quad).len(), 32);
    }
}

//! Logical pixel formats.
//!
//! Discriminants are the DXGI numeric values so the D3D12 backend can pass
//! them through unchanged; the GL backend converts them to an
//! internal-format / format / type triple.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum PixelFormat {
    #[default]
    None = 0,
    Rgba32Float = 2,
    Rgba32Uint = 3,
    Rgb32Float = 6,
    Rgba16Float = 10,
    Rgba16Unorm = 11,
    Rg32Float = 16,
    Depth32FloatStencil8 = 20,
    Rgb10a2Unorm = 24,
    Rg11b10Float = 26,
    Rgba8Unorm = 28,
    Rgba8UnormSrgb = 29,
    Rgba8Uint = 30,
    Rg16Float = 34,
    Depth32Float = 40,
    R32Float = 41,
    R32Uint = 42,
    Depth24UnormStencil8 = 45,
    Rg8Unorm = 49,
    R16Float = 54,
    Depth16Unorm = 55,
    R16Unorm = 56,
    R8Unorm = 61,
    A8Unorm = 65,
    Bc1Unorm = 71,
    Bc1UnormSrgb = 72,
    Bc2Unorm = 74,
    Bc3Unorm = 77,
    Bgra8Unorm = 87,
    Bgra8UnormSrgb = 91,
}

impl PixelFormat {
    /// Look up a format by its DXGI value.
    pub fn from_dxgi(value: u32) -> Option<Self> {
        Self::from_u32(value)
    }

    pub fn dxgi(self) -> u32 {
        self as u32
    }

    /// Bytes per pixel, or bytes per 4x4 block for block-compressed formats.
    pub fn size_in_bytes(self) -> u32 {
        use PixelFormat::*;
        match self {
            None => 0,
            Rgba32Float | Rgba32Uint => 16,
            Rgb32Float => 12,
            Rgba16Float | Rgba16Unorm | Rg32Float | Depth32FloatStencil8 => 8,
            Rgb10a2Unorm | Rg11b10Float | Rgba8Unorm | Rgba8UnormSrgb | Rgba8Uint | Rg16Float
            | Depth32Float | R32Float | R32Uint | Depth24UnormStencil8 | Bgra8Unorm
            | Bgra8UnormSrgb => 4,
            Rg8Unorm | R16Float | Depth16Unorm | R16Unorm => 2,
            R8Unorm | A8Unorm => 1,
            Bc1Unorm | Bc1UnormSrgb => 8,
            Bc2Unorm | Bc3Unorm => 16,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            PixelFormat::Bc1Unorm | PixelFormat::Bc1UnormSrgb | PixelFormat::Bc2Unorm | PixelFormat::Bc3Unorm
        )
    }

    /// Edge length of a compression block (1 for uncompressed formats).
    pub fn block_size(self) -> u32 {
        if self.is_compressed() {
            4
        } else {
            1
        }
    }

    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba8UnormSrgb | PixelFormat::Bgra8UnormSrgb | PixelFormat::Bc1UnormSrgb
        )
    }

    pub fn to_non_srgb(self) -> Self {
        match self {
            PixelFormat::Rgba8UnormSrgb => PixelFormat::Rgba8Unorm,
            PixelFormat::Bgra8UnormSrgb => PixelFormat::Bgra8Unorm,
            PixelFormat::Bc1UnormSrgb => PixelFormat::Bc1Unorm,
            other => other,
        }
    }

    pub fn to_srgb(self) -> Self {
        match self {
            PixelFormat::Rgba8Unorm => PixelFormat::Rgba8UnormSrgb,
            PixelFormat::Bgra8Unorm => PixelFormat::Bgra8UnormSrgb,
            PixelFormat::Bc1Unorm => PixelFormat::Bc1UnormSrgb,
            other => other,
        }
    }

    pub fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::Depth16Unorm
                | PixelFormat::Depth24UnormStencil8
                | PixelFormat::Depth32Float
                | PixelFormat::Depth32FloatStencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::Depth24UnormStencil8 | PixelFormat::Depth32FloatStencil8
        )
    }

    /// Integer formats are fed to shaders without normalization.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba32Uint | PixelFormat::Rgba8Uint | PixelFormat::R32Uint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(28, PixelFormat::Rgba8Unorm)]
    #[case(45, PixelFormat::Depth24UnormStencil8)]
    #[case(87, PixelFormat::Bgra8Unorm)]
    #[case(71, PixelFormat::Bc1Unorm)]
    fn dxgi_values_round_trip(#[case] value: u32, #[case] format: PixelFormat) {
        assert_eq!(PixelFormat::from_dxgi(value), Some(format));
        assert_eq!(format.dxgi(), value);
    }

    #[test]
    fn unknown_dxgi_value_is_rejected() {
        assert_eq!(PixelFormat::from_dxgi(9999), None);
    }

    #[rstest]
    #[case(PixelFormat::Rgba8Unorm, 4)]
    #[case(PixelFormat::Rgba32Float, 16)]
    #[case(PixelFormat::R8Unorm, 1)]
    #[case(PixelFormat::Bc1Unorm, 8)]
    fn pixel_sizes(#[case] format: PixelFormat, #[case] size: u32) {
        assert_eq!(format.size_in_bytes(), size);
    }

    #[test]
    fn srgb_conversions_are_inverse() {
        let srgb = PixelFormat::Rgba8Unorm.to_srgb();
        assert!(srgb.is_srgb());
        assert_eq!(srgb.to_non_srgb(), PixelFormat::Rgba8Unorm);
        assert_eq!(PixelFormat::R32Float.to_srgb(), PixelFormat::R32Float);
    }

    #[test]
    fn depth_formats() {
        assert!(PixelFormat::Depth24UnormStencil8.has_stencil());
        assert!(PixelFormat::Depth32Float.is_depth_stencil());
        assert!(!PixelFormat::Depth32Float.has_stencil());
        assert!(!PixelFormat::Rgba8Unorm.is_depth_stencil());
    }
}

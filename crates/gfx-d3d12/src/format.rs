//! DXGI formats of depth resources and readback buffer layouts.

use gfx_core::resource::compute_pitch;
use gfx_core::{PixelFormat, TextureDescription, TextureFlags};

use crate::backend::PlacedFootprint;

/// `D3D12_TEXTURE_DATA_PITCH_ALIGNMENT`.
pub const ROW_PITCH_ALIGNMENT: u32 = 256;
/// `D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT`.
pub const PLACEMENT_ALIGNMENT: u64 = 512;

const R32G8X24_TYPELESS: u32 = 19;
const R32_FLOAT_X8X24_TYPELESS: u32 = 21;
const R32_TYPELESS: u32 = 39;
const R24G8_TYPELESS: u32 = 44;
const R24_UNORM_X8_TYPELESS: u32 = 46;
const R16_TYPELESS: u32 = 53;

/// DXGI format the resource is created with.
///
/// Depth textures that are also sampled need a typeless format so both a
/// depth-stencil and a shader resource view can be created on them.
pub fn resource_format(format: PixelFormat, flags: TextureFlags) -> u32 {
    if !format.is_depth_stencil() || !flags.contains(TextureFlags::SHADER_RESOURCE) {
        return format.dxgi();
    }
    match format {
        PixelFormat::Depth16Unorm => R16_TYPELESS,
        PixelFormat::Depth32Float => R32_TYPELESS,
        PixelFormat::Depth24UnormStencil8 => R24G8_TYPELESS,
        PixelFormat::Depth32FloatStencil8 => R32G8X24_TYPELESS,
        other => other.dxgi(),
    }
}

/// DXGI format of a shader resource view on a texture of `format`.
pub fn shader_resource_format(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Depth16Unorm => PixelFormat::R16Float.dxgi(),
        PixelFormat::Depth32Float => PixelFormat::R32Float.dxgi(),
        PixelFormat::Depth24UnormStencil8 => R24_UNORM_X8_TYPELESS,
        PixelFormat::Depth32FloatStencil8 => R32_FLOAT_X8X24_TYPELESS,
        other => other.dxgi(),
    }
}

/// DXGI format of a depth-stencil view.
pub fn depth_stencil_format(format: PixelFormat) -> u32 {
    format.dxgi()
}

fn align(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Linear layout of every subresource of a texture inside a readback
/// buffer, in subresource order, and the total buffer size.
pub fn readback_layout(description: &TextureDescription) -> (Vec<PlacedFootprint>, u64) {
    let mut footprints = Vec::with_capacity(description.subresource_count() as usize);
    let mut offset = 0u64;
    for _slice in 0..description.array_size {
        for mip in 0..description.mip_levels {
            let width = description.mip_width(mip);
            let height = description.mip_height(mip);
            let depth = description.mip_depth(mip);
            let (row_bytes, slice_bytes) = compute_pitch(description.format, width, height);
            let rows = slice_bytes / row_bytes.max(1);
            let row_pitch = align(u64::from(row_bytes), u64::from(ROW_PITCH_ALIGNMENT)) as u32;

            offset = align(offset, PLACEMENT_ALIGNMENT);
            footprints.push(PlacedFootprint {
                offset,
                format: description.format,
                width,
                height,
                depth,
                row_pitch,
            });
            offset += u64::from(row_pitch) * u64::from(rows) * u64::from(depth);
        }
    }
    (footprints, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PixelFormat::Depth16Unorm, 53, 54)]
    #[case(PixelFormat::Depth32Float, 39, 41)]
    #[case(PixelFormat::Depth24UnormStencil8, 44, 46)]
    #[case(PixelFormat::Depth32FloatStencil8, 19, 21)]
    fn sampled_depth_uses_typeless_storage(#[case] format: PixelFormat, #[case] storage: u32, #[case] srv: u32) {
        let flags = TextureFlags::DEPTH_STENCIL | TextureFlags::SHADER_RESOURCE;
        assert_eq!(resource_format(format, flags), storage);
        assert_eq!(shader_resource_format(format), srv);
        assert_eq!(depth_stencil_format(format), format.dxgi());
    }

    #[test]
    fn depth_only_keeps_its_format() {
        let format = PixelFormat::Depth24UnormStencil8;
        assert_eq!(resource_format(format, TextureFlags::DEPTH_STENCIL), 45);
    }

    #[test]
    fn readback_rows_are_pitch_aligned() {
        let desc = TextureDescription::new_2d(100, 4, PixelFormat::Rgba8Unorm, TextureFlags::empty()).with_mip_levels(2);
        let (footprints, size) = readback_layout(&desc);

        assert_eq!(footprints.len(), 2);
        assert_eq!(footprints[0].row_pitch, 512);
        assert_eq!(footprints[0].offset, 0);
        // 4 rows of 512 bytes, then mip 1 at the next 512-byte boundary.
        assert_eq!(footprints[1].offset, 2048);
        assert_eq!((footprints[1].width, footprints[1].height), (50, 2));
        assert_eq!(footprints[1].row_pitch, 256);
        assert_eq!(size, 2048 + 512);
    }

    #[test]
    fn full_size_target_has_tight_rows() {
        let desc = TextureDescription::new_2d(256, 256, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let (footprints, size) = readback_layout(&desc);
        assert_eq!(footprints[0].row_pitch, 1024);
        assert_eq!(size, 1024 * 256);
    }
}

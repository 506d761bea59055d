//! Texture and buffer descriptions, views and copy regions.

use crate::flags::{BufferFlags, ResourceCapabilities, TextureFlags};
use crate::format::PixelFormat;

/// CPU/GPU access class of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GraphicsResourceUsage {
    /// GPU read/write, no CPU access.
    #[default]
    Default,
    /// GPU read only, initialized at creation.
    Immutable,
    /// CPU writes every frame, GPU reads.
    Dynamic,
    /// CPU readback/upload copy of a GPU resource.
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    Texture1D,
    Texture2D,
    Texture3D,
    TextureCube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescription {
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub format: PixelFormat,
    pub flags: TextureFlags,
    pub usage: GraphicsResourceUsage,
    pub sample_count: u32,
}

impl TextureDescription {
    pub fn new_2d(width: u32, height: u32, format: PixelFormat, flags: TextureFlags) -> Self {
        Self {
            dimension: TextureDimension::Texture2D,
            width,
            height,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            format,
            flags,
            usage: GraphicsResourceUsage::Default,
            sample_count: 1,
        }
    }

    pub fn new_1d(width: u32, format: PixelFormat, flags: TextureFlags) -> Self {
        Self {
            dimension: TextureDimension::Texture1D,
            ..Self::new_2d(width, 1, format, flags)
        }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32, format: PixelFormat, flags: TextureFlags) -> Self {
        Self {
            dimension: TextureDimension::Texture3D,
            depth,
            ..Self::new_2d(width, height, format, flags)
        }
    }

    pub fn new_cube(size: u32, format: PixelFormat, flags: TextureFlags) -> Self {
        Self {
            dimension: TextureDimension::TextureCube,
            array_size: 6,
            ..Self::new_2d(size, size, format, flags)
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size.max(1);
        self
    }

    pub fn with_usage(mut self, usage: GraphicsResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    /// The staging (CPU readable) counterpart of this texture: same
    /// geometry and format, no bind flags.
    pub fn to_staging(self) -> Self {
        Self {
            flags: TextureFlags::empty(),
            usage: GraphicsResourceUsage::Staging,
            ..self
        }
    }

    pub fn is_render_target(&self) -> bool {
        self.flags.contains(TextureFlags::RENDER_TARGET)
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.flags.contains(TextureFlags::DEPTH_STENCIL)
    }

    pub fn is_shader_resource(&self) -> bool {
        self.flags.contains(TextureFlags::SHADER_RESOURCE)
    }

    pub fn is_multisampled(&self) -> bool {
        self.sample_count > 1
    }

    pub fn capabilities(&self) -> ResourceCapabilities {
        let mut caps = ResourceCapabilities::COPYABLE;
        if matches!(
            self.usage,
            GraphicsResourceUsage::Staging | GraphicsResourceUsage::Dynamic
        ) {
            caps |= ResourceCapabilities::MAPPABLE;
        }
        if self.flags.intersects(TextureFlags::RENDER_TARGET | TextureFlags::DEPTH_STENCIL) {
            caps |= ResourceCapabilities::BINDABLE_AS_TARGET;
        }
        if self.is_shader_resource() {
            caps |= ResourceCapabilities::SHADER_READABLE;
        }
        caps
    }

    pub fn mip_width(&self, mip: u32) -> u32 {
        mip_size(self.width, mip)
    }

    pub fn mip_height(&self, mip: u32) -> u32 {
        mip_size(self.height, mip)
    }

    pub fn mip_depth(&self, mip: u32) -> u32 {
        if self.dimension == TextureDimension::Texture3D {
            mip_size(self.depth, mip)
        } else {
            1
        }
    }

    /// Number of subresources (array slices times mips).
    pub fn subresource_count(&self) -> u32 {
        self.array_size * self.mip_levels
    }

    /// Tightly packed pitches of a mip level.
    pub fn compute_pitch(&self, mip: u32) -> (u32, u32) {
        compute_pitch(self.format, self.mip_width(mip), self.mip_height(mip))
    }
}

/// Size of a mip level, never below one texel.
pub fn mip_size(size: u32, mip: u32) -> u32 {
    (size >> mip).max(1)
}

/// Row and slice pitch of a tightly packed image.
///
/// Block-compressed formats count rows of blocks.
pub fn compute_pitch(format: PixelFormat, width: u32, height: u32) -> (u32, u32) {
    let block = format.block_size();
    let blocks_wide = width.div_ceil(block);
    let blocks_high = height.div_ceil(block);
    let row_pitch = blocks_wide * format.size_in_bytes();
    (row_pitch, row_pitch * blocks_high)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescription {
    pub size_in_bytes: u32,
    pub structure_byte_stride: u32,
    pub flags: BufferFlags,
    pub usage: GraphicsResourceUsage,
}

impl BufferDescription {
    pub fn new(size_in_bytes: u32, flags: BufferFlags, usage: GraphicsResourceUsage) -> Self {
        Self {
            size_in_bytes,
            structure_byte_stride: 0,
            flags,
            usage,
        }
    }

    pub fn capabilities(&self) -> ResourceCapabilities {
        let mut caps = ResourceCapabilities::COPYABLE;
        if matches!(
            self.usage,
            GraphicsResourceUsage::Staging | GraphicsResourceUsage::Dynamic
        ) {
            caps |= ResourceCapabilities::MAPPABLE;
        }
        if self.flags.contains(BufferFlags::SHADER_RESOURCE) {
            caps |= ResourceCapabilities::SHADER_READABLE;
        }
        caps
    }
}

/// Which part of the parent a view covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewType {
    /// All slices and mips.
    #[default]
    Full,
    /// One slice at one mip.
    Single,
    /// All slices at one mip.
    ArrayBand,
    /// One slice, all mips.
    MipBand,
}

/// Slice selection for a texture view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureViewDescription {
    pub view_type: ViewType,
    pub array_slice: u32,
    pub mip_level: u32,
    /// Format override; `PixelFormat::None` keeps the parent's.
    pub format: PixelFormat,
}

impl TextureViewDescription {
    pub fn single(array_slice: u32, mip_level: u32) -> Self {
        Self {
            view_type: ViewType::Single,
            array_slice,
            mip_level,
            format: PixelFormat::None,
        }
    }
}

/// A box inside a subresource; right/bottom/back are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceRegion {
    pub left: u32,
    pub top: u32,
    pub front: u32,
    pub right: u32,
    pub bottom: u32,
    pub back: u32,
}

impl ResourceRegion {
    pub fn new(left: u32, top: u32, front: u32, right: u32, bottom: u32, back: u32) -> Self {
        Self {
            left,
            top,
            front,
            right,
            bottom,
            back,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn depth(&self) -> u32 {
        self.back.saturating_sub(self.front)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0 || self.depth() == 0
    }
}

/// Subresource index in D3D ordering (mips of slice 0 first).
pub fn subresource_index(mip_level: u32, array_slice: u32, mip_levels: u32) -> u32 {
    mip_level + array_slice * mip_levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(256, 0, 256)]
    #[case(256, 3, 32)]
    #[case(3, 4, 1)]
    fn mip_sizes(#[case] size: u32, #[case] mip: u32, #[case] expected: u32) {
        assert_eq!(mip_size(size, mip), expected);
    }

    #[test]
    fn compressed_pitch_counts_blocks() {
        assert_eq!(compute_pitch(PixelFormat::Bc1Unorm, 10, 10), (24, 72));
        assert_eq!(compute_pitch(PixelFormat::Rgba8Unorm, 256, 256), (1024, 262144));
    }

    #[test]
    fn staging_description_is_mappable_only() {
        let desc = TextureDescription::new_2d(
            16,
            16,
            PixelFormat::Rgba8Unorm,
            TextureFlags::RENDER_TARGET | TextureFlags::SHADER_RESOURCE,
        );
        let staging = desc.to_staging();
        assert!(staging.capabilities().contains(ResourceCapabilities::MAPPABLE));
        assert!(!staging.capabilities().contains(ResourceCapabilities::BINDABLE_AS_TARGET));
        assert!(desc.capabilities().contains(ResourceCapabilities::BINDABLE_AS_TARGET));
        assert!(!desc.capabilities().contains(ResourceCapabilities::MAPPABLE));
    }

    #[test]
    fn empty_region() {
        assert!(ResourceRegion::new(4, 4, 0, 4, 8, 1).is_empty());
        assert!(!ResourceRegion::new(0, 0, 0, 2, 2, 1).is_empty());
    }
}

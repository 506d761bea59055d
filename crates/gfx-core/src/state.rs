//! Fixed-function state objects and small value types.
//!
//! Every state object has an associated `DEFAULT` instance. Passing `None`
//! where a state is expected means "the default", and trackers compare
//! against that same instance.

use crate::flags::ColorWriteChannels;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Color4 {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color4 {
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Quantize to 8-bit unorm RGBA.
    pub fn to_rgba8(self) -> [u8; 4] {
        self.to_array()
            .map(|c| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveType {
    /// Number of primitives produced by `vertex_count` vertices.
    pub fn primitive_count(self, vertex_count: u32) -> u32 {
        match self {
            PrimitiveType::PointList => vertex_count,
            PrimitiveType::LineList => vertex_count / 2,
            PrimitiveType::LineStrip => vertex_count.saturating_sub(1),
            PrimitiveType::TriangleList => vertex_count / 3,
            PrimitiveType::TriangleStrip => vertex_count.saturating_sub(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Blend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blend {
    Zero,
    One,
    SourceColor,
    InverseSourceColor,
    SourceAlpha,
    InverseSourceAlpha,
    DestinationAlpha,
    InverseDestinationAlpha,
    DestinationColor,
    InverseDestinationColor,
    SourceAlphaSaturate,
    BlendFactor,
    InverseBlendFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFunction {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendStateRenderTarget {
    pub blend_enable: bool,
    pub color_source_blend: Blend,
    pub color_destination_blend: Blend,
    pub color_blend_function: BlendFunction,
    pub alpha_source_blend: Blend,
    pub alpha_destination_blend: Blend,
    pub alpha_blend_function: BlendFunction,
    pub color_write_channels: ColorWriteChannels,
}

impl BlendStateRenderTarget {
    pub const DEFAULT: Self = Self {
        blend_enable: false,
        color_source_blend: Blend::One,
        color_destination_blend: Blend::Zero,
        color_blend_function: BlendFunction::Add,
        alpha_source_blend: Blend::One,
        alpha_destination_blend: Blend::Zero,
        alpha_blend_function: BlendFunction::Add,
        color_write_channels: ColorWriteChannels::ALL,
    };
}

/// Output merger blend configuration.
///
/// Only render target 0 is honored on GL; independent blending is a D3D
/// pipeline feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub alpha_to_coverage_enable: bool,
    pub independent_blend_enable: bool,
    pub render_target: BlendStateRenderTarget,
}

impl BlendState {
    pub const DEFAULT: Self = Self {
        alpha_to_coverage_enable: false,
        independent_blend_enable: false,
        render_target: BlendStateRenderTarget::DEFAULT,
    };

    pub const ALPHA_BLEND: Self = Self {
        alpha_to_coverage_enable: false,
        independent_blend_enable: false,
        render_target: BlendStateRenderTarget {
            blend_enable: true,
            color_source_blend: Blend::One,
            color_destination_blend: Blend::InverseSourceAlpha,
            color_blend_function: BlendFunction::Add,
            alpha_source_blend: Blend::One,
            alpha_destination_blend: Blend::InverseSourceAlpha,
            alpha_blend_function: BlendFunction::Add,
            color_write_channels: ColorWriteChannels::ALL,
        },
    };

    pub const ADDITIVE: Self = Self {
        alpha_to_coverage_enable: false,
        independent_blend_enable: false,
        render_target: BlendStateRenderTarget {
            blend_enable: true,
            color_source_blend: Blend::SourceAlpha,
            color_destination_blend: Blend::One,
            color_blend_function: BlendFunction::Add,
            alpha_source_blend: Blend::SourceAlpha,
            alpha_destination_blend: Blend::One,
            alpha_blend_function: BlendFunction::Add,
            color_write_channels: ColorWriteChannels::ALL,
        },
    };
}

impl Default for BlendState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// Depth / stencil
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    IncrementSaturation,
    DecrementSaturation,
    Invert,
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilStencilOpDescription {
    pub stencil_fail: StencilOperation,
    pub stencil_depth_buffer_fail: StencilOperation,
    pub stencil_pass: StencilOperation,
    pub stencil_function: CompareFunction,
}

impl DepthStencilStencilOpDescription {
    pub const DEFAULT: Self = Self {
        stencil_fail: StencilOperation::Keep,
        stencil_depth_buffer_fail: StencilOperation::Keep,
        stencil_pass: StencilOperation::Keep,
        stencil_function: CompareFunction::Always,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_buffer_enable: bool,
    pub depth_buffer_write_enable: bool,
    pub depth_buffer_function: CompareFunction,
    pub stencil_enable: bool,
    pub stencil_mask: u8,
    pub stencil_write_mask: u8,
    pub front_face: DepthStencilStencilOpDescription,
    pub back_face: DepthStencilStencilOpDescription,
}

impl DepthStencilState {
    pub const DEFAULT: Self = Self {
        depth_buffer_enable: true,
        depth_buffer_write_enable: true,
        depth_buffer_function: CompareFunction::LessEqual,
        stencil_enable: false,
        stencil_mask: 0xFF,
        stencil_write_mask: 0xFF,
        front_face: DepthStencilStencilOpDescription::DEFAULT,
        back_face: DepthStencilStencilOpDescription::DEFAULT,
    };

    pub const NONE: Self = Self {
        depth_buffer_enable: false,
        depth_buffer_write_enable: false,
        ..Self::DEFAULT
    };

    pub const DEPTH_READ: Self = Self {
        depth_buffer_write_enable: false,
        ..Self::DEFAULT
    };
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// Rasterizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face_counter_clockwise: bool,
    pub depth_bias: i32,
    pub scissor_test_enable: bool,
    pub depth_clip_enable: bool,
    pub multisample_antialias_line: bool,
}

impl RasterizerState {
    pub const DEFAULT: Self = Self {
        fill_mode: FillMode::Solid,
        cull_mode: CullMode::Back,
        front_face_counter_clockwise: false,
        depth_bias: 0,
        scissor_test_enable: false,
        depth_clip_enable: true,
        multisample_antialias_line: false,
    };

    pub const CULL_NONE: Self = Self {
        cull_mode: CullMode::None,
        ..Self::DEFAULT
    };

    pub const WIREFRAME: Self = Self {
        fill_mode: FillMode::Wireframe,
        ..Self::DEFAULT
    };
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFilter {
    Point,
    Linear,
    MinPointMagLinearMipPoint,
    MinLinearMagPointMipLinear,
    Anisotropic,
    ComparisonPoint,
    ComparisonLinear,
}

impl TextureFilter {
    pub fn is_comparison(self) -> bool {
        matches!(self, TextureFilter::ComparisonPoint | TextureFilter::ComparisonLinear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureAddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerState {
    pub filter: TextureFilter,
    pub address_u: TextureAddressMode,
    pub address_v: TextureAddressMode,
    pub address_w: TextureAddressMode,
    pub border_color: Color4,
    pub max_anisotropy: u32,
    pub min_mip_level: f32,
    pub max_mip_level: f32,
    pub mip_map_level_of_detail_bias: f32,
    pub compare_function: CompareFunction,
}

impl SamplerState {
    pub const DEFAULT: Self = Self {
        filter: TextureFilter::Linear,
        address_u: TextureAddressMode::Clamp,
        address_v: TextureAddressMode::Clamp,
        address_w: TextureAddressMode::Clamp,
        border_color: Color4::BLACK,
        max_anisotropy: 16,
        min_mip_level: 0.0,
        max_mip_level: f32::MAX,
        mip_map_level_of_detail_bias: 0.0,
        compare_function: CompareFunction::Never,
    };

    pub const POINT_CLAMP: Self = Self {
        filter: TextureFilter::Point,
        ..Self::DEFAULT
    };

    pub const LINEAR_WRAP: Self = Self {
        address_u: TextureAddressMode::Wrap,
        address_v: TextureAddressMode::Wrap,
        address_w: TextureAddressMode::Wrap,
        ..Self::DEFAULT
    };
}

impl Default for SamplerState {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba8_quantization() {
        assert_eq!(Color4::new(1.0, 0.0, 0.0, 1.0).to_rgba8(), [255, 0, 0, 255]);
        assert_eq!(Color4::new(0.5, 2.0, -1.0, 0.0).to_rgba8(), [128, 255, 0, 0]);
    }

    #[test]
    fn defaults_match_constants() {
        assert_eq!(BlendState::default(), BlendState::DEFAULT);
        assert_eq!(RasterizerState::default(), RasterizerState::DEFAULT);
        assert_ne!(DepthStencilState::NONE, DepthStencilState::DEFAULT);
    }

    #[test]
    fn primitive_counts() {
        assert_eq!(PrimitiveType::TriangleList.primitive_count(9), 3);
        assert_eq!(PrimitiveType::TriangleStrip.primitive_count(4), 2);
        assert_eq!(PrimitiveType::LineStrip.primitive_count(0), 0);
    }
}

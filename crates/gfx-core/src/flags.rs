//! Bit flags used in resource descriptions and clear/write masks.

use bitflags::bitflags;

bitflags! {
    /// How a texture may be bound to the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        const SHADER_RESOURCE = 1;
        const RENDER_TARGET = 2;
        const UNORDERED_ACCESS = 4;
        const DEPTH_STENCIL = 8;
        const DEPTH_STENCIL_READ_ONLY = 16;
    }
}

bitflags! {
    /// How a buffer may be bound to the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const CONSTANT_BUFFER = 1;
        const INDEX_BUFFER = 2;
        const VERTEX_BUFFER = 4;
        const RENDER_TARGET = 8;
        const SHADER_RESOURCE = 16;
        const UNORDERED_ACCESS = 32;
        const STRUCTURED_BUFFER = 64;
        const RAW_BUFFER = 128;
        const ARGUMENT_BUFFER = 256;
        const STREAM_OUTPUT = 512;
    }
}

bitflags! {
    /// Which planes of a depth-stencil buffer a clear touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DepthStencilClearOptions: u32 {
        const DEPTH_BUFFER = 1;
        const STENCIL = 2;
    }
}

bitflags! {
    /// Color channels written by the output merger.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteChannels: u8 {
        const RED = 1;
        const GREEN = 2;
        const BLUE = 4;
        const ALPHA = 8;
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

impl Default for ColorWriteChannels {
    fn default() -> Self {
        Self::ALL
    }
}

bitflags! {
    /// Options for device creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceCreationFlags: u32 {
        /// Enable the native debug layer (D3D12) or debug output (GL).
        const DEBUG = 1;
        const BGRA_SUPPORT = 2;
    }
}

bitflags! {
    /// What a resource can do, resolved once from its description.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceCapabilities: u32 {
        /// Can be mapped for CPU access.
        const MAPPABLE = 1;
        /// Can be a copy source or destination.
        const COPYABLE = 2;
        /// Can be attached as a render target or depth-stencil buffer.
        const BINDABLE_AS_TARGET = 4;
        const SHADER_READABLE = 8;
    }
}

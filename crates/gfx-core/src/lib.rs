//! Backend-neutral data model for the graphics device layer.
//!
//! # Overview
//!
//! - [`Arena`] / [`Handle`] own resources and hand out generational handles.
//! - [`PixelFormat`], [`TextureDescription`], [`BufferDescription`] describe resources.
//! - [`BlendState`], [`DepthStencilState`], [`RasterizerState`], [`SamplerState`]
//!   are the fixed-function state objects trackers compare against.
//! - [`MappedResource`] is the result of mapping a resource for CPU access.
//! - [`GraphicsDeviceStatus`] / [`DeviceStatusMonitor`] report device loss.
//! - [`DeviceChild`] is the device-loss lifecycle of a resource.
//! - [`DeviceScope`] makes a device current for the duration of a scope.
//! - [`DeviceConfig`] carries creation options, [`GraphicsError`] failures.

pub mod arena;
pub mod bytes;
pub mod config;
pub mod current;
pub mod error;
pub mod flags;
pub mod format;
pub mod lifecycle;
pub mod logging;
pub mod mapped;
pub mod resource;
pub mod state;
pub mod stats;
pub mod status;

pub use arena::{Arena, Handle};
pub use bytes::{slice_as_bytes, AsBytes};
pub use config::{AsyncCreationMode, DeviceConfig, GraphicsProfile};
pub use current::{current_device, DeviceId, DeviceScope};
pub use error::{graphics_error, GraphicsError};
pub use flags::{
    BufferFlags, ColorWriteChannels, DepthStencilClearOptions, DeviceCreationFlags,
    ResourceCapabilities, TextureFlags,
};
pub use format::PixelFormat;
pub use lifecycle::{DeviceChild, LifetimeState};
pub use logging::init_logging;
pub use mapped::{DataBox, MapMode, MappedResource};
pub use resource::{
    BufferDescription, GraphicsResourceUsage, ResourceRegion, TextureDescription,
    TextureDimension, TextureViewDescription, ViewType,
};
pub use state::{
    Blend, BlendFunction, BlendState, Color4, CompareFunction, CullMode, DepthStencilState,
    FillMode, PrimitiveType, RasterizerState, Rectangle, SamplerState, StencilOperation,
    TextureAddressMode, TextureFilter, Viewport,
};
pub use stats::FrameStats;
pub use status::{DeviceStatusMonitor, GraphicsDeviceStatus};

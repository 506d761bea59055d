#![allow(clippy::too_many_arguments)]

//! OpenGL / OpenGL ES backend of the graphics device layer.
//!
//! # Overview
//!
//! - [`GlApi`] is the seam over GL entry points: [`NativeGl`] calls the
//!   loaded driver, [`SoftGl`] is an in-memory GL used by tests and
//!   headless runs.
//! - [`GlPlatform`] creates and switches contexts ([`SoftPlatform`] for
//!   tests).
//! - [`GlDevice`] owns every resource and the [`StateTracker`] that keeps
//!   redundant GL calls out of the stream.
//! - [`GlCommandList`] records bindings and issues draws, clears, copies
//!   and maps against the device.
//! - [`AsyncCreationContext`] creates resources off the render thread on a
//!   shared context, or queues them for the render thread where sharing is
//!   unavailable.

pub mod api;
pub mod buffer;
pub mod caps;
pub mod command_list;
pub mod context;
pub mod copy;
pub mod device;
pub mod driver;
pub mod fbo;
pub mod format;
pub mod native;
pub mod platform;
pub mod program;
pub mod soft;
pub mod state;
pub mod texture;
pub mod vao;

pub use api::{check_error, GlApi, PixelData, PixelPack};
pub use buffer::GlBuffer;
pub use caps::GlCaps;
pub use command_list::{GlCommandList, GlPipelineState};
pub use context::{AsyncCreationContext, ContextTracker, CreationGuard};
pub use copy::CopyRegion;
pub use device::{GlDevice, GlResource, GlResourceLoader, LostContents};
pub use driver::GlDriver;
pub use fbo::{FboTexture, FramebufferCache};
pub use format::{convert_pixel_format, GlFormat};
pub use native::NativeGl;
pub use platform::{ContextId, GlPlatform};
pub use program::{compile_program, EffectProgram, TextureBinding, UniformBinding, UniformType};
pub use soft::{SoftGl, SoftPlatform, SoftProfile};
pub use state::StateTracker;
pub use texture::GlTexture;
pub use vao::{
    GlVertexArray, IndexBufferBinding, InputSignature, VertexBufferBinding, VertexDeclaration,
    VertexElement, VertexFormat,
};

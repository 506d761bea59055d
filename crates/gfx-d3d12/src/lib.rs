//! Direct3D 12 backend of the graphics device layer.
//!
//! # Overview
//!
//! - [`D3d12Backend`] is the seam over native D3D12: `WindowsD3d12` drives
//!   the real API on Windows, [`SoftD3d12`] executes the same command stream
//!   on CPU memory for tests and headless runs.
//! - [`D3d12Device`] owns resources, descriptor heaps, the upload ring and
//!   the queue fence that gates every pooled object.
//! - [`CommandList`] records bindings, draws, copies and maps, rotating
//!   shader-visible descriptor heaps as they fill.
//! - [`DescriptorPool`] / [`DescriptorSet`] stage descriptors on the CPU
//!   before they are copied into shader-visible heaps.

pub mod backend;
pub mod command_list;
pub mod descriptor;
pub mod device;
pub mod fence;
pub mod format;
#[cfg(windows)]
pub mod native;
pub mod pipeline;
pub mod pool;
pub mod resource;
pub mod soft;
pub mod upload;

pub use backend::{
    Command, CopyLocation, CpuDescriptor, D3d12Backend, DescriptorHeapKind, GpuDescriptor,
    HeapType, IndexBufferView, NativeCommandAllocator, NativeCommandList, NativeHeap,
    NativeHeapId, NativePipeline, NativeResource, PlacedFootprint, ResourceDesc, ResourceStates,
    VertexBufferView, ViewDesc,
};
pub use command_list::{CommandList, CompiledCommandList};
pub use descriptor::{
    DescriptorAllocator, DescriptorKind, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder,
};
pub use device::{status_from_removed_reason, D3d12Device, D3d12Resource, LostContents};
pub use fence::FenceTracker;
pub use pipeline::D3d12PipelineState;
pub use pool::ResourcePool;
pub use resource::{D3d12Buffer, D3d12Sampler, D3d12Texture, StagingLayout};
pub use soft::SoftD3d12;
pub use upload::{TemporaryResources, UploadAllocation, UploadAllocator};
#[cfg(windows)]
pub use native::WindowsD3d12;

//! The native Direct3D 12 seam.
//!
//! The device layer talks to D3D12 through [`D3d12Backend`]. Native objects
//! are referred to by opaque ids handed out by the backend, and command
//! lists are recorded as a stream of [`Command`]s. `WindowsD3d12` replays
//! that stream on an `ID3D12GraphicsCommandList`; `SoftD3d12` executes it on
//! CPU memory.

use anyhow::Result;
use bitflags::bitflags;
use gfx_core::{
    DepthStencilClearOptions, GraphicsProfile, PixelFormat, PrimitiveType, Rectangle,
    ResourceRegion, SamplerState, TextureDimension, TextureFlags, Viewport,
};

macro_rules! native_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

native_id!(
    /// A committed resource.
    NativeResource
);
native_id!(NativeCommandAllocator);
native_id!(NativeCommandList);
native_id!(NativeHeapId);

/// CPU address of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuDescriptor(pub u64);

impl CpuDescriptor {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, descriptors: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(descriptors) * u64::from(increment))
    }
}

/// GPU address of a descriptor in a shader-visible heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuDescriptor(pub u64);

impl GpuDescriptor {
    pub fn offset(self, descriptors: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(descriptors) * u64::from(increment))
    }
}

/// Precompiled pipeline and root signature from the effect system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativePipeline {
    pub pipeline: u64,
    pub root_signature: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    RenderTarget,
    DepthStencil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHeap {
    pub id: NativeHeapId,
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub cpu_start: CpuDescriptor,
    /// Zero unless the heap is shader visible.
    pub gpu_start: GpuDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    Default,
    Upload,
    Readback,
}

bitflags! {
    /// `D3D12_RESOURCE_STATES`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
    }
}

/// What a committed resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
    },
    Texture {
        dimension: TextureDimension,
        format: PixelFormat,
        width: u32,
        height: u32,
        /// Depth for 3D textures, array size otherwise.
        depth_or_array_size: u32,
        mip_levels: u32,
        sample_count: u32,
        flags: TextureFlags,
    },
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        ResourceDesc::Buffer { size }
    }
}

/// Slice selection for a shader resource, render target or depth view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub format: PixelFormat,
    pub dimension: TextureDimension,
    pub first_slice: u32,
    pub slice_count: u32,
    pub first_mip: u32,
    pub mip_count: u32,
    /// Set for read-only depth-stencil views.
    pub read_only: bool,
}

/// One side of a texture copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyLocation {
    Subresource {
        resource: NativeResource,
        index: u32,
    },
    /// A subresource laid out linearly in a buffer.
    Footprint {
        resource: NativeResource,
        footprint: PlacedFootprint,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlacedFootprint {
    pub offset: u64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferView {
    pub resource: NativeResource,
    pub offset: u64,
    pub size: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBufferView {
    pub resource: NativeResource,
    pub offset: u64,
    pub size: u32,
    pub is_32bit: bool,
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetDescriptorHeaps {
        srv: NativeHeapId,
        sampler: NativeHeapId,
    },
    SetPipelineState(NativePipeline),
    SetPrimitiveTopology(PrimitiveType),
    SetRenderTargets {
        render_targets: Vec<CpuDescriptor>,
        depth_stencil: Option<CpuDescriptor>,
    },
    SetViewport(Viewport),
    SetScissor(Rectangle),
    SetVertexBuffer {
        slot: u32,
        view: VertexBufferView,
    },
    SetIndexBuffer(Option<IndexBufferView>),
    SetGraphicsRootDescriptorTable {
        parameter: u32,
        table: GpuDescriptor,
    },
    SetStencilReference(u32),
    SetBlendFactor([f32; 4]),
    ResourceBarrier {
        resource: NativeResource,
        before: ResourceStates,
        after: ResourceStates,
    },
    ClearRenderTargetView {
        view: CpuDescriptor,
        color: [f32; 4],
    },
    ClearDepthStencilView {
        view: CpuDescriptor,
        options: DepthStencilClearOptions,
        depth: f32,
        stencil: u8,
    },
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexedInstanced {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyResource {
        destination: NativeResource,
        source: NativeResource,
    },
    CopyTextureRegion {
        destination: CopyLocation,
        x: u32,
        y: u32,
        z: u32,
        source: CopyLocation,
        region: Option<ResourceRegion>,
    },
    CopyBufferRegion {
        destination: NativeResource,
        destination_offset: u64,
        source: NativeResource,
        source_offset: u64,
        size: u64,
    },
    BeginEvent(String),
    EndEvent,
}

/// Native D3D12 device, queue and fence.
///
/// All methods take `&self`; implementations synchronize internally.
pub trait D3d12Backend: Send + Sync + 'static {
    /// Create the native device at `level`. Called until one level succeeds.
    fn open(&self, level: GraphicsProfile, debug: bool) -> Result<()>;

    fn adapter_name(&self) -> String;

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    fn create_descriptor_heap(&self, kind: DescriptorHeapKind, capacity: u32, shader_visible: bool) -> Result<NativeHeap>;
    fn release_descriptor_heap(&self, heap: NativeHeapId);
    fn copy_descriptors(&self, count: u32, destination: CpuDescriptor, source: CpuDescriptor, kind: DescriptorHeapKind);

    fn create_committed_resource(&self, desc: &ResourceDesc, heap: HeapType, initial_state: ResourceStates) -> Result<NativeResource>;
    fn release_resource(&self, resource: NativeResource);
    /// Map a buffer resource. The pointer stays valid until `unmap`.
    fn map(&self, resource: NativeResource) -> Result<*mut u8>;
    fn unmap(&self, resource: NativeResource);

    fn create_shader_resource_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor);
    fn create_render_target_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor);
    fn create_depth_stencil_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor);
    fn create_constant_buffer_view(&self, resource: NativeResource, offset: u64, size: u32, destination: CpuDescriptor);
    fn create_sampler(&self, sampler: &SamplerState, destination: CpuDescriptor);

    fn create_command_allocator(&self) -> Result<NativeCommandAllocator>;
    fn reset_command_allocator(&self, allocator: NativeCommandAllocator) -> Result<()>;
    fn release_command_allocator(&self, allocator: NativeCommandAllocator);

    /// Create an open command list recording into `allocator`.
    fn create_command_list(&self, allocator: NativeCommandAllocator) -> Result<NativeCommandList>;
    fn reset_command_list(&self, list: NativeCommandList, allocator: NativeCommandAllocator) -> Result<()>;
    fn record(&self, list: NativeCommandList, command: Command);
    fn close_command_list(&self, list: NativeCommandList) -> Result<()>;
    fn release_command_list(&self, list: NativeCommandList);

    /// Submit a closed list to the direct queue.
    fn execute(&self, list: NativeCommandList) -> Result<()>;
    /// Queue a fence signal after all submitted work.
    fn signal(&self, value: u64) -> Result<()>;
    fn completed_value(&self) -> u64;
    /// Block until the fence reaches `value`.
    fn wait_for_value(&self, value: u64) -> Result<()>;

    /// `GetDeviceRemovedReason` as a raw `HRESULT`.
    fn device_removed_reason(&self) -> i32;
}

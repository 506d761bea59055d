//! Direct3D 12 through the `windows` crate.
//!
//! Native objects live in id-keyed tables; recorded [`Command`]s are replayed
//! straight onto the owning `ID3D12GraphicsCommandList`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use gfx_core::{
    CompareFunction, GraphicsProfile, PrimitiveType, SamplerState, TextureAddressMode,
    TextureDimension, TextureFilter, TextureFlags,
};
use once_cell::sync::Lazy;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE, RECT};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::backend::{
    Command, CopyLocation, CpuDescriptor, D3d12Backend, DescriptorHeapKind, GpuDescriptor,
    HeapType, NativeCommandAllocator, NativeCommandList, NativeHeap, NativeHeapId,
    NativePipeline, NativeResource, ResourceDesc, ResourceStates, ViewDesc,
};
use crate::format::{depth_stencil_format, resource_format, shader_resource_format};

/// Enabled at most once per process, before the first device.
static DEBUG_LAYER: Lazy<bool> = Lazy::new(|| {
    let mut debug: Option<ID3D12Debug> = None;
    match unsafe { D3D12GetDebugInterface(&mut debug) } {
        Ok(()) => match debug {
            Some(debug) => {
                unsafe { debug.EnableDebugLayer() };
                debug!("D3D12 debug layer enabled");
                true
            }
            None => false,
        },
        Err(e) => {
            warn!("D3D12 debug layer unavailable: {e}");
            false
        }
    }
});

struct FenceEvent(HANDLE);

impl Drop for FenceEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct NativeDevice {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    fence: ID3D12Fence,
    event: FenceEvent,
    adapter_name: String,
}

#[derive(Default)]
struct Objects {
    resources: HashMap<u64, ID3D12Resource>,
    heaps: HashMap<u64, ID3D12DescriptorHeap>,
    allocators: HashMap<u64, ID3D12CommandAllocator>,
    lists: HashMap<u64, ID3D12GraphicsCommandList>,
    pipelines: HashMap<u64, ID3D12PipelineState>,
    root_signatures: HashMap<u64, ID3D12RootSignature>,
}

/// Hardware Direct3D 12, falling back to WARP.
pub struct WindowsD3d12 {
    native: RwLock<Option<NativeDevice>>,
    objects: Mutex<Objects>,
    next_id: AtomicU64,
}

// SAFETY: D3D12 devices, queues, fences and resources are free-threaded.
// Command lists and allocators are only touched while `objects` is locked,
// and the fence event handle is only waited on.
unsafe impl Send for WindowsD3d12 {}
unsafe impl Sync for WindowsD3d12 {}

impl Default for WindowsD3d12 {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsD3d12 {
    pub fn new() -> Self {
        Self {
            native: RwLock::new(None),
            objects: Mutex::new(Objects::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn native(&self) -> Result<MappedRwLockReadGuard<'_, NativeDevice>> {
        RwLockReadGuard::try_map(self.native.read(), |native| native.as_ref())
            .map_err(|_| anyhow!("D3D12 device is not open"))
    }

    fn device(&self) -> Option<ID3D12Device> {
        match self.native() {
            Ok(native) => Some(native.device.clone()),
            Err(e) => {
                error!("{e}");
                None
            }
        }
    }

    fn resource(&self, resource: NativeResource) -> Option<ID3D12Resource> {
        let found = self.objects.lock().resources.get(&resource.0).cloned();
        if found.is_none() {
            error!("unknown D3D12 resource {}", resource.0);
        }
        found
    }

    /// The native device, for compiling pipelines against it.
    pub fn native_device(&self) -> Option<ID3D12Device> {
        self.native.read().as_ref().map(|native| native.device.clone())
    }

    /// Register a compiled pipeline so command lists can bind it.
    pub fn register_pipeline(&self, pipeline: ID3D12PipelineState, root_signature: ID3D12RootSignature) -> NativePipeline {
        let ids = NativePipeline {
            pipeline: self.next_id(),
            root_signature: self.next_id(),
        };
        let mut objects = self.objects.lock();
        objects.pipelines.insert(ids.pipeline, pipeline);
        objects.root_signatures.insert(ids.root_signature, root_signature);
        ids
    }

    pub fn release_pipeline(&self, pipeline: NativePipeline) {
        let mut objects = self.objects.lock();
        objects.pipelines.remove(&pipeline.pipeline);
        objects.root_signatures.remove(&pipeline.root_signature);
    }
}

fn feature_level(level: GraphicsProfile) -> Result<D3D_FEATURE_LEVEL> {
    Ok(match level {
        GraphicsProfile::Level_11_0 => D3D_FEATURE_LEVEL_11_0,
        GraphicsProfile::Level_11_1 | GraphicsProfile::Level_11_2 => D3D_FEATURE_LEVEL_11_1,
        other => bail!("feature level {other:?} is below the Direct3D 12 minimum"),
    })
}

fn adapter_name(description: &[u16]) -> String {
    let len = description.iter().position(|&c| c == 0).unwrap_or(description.len());
    String::from_utf16_lossy(&description[..len])
}

fn hardware_device(factory: &IDXGIFactory4, level: D3D_FEATURE_LEVEL) -> Option<(ID3D12Device, String)> {
    for index in 0.. {
        let adapter = unsafe { factory.EnumAdapters1(index) }.ok()?;
        let Ok(desc) = (unsafe { adapter.GetDesc1() }) else {
            continue;
        };
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            continue;
        }
        let mut device: Option<ID3D12Device> = None;
        if unsafe { D3D12CreateDevice(&adapter, level, &mut device) }.is_ok() {
            if let Some(device) = device {
                return Some((device, adapter_name(&desc.Description)));
            }
        }
    }
    None
}

fn warp_device(factory: &IDXGIFactory4, level: D3D_FEATURE_LEVEL) -> Result<(ID3D12Device, String)> {
    let adapter: IDXGIAdapter1 = unsafe { factory.EnumWarpAdapter() }?;
    let desc = unsafe { adapter.GetDesc1() }?;
    let mut device: Option<ID3D12Device> = None;
    unsafe { D3D12CreateDevice(&adapter, level, &mut device) }?;
    let device = device.ok_or_else(|| anyhow!("WARP adapter returned no device"))?;
    Ok((device, adapter_name(&desc.Description)))
}

fn heap_type(kind: DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        DescriptorHeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapKind::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapKind::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

fn cpu_handle(descriptor: CpuDescriptor) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE { ptr: descriptor.0 as usize }
}

fn gpu_handle(descriptor: GpuDescriptor) -> D3D12_GPU_DESCRIPTOR_HANDLE {
    D3D12_GPU_DESCRIPTOR_HANDLE { ptr: descriptor.0 }
}

fn states(states: ResourceStates) -> D3D12_RESOURCE_STATES {
    D3D12_RESOURCE_STATES(states.bits() as i32)
}

fn dxgi(format: u32) -> DXGI_FORMAT {
    DXGI_FORMAT(format as i32)
}

fn resource_desc(desc: &ResourceDesc) -> D3D12_RESOURCE_DESC {
    match *desc {
        ResourceDesc::Buffer { size } => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        },
        ResourceDesc::Texture {
            dimension,
            format,
            width,
            height,
            depth_or_array_size,
            mip_levels,
            sample_count,
            flags,
        } => {
            let mut resource_flags = D3D12_RESOURCE_FLAG_NONE;
            if flags.contains(TextureFlags::RENDER_TARGET) {
                resource_flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
            }
            if flags.contains(TextureFlags::DEPTH_STENCIL) {
                resource_flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
                if !flags.contains(TextureFlags::SHADER_RESOURCE) {
                    resource_flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
                }
            }
            if flags.contains(TextureFlags::UNORDERED_ACCESS) {
                resource_flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
            }
            D3D12_RESOURCE_DESC {
                Dimension: match dimension {
                    TextureDimension::Texture1D => D3D12_RESOURCE_DIMENSION_TEXTURE1D,
                    TextureDimension::Texture2D | TextureDimension::TextureCube => D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                    TextureDimension::Texture3D => D3D12_RESOURCE_DIMENSION_TEXTURE3D,
                },
                Width: u64::from(width),
                Height: height,
                DepthOrArraySize: depth_or_array_size as u16,
                MipLevels: mip_levels as u16,
                Format: dxgi(resource_format(format, flags)),
                SampleDesc: DXGI_SAMPLE_DESC { Count: sample_count.max(1), Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: resource_flags,
                ..Default::default()
            }
        }
    }
}

fn shader_resource_desc(view: &ViewDesc) -> D3D12_SHADER_RESOURCE_VIEW_DESC {
    let mut desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
        Format: dxgi(shader_resource_format(view.format)),
        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
        ..Default::default()
    };
    match view.dimension {
        TextureDimension::Texture1D => {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE1DARRAY;
            desc.Anonymous.Texture1DArray = D3D12_TEX1D_ARRAY_SRV {
                MostDetailedMip: view.first_mip,
                MipLevels: view.mip_count,
                FirstArraySlice: view.first_slice,
                ArraySize: view.slice_count,
                ResourceMinLODClamp: 0.0,
            };
        }
        TextureDimension::Texture2D => {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_SRV {
                MostDetailedMip: view.first_mip,
                MipLevels: view.mip_count,
                FirstArraySlice: view.first_slice,
                ArraySize: view.slice_count,
                PlaneSlice: 0,
                ResourceMinLODClamp: 0.0,
            };
        }
        TextureDimension::TextureCube => {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURECUBE;
            desc.Anonymous.TextureCube = D3D12_TEXCUBE_SRV {
                MostDetailedMip: view.first_mip,
                MipLevels: view.mip_count,
                ResourceMinLODClamp: 0.0,
            };
        }
        TextureDimension::Texture3D => {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE3D;
            desc.Anonymous.Texture3D = D3D12_TEX3D_SRV {
                MostDetailedMip: view.first_mip,
                MipLevels: view.mip_count,
                ResourceMinLODClamp: 0.0,
            };
        }
    }
    desc
}

fn render_target_desc(view: &ViewDesc) -> D3D12_RENDER_TARGET_VIEW_DESC {
    let mut desc = D3D12_RENDER_TARGET_VIEW_DESC {
        Format: dxgi(view.format.dxgi()),
        ..Default::default()
    };
    match view.dimension {
        TextureDimension::Texture1D => {
            desc.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE1DARRAY;
            desc.Anonymous.Texture1DArray = D3D12_TEX1D_ARRAY_RTV {
                MipSlice: view.first_mip,
                FirstArraySlice: view.first_slice,
                ArraySize: view.slice_count,
            };
        }
        TextureDimension::Texture2D | TextureDimension::TextureCube => {
            desc.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE2DARRAY;
            desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_RTV {
                MipSlice: view.first_mip,
                FirstArraySlice: view.first_slice,
                ArraySize: view.slice_count,
                PlaneSlice: 0,
            };
        }
        TextureDimension::Texture3D => {
            desc.ViewDimension = D3D12_RTV_DIMENSION_TEXTURE3D;
            desc.Anonymous.Texture3D = D3D12_TEX3D_RTV {
                MipSlice: view.first_mip,
                FirstWSlice: view.first_slice,
                WSize: view.slice_count,
            };
        }
    }
    desc
}

fn depth_stencil_desc(view: &ViewDesc) -> D3D12_DEPTH_STENCIL_VIEW_DESC {
    let mut desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
        Format: dxgi(depth_stencil_format(view.format)),
        ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2DARRAY,
        Flags: if view.read_only {
            D3D12_DSV_FLAG_READ_ONLY_DEPTH | D3D12_DSV_FLAG_READ_ONLY_STENCIL
        } else {
            D3D12_DSV_FLAG_NONE
        },
        ..Default::default()
    };
    desc.Anonymous.Texture2DArray = D3D12_TEX2D_ARRAY_DSV {
        MipSlice: view.first_mip,
        FirstArraySlice: view.first_slice,
        ArraySize: view.slice_count,
    };
    desc
}

fn address_mode(mode: TextureAddressMode) -> D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        TextureAddressMode::Wrap => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        TextureAddressMode::Mirror => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        TextureAddressMode::Clamp => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        TextureAddressMode::Border => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

fn comparison(function: CompareFunction) -> D3D12_COMPARISON_FUNC {
    match function {
        CompareFunction::Never => D3D12_COMPARISON_FUNC_NEVER,
        CompareFunction::Less => D3D12_COMPARISON_FUNC_LESS,
        CompareFunction::Equal => D3D12_COMPARISON_FUNC_EQUAL,
        CompareFunction::LessEqual => D3D12_COMPARISON_FUNC_LESS_EQUAL,
        CompareFunction::Greater => D3D12_COMPARISON_FUNC_GREATER,
        CompareFunction::NotEqual => D3D12_COMPARISON_FUNC_NOT_EQUAL,
        CompareFunction::GreaterEqual => D3D12_COMPARISON_FUNC_GREATER_EQUAL,
        CompareFunction::Always => D3D12_COMPARISON_FUNC_ALWAYS,
    }
}

fn sampler_desc(sampler: &SamplerState) -> D3D12_SAMPLER_DESC {
    D3D12_SAMPLER_DESC {
        Filter: match sampler.filter {
            TextureFilter::Point => D3D12_FILTER_MIN_MAG_MIP_POINT,
            TextureFilter::Linear => D3D12_FILTER_MIN_MAG_MIP_LINEAR,
            TextureFilter::MinPointMagLinearMipPoint => D3D12_FILTER_MIN_POINT_MAG_LINEAR_MIP_POINT,
            TextureFilter::MinLinearMagPointMipLinear => D3D12_FILTER_MIN_LINEAR_MAG_POINT_MIP_LINEAR,
            TextureFilter::Anisotropic => D3D12_FILTER_ANISOTROPIC,
            TextureFilter::ComparisonPoint => D3D12_FILTER_COMPARISON_MIN_MAG_MIP_POINT,
            TextureFilter::ComparisonLinear => D3D12_FILTER_COMPARISON_MIN_MAG_MIP_LINEAR,
        },
        AddressU: address_mode(sampler.address_u),
        AddressV: address_mode(sampler.address_v),
        AddressW: address_mode(sampler.address_w),
        MipLODBias: sampler.mip_map_level_of_detail_bias,
        MaxAnisotropy: sampler.max_anisotropy.clamp(1, 16),
        ComparisonFunc: comparison(sampler.compare_function),
        BorderColor: sampler.border_color.to_array(),
        MinLOD: sampler.min_mip_level,
        MaxLOD: sampler.max_mip_level,
    }
}

fn topology(primitive: PrimitiveType) -> D3D_PRIMITIVE_TOPOLOGY {
    match primitive {
        PrimitiveType::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveType::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveType::LineStrip => D3D_PRIMITIVE_TOPOLOGY_LINESTRIP,
        PrimitiveType::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveType::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
    }
}

/// A non-owning reference for descriptor structs that hold `ManuallyDrop`
/// interface pointers. Must not outlive `resource`.
unsafe fn borrowed(resource: &ID3D12Resource) -> ManuallyDrop<Option<ID3D12Resource>> {
    ManuallyDrop::new(Some(std::mem::transmute_copy(resource)))
}

fn copy_location(objects: &Objects, location: &CopyLocation) -> Option<D3D12_TEXTURE_COPY_LOCATION> {
    let (resource, r#type, anonymous) = match *location {
        CopyLocation::Subresource { resource, index } => (
            resource,
            D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: index },
        ),
        CopyLocation::Footprint { resource, footprint } => (
            resource,
            D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                    Offset: footprint.offset,
                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                        Format: dxgi(footprint.format.dxgi()),
                        Width: footprint.width,
                        Height: footprint.height,
                        Depth: footprint.depth,
                        RowPitch: footprint.row_pitch,
                    },
                },
            },
        ),
    };
    let resource = objects.resources.get(&resource.0)?;
    Some(D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { borrowed(resource) },
        Type: r#type,
        Anonymous: anonymous,
    })
}

/// Replay one command. Returns `false` when it names an unknown object.
fn replay(objects: &Objects, list: &ID3D12GraphicsCommandList, command: Command) -> bool {
    let resource = |id: NativeResource| objects.resources.get(&id.0);
    unsafe {
        match command {
            Command::SetDescriptorHeaps { srv, sampler } => {
                let (Some(srv), Some(sampler)) = (objects.heaps.get(&srv.0), objects.heaps.get(&sampler.0)) else {
                    return false;
                };
                list.SetDescriptorHeaps(&[Some(srv.clone()), Some(sampler.clone())]);
            }
            Command::SetPipelineState(pipeline) => {
                let (Some(state), Some(root)) = (
                    objects.pipelines.get(&pipeline.pipeline),
                    objects.root_signatures.get(&pipeline.root_signature),
                ) else {
                    return false;
                };
                list.SetGraphicsRootSignature(root);
                list.SetPipelineState(state);
            }
            Command::SetPrimitiveTopology(primitive) => list.IASetPrimitiveTopology(topology(primitive)),
            Command::SetRenderTargets { render_targets, depth_stencil } => {
                let handles: Vec<_> = render_targets.into_iter().map(cpu_handle).collect();
                let depth = depth_stencil.map(cpu_handle);
                list.OMSetRenderTargets(
                    handles.len() as u32,
                    (!handles.is_empty()).then_some(handles.as_ptr()),
                    false,
                    depth.as_ref().map(|d| d as *const _),
                );
            }
            Command::SetViewport(viewport) => list.RSSetViewports(&[D3D12_VIEWPORT {
                TopLeftX: viewport.x,
                TopLeftY: viewport.y,
                Width: viewport.width,
                Height: viewport.height,
                MinDepth: viewport.min_depth,
                MaxDepth: viewport.max_depth,
            }]),
            Command::SetScissor(rect) => list.RSSetScissorRects(&[RECT {
                left: rect.x,
                top: rect.y,
                right: rect.x + rect.width,
                bottom: rect.y + rect.height,
            }]),
            Command::SetVertexBuffer { slot, view } => {
                let Some(buffer) = resource(view.resource) else {
                    return false;
                };
                list.IASetVertexBuffers(
                    slot,
                    Some(&[D3D12_VERTEX_BUFFER_VIEW {
                        BufferLocation: buffer.GetGPUVirtualAddress() + view.offset,
                        SizeInBytes: view.size,
                        StrideInBytes: view.stride,
                    }]),
                );
            }
            Command::SetIndexBuffer(None) => list.IASetIndexBuffer(None),
            Command::SetIndexBuffer(Some(view)) => {
                let Some(buffer) = resource(view.resource) else {
                    return false;
                };
                list.IASetIndexBuffer(Some(&D3D12_INDEX_BUFFER_VIEW {
                    BufferLocation: buffer.GetGPUVirtualAddress() + view.offset,
                    SizeInBytes: view.size,
                    Format: if view.is_32bit { DXGI_FORMAT_R32_UINT } else { DXGI_FORMAT_R16_UINT },
                }));
            }
            Command::SetGraphicsRootDescriptorTable { parameter, table } => {
                list.SetGraphicsRootDescriptorTable(parameter, gpu_handle(table))
            }
            Command::SetStencilReference(value) => list.OMSetStencilRef(value),
            Command::SetBlendFactor(factor) => list.OMSetBlendFactor(Some(&factor)),
            Command::ResourceBarrier { resource: id, before, after } => {
                let Some(target) = resource(id) else {
                    return false;
                };
                let barrier = D3D12_RESOURCE_BARRIER {
                    Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                    Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                    Anonymous: D3D12_RESOURCE_BARRIER_0 {
                        Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                            pResource: borrowed(target),
                            StateBefore: states(before),
                            StateAfter: states(after),
                            Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                        }),
                    },
                };
                list.ResourceBarrier(&[barrier]);
            }
            Command::ClearRenderTargetView { view, color } => {
                list.ClearRenderTargetView(cpu_handle(view), &color, None)
            }
            Command::ClearDepthStencilView { view, options, depth, stencil } => list.ClearDepthStencilView(
                cpu_handle(view),
                D3D12_CLEAR_FLAGS(options.bits() as i32),
                depth,
                stencil,
                &[],
            ),
            Command::DrawInstanced { vertex_count, instance_count, start_vertex, start_instance } => {
                list.DrawInstanced(vertex_count, instance_count, start_vertex, start_instance)
            }
            Command::DrawIndexedInstanced { index_count, instance_count, start_index, base_vertex, start_instance } => {
                list.DrawIndexedInstanced(index_count, instance_count, start_index, base_vertex, start_instance)
            }
            Command::Dispatch { x, y, z } => list.Dispatch(x, y, z),
            Command::CopyResource { destination, source } => {
                let (Some(destination), Some(source)) = (resource(destination), resource(source)) else {
                    return false;
                };
                list.CopyResource(destination, source);
            }
            Command::CopyTextureRegion { destination, x, y, z, source, region } => {
                let (Some(destination), Some(source)) =
                    (copy_location(objects, &destination), copy_location(objects, &source))
                else {
                    return false;
                };
                let source_box = region.map(|r| D3D12_BOX {
                    left: r.left,
                    top: r.top,
                    front: r.front,
                    right: r.right,
                    bottom: r.bottom,
                    back: r.back,
                });
                list.CopyTextureRegion(&destination, x, y, z, &source, source_box.as_ref().map(|b| b as *const _));
            }
            Command::CopyBufferRegion { destination, destination_offset, source, source_offset, size } => {
                let (Some(destination), Some(source)) = (resource(destination), resource(source)) else {
                    return false;
                };
                list.CopyBufferRegion(destination, destination_offset, source, source_offset, size);
            }
            Command::BeginEvent(name) => {
                // PIX reads metadata 1 as a null-terminated ANSI string.
                let mut bytes = name.into_bytes();
                bytes.push(0);
                list.BeginEvent(1, Some(bytes.as_ptr() as *const c_void), bytes.len() as u32);
            }
            Command::EndEvent => list.EndEvent(),
        }
    }
    true
}

impl D3d12Backend for WindowsD3d12 {
    fn open(&self, level: GraphicsProfile, debug: bool) -> Result<()> {
        let feature_level = feature_level(level)?;
        if debug && !*DEBUG_LAYER {
            warn!("continuing without the D3D12 debug layer");
        }

        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)) }?;

        // Try hardware first, fall back to WARP for CI/headless
        let (device, adapter_name) = match hardware_device(&factory, feature_level) {
            Some(found) => found,
            None => {
                debug!("no hardware D3D12 adapter at {level:?}, trying WARP");
                warp_device(&factory, feature_level)
                    .with_context(|| format!("no D3D12 adapter supports {level:?}"))?
            }
        };
        debug!("D3D12 device created on {adapter_name} at {level:?}");

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }?;
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        let event = FenceEvent(unsafe { CreateEventW(None, false, false, None) }?);

        *self.native.write() = Some(NativeDevice {
            device,
            queue,
            fence,
            event,
            adapter_name,
        });
        Ok(())
    }

    fn adapter_name(&self) -> String {
        self.native().map(|native| native.adapter_name.clone()).unwrap_or_default()
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        self.device()
            .map(|device| unsafe { device.GetDescriptorHandleIncrementSize(heap_type(kind)) })
            .unwrap_or(0)
    }

    fn create_descriptor_heap(&self, kind: DescriptorHeapKind, capacity: u32, shader_visible: bool) -> Result<NativeHeap> {
        let device = self.native()?.device.clone();
        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type(kind),
                NumDescriptors: capacity,
                Flags: if shader_visible {
                    D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                } else {
                    D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                },
                NodeMask: 0,
            })
        }?;
        let cpu_start = CpuDescriptor(unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr as u64);
        let gpu_start = if shader_visible {
            GpuDescriptor(unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr)
        } else {
            GpuDescriptor::default()
        };
        let id = self.next_id();
        self.objects.lock().heaps.insert(id, heap);
        Ok(NativeHeap {
            id: NativeHeapId(id),
            kind,
            capacity,
            cpu_start,
            gpu_start,
        })
    }

    fn release_descriptor_heap(&self, heap: NativeHeapId) {
        self.objects.lock().heaps.remove(&heap.0);
    }

    fn copy_descriptors(&self, count: u32, destination: CpuDescriptor, source: CpuDescriptor, kind: DescriptorHeapKind) {
        if let Some(device) = self.device() {
            unsafe { device.CopyDescriptorsSimple(count, cpu_handle(destination), cpu_handle(source), heap_type(kind)) };
        }
    }

    fn create_committed_resource(&self, desc: &ResourceDesc, heap: HeapType, initial_state: ResourceStates) -> Result<NativeResource> {
        let device = self.native()?.device.clone();
        let properties = D3D12_HEAP_PROPERTIES {
            Type: match heap {
                HeapType::Default => D3D12_HEAP_TYPE_DEFAULT,
                HeapType::Upload => D3D12_HEAP_TYPE_UPLOAD,
                HeapType::Readback => D3D12_HEAP_TYPE_READBACK,
            },
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            device.CreateCommittedResource(
                &properties,
                D3D12_HEAP_FLAG_NONE,
                &resource_desc(desc),
                states(initial_state),
                None,
                &mut resource,
            )
        }
        .with_context(|| format!("CreateCommittedResource({desc:?})"))?;
        let resource = resource.ok_or_else(|| anyhow!("CreateCommittedResource returned no resource"))?;
        let id = self.next_id();
        self.objects.lock().resources.insert(id, resource);
        Ok(NativeResource(id))
    }

    fn release_resource(&self, resource: NativeResource) {
        self.objects.lock().resources.remove(&resource.0);
    }

    fn map(&self, resource: NativeResource) -> Result<*mut u8> {
        let native = self
            .resource(resource)
            .ok_or_else(|| anyhow!("unknown D3D12 resource {}", resource.0))?;
        let mut data: *mut c_void = std::ptr::null_mut();
        unsafe { native.Map(0, None, Some(&mut data)) }?;
        Ok(data as *mut u8)
    }

    fn unmap(&self, resource: NativeResource) {
        if let Some(native) = self.resource(resource) {
            unsafe { native.Unmap(0, None) };
        }
    }

    fn create_shader_resource_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor) {
        let (Some(device), Some(resource)) = (self.device(), self.resource(resource)) else {
            return;
        };
        let desc = shader_resource_desc(view);
        unsafe { device.CreateShaderResourceView(&resource, Some(&desc), cpu_handle(destination)) };
    }

    fn create_render_target_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor) {
        let (Some(device), Some(resource)) = (self.device(), self.resource(resource)) else {
            return;
        };
        let desc = render_target_desc(view);
        unsafe { device.CreateRenderTargetView(&resource, Some(&desc), cpu_handle(destination)) };
    }

    fn create_depth_stencil_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor) {
        let (Some(device), Some(resource)) = (self.device(), self.resource(resource)) else {
            return;
        };
        let desc = depth_stencil_desc(view);
        unsafe { device.CreateDepthStencilView(&resource, Some(&desc), cpu_handle(destination)) };
    }

    fn create_constant_buffer_view(&self, resource: NativeResource, offset: u64, size: u32, destination: CpuDescriptor) {
        let (Some(device), Some(resource)) = (self.device(), self.resource(resource)) else {
            return;
        };
        let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
            BufferLocation: unsafe { resource.GetGPUVirtualAddress() } + offset,
            // Constant buffer views are sized in 256-byte units.
            SizeInBytes: size.div_ceil(256) * 256,
        };
        unsafe { device.CreateConstantBufferView(Some(&desc), cpu_handle(destination)) };
    }

    fn create_sampler(&self, sampler: &SamplerState, destination: CpuDescriptor) {
        if let Some(device) = self.device() {
            unsafe { device.CreateSampler(&sampler_desc(sampler), cpu_handle(destination)) };
        }
    }

    fn create_command_allocator(&self) -> Result<NativeCommandAllocator> {
        let device = self.native()?.device.clone();
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        let id = self.next_id();
        self.objects.lock().allocators.insert(id, allocator);
        Ok(NativeCommandAllocator(id))
    }

    fn reset_command_allocator(&self, allocator: NativeCommandAllocator) -> Result<()> {
        let objects = self.objects.lock();
        let native = objects
            .allocators
            .get(&allocator.0)
            .ok_or_else(|| anyhow!("unknown command allocator {}", allocator.0))?;
        unsafe { native.Reset() }?;
        Ok(())
    }

    fn release_command_allocator(&self, allocator: NativeCommandAllocator) {
        self.objects.lock().allocators.remove(&allocator.0);
    }

    fn create_command_list(&self, allocator: NativeCommandAllocator) -> Result<NativeCommandList> {
        let device = self.native()?.device.clone();
        let mut objects = self.objects.lock();
        let native_allocator = objects
            .allocators
            .get(&allocator.0)
            .ok_or_else(|| anyhow!("unknown command allocator {}", allocator.0))?;
        let list: ID3D12GraphicsCommandList =
            unsafe { device.CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, native_allocator, None) }?;
        let id = self.next_id();
        objects.lists.insert(id, list);
        Ok(NativeCommandList(id))
    }

    fn reset_command_list(&self, list: NativeCommandList, allocator: NativeCommandAllocator) -> Result<()> {
        let objects = self.objects.lock();
        let (Some(native_list), Some(native_allocator)) = (objects.lists.get(&list.0), objects.allocators.get(&allocator.0)) else {
            bail!("unknown command list {} or allocator {}", list.0, allocator.0);
        };
        unsafe { native_list.Reset(native_allocator, None) }?;
        Ok(())
    }

    fn record(&self, list: NativeCommandList, command: Command) {
        let objects = self.objects.lock();
        let Some(native) = objects.lists.get(&list.0) else {
            error!("recording into unknown command list {}", list.0);
            return;
        };
        let name = format!("{command:?}");
        if !replay(&objects, native, command) {
            error!("dropped {name}: it refers to a released object");
        }
    }

    fn close_command_list(&self, list: NativeCommandList) -> Result<()> {
        let objects = self.objects.lock();
        let native = objects
            .lists
            .get(&list.0)
            .ok_or_else(|| anyhow!("unknown command list {}", list.0))?;
        unsafe { native.Close() }?;
        Ok(())
    }

    fn release_command_list(&self, list: NativeCommandList) {
        self.objects.lock().lists.remove(&list.0);
    }

    fn execute(&self, list: NativeCommandList) -> Result<()> {
        let native = self.native()?;
        let submitted = {
            let objects = self.objects.lock();
            let list = objects
                .lists
                .get(&list.0)
                .ok_or_else(|| anyhow!("unknown command list {}", list.0))?;
            list.cast::<ID3D12CommandList>()?
        };
        unsafe { native.queue.ExecuteCommandLists(&[Some(submitted)]) };
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        let native = self.native()?;
        unsafe { native.queue.Signal(&native.fence, value) }?;
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.native().map(|native| unsafe { native.fence.GetCompletedValue() }).unwrap_or(0)
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        let native = self.native()?;
        unsafe {
            if native.fence.GetCompletedValue() < value {
                native.fence.SetEventOnCompletion(value, native.event.0)?;
                WaitForSingleObject(native.event.0, INFINITE);
            }
        }
        Ok(())
    }

    fn device_removed_reason(&self) -> i32 {
        match self.native() {
            Ok(native) => match unsafe { native.device.GetDeviceRemovedReason() } {
                Ok(()) => 0,
                Err(e) => e.code().0,
            },
            Err(_) => 0,
        }
    }
}

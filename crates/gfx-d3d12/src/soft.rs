//! CPU implementation of [`D3d12Backend`].
//!
//! `SoftD3d12` keeps resources and descriptor heaps in memory. Submitted
//! command streams are queued and only executed when the fence is waited
//! on, so "not yet complete" is observable. Execution tracks the state of
//! every resource and checks each barrier and copy against it; mismatches
//! are collected as validation messages rather than failing. Clears and
//! copies move real bytes. Draws and dispatches are counted, not
//! rasterized. Every entry point bumps a per-call counter.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, bail, Result};
use gfx_core::resource::compute_pitch;
use gfx_core::{DepthStencilClearOptions, GraphicsProfile, PixelFormat, ResourceRegion, SamplerState, TextureDimension};
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{
    Command, CopyLocation, CpuDescriptor, D3d12Backend, DescriptorHeapKind, GpuDescriptor, HeapType, NativeCommandAllocator,
    NativeCommandList, NativeHeap, NativeHeapId, NativeResource, PlacedFootprint, ResourceDesc, ResourceStates,
    ViewDesc,
};

const DESCRIPTOR_INCREMENT: u32 = 32;
/// Heap `n` occupies descriptor addresses `n << 32 ..`.
const HEAP_ADDRESS_SHIFT: u32 = 32;

#[derive(Debug, Clone)]
struct SoftImage {
    width: u32,
    height: u32,
    depth: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
enum SoftResource {
    Buffer {
        heap: HeapType,
        data: Box<[u8]>,
        state: ResourceStates,
    },
    Texture {
        format: PixelFormat,
        mip_levels: u32,
        /// Subresource order: mips of slice 0, then slice 1, ...
        images: Vec<SoftImage>,
        state: ResourceStates,
    },
}

enum Contents {
    Bytes(Vec<u8>),
    Images(Vec<SoftImage>),
}

impl SoftResource {
    fn state(&self) -> ResourceStates {
        match self {
            SoftResource::Buffer { state, .. } | SoftResource::Texture { state, .. } => *state,
        }
    }

    fn set_state(&mut self, after: ResourceStates) {
        match self {
            SoftResource::Buffer { state, .. } | SoftResource::Texture { state, .. } => *state = after,
        }
    }

    fn size(&self) -> u64 {
        match self {
            SoftResource::Buffer { data, .. } => data.len() as u64,
            SoftResource::Texture { images, .. } => images.iter().map(|image| image.data.len() as u64).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SoftDescriptor {
    ShaderResource(NativeResource, ViewDesc),
    RenderTarget(NativeResource, ViewDesc),
    DepthStencil(NativeResource, ViewDesc),
    ConstantBuffer(NativeResource),
    Sampler,
}

#[derive(Debug)]
struct SoftHeap {
    kind: DescriptorHeapKind,
    entries: Vec<Option<SoftDescriptor>>,
}

#[derive(Debug)]
struct SoftList {
    allocator: NativeCommandAllocator,
    open: bool,
    commands: Vec<Command>,
}

#[derive(Debug)]
enum Submission {
    Execute {
        allocator: NativeCommandAllocator,
        commands: Vec<Command>,
    },
    Signal(u64),
}

/// Bytes and origin-relative layout of an addressable region: a texture
/// image or a footprint inside a buffer. Units are texels, or blocks for
/// compressed formats.
#[derive(Debug, Clone, Copy)]
struct Layout {
    offset: usize,
    row_pitch: usize,
    slice_pitch: usize,
    unit: usize,
    extent: (u32, u32, u32),
    block: u32,
}

impl Layout {
    fn packed(format: PixelFormat, width: u32, height: u32, depth: u32) -> Self {
        let (row_bytes, slice_bytes) = compute_pitch(format, width, height);
        Self {
            offset: 0,
            row_pitch: row_bytes as usize,
            slice_pitch: slice_bytes as usize,
            unit: format.size_in_bytes() as usize,
            extent: units(format, width, height, depth),
            block: format.block_size(),
        }
    }

    fn footprint(footprint: &PlacedFootprint) -> Self {
        let (_, rows, _) = units(footprint.format, footprint.width, footprint.height, 1);
        Self {
            offset: footprint.offset as usize,
            row_pitch: footprint.row_pitch as usize,
            slice_pitch: footprint.row_pitch as usize * rows as usize,
            unit: footprint.format.size_in_bytes() as usize,
            extent: units(footprint.format, footprint.width, footprint.height, footprint.depth),
            block: footprint.format.block_size(),
        }
    }

    fn at(&self, x: u32, y: u32, z: u32) -> usize {
        self.offset + z as usize * self.slice_pitch + y as usize * self.row_pitch + x as usize * self.unit
    }

    /// Read `extent` units at `origin` as packed rows.
    fn read(&self, data: &[u8], origin: (u32, u32, u32), extent: (u32, u32, u32)) -> Option<Vec<u8>> {
        let row = extent.0 as usize * self.unit;
        let mut out = Vec::with_capacity(row * extent.1 as usize * extent.2 as usize);
        for z in 0..extent.2 {
            for y in 0..extent.1 {
                let start = self.at(origin.0, origin.1 + y, origin.2 + z);
                out.extend_from_slice(data.get(start..start + row)?);
            }
        }
        Some(out)
    }

    fn write(&self, data: &mut [u8], origin: (u32, u32, u32), extent: (u32, u32, u32), packed: &[u8]) -> Option<()> {
        let row = extent.0 as usize * self.unit;
        if row == 0 {
            return Some(());
        }
        let mut rows = packed.chunks(row);
        for z in 0..extent.2 {
            for y in 0..extent.1 {
                let start = self.at(origin.0, origin.1 + y, origin.2 + z);
                data.get_mut(start..start + row)?.copy_from_slice(rows.next()?);
            }
        }
        Some(())
    }
}

fn units(format: PixelFormat, width: u32, height: u32, depth: u32) -> (u32, u32, u32) {
    let block = format.block_size();
    (width.div_ceil(block), height.div_ceil(block), depth)
}

/// Clear value of one texel. Formats without an encoding clear to zero.
fn encode_color(format: PixelFormat, color: [f32; 4]) -> Vec<u8> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    let [r, g, b, a] = color;
    match format {
        PixelFormat::Rgba8Unorm | PixelFormat::Rgba8UnormSrgb => vec![unorm(r), unorm(g), unorm(b), unorm(a)],
        PixelFormat::Bgra8Unorm | PixelFormat::Bgra8UnormSrgb => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
        PixelFormat::R8Unorm => vec![unorm(r)],
        PixelFormat::Rgba32Float => [r, g, b, a].iter().flat_map(|c| c.to_ne_bytes()).collect(),
        other => vec![0; other.size_in_bytes() as usize],
    }
}

/// Write depth and/or stencil into one `Depth24UnormStencil8` texel.
fn encode_depth_stencil(format: PixelFormat, texel: &mut [u8], depth: Option<f32>, stencil: Option<u8>) {
    if format != PixelFormat::Depth24UnormStencil8 || texel.len() < 4 {
        return;
    }
    let mut packed = u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]);
    if let Some(depth) = depth {
        packed = (packed & 0xFF00_0000) | ((depth.clamp(0.0, 1.0) * 0xFF_FFFF as f32) as u32 & 0xFF_FFFF);
    }
    if let Some(stencil) = stencil {
        packed = (packed & 0x00FF_FFFF) | (u32::from(stencil) << 24);
    }
    texel[..4].copy_from_slice(&packed.to_le_bytes());
}

#[derive(Debug)]
struct SoftState {
    max_level: GraphicsProfile,
    removed_reason: i32,
    next_id: u64,
    resources: HashMap<NativeResource, SoftResource>,
    heaps: HashMap<NativeHeapId, SoftHeap>,
    allocators: HashSet<NativeCommandAllocator>,
    lists: HashMap<NativeCommandList, SoftList>,
    queue: VecDeque<Submission>,
    completed: u64,
    validation: Vec<String>,
    calls: HashMap<&'static str, usize>,
}

impl SoftState {
    fn count(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
    }

    fn invalid(&mut self, message: String) {
        trace!(%message, "validation");
        self.validation.push(message);
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn descriptor_slot(&self, address: u64) -> Option<(NativeHeapId, usize)> {
        let heap = NativeHeapId(address >> HEAP_ADDRESS_SHIFT);
        let offset = address & ((1 << HEAP_ADDRESS_SHIFT) - 1);
        Some((heap, (offset / u64::from(DESCRIPTOR_INCREMENT)) as usize))
    }

    fn descriptor(&self, address: CpuDescriptor) -> Option<SoftDescriptor> {
        let (heap, index) = self.descriptor_slot(address.0)?;
        *self.heaps.get(&heap)?.entries.get(index)?
    }

    fn write_descriptor(&mut self, address: CpuDescriptor, descriptor: SoftDescriptor) {
        let slot = self.descriptor_slot(address.0);
        let entry = slot.and_then(|(heap, index)| self.heaps.get_mut(&heap)?.entries.get_mut(index));
        match entry {
            Some(entry) => *entry = Some(descriptor),
            None => self.invalid(format!("descriptor written to unknown address 0x{:X}", address.0)),
        }
    }

    /// Check `resource` is in a state that includes `required`.
    fn expect_state(&mut self, resource: NativeResource, required: ResourceStates, what: &str) -> bool {
        match self.resources.get(&resource).map(SoftResource::state) {
            Some(state) if state.contains(required) => true,
            Some(state) => {
                self.invalid(format!("{what}: resource {} is in {state:?}, needs {required:?}", resource.0));
                false
            }
            None => {
                self.invalid(format!("{what}: unknown resource {}", resource.0));
                false
            }
        }
    }

    fn run(&mut self, commands: Vec<Command>) {
        for command in commands {
            self.run_command(command);
        }
    }

    fn run_command(&mut self, command: Command) {
        match command {
            Command::ResourceBarrier { resource, before, after } => match self.resources.get_mut(&resource) {
                Some(res) if res.state() == before => res.set_state(after),
                Some(res) => {
                    let actual = res.state();
                    res.set_state(after);
                    self.invalid(format!(
                        "barrier on resource {} expects {before:?} but it is in {actual:?}",
                        resource.0
                    ));
                }
                None => self.invalid(format!("barrier on unknown resource {}", resource.0)),
            },
            Command::ClearRenderTargetView { view, color } => {
                let Some(SoftDescriptor::RenderTarget(resource, view)) = self.descriptor(view) else {
                    return self.invalid(format!("clear of a non render target descriptor 0x{:X}", view.0));
                };
                if self.expect_state(resource, ResourceStates::RENDER_TARGET, "ClearRenderTargetView") {
                    self.clear_images(resource, &view, |format, texel| {
                        let value = encode_color(format, color);
                        texel.copy_from_slice(&value[..texel.len().min(value.len())]);
                    });
                }
            }
            Command::ClearDepthStencilView {
                view,
                options,
                depth,
                stencil,
            } => {
                let Some(SoftDescriptor::DepthStencil(resource, view)) = self.descriptor(view) else {
                    return self.invalid(format!("clear of a non depth-stencil descriptor 0x{:X}", view.0));
                };
                let depth = options.contains(DepthStencilClearOptions::DEPTH_BUFFER).then_some(depth);
                let stencil = options.contains(DepthStencilClearOptions::STENCIL).then_some(stencil);
                if self.expect_state(resource, ResourceStates::DEPTH_WRITE, "ClearDepthStencilView") {
                    self.clear_images(resource, &view, |format, texel| {
                        encode_depth_stencil(format, texel, depth, stencil)
                    });
                }
            }
            Command::CopyResource { destination, source } => {
                let ok = self.expect_state(source, ResourceStates::COPY_SOURCE, "CopyResource")
                    & self.expect_state(destination, ResourceStates::COPY_DEST, "CopyResource");
                if ok {
                    self.copy_resource(destination, source);
                }
            }
            Command::CopyBufferRegion {
                destination,
                destination_offset,
                source,
                source_offset,
                size,
            } => {
                let ok = self.expect_state(source, ResourceStates::COPY_SOURCE, "CopyBufferRegion")
                    & self.expect_state(destination, ResourceStates::COPY_DEST, "CopyBufferRegion");
                if ok {
                    self.copy_buffer_region(destination, destination_offset, source, source_offset, size);
                }
            }
            Command::CopyTextureRegion {
                destination,
                x,
                y,
                z,
                source,
                region,
            } => self.copy_texture_region(destination, (x, y, z), source, region),
            Command::DrawInstanced { .. } | Command::DrawIndexedInstanced { .. } => self.count("draw"),
            Command::Dispatch { .. } => self.count("dispatch"),
            _ => {}
        }
    }

    fn clear_images(&mut self, resource: NativeResource, view: &ViewDesc, mut texel: impl FnMut(PixelFormat, &mut [u8])) {
        let Some(SoftResource::Texture {
            format,
            mip_levels,
            images,
            ..
        }) = self.resources.get_mut(&resource)
        else {
            return;
        };
        let mip_levels = *mip_levels;
        let pixel = format.size_in_bytes() as usize;
        let format = *format;
        for slice in view.first_slice..view.first_slice + view.slice_count.max(1) {
            let index = (slice * mip_levels + view.first_mip) as usize;
            if let Some(image) = images.get_mut(index) {
                for chunk in image.data.chunks_mut(pixel) {
                    texel(format, chunk);
                }
            }
        }
    }

    fn copy_resource(&mut self, destination: NativeResource, source: NativeResource) {
        let copied = match self.resources.get(&source) {
            Some(SoftResource::Buffer { data, .. }) => Contents::Bytes(data.to_vec()),
            Some(SoftResource::Texture { images, .. }) => Contents::Images(images.clone()),
            None => return,
        };
        match (self.resources.get_mut(&destination), copied) {
            (Some(SoftResource::Buffer { data, .. }), Contents::Bytes(bytes)) if data.len() == bytes.len() => {
                data.copy_from_slice(&bytes);
            }
            (Some(SoftResource::Texture { images, .. }), Contents::Images(source_images))
                if images.iter().map(|i| i.data.len()).eq(source_images.iter().map(|i| i.data.len())) =>
            {
                *images = source_images;
            }
            _ => self.invalid(format!("CopyResource between mismatched resources {} and {}", source.0, destination.0)),
        }
    }

    fn copy_buffer_region(&mut self, destination: NativeResource, dst_offset: u64, source: NativeResource, src_offset: u64, size: u64) {
        let (src_start, dst_start, size) = (src_offset as usize, dst_offset as usize, size as usize);
        let bytes = match self.resources.get(&source) {
            Some(SoftResource::Buffer { data, .. }) => data.get(src_start..src_start + size).map(<[u8]>::to_vec),
            _ => None,
        };
        let written = match (self.resources.get_mut(&destination), bytes) {
            (Some(SoftResource::Buffer { data, .. }), Some(bytes)) => data
                .get_mut(dst_start..dst_start + size)
                .map(|target| target.copy_from_slice(&bytes))
                .is_some(),
            _ => false,
        };
        if !written {
            self.invalid(format!("CopyBufferRegion out of range ({size} bytes)"));
        }
    }

    /// Resolve a copy location to its resource and layout.
    fn location(&self, location: &CopyLocation) -> Option<(NativeResource, Option<usize>, Layout)> {
        match *location {
            CopyLocation::Subresource { resource, index } => {
                let Some(SoftResource::Texture { format, images, .. }) = self.resources.get(&resource) else {
                    return None;
                };
                let image = images.get(index as usize)?;
                Some((
                    resource,
                    Some(index as usize),
                    Layout::packed(*format, image.width, image.height, image.depth),
                ))
            }
            CopyLocation::Footprint { resource, footprint } => {
                match self.resources.get(&resource)? {
                    SoftResource::Buffer { .. } => Some((resource, None, Layout::footprint(&footprint))),
                    SoftResource::Texture { .. } => None,
                }
            }
        }
    }

    fn copy_texture_region(
        &mut self,
        destination: CopyLocation,
        offset: (u32, u32, u32),
        source: CopyLocation,
        region: Option<ResourceRegion>,
    ) {
        let (Some((src, src_image, src_layout)), Some((dst, dst_image, dst_layout))) =
            (self.location(&source), self.location(&destination))
        else {
            return self.invalid("CopyTextureRegion on an unknown or mismatched location".to_owned());
        };
        let ok = self.expect_state(src, ResourceStates::COPY_SOURCE, "CopyTextureRegion")
            & self.expect_state(dst, ResourceStates::COPY_DEST, "CopyTextureRegion");
        if !ok {
            return;
        }

        let block = src_layout.block.max(1);
        let (origin, extent) = match region {
            Some(r) => (
                (r.left / block, r.top / block, r.front),
                (r.width().div_ceil(block), r.height().div_ceil(block), r.depth()),
            ),
            None => ((0, 0, 0), src_layout.extent),
        };
        let block = dst_layout.block.max(1);
        let target = (offset.0 / block, offset.1 / block, offset.2);
        if target.0 + extent.0 > dst_layout.extent.0
            || target.1 + extent.1 > dst_layout.extent.1
            || target.2 + extent.2 > dst_layout.extent.2
        {
            return self.invalid(format!("CopyTextureRegion of {extent:?} at {target:?} exceeds {:?}", dst_layout.extent));
        }

        let bytes = match (self.resources.get(&src), src_image) {
            (Some(SoftResource::Texture { images, .. }), Some(index)) => src_layout.read(&images[index].data, origin, extent),
            (Some(SoftResource::Buffer { data, .. }), None) => src_layout.read(data, origin, extent),
            _ => None,
        };
        let Some(bytes) = bytes else {
            return self.invalid("CopyTextureRegion source out of range".to_owned());
        };
        let written = match (self.resources.get_mut(&dst), dst_image) {
            (Some(SoftResource::Texture { images, .. }), Some(index)) => {
                dst_layout.write(&mut images[index].data, target, extent, &bytes)
            }
            (Some(SoftResource::Buffer { data, .. }), None) => dst_layout.write(data, target, extent, &bytes),
            _ => None,
        };
        if written.is_none() {
            self.invalid("CopyTextureRegion destination out of range".to_owned());
        }
    }
}

/// Software D3D12 device.
pub struct SoftD3d12 {
    state: Mutex<SoftState>,
}

impl Default for SoftD3d12 {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftD3d12 {
    /// A device that accepts every feature level.
    pub fn new() -> Self {
        Self::with_max_level(GraphicsProfile::Level_11_2)
    }

    /// A device whose `open` fails above `max_level`.
    pub fn with_max_level(max_level: GraphicsProfile) -> Self {
        Self {
            state: Mutex::new(SoftState {
                max_level,
                removed_reason: 0,
                next_id: 0,
                resources: HashMap::new(),
                heaps: HashMap::new(),
                allocators: HashSet::new(),
                lists: HashMap::new(),
                queue: VecDeque::new(),
                completed: 0,
                validation: Vec::new(),
                calls: HashMap::new(),
            }),
        }
    }

    /// Make `GetDeviceRemovedReason` report `reason` until the next `open`.
    pub fn set_removed_reason(&self, reason: i32) {
        self.state.lock().removed_reason = reason;
    }

    /// Execute every queued submission.
    pub fn complete_all(&self) {
        let mut s = self.state.lock();
        while let Some(submission) = s.queue.pop_front() {
            match submission {
                Submission::Execute { commands, .. } => s.run(commands),
                Submission::Signal(value) => s.completed = s.completed.max(value),
            }
        }
    }

    /// Number of times `call` (a backend method name) was issued.
    pub fn call_count(&self, call: &str) -> usize {
        self.state.lock().calls.get(call).copied().unwrap_or(0)
    }

    pub fn reset_call_counts(&self) {
        self.state.lock().calls.clear();
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation.clone()
    }

    /// Commands recorded since `list` was last reset.
    pub fn recorded_commands(&self, list: NativeCommandList) -> Vec<Command> {
        self.state
            .lock()
            .lists
            .get(&list)
            .map(|l| l.commands.clone())
            .unwrap_or_default()
    }

    pub fn resource_size(&self, resource: NativeResource) -> Option<u64> {
        self.state.lock().resources.get(&resource).map(SoftResource::size)
    }

    /// Tightly packed contents of one texture subresource.
    pub fn subresource_data(&self, resource: NativeResource, subresource: u32) -> Option<Vec<u8>> {
        match self.state.lock().resources.get(&resource)? {
            SoftResource::Texture { images, .. } => images.get(subresource as usize).map(|image| image.data.clone()),
            SoftResource::Buffer { .. } => None,
        }
    }

    pub fn buffer_data(&self, resource: NativeResource) -> Option<Vec<u8>> {
        match self.state.lock().resources.get(&resource)? {
            SoftResource::Buffer { data, .. } => Some(data.to_vec()),
            SoftResource::Texture { .. } => None,
        }
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl D3d12Backend for SoftD3d12 {
    fn open(&self, level: GraphicsProfile, _debug: bool) -> Result<()> {
        let mut s = self.state.lock();
        s.count("open");
        if level > s.max_level {
            bail!("feature level {level:?} is not supported by the software adapter");
        }
        s.removed_reason = 0;
        Ok(())
    }

    fn adapter_name(&self) -> String {
        "Software D3D12 Adapter".to_owned()
    }

    fn descriptor_increment(&self, _kind: DescriptorHeapKind) -> u32 {
        DESCRIPTOR_INCREMENT
    }

    fn create_descriptor_heap(&self, kind: DescriptorHeapKind, capacity: u32, shader_visible: bool) -> Result<NativeHeap> {
        let mut s = self.state.lock();
        s.count("create_descriptor_heap");
        if shader_visible && matches!(kind, DescriptorHeapKind::RenderTarget | DescriptorHeapKind::DepthStencil) {
            bail!("{kind:?} heaps cannot be shader visible");
        }
        let id = NativeHeapId(s.alloc_id());
        s.heaps.insert(
            id,
            SoftHeap {
                kind,
                entries: vec![None; capacity as usize],
            },
        );
        let start = id.0 << HEAP_ADDRESS_SHIFT;
        Ok(NativeHeap {
            id,
            kind,
            capacity,
            cpu_start: CpuDescriptor(start),
            gpu_start: if shader_visible { GpuDescriptor(start) } else { GpuDescriptor::default() },
        })
    }

    fn release_descriptor_heap(&self, heap: NativeHeapId) {
        let mut s = self.state.lock();
        s.count("release_descriptor_heap");
        s.heaps.remove(&heap);
    }

    fn copy_descriptors(&self, count: u32, destination: CpuDescriptor, source: CpuDescriptor, kind: DescriptorHeapKind) {
        let mut s = self.state.lock();
        s.count("copy_descriptors");
        for i in 0..count {
            let from = source.offset(i, DESCRIPTOR_INCREMENT);
            let to = destination.offset(i, DESCRIPTOR_INCREMENT);
            let heap_kind = s.descriptor_slot(to.0).and_then(|(heap, _)| s.heaps.get(&heap)).map(|h| h.kind);
            if heap_kind != Some(kind) {
                s.invalid(format!("copy of {kind:?} descriptors into a {heap_kind:?} heap"));
                return;
            }
            // Unwritten source slots copy as empty.
            if let Some(descriptor) = s.descriptor(from) {
                s.write_descriptor(to, descriptor);
            }
        }
    }

    fn create_committed_resource(&self, desc: &ResourceDesc, heap: HeapType, initial_state: ResourceStates) -> Result<NativeResource> {
        let mut s = self.state.lock();
        s.count("create_committed_resource");
        let resource = match *desc {
            ResourceDesc::Buffer { size } => SoftResource::Buffer {
                heap,
                data: vec![0; size as usize].into_boxed_slice(),
                state: initial_state,
            },
            ResourceDesc::Texture {
                dimension,
                format,
                width,
                height,
                depth_or_array_size,
                mip_levels,
                ..
            } => {
                if heap != HeapType::Default {
                    bail!("textures live in the default heap");
                }
                let (depth, slices) = match dimension {
                    TextureDimension::Texture3D => (depth_or_array_size, 1),
                    _ => (1, depth_or_array_size),
                };
                let mut images = Vec::with_capacity((slices * mip_levels) as usize);
                for _ in 0..slices {
                    for mip in 0..mip_levels {
                        let (w, h, d) = ((width >> mip).max(1), (height >> mip).max(1), (depth >> mip).max(1));
                        let (_, slice_bytes) = compute_pitch(format, w, h);
                        images.push(SoftImage {
                            width: w,
                            height: h,
                            depth: d,
                            data: vec![0; (slice_bytes * d) as usize],
                        });
                    }
                }
                SoftResource::Texture {
                    format,
                    mip_levels,
                    images,
                    state: initial_state,
                }
            }
        };
        let id = NativeResource(s.alloc_id());
        s.resources.insert(id, resource);
        Ok(id)
    }

    fn release_resource(&self, resource: NativeResource) {
        let mut s = self.state.lock();
        s.count("release_resource");
        if s.resources.remove(&resource).is_none() {
            s.invalid(format!("release of unknown resource {}", resource.0));
        }
    }

    fn map(&self, resource: NativeResource) -> Result<*mut u8> {
        let mut s = self.state.lock();
        s.count("map");
        match s.resources.get_mut(&resource) {
            Some(SoftResource::Buffer { heap, data, .. }) if *heap != HeapType::Default => Ok(data.as_mut_ptr()),
            Some(_) => bail!("resource {} is not CPU visible", resource.0),
            None => Err(anyhow!("map of unknown resource {}", resource.0)),
        }
    }

    fn unmap(&self, _resource: NativeResource) {
        self.state.lock().count("unmap");
    }

    fn create_shader_resource_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor) {
        let mut s = self.state.lock();
        s.count("create_shader_resource_view");
        s.write_descriptor(destination, SoftDescriptor::ShaderResource(resource, *view));
    }

    fn create_render_target_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor) {
        let mut s = self.state.lock();
        s.count("create_render_target_view");
        s.write_descriptor(destination, SoftDescriptor::RenderTarget(resource, *view));
    }

    fn create_depth_stencil_view(&self, resource: NativeResource, view: &ViewDesc, destination: CpuDescriptor) {
        let mut s = self.state.lock();
        s.count("create_depth_stencil_view");
        s.write_descriptor(destination, SoftDescriptor::DepthStencil(resource, *view));
    }

    fn create_constant_buffer_view(&self, resource: NativeResource, _offset: u64, _size: u32, destination: CpuDescriptor) {
        let mut s = self.state.lock();
        s.count("create_constant_buffer_view");
        s.write_descriptor(destination, SoftDescriptor::ConstantBuffer(resource));
    }

    fn create_sampler(&self, _sampler: &SamplerState, destination: CpuDescriptor) {
        let mut s = self.state.lock();
        s.count("create_sampler");
        s.write_descriptor(destination, SoftDescriptor::Sampler);
    }

    fn create_command_allocator(&self) -> Result<NativeCommandAllocator> {
        let mut s = self.state.lock();
        s.count("create_command_allocator");
        let allocator = NativeCommandAllocator(s.alloc_id());
        s.allocators.insert(allocator);
        Ok(allocator)
    }

    fn reset_command_allocator(&self, allocator: NativeCommandAllocator) -> Result<()> {
        let mut s = self.state.lock();
        s.count("reset_command_allocator");
        let in_flight = s
            .queue
            .iter()
            .any(|submission| matches!(submission, Submission::Execute { allocator: a, .. } if *a == allocator));
        if in_flight {
            s.invalid(format!("allocator {} reset while its commands are in flight", allocator.0));
        }
        Ok(())
    }

    fn release_command_allocator(&self, allocator: NativeCommandAllocator) {
        let mut s = self.state.lock();
        s.count("release_command_allocator");
        s.allocators.remove(&allocator);
    }

    fn create_command_list(&self, allocator: NativeCommandAllocator) -> Result<NativeCommandList> {
        let mut s = self.state.lock();
        s.count("create_command_list");
        if !s.allocators.contains(&allocator) {
            bail!("command list created on unknown allocator {}", allocator.0);
        }
        let list = NativeCommandList(s.alloc_id());
        s.lists.insert(
            list,
            SoftList {
                allocator,
                open: true,
                commands: Vec::new(),
            },
        );
        Ok(list)
    }

    fn reset_command_list(&self, list: NativeCommandList, allocator: NativeCommandAllocator) -> Result<()> {
        let mut s = self.state.lock();
        s.count("reset_command_list");
        let entry = s.lists.get_mut(&list).ok_or_else(|| anyhow!("reset of unknown command list {}", list.0))?;
        if entry.open {
            bail!("command list {} reset while open", list.0);
        }
        entry.open = true;
        entry.allocator = allocator;
        entry.commands.clear();
        Ok(())
    }

    fn record(&self, list: NativeCommandList, command: Command) {
        let mut s = self.state.lock();
        match s.lists.get_mut(&list) {
            Some(entry) if entry.open => entry.commands.push(command),
            Some(_) => s.invalid(format!("{command:?} recorded on closed list {}", list.0)),
            None => s.invalid(format!("{command:?} recorded on unknown list {}", list.0)),
        }
    }

    fn close_command_list(&self, list: NativeCommandList) -> Result<()> {
        let mut s = self.state.lock();
        s.count("close_command_list");
        let entry = s.lists.get_mut(&list).ok_or_else(|| anyhow!("close of unknown command list {}", list.0))?;
        if !entry.open {
            bail!("command list {} is already closed", list.0);
        }
        entry.open = false;
        Ok(())
    }

    fn release_command_list(&self, list: NativeCommandList) {
        let mut s = self.state.lock();
        s.count("release_command_list");
        s.lists.remove(&list);
    }

    fn execute(&self, list: NativeCommandList) -> Result<()> {
        let mut s = self.state.lock();
        s.count("execute");
        let entry = s.lists.get(&list).ok_or_else(|| anyhow!("execute of unknown command list {}", list.0))?;
        if entry.open {
            bail!("command list {} executed while open", list.0);
        }
        let submission = Submission::Execute {
            allocator: entry.allocator,
            commands: entry.commands.clone(),
        };
        s.queue.push_back(submission);
        Ok(())
    }

    fn signal(&self, value: u64) -> Result<()> {
        let mut s = self.state.lock();
        s.count("signal");
        s.queue.push_back(Submission::Signal(value));
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.state.lock().completed
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        let mut s = self.state.lock();
        s.count("wait_for_value");
        while s.completed < value {
            match s.queue.pop_front() {
                Some(Submission::Execute { commands, .. }) => s.run(commands),
                Some(Submission::Signal(signaled)) => s.completed = s.completed.max(signaled),
                None => bail!("fence value {value} was never signaled"),
            }
        }
        Ok(())
    }

    fn device_removed_reason(&self) -> i32 {
        self.state.lock().removed_reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfx_core::TextureFlags;

    fn texture_desc(format: PixelFormat, size: u32) -> ResourceDesc {
        ResourceDesc::Texture {
            dimension: TextureDimension::Texture2D,
            format,
            width: size,
            height: size,
            depth_or_array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            flags: TextureFlags::RENDER_TARGET,
        }
    }

    fn submit(soft: &SoftD3d12, commands: Vec<Command>) {
        let allocator = soft.create_command_allocator().unwrap();
        let list = soft.create_command_list(allocator).unwrap();
        for command in commands {
            soft.record(list, command);
        }
        soft.close_command_list(list).unwrap();
        soft.execute(list).unwrap();
    }

    #[test]
    fn execution_waits_for_the_fence() {
        let soft = SoftD3d12::new();
        let buffer = soft
            .create_committed_resource(&ResourceDesc::buffer(4), HeapType::Default, ResourceStates::COMMON)
            .unwrap();
        submit(
            &soft,
            vec![Command::ResourceBarrier {
                resource: buffer,
                before: ResourceStates::COMMON,
                after: ResourceStates::COPY_DEST,
            }],
        );
        soft.signal(1).unwrap();
        assert_eq!(soft.completed_value(), 0);
        assert_eq!(soft.pending_submissions(), 2);

        soft.wait_for_value(1).unwrap();
        assert_eq!(soft.completed_value(), 1);
        assert!(soft.wait_for_value(2).is_err());
    }

    #[test]
    fn mismatched_barriers_are_reported() {
        let soft = SoftD3d12::new();
        let buffer = soft
            .create_committed_resource(&ResourceDesc::buffer(4), HeapType::Default, ResourceStates::COMMON)
            .unwrap();
        submit(
            &soft,
            vec![Command::ResourceBarrier {
                resource: buffer,
                before: ResourceStates::RENDER_TARGET,
                after: ResourceStates::COPY_DEST,
            }],
        );
        soft.complete_all();
        assert_eq!(soft.validation_errors().len(), 1);
    }

    #[test]
    fn clears_encode_the_target_format() {
        let soft = SoftD3d12::new();
        let rtv_heap = soft.create_descriptor_heap(DescriptorHeapKind::RenderTarget, 4, false).unwrap();
        let dsv_heap = soft.create_descriptor_heap(DescriptorHeapKind::DepthStencil, 4, false).unwrap();
        let color = soft
            .create_committed_resource(&texture_desc(PixelFormat::Bgra8Unorm, 2), HeapType::Default, ResourceStates::RENDER_TARGET)
            .unwrap();
        let depth = soft
            .create_committed_resource(
                &texture_desc(PixelFormat::Depth24UnormStencil8, 2),
                HeapType::Default,
                ResourceStates::DEPTH_WRITE,
            )
            .unwrap();
        let view = ViewDesc {
            format: PixelFormat::Bgra8Unorm,
            dimension: TextureDimension::Texture2D,
            first_slice: 0,
            slice_count: 1,
            first_mip: 0,
            mip_count: 1,
            read_only: false,
        };
        soft.create_render_target_view(color, &view, rtv_heap.cpu_start);
        soft.create_depth_stencil_view(depth, &view, dsv_heap.cpu_start);

        submit(
            &soft,
            vec![
                Command::ClearRenderTargetView {
                    view: rtv_heap.cpu_start,
                    color: [1.0, 0.5, 0.0, 1.0],
                },
                Command::ClearDepthStencilView {
                    view: dsv_heap.cpu_start,
                    options: DepthStencilClearOptions::DEPTH_BUFFER | DepthStencilClearOptions::STENCIL,
                    depth: 1.0,
                    stencil: 7,
                },
            ],
        );
        soft.complete_all();

        assert_eq!(&soft.subresource_data(color, 0).unwrap()[..4], &[0, 128, 255, 255]);
        let texel = &soft.subresource_data(depth, 0).unwrap()[..4];
        assert_eq!(u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]), 0x07FF_FFFF);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn footprint_copies_honor_the_row_pitch() {
        let soft = SoftD3d12::new();
        let texture = soft
            .create_committed_resource(&texture_desc(PixelFormat::R8Unorm, 2), HeapType::Default, ResourceStates::COPY_DEST)
            .unwrap();
        let upload = soft
            .create_committed_resource(&ResourceDesc::buffer(512), HeapType::Upload, ResourceStates::GENERIC_READ)
            .unwrap();
        let base = soft.map(upload).unwrap();
        unsafe {
            *base = 1;
            *base.add(1) = 2;
            *base.add(256) = 3;
            *base.add(257) = 4;
        }
        let footprint = PlacedFootprint {
            offset: 0,
            format: PixelFormat::R8Unorm,
            width: 2,
            height: 2,
            depth: 1,
            row_pitch: 256,
        };
        submit(
            &soft,
            vec![Command::CopyTextureRegion {
                destination: CopyLocation::Subresource { resource: texture, index: 0 },
                x: 0,
                y: 0,
                z: 0,
                source: CopyLocation::Footprint { resource: upload, footprint },
                region: None,
            }],
        );
        soft.complete_all();
        assert_eq!(soft.subresource_data(texture, 0).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn descriptor_copies_check_the_heap_kind() {
        let soft = SoftD3d12::new();
        let cpu = soft.create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 4, false).unwrap();
        let samplers = soft.create_descriptor_heap(DescriptorHeapKind::Sampler, 4, true).unwrap();
        soft.copy_descriptors(1, samplers.cpu_start, cpu.cpu_start, DescriptorHeapKind::CbvSrvUav);
        assert_eq!(soft.validation_errors().len(), 1);
        assert!(soft.create_descriptor_heap(DescriptorHeapKind::RenderTarget, 4, true).is_err());
    }
}

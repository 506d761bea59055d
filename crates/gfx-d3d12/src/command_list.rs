//! Command recording for the D3D12 device.
//!
//! A [`CommandList`] owns one native list and a pair of shader-visible
//! descriptor heaps. Resource states are tracked on the device's resources
//! and every operation records the barriers it needs before the native
//! command.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use anyhow::Result;
use gfx_core::resource::compute_pitch;
use gfx_core::{
    Arena, Color4, DataBox, DepthStencilClearOptions, GraphicsError, GraphicsResourceUsage, Handle,
    MapMode, MappedResource, Rectangle, ResourceRegion, TextureFlags, Viewport,
};
use tracing::{debug, trace, warn};

use crate::backend::{
    Command, CopyLocation, CpuDescriptor, D3d12Backend, DescriptorHeapKind, GpuDescriptor, IndexBufferView,
    NativeCommandAllocator, NativeCommandList, NativeHeap, NativeResource, PlacedFootprint, ResourceStates,
    VertexBufferView,
};
use crate::descriptor::DescriptorSet;
use crate::device::{barrier, D3d12Device, D3d12Resource};
use crate::pipeline::D3d12PipelineState;
use crate::resource::{D3d12Buffer, D3d12Texture};

/// A closed list, ready for [`D3d12Device::execute_command_list`].
#[derive(Debug)]
pub struct CompiledCommandList {
    pub(crate) list: NativeCommandList,
    pub(crate) allocator: NativeCommandAllocator,
    pub(crate) srv_heaps: Vec<NativeHeap>,
    pub(crate) sampler_heaps: Vec<NativeHeap>,
}

/// The shader-visible heap a list copies descriptor sets into, and the
/// heaps it filled before the current one.
#[derive(Debug)]
struct ShaderVisibleHeap {
    kind: DescriptorHeapKind,
    increment: u32,
    current: Option<NativeHeap>,
    used: u32,
    /// CPU start of each set already copied into `current`.
    copies: HashMap<CpuDescriptor, GpuDescriptor>,
    retired: Vec<NativeHeap>,
}

impl ShaderVisibleHeap {
    fn new(kind: DescriptorHeapKind, increment: u32) -> Self {
        Self {
            kind,
            increment,
            current: None,
            used: 0,
            copies: HashMap::new(),
            retired: Vec::new(),
        }
    }

    fn start(&mut self, heap: NativeHeap) {
        if let Some(old) = self.current.replace(heap) {
            self.retired.push(old);
        }
        self.used = 0;
        self.copies.clear();
    }

    fn capacity(&self) -> u32 {
        self.current.map_or(0, |heap| heap.capacity)
    }

    /// GPU address of `count` descriptors starting at `start`, copying them
    /// in on first use. `None` when the heap has no room left.
    fn copy<B: D3d12Backend + ?Sized>(&mut self, backend: &B, start: CpuDescriptor, count: u32) -> Option<GpuDescriptor> {
        if let Some(&table) = self.copies.get(&start) {
            return Some(table);
        }
        let heap = self.current?;
        if self.used + count > heap.capacity {
            return None;
        }
        backend.copy_descriptors(count, heap.cpu_start.offset(self.used, self.increment), start, self.kind);
        let table = heap.gpu_start.offset(self.used, self.increment);
        self.used += count;
        self.copies.insert(start, table);
        Some(table)
    }

    /// Every heap this list used, current one included.
    fn finish(&mut self) -> Vec<NativeHeap> {
        self.retired.extend(self.current.take());
        self.copies.clear();
        self.used = 0;
        mem::take(&mut self.retired)
    }
}

enum SetCopy {
    Done(Vec<Command>),
    HeapFull { kind: DescriptorHeapKind, requested: u32 },
}

/// Bindings that survive a [`CommandList::flush`].
#[derive(Debug, Clone, Default)]
struct BoundState {
    pipeline: Option<D3d12PipelineState>,
    render_targets: Vec<Option<Handle<D3d12Texture>>>,
    depth_stencil: Option<Handle<D3d12Texture>>,
    target_views: Vec<CpuDescriptor>,
    depth_view: Option<CpuDescriptor>,
    viewport: Option<Viewport>,
    scissor: Option<Rectangle>,
    vertex_buffers: Vec<(u32, VertexBufferView)>,
    index_buffer: Option<IndexBufferView>,
    stencil_reference: u32,
    blend_factor: Option<[f32; 4]>,
}

/// A `WriteDiscard` / `WriteNoOverwrite` buffer mapping, copied into the
/// buffer on unmap.
#[derive(Debug, Clone, Copy)]
struct PendingUpload {
    destination_offset: u64,
    source: NativeResource,
    source_offset: u64,
    size: u64,
}

pub struct CommandList<B: D3d12Backend> {
    device: Arc<D3d12Device<B>>,
    pub(crate) list: NativeCommandList,
    /// Set while the list is open for recording.
    allocator: Option<NativeCommandAllocator>,
    srv_heap: ShaderVisibleHeap,
    sampler_heap: ShaderVisibleHeap,
    bound: BoundState,
    viewport_dirty: bool,
    pending_uploads: HashMap<Handle<D3d12Buffer>, PendingUpload>,
    profile_depth: u32,
}

impl<B: D3d12Backend> CommandList<B> {
    pub(crate) fn new(device: Arc<D3d12Device<B>>) -> Result<Self> {
        let allocator = device.get_command_allocator()?;
        let list = match device.get_native_command_list(allocator) {
            Ok(list) => list,
            Err(err) => {
                device.command_allocators.recycle_object(0, allocator);
                return Err(err);
            }
        };
        let backend = Arc::clone(device.backend());
        let mut command_list = Self {
            device,
            list,
            allocator: Some(allocator),
            srv_heap: ShaderVisibleHeap::new(
                DescriptorHeapKind::CbvSrvUav,
                backend.descriptor_increment(DescriptorHeapKind::CbvSrvUav),
            ),
            sampler_heap: ShaderVisibleHeap::new(
                DescriptorHeapKind::Sampler,
                backend.descriptor_increment(DescriptorHeapKind::Sampler),
            ),
            bound: BoundState::default(),
            viewport_dirty: false,
            pending_uploads: HashMap::new(),
            profile_depth: 0,
        };
        command_list.start_heaps()?;
        Ok(command_list)
    }

    pub fn device(&self) -> &Arc<D3d12Device<B>> {
        &self.device
    }

    pub fn is_open(&self) -> bool {
        self.allocator.is_some()
    }

    fn backend(&self) -> &B {
        self.device.backend()
    }

    fn record(&self, command: Command) {
        self.backend().record(self.list, command);
    }

    fn check_open(&self) -> Result<()> {
        if self.allocator.is_none() {
            return Err(GraphicsError::invalid("command list is closed; reset it before recording").into());
        }
        Ok(())
    }

    fn start_heaps(&mut self) -> Result<()> {
        self.srv_heap.start(self.device.get_srv_heap()?);
        self.sampler_heap.start(self.device.get_sampler_heap()?);
        self.bind_heaps();
        Ok(())
    }

    fn bind_heaps(&self) {
        if let (Some(srv), Some(sampler)) = (self.srv_heap.current, self.sampler_heap.current) {
            self.record(Command::SetDescriptorHeaps {
                srv: srv.id,
                sampler: sampler.id,
            });
        }
    }

    // ---- Lifecycle

    /// Reopen a closed list on a fresh allocator and fresh shader-visible
    /// heaps, with nothing bound. Does nothing while the list is open.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.reopen()?;
        self.bound = BoundState::default();
        self.viewport_dirty = false;
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.device.release_temporary_resources();
        let allocator = self.device.get_command_allocator()?;
        if let Err(err) = self.backend().reset_command_list(self.list, allocator) {
            self.device.command_allocators.recycle_object(0, allocator);
            return Err(err);
        }
        self.allocator = Some(allocator);
        self.profile_depth = 0;
        self.start_heaps()
    }

    /// Finish recording. The list needs [`reset`](Self::reset) before it
    /// records again.
    pub fn close(&mut self) -> Result<CompiledCommandList> {
        let allocator = self
            .allocator
            .take()
            .ok_or_else(|| GraphicsError::invalid("command list is already closed"))?;
        if !self.pending_uploads.is_empty() {
            warn!(count = self.pending_uploads.len(), "closing a command list with buffers still mapped");
            self.pending_uploads.clear();
        }
        for _ in 0..mem::take(&mut self.profile_depth) {
            self.record(Command::EndEvent);
        }
        if let Err(err) = self.backend().close_command_list(self.list) {
            self.allocator = Some(allocator);
            return Err(err);
        }
        Ok(CompiledCommandList {
            list: self.list,
            allocator,
            srv_heaps: self.srv_heap.finish(),
            sampler_heaps: self.sampler_heap.finish(),
        })
    }

    /// Submit everything recorded so far and keep recording with the same
    /// pipeline, targets and buffers bound. Returns the fence value of the
    /// submission.
    pub fn flush(&mut self, wait: bool) -> Result<u64> {
        let compiled = self.close()?;
        let value = self.device.execute_command_list(compiled)?;
        if wait {
            self.device.wait_for_fence(value)?;
        }
        self.reopen()?;
        self.restore_state();
        Ok(value)
    }

    fn restore_state(&mut self) {
        let bound = &self.bound;
        if let Some(pipeline) = &bound.pipeline {
            self.record_pipeline(pipeline);
        }
        if !bound.target_views.is_empty() || bound.depth_view.is_some() {
            self.record(Command::SetRenderTargets {
                render_targets: bound.target_views.clone(),
                depth_stencil: bound.depth_view,
            });
        }
        for &(slot, view) in &bound.vertex_buffers {
            self.record(Command::SetVertexBuffer { slot, view });
        }
        if bound.index_buffer.is_some() {
            self.record(Command::SetIndexBuffer(bound.index_buffer));
        }
        if bound.stencil_reference != 0 {
            self.record(Command::SetStencilReference(bound.stencil_reference));
        }
        if let Some(factor) = bound.blend_factor {
            self.record(Command::SetBlendFactor(factor));
        }
        self.viewport_dirty = bound.viewport.is_some();
    }

    fn record_pipeline(&self, pipeline: &D3d12PipelineState) {
        if let Some(native) = pipeline.native() {
            self.record(Command::SetPipelineState(native));
        }
        self.record(Command::SetPrimitiveTopology(pipeline.primitive_type()));
    }

    // ---- Pipeline and descriptors

    pub fn set_pipeline_state(&mut self, pipeline: D3d12PipelineState) -> Result<()> {
        self.check_open()?;
        if self.bound.pipeline.as_ref() != Some(&pipeline) {
            self.record_pipeline(&pipeline);
            self.bound.pipeline = Some(pipeline);
        }
        Ok(())
    }

    /// Bind descriptor sets to the pipeline's root tables, in set order.
    ///
    /// Each set is copied into the list's shader-visible heap the first
    /// time its start address is seen. When a heap runs out it is replaced
    /// by a fresh one and every set is copied again; a set that cannot fit
    /// even then fails with [`GraphicsError::DescriptorSetTooLarge`].
    pub fn set_descriptor_sets(&mut self, sets: &[DescriptorSet]) -> Result<()> {
        self.check_open()?;
        let pipeline = self
            .bound
            .pipeline
            .clone()
            .ok_or_else(|| GraphicsError::invalid("descriptor sets bound without a pipeline state"))?;

        let mut rotated_srv = false;
        let mut rotated_sampler = false;
        let tables = loop {
            let (kind, requested) = match self.copy_descriptor_sets(&pipeline, sets)? {
                SetCopy::Done(tables) => break tables,
                SetCopy::HeapFull { kind, requested } => (kind, requested),
            };
            let is_sampler = kind == DescriptorHeapKind::Sampler;
            let (capacity, rotated) = if is_sampler {
                (self.sampler_heap.capacity(), &mut rotated_sampler)
            } else {
                (self.srv_heap.capacity(), &mut rotated_srv)
            };
            if *rotated || requested > capacity {
                let requested = if *rotated {
                    (0..sets.len())
                        .map(|i| if is_sampler { pipeline.sampler_bind_count(i) } else { pipeline.srv_bind_count(i) })
                        .sum()
                } else {
                    requested
                };
                return Err(GraphicsError::DescriptorSetTooLarge { requested, capacity }.into());
            }
            *rotated = true;
            debug!(?kind, capacity, "shader-visible descriptor heap full, switching to a new heap");
            if is_sampler {
                let heap = self.device.get_sampler_heap()?;
                self.sampler_heap.start(heap);
            } else {
                let heap = self.device.get_srv_heap()?;
                self.srv_heap.start(heap);
            }
            self.bind_heaps();
        };

        for table in tables {
            self.record(table);
        }
        Ok(())
    }

    fn copy_descriptor_sets(&mut self, pipeline: &D3d12PipelineState, sets: &[DescriptorSet]) -> Result<SetCopy> {
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let mut tables = Vec::new();
        let mut parameter = 0;
        for (index, set) in sets.iter().enumerate() {
            if !set.is_valid() {
                return Err(GraphicsError::invalid(format!("descriptor set {index} was not allocated")).into());
            }
            let srv_count = pipeline.srv_bind_count(index);
            if srv_count > 0 {
                let Some(table) = self.srv_heap.copy(backend, set.srv_start(), srv_count) else {
                    return Ok(SetCopy::HeapFull {
                        kind: DescriptorHeapKind::CbvSrvUav,
                        requested: srv_count,
                    });
                };
                tables.push(Command::SetGraphicsRootDescriptorTable { parameter, table });
                parameter += 1;
            }
            let sampler_count = pipeline.sampler_bind_count(index);
            if sampler_count > 0 {
                let Some(table) = self.sampler_heap.copy(backend, set.sampler_start(), sampler_count) else {
                    return Ok(SetCopy::HeapFull {
                        kind: DescriptorHeapKind::Sampler,
                        requested: sampler_count,
                    });
                };
                tables.push(Command::SetGraphicsRootDescriptorTable { parameter, table });
                parameter += 1;
            }
        }
        Ok(SetCopy::Done(tables))
    }

    // ---- Targets

    /// Bind `render_targets` (slot i ← entry i) and `depth_stencil`,
    /// transitioning them for output. All must have the same size; the
    /// viewport is reset to cover them.
    pub fn set_render_targets(
        &mut self,
        depth_stencil: Option<Handle<D3d12Texture>>,
        render_targets: &[Option<Handle<D3d12Texture>>],
    ) -> Result<()> {
        self.check_open()?;
        let max = self.device.config().max_bound_render_targets;
        if render_targets.len() > max {
            return Err(GraphicsError::invalid(format!(
                "{} render targets bound, at most {max} supported",
                render_targets.len()
            ))
            .into());
        }

        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let mut textures = device.textures.write();

        let mut size = None;
        let mut target_views = Vec::with_capacity(render_targets.len());
        for target in render_targets {
            let Some(handle) = *target else {
                target_views.push(CpuDescriptor::default());
                continue;
            };
            let texture = textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
            let target_size = (texture.width(), texture.height());
            match size {
                None => size = Some(target_size),
                Some(first) if first != target_size => {
                    return Err(GraphicsError::invalid("render targets do not have the same size").into());
                }
                Some(_) => {}
            }
            let view = texture
                .render_target_view()
                .ok_or_else(|| GraphicsError::invalid("texture is not a render target"))?;
            transition_texture(backend, self.list, &mut textures, handle, ResourceStates::RENDER_TARGET)?;
            target_views.push(view);
        }

        let depth_view = match depth_stencil {
            Some(handle) => {
                let texture = textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
                let depth_size = (texture.width(), texture.height());
                match size {
                    Some(first) if first != depth_size => {
                        return Err(GraphicsError::invalid("depth buffer is not the same size as the render target").into());
                    }
                    None => size = Some(depth_size),
                    Some(_) => {}
                }
                let view = texture
                    .depth_stencil_view()
                    .ok_or_else(|| GraphicsError::invalid("texture is not a depth-stencil buffer"))?;
                let state = if texture.description().flags.contains(TextureFlags::DEPTH_STENCIL_READ_ONLY) {
                    ResourceStates::DEPTH_READ
                } else {
                    ResourceStates::DEPTH_WRITE
                };
                transition_texture(backend, self.list, &mut textures, handle, state)?;
                Some(view)
            }
            None => None,
        };
        drop(textures);

        self.record(Command::SetRenderTargets {
            render_targets: target_views.clone(),
            depth_stencil: depth_view,
        });
        self.bound.render_targets = render_targets.to_vec();
        self.bound.depth_stencil = depth_stencil;
        self.bound.target_views = target_views;
        self.bound.depth_view = depth_view;

        if let Some((width, height)) = size {
            self.set_viewport(Viewport::new(0.0, 0.0, width as f32, height as f32));
        }
        Ok(())
    }

    pub fn set_render_target(
        &mut self,
        depth_stencil: Option<Handle<D3d12Texture>>,
        render_target: Option<Handle<D3d12Texture>>,
    ) -> Result<()> {
        self.set_render_targets(depth_stencil, &[render_target])
    }

    pub fn reset_targets(&mut self) -> Result<()> {
        self.check_open()?;
        self.bound.render_targets.clear();
        self.bound.depth_stencil = None;
        self.bound.target_views.clear();
        self.bound.depth_view = None;
        self.record(Command::SetRenderTargets {
            render_targets: Vec::new(),
            depth_stencil: None,
        });
        Ok(())
    }

    /// Currently bound color targets.
    pub fn render_targets(&self) -> &[Option<Handle<D3d12Texture>>] {
        &self.bound.render_targets
    }

    pub fn depth_stencil(&self) -> Option<Handle<D3d12Texture>> {
        self.bound.depth_stencil
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.bound.viewport = Some(viewport);
        self.viewport_dirty = true;
    }

    /// Only the first viewport is used.
    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        if let Some(first) = viewports.first() {
            self.set_viewport(*first);
        }
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.bound.viewport
    }

    /// An empty slice makes the scissor follow the viewport.
    pub fn set_scissor_rectangles(&mut self, rectangles: &[Rectangle]) -> Result<()> {
        match rectangles {
            [] => self.bound.scissor = None,
            [rect] => self.bound.scissor = Some(*rect),
            _ => return Err(GraphicsError::unsupported("multiple scissor rectangles").into()),
        }
        self.viewport_dirty = true;
        Ok(())
    }

    // ---- Input assembly and fixed-function values

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: Handle<D3d12Buffer>, offset: u64, stride: u32) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let mut buffers = device.buffers.write();
        let size = buffers.get(buffer).ok_or(GraphicsError::StaleHandle("buffer"))?.size();
        if offset > size {
            return Err(GraphicsError::invalid(format!("vertex buffer offset {offset} past its {size} bytes")).into());
        }
        let (resource, _) = transition_buffer(
            device.backend().as_ref(),
            self.list,
            &mut buffers,
            buffer,
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
        )?;
        let view = VertexBufferView {
            resource,
            offset,
            size: (size - offset) as u32,
            stride,
        };
        self.record(Command::SetVertexBuffer { slot, view });
        self.bound.vertex_buffers.retain(|&(bound_slot, _)| bound_slot != slot);
        self.bound.vertex_buffers.push((slot, view));
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: Option<Handle<D3d12Buffer>>, offset: u64, is_32bit: bool) -> Result<()> {
        self.check_open()?;
        let view = match buffer {
            Some(handle) => {
                let device = Arc::clone(&self.device);
                let mut buffers = device.buffers.write();
                let size = buffers.get(handle).ok_or(GraphicsError::StaleHandle("buffer"))?.size();
                if offset > size {
                    return Err(GraphicsError::invalid(format!("index buffer offset {offset} past its {size} bytes")).into());
                }
                let (resource, _) = transition_buffer(
                    device.backend().as_ref(),
                    self.list,
                    &mut buffers,
                    handle,
                    ResourceStates::INDEX_BUFFER,
                )?;
                Some(IndexBufferView {
                    resource,
                    offset,
                    size: (size - offset) as u32,
                    is_32bit,
                })
            }
            None => None,
        };
        self.record(Command::SetIndexBuffer(view));
        self.bound.index_buffer = view;
        Ok(())
    }

    pub fn set_stencil_reference(&mut self, reference: i32) -> Result<()> {
        self.check_open()?;
        self.bound.stencil_reference = reference as u32;
        self.record(Command::SetStencilReference(reference as u32));
        Ok(())
    }

    pub fn set_blend_factor(&mut self, factor: Color4) -> Result<()> {
        self.check_open()?;
        self.bound.blend_factor = Some(factor.to_array());
        self.record(Command::SetBlendFactor(factor.to_array()));
        Ok(())
    }

    /// Transition a resource explicitly, for example a render target about
    /// to be sampled.
    pub fn resource_barrier_transition(&mut self, resource: impl Into<D3d12Resource>, state: ResourceStates) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        match resource.into() {
            D3d12Resource::Texture(handle) => {
                transition_texture(backend, self.list, &mut device.textures.write(), handle, state)?;
            }
            D3d12Resource::Buffer(handle) => {
                transition_buffer(backend, self.list, &mut device.buffers.write(), handle, state)?;
            }
        }
        Ok(())
    }

    // ---- Clears

    pub fn clear_depth_stencil(
        &mut self,
        depth_stencil: Handle<D3d12Texture>,
        options: DepthStencilClearOptions,
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let mut textures = device.textures.write();
        let view = textures
            .get(depth_stencil)
            .ok_or(GraphicsError::StaleHandle("texture"))?
            .depth_stencil_view()
            .ok_or_else(|| GraphicsError::invalid("texture is not a depth-stencil buffer"))?;
        transition_texture(device.backend().as_ref(), self.list, &mut textures, depth_stencil, ResourceStates::DEPTH_WRITE)?;
        self.record(Command::ClearDepthStencilView {
            view,
            options,
            depth,
            stencil,
        });
        Ok(())
    }

    pub fn clear_render_target(&mut self, render_target: Handle<D3d12Texture>, color: Color4) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let mut textures = device.textures.write();
        let view = textures
            .get(render_target)
            .ok_or(GraphicsError::StaleHandle("texture"))?
            .render_target_view()
            .ok_or_else(|| GraphicsError::invalid("texture is not a render target"))?;
        transition_texture(device.backend().as_ref(), self.list, &mut textures, render_target, ResourceStates::RENDER_TARGET)?;
        self.record(Command::ClearRenderTargetView {
            view,
            color: color.to_array(),
        });
        Ok(())
    }

    pub fn clear_read_write(&mut self, _resource: impl Into<D3d12Resource>, _value: [f32; 4]) -> Result<()> {
        Err(GraphicsError::unsupported("clearing unordered access views").into())
    }

    // ---- Draws

    fn pre_draw(&mut self) -> Result<D3d12PipelineState> {
        self.check_open()?;
        let pipeline = self
            .bound
            .pipeline
            .clone()
            .ok_or_else(|| GraphicsError::invalid("draw without a pipeline state"))?;
        if self.viewport_dirty {
            if let Some(viewport) = self.bound.viewport {
                self.record(Command::SetViewport(viewport));
                let scissor = self.bound.scissor.unwrap_or(Rectangle::new(
                    viewport.x as i32,
                    viewport.y as i32,
                    viewport.width as i32,
                    viewport.height as i32,
                ));
                self.record(Command::SetScissor(scissor));
            }
            self.viewport_dirty = false;
        }
        Ok(pipeline)
    }

    fn record_draw(&self, pipeline: &D3d12PipelineState, vertex_count: u32, instance_count: u32) {
        let primitives = pipeline.primitive_type().primitive_count(vertex_count) * instance_count.max(1);
        self.device.record_draw(primitives);
    }

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> Result<()> {
        self.draw_instanced(vertex_count, 1, start_vertex, 0)
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) -> Result<()> {
        self.draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0)
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count_per_instance: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        let pipeline = self.pre_draw()?;
        self.record(Command::DrawInstanced {
            vertex_count: vertex_count_per_instance,
            instance_count,
            start_vertex,
            start_instance,
        });
        self.record_draw(&pipeline, vertex_count_per_instance, instance_count);
        Ok(())
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<()> {
        let pipeline = self.pre_draw()?;
        if self.bound.index_buffer.is_none() {
            return Err(GraphicsError::invalid("indexed draw without an index buffer").into());
        }
        self.record(Command::DrawIndexedInstanced {
            index_count: index_count_per_instance,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
        self.record_draw(&pipeline, index_count_per_instance, instance_count);
        Ok(())
    }

    pub fn draw_instanced_indirect(&mut self, _arguments: Handle<D3d12Buffer>, _offset: usize) -> Result<()> {
        Err(GraphicsError::unsupported("indirect draws without command signatures").into())
    }

    pub fn draw_indexed_instanced_indirect(&mut self, _arguments: Handle<D3d12Buffer>, _offset: usize) -> Result<()> {
        Err(GraphicsError::unsupported("indirect draws without command signatures").into())
    }

    pub fn draw_auto(&mut self) -> Result<()> {
        Err(GraphicsError::unsupported("draw auto on D3D12").into())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.check_open()?;
        if self.bound.pipeline.is_none() {
            return Err(GraphicsError::invalid("dispatch without a pipeline state").into());
        }
        self.record(Command::Dispatch { x, y, z });
        Ok(())
    }

    pub fn dispatch_indirect(&mut self, _arguments: Handle<D3d12Buffer>, _offset: usize) -> Result<()> {
        Err(GraphicsError::unsupported("indirect dispatch without command signatures").into())
    }

    // ---- Profiling

    pub fn begin_profile(&mut self, name: &str) {
        if self.device.config().profile_markers && self.is_open() {
            self.record(Command::BeginEvent(name.to_owned()));
            self.profile_depth += 1;
        }
    }

    pub fn end_profile(&mut self) {
        if self.profile_depth > 0 && self.is_open() {
            self.record(Command::EndEvent);
            self.profile_depth -= 1;
        }
    }

    // ---- Mapping

    /// Map a buffer range or one subresource of a staging texture.
    ///
    /// `WriteDiscard` and `WriteNoOverwrite` on a buffer hand out upload
    /// memory that is copied into the buffer by
    /// [`unmap_subresource`](Self::unmap_subresource). Other modes need a
    /// staging resource and block until the copy that filled it completed,
    /// submitting this list first if the copy was recorded here. With
    /// `do_not_wait` an unfinished copy yields an empty mapping instead.
    pub fn map_subresource(
        &mut self,
        resource: impl Into<D3d12Resource>,
        subresource: u32,
        mode: MapMode,
        do_not_wait: bool,
        offset: usize,
        length: usize,
    ) -> Result<MappedResource> {
        match resource.into() {
            D3d12Resource::Buffer(handle) => self.map_buffer(handle, subresource, mode, do_not_wait, offset, length),
            D3d12Resource::Texture(handle) => self.map_texture(handle, subresource, mode, do_not_wait),
        }
    }

    fn map_buffer(
        &mut self,
        handle: Handle<D3d12Buffer>,
        subresource: u32,
        mode: MapMode,
        do_not_wait: bool,
        offset: usize,
        length: usize,
    ) -> Result<MappedResource> {
        let (native, size, staging, fence_value) = {
            let buffer = self.device.buffer(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
            let native = buffer.native_resource().ok_or(GraphicsError::StaleHandle("buffer"))?;
            (native, buffer.size() as usize, buffer.is_staging(), buffer.staging_fence_value)
        };
        let length = if length == 0 { size.saturating_sub(offset) } else { length };
        if offset + length > size {
            return Err(GraphicsError::invalid("map range past the end of the buffer").into());
        }

        if matches!(mode, MapMode::WriteDiscard | MapMode::WriteNoOverwrite) {
            if staging {
                return Err(GraphicsError::invalid(format!("staging buffers cannot be mapped with {mode:?}")).into());
            }
            self.check_open()?;
            let allocation = self.device.allocate_upload(length as u64, 16)?;
            self.pending_uploads.insert(
                handle,
                PendingUpload {
                    destination_offset: offset as u64,
                    source: allocation.resource,
                    source_offset: allocation.offset,
                    size: length as u64,
                },
            );
            return Ok(MappedResource {
                subresource,
                data: DataBox {
                    data_pointer: allocation.data,
                    row_pitch: length as u32,
                    slice_pitch: length as u32,
                },
                offset: offset as u64,
                size: length as u64,
            });
        }

        if !staging {
            return Err(GraphicsError::invalid(format!("only staging buffers can be mapped with {mode:?}")).into());
        }
        if !self.wait_for_copy(fence_value, do_not_wait)? {
            return Ok(MappedResource::empty(subresource));
        }
        let base = self.backend().map(native)?;
        Ok(MappedResource {
            subresource,
            data: DataBox {
                // SAFETY: offset + length was checked against the buffer size.
                data_pointer: unsafe { base.add(offset) },
                row_pitch: length as u32,
                slice_pitch: length as u32,
            },
            offset: offset as u64,
            size: length as u64,
        })
    }

    fn map_texture(
        &mut self,
        handle: Handle<D3d12Texture>,
        subresource: u32,
        mode: MapMode,
        do_not_wait: bool,
    ) -> Result<MappedResource> {
        let (native, footprint, fence_value) = {
            let texture = self.device.texture(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
            if !texture.is_staging() {
                return Err(match mode {
                    MapMode::WriteDiscard | MapMode::WriteNoOverwrite => {
                        GraphicsError::unsupported(format!("mapping textures with {mode:?}"))
                    }
                    _ => GraphicsError::invalid("only staging textures can be mapped"),
                }
                .into());
            }
            let footprint = texture
                .footprint(subresource)
                .ok_or_else(|| GraphicsError::invalid(format!("subresource {subresource} out of range")))?;
            let native = texture.native_resource().ok_or(GraphicsError::StaleHandle("texture"))?;
            (native, footprint, texture.staging_fence_value)
        };
        if !self.wait_for_copy(fence_value, do_not_wait)? {
            return Ok(MappedResource::empty(subresource));
        }

        let (row_bytes, slice_bytes) = compute_pitch(footprint.format, footprint.width, footprint.height);
        let slice_pitch = footprint.row_pitch * (slice_bytes / row_bytes.max(1));
        let base = self.backend().map(native)?;
        Ok(MappedResource {
            subresource,
            data: DataBox {
                // SAFETY: footprints lie inside the readback buffer.
                data_pointer: unsafe { base.add(footprint.offset as usize) },
                row_pitch: footprint.row_pitch,
                slice_pitch,
            },
            offset: footprint.offset,
            size: u64::from(slice_pitch) * u64::from(footprint.depth),
        })
    }

    /// Whether the copy signaled at `fence_value` is done, waiting for it
    /// unless `do_not_wait`.
    fn wait_for_copy(&mut self, fence_value: u64, do_not_wait: bool) -> Result<bool> {
        if self.device.is_fence_complete(fence_value) {
            return Ok(true);
        }
        if do_not_wait {
            trace!(fence_value, "readback not ready");
            return Ok(false);
        }
        let fence_value = if fence_value >= self.device.next_fence_value() && self.is_open() {
            // The copy is still in this list.
            self.flush(false)?
        } else {
            fence_value
        };
        self.device.wait_for_fence(fence_value)?;
        Ok(true)
    }

    /// Release a mapping. Buffer writes through upload memory are copied
    /// into the buffer here.
    pub fn unmap_subresource(&mut self, resource: impl Into<D3d12Resource>, mapped: &MappedResource) -> Result<()> {
        if mapped.is_empty() {
            return Ok(());
        }
        match resource.into() {
            D3d12Resource::Buffer(handle) => match self.pending_uploads.remove(&handle) {
                Some(upload) => self.copy_upload_to_buffer(
                    handle,
                    upload.destination_offset,
                    upload.source,
                    upload.source_offset,
                    upload.size,
                ),
                None => {
                    let native = self
                        .device
                        .buffer(handle)
                        .ok_or(GraphicsError::StaleHandle("buffer"))?
                        .native_resource()
                        .ok_or(GraphicsError::StaleHandle("buffer"))?;
                    self.backend().unmap(native);
                    Ok(())
                }
            },
            D3d12Resource::Texture(handle) => {
                let native = self
                    .device
                    .texture(handle)
                    .ok_or(GraphicsError::StaleHandle("texture"))?
                    .native_resource()
                    .ok_or(GraphicsError::StaleHandle("texture"))?;
                self.backend().unmap(native);
                Ok(())
            }
        }
    }

    // ---- Updates

    /// Replace a whole buffer or one texture subresource from tightly
    /// packed `data`.
    pub fn update_subresource(&mut self, resource: impl Into<D3d12Resource>, subresource: u32, data: &[u8]) -> Result<()> {
        match resource.into() {
            D3d12Resource::Buffer(handle) => self.update_buffer(handle, 0, data),
            D3d12Resource::Texture(handle) => self.update_texture(handle, subresource, None, data, None),
        }
    }

    /// Update `region` of a buffer (bytes `left..right`) or of a texture
    /// subresource whose rows are `row_pitch` bytes apart in `data`.
    pub fn update_subresource_region(
        &mut self,
        resource: impl Into<D3d12Resource>,
        subresource: u32,
        region: ResourceRegion,
        data: &[u8],
        row_pitch: u32,
    ) -> Result<()> {
        match resource.into() {
            D3d12Resource::Buffer(handle) => {
                let length = (region.width() as usize).min(data.len());
                self.update_buffer(handle, u64::from(region.left), &data[..length])
            }
            D3d12Resource::Texture(handle) => self.update_texture(handle, subresource, Some(region), data, Some(row_pitch)),
        }
    }

    fn update_buffer(&mut self, handle: Handle<D3d12Buffer>, offset: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let size = self.device.buffer(handle).ok_or(GraphicsError::StaleHandle("buffer"))?.size();
        if offset > size {
            return Err(GraphicsError::invalid(format!("update at {offset} past the end of a {size}-byte buffer")).into());
        }
        let length = (data.len() as u64).min(size - offset);
        if length == 0 {
            return Ok(());
        }
        let allocation = self.device.allocate_upload(length, 16)?;
        // SAFETY: the allocation holds `length` bytes and `data` at least as many.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), allocation.data, length as usize) };
        self.copy_upload_to_buffer(handle, offset, allocation.resource, allocation.offset, length)
    }

    fn copy_upload_to_buffer(
        &mut self,
        handle: Handle<D3d12Buffer>,
        destination_offset: u64,
        source: NativeResource,
        source_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let mut buffers = device.buffers.write();
        let (destination, before) = transition_buffer(backend, self.list, &mut buffers, handle, ResourceStates::COPY_DEST)?;
        self.record(Command::CopyBufferRegion {
            destination,
            destination_offset,
            source,
            source_offset,
            size,
        });
        transition_buffer(backend, self.list, &mut buffers, handle, before)?;
        Ok(())
    }

    fn update_texture(
        &mut self,
        handle: Handle<D3d12Texture>,
        subresource: u32,
        region: Option<ResourceRegion>,
        data: &[u8],
        source_pitch: Option<u32>,
    ) -> Result<()> {
        self.check_open()?;
        let desc = *self.device.texture(handle).ok_or(GraphicsError::StaleHandle("texture"))?.description();
        if desc.usage == GraphicsResourceUsage::Staging {
            return Err(GraphicsError::invalid("staging textures are written through map_subresource").into());
        }
        if subresource >= desc.subresource_count() {
            return Err(GraphicsError::invalid(format!("subresource {subresource} out of range")).into());
        }
        let mip = subresource % desc.mip_levels;
        let (x, y, z, width, height, depth) = match region {
            Some(r) => (r.left, r.top, r.front, r.width(), r.height(), r.depth()),
            None => (0, 0, 0, desc.mip_width(mip), desc.mip_height(mip), desc.mip_depth(mip)),
        };
        if width == 0 || height == 0 || depth == 0 {
            return Ok(());
        }

        let (row_bytes, slice_bytes) = compute_pitch(desc.format, width, height);
        let rows = slice_bytes / row_bytes.max(1) * depth;
        let device = Arc::clone(&self.device);
        let source = device.write_upload_rows(
            data,
            source_pitch.unwrap_or(row_bytes),
            row_bytes,
            rows,
            |offset, row_pitch| PlacedFootprint {
                offset,
                format: desc.format,
                width,
                height,
                depth,
                row_pitch,
            },
        )?;

        let backend = device.backend().as_ref();
        let mut textures = device.textures.write();
        let (native, before) = transition_texture(backend, self.list, &mut textures, handle, ResourceStates::COPY_DEST)?;
        self.record(Command::CopyTextureRegion {
            destination: CopyLocation::Subresource {
                resource: native,
                index: subresource,
            },
            x,
            y,
            z,
            source,
            region: None,
        });
        transition_texture(backend, self.list, &mut textures, handle, before)?;
        Ok(())
    }

    // ---- Copies

    /// Copy all of `source` into `destination`.
    ///
    /// A staging destination receives every subresource laid out for
    /// mapping and remembers the fence value this list will signal.
    pub fn copy(&mut self, source: impl Into<D3d12Resource>, destination: impl Into<D3d12Resource>) -> Result<()> {
        self.check_open()?;
        match (source.into(), destination.into()) {
            (D3d12Resource::Texture(source), D3d12Resource::Texture(destination)) => self.copy_texture(source, destination),
            (D3d12Resource::Buffer(source), D3d12Resource::Buffer(destination)) => self.copy_buffer(source, destination),
            _ => Err(GraphicsError::invalid("copy between a texture and a buffer").into()),
        }
    }

    fn copy_texture(&mut self, source: Handle<D3d12Texture>, destination: Handle<D3d12Texture>) -> Result<()> {
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let next_fence_value = device.next_fence_value();
        let mut textures = device.textures.write();

        let src = textures.get(source).ok_or(GraphicsError::StaleHandle("texture"))?;
        let dst = textures.get(destination).ok_or(GraphicsError::StaleHandle("texture"))?;
        let subresources = src.description().subresource_count();
        if dst.description().subresource_count() != subresources {
            return Err(GraphicsError::invalid("copy between textures with different subresource layouts").into());
        }
        if src.native_resource() == dst.native_resource() {
            return Err(GraphicsError::invalid("copy of a texture onto itself").into());
        }
        let (src_staging, dst_staging) = (src.is_staging(), dst.is_staging());
        let staging_layout = |texture: &D3d12Texture| {
            (0..subresources)
                .map(|sub| texture.footprint(sub))
                .collect::<Option<Vec<_>>>()
                .ok_or(GraphicsError::invalid("staging texture layout does not match the copy"))
        };

        match (src_staging, dst_staging) {
            (true, true) => Err(GraphicsError::unsupported("copies between two staging textures").into()),
            (false, true) => {
                let footprints = staging_layout(dst)?;
                let dst_native = dst.native_resource().ok_or(GraphicsError::StaleHandle("texture"))?;
                let (src_native, before) =
                    transition_texture(backend, self.list, &mut textures, source, ResourceStates::COPY_SOURCE)?;
                for (index, footprint) in footprints.into_iter().enumerate() {
                    self.record(Command::CopyTextureRegion {
                        destination: CopyLocation::Footprint {
                            resource: dst_native,
                            footprint,
                        },
                        x: 0,
                        y: 0,
                        z: 0,
                        source: CopyLocation::Subresource {
                            resource: src_native,
                            index: index as u32,
                        },
                        region: None,
                    });
                }
                transition_texture(backend, self.list, &mut textures, source, before)?;
                if let Some(dst) = textures.get_mut(destination) {
                    dst.staging_fence_value = next_fence_value;
                }
                trace!(fence_value = next_fence_value, "copy to staging texture recorded");
                Ok(())
            }
            (true, false) => {
                let footprints = staging_layout(src)?;
                let src_native = src.native_resource().ok_or(GraphicsError::StaleHandle("texture"))?;
                let (dst_native, before) =
                    transition_texture(backend, self.list, &mut textures, destination, ResourceStates::COPY_DEST)?;
                for (index, footprint) in footprints.into_iter().enumerate() {
                    self.record(Command::CopyTextureRegion {
                        destination: CopyLocation::Subresource {
                            resource: dst_native,
                            index: index as u32,
                        },
                        x: 0,
                        y: 0,
                        z: 0,
                        source: CopyLocation::Footprint {
                            resource: src_native,
                            footprint,
                        },
                        region: None,
                    });
                }
                transition_texture(backend, self.list, &mut textures, destination, before)?;
                Ok(())
            }
            (false, false) => {
                let (src_native, src_before) =
                    transition_texture(backend, self.list, &mut textures, source, ResourceStates::COPY_SOURCE)?;
                let (dst_native, dst_before) =
                    transition_texture(backend, self.list, &mut textures, destination, ResourceStates::COPY_DEST)?;
                self.record(Command::CopyResource {
                    destination: dst_native,
                    source: src_native,
                });
                transition_texture(backend, self.list, &mut textures, source, src_before)?;
                transition_texture(backend, self.list, &mut textures, destination, dst_before)?;
                Ok(())
            }
        }
    }

    fn copy_buffer(&mut self, source: Handle<D3d12Buffer>, destination: Handle<D3d12Buffer>) -> Result<()> {
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let next_fence_value = device.next_fence_value();
        let mut buffers = device.buffers.write();
        {
            let src = buffers.get(source).ok_or(GraphicsError::StaleHandle("buffer"))?;
            let dst = buffers.get(destination).ok_or(GraphicsError::StaleHandle("buffer"))?;
            if src.is_staging() {
                return Err(GraphicsError::unsupported("copies out of staging buffers").into());
            }
            if src.size() != dst.size() {
                return Err(GraphicsError::invalid(format!("copy of {} bytes into {} bytes", src.size(), dst.size())).into());
            }
        }
        let (src_native, src_before) = transition_buffer(backend, self.list, &mut buffers, source, ResourceStates::COPY_SOURCE)?;
        let (dst_native, dst_before) = transition_buffer(backend, self.list, &mut buffers, destination, ResourceStates::COPY_DEST)?;
        self.record(Command::CopyResource {
            destination: dst_native,
            source: src_native,
        });
        transition_buffer(backend, self.list, &mut buffers, source, src_before)?;
        transition_buffer(backend, self.list, &mut buffers, destination, dst_before)?;
        if let Some(dst) = buffers.get_mut(destination) {
            if dst.is_staging() {
                dst.staging_fence_value = next_fence_value;
            }
        }
        Ok(())
    }

    /// Copy `source_region` of one subresource (all of it when `None`) to
    /// `offset` in a subresource of `destination`.
    pub fn copy_region(
        &mut self,
        source: Handle<D3d12Texture>,
        source_subresource: u32,
        source_region: Option<ResourceRegion>,
        destination: Handle<D3d12Texture>,
        destination_subresource: u32,
        offset: (u32, u32, u32),
    ) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let mut textures = device.textures.write();
        {
            let src = textures.get(source).ok_or(GraphicsError::StaleHandle("texture"))?;
            let dst = textures.get(destination).ok_or(GraphicsError::StaleHandle("texture"))?;
            if src.is_staging() || dst.is_staging() {
                return Err(GraphicsError::unsupported("region copies of staging textures").into());
            }
            if source_subresource >= src.description().subresource_count()
                || destination_subresource >= dst.description().subresource_count()
            {
                return Err(GraphicsError::invalid("copy subresource out of range").into());
            }
        }
        if source_region.is_some_and(|region| region.is_empty()) {
            return Ok(());
        }

        let (src_native, src_before) = transition_texture(backend, self.list, &mut textures, source, ResourceStates::COPY_SOURCE)?;
        let (dst_native, dst_before) =
            transition_texture(backend, self.list, &mut textures, destination, ResourceStates::COPY_DEST)?;
        self.record(Command::CopyTextureRegion {
            destination: CopyLocation::Subresource {
                resource: dst_native,
                index: destination_subresource,
            },
            x: offset.0,
            y: offset.1,
            z: offset.2,
            source: CopyLocation::Subresource {
                resource: src_native,
                index: source_subresource,
            },
            region: source_region,
        });
        transition_texture(backend, self.list, &mut textures, source, src_before)?;
        transition_texture(backend, self.list, &mut textures, destination, dst_before)?;
        Ok(())
    }

    /// Copy `size` bytes between two non-staging buffers.
    pub fn copy_buffer_region(
        &mut self,
        source: Handle<D3d12Buffer>,
        source_offset: u64,
        destination: Handle<D3d12Buffer>,
        destination_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_open()?;
        let device = Arc::clone(&self.device);
        let backend = device.backend().as_ref();
        let mut buffers = device.buffers.write();
        {
            let src = buffers.get(source).ok_or(GraphicsError::StaleHandle("buffer"))?;
            let dst = buffers.get(destination).ok_or(GraphicsError::StaleHandle("buffer"))?;
            if source_offset + size > src.size() || destination_offset + size > dst.size() {
                return Err(GraphicsError::invalid("buffer copy range out of bounds").into());
            }
        }
        let (src_native, src_before) = transition_buffer(backend, self.list, &mut buffers, source, ResourceStates::COPY_SOURCE)?;
        let (dst_native, dst_before) = transition_buffer(backend, self.list, &mut buffers, destination, ResourceStates::COPY_DEST)?;
        self.record(Command::CopyBufferRegion {
            destination: dst_native,
            destination_offset,
            source: src_native,
            source_offset,
            size,
        });
        transition_buffer(backend, self.list, &mut buffers, source, src_before)?;
        transition_buffer(backend, self.list, &mut buffers, destination, dst_before)?;
        Ok(())
    }

    pub fn copy_multisample(&mut self, _source: Handle<D3d12Texture>, _destination: Handle<D3d12Texture>) -> Result<()> {
        Err(GraphicsError::unsupported("multisample resolve").into())
    }

    pub fn copy_count(&mut self, _source: Handle<D3d12Buffer>, _destination: Handle<D3d12Buffer>, _offset: u32) -> Result<()> {
        Err(GraphicsError::unsupported("structure counters").into())
    }
}

impl<B: D3d12Backend> Drop for CommandList<B> {
    fn drop(&mut self) {
        // Everything this list submitted is covered by the last signaled value.
        let last_submitted = self.device.next_fence_value().saturating_sub(1);
        if let Some(allocator) = self.allocator.take() {
            if let Err(err) = self.device.backend().close_command_list(self.list) {
                warn!(error = %err, "closing a dropped command list failed");
            }
            self.device.command_allocators.recycle_object(last_submitted, allocator);
            for heap in self.srv_heap.finish() {
                self.device.srv_heaps.recycle_object(last_submitted, heap);
            }
            for heap in self.sampler_heap.finish() {
                self.device.sampler_heaps.recycle_object(last_submitted, heap);
            }
        }
        self.device.command_lists.recycle_object(last_submitted, self.list);
    }
}

/// Move the root resource behind `handle` to `after`, recording the
/// barrier. Staging textures stay in `COPY_DEST`. Returns the native
/// resource and its previous state.
fn transition_texture<B: D3d12Backend + ?Sized>(
    backend: &B,
    list: NativeCommandList,
    textures: &mut Arena<D3d12Texture>,
    handle: Handle<D3d12Texture>,
    after: ResourceStates,
) -> Result<(NativeResource, ResourceStates)> {
    let root = textures
        .get(handle)
        .ok_or(GraphicsError::StaleHandle("texture"))?
        .parent()
        .unwrap_or(handle);
    let texture = textures.get_mut(root).ok_or(GraphicsError::StaleHandle("texture"))?;
    let native = texture.native.ok_or(GraphicsError::StaleHandle("texture"))?;
    let before = texture.state;
    if before != after && !texture.is_staging() {
        backend.record(list, barrier(native, before, after));
        texture.state = after;
    }
    Ok((native, before))
}

fn transition_buffer<B: D3d12Backend + ?Sized>(
    backend: &B,
    list: NativeCommandList,
    buffers: &mut Arena<D3d12Buffer>,
    handle: Handle<D3d12Buffer>,
    after: ResourceStates,
) -> Result<(NativeResource, ResourceStates)> {
    let buffer = buffers.get_mut(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
    let native = buffer.native.ok_or(GraphicsError::StaleHandle("buffer"))?;
    let before = buffer.state;
    if before != after && !buffer.is_staging() {
        backend.record(list, barrier(native, before, after));
        buffer.state = after;
    }
    Ok((native, before))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorKind, DescriptorSetLayout};
    use crate::soft::SoftD3d12;
    use gfx_core::{
        graphics_error, BufferDescription, BufferFlags, DeviceConfig, PixelFormat, PrimitiveType, TextureDescription,
    };

    fn device_with(config: DeviceConfig) -> (Arc<SoftD3d12>, Arc<D3d12Device<SoftD3d12>>) {
        let soft = Arc::new(SoftD3d12::new());
        let device = D3d12Device::new(Arc::clone(&soft), config).unwrap();
        (soft, device)
    }

    fn device() -> (Arc<SoftD3d12>, Arc<D3d12Device<SoftD3d12>>) {
        device_with(DeviceConfig::default())
    }

    fn pipeline(layouts: &[Arc<DescriptorSetLayout>]) -> D3d12PipelineState {
        D3d12PipelineState::new(None, PrimitiveType::TriangleList, layouts)
    }

    fn target(device: &D3d12Device<SoftD3d12>, size: u32) -> Handle<D3d12Texture> {
        let desc = TextureDescription::new_2d(size, size, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        device.create_texture(desc, None).unwrap()
    }

    fn staging(device: &D3d12Device<SoftD3d12>, size: u32) -> Handle<D3d12Texture> {
        let desc = TextureDescription::new_2d(size, size, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET).to_staging();
        device.create_texture(desc, None).unwrap()
    }

    fn count(soft: &SoftD3d12, list: NativeCommandList, pred: impl Fn(&Command) -> bool) -> usize {
        soft.recorded_commands(list).iter().filter(|c| pred(c)).count()
    }

    #[test]
    fn descriptor_heap_overflow_rotates_transparently() {
        let (soft, device) = device_with(DeviceConfig::default().with_heap_sizes(4, 4));
        let layout = DescriptorSetLayout::builder().add(DescriptorKind::ShaderResource, 3).build();
        let mut pool = device.create_descriptor_pool(16, 0).unwrap();
        let first = pool.allocate(&layout);
        let second = pool.allocate(&layout);

        let mut list = device.create_command_list().unwrap();
        list.set_pipeline_state(pipeline(&[Arc::clone(&layout)])).unwrap();
        list.set_descriptor_sets(std::slice::from_ref(&first)).unwrap();
        list.set_descriptor_sets(std::slice::from_ref(&first)).unwrap();
        assert_eq!(soft.call_count("copy_descriptors"), 1);

        list.set_descriptor_sets(std::slice::from_ref(&second)).unwrap();
        assert_eq!(soft.call_count("copy_descriptors"), 2);
        assert_eq!(count(&soft, list.list, |c| matches!(c, Command::SetDescriptorHeaps { .. })), 2);
        assert_eq!(
            count(&soft, list.list, |c| matches!(c, Command::SetGraphicsRootDescriptorTable { parameter: 0, .. })),
            3
        );

        let compiled = list.close().unwrap();
        assert_eq!(compiled.srv_heaps.len(), 2);
        assert_eq!(compiled.sampler_heaps.len(), 1);
        device.execute_command_list(compiled).unwrap();
        device.wait_idle().unwrap();
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn oversized_descriptor_sets_fail() {
        let (_soft, device) = device_with(DeviceConfig::default().with_heap_sizes(4, 4));
        let big = DescriptorSetLayout::builder().add(DescriptorKind::ShaderResource, 5).build();
        let mut pool = device.create_descriptor_pool(16, 0).unwrap();
        let set = pool.allocate(&big);

        let mut list = device.create_command_list().unwrap();
        list.set_pipeline_state(pipeline(&[Arc::clone(&big)])).unwrap();
        let err = list.set_descriptor_sets(&[set]).unwrap_err();
        assert!(matches!(
            graphics_error(&err),
            Some(GraphicsError::DescriptorSetTooLarge { requested: 5, capacity: 4 })
        ));
    }

    #[test]
    fn sets_that_never_fit_together_fail_after_one_rotation() {
        let (_soft, device) = device_with(DeviceConfig::default().with_heap_sizes(4, 4));
        let layout = DescriptorSetLayout::builder().add(DescriptorKind::ShaderResource, 3).build();
        let mut pool = device.create_descriptor_pool(16, 0).unwrap();
        let sets = [pool.allocate(&layout), pool.allocate(&layout)];

        let mut list = device.create_command_list().unwrap();
        list.set_pipeline_state(pipeline(&[Arc::clone(&layout), Arc::clone(&layout)])).unwrap();
        let err = list.set_descriptor_sets(&sets).unwrap_err();
        assert!(matches!(
            graphics_error(&err),
            Some(GraphicsError::DescriptorSetTooLarge { requested: 6, capacity: 4 })
        ));
    }

    #[test]
    fn sampler_tables_follow_srv_tables() {
        let (soft, device) = device();
        let layout = DescriptorSetLayout::builder()
            .add(DescriptorKind::ShaderResource, 1)
            .add(DescriptorKind::Sampler, 1)
            .build();
        let mut pool = device.create_descriptor_pool(4, 4).unwrap();
        let set = pool.allocate(&layout);

        let mut list = device.create_command_list().unwrap();
        list.set_pipeline_state(pipeline(&[layout])).unwrap();
        list.set_descriptor_sets(&[set]).unwrap();
        let parameters: Vec<u32> = soft
            .recorded_commands(list.list)
            .iter()
            .filter_map(|c| match c {
                Command::SetGraphicsRootDescriptorTable { parameter, .. } => Some(*parameter),
                _ => None,
            })
            .collect();
        assert_eq!(parameters, vec![0, 1]);
    }

    #[test]
    fn allocators_are_reused_after_their_fence() {
        let (soft, device) = device();
        let mut list = device.create_command_list().unwrap();
        list.flush(false).unwrap();
        // The first submission is still pending.
        assert_eq!(soft.call_count("create_command_allocator"), 2);

        list.flush(true).unwrap();
        assert_eq!(soft.call_count("create_command_allocator"), 2);
        assert_eq!(soft.call_count("reset_command_allocator"), 1);
    }

    #[test]
    fn staging_readback_waits_for_the_copy() {
        let (soft, device) = device();
        let target = target(&device, 4);
        let staging = staging(&device, 4);

        let mut list = device.create_command_list().unwrap();
        list.clear_render_target(target, Color4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        list.copy(target, staging).unwrap();
        let mapped = list.map_subresource(staging, 0, MapMode::Read, false, 0, 0).unwrap();
        assert!(!mapped.is_empty());
        assert_eq!(mapped.data.row_pitch, 256);

        let bytes = unsafe { mapped.as_slice() };
        assert_eq!(&bytes[..4], &[255, 0, 0, 255]);
        assert_eq!(&bytes[3 * 256 + 12..3 * 256 + 16], &[255, 0, 0, 255]);
        list.unmap_subresource(staging, &mapped).unwrap();
        // The copy restored the target's state.
        assert_eq!(device.texture(target).unwrap().state(), ResourceStates::RENDER_TARGET);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn do_not_wait_returns_an_empty_mapping() {
        let (_soft, device) = device();
        let target = target(&device, 4);
        let staging = staging(&device, 4);

        let mut list = device.create_command_list().unwrap();
        list.clear_render_target(target, Color4::WHITE).unwrap();
        list.copy(target, staging).unwrap();
        let value = list.flush(false).unwrap();

        let mapped = list.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
        assert!(mapped.is_empty());
        list.unmap_subresource(staging, &mapped).unwrap();

        device.wait_for_fence(value).unwrap();
        let mapped = list.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
        assert!(!mapped.is_empty());
        assert_eq!(unsafe { &mapped.as_slice()[..4] }, &[255, 255, 255, 255]);
        list.unmap_subresource(staging, &mapped).unwrap();
    }

    #[test]
    fn closed_lists_reject_commands() {
        let (_soft, device) = device();
        let mut list = device.create_command_list().unwrap();
        list.end_profile();
        list.close().unwrap();

        assert!(list.close().is_err());
        let err = list.draw(3, 0).unwrap_err();
        assert!(matches!(graphics_error(&err), Some(GraphicsError::InvalidOperation(_))));

        list.reset().unwrap();
        list.reset().unwrap();
        assert!(list.is_open());
    }

    #[test]
    fn mismatched_target_sizes_are_rejected() {
        let (_soft, device) = device();
        let small = target(&device, 4);
        let large = target(&device, 8);
        let mut list = device.create_command_list().unwrap();
        assert!(list.set_render_targets(None, &[Some(small), Some(large)]).is_err());

        list.set_render_target(None, Some(large)).unwrap();
        assert_eq!(list.viewport(), Some(Viewport::new(0.0, 0.0, 8.0, 8.0)));
    }

    #[test]
    fn draws_record_viewport_and_statistics() {
        let (soft, device) = device();
        let rt = target(&device, 4);
        let mut list = device.create_command_list().unwrap();
        list.set_pipeline_state(pipeline(&[])).unwrap();
        list.set_render_target(None, Some(rt)).unwrap();
        list.draw(6, 0).unwrap();
        list.draw_instanced(3, 4, 0, 0).unwrap();

        let commands = soft.recorded_commands(list.list);
        assert!(commands.contains(&Command::SetViewport(Viewport::new(0.0, 0.0, 4.0, 4.0))));
        assert!(commands.contains(&Command::SetScissor(Rectangle::new(0, 0, 4, 4))));
        let stats = device.frame_stats();
        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.triangle_count, 6);
    }

    #[test]
    fn flush_restores_bindings() {
        let (soft, device) = device();
        let rt = target(&device, 4);
        let mut list = device.create_command_list().unwrap();
        list.set_pipeline_state(pipeline(&[])).unwrap();
        list.set_render_target(None, Some(rt)).unwrap();
        list.flush(true).unwrap();

        let commands = soft.recorded_commands(list.list);
        assert!(commands.contains(&Command::SetPrimitiveTopology(PrimitiveType::TriangleList)));
        assert_eq!(count(&soft, list.list, |c| matches!(c, Command::SetRenderTargets { .. })), 1);
        assert_eq!(list.render_targets(), &[Some(rt)]);
    }

    #[test]
    fn write_discard_reaches_the_buffer_on_unmap() {
        let (soft, device) = device();
        let desc = BufferDescription::new(16, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Dynamic);
        let buffer = device.create_buffer(desc, None).unwrap();
        let native = device.buffer(buffer).unwrap().native_resource().unwrap();

        let mut list = device.create_command_list().unwrap();
        let mapped = list.map_subresource(buffer, 0, MapMode::WriteDiscard, false, 0, 0).unwrap();
        assert_eq!(mapped.size, 16);
        let data: Vec<u8> = (0..16).collect();
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.data.data_pointer, data.len()) };
        list.unmap_subresource(buffer, &mapped).unwrap();
        list.flush(true).unwrap();

        assert_eq!(soft.buffer_data(native).unwrap(), data);
        let err = list.map_subresource(buffer, 0, MapMode::Read, false, 0, 0).unwrap_err();
        assert!(matches!(graphics_error(&err), Some(GraphicsError::InvalidOperation(_))));
    }

    #[test]
    fn region_updates_use_the_source_pitch() {
        let (soft, device) = device();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let texture = device.create_texture(desc, None).unwrap();
        let native = device.texture(texture).unwrap().native_resource().unwrap();

        // Two rows of two pixels, 12 bytes apart.
        let data: Vec<u8> = (1..=20).collect();
        let mut list = device.create_command_list().unwrap();
        list.update_subresource_region(texture, 0, ResourceRegion::new(1, 1, 0, 3, 3, 1), &data, 12)
            .unwrap();
        list.flush(true).unwrap();

        let image = soft.subresource_data(native, 0).unwrap();
        assert_eq!(&image[20..28], &data[0..8]);
        assert_eq!(&image[36..44], &data[12..20]);
        assert_eq!(device.texture(texture).unwrap().state(), ResourceStates::COMMON);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn unsupported_operations_fail() {
        let (_soft, device) = device();
        let rt = target(&device, 4);
        let desc = BufferDescription::new(16, BufferFlags::ARGUMENT_BUFFER, GraphicsResourceUsage::Default);
        let args = device.create_buffer(desc, None).unwrap();
        let mut list = device.create_command_list().unwrap();

        let unsupported = |result: Result<()>| {
            let err = result.unwrap_err();
            matches!(graphics_error(&err), Some(GraphicsError::Unsupported(_)))
        };
        assert!(unsupported(list.draw_auto()));
        assert!(unsupported(list.draw_instanced_indirect(args, 0)));
        assert!(unsupported(list.dispatch_indirect(args, 0)));
        assert!(unsupported(list.clear_read_write(rt, [0.0; 4])));
        assert!(unsupported(list.copy_multisample(rt, rt)));
        assert!(unsupported(list.copy_count(args, args, 0)));
        assert!(unsupported(list.set_scissor_rectangles(&[Rectangle::default(); 2])));
    }
}

//! Command recording for the GL device.
//!
//! GL executes immediately, so a [`GlCommandList`] is a view over the
//! device that records bindings into [`CommandState`] and resolves them
//! against the [`StateTracker`] right before each draw.

use std::sync::Arc;

use anyhow::Result;
use gfx_core::{
    BlendState, Color4, ColorWriteChannels, DataBox, DepthStencilClearOptions, DepthStencilState,
    DeviceConfig, GraphicsError, GraphicsResourceUsage, Handle, MapMode, MappedResource,
    PrimitiveType, RasterizerState, Rectangle, ResourceRegion, SamplerState, Viewport,
};
use gl::types::{GLenum, GLint, GLsizei, GLuint};
use tracing::trace;

use crate::api::{GlApi, PixelData, PixelPack};
use crate::buffer::GlBuffer;
use crate::caps::GlCaps;
use crate::copy::CopyRegion;
use crate::device::{GlDevice, GlResource};
use crate::fbo::FboTexture;
use crate::platform::GlPlatform;
use crate::program::EffectProgram;
use crate::state::{apply_sampler, color_mask};
use crate::texture::GlTexture;
use crate::vao::GlVertexArray;

const MAX_CONSTANT_BUFFERS: usize = 16;
const MAX_SAMPLERS: usize = 16;

/// Fixed-function state plus the program a draw runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct GlPipelineState {
    pub blend_state: BlendState,
    pub depth_stencil_state: DepthStencilState,
    pub rasterizer_state: RasterizerState,
    pub primitive_type: PrimitiveType,
    pub program: Arc<EffectProgram>,
}

impl GlPipelineState {
    pub fn new(program: Arc<EffectProgram>) -> Self {
        Self {
            blend_state: BlendState::DEFAULT,
            depth_stencil_state: DepthStencilState::DEFAULT,
            rasterizer_state: RasterizerState::DEFAULT,
            primitive_type: PrimitiveType::TriangleList,
            program,
        }
    }

    pub fn with_blend_state(mut self, blend_state: BlendState) -> Self {
        self.blend_state = blend_state;
        self
    }

    pub fn with_depth_stencil_state(mut self, depth_stencil_state: DepthStencilState) -> Self {
        self.depth_stencil_state = depth_stencil_state;
        self
    }

    pub fn with_rasterizer_state(mut self, rasterizer_state: RasterizerState) -> Self {
        self.rasterizer_state = rasterizer_state;
        self
    }

    pub fn with_primitive_type(mut self, primitive_type: PrimitiveType) -> Self {
        self.primitive_type = primitive_type;
        self
    }
}

fn primitive_mode(primitive: PrimitiveType) -> GLenum {
    match primitive {
        PrimitiveType::PointList => gl::POINTS,
        PrimitiveType::LineList => gl::LINES,
        PrimitiveType::LineStrip => gl::LINE_STRIP,
        PrimitiveType::TriangleList => gl::TRIANGLES,
        PrimitiveType::TriangleStrip => gl::TRIANGLE_STRIP,
    }
}

/// Bindings recorded between draws. Lives in the device so it survives
/// from one command list borrow to the next.
#[derive(Debug)]
pub(crate) struct CommandState {
    pipeline: Option<Arc<GlPipelineState>>,
    render_targets: Vec<Option<Handle<GlTexture>>>,
    depth_stencil: Option<Handle<GlTexture>>,
    max_render_targets: usize,
    /// Framebuffer resolved for the current targets.
    pub(crate) bound_framebuffer: GLuint,
    pub(crate) framebuffer_dirty: bool,
    pub(crate) viewport: Option<Viewport>,
    scissor: Option<Rectangle>,
    pub(crate) vertex_array: Option<Handle<GlVertexArray>>,
    pub(crate) vertex_array_dirty: bool,
    textures: Vec<Option<Handle<GlTexture>>>,
    samplers: Vec<Option<SamplerState>>,
    constant_buffers: Vec<Option<Handle<GlBuffer>>>,
    stencil_reference: i32,
    blend_factor: Color4,
    profile_depth: usize,
}

impl CommandState {
    pub(crate) fn new(config: &DeviceConfig, default_framebuffer: GLuint, window_size: (u32, u32)) -> Self {
        Self {
            pipeline: None,
            render_targets: Vec::new(),
            depth_stencil: None,
            max_render_targets: config.max_bound_render_targets,
            bound_framebuffer: default_framebuffer,
            framebuffer_dirty: false,
            viewport: Some(Viewport::new(0.0, 0.0, window_size.0 as f32, window_size.1 as f32)),
            scissor: None,
            vertex_array: None,
            vertex_array_dirty: true,
            textures: vec![None; config.max_texture_units],
            samplers: vec![None; MAX_SAMPLERS],
            constant_buffers: vec![None; MAX_CONSTANT_BUFFERS],
            stencil_reference: 0,
            blend_factor: Color4::WHITE,
            profile_depth: 0,
        }
    }

    /// Native objects are gone; resolve everything again on next use.
    pub(crate) fn forget_native(&mut self) {
        self.framebuffer_dirty = true;
        self.vertex_array_dirty = true;
        self.profile_depth = 0;
    }

    /// Drop every binding of a destroyed texture. Bound targets fall back to
    /// the default framebuffer until the next `set_render_targets`.
    pub(crate) fn release_texture(&mut self, released: &[Handle<GlTexture>], default_framebuffer: GLuint) {
        let mut targets_changed = false;
        for slot in self.render_targets.iter_mut().chain(std::iter::once(&mut self.depth_stencil)) {
            if slot.is_some_and(|t| released.contains(&t)) {
                *slot = None;
                targets_changed = true;
            }
        }
        for slot in &mut self.textures {
            if slot.is_some_and(|t| released.contains(&t)) {
                *slot = None;
            }
        }
        if targets_changed {
            self.bound_framebuffer = default_framebuffer;
            self.framebuffer_dirty = true;
        }
    }
}

fn slot<'a, T>(slots: &'a mut [Option<T>], index: u32, what: &str) -> Result<&'a mut Option<T>> {
    let len = slots.len();
    slots
        .get_mut(index as usize)
        .ok_or_else(|| GraphicsError::invalid(format!("{what} slot {index} out of range (max {len})")).into())
}

/// Bytes spanned by `rows` rows of `row_bytes`, `row_pitch` bytes apart.
pub(crate) fn region_byte_len(row_pitch: u32, row_bytes: u32, rows: u32) -> u64 {
    if rows == 0 {
        return 0;
    }
    u64::from(row_pitch) * u64::from(rows - 1) + u64::from(row_bytes)
}

/// `region` lies inside a `width` x `height` image.
fn check_region(region: &ResourceRegion, width: u32, height: u32) -> Result<()> {
    if region.left > region.right || region.top > region.bottom || region.right > width || region.bottom > height {
        return Err(GraphicsError::invalid(format!(
            "region {}..{} x {}..{} outside a {width}x{height} image",
            region.left, region.right, region.top, region.bottom
        ))
        .into());
    }
    Ok(())
}

fn has_draw_indirect(caps: &GlCaps) -> bool {
    if caps.is_es {
        caps.version >= (3, 1)
    } else {
        caps.version >= (4, 0)
    }
}

/// `GL_UNPACK_ALIGNMENT` that makes rows of `row_bytes` bytes land
/// `row_pitch` bytes apart, if any.
pub(crate) fn unpack_alignment(row_pitch: u32, row_bytes: u32) -> Option<GLint> {
    if row_pitch < row_bytes {
        return None;
    }
    [8u32, 4, 2, 1]
        .into_iter()
        .find(|&alignment| row_pitch % alignment == 0 && row_pitch - row_bytes < alignment)
        .map(|alignment| alignment as GLint)
}

/// Records and issues commands on a [`GlDevice`]. Obtained from
/// [`GlDevice::command_list`]; the device context must be active.
pub struct GlCommandList<'a, A: GlApi, P: GlPlatform> {
    device: &'a mut GlDevice<A, P>,
}

impl<'a, A: GlApi, P: GlPlatform> GlCommandList<'a, A, P> {
    pub(crate) fn new(device: &'a mut GlDevice<A, P>) -> Self {
        Self { device }
    }

    pub fn device(&mut self) -> &mut GlDevice<A, P> {
        self.device
    }

    fn attachment(&self, handle: Handle<GlTexture>) -> Result<FboTexture> {
        let texture = self.device.textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
        Ok(FboTexture::resolve(handle, texture))
    }

    fn texture_size(&self, handle: Handle<GlTexture>) -> Result<(u32, u32)> {
        let texture = self.device.textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
        let view = texture.view_description();
        let desc = texture.description();
        Ok((desc.mip_width(view.mip_level), desc.mip_height(view.mip_level)))
    }

    // ---- Targets

    /// Bind `render_targets` (slot i ← entry i) and `depth_stencil`. All
    /// must have the same size; the viewport is reset to cover them.
    pub fn set_render_targets(
        &mut self,
        depth_stencil: Option<Handle<GlTexture>>,
        render_targets: &[Option<Handle<GlTexture>>],
    ) -> Result<()> {
        if render_targets.len() > self.device.commands.max_render_targets {
            return Err(GraphicsError::invalid(format!(
                "{} render targets bound, at most {} supported",
                render_targets.len(),
                self.device.commands.max_render_targets
            ))
            .into());
        }

        let mut size = None;
        for target in render_targets.iter().flatten() {
            let target_size = self.texture_size(*target)?;
            match size {
                None => size = Some(target_size),
                Some(first) if first != target_size => {
                    return Err(GraphicsError::invalid("render targets do not have the same size").into());
                }
                Some(_) => {}
            }
        }
        if let Some(depth) = depth_stencil {
            let depth_size = self.texture_size(depth)?;
            match size {
                Some(first) if first != depth_size => {
                    return Err(GraphicsError::invalid("depth buffer is not the same size as the render target").into());
                }
                None => size = Some(depth_size),
                Some(_) => {}
            }
        }

        let commands = &mut self.device.commands;
        commands.depth_stencil = depth_stencil;
        commands.render_targets.clear();
        commands.render_targets.extend_from_slice(render_targets);
        commands.framebuffer_dirty = true;
        self.setup_targets()?;

        if let Some((width, height)) = size {
            self.set_viewport(Viewport::new(0.0, 0.0, width as f32, height as f32));
        }
        Ok(())
    }

    pub fn set_render_target(
        &mut self,
        depth_stencil: Option<Handle<GlTexture>>,
        render_target: Option<Handle<GlTexture>>,
    ) -> Result<()> {
        self.set_render_targets(depth_stencil, &[render_target])
    }

    /// Unbind every target. The next draw renders to the default
    /// framebuffer.
    pub fn reset_targets(&mut self) {
        let commands = &mut self.device.commands;
        commands.depth_stencil = None;
        commands.render_targets.clear();
        commands.framebuffer_dirty = true;
    }

    fn setup_targets(&mut self) -> Result<()> {
        let depth = match self.device.commands.depth_stencil {
            Some(handle) => Some(self.attachment(handle)?),
            None => None,
        };
        let targets = self
            .device
            .commands
            .render_targets
            .clone()
            .into_iter()
            .map(|target| target.map(|handle| self.attachment(handle)).transpose())
            .collect::<Result<Vec<_>>>()?;

        let d = &mut *self.device;
        let framebuffer = d
            .framebuffers
            .find_or_create(&d.gl, &mut d.state, &d.textures, depth, &targets)?;
        d.state.bind_framebuffer(&d.gl, framebuffer);
        d.commands.bound_framebuffer = framebuffer;
        d.commands.framebuffer_dirty = false;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.device.commands.viewport = Some(viewport);
    }

    /// Only the first viewport is used; GL without viewport arrays has one.
    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        if let Some(first) = viewports.first() {
            self.set_viewport(*first);
        }
    }

    pub fn set_scissor_rectangles(&mut self, rectangles: &[Rectangle]) -> Result<()> {
        match rectangles {
            [] => self.device.commands.scissor = None,
            [rect] => self.device.commands.scissor = Some(*rect),
            _ => return Err(GraphicsError::unsupported("multiple scissor rectangles").into()),
        }
        Ok(())
    }

    // ---- Pipeline inputs

    pub fn set_pipeline_state(&mut self, pipeline: Arc<GlPipelineState>) {
        self.device.commands.pipeline = Some(pipeline);
    }

    pub fn set_vertex_array(&mut self, vertex_array: Option<Handle<GlVertexArray>>) {
        let commands = &mut self.device.commands;
        if commands.vertex_array != vertex_array {
            commands.vertex_array = vertex_array;
            commands.vertex_array_dirty = true;
        }
    }

    pub fn set_shader_resource_view(&mut self, slot_index: u32, texture: Option<Handle<GlTexture>>) -> Result<()> {
        *slot(&mut self.device.commands.textures, slot_index, "texture")? = texture;
        Ok(())
    }

    /// `None` selects [`SamplerState::DEFAULT`].
    pub fn set_sampler_state(&mut self, slot_index: u32, sampler: Option<SamplerState>) -> Result<()> {
        *slot(&mut self.device.commands.samplers, slot_index, "sampler")? = sampler;
        Ok(())
    }

    /// Bind a constant buffer. With uniform buffers it backs the uniform
    /// block at the same index; without, loose uniforms read its CPU copy.
    pub fn set_constant_buffer(&mut self, slot_index: u32, buffer: Option<Handle<GlBuffer>>) -> Result<()> {
        *slot(&mut self.device.commands.constant_buffers, slot_index, "constant buffer")? = buffer;
        let d = &*self.device;
        if !d.gl.caps().has_uniform_buffers {
            return Ok(());
        }
        match buffer {
            Some(handle) => {
                let buffer = d.buffers.get(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
                d.gl.bind_buffer_range(gl::UNIFORM_BUFFER, slot_index, buffer.buffer_id, 0, buffer.size());
            }
            None => d.gl.bind_buffer_range(gl::UNIFORM_BUFFER, slot_index, 0, 0, 0),
        }
        Ok(())
    }

    pub fn set_stencil_reference(&mut self, reference: i32) {
        self.device.commands.stencil_reference = reference;
    }

    pub fn set_blend_factor(&mut self, factor: Color4) {
        self.device.commands.blend_factor = factor;
    }

    /// GL tracks resource states itself.
    pub fn resource_barrier_transition(&mut self, _resource: GlResource) {}

    // ---- Clears

    pub fn clear_depth_stencil(
        &mut self,
        depth_stencil: Handle<GlTexture>,
        options: DepthStencilClearOptions,
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        self.device.ensure_context_active()?;
        self.device.execute_pending_tasks()?;
        let attachment = self.attachment(depth_stencil)?;

        let d = &mut *self.device;
        let framebuffer = d
            .framebuffers
            .find_or_create_for(&d.gl, &mut d.state, &d.textures, attachment)?;
        d.state.bind_framebuffer(&d.gl, framebuffer);

        let mut mask = 0;
        if options.contains(DepthStencilClearOptions::DEPTH_BUFFER) {
            mask |= gl::DEPTH_BUFFER_BIT;
        }
        if options.contains(DepthStencilClearOptions::STENCIL) {
            mask |= gl::STENCIL_BUFFER_BIT;
        }
        d.gl.clear_depth(depth);
        d.gl.clear_stencil(GLint::from(stencil));

        // Clears obey the write masks.
        let current = *d.state.depth_stencil_state();
        let force_depth = !current.depth_buffer_write_enable;
        let force_stencil = current.stencil_write_mask != u8::MAX;
        if force_depth {
            d.gl.depth_mask(true);
        }
        if force_stencil {
            d.gl.stencil_mask_separate(gl::FRONT_AND_BACK, 0xFF);
        }
        d.gl.clear(mask);
        if force_depth {
            d.gl.depth_mask(false);
        }
        if force_stencil {
            d.gl.stencil_mask_separate(gl::FRONT_AND_BACK, GLuint::from(current.stencil_write_mask));
        }

        d.state.bind_framebuffer(&d.gl, d.commands.bound_framebuffer);
        d.gl.check("clear depth stencil")
    }

    pub fn clear_render_target(&mut self, render_target: Handle<GlTexture>, color: Color4) -> Result<()> {
        self.device.ensure_context_active()?;
        let attachment = self.attachment(render_target)?;

        let d = &mut *self.device;
        let framebuffer = d
            .framebuffers
            .find_or_create_for(&d.gl, &mut d.state, &d.textures, attachment)?;
        d.state.bind_framebuffer(&d.gl, framebuffer);

        let channels = d.state.blend_state().render_target.color_write_channels;
        let force_mask = channels != ColorWriteChannels::ALL;
        if force_mask {
            d.gl.color_mask(true, true, true, true);
        }
        d.gl.clear_color(color.to_array());
        d.gl.clear(gl::COLOR_BUFFER_BIT);
        if force_mask {
            let [r, g, b, a] = color_mask(channels);
            d.gl.color_mask(r, g, b, a);
        }

        d.state.bind_framebuffer(&d.gl, d.commands.bound_framebuffer);
        d.gl.check("clear render target")
    }

    pub fn clear_read_write(&mut self, _resource: GlResource, _value: [f32; 4]) -> Result<()> {
        Err(GraphicsError::unsupported("clearing unordered access resources on GL").into())
    }

    // ---- Draws

    /// Resolve recorded bindings into GL state for the next draw.
    fn pre_draw(&mut self) -> Result<Arc<GlPipelineState>> {
        self.device.execute_pending_tasks()?;
        self.device.ensure_context_active()?;
        let pipeline = self
            .device
            .commands
            .pipeline
            .clone()
            .ok_or_else(|| GraphicsError::invalid("draw without a pipeline state"))?;
        if self.device.commands.framebuffer_dirty {
            self.setup_targets()?;
        }

        let d = &mut *self.device;
        let program = &pipeline.program;
        d.state.bind_framebuffer(&d.gl, d.commands.bound_framebuffer);
        d.state.use_program(&d.gl, program.program_id);

        if let Some(handle) = d.commands.vertex_array {
            let vao = d
                .vertex_arrays
                .get_mut(handle)
                .ok_or(GraphicsError::StaleHandle("vertex array"))?;
            if d.commands.vertex_array_dirty || vao.requires_apply(&program.input_signature) {
                vao.apply(&d.gl, &mut d.state, &program.input_signature);
                d.commands.vertex_array_dirty = false;
            }
        }

        // The window framebuffer is bottom-up, render targets top-down.
        let flipped = d.commands.bound_framebuffer == d.framebuffers.default_framebuffer();
        d.state.set_blend_state(&d.gl, Some(&pipeline.blend_state));
        d.state.set_depth_stencil_state(&d.gl, Some(&pipeline.depth_stencil_state));
        d.state.set_rasterizer_state(&d.gl, Some(&pipeline.rasterizer_state), flipped);
        d.state.set_stencil_reference(&d.gl, d.commands.stencil_reference);
        d.state.set_blend_factor(&d.gl, d.commands.blend_factor);

        self.bind_textures(program)?;

        let d = &mut *self.device;
        if let Some(viewport) = d.commands.viewport {
            d.state.set_viewport(&d.gl, &viewport);
        }
        if pipeline.rasterizer_state.scissor_test_enable {
            if let Some(scissor) = d.commands.scissor {
                d.state.set_scissor(&d.gl, scissor);
            }
        }

        if !d.gl.caps().has_uniform_buffers {
            for uniform in &program.uniforms {
                let Some(Some(handle)) = d.commands.constant_buffers.get(uniform.constant_buffer as usize) else {
                    continue;
                };
                let Some(data) = d.buffers.get(*handle).and_then(GlBuffer::staging_data) else {
                    continue;
                };
                d.uniforms.update(&*d.gl, program.program_id, uniform, data);
            }
        }
        Ok(pipeline)
    }

    fn bind_textures(&mut self, program: &EffectProgram) -> Result<()> {
        let d = &mut *self.device;
        for binding in &program.textures {
            let Some(Some(handle)) = d.commands.textures.get(binding.texture_slot as usize).copied() else {
                continue;
            };
            let sampler = d
                .commands
                .samplers
                .get(binding.sampler_slot as usize)
                .copied()
                .flatten()
                .unwrap_or(SamplerState::DEFAULT);

            let texture = d.textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
            if texture.is_renderbuffer() {
                return Err(GraphicsError::invalid("depth renderbuffers cannot be sampled").into());
            }
            let (target, texture_id) = (texture.target, texture.texture_id);
            // Sampler parameters live on the native object, shared with views.
            let root = texture.parent().unwrap_or(handle);
            d.state.bind_texture(&d.gl, binding.unit, target, texture_id);

            let root = d.textures.get_mut(root).ok_or(GraphicsError::StaleHandle("texture"))?;
            if root.bound_sampler != Some(sampler) {
                d.state.active_texture(&d.gl, binding.unit);
                apply_sampler(&d.gl, target, &sampler, root.description().mip_levels > 1);
                root.bound_sampler = Some(sampler);
            }
        }
        Ok(())
    }

    fn record_draw(&mut self, pipeline: &GlPipelineState, vertex_count: u32, instances: u32) {
        let primitives = pipeline.primitive_type.primitive_count(vertex_count) * instances.max(1);
        self.device.stats.record_draw(primitives);
    }

    fn index_format(&self) -> Result<(GLenum, u32, usize)> {
        self.device
            .commands
            .vertex_array
            .and_then(|handle| self.device.vertex_arrays.get(handle))
            .and_then(GlVertexArray::index_format)
            .ok_or_else(|| GraphicsError::invalid("indexed draw without an index buffer").into())
    }

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> Result<()> {
        let pipeline = self.pre_draw()?;
        let gl = &self.device.gl;
        gl.draw_arrays(primitive_mode(pipeline.primitive_type), start_vertex as GLint, vertex_count as GLsizei);
        gl.check("draw")?;
        self.record_draw(&pipeline, vertex_count, 1);
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) -> Result<()> {
        let pipeline = self.pre_draw()?;
        let (ty, element_size, offset) = self.index_format()?;
        let gl = &self.device.gl;
        if base_vertex != 0 && !gl.caps().has_base_vertex {
            return Err(GraphicsError::unsupported("base vertex on this GL version").into());
        }
        gl.draw_elements_base_vertex(
            primitive_mode(pipeline.primitive_type),
            index_count as GLsizei,
            ty,
            offset + start_index as usize * element_size as usize,
            base_vertex,
        );
        gl.check("draw indexed")?;
        self.record_draw(&pipeline, index_count, 1);
        Ok(())
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count_per_instance: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        if !self.device.gl.caps().has_instancing {
            return Err(GraphicsError::unsupported("instancing on GL ES 2").into());
        }
        if start_instance != 0 {
            return Err(GraphicsError::unsupported("non-zero start instance").into());
        }
        let pipeline = self.pre_draw()?;
        let gl = &self.device.gl;
        gl.draw_arrays_instanced(
            primitive_mode(pipeline.primitive_type),
            start_vertex as GLint,
            vertex_count_per_instance as GLsizei,
            instance_count as GLsizei,
        );
        gl.check("draw instanced")?;
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
        let caps = self.device.gl.caps();
        if !caps.has_instancing {
            return Err(GraphicsError::unsupported("instancing on GL ES 2").into());
        }
        if base_vertex != 0 && !caps.has_base_vertex {
            return Err(GraphicsError::unsupported("base vertex on this GL version").into());
        }
        if start_instance != 0 {
            return Err(GraphicsError::unsupported("non-zero start instance").into());
        }
        let pipeline = self.pre_draw()?;
        let (ty, element_size, offset) = self.index_format()?;
        let gl = &self.device.gl;
        gl.draw_elements_instanced_base_vertex(
            primitive_mode(pipeline.primitive_type),
            index_count_per_instance as GLsizei,
            ty,
            offset + start_index as usize * element_size as usize,
            instance_count as GLsizei,
            base_vertex,
        );
        gl.check("draw indexed instanced")?;
        self.record_draw(&pipeline, index_count_per_instance, instance_count);
        Ok(())
    }

    fn bind_indirect(&mut self, target: GLenum, arguments: Handle<GlBuffer>) -> Result<()> {
        let d = &mut *self.device;
        let buffer = d.buffers.get(arguments).ok_or(GraphicsError::StaleHandle("buffer"))?;
        d.state.bind_indirect_buffer(&d.gl, target, buffer.buffer_id);
        Ok(())
    }

    /// Draw with arguments read from `arguments` at `offset`.
    pub fn draw_instanced_indirect(&mut self, arguments: Handle<GlBuffer>, offset: usize) -> Result<()> {
        if !has_draw_indirect(self.device.gl.caps()) {
            return Err(GraphicsError::unsupported("indirect draws on this GL version").into());
        }
        let pipeline = self.pre_draw()?;
        self.bind_indirect(gl::DRAW_INDIRECT_BUFFER, arguments)?;
        let gl = &self.device.gl;
        gl.draw_arrays_indirect(primitive_mode(pipeline.primitive_type), offset);
        gl.check("draw indirect")?;
        self.record_draw(&pipeline, 0, 1);
        Ok(())
    }

    pub fn draw_indexed_instanced_indirect(&mut self, arguments: Handle<GlBuffer>, offset: usize) -> Result<()> {
        if !has_draw_indirect(self.device.gl.caps()) {
            return Err(GraphicsError::unsupported("indirect draws on this GL version").into());
        }
        let pipeline = self.pre_draw()?;
        let (ty, _, _) = self.index_format()?;
        self.bind_indirect(gl::DRAW_INDIRECT_BUFFER, arguments)?;
        let gl = &self.device.gl;
        gl.draw_elements_indirect(primitive_mode(pipeline.primitive_type), ty, offset);
        gl.check("draw indexed indirect")?;
        self.record_draw(&pipeline, 0, 1);
        Ok(())
    }

    pub fn draw_auto(&mut self) -> Result<()> {
        Err(GraphicsError::unsupported("draw auto on GL").into())
    }

    fn pre_dispatch(&mut self) -> Result<()> {
        if !self.device.gl.caps().has_compute {
            return Err(GraphicsError::unsupported("compute shaders on this GL version").into());
        }
        self.device.ensure_context_active()?;
        let pipeline = self
            .device
            .commands
            .pipeline
            .clone()
            .ok_or_else(|| GraphicsError::invalid("dispatch without a pipeline state"))?;
        let d = &mut *self.device;
        d.state.use_program(&d.gl, pipeline.program.program_id);
        self.bind_textures(&pipeline.program)
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.pre_dispatch()?;
        self.device.gl.dispatch_compute(x, y, z);
        self.device.gl.check("dispatch")
    }

    pub fn dispatch_indirect(&mut self, arguments: Handle<GlBuffer>, offset: usize) -> Result<()> {
        self.pre_dispatch()?;
        self.bind_indirect(gl::DISPATCH_INDIRECT_BUFFER, arguments)?;
        self.device.gl.dispatch_compute_indirect(offset);
        self.device.gl.check("dispatch indirect")
    }

    // ---- Profiling

    pub fn begin_profile(&mut self, name: &str) {
        let d = &mut *self.device;
        if d.config().profile_markers && d.gl.caps().has_debug_groups {
            d.gl.push_debug_group(name);
            d.commands.profile_depth += 1;
        }
    }

    pub fn end_profile(&mut self) {
        let d = &mut *self.device;
        if d.commands.profile_depth > 0 {
            d.gl.pop_debug_group();
            d.commands.profile_depth -= 1;
        }
    }

    // ---- Mapping

    /// Map a buffer range or a whole staging / dynamic texture.
    ///
    /// Texture reads need a `Staging` texture. With `do_not_wait`, a read
    /// issued fewer than `readback_frame_delay` frames after the copy that
    /// filled it returns an empty mapping. `WriteDiscard` needs a
    /// `Dynamic` texture; the data is uploaded on unmap.
    pub fn map_subresource(
        &mut self,
        resource: impl Into<GlResource>,
        subresource: u32,
        mode: MapMode,
        do_not_wait: bool,
        offset: usize,
        length: usize,
    ) -> Result<MappedResource> {
        self.device.ensure_context_active()?;
        let d = &mut *self.device;
        let handle = match resource.into() {
            GlResource::Buffer(handle) => {
                let buffer = d.buffers.get_mut(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
                let mut mapped = buffer.map(&d.gl, &mut d.state, mode, do_not_wait, offset, length)?;
                mapped.subresource = subresource;
                return Ok(mapped);
            }
            GlResource::Texture(handle) => handle,
        };

        if subresource != 0 {
            return Err(GraphicsError::unsupported("mapping texture subresources other than the first").into());
        }
        let frame = d.frame_counter;
        let delay = d.config().readback_frame_delay;
        let texture = d.textures.get_mut(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
        let usage = texture.description().usage;
        let (row_pitch, slice_pitch) = (texture.row_pitch, texture.depth_pitch);
        let length = if length == 0 { slice_pitch as usize } else { length };
        let data_box = move |pointer: *mut u8| DataBox {
            data_pointer: pointer,
            row_pitch,
            slice_pitch,
        };

        let (target, access) = match mode {
            MapMode::Read => {
                if usage != GraphicsResourceUsage::Staging {
                    return Err(GraphicsError::invalid("only staging textures can be mapped for reading").into());
                }
                (gl::PIXEL_PACK_BUFFER, gl::MAP_READ_BIT)
            }
            MapMode::WriteDiscard => {
                if usage != GraphicsResourceUsage::Dynamic {
                    return Err(GraphicsError::invalid("only dynamic textures can be mapped with write discard").into());
                }
                if d.gl.caps().is_es2 {
                    return Err(GraphicsError::unsupported("mapping dynamic textures on GL ES 2").into());
                }
                (gl::PIXEL_UNPACK_BUFFER, gl::MAP_WRITE_BIT | gl::MAP_INVALIDATE_BUFFER_BIT)
            }
            other => return Err(GraphicsError::unsupported(format!("mapping textures with {other:?}")).into()),
        };
        if offset + length > slice_pitch as usize {
            return Err(GraphicsError::invalid("map range past the end of the texture").into());
        }

        if let Some(staging) = texture.staging_data.as_mut() {
            // SAFETY: offset + length is within the staging copy checked above.
            let pointer = unsafe { staging.as_mut_ptr().add(offset) };
            return Ok(MappedResource {
                subresource,
                data: data_box(pointer),
                offset: offset as u64,
                size: length as u64,
            });
        }
        if do_not_wait && mode == MapMode::Read && frame < texture.pixel_buffer_frame + delay {
            trace!(frame, copied = texture.pixel_buffer_frame, "readback not ready");
            return Ok(MappedResource::empty(subresource));
        }

        d.gl.bind_buffer(target, texture.pixel_buffer);
        let pointer = d.gl.map_buffer_range(target, offset, length, access);
        d.gl.bind_buffer(target, 0);
        if pointer.is_null() {
            return Err(GraphicsError::Native {
                call: "glMapBufferRange",
                code: d.gl.get_error(),
            }
            .into());
        }
        Ok(MappedResource {
            subresource,
            data: data_box(pointer),
            offset: offset as u64,
            size: length as u64,
        })
    }

    /// Release a mapping. Dynamic textures upload the written data.
    pub fn unmap_subresource(&mut self, resource: impl Into<GlResource>, mapped: &MappedResource) -> Result<()> {
        if mapped.is_empty() {
            return Ok(());
        }
        let d = &mut *self.device;
        match resource.into() {
            GlResource::Buffer(handle) => {
                let buffer = d.buffers.get_mut(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
                buffer.unmap(&d.gl, &mut d.state)
            }
            GlResource::Texture(handle) => {
                let texture = d.textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
                if texture.staging_data.is_some() {
                    return Ok(());
                }
                match texture.description().usage {
                    GraphicsResourceUsage::Staging => {
                        d.gl.bind_buffer(gl::PIXEL_PACK_BUFFER, texture.pixel_buffer);
                        d.gl.unmap_buffer(gl::PIXEL_PACK_BUFFER);
                        d.gl.bind_buffer(gl::PIXEL_PACK_BUFFER, 0);
                    }
                    GraphicsResourceUsage::Dynamic => {
                        d.gl.bind_buffer(gl::PIXEL_UNPACK_BUFFER, texture.pixel_buffer);
                        d.gl.unmap_buffer(gl::PIXEL_UNPACK_BUFFER);
                        d.state.bind_texture_for_update(&d.gl, texture.target, texture.texture_id);
                        let f = texture.gl_format;
                        let previous = d.gl.get_integer(gl::UNPACK_ALIGNMENT);
                        d.gl.pixel_store_i(gl::UNPACK_ALIGNMENT, 1);
                        d.gl.tex_sub_image_2d(
                            texture.target,
                            0,
                            0,
                            0,
                            texture.width() as GLsizei,
                            texture.height() as GLsizei,
                            f.format,
                            f.ty,
                            PixelData::UnpackBuffer(0),
                        );
                        d.gl.pixel_store_i(gl::UNPACK_ALIGNMENT, previous);
                        d.gl.bind_buffer(gl::PIXEL_UNPACK_BUFFER, 0);
                    }
                    _ => return Err(GraphicsError::invalid("texture was not mapped").into()),
                }
                d.gl.check("unmap texture")
            }
        }
    }

    // ---- Updates

    /// Replace a whole buffer or one 2D texture subresource.
    pub fn update_subresource(&mut self, resource: impl Into<GlResource>, subresource: u32, data: &[u8]) -> Result<()> {
        self.device.ensure_context_active()?;
        let d = &mut *self.device;
        match resource.into() {
            GlResource::Buffer(handle) => {
                let buffer = d.buffers.get_mut(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
                buffer.update(&d.gl, &mut d.state, data)
            }
            GlResource::Texture(handle) => {
                let texture = d.textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
                let (image_target, mip) = image_target(texture, subresource)?;
                let desc = texture.description();
                let (width, height) = (desc.mip_width(mip), desc.mip_height(mip));
                let (_, slice_pitch) = desc.compute_pitch(mip);
                if data.len() < slice_pitch as usize {
                    return Err(GraphicsError::invalid(format!(
                        "{} bytes for a {width}x{height} subresource of {slice_pitch} bytes",
                        data.len()
                    ))
                    .into());
                }
                let f = texture.gl_format;
                let previous = d.gl.get_integer(gl::UNPACK_ALIGNMENT);
                d.gl.pixel_store_i(gl::UNPACK_ALIGNMENT, 1);
                d.state.bind_texture_for_update(&d.gl, texture.target, texture.texture_id);
                d.gl.tex_image_2d(
                    image_target,
                    mip as GLint,
                    f.internal_format as GLint,
                    width as GLsizei,
                    height as GLsizei,
                    f.format,
                    f.ty,
                    PixelData::Slice(data),
                );
                d.gl.pixel_store_i(gl::UNPACK_ALIGNMENT, previous);
                d.gl.check("update texture")
            }
        }
    }

    /// Update `region` of a buffer (bytes `left..right`) or of a 2D
    /// texture subresource whose rows are `row_pitch` bytes apart in `data`.
    pub fn update_subresource_region(
        &mut self,
        resource: impl Into<GlResource>,
        subresource: u32,
        region: ResourceRegion,
        data: &[u8],
        row_pitch: u32,
    ) -> Result<()> {
        self.device.ensure_context_active()?;
        let d = &mut *self.device;
        match resource.into() {
            GlResource::Buffer(handle) => {
                let buffer = d.buffers.get_mut(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
                let length = (region.width() as usize).min(data.len());
                buffer.update_region(&d.gl, &mut d.state, region.left as usize, &data[..length])
            }
            GlResource::Texture(handle) => {
                let texture = d.textures.get(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
                let (image_target, mip) = image_target(texture, subresource)?;
                let f = texture.gl_format;
                let desc = texture.description();
                check_region(&region, desc.mip_width(mip), desc.mip_height(mip))?;
                let (width, height) = (region.width(), region.height());
                let row_bytes = width * f.pixel_size;
                let alignment = unpack_alignment(row_pitch, row_bytes).ok_or_else(|| {
                    GraphicsError::unsupported(format!(
                        "row pitch {row_pitch} for a {width} texel wide region needs a repacking copy"
                    ))
                })?;
                let needed = region_byte_len(row_pitch, row_bytes, height);
                if (data.len() as u64) < needed {
                    return Err(GraphicsError::invalid(format!(
                        "{} bytes for {height} rows of {row_bytes} bytes at pitch {row_pitch}",
                        data.len()
                    ))
                    .into());
                }

                let previous = d.gl.get_integer(gl::UNPACK_ALIGNMENT);
                d.gl.pixel_store_i(gl::UNPACK_ALIGNMENT, alignment);
                d.state.bind_texture_for_update(&d.gl, texture.target, texture.texture_id);
                d.gl.tex_sub_image_2d(
                    image_target,
                    mip as GLint,
                    region.left as GLint,
                    region.top as GLint,
                    width as GLsizei,
                    height as GLsizei,
                    f.format,
                    f.ty,
                    PixelData::Slice(data),
                );
                d.gl.pixel_store_i(gl::UNPACK_ALIGNMENT, previous);
                d.gl.check("update texture region")
            }
        }
    }

    // ---- Copies

    /// Copy the whole of `source` into `destination`.
    pub fn copy(&mut self, source: Handle<GlTexture>, destination: Handle<GlTexture>) -> Result<()> {
        self.copy_region(source, 0, None, destination, 0, (0, 0, 0))
    }

    /// Copy `source_region` (all of the source when `None`) to `offset` in
    /// `destination`. A staging destination reads the pixels back for a
    /// later map; other destinations are blitted, or drawn with the copy
    /// program where blits are missing.
    pub fn copy_region(
        &mut self,
        source: Handle<GlTexture>,
        source_subresource: u32,
        source_region: Option<ResourceRegion>,
        destination: Handle<GlTexture>,
        destination_subresource: u32,
        offset: (u32, u32, u32),
    ) -> Result<()> {
        self.device.ensure_context_active()?;
        if source_subresource != 0 || destination_subresource != 0 {
            return Err(GraphicsError::unsupported("copies of subresources other than the first").into());
        }
        let (source_width, source_height) = self.texture_size(source)?;
        let region = source_region.unwrap_or(ResourceRegion::new(0, 0, 0, source_width, source_height, 1));
        check_region(&region, source_width, source_height)?;
        if region.is_empty() {
            return Ok(());
        }
        let (width, height) = (region.width() as GLint, region.height() as GLint);
        let (left, top) = (region.left as GLint, region.top as GLint);
        let source_attachment = self.attachment(source)?;

        let staging = {
            let dest = self.device.textures.get(destination).ok_or(GraphicsError::StaleHandle("texture"))?;
            dest.description().usage == GraphicsResourceUsage::Staging
        };
        if staging {
            if offset != (0, 0, 0) {
                return Err(GraphicsError::unsupported("copies into a staging texture at an offset").into());
            }
            let (dest_width, dest_height) = self.texture_size(destination)?;
            if region.width() != dest_width || region.height() != dest_height {
                return Err(GraphicsError::invalid(format!(
                    "{}x{} region does not match a {dest_width}x{dest_height} staging texture",
                    region.width(),
                    region.height()
                ))
                .into());
            }
            let d = &mut *self.device;
            let read = d
                .framebuffers
                .find_or_create_for(&d.gl, &mut d.state, &d.textures, source_attachment)?;
            d.state.bind_read_framebuffer(&d.gl, read);

            let frame = d.frame_counter;
            let es2 = d.gl.caps().is_es2;
            let dest = d.textures.get_mut(destination).ok_or(GraphicsError::StaleHandle("texture"))?;
            let f = dest.gl_format;
            let (format, ty) = if es2 && f.pixel_size == 4 { (gl::RGBA, gl::UNSIGNED_BYTE) } else { (f.format, f.ty) };
            // Staging memory is tightly packed.
            let previous = d.gl.get_integer(gl::PACK_ALIGNMENT);
            d.gl.pixel_store_i(gl::PACK_ALIGNMENT, 1);
            let readback = match dest.staging_data.as_mut() {
                Some(staging) => {
                    let row_bytes = region.width() * f.pixel_size;
                    let needed = region_byte_len(row_bytes, row_bytes, region.height());
                    if (staging.len() as u64) < needed {
                        Err(GraphicsError::invalid(format!(
                            "readback of {needed} bytes into {} bytes of staging memory",
                            staging.len()
                        )))
                    } else {
                        d.gl.read_pixels(left, top, width, height, format, ty, PixelPack::Slice(staging.as_mut_slice()));
                        Ok(())
                    }
                }
                None => {
                    d.gl.bind_buffer(gl::PIXEL_PACK_BUFFER, dest.pixel_buffer);
                    d.gl.read_pixels(left, top, width, height, format, ty, PixelPack::PackBuffer(0));
                    d.gl.bind_buffer(gl::PIXEL_PACK_BUFFER, 0);
                    dest.pixel_buffer_frame = frame;
                    Ok(())
                }
            };
            d.gl.pixel_store_i(gl::PACK_ALIGNMENT, previous);
            d.state.bind_framebuffer(&d.gl, d.commands.bound_framebuffer);
            readback?;
            return d.gl.check("copy to staging");
        }

        let destination_rect = Rectangle::new(offset.0 as GLint, offset.1 as GLint, width, height);
        if !self.device.gl.caps().has_blit {
            let copy = CopyRegion {
                source: Rectangle::new(left, top, width, height),
                destination: destination_rect,
                flip_y: false,
            };
            return self.device.copy_scaler_2d(source, destination, &copy, false);
        }

        let destination_attachment = self.attachment(destination)?;
        let d = &mut *self.device;
        let read = d
            .framebuffers
            .find_or_create_for(&d.gl, &mut d.state, &d.textures, source_attachment)?;
        let draw = d
            .framebuffers
            .find_or_create_for(&d.gl, &mut d.state, &d.textures, destination_attachment)?;
        d.state.bind_read_framebuffer(&d.gl, read);
        d.state.bind_draw_framebuffer(&d.gl, draw);
        d.gl.blit_framebuffer(
            [left, top, left + width, top + height],
            [
                destination_rect.x,
                destination_rect.y,
                destination_rect.x + width,
                destination_rect.y + height,
            ],
            gl::COLOR_BUFFER_BIT,
            gl::NEAREST,
        );
        d.state.bind_framebuffer(&d.gl, d.commands.bound_framebuffer);
        d.gl.check("copy region")
    }

    pub fn copy_multisample(&mut self, _source: Handle<GlTexture>, _destination: Handle<GlTexture>) -> Result<()> {
        Err(GraphicsError::unsupported("multisample resolve on GL").into())
    }

    pub fn copy_count(&mut self, _source: Handle<GlBuffer>, _destination: Handle<GlBuffer>, _offset: u32) -> Result<()> {
        Err(GraphicsError::unsupported("structure counters on GL").into())
    }
}

/// Image target and mip level of a 2D (or cube face) subresource.
fn image_target(texture: &GlTexture, subresource: u32) -> Result<(GLenum, u32)> {
    let mip_levels = texture.description().mip_levels.max(1);
    let (mip, slice) = (subresource % mip_levels, subresource / mip_levels);
    match texture.target {
        gl::TEXTURE_2D if slice == 0 => Ok((gl::TEXTURE_2D, mip)),
        gl::TEXTURE_CUBE_MAP if slice < 6 => Ok((gl::TEXTURE_CUBE_MAP_POSITIVE_X + slice, mip)),
        _ => Err(GraphicsError::unsupported(format!(
            "updating subresource {subresource} of a texture with target 0x{:04X}",
            texture.target
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use gfx_core::{BufferDescription, BufferFlags, PixelFormat, TextureDescription, TextureFlags};
    use rstest::rstest;

    use super::*;
    use crate::program::compile_program;
    use crate::soft::{SoftGl, SoftPlatform, SoftProfile};
    use crate::vao::{InputSignature, VertexBufferBinding, VertexDeclaration, VertexElement, VertexFormat};

    type SoftDevice = GlDevice<SoftGl, SoftPlatform>;

    const VS: &str = "attribute vec3 a_POSITION0;\nvoid main() { gl_Position = vec4(a_POSITION0, 1.0); }\n";
    const FS: &str = "uniform sampler2D s_texture;\nvoid main() { gl_FragColor = vec4(1.0); }\n";

    fn device(profile: SoftProfile) -> (SoftDevice, Arc<SoftGl>) {
        let api = Arc::new(SoftGl::with_profile(profile, 64, 64));
        let platform = Arc::new(SoftPlatform::new(64, 64));
        let mut device = GlDevice::new(Arc::clone(&api), platform, DeviceConfig::default()).unwrap();
        device.begin().unwrap();
        (device, api)
    }

    fn render_target(device: &mut SoftDevice, width: u32, height: u32) -> Handle<GlTexture> {
        let desc = TextureDescription::new_2d(width, height, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET | TextureFlags::SHADER_RESOURCE);
        device.create_texture(desc, None).unwrap()
    }

    fn depth_buffer(device: &mut SoftDevice, width: u32, height: u32) -> Handle<GlTexture> {
        let desc = TextureDescription::new_2d(width, height, PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL);
        device.create_texture(desc, None).unwrap()
    }

    fn staging(device: &mut SoftDevice, width: u32, height: u32) -> Handle<GlTexture> {
        let desc = TextureDescription::new_2d(width, height, PixelFormat::Rgba8Unorm, TextureFlags::empty()).to_staging();
        device.create_texture(desc, None).unwrap()
    }

    fn pipeline(api: &SoftGl) -> GlPipelineState {
        let program_id = compile_program(api, VS, FS, &[(0, "a_POSITION0")]).unwrap();
        let program = EffectProgram::new(program_id, InputSignature::new([("a_POSITION0", 0)])).with_texture(0, 0, 0);
        GlPipelineState::new(Arc::new(program))
    }

    fn quad(device: &mut SoftDevice) -> Handle<GlVertexArray> {
        let buffer = device
            .create_buffer(BufferDescription::new(48, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default), None)
            .unwrap();
        let declaration = VertexDeclaration::new(vec![VertexElement::new("POSITION", 0, VertexFormat::Float3)]);
        device
            .create_vertex_array(
                vec![VertexBufferBinding {
                    buffer,
                    declaration,
                    offset: 0,
                }],
                None,
                None,
            )
            .unwrap()
    }

    #[test]
    fn same_targets_reuse_one_framebuffer() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let color = render_target(&mut device, 32, 32);
        let depth = depth_buffer(&mut device, 32, 32);
        let mut commands = device.command_list();
        commands.set_render_target(Some(depth), Some(color)).unwrap();
        commands.reset_targets();
        commands.set_render_target(Some(depth), Some(color)).unwrap();
        commands.set_render_targets(Some(depth), &[Some(color)]).unwrap();

        assert_eq!(api.call_count("glGenFramebuffers"), 1);
        assert_eq!(device.framebuffer_count(), 2);
        assert_ne!(api.draw_framebuffer_binding(), 0);
    }

    #[test]
    fn window_target_uses_the_default_framebuffer() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let window = device.window_texture();
        let depth = depth_buffer(&mut device, 64, 64);
        let mut commands = device.command_list();
        commands.set_render_target(None, Some(window)).unwrap();
        assert_eq!(api.call_count("glGenFramebuffers"), 0);
        assert_eq!(api.draw_framebuffer_binding(), 0);

        let err = commands.set_render_target(Some(depth), Some(window)).unwrap_err();
        assert_eq!(gfx_core::graphics_error(&err), Some(&GraphicsError::MixedWindowTargets));
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let (mut device, _) = device(SoftProfile::Desktop43);
        let small = render_target(&mut device, 16, 16);
        let large = render_target(&mut device, 32, 32);
        let depth = depth_buffer(&mut device, 32, 32);
        let mut commands = device.command_list();
        assert!(commands.set_render_targets(None, &[Some(small), Some(large)]).is_err());
        assert!(commands.set_render_target(Some(depth), Some(small)).is_err());
        commands.set_render_target(Some(depth), Some(large)).unwrap();
        assert_eq!(device.commands.viewport, Some(Viewport::new(0.0, 0.0, 32.0, 32.0)));
    }

    #[test]
    fn repeated_draws_issue_no_redundant_state() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let target = render_target(&mut device, 32, 32);
        let texture = render_target(&mut device, 8, 8);
        let vao = quad(&mut device);
        let pipeline = Arc::new(pipeline(&api));

        let mut commands = device.command_list();
        commands.set_render_target(None, Some(target)).unwrap();
        commands.set_pipeline_state(Arc::clone(&pipeline));
        commands.set_vertex_array(Some(vao));
        commands.set_shader_resource_view(0, Some(texture)).unwrap();
        commands.set_sampler_state(0, Some(SamplerState::LINEAR_WRAP)).unwrap();
        commands.draw(6, 0).unwrap();

        api.reset_call_counts();
        commands.draw(6, 0).unwrap();
        assert_eq!(api.call_count("glDrawArrays"), 1);
        for call in ["glUseProgram", "glBindTexture", "glTexParameteri", "glBindVertexArray", "glEnable", "glDisable", "glViewport", "glBindFramebuffer"] {
            assert_eq!(api.call_count(call), 0, "{call} was issued again");
        }
        assert_eq!(device.frame_stats().draw_calls, 2);
        assert_eq!(device.frame_stats().triangle_count, 4);
    }

    #[test]
    fn draws_need_a_pipeline() {
        let (mut device, _) = device(SoftProfile::Desktop43);
        let err = device.command_list().draw(3, 0).unwrap_err();
        assert!(matches!(gfx_core::graphics_error(&err), Some(GraphicsError::InvalidOperation(_))));
    }

    #[test]
    fn indirect_draws_bind_their_arguments_once() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let target = render_target(&mut device, 8, 8);
        let vao = quad(&mut device);
        let arguments = device
            .create_buffer(BufferDescription::new(16, BufferFlags::ARGUMENT_BUFFER, GraphicsResourceUsage::Default), None)
            .unwrap();
        let mut commands = device.command_list();
        commands.set_render_target(None, Some(target)).unwrap();
        commands.set_pipeline_state(Arc::new(pipeline(&api)));
        commands.set_vertex_array(Some(vao));
        commands.draw_instanced_indirect(arguments, 0).unwrap();

        api.reset_call_counts();
        commands.draw_instanced_indirect(arguments, 0).unwrap();
        assert_eq!(api.call_count("glBindBuffer"), 0);
        assert_eq!(api.call_count("glDrawArraysIndirect"), 1);
    }

    #[test]
    fn indexed_draw_without_index_buffer_fails() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let vao = quad(&mut device);
        let mut commands = device.command_list();
        commands.set_pipeline_state(Arc::new(pipeline(&api)));
        commands.set_vertex_array(Some(vao));
        assert!(commands.draw_indexed(6, 0, 0).is_err());
    }

    #[test]
    fn slots_past_the_limit_are_rejected() {
        let (mut device, _) = device(SoftProfile::Desktop43);
        let mut commands = device.command_list();
        assert!(commands.set_shader_resource_view(10_000, None).is_err());
        assert!(commands.set_sampler_state(10_000, None).is_err());
        assert!(commands.set_constant_buffer(10_000, None).is_err());
        commands.set_sampler_state(0, Some(SamplerState::LINEAR_WRAP)).unwrap();
    }

    #[test]
    fn several_scissors_are_unsupported() {
        let (mut device, _) = device(SoftProfile::Desktop43);
        let rect = Rectangle::new(0, 0, 4, 4);
        let mut commands = device.command_list();
        commands.set_scissor_rectangles(&[rect]).unwrap();
        let err = commands.set_scissor_rectangles(&[rect, rect]).unwrap_err();
        assert!(matches!(gfx_core::graphics_error(&err), Some(GraphicsError::Unsupported(_))));
    }

    #[test]
    fn clear_ignores_the_blend_color_mask() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let target = render_target(&mut device, 8, 8);
        let staging = staging(&mut device, 8, 8);
        let vao = quad(&mut device);
        let mut blend = BlendState::DEFAULT;
        blend.render_target.color_write_channels = ColorWriteChannels::RED;
        let pipeline = pipeline(&api).with_blend_state(blend);

        let mut commands = device.command_list();
        commands.set_render_target(None, Some(target)).unwrap();
        commands.set_pipeline_state(Arc::new(pipeline));
        commands.set_vertex_array(Some(vao));
        commands.draw(3, 0).unwrap();
        assert_eq!(api.get_color_mask(), [true, false, false, false]);

        commands.clear_render_target(target, Color4::new(0.0, 1.0, 0.0, 1.0)).unwrap();
        assert_eq!(api.get_color_mask(), [true, false, false, false]);

        commands.copy(target, staging).unwrap();
        let mapped = commands.map_subresource(staging, 0, MapMode::Read, false, 0, 0).unwrap();
        // SAFETY: the mapping covers the 8x8 RGBA texture.
        let texel = unsafe { std::slice::from_raw_parts(mapped.data.data_pointer, 4) }.to_vec();
        commands.unmap_subresource(staging, &mapped).unwrap();
        assert_eq!(texel, [0, 255, 0, 255]);
    }

    #[test]
    fn depth_clear_forces_the_depth_mask() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let target = render_target(&mut device, 8, 8);
        let depth = depth_buffer(&mut device, 8, 8);
        let vao = quad(&mut device);
        let pipeline = pipeline(&api).with_depth_stencil_state(DepthStencilState::DEPTH_READ);

        let mut commands = device.command_list();
        commands.set_render_target(Some(depth), Some(target)).unwrap();
        commands.set_pipeline_state(Arc::new(pipeline));
        commands.set_vertex_array(Some(vao));
        commands.draw(3, 0).unwrap();
        assert!(!api.get_depth_mask());

        api.reset_call_counts();
        commands
            .clear_depth_stencil(depth, DepthStencilClearOptions::DEPTH_BUFFER | DepthStencilClearOptions::STENCIL, 1.0, 0)
            .unwrap();
        assert_eq!(api.call_count("glDepthMask"), 2);
        assert!(!api.get_depth_mask());
    }

    #[rstest]
    #[case::pixel_buffer(SoftProfile::Desktop43)]
    #[case::cpu_copy(SoftProfile::Es2)]
    fn staging_copy_reads_back_the_clear_color(#[case] profile: SoftProfile) {
        let (mut device, _) = device(profile);
        let target = render_target(&mut device, 16, 16);
        let staging = staging(&mut device, 16, 16);
        let mut commands = device.command_list();
        commands.clear_render_target(target, Color4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        commands.copy(target, staging).unwrap();

        let mapped = commands.map_subresource(staging, 0, MapMode::Read, false, 0, 0).unwrap();
        assert_eq!(mapped.size, 16 * 16 * 4);
        assert_eq!(mapped.data.row_pitch, 16 * 4);
        // SAFETY: size bytes are readable until unmap.
        let bytes = unsafe { std::slice::from_raw_parts(mapped.data.data_pointer, mapped.size as usize) }.to_vec();
        commands.unmap_subresource(staging, &mapped).unwrap();
        assert!(bytes.chunks_exact(4).all(|texel| texel == [255, 0, 0, 255]));
    }

    #[test]
    fn readback_waits_for_the_frame_delay() {
        let (mut device, _) = device(SoftProfile::Desktop43);
        let target = render_target(&mut device, 4, 4);
        let staging = staging(&mut device, 4, 4);
        device.command_list().copy(target, staging).unwrap();

        let mapped = device
            .command_list()
            .map_subresource(staging, 0, MapMode::Read, true, 0, 0)
            .unwrap();
        assert!(mapped.is_empty());

        device.begin_frame();
        device.begin_frame();
        let mut commands = device.command_list();
        let mapped = commands.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
        assert!(!mapped.is_empty());
        commands.unmap_subresource(staging, &mapped).unwrap();
    }

    #[test]
    fn reading_needs_a_staging_texture() {
        let (mut device, _) = device(SoftProfile::Desktop43);
        let target = render_target(&mut device, 4, 4);
        assert!(device
            .command_list()
            .map_subresource(target, 0, MapMode::Read, false, 0, 0)
            .is_err());
    }

    #[test]
    fn dynamic_texture_uploads_on_unmap() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let desc = TextureDescription::new_2d(2, 2, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE)
            .with_usage(GraphicsResourceUsage::Dynamic);
        let texture = device.create_texture(desc, None).unwrap();
        let mut commands = device.command_list();
        let mapped = commands.map_subresource(texture, 0, MapMode::WriteDiscard, false, 0, 0).unwrap();
        // SAFETY: the mapping covers the 2x2 RGBA texture.
        unsafe { std::ptr::write_bytes(mapped.data.data_pointer, 7, mapped.size as usize) };
        commands.unmap_subresource(texture, &mapped).unwrap();

        let id = device.texture(texture).unwrap().texture_id();
        assert_eq!(api.texture_image(id, gl::TEXTURE_2D, 0).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn region_update_restores_unpack_alignment() {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::R8Unorm, TextureFlags::SHADER_RESOURCE);
        let texture = device.create_texture(desc, None).unwrap();
        let data = [9u8, 9, 9, 0, 9, 9, 9, 0];
        device
            .command_list()
            .update_subresource_region(texture, 0, ResourceRegion::new(1, 1, 0, 4, 3, 1), &data, 4)
            .unwrap();

        assert_eq!(api.get_integer(gl::UNPACK_ALIGNMENT), 4);
        let id = device.texture(texture).unwrap().texture_id();
        let image = api.texture_image(id, gl::TEXTURE_2D, 0).unwrap();
        assert_eq!(&image[4..8], &[0, 9, 9, 9]);
        assert_eq!(&image[8..12], &[0, 9, 9, 9]);
    }

    #[rstest]
    #[case::short_data(ResourceRegion::new(0, 0, 0, 4, 4, 1), 2)]
    #[case::one_row_short(ResourceRegion::new(0, 0, 0, 4, 4, 1), 15)]
    #[case::past_the_edge(ResourceRegion::new(2, 0, 0, 6, 4, 1), 64)]
    #[case::inverted(ResourceRegion::new(3, 0, 0, 1, 4, 1), 64)]
    fn region_updates_check_the_data_and_extent(#[case] region: ResourceRegion, #[case] len: usize) {
        let (mut device, api) = device(SoftProfile::Desktop43);
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::R8Unorm, TextureFlags::SHADER_RESOURCE);
        let texture = device.create_texture(desc, None).unwrap();
        let data = vec![9u8; len];
        let err = device
            .command_list()
            .update_subresource_region(texture, 0, region, &data, 4)
            .unwrap_err();
        assert!(matches!(gfx_core::graphics_error(&err), Some(GraphicsError::InvalidOperation(_))));
        assert_eq!(api.call_count("glTexSubImage2D"), 0);
    }

    #[rstest]
    #[case::pixel_buffer(SoftProfile::Desktop43)]
    #[case::cpu_copy(SoftProfile::Es2)]
    fn staging_copies_must_match_the_staging_size(#[case] profile: SoftProfile) {
        let (mut device, api) = device(profile);
        let target = render_target(&mut device, 8, 8);
        let small = staging(&mut device, 4, 4);
        let exact = staging(&mut device, 8, 8);
        let mut commands = device.command_list();
        assert!(commands.copy(target, small).is_err());
        commands.copy(target, exact).unwrap();
        assert_eq!(api.get_integer(gl::PACK_ALIGNMENT), 4);
    }

    #[rstest]
    #[case(16, 16, Some(8))]
    #[case(12, 12, Some(4))]
    #[case(6, 5, Some(2))]
    #[case(3, 3, Some(1))]
    #[case(8, 3, Some(8))]
    #[case(2, 4, None)]
    #[case(10, 3, None)]
    #[case(20, 4, None)]
    fn unpack_alignment_matches_row_pitch(#[case] row_pitch: u32, #[case] row_bytes: u32, #[case] expected: Option<GLint>) {
        assert_eq!(unpack_alignment(row_pitch, row_bytes), expected);
    }

    #[test]
    fn es2_copies_between_textures_use_the_copy_program() {
        let (mut device, api) = device(SoftProfile::Es2);
        let source = render_target(&mut device, 8, 8);
        let destination = render_target(&mut device, 8, 8);
        device.command_list().copy(source, destination).unwrap();
        assert_eq!(api.call_count("glBlitFramebuffer"), 0);
        assert_eq!(api.call_count("glDrawArrays"), 1);
    }

    #[test]
    fn profile_markers_are_balanced() {
        let api = Arc::new(SoftGl::new(8, 8));
        let platform = Arc::new(SoftPlatform::new(8, 8));
        let mut config = DeviceConfig::default();
        config.profile_markers = true;
        let mut device = GlDevice::new(Arc::clone(&api), platform, config).unwrap();
        device.begin().unwrap();
        let mut commands = device.command_list();
        commands.begin_profile("shadows");
        commands.end_profile();
        commands.end_profile();
        assert_eq!(api.call_count("glPushDebugGroup"), 1);
        assert_eq!(api.call_count("glPopDebugGroup"), 1);
    }
}

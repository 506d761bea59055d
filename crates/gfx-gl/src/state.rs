//! Shadowed GL state.
//!
//! [`StateTracker`] remembers what was last sent to the driver and only
//! issues native calls when a request differs from the shadow. State
//! objects passed as `None` mean the engine default, so `None` and
//! `Some(&X::DEFAULT)` are interchangeable.
//!
//! Binding shadows are `Option`s: `None` means "unknown" (after a context
//! switch or code outside the tracker touched the binding) and always
//! forces the next bind.

use gfx_core::{
    Blend, BlendFunction, BlendState, Color4, CompareFunction, CullMode, DepthStencilState,
    FillMode, RasterizerState, Rectangle, SamplerState, StencilOperation, TextureAddressMode,
    TextureFilter, Viewport,
};
use gl::types::{GLenum, GLint, GLuint};

use crate::api::{consts, GlApi};
use crate::driver::GlDriver;

const MAX_VERTEX_ATTRIBS: u32 = 16;

pub struct StateTracker {
    blend: BlendState,
    blend_factor: Color4,
    depth_stencil: DepthStencilState,
    stencil_reference: i32,
    rasterizer: RasterizerState,
    front_face: Option<GLenum>,
    viewport: Option<([GLint; 4], (f32, f32))>,
    scissor: Option<Rectangle>,
    program: Option<GLuint>,
    vertex_array: Option<GLuint>,
    active_unit: Option<u32>,
    textures: Vec<Option<(GLenum, GLuint)>>,
    draw_framebuffer: Option<GLuint>,
    read_framebuffer: Option<GLuint>,
    array_buffer: Option<GLuint>,
    element_buffer: Option<GLuint>,
    draw_indirect_buffer: Option<GLuint>,
    dispatch_indirect_buffer: Option<GLuint>,
    enabled_attribs: Option<u32>,
}

impl StateTracker {
    pub fn new(max_texture_units: usize) -> Self {
        Self {
            blend: BlendState::DEFAULT,
            blend_factor: Color4::WHITE,
            depth_stencil: DepthStencilState::DEFAULT,
            stencil_reference: 0,
            rasterizer: RasterizerState::DEFAULT,
            front_face: None,
            viewport: None,
            scissor: None,
            program: None,
            vertex_array: None,
            active_unit: None,
            textures: vec![None; max_texture_units],
            draw_framebuffer: None,
            read_framebuffer: None,
            array_buffer: None,
            element_buffer: None,
            draw_indirect_buffer: None,
            dispatch_indirect_buffer: None,
            enabled_attribs: None,
        }
    }

    /// Push the engine defaults to the driver unconditionally and forget
    /// every binding. Used on device creation and after a context loss.
    pub fn reset<A: GlApi>(&mut self, gl: &GlDriver<A>) {
        apply_blend(gl, &BlendState::DEFAULT, None);
        gl.blend_color(Color4::WHITE.to_array());
        apply_depth_stencil(gl, &DepthStencilState::DEFAULT, 0, None);
        self.front_face = None;
        self.apply_rasterizer(gl, &RasterizerState::DEFAULT, None, false);

        self.blend = BlendState::DEFAULT;
        self.blend_factor = Color4::WHITE;
        self.depth_stencil = DepthStencilState::DEFAULT;
        self.stencil_reference = 0;
        self.rasterizer = RasterizerState::DEFAULT;
        self.invalidate_bindings();
    }

    /// Forget every object binding; fixed-function shadows are kept.
    pub fn invalidate_bindings(&mut self) {
        self.viewport = None;
        self.scissor = None;
        self.program = None;
        self.vertex_array = None;
        self.active_unit = None;
        self.textures.iter_mut().for_each(|t| *t = None);
        self.draw_framebuffer = None;
        self.read_framebuffer = None;
        self.array_buffer = None;
        self.element_buffer = None;
        self.draw_indirect_buffer = None;
        self.dispatch_indirect_buffer = None;
        self.enabled_attribs = None;
    }

    // ---- Fixed function

    pub fn blend_state(&self) -> &BlendState {
        &self.blend
    }

    /// Returns whether anything was sent to the driver.
    pub fn set_blend_state<A: GlApi>(&mut self, gl: &GlDriver<A>, state: Option<&BlendState>) -> bool {
        let state = state.unwrap_or(&BlendState::DEFAULT);
        if *state == self.blend {
            return false;
        }
        apply_blend(gl, state, Some(&self.blend));
        self.blend = *state;
        true
    }

    pub fn set_blend_factor<A: GlApi>(&mut self, gl: &GlDriver<A>, factor: Color4) -> bool {
        if factor == self.blend_factor {
            return false;
        }
        gl.blend_color(factor.to_array());
        self.blend_factor = factor;
        true
    }

    pub fn depth_stencil_state(&self) -> &DepthStencilState {
        &self.depth_stencil
    }

    pub fn set_depth_stencil_state<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: Option<&DepthStencilState>,
    ) -> bool {
        let state = state.unwrap_or(&DepthStencilState::DEFAULT);
        if *state == self.depth_stencil {
            return false;
        }
        apply_depth_stencil(gl, state, self.stencil_reference, Some(&self.depth_stencil));
        self.depth_stencil = *state;
        true
    }

    pub fn set_stencil_reference<A: GlApi>(&mut self, gl: &GlDriver<A>, reference: i32) -> bool {
        if reference == self.stencil_reference {
            return false;
        }
        self.stencil_reference = reference;
        apply_stencil_funcs(gl, &self.depth_stencil, reference);
        true
    }

    pub fn rasterizer_state(&self) -> &RasterizerState {
        &self.rasterizer
    }

    /// `flipped` is true when rendering to the window framebuffer, whose Y
    /// axis runs opposite to render textures; the GL winding flips with it.
    pub fn set_rasterizer_state<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: Option<&RasterizerState>,
        flipped: bool,
    ) -> bool {
        let state = state.unwrap_or(&RasterizerState::DEFAULT);
        let front_face = front_face_mode(state.front_face_counter_clockwise, flipped);
        if *state == self.rasterizer && self.front_face == Some(front_face) {
            return false;
        }
        let previous = self.rasterizer;
        self.apply_rasterizer(gl, state, Some(&previous), flipped);
        self.rasterizer = *state;
        true
    }

    fn apply_rasterizer<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        new: &RasterizerState,
        old: Option<&RasterizerState>,
        flipped: bool,
    ) {
        let changed = |f: fn(&RasterizerState) -> bool| old.map_or(true, |o| f(o) != f(new));

        if changed(|r| r.cull_mode != CullMode::None) {
            toggle(gl, gl::CULL_FACE, new.cull_mode != CullMode::None);
        }
        if new.cull_mode != CullMode::None && old.map_or(true, |o| o.cull_mode != new.cull_mode) {
            gl.cull_face(if new.cull_mode == CullMode::Front { gl::FRONT } else { gl::BACK });
        }

        let front_face = front_face_mode(new.front_face_counter_clockwise, flipped);
        if self.front_face != Some(front_face) {
            gl.front_face(front_face);
            self.front_face = Some(front_face);
        }

        if !gl.caps().is_es && old.map_or(true, |o| o.fill_mode != new.fill_mode) {
            let mode = if new.fill_mode == FillMode::Wireframe { gl::LINE } else { gl::FILL };
            gl.polygon_mode(gl::FRONT_AND_BACK, mode);
        }

        if old.map_or(true, |o| o.depth_bias != new.depth_bias) {
            toggle(gl, gl::POLYGON_OFFSET_FILL, new.depth_bias != 0);
            if new.depth_bias != 0 {
                gl.polygon_offset(1.0, new.depth_bias as f32);
            }
        }

        if changed(|r| r.scissor_test_enable) {
            toggle(gl, gl::SCISSOR_TEST, new.scissor_test_enable);
        }
        if !gl.caps().is_es && changed(|r| r.depth_clip_enable) {
            toggle(gl, gl::DEPTH_CLAMP, !new.depth_clip_enable);
        }
    }

    pub fn set_viewport<A: GlApi>(&mut self, gl: &GlDriver<A>, viewport: &Viewport) -> bool {
        let rect = [
            viewport.x as GLint,
            viewport.y as GLint,
            viewport.width as GLint,
            viewport.height as GLint,
        ];
        let range = (viewport.min_depth, viewport.max_depth);
        let previous = self.viewport;
        if previous == Some((rect, range)) {
            return false;
        }
        if previous.map_or(true, |(_, r)| r != range) {
            gl.depth_range(range.0, range.1);
        }
        if previous.map_or(true, |(r, _)| r != rect) {
            gl.viewport(rect[0], rect[1], rect[2], rect[3]);
        }
        self.viewport = Some((rect, range));
        true
    }

    pub fn set_scissor<A: GlApi>(&mut self, gl: &GlDriver<A>, rect: Rectangle) -> bool {
        if self.scissor == Some(rect) {
            return false;
        }
        gl.scissor(rect.x, rect.y, rect.width, rect.height);
        self.scissor = Some(rect);
        true
    }

    // ---- Object bindings

    pub fn use_program<A: GlApi>(&mut self, gl: &GlDriver<A>, program: GLuint) -> bool {
        if self.program == Some(program) {
            return false;
        }
        gl.use_program(program);
        self.program = Some(program);
        true
    }

    pub fn bound_program(&self) -> Option<GLuint> {
        self.program
    }

    /// Element buffer and attribute enables are VAO state; both become
    /// unknown when the VAO changes.
    pub fn bind_vertex_array<A: GlApi>(&mut self, gl: &GlDriver<A>, vao: GLuint) -> bool {
        if self.vertex_array == Some(vao) {
            return false;
        }
        gl.bind_vertex_array(vao);
        self.vertex_array = Some(vao);
        self.element_buffer = None;
        self.enabled_attribs = None;
        true
    }

    /// A VAO name was deleted; the driver reverts to 0 if it was bound.
    pub fn forget_vertex_array(&mut self, vao: GLuint) {
        if self.vertex_array == Some(vao) {
            self.vertex_array = Some(0);
            self.element_buffer = None;
            self.enabled_attribs = None;
        }
    }

    pub fn active_texture<A: GlApi>(&mut self, gl: &GlDriver<A>, unit: u32) -> bool {
        if self.active_unit == Some(unit) {
            return false;
        }
        gl.active_texture(gl::TEXTURE0 + unit);
        self.active_unit = Some(unit);
        true
    }

    pub fn bound_texture(&self, unit: u32) -> Option<(GLenum, GLuint)> {
        self.textures.get(unit as usize).copied().flatten()
    }

    /// Bind `texture` on `unit`, switching the active unit only when needed.
    pub fn bind_texture<A: GlApi>(&mut self, gl: &GlDriver<A>, unit: u32, target: GLenum, texture: GLuint) -> bool {
        let slot = unit as usize;
        if self.textures.get(slot).copied().flatten() == Some((target, texture)) {
            return false;
        }
        self.active_texture(gl, unit);
        gl.bind_texture(target, texture);
        if let Some(entry) = self.textures.get_mut(slot) {
            *entry = Some((target, texture));
        }
        true
    }

    /// Bind on whatever unit is active, for uploads and parameter changes.
    /// Returns the unit used.
    pub fn bind_texture_for_update<A: GlApi>(&mut self, gl: &GlDriver<A>, target: GLenum, texture: GLuint) -> u32 {
        let unit = match self.active_unit {
            Some(unit) => unit,
            None => {
                self.active_texture(gl, 0);
                0
            }
        };
        self.bind_texture(gl, unit, target, texture);
        unit
    }

    /// A texture name was deleted; the driver unbinds it everywhere.
    pub fn forget_texture(&mut self, texture: GLuint) {
        for entry in &mut self.textures {
            if matches!(entry, Some((_, id)) if *id == texture) {
                *entry = None;
            }
        }
    }

    /// Code outside the tracker bound a texture on the active unit.
    pub fn forget_active_texture_binding(&mut self) {
        match self.active_unit {
            Some(unit) => {
                if let Some(entry) = self.textures.get_mut(unit as usize) {
                    *entry = None;
                }
            }
            None => self.textures.iter_mut().for_each(|t| *t = None),
        }
    }

    /// Buffer bindings were changed behind the tracker's back.
    pub fn forget_buffer_bindings(&mut self) {
        self.array_buffer = None;
        self.element_buffer = None;
        self.draw_indirect_buffer = None;
        self.dispatch_indirect_buffer = None;
    }

    /// Framebuffer for both draw and read.
    pub fn bind_framebuffer<A: GlApi>(&mut self, gl: &GlDriver<A>, framebuffer: GLuint) -> bool {
        if self.draw_framebuffer == Some(framebuffer) && self.read_framebuffer == Some(framebuffer) {
            return false;
        }
        gl.bind_framebuffer(gl::FRAMEBUFFER, framebuffer);
        self.draw_framebuffer = Some(framebuffer);
        self.read_framebuffer = Some(framebuffer);
        true
    }

    pub fn bind_read_framebuffer<A: GlApi>(&mut self, gl: &GlDriver<A>, framebuffer: GLuint) -> bool {
        if gl.caps().is_es2 {
            return self.bind_framebuffer(gl, framebuffer);
        }
        if self.read_framebuffer == Some(framebuffer) {
            return false;
        }
        gl.bind_framebuffer(gl::READ_FRAMEBUFFER, framebuffer);
        self.read_framebuffer = Some(framebuffer);
        true
    }

    pub fn bind_draw_framebuffer<A: GlApi>(&mut self, gl: &GlDriver<A>, framebuffer: GLuint) -> bool {
        if gl.caps().is_es2 {
            return self.bind_framebuffer(gl, framebuffer);
        }
        if self.draw_framebuffer == Some(framebuffer) {
            return false;
        }
        gl.bind_framebuffer(gl::DRAW_FRAMEBUFFER, framebuffer);
        self.draw_framebuffer = Some(framebuffer);
        true
    }

    pub fn draw_framebuffer(&self) -> Option<GLuint> {
        self.draw_framebuffer
    }

    /// A framebuffer name was deleted; the driver reverts to 0 if it was bound.
    pub fn forget_framebuffer(&mut self, framebuffer: GLuint) {
        if self.draw_framebuffer == Some(framebuffer) {
            self.draw_framebuffer = Some(0);
        }
        if self.read_framebuffer == Some(framebuffer) {
            self.read_framebuffer = Some(0);
        }
    }

    pub fn bind_array_buffer<A: GlApi>(&mut self, gl: &GlDriver<A>, buffer: GLuint) -> bool {
        if self.array_buffer == Some(buffer) {
            return false;
        }
        gl.bind_buffer(gl::ARRAY_BUFFER, buffer);
        self.array_buffer = Some(buffer);
        true
    }

    pub fn bind_element_buffer<A: GlApi>(&mut self, gl: &GlDriver<A>, buffer: GLuint) -> bool {
        if self.element_buffer == Some(buffer) {
            return false;
        }
        gl.bind_buffer(gl::ELEMENT_ARRAY_BUFFER, buffer);
        self.element_buffer = Some(buffer);
        true
    }

    /// Argument buffer for `DRAW_INDIRECT_BUFFER` or `DISPATCH_INDIRECT_BUFFER`.
    pub fn bind_indirect_buffer<A: GlApi>(&mut self, gl: &GlDriver<A>, target: GLenum, buffer: GLuint) -> bool {
        let shadow = match target {
            gl::DISPATCH_INDIRECT_BUFFER => &mut self.dispatch_indirect_buffer,
            _ => &mut self.draw_indirect_buffer,
        };
        if *shadow == Some(buffer) {
            return false;
        }
        gl.bind_buffer(target, buffer);
        *shadow = Some(buffer);
        true
    }

    pub fn forget_buffer(&mut self, buffer: GLuint) {
        for shadow in [
            &mut self.array_buffer,
            &mut self.element_buffer,
            &mut self.draw_indirect_buffer,
            &mut self.dispatch_indirect_buffer,
        ] {
            if *shadow == Some(buffer) {
                *shadow = None;
            }
        }
    }

    /// Enable exactly the attributes in `mask`.
    pub fn set_enabled_attribs<A: GlApi>(&mut self, gl: &GlDriver<A>, mask: u32) -> bool {
        let current = self.enabled_attribs;
        if current == Some(mask) {
            return false;
        }
        for index in 0..MAX_VERTEX_ATTRIBS {
            let bit = 1u32 << index;
            let wanted = mask & bit != 0;
            match current {
                Some(current) if (current & bit != 0) == wanted => {}
                _ if wanted => gl.enable_vertex_attrib_array(index),
                Some(_) => gl.disable_vertex_attrib_array(index),
                None => gl.disable_vertex_attrib_array(index),
            }
        }
        self.enabled_attribs = Some(mask);
        true
    }
}

// ---------------------------------------------------------------------------
// Native application of state objects
// ---------------------------------------------------------------------------

fn toggle<A: GlApi>(gl: &GlDriver<A>, cap: GLenum, enabled: bool) {
    if enabled {
        gl.enable(cap);
    } else {
        gl.disable(cap);
    }
}

fn front_face_mode(counter_clockwise: bool, flipped: bool) -> GLenum {
    if counter_clockwise != flipped {
        gl::CCW
    } else {
        gl::CW
    }
}

fn apply_blend<A: GlApi>(gl: &GlDriver<A>, new: &BlendState, old: Option<&BlendState>) {
    let n = &new.render_target;
    let o = old.map(|o| &o.render_target);

    if old.map_or(true, |o| o.alpha_to_coverage_enable != new.alpha_to_coverage_enable) {
        toggle(gl, gl::SAMPLE_ALPHA_TO_COVERAGE, new.alpha_to_coverage_enable);
    }
    if o.map_or(true, |o| o.blend_enable != n.blend_enable) {
        toggle(gl, gl::BLEND, n.blend_enable);
    }
    if o.map_or(true, |o| {
        (o.color_blend_function, o.alpha_blend_function) != (n.color_blend_function, n.alpha_blend_function)
    }) {
        gl.blend_equation_separate(
            blend_equation(n.color_blend_function),
            blend_equation(n.alpha_blend_function),
        );
    }
    if o.map_or(true, |o| {
        (o.color_source_blend, o.color_destination_blend, o.alpha_source_blend, o.alpha_destination_blend)
            != (n.color_source_blend, n.color_destination_blend, n.alpha_source_blend, n.alpha_destination_blend)
    }) {
        gl.blend_func_separate(
            blend_factor(n.color_source_blend),
            blend_factor(n.color_destination_blend),
            blend_factor(n.alpha_source_blend),
            blend_factor(n.alpha_destination_blend),
        );
    }
    if o.map_or(true, |o| o.color_write_channels != n.color_write_channels) {
        let [r, g, b, a] = color_mask(n.color_write_channels);
        gl.color_mask(r, g, b, a);
    }
}

pub(crate) fn color_mask(channels: gfx_core::ColorWriteChannels) -> [bool; 4] {
    use gfx_core::ColorWriteChannels as C;
    [
        channels.contains(C::RED),
        channels.contains(C::GREEN),
        channels.contains(C::BLUE),
        channels.contains(C::ALPHA),
    ]
}

fn apply_depth_stencil<A: GlApi>(
    gl: &GlDriver<A>,
    new: &DepthStencilState,
    reference: i32,
    old: Option<&DepthStencilState>,
) {
    if old.map_or(true, |o| o.depth_buffer_enable != new.depth_buffer_enable) {
        toggle(gl, gl::DEPTH_TEST, new.depth_buffer_enable);
    }
    if old.map_or(true, |o| o.depth_buffer_write_enable != new.depth_buffer_write_enable) {
        gl.depth_mask(new.depth_buffer_write_enable);
    }
    if old.map_or(true, |o| o.depth_buffer_function != new.depth_buffer_function) {
        gl.depth_func(compare_function(new.depth_buffer_function));
    }
    if old.map_or(true, |o| o.stencil_enable != new.stencil_enable) {
        toggle(gl, gl::STENCIL_TEST, new.stencil_enable);
    }
    if old.map_or(true, |o| {
        (o.stencil_mask, o.front_face.stencil_function, o.back_face.stencil_function)
            != (new.stencil_mask, new.front_face.stencil_function, new.back_face.stencil_function)
    }) {
        apply_stencil_funcs(gl, new, reference);
    }
    if old.map_or(true, |o| o.stencil_write_mask != new.stencil_write_mask) {
        gl.stencil_mask_separate(gl::FRONT_AND_BACK, GLuint::from(new.stencil_write_mask));
    }
    for (face, ops, old_ops) in [
        (gl::FRONT, &new.front_face, old.map(|o| &o.front_face)),
        (gl::BACK, &new.back_face, old.map(|o| &o.back_face)),
    ] {
        if old_ops.map_or(true, |o| {
            (o.stencil_fail, o.stencil_depth_buffer_fail, o.stencil_pass)
                != (ops.stencil_fail, ops.stencil_depth_buffer_fail, ops.stencil_pass)
        }) {
            gl.stencil_op_separate(
                face,
                stencil_operation(ops.stencil_fail),
                stencil_operation(ops.stencil_depth_buffer_fail),
                stencil_operation(ops.stencil_pass),
            );
        }
    }
}

fn apply_stencil_funcs<A: GlApi>(gl: &GlDriver<A>, state: &DepthStencilState, reference: i32) {
    let mask = GLuint::from(state.stencil_mask);
    gl.stencil_func_separate(gl::FRONT, compare_function(state.front_face.stencil_function), reference, mask);
    gl.stencil_func_separate(gl::BACK, compare_function(state.back_face.stencil_function), reference, mask);
}

/// Set every texture parameter `sampler` implies on the texture bound to
/// `target` on the active unit.
pub fn apply_sampler<A: GlApi>(gl: &GlDriver<A>, target: GLenum, sampler: &SamplerState, has_mipmap: bool) {
    let (min, mag) = filter_modes(sampler.filter, has_mipmap);
    gl.tex_parameter_i(target, gl::TEXTURE_MIN_FILTER, min as GLint);
    gl.tex_parameter_i(target, gl::TEXTURE_MAG_FILTER, mag as GLint);

    let caps = gl.caps();
    gl.tex_parameter_i(target, gl::TEXTURE_WRAP_S, address_mode(sampler.address_u, caps.is_es) as GLint);
    gl.tex_parameter_i(target, gl::TEXTURE_WRAP_T, address_mode(sampler.address_v, caps.is_es) as GLint);
    if !caps.is_es2 {
        gl.tex_parameter_i(target, gl::TEXTURE_WRAP_R, address_mode(sampler.address_w, caps.is_es) as GLint);
        gl.tex_parameter_f(target, gl::TEXTURE_MIN_LOD, sampler.min_mip_level);
        gl.tex_parameter_f(target, gl::TEXTURE_MAX_LOD, sampler.max_mip_level.min(1000.0));
    }
    if !caps.is_es {
        gl.tex_parameter_f(target, gl::TEXTURE_LOD_BIAS, sampler.mip_map_level_of_detail_bias);
        gl.tex_parameter_fv(target, gl::TEXTURE_BORDER_COLOR, &sampler.border_color.to_array());
    }
    if caps.has_anisotropic {
        let anisotropy = if sampler.filter == TextureFilter::Anisotropic {
            sampler.max_anisotropy.max(1) as f32
        } else {
            1.0
        };
        gl.tex_parameter_f(target, consts::TEXTURE_MAX_ANISOTROPY_EXT, anisotropy);
    }
    if !caps.is_es2 {
        if sampler.filter.is_comparison() {
            gl.tex_parameter_i(target, gl::TEXTURE_COMPARE_MODE, gl::COMPARE_REF_TO_TEXTURE as GLint);
            gl.tex_parameter_i(
                target,
                gl::TEXTURE_COMPARE_FUNC,
                compare_function(sampler.compare_function) as GLint,
            );
        } else {
            gl.tex_parameter_i(target, gl::TEXTURE_COMPARE_MODE, gl::NONE as GLint);
        }
    }
}

// ---------------------------------------------------------------------------
// Enum conversions
// ---------------------------------------------------------------------------

pub fn blend_factor(blend: Blend) -> GLenum {
    match blend {
        Blend::Zero => gl::ZERO,
        Blend::One => gl::ONE,
        Blend::SourceColor => gl::SRC_COLOR,
        Blend::InverseSourceColor => gl::ONE_MINUS_SRC_COLOR,
        Blend::SourceAlpha => gl::SRC_ALPHA,
        Blend::InverseSourceAlpha => gl::ONE_MINUS_SRC_ALPHA,
        Blend::DestinationAlpha => gl::DST_ALPHA,
        Blend::InverseDestinationAlpha => gl::ONE_MINUS_DST_ALPHA,
        Blend::DestinationColor => gl::DST_COLOR,
        Blend::InverseDestinationColor => gl::ONE_MINUS_DST_COLOR,
        Blend::SourceAlphaSaturate => gl::SRC_ALPHA_SATURATE,
        Blend::BlendFactor => gl::CONSTANT_COLOR,
        Blend::InverseBlendFactor => gl::ONE_MINUS_CONSTANT_COLOR,
    }
}

pub fn blend_equation(function: BlendFunction) -> GLenum {
    match function {
        BlendFunction::Add => gl::FUNC_ADD,
        BlendFunction::Subtract => gl::FUNC_SUBTRACT,
        BlendFunction::ReverseSubtract => gl::FUNC_REVERSE_SUBTRACT,
        BlendFunction::Min => gl::MIN,
        BlendFunction::Max => gl::MAX,
    }
}

pub fn compare_function(function: CompareFunction) -> GLenum {
    match function {
        CompareFunction::Never => gl::NEVER,
        CompareFunction::Less => gl::LESS,
        CompareFunction::Equal => gl::EQUAL,
        CompareFunction::LessEqual => gl::LEQUAL,
        CompareFunction::Greater => gl::GREATER,
        CompareFunction::NotEqual => gl::NOTEQUAL,
        CompareFunction::GreaterEqual => gl::GEQUAL,
        CompareFunction::Always => gl::ALWAYS,
    }
}

pub fn stencil_operation(operation: StencilOperation) -> GLenum {
    match operation {
        StencilOperation::Keep => gl::KEEP,
        StencilOperation::Zero => gl::ZERO,
        StencilOperation::Replace => gl::REPLACE,
        StencilOperation::IncrementSaturation => gl::INCR,
        StencilOperation::DecrementSaturation => gl::DECR,
        StencilOperation::Invert => gl::INVERT,
        StencilOperation::Increment => gl::INCR_WRAP,
        StencilOperation::Decrement => gl::DECR_WRAP,
    }
}

fn filter_modes(filter: TextureFilter, has_mipmap: bool) -> (GLenum, GLenum) {
    let (min_linear, mag_linear, mip_linear) = match filter {
        TextureFilter::Point | TextureFilter::ComparisonPoint => (false, false, false),
        TextureFilter::Linear | TextureFilter::ComparisonLinear | TextureFilter::Anisotropic => (true, true, true),
        TextureFilter::MinPointMagLinearMipPoint => (false, true, false),
        TextureFilter::MinLinearMagPointMipLinear => (true, false, true),
    };
    let min = match (has_mipmap, min_linear, mip_linear) {
        (false, false, _) => gl::NEAREST,
        (false, true, _) => gl::LINEAR,
        (true, false, false) => gl::NEAREST_MIPMAP_NEAREST,
        (true, false, true) => gl::NEAREST_MIPMAP_LINEAR,
        (true, true, false) => gl::LINEAR_MIPMAP_NEAREST,
        (true, true, true) => gl::LINEAR_MIPMAP_LINEAR,
    };
    let mag = if mag_linear { gl::LINEAR } else { gl::NEAREST };
    (min, mag)
}

fn address_mode(mode: TextureAddressMode, is_es: bool) -> GLenum {
    match mode {
        TextureAddressMode::Wrap => gl::REPEAT,
        TextureAddressMode::Mirror => gl::MIRRORED_REPEAT,
        TextureAddressMode::Clamp => gl::CLAMP_TO_EDGE,
        TextureAddressMode::Border if is_es => gl::CLAMP_TO_EDGE,
        TextureAddressMode::Border => gl::CLAMP_TO_BORDER,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::soft::SoftGl;

    fn driver() -> GlDriver<SoftGl> {
        GlDriver::new(Arc::new(SoftGl::new(4, 4)))
    }

    fn tracker(gl: &GlDriver<SoftGl>) -> StateTracker {
        let mut state = StateTracker::new(8);
        state.reset(gl);
        state
    }

    #[test]
    fn repeated_blend_state_is_free() {
        let gl = driver();
        let mut state = tracker(&gl);
        gl.reset_call_counts();

        assert!(state.set_blend_state(&gl, Some(&BlendState::ALPHA_BLEND)));
        let issued = gl.call_count("glBlendFuncSeparate");
        assert_eq!(issued, 1);

        assert!(!state.set_blend_state(&gl, Some(&BlendState::ALPHA_BLEND)));
        assert_eq!(gl.call_count("glBlendFuncSeparate"), issued);
    }

    #[test]
    fn none_is_the_default_state() {
        let gl = driver();
        let mut state = tracker(&gl);
        gl.reset_call_counts();

        assert!(!state.set_blend_state(&gl, None));
        assert!(!state.set_blend_state(&gl, Some(&BlendState::DEFAULT)));
        assert!(!state.set_depth_stencil_state(&gl, None));
        assert!(!state.set_rasterizer_state(&gl, None, false));
        assert_eq!(gl.call_count("glEnable") + gl.call_count("glDisable"), 0);
    }

    #[test]
    fn flipping_target_changes_winding_only() {
        let gl = driver();
        let mut state = tracker(&gl);
        gl.reset_call_counts();

        assert!(state.set_rasterizer_state(&gl, None, true));
        assert_eq!(gl.call_count("glFrontFace"), 1);
        assert_eq!(gl.call_count("glCullFace"), 0);
        assert!(!state.set_rasterizer_state(&gl, None, true));
    }

    #[test]
    fn texture_bind_switches_unit_lazily() {
        let gl = driver();
        let mut state = tracker(&gl);
        gl.reset_call_counts();
        let a = gl.gen_texture();

        state.bind_texture(&gl, 2, gl::TEXTURE_2D, a);
        state.bind_texture(&gl, 2, gl::TEXTURE_2D, a);
        assert_eq!(gl.call_count("glActiveTexture"), 1);
        assert_eq!(gl.call_count("glBindTexture"), 1);

        state.forget_texture(a);
        state.bind_texture(&gl, 2, gl::TEXTURE_2D, a);
        assert_eq!(gl.call_count("glActiveTexture"), 1);
        assert_eq!(gl.call_count("glBindTexture"), 2);
    }

    #[test]
    fn stencil_reference_reissues_funcs() {
        let gl = driver();
        let mut state = tracker(&gl);
        gl.reset_call_counts();

        assert!(state.set_stencil_reference(&gl, 3));
        assert!(!state.set_stencil_reference(&gl, 3));
        assert_eq!(gl.call_count("glStencilFuncSeparate"), 2);
    }

    #[test]
    fn attrib_mask_diffs() {
        let gl = driver();
        let mut state = tracker(&gl);
        state.set_enabled_attribs(&gl, 0b11);
        gl.reset_call_counts();

        state.set_enabled_attribs(&gl, 0b101);
        assert_eq!(gl.call_count("glEnableVertexAttribArray"), 1);
        assert_eq!(gl.call_count("glDisableVertexAttribArray"), 1);
    }

    #[test]
    fn indirect_bindings_are_shadowed_per_target() {
        let gl = driver();
        let mut state = tracker(&gl);
        gl.reset_call_counts();

        assert!(state.bind_indirect_buffer(&gl, gl::DRAW_INDIRECT_BUFFER, 5));
        assert!(!state.bind_indirect_buffer(&gl, gl::DRAW_INDIRECT_BUFFER, 5));
        assert!(state.bind_indirect_buffer(&gl, gl::DISPATCH_INDIRECT_BUFFER, 5));
        assert_eq!(gl.call_count("glBindBuffer"), 2);

        state.forget_buffer(5);
        assert!(state.bind_indirect_buffer(&gl, gl::DRAW_INDIRECT_BUFFER, 5));
        assert_eq!(gl.call_count("glBindBuffer"), 3);
    }
}

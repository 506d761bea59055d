//! Textured-quad copies between textures.
//!
//! Used where `glBlitFramebuffer` is missing (GL ES 2) and for presenting
//! an sRGB back buffer to a window framebuffer that is not sRGB.

use anyhow::Result;
use gfx_core::{slice_as_bytes, BlendState, DepthStencilState, RasterizerState, Rectangle, SamplerState, Viewport};
use gl::types::{GLint, GLuint};
use tracing::debug;

use crate::api::GlApi;
use crate::driver::GlDriver;
use crate::program::compile_program;
use crate::state::{apply_sampler, StateTracker};
use crate::texture::GlTexture;

const SQUARE_VERTICES: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];

const VERTEX_SHADER: &str = "\
attribute vec2 aPosition;
varying vec2 vTexCoord;
uniform vec4 uScale;
uniform vec4 uOffset;
void main()
{
    vec4 transformedPosition = aPosition.xyxy * uScale + uOffset;
    gl_Position = vec4(transformedPosition.zw * 2.0 - 1.0, 0.0, 1.0);
    vTexCoord = transformedPosition.xy;
}
";

const FRAGMENT_SHADER: &str = "\
precision mediump float;
varying vec2 vTexCoord;
uniform sampler2D s_texture;
void main()
{
    gl_FragColor = texture2D(s_texture, vTexCoord);
}
";

// sqrt approximates the linear to sRGB curve.
const FRAGMENT_SHADER_SRGB: &str = "\
precision mediump float;
varying vec2 vTexCoord;
uniform sampler2D s_texture;
void main()
{
    vec4 color = texture2D(s_texture, vTexCoord);
    gl_FragColor = vec4(sqrt(color.rgb), color.a);
}
";

#[derive(Debug, Clone, Copy)]
struct CopyProgram {
    program: GLuint,
    offset_location: GLint,
    scale_location: GLint,
}

impl CopyProgram {
    fn create<A: GlApi>(gl: &GlDriver<A>, state: &mut StateTracker, srgb: bool) -> Result<Self> {
        let version = if gl.caps().is_es { "#version 100\n" } else { "#version 410\n" };
        let vertex = format!("{version}{VERTEX_SHADER}");
        let fragment = format!("{version}{}", if srgb { FRAGMENT_SHADER_SRGB } else { FRAGMENT_SHADER });
        let program = compile_program(&**gl, &vertex, &fragment, &[(0, "aPosition")])?;

        state.use_program(gl, program);
        let texture_location = gl.get_uniform_location(program, "s_texture");
        gl.uniform_1i(texture_location, 0);
        debug!(program, srgb, "created copy program");
        Ok(Self {
            program,
            offset_location: gl.get_uniform_location(program, "uOffset"),
            scale_location: gl.get_uniform_location(program, "uScale"),
        })
    }
}

/// Where a copy reads from and writes to, in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub source: Rectangle,
    pub destination: Rectangle,
    /// Write rows bottom-up, for copies into the window framebuffer.
    pub flip_y: bool,
}

/// Offset and scale uniforms mapping the unit square onto the source
/// region (xy) and the destination region (zw).
pub(crate) fn copy_transform(
    region: &CopyRegion,
    source_size: (u32, u32),
    destination_size: (u32, u32),
) -> ([f32; 4], [f32; 4]) {
    let (sw, sh) = (source_size.0 as f32, source_size.1 as f32);
    let (dw, dh) = (destination_size.0 as f32, destination_size.1 as f32);
    let src = region.source;
    let dst = region.destination;

    let dest_top = if region.flip_y { dst.y + dst.height } else { dst.y };
    let mut dest_scale_y = dst.height as f32 / dh;
    if region.flip_y {
        dest_scale_y = -dest_scale_y;
    }
    let offset = [src.x as f32 / sw, src.y as f32 / sh, dst.x as f32 / dw, dest_top as f32 / dh];
    let scale = [src.width as f32 / sw, src.height as f32 / sh, dst.width as f32 / dw, dest_scale_y];
    (offset, scale)
}

/// Lazily created programs and geometry for [`CopyRegion`] draws.
#[derive(Debug, Default)]
pub struct CopyScaler {
    plain: Option<CopyProgram>,
    srgb: Option<CopyProgram>,
    square_buffer: GLuint,
    vertex_array: GLuint,
}

impl CopyScaler {
    /// Draw `source` into the framebuffer currently bound as draw target,
    /// whose color attachment is `destination_size` texels large.
    ///
    /// Fixed-function state is forced to opaque, unculled and untested for
    /// the draw and restored afterwards through the tracker.
    pub fn copy<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        source: &mut GlTexture,
        destination_size: (u32, u32),
        region: &CopyRegion,
        srgb: bool,
    ) -> Result<()> {
        let program = self.program(gl, state, srgb)?;
        self.bind_square(gl, state);

        let saved_blend = *state.blend_state();
        let saved_depth = *state.depth_stencil_state();
        let saved_rasterizer = *state.rasterizer_state();
        state.set_blend_state(gl, Some(&BlendState::DEFAULT));
        state.set_depth_stencil_state(gl, Some(&DepthStencilState::NONE));
        state.set_rasterizer_state(gl, Some(&RasterizerState::CULL_NONE), false);

        state.use_program(gl, program.program);
        state.bind_texture(gl, 0, gl::TEXTURE_2D, source.texture_id);
        if source.bound_sampler != Some(SamplerState::POINT_CLAMP) {
            apply_sampler(gl, gl::TEXTURE_2D, &SamplerState::POINT_CLAMP, false);
            source.bound_sampler = Some(SamplerState::POINT_CLAMP);
        }

        let (offset, scale) = copy_transform(region, (source.width(), source.height()), destination_size);
        gl.uniform_4fv(program.offset_location, &offset);
        gl.uniform_4fv(program.scale_location, &scale);
        state.set_viewport(
            gl,
            &Viewport::new(0.0, 0.0, destination_size.0 as f32, destination_size.1 as f32),
        );
        gl.draw_arrays(gl::TRIANGLE_STRIP, 0, 4);

        state.set_blend_state(gl, Some(&saved_blend));
        state.set_depth_stencil_state(gl, Some(&saved_depth));
        state.set_rasterizer_state(gl, Some(&saved_rasterizer), false);
        gl.check("copy scaler")
    }

    fn program<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, srgb: bool) -> Result<CopyProgram> {
        let slot = if srgb { &mut self.srgb } else { &mut self.plain };
        match slot {
            Some(program) => Ok(*program),
            None => {
                let program = CopyProgram::create(gl, state, srgb)?;
                *slot = Some(program);
                Ok(program)
            }
        }
    }

    fn bind_square<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        let first_use = self.square_buffer == 0;
        if first_use {
            self.square_buffer = gl.gen_buffer();
            state.bind_array_buffer(gl, self.square_buffer);
            let bytes = slice_as_bytes(&SQUARE_VERTICES);
            gl.buffer_data(gl::ARRAY_BUFFER, bytes.len(), Some(bytes), gl::STATIC_DRAW);
        }

        if gl.caps().has_vao {
            if self.vertex_array == 0 {
                self.vertex_array = gl.gen_vertex_array();
                state.bind_vertex_array(gl, self.vertex_array);
                state.bind_array_buffer(gl, self.square_buffer);
                gl.enable_vertex_attrib_array(0);
                gl.vertex_attrib_pointer(0, 2, gl::FLOAT, false, 0, 0);
            } else {
                state.bind_vertex_array(gl, self.vertex_array);
            }
        } else {
            state.bind_array_buffer(gl, self.square_buffer);
            gl.vertex_attrib_pointer(0, 2, gl::FLOAT, false, 0, 0);
            state.set_enabled_attribs(gl, 1);
        }
    }

    pub(crate) fn dispose<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        for program in [self.plain.take(), self.srgb.take()].into_iter().flatten() {
            gl.delete_program(program.program);
        }
        if self.square_buffer != 0 {
            gl.delete_buffer(self.square_buffer);
            state.forget_buffer(self.square_buffer);
        }
        if self.vertex_array != 0 {
            gl.delete_vertex_array(self.vertex_array);
            state.forget_vertex_array(self.vertex_array);
        }
        *self = Self::default();
    }

    /// The context was lost along with every name held here.
    pub(crate) fn forget(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gfx_core::{PixelFormat, TextureDescription, TextureFlags};
    use rstest::rstest;

    use super::*;
    use crate::soft::{SoftGl, SoftProfile};

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle {
        Rectangle::new(x, y, w, h)
    }

    #[rstest]
    #[case(false, [0.25, 0.0, 0.0, 0.0], [0.5, 1.0, 1.0, 1.0])]
    #[case(true, [0.25, 0.0, 0.0, 1.0], [0.5, 1.0, 1.0, -1.0])]
    fn transform_maps_unit_square(#[case] flip_y: bool, #[case] offset: [f32; 4], #[case] scale: [f32; 4]) {
        let region = CopyRegion {
            source: rect(16, 0, 32, 64),
            destination: rect(0, 0, 32, 32),
            flip_y,
        };
        assert_eq!(copy_transform(&region, (64, 64), (32, 32)), (offset, scale));
    }

    #[test]
    fn programs_and_geometry_are_created_once() {
        let gl = GlDriver::new(Arc::new(SoftGl::with_profile(SoftProfile::Es2, 8, 8)));
        let mut state = StateTracker::new(8);
        state.reset(&gl);
        let desc = TextureDescription::new_2d(8, 8, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let mut source = GlTexture::create(&gl, desc, None).unwrap();
        state.forget_active_texture_binding();

        let region = CopyRegion {
            source: rect(0, 0, 8, 8),
            destination: rect(0, 0, 8, 8),
            flip_y: false,
        };
        let mut scaler = CopyScaler::default();
        scaler.copy(&gl, &mut state, &mut source, (8, 8), &region, false).unwrap();
        scaler.copy(&gl, &mut state, &mut source, (8, 8), &region, false).unwrap();

        assert_eq!(gl.call_count("glCreateProgram"), 1);
        assert_eq!(gl.call_count("glDrawArrays"), 2);
        assert_eq!(source.bound_sampler, Some(SamplerState::POINT_CLAMP));
        // Saved states are restored.
        assert_eq!(state.depth_stencil_state(), &DepthStencilState::DEFAULT);
        assert_eq!(state.rasterizer_state(), &RasterizerState::DEFAULT);

        scaler.copy(&gl, &mut state, &mut source, (8, 8), &region, true).unwrap();
        assert_eq!(gl.call_count("glCreateProgram"), 2);
    }
}

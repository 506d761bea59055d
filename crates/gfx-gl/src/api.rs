//! The GL entry points used by the backend.
//!
//! Everything above this module talks to GL through [`GlApi`], so the same
//! tracker/cache/command-list code drives the real driver ([`NativeGl`]) and
//! the CPU implementation used in headless runs and tests ([`SoftGl`]).
//!
//! [`NativeGl`]: crate::native::NativeGl
//! [`SoftGl`]: crate::soft::SoftGl

use gl::types::{GLbitfield, GLenum, GLint, GLsizei, GLuint};

/// Enums missing from the core-profile `gl` bindings.
pub mod consts {
    use gl::types::GLenum;

    pub const LUMINANCE: GLenum = 0x1909;
    pub const ALPHA: GLenum = 0x1906;
    pub const HALF_FLOAT_OES: GLenum = 0x8D61;
    pub const SRGB_ALPHA_EXT: GLenum = 0x8C42;
    pub const BGRA8_EXT: GLenum = 0x93A1;
    pub const COMPRESSED_RGBA_S3TC_DXT1_EXT: GLenum = 0x83F1;
    pub const COMPRESSED_RGBA_S3TC_DXT3_EXT: GLenum = 0x83F2;
    pub const COMPRESSED_RGBA_S3TC_DXT5_EXT: GLenum = 0x83F3;
    pub const COMPRESSED_SRGB_ALPHA_S3TC_DXT1_EXT: GLenum = 0x8C4D;
    pub const TEXTURE_MAX_ANISOTROPY_EXT: GLenum = 0x84FE;
    pub const DEPTH_COMPONENT24_OES: GLenum = 0x81A6;
}

/// Pixel source of a texture upload.
#[derive(Debug, Clone, Copy)]
pub enum PixelData<'a> {
    /// Allocate storage only.
    None,
    Slice(&'a [u8]),
    /// Byte offset into the bound `PIXEL_UNPACK_BUFFER`.
    UnpackBuffer(usize),
}

/// Destination of `glReadPixels`.
#[derive(Debug)]
pub enum PixelPack<'a> {
    Slice(&'a mut [u8]),
    /// Byte offset into the bound `PIXEL_PACK_BUFFER`.
    PackBuffer(usize),
}

/// Bytes per pixel in client memory for a `format`/`ty` pair.
pub(crate) fn transfer_pixel_size(format: GLenum, ty: GLenum) -> u32 {
    match ty {
        gl::UNSIGNED_INT_24_8
        | gl::UNSIGNED_INT_2_10_10_10_REV
        | gl::UNSIGNED_INT_10F_11F_11F_REV
        | gl::UNSIGNED_INT_5_9_9_9_REV => return 4,
        gl::UNSIGNED_SHORT_5_6_5 | gl::UNSIGNED_SHORT_4_4_4_4 | gl::UNSIGNED_SHORT_5_5_5_1 => return 2,
        gl::FLOAT_32_UNSIGNED_INT_24_8_REV => return 8,
        _ => {}
    }
    let components = match format {
        gl::RED | gl::RED_INTEGER | gl::DEPTH_COMPONENT | gl::STENCIL_INDEX | consts::LUMINANCE | consts::ALPHA => 1,
        gl::RG | gl::RG_INTEGER => 2,
        gl::RGB | gl::RGB_INTEGER => 3,
        gl::DEPTH_STENCIL => return 4,
        _ => 4,
    };
    let size = match ty {
        gl::FLOAT | gl::UNSIGNED_INT | gl::INT => 4,
        gl::HALF_FLOAT | consts::HALF_FLOAT_OES | gl::UNSIGNED_SHORT | gl::SHORT => 2,
        _ => 1,
    };
    components * size
}

pub(crate) fn align_up(value: usize, alignment: GLint) -> usize {
    let alignment = alignment.max(1) as usize;
    value.div_ceil(alignment) * alignment
}

/// Client-memory bytes GL reads or writes for a `width` x `rows` pixel
/// transfer whose rows start on `alignment` byte boundaries. The last row
/// is not padded.
pub(crate) fn transfer_len(width: GLsizei, rows: GLsizei, format: GLenum, ty: GLenum, alignment: GLint) -> usize {
    if width <= 0 || rows <= 0 {
        return 0;
    }
    let row_bytes = width as usize * transfer_pixel_size(format, ty) as usize;
    align_up(row_bytes, alignment) * (rows as usize - 1) + row_bytes
}

/// GL entry points, one method per call. Arguments follow the GL names.
#[allow(clippy::too_many_arguments)]
pub trait GlApi {
    // ---- Queries
    fn get_error(&self) -> GLenum;
    fn get_string(&self, name: GLenum) -> String;
    fn get_integer(&self, pname: GLenum) -> GLint;
    fn get_color_mask(&self) -> [bool; 4];
    fn get_depth_mask(&self) -> bool;
    fn finish(&self);
    fn flush(&self);

    // ---- Textures
    fn gen_texture(&self) -> GLuint;
    fn delete_texture(&self, texture: GLuint);
    fn active_texture(&self, unit: GLenum);
    fn bind_texture(&self, target: GLenum, texture: GLuint);
    fn tex_parameter_i(&self, target: GLenum, pname: GLenum, value: GLint);
    fn tex_parameter_f(&self, target: GLenum, pname: GLenum, value: f32);
    fn tex_parameter_fv(&self, target: GLenum, pname: GLenum, value: &[f32; 4]);
    fn tex_image_1d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>);
    fn tex_image_2d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>);
    fn tex_image_3d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, height: GLsizei, depth: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>);
    fn compressed_tex_image_2d(&self, target: GLenum, level: GLint, internal_format: GLenum, width: GLsizei, height: GLsizei, data: &[u8]);
    fn tex_sub_image_2d(&self, target: GLenum, level: GLint, x: GLint, y: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>);
    fn pixel_store_i(&self, pname: GLenum, value: GLint);

    // ---- Renderbuffers / framebuffers
    fn gen_renderbuffer(&self) -> GLuint;
    fn delete_renderbuffer(&self, renderbuffer: GLuint);
    fn bind_renderbuffer(&self, renderbuffer: GLuint);
    fn renderbuffer_storage(&self, internal_format: GLenum, width: GLsizei, height: GLsizei);
    fn gen_framebuffer(&self) -> GLuint;
    fn delete_framebuffer(&self, framebuffer: GLuint);
    fn bind_framebuffer(&self, target: GLenum, framebuffer: GLuint);
    fn framebuffer_texture_1d(&self, target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint);
    fn framebuffer_texture_2d(&self, target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint);
    fn framebuffer_texture_layer(&self, target: GLenum, attachment: GLenum, texture: GLuint, level: GLint, layer: GLint);
    fn framebuffer_renderbuffer(&self, target: GLenum, attachment: GLenum, renderbuffer: GLuint);
    fn check_framebuffer_status(&self, target: GLenum) -> GLenum;
    fn draw_buffer(&self, buffer: GLenum);
    fn draw_buffers(&self, buffers: &[GLenum]);
    fn blit_framebuffer(&self, src: [GLint; 4], dst: [GLint; 4], mask: GLbitfield, filter: GLenum);
    fn read_pixels(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, dest: PixelPack<'_>);

    // ---- Buffers
    fn gen_buffer(&self) -> GLuint;
    fn delete_buffer(&self, buffer: GLuint);
    fn bind_buffer(&self, target: GLenum, buffer: GLuint);
    fn bind_buffer_range(&self, target: GLenum, index: GLuint, buffer: GLuint, offset: usize, size: usize);
    fn buffer_data(&self, target: GLenum, size: usize, data: Option<&[u8]>, usage: GLenum);
    fn buffer_sub_data(&self, target: GLenum, offset: usize, data: &[u8]);
    /// Null on failure.
    fn map_buffer_range(&self, target: GLenum, offset: usize, length: usize, access: GLbitfield) -> *mut u8;
    fn unmap_buffer(&self, target: GLenum) -> bool;

    // ---- Vertex input
    fn gen_vertex_array(&self) -> GLuint;
    fn delete_vertex_array(&self, vao: GLuint);
    fn bind_vertex_array(&self, vao: GLuint);
    fn enable_vertex_attrib_array(&self, index: GLuint);
    fn disable_vertex_attrib_array(&self, index: GLuint);
    fn vertex_attrib_pointer(&self, index: GLuint, size: GLint, ty: GLenum, normalized: bool, stride: GLsizei, offset: usize);
    fn vertex_attrib_i_pointer(&self, index: GLuint, size: GLint, ty: GLenum, stride: GLsizei, offset: usize);

    // ---- Fixed-function state
    fn enable(&self, cap: GLenum);
    fn disable(&self, cap: GLenum);
    fn color_mask(&self, r: bool, g: bool, b: bool, a: bool);
    fn depth_mask(&self, enabled: bool);
    fn depth_func(&self, func: GLenum);
    fn stencil_func_separate(&self, face: GLenum, func: GLenum, reference: GLint, mask: GLuint);
    fn stencil_op_separate(&self, face: GLenum, sfail: GLenum, dpfail: GLenum, dppass: GLenum);
    fn stencil_mask_separate(&self, face: GLenum, mask: GLuint);
    fn blend_equation_separate(&self, mode_rgb: GLenum, mode_alpha: GLenum);
    fn blend_func_separate(&self, src_rgb: GLenum, dst_rgb: GLenum, src_alpha: GLenum, dst_alpha: GLenum);
    fn blend_color(&self, color: [f32; 4]);
    fn front_face(&self, mode: GLenum);
    fn cull_face(&self, mode: GLenum);
    fn polygon_mode(&self, face: GLenum, mode: GLenum);
    fn polygon_offset(&self, factor: f32, units: f32);
    fn clear_color(&self, color: [f32; 4]);
    fn clear_depth(&self, depth: f32);
    fn clear_stencil(&self, stencil: GLint);
    fn clear(&self, mask: GLbitfield);
    fn viewport(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei);
    fn scissor(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei);
    fn depth_range(&self, near: f32, far: f32);

    // ---- Programs
    fn create_shader(&self, ty: GLenum) -> GLuint;
    fn shader_source(&self, shader: GLuint, source: &str);
    fn compile_shader(&self, shader: GLuint);
    fn shader_compile_status(&self, shader: GLuint) -> bool;
    fn shader_info_log(&self, shader: GLuint) -> String;
    fn delete_shader(&self, shader: GLuint);
    fn create_program(&self) -> GLuint;
    fn attach_shader(&self, program: GLuint, shader: GLuint);
    fn bind_attrib_location(&self, program: GLuint, index: GLuint, name: &str);
    fn link_program(&self, program: GLuint);
    fn program_link_status(&self, program: GLuint) -> bool;
    fn program_info_log(&self, program: GLuint) -> String;
    fn delete_program(&self, program: GLuint);
    fn use_program(&self, program: GLuint);
    fn get_uniform_location(&self, program: GLuint, name: &str) -> GLint;
    fn uniform_1i(&self, location: GLint, value: GLint);
    fn uniform_1fv(&self, location: GLint, values: &[f32]);
    fn uniform_2fv(&self, location: GLint, values: &[f32]);
    fn uniform_3fv(&self, location: GLint, values: &[f32]);
    fn uniform_4fv(&self, location: GLint, values: &[f32]);
    fn uniform_1iv(&self, location: GLint, values: &[i32]);
    fn uniform_matrix_4fv(&self, location: GLint, values: &[f32]);

    // ---- Draws
    fn draw_arrays(&self, mode: GLenum, first: GLint, count: GLsizei);
    fn draw_elements_base_vertex(&self, mode: GLenum, count: GLsizei, ty: GLenum, offset: usize, base_vertex: GLint);
    fn draw_arrays_instanced(&self, mode: GLenum, first: GLint, count: GLsizei, instances: GLsizei);
    fn draw_elements_instanced_base_vertex(&self, mode: GLenum, count: GLsizei, ty: GLenum, offset: usize, instances: GLsizei, base_vertex: GLint);
    fn draw_arrays_indirect(&self, mode: GLenum, offset: usize);
    fn draw_elements_indirect(&self, mode: GLenum, ty: GLenum, offset: usize);
    fn dispatch_compute(&self, x: GLuint, y: GLuint, z: GLuint);
    fn dispatch_compute_indirect(&self, offset: usize);

    // ---- Debug
    fn push_debug_group(&self, name: &str);
    fn pop_debug_group(&self);
}

/// Check `glGetError` after `call`.
///
/// Only active in debug builds, matching the cost profile of the driver's
/// own validation.
pub fn check_error(api: &impl GlApi, call: &'static str) -> anyhow::Result<()> {
    if cfg!(debug_assertions) {
        let code = api.get_error();
        if code != gl::NO_ERROR {
            return Err(gfx_core::GraphicsError::Native { call, code }.into());
        }
    }
    Ok(())
}

//! [`GlApi`] over the real driver through the `gl` crate.

use std::ffi::{c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use gl::types::{GLbitfield, GLboolean, GLchar, GLenum, GLint, GLsizei, GLuint};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::api::{transfer_len, GlApi, PixelData, PixelPack};

static GL_LOADED: OnceCell<bool> = OnceCell::new();

/// Driver-backed GL. Calls are only valid while a context is current on
/// the calling thread; the device guarantees that between `begin`/`end`.
///
/// Transfers whose client slice is too short for the pixel rectangle are
/// not issued; the next `get_error` reports `GL_INVALID_OPERATION`.
#[derive(Debug)]
pub struct NativeGl {
    rejected: AtomicU32,
}

impl NativeGl {
    /// Load GL function pointers through `gl_loader`, exactly once per process.
    pub fn load() -> Result<Self> {
        let loaded = *GL_LOADED.get_or_init(|| {
            gl_loader::init_gl();
            gl::load_with(|s| gl_loader::get_proc_address(s).cast());
            let loaded = gl::GetString::is_loaded() && gl::Clear::is_loaded();
            debug!(loaded, "GL function pointers loaded");
            loaded
        });
        if !loaded {
            anyhow::bail!("failed to load OpenGL entry points");
        }
        Ok(Self {
            rejected: AtomicU32::new(gl::NO_ERROR),
        })
    }

    /// A client slice in `data` holds the whole `width` x `rows` upload.
    fn unpack_fits(&self, data: &PixelData<'_>, width: GLsizei, rows: GLsizei, format: GLenum, ty: GLenum) -> bool {
        let PixelData::Slice(bytes) = data else {
            return true;
        };
        let needed = transfer_len(width, rows, format, ty, self.get_integer(gl::UNPACK_ALIGNMENT));
        if bytes.len() < needed {
            self.reject("texture upload", bytes.len(), needed);
            return false;
        }
        true
    }

    fn reject(&self, call: &str, len: usize, needed: usize) {
        warn!(call, len, needed, "client memory too short for the pixel transfer");
        self.rejected.store(gl::INVALID_OPERATION, Ordering::Relaxed);
    }
}

fn gl_bool(value: bool) -> GLboolean {
    if value {
        gl::TRUE
    } else {
        gl::FALSE
    }
}

fn pixel_ptr(data: PixelData<'_>) -> *const c_void {
    match data {
        PixelData::None => ptr::null(),
        PixelData::Slice(bytes) => bytes.as_ptr().cast(),
        PixelData::UnpackBuffer(offset) => offset as *const c_void,
    }
}

fn c_string(s: &str) -> CString {
    // Interior NULs cannot name a GL symbol; truncate at the first one.
    let end = s.find('\0').unwrap_or(s.len());
    CString::new(&s[..end]).unwrap_or_default()
}

fn info_log(len: GLint, fetch: impl FnOnce(GLsizei, *mut GLsizei, *mut GLchar)) -> String {
    let mut buffer = vec![0u8; len.max(1) as usize];
    let mut written: GLsizei = 0;
    fetch(buffer.len() as GLsizei, &mut written, buffer.as_mut_ptr().cast());
    buffer.truncate(written.max(0) as usize);
    String::from_utf8_lossy(&buffer).into_owned()
}

// Every method below is a thin unsafe forward to the driver. The caller
// (the device) guarantees the context is current on this thread.
impl GlApi for NativeGl {
    fn get_error(&self) -> GLenum {
        match self.rejected.swap(gl::NO_ERROR, Ordering::Relaxed) {
            gl::NO_ERROR => unsafe { gl::GetError() },
            error => error,
        }
    }

    fn get_string(&self, name: GLenum) -> String {
        unsafe {
            let raw = gl::GetString(name);
            if raw.is_null() {
                return String::new();
            }
            CStr::from_ptr(raw.cast()).to_string_lossy().into_owned()
        }
    }

    fn get_integer(&self, pname: GLenum) -> GLint {
        let mut value = 0;
        unsafe { gl::GetIntegerv(pname, &mut value) };
        value
    }

    fn get_color_mask(&self) -> [bool; 4] {
        let mut mask = [gl::FALSE; 4];
        unsafe { gl::GetBooleanv(gl::COLOR_WRITEMASK, mask.as_mut_ptr()) };
        mask.map(|m| m == gl::TRUE)
    }

    fn get_depth_mask(&self) -> bool {
        let mut mask = gl::FALSE;
        unsafe { gl::GetBooleanv(gl::DEPTH_WRITEMASK, &mut mask) };
        mask == gl::TRUE
    }

    fn finish(&self) {
        unsafe { gl::Finish() }
    }

    fn flush(&self) {
        unsafe { gl::Flush() }
    }

    fn gen_texture(&self) -> GLuint {
        let mut id = 0;
        unsafe { gl::GenTextures(1, &mut id) };
        id
    }

    fn delete_texture(&self, texture: GLuint) {
        unsafe { gl::DeleteTextures(1, &texture) }
    }

    fn active_texture(&self, unit: GLenum) {
        unsafe { gl::ActiveTexture(unit) }
    }

    fn bind_texture(&self, target: GLenum, texture: GLuint) {
        unsafe { gl::BindTexture(target, texture) }
    }

    fn tex_parameter_i(&self, target: GLenum, pname: GLenum, value: GLint) {
        unsafe { gl::TexParameteri(target, pname, value) }
    }

    fn tex_parameter_f(&self, target: GLenum, pname: GLenum, value: f32) {
        unsafe { gl::TexParameterf(target, pname, value) }
    }

    fn tex_parameter_fv(&self, target: GLenum, pname: GLenum, value: &[f32; 4]) {
        unsafe { gl::TexParameterfv(target, pname, value.as_ptr()) }
    }

    fn tex_image_1d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        if !self.unpack_fits(&data, width, 1, format, ty) {
            return;
        }
        unsafe { gl::TexImage1D(target, level, internal_format, width, 0, format, ty, pixel_ptr(data)) }
    }

    fn tex_image_2d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        if !self.unpack_fits(&data, width, height, format, ty) {
            return;
        }
        unsafe { gl::TexImage2D(target, level, internal_format, width, height, 0, format, ty, pixel_ptr(data)) }
    }

    fn tex_image_3d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, height: GLsizei, depth: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        if !self.unpack_fits(&data, width, height.saturating_mul(depth), format, ty) {
            return;
        }
        unsafe {
            gl::TexImage3D(target, level, internal_format, width, height, depth, 0, format, ty, pixel_ptr(data))
        }
    }

    fn compressed_tex_image_2d(&self, target: GLenum, level: GLint, internal_format: GLenum, width: GLsizei, height: GLsizei, data: &[u8]) {
        unsafe {
            gl::CompressedTexImage2D(
                target,
                level,
                internal_format,
                width,
                height,
                0,
                data.len() as GLsizei,
                data.as_ptr().cast(),
            )
        }
    }

    fn tex_sub_image_2d(&self, target: GLenum, level: GLint, x: GLint, y: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        if !self.unpack_fits(&data, width, height, format, ty) {
            return;
        }
        unsafe { gl::TexSubImage2D(target, level, x, y, width, height, format, ty, pixel_ptr(data)) }
    }

    fn pixel_store_i(&self, pname: GLenum, value: GLint) {
        unsafe { gl::PixelStorei(pname, value) }
    }

    fn gen_renderbuffer(&self) -> GLuint {
        let mut id = 0;
        unsafe { gl::GenRenderbuffers(1, &mut id) };
        id
    }

    fn delete_renderbuffer(&self, renderbuffer: GLuint) {
        unsafe { gl::DeleteRenderbuffers(1, &renderbuffer) }
    }

    fn bind_renderbuffer(&self, renderbuffer: GLuint) {
        unsafe { gl::BindRenderbuffer(gl::RENDERBUFFER, renderbuffer) }
    }

    fn renderbuffer_storage(&self, internal_format: GLenum, width: GLsizei, height: GLsizei) {
        unsafe { gl::RenderbufferStorage(gl::RENDERBUFFER, internal_format, width, height) }
    }

    fn gen_framebuffer(&self) -> GLuint {
        let mut id = 0;
        unsafe { gl::GenFramebuffers(1, &mut id) };
        id
    }

    fn delete_framebuffer(&self, framebuffer: GLuint) {
        unsafe { gl::DeleteFramebuffers(1, &framebuffer) }
    }

    fn bind_framebuffer(&self, target: GLenum, framebuffer: GLuint) {
        unsafe { gl::BindFramebuffer(target, framebuffer) }
    }

    fn framebuffer_texture_1d(&self, target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint) {
        unsafe { gl::FramebufferTexture1D(target, attachment, textarget, texture, level) }
    }

    fn framebuffer_texture_2d(&self, target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint) {
        unsafe { gl::FramebufferTexture2D(target, attachment, textarget, texture, level) }
    }

    fn framebuffer_texture_layer(&self, target: GLenum, attachment: GLenum, texture: GLuint, level: GLint, layer: GLint) {
        unsafe { gl::FramebufferTextureLayer(target, attachment, texture, level, layer) }
    }

    fn framebuffer_renderbuffer(&self, target: GLenum, attachment: GLenum, renderbuffer: GLuint) {
        unsafe { gl::FramebufferRenderbuffer(target, attachment, gl::RENDERBUFFER, renderbuffer) }
    }

    fn check_framebuffer_status(&self, target: GLenum) -> GLenum {
        unsafe { gl::CheckFramebufferStatus(target) }
    }

    fn draw_buffer(&self, buffer: GLenum) {
        unsafe { gl::DrawBuffer(buffer) }
    }

    fn draw_buffers(&self, buffers: &[GLenum]) {
        unsafe { gl::DrawBuffers(buffers.len() as GLsizei, buffers.as_ptr()) }
    }

    fn blit_framebuffer(&self, src: [GLint; 4], dst: [GLint; 4], mask: GLbitfield, filter: GLenum) {
        unsafe {
            gl::BlitFramebuffer(
                src[0], src[1], src[2], src[3], dst[0], dst[1], dst[2], dst[3], mask, filter,
            )
        }
    }

    fn read_pixels(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, dest: PixelPack<'_>) {
        let ptr: *mut c_void = match dest {
            PixelPack::Slice(bytes) => {
                let needed = transfer_len(width, height, format, ty, self.get_integer(gl::PACK_ALIGNMENT));
                if bytes.len() < needed {
                    return self.reject("glReadPixels", bytes.len(), needed);
                }
                bytes.as_mut_ptr().cast()
            }
            PixelPack::PackBuffer(offset) => offset as *mut c_void,
        };
        unsafe { gl::ReadPixels(x, y, width, height, format, ty, ptr) }
    }

    fn gen_buffer(&self) -> GLuint {
        let mut id = 0;
        unsafe { gl::GenBuffers(1, &mut id) };
        id
    }

    fn delete_buffer(&self, buffer: GLuint) {
        unsafe { gl::DeleteBuffers(1, &buffer) }
    }

    fn bind_buffer(&self, target: GLenum, buffer: GLuint) {
        unsafe { gl::BindBuffer(target, buffer) }
    }

    fn bind_buffer_range(&self, target: GLenum, index: GLuint, buffer: GLuint, offset: usize, size: usize) {
        unsafe { gl::BindBufferRange(target, index, buffer, offset as isize, size as isize) }
    }

    fn buffer_data(&self, target: GLenum, size: usize, data: Option<&[u8]>, usage: GLenum) {
        let ptr = data.map_or(ptr::null(), |d| d.as_ptr().cast());
        unsafe { gl::BufferData(target, size as isize, ptr, usage) }
    }

    fn buffer_sub_data(&self, target: GLenum, offset: usize, data: &[u8]) {
        unsafe { gl::BufferSubData(target, offset as isize, data.len() as isize, data.as_ptr().cast()) }
    }

    fn map_buffer_range(&self, target: GLenum, offset: usize, length: usize, access: GLbitfield) -> *mut u8 {
        unsafe { gl::MapBufferRange(target, offset as isize, length as isize, access).cast() }
    }

    fn unmap_buffer(&self, target: GLenum) -> bool {
        unsafe { gl::UnmapBuffer(target) == gl::TRUE }
    }

    fn gen_vertex_array(&self) -> GLuint {
        let mut id = 0;
        unsafe { gl::GenVertexArrays(1, &mut id) };
        id
    }

    fn delete_vertex_array(&self, vao: GLuint) {
        unsafe { gl::DeleteVertexArrays(1, &vao) }
    }

    fn bind_vertex_array(&self, vao: GLuint) {
        unsafe { gl::BindVertexArray(vao) }
    }

    fn enable_vertex_attrib_array(&self, index: GLuint) {
        unsafe { gl::EnableVertexAttribArray(index) }
    }

    fn disable_vertex_attrib_array(&self, index: GLuint) {
        unsafe { gl::DisableVertexAttribArray(index) }
    }

    fn vertex_attrib_pointer(&self, index: GLuint, size: GLint, ty: GLenum, normalized: bool, stride: GLsizei, offset: usize) {
        unsafe { gl::VertexAttribPointer(index, size, ty, gl_bool(normalized), stride, offset as *const c_void) }
    }

    fn vertex_attrib_i_pointer(&self, index: GLuint, size: GLint, ty: GLenum, stride: GLsizei, offset: usize) {
        unsafe { gl::VertexAttribIPointer(index, size, ty, stride, offset as *const c_void) }
    }

    fn enable(&self, cap: GLenum) {
        unsafe { gl::Enable(cap) }
    }

    fn disable(&self, cap: GLenum) {
        unsafe { gl::Disable(cap) }
    }

    fn color_mask(&self, r: bool, g: bool, b: bool, a: bool) {
        unsafe { gl::ColorMask(gl_bool(r), gl_bool(g), gl_bool(b), gl_bool(a)) }
    }

    fn depth_mask(&self, enabled: bool) {
        unsafe { gl::DepthMask(gl_bool(enabled)) }
    }

    fn depth_func(&self, func: GLenum) {
        unsafe { gl::DepthFunc(func) }
    }

    fn stencil_func_separate(&self, face: GLenum, func: GLenum, reference: GLint, mask: GLuint) {
        unsafe { gl::StencilFuncSeparate(face, func, reference, mask) }
    }

    fn stencil_op_separate(&self, face: GLenum, sfail: GLenum, dpfail: GLenum, dppass: GLenum) {
        unsafe { gl::StencilOpSeparate(face, sfail, dpfail, dppass) }
    }

    fn stencil_mask_separate(&self, face: GLenum, mask: GLuint) {
        unsafe { gl::StencilMaskSeparate(face, mask) }
    }

    fn blend_equation_separate(&self, mode_rgb: GLenum, mode_alpha: GLenum) {
        unsafe { gl::BlendEquationSeparate(mode_rgb, mode_alpha) }
    }

    fn blend_func_separate(&self, src_rgb: GLenum, dst_rgb: GLenum, src_alpha: GLenum, dst_alpha: GLenum) {
        unsafe { gl::BlendFuncSeparate(src_rgb, dst_rgb, src_alpha, dst_alpha) }
    }

    fn blend_color(&self, color: [f32; 4]) {
        unsafe { gl::BlendColor(color[0], color[1], color[2], color[3]) }
    }

    fn front_face(&self, mode: GLenum) {
        unsafe { gl::FrontFace(mode) }
    }

    fn cull_face(&self, mode: GLenum) {
        unsafe { gl::CullFace(mode) }
    }

    fn polygon_mode(&self, face: GLenum, mode: GLenum) {
        unsafe { gl::PolygonMode(face, mode) }
    }

    fn polygon_offset(&self, factor: f32, units: f32) {
        unsafe { gl::PolygonOffset(factor, units) }
    }

    fn clear_color(&self, color: [f32; 4]) {
        unsafe { gl::ClearColor(color[0], color[1], color[2], color[3]) }
    }

    fn clear_depth(&self, depth: f32) {
        unsafe { gl::ClearDepthf(depth) }
    }

    fn clear_stencil(&self, stencil: GLint) {
        unsafe { gl::ClearStencil(stencil) }
    }

    fn clear(&self, mask: GLbitfield) {
        unsafe { gl::Clear(mask) }
    }

    fn viewport(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei) {
        unsafe { gl::Viewport(x, y, width, height) }
    }

    fn scissor(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei) {
        unsafe { gl::Scissor(x, y, width, height) }
    }

    fn depth_range(&self, near: f32, far: f32) {
        unsafe { gl::DepthRangef(near, far) }
    }

    fn create_shader(&self, ty: GLenum) -> GLuint {
        unsafe { gl::CreateShader(ty) }
    }

    fn shader_source(&self, shader: GLuint, source: &str) {
        let ptr: *const GLchar = source.as_ptr().cast();
        let len = source.len() as GLint;
        unsafe { gl::ShaderSource(shader, 1, &ptr, &len) }
    }

    fn compile_shader(&self, shader: GLuint) {
        unsafe { gl::CompileShader(shader) }
    }

    fn shader_compile_status(&self, shader: GLuint) -> bool {
        let mut status = 0;
        unsafe { gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status) };
        status == gl::TRUE as GLint
    }

    fn shader_info_log(&self, shader: GLuint) -> String {
        let mut len = 0;
        unsafe { gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len) };
        info_log(len, |size, written, buf| unsafe { gl::GetShaderInfoLog(shader, size, written, buf) })
    }

    fn delete_shader(&self, shader: GLuint) {
        unsafe { gl::DeleteShader(shader) }
    }

    fn create_program(&self) -> GLuint {
        unsafe { gl::CreateProgram() }
    }

    fn attach_shader(&self, program: GLuint, shader: GLuint) {
        unsafe { gl::AttachShader(program, shader) }
    }

    fn bind_attrib_location(&self, program: GLuint, index: GLuint, name: &str) {
        let name = c_string(name);
        unsafe { gl::BindAttribLocation(program, index, name.as_ptr()) }
    }

    fn link_program(&self, program: GLuint) {
        unsafe { gl::LinkProgram(program) }
    }

    fn program_link_status(&self, program: GLuint) -> bool {
        let mut status = 0;
        unsafe { gl::GetProgramiv(program, gl::LINK_STATUS, &mut status) };
        status == gl::TRUE as GLint
    }

    fn program_info_log(&self, program: GLuint) -> String {
        let mut len = 0;
        unsafe { gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len) };
        info_log(len, |size, written, buf| unsafe { gl::GetProgramInfoLog(program, size, written, buf) })
    }

    fn delete_program(&self, program: GLuint) {
        unsafe { gl::DeleteProgram(program) }
    }

    fn use_program(&self, program: GLuint) {
        unsafe { gl::UseProgram(program) }
    }

    fn get_uniform_location(&self, program: GLuint, name: &str) -> GLint {
        let name = c_string(name);
        unsafe { gl::GetUniformLocation(program, name.as_ptr()) }
    }

    fn uniform_1i(&self, location: GLint, value: GLint) {
        unsafe { gl::Uniform1i(location, value) }
    }

    fn uniform_1fv(&self, location: GLint, values: &[f32]) {
        unsafe { gl::Uniform1fv(location, values.len() as GLsizei, values.as_ptr()) }
    }

    fn uniform_2fv(&self, location: GLint, values: &[f32]) {
        unsafe { gl::Uniform2fv(location, (values.len() / 2) as GLsizei, values.as_ptr()) }
    }

    fn uniform_3fv(&self, location: GLint, values: &[f32]) {
        unsafe { gl::Uniform3fv(location, (values.len() / 3) as GLsizei, values.as_ptr()) }
    }

    fn uniform_4fv(&self, location: GLint, values: &[f32]) {
        unsafe { gl::Uniform4fv(location, (values.len() / 4) as GLsizei, values.as_ptr()) }
    }

    fn uniform_1iv(&self, location: GLint, values: &[i32]) {
        unsafe { gl::Uniform1iv(location, values.len() as GLsizei, values.as_ptr()) }
    }

    fn uniform_matrix_4fv(&self, location: GLint, values: &[f32]) {
        unsafe { gl::UniformMatrix4fv(location, (values.len() / 16) as GLsizei, gl::FALSE, values.as_ptr()) }
    }

    fn draw_arrays(&self, mode: GLenum, first: GLint, count: GLsizei) {
        unsafe { gl::DrawArrays(mode, first, count) }
    }

    fn draw_elements_base_vertex(&self, mode: GLenum, count: GLsizei, ty: GLenum, offset: usize, base_vertex: GLint) {
        unsafe { gl::DrawElementsBaseVertex(mode, count, ty, offset as *const c_void, base_vertex) }
    }

    fn draw_arrays_instanced(&self, mode: GLenum, first: GLint, count: GLsizei, instances: GLsizei) {
        unsafe { gl::DrawArraysInstanced(mode, first, count, instances) }
    }

    fn draw_elements_instanced_base_vertex(&self, mode: GLenum, count: GLsizei, ty: GLenum, offset: usize, instances: GLsizei, base_vertex: GLint) {
        unsafe {
            gl::DrawElementsInstancedBaseVertex(mode, count, ty, offset as *const c_void, instances, base_vertex)
        }
    }

    fn draw_arrays_indirect(&self, mode: GLenum, offset: usize) {
        unsafe { gl::DrawArraysIndirect(mode, offset as *const c_void) }
    }

    fn draw_elements_indirect(&self, mode: GLenum, ty: GLenum, offset: usize) {
        unsafe { gl::DrawElementsIndirect(mode, ty, offset as *const c_void) }
    }

    fn dispatch_compute(&self, x: GLuint, y: GLuint, z: GLuint) {
        unsafe { gl::DispatchCompute(x, y, z) }
    }

    fn dispatch_compute_indirect(&self, offset: usize) {
        unsafe { gl::DispatchComputeIndirect(offset as isize) }
    }

    fn push_debug_group(&self, name: &str) {
        unsafe {
            gl::PushDebugGroup(
                gl::DEBUG_SOURCE_APPLICATION,
                0,
                name.len() as GLsizei,
                name.as_ptr().cast(),
            )
        }
    }

    fn pop_debug_group(&self) {
        unsafe { gl::PopDebugGroup() }
    }
}

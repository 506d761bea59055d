//! CPU implementation of [`GlApi`] and [`GlPlatform`].
//!
//! `SoftGl` keeps texture, renderbuffer, framebuffer and buffer storage in
//! memory and implements the operations the device layer depends on for
//! data flow: clears, pixel uploads, `ReadPixels` (including into pixel
//! pack buffers), blits and buffer mapping. Draws are counted, not
//! rasterized. Every entry point bumps a per-call counter so callers can
//! assert how many native calls a sequence produced.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use anyhow::{bail, Result};
use gl::types::{GLbitfield, GLenum, GLint, GLsizei, GLuint};
use parking_lot::Mutex;

use crate::api::{align_up, consts, transfer_len, transfer_pixel_size, GlApi, PixelData, PixelPack};
use crate::platform::{ContextId, GlPlatform};

/// Which GL flavor `SoftGl` reports through `glGetString`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftProfile {
    Desktop43,
    Es3,
    Es2,
}

#[derive(Debug, Clone)]
struct SoftImage {
    width: u32,
    height: u32,
    depth: u32,
    internal_format: GLenum,
    pixel_size: u32,
    data: Vec<u8>,
}

impl SoftImage {
    fn new(width: u32, height: u32, depth: u32, internal_format: GLenum, pixel_size: u32) -> Self {
        let len = (width * height * depth.max(1) * pixel_size) as usize;
        Self {
            width,
            height,
            depth: depth.max(1),
            internal_format,
            pixel_size,
            data: vec![0; len],
        }
    }

    fn texel_offset(&self, layer: u32, x: u32, y: u32) -> usize {
        (((layer * self.height + y) * self.width + x) * self.pixel_size) as usize
    }
}

#[derive(Debug, Default)]
struct SoftTexture {
    target: GLenum,
    images: HashMap<(GLenum, GLint), SoftImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    Texture {
        texture: GLuint,
        image_target: GLenum,
        level: GLint,
        layer: u32,
    },
    Renderbuffer(GLuint),
}

#[derive(Debug)]
struct SoftFramebuffer {
    attachments: HashMap<GLenum, Attachment>,
    draw_buffers: Vec<GLenum>,
}

impl Default for SoftFramebuffer {
    fn default() -> Self {
        Self {
            attachments: HashMap::new(),
            draw_buffers: vec![gl::COLOR_ATTACHMENT0],
        }
    }
}

/// Something a clear, read or blit touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Surface {
    WindowColor,
    WindowDepth,
    Attached(Attachment),
}

#[derive(Debug, Default)]
struct SoftBuffer {
    data: Vec<u8>,
    mapped: bool,
}

#[derive(Debug, Default)]
struct SoftShader {
    compiled: bool,
    log: String,
}

#[derive(Debug, Default)]
struct SoftProgram {
    shaders: Vec<GLuint>,
    linked: bool,
    uniforms: HashMap<String, GLint>,
}

struct SoftState {
    profile: SoftProfile,
    next_id: GLuint,
    textures: HashMap<GLuint, SoftTexture>,
    renderbuffers: HashMap<GLuint, Option<SoftImage>>,
    framebuffers: HashMap<GLuint, SoftFramebuffer>,
    buffers: HashMap<GLuint, SoftBuffer>,
    vertex_arrays: HashSet<GLuint>,
    shaders: HashMap<GLuint, SoftShader>,
    programs: HashMap<GLuint, SoftProgram>,

    active_unit: u32,
    bound_textures: HashMap<(u32, GLenum), GLuint>,
    bound_buffers: HashMap<GLenum, GLuint>,
    bound_renderbuffer: GLuint,
    draw_framebuffer: GLuint,
    read_framebuffer: GLuint,
    bound_vao: GLuint,
    program: GLuint,

    enabled: HashSet<GLenum>,
    color_mask: [bool; 4],
    depth_mask: bool,
    clear_color: [f32; 4],
    clear_depth: f32,
    clear_stencil: GLint,
    viewport: [GLint; 4],
    scissor: [GLint; 4],
    pack_alignment: GLint,
    unpack_alignment: GLint,

    window_color: SoftImage,
    window_depth: SoftImage,

    errors: Vec<GLenum>,
    calls: HashMap<&'static str, usize>,
}

impl SoftState {
    fn count(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
    }

    fn error(&mut self, code: GLenum) {
        self.errors.push(code);
    }

    fn alloc_id(&mut self) -> GLuint {
        self.next_id += 1;
        self.next_id
    }

    fn binding_target(target: GLenum) -> GLenum {
        if (gl::TEXTURE_CUBE_MAP_POSITIVE_X..=gl::TEXTURE_CUBE_MAP_NEGATIVE_Z).contains(&target) {
            gl::TEXTURE_CUBE_MAP
        } else {
            target
        }
    }

    fn bound_texture(&self, target: GLenum) -> GLuint {
        self.bound_textures
            .get(&(self.active_unit, Self::binding_target(target)))
            .copied()
            .unwrap_or(0)
    }

    fn bound_buffer(&self, target: GLenum) -> GLuint {
        self.bound_buffers.get(&target).copied().unwrap_or(0)
    }

    fn framebuffer_for(&self, target: GLenum) -> GLuint {
        if target == gl::READ_FRAMEBUFFER {
            self.read_framebuffer
        } else {
            self.draw_framebuffer
        }
    }

    fn attachment_image(&self, attachment: Attachment) -> Option<(&SoftImage, u32)> {
        match attachment {
            Attachment::Texture {
                texture,
                image_target,
                level,
                layer,
            } => self
                .textures
                .get(&texture)?
                .images
                .get(&(image_target, level))
                .map(|img| (img, layer)),
            Attachment::Renderbuffer(id) => self.renderbuffers.get(&id)?.as_ref().map(|img| (img, 0)),
        }
    }

    fn surface_image(&self, surface: Surface) -> Option<(&SoftImage, u32)> {
        match surface {
            Surface::WindowColor => Some((&self.window_color, 0)),
            Surface::WindowDepth => Some((&self.window_depth, 0)),
            Surface::Attached(attachment) => self.attachment_image(attachment),
        }
    }

    fn surface_image_mut(&mut self, surface: Surface) -> Option<(&mut SoftImage, u32)> {
        match surface {
            Surface::WindowColor => Some((&mut self.window_color, 0)),
            Surface::WindowDepth => Some((&mut self.window_depth, 0)),
            Surface::Attached(Attachment::Texture {
                texture,
                image_target,
                level,
                layer,
            }) => self
                .textures
                .get_mut(&texture)?
                .images
                .get_mut(&(image_target, level))
                .map(|img| (img, layer)),
            Surface::Attached(Attachment::Renderbuffer(id)) => {
                self.renderbuffers.get_mut(&id)?.as_mut().map(|img| (img, 0))
            }
        }
    }

    fn color_surfaces(&self, framebuffer: GLuint) -> Vec<Surface> {
        if framebuffer == 0 {
            return vec![Surface::WindowColor];
        }
        let Some(fb) = self.framebuffers.get(&framebuffer) else {
            return Vec::new();
        };
        fb.draw_buffers
            .iter()
            .filter_map(|buffer| fb.attachments.get(buffer).copied().map(Surface::Attached))
            .collect()
    }

    fn depth_stencil_surfaces(&self, framebuffer: GLuint) -> Vec<Surface> {
        if framebuffer == 0 {
            return vec![Surface::WindowDepth];
        }
        let Some(fb) = self.framebuffers.get(&framebuffer) else {
            return Vec::new();
        };
        let mut surfaces = Vec::new();
        for point in [
            gl::DEPTH_STENCIL_ATTACHMENT,
            gl::DEPTH_ATTACHMENT,
            gl::STENCIL_ATTACHMENT,
        ] {
            if let Some(attachment) = fb.attachments.get(&point) {
                let surface = Surface::Attached(*attachment);
                if !surfaces.contains(&surface) {
                    surfaces.push(surface);
                }
            }
        }
        surfaces
    }

    fn read_surface(&self, depth: bool) -> Option<Surface> {
        if depth {
            self.depth_stencil_surfaces(self.read_framebuffer).first().copied()
        } else if self.read_framebuffer == 0 {
            Some(Surface::WindowColor)
        } else {
            self.framebuffers
                .get(&self.read_framebuffer)?
                .attachments
                .get(&gl::COLOR_ATTACHMENT0)
                .copied()
                .map(Surface::Attached)
        }
    }

    fn scissor_rect(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        if !self.enabled.contains(&gl::SCISSOR_TEST) {
            return (0, 0, width, height);
        }
        let [x, y, w, h] = self.scissor;
        let x0 = x.clamp(0, width as GLint) as u32;
        let y0 = y.clamp(0, height as GLint) as u32;
        let x1 = (x + w).clamp(0, width as GLint) as u32;
        let y1 = (y + h).clamp(0, height as GLint) as u32;
        (x0, y0, x1, y1)
    }
}

fn is_depth_format(internal_format: GLenum) -> bool {
    matches!(
        internal_format,
        gl::DEPTH_COMPONENT
            | gl::DEPTH_COMPONENT16
            | gl::DEPTH_COMPONENT24
            | gl::DEPTH_COMPONENT32F
            | gl::DEPTH24_STENCIL8
            | gl::DEPTH32F_STENCIL8
            | gl::DEPTH_STENCIL
            | gl::STENCIL_INDEX8
    )
}

fn is_compressed_format(internal_format: GLenum) -> bool {
    matches!(
        internal_format,
        consts::COMPRESSED_RGBA_S3TC_DXT1_EXT
            | consts::COMPRESSED_RGBA_S3TC_DXT3_EXT
            | consts::COMPRESSED_RGBA_S3TC_DXT5_EXT
            | consts::COMPRESSED_SRGB_ALPHA_S3TC_DXT1_EXT
    )
}

/// Storage size of one texel for a (possibly unsized) internal format.
fn storage_pixel_size(internal_format: GLenum, ty: GLenum) -> u32 {
    match internal_format {
        gl::RGBA32F | gl::RGBA32UI => 16,
        gl::RGB32F => 12,
        gl::RGBA16F | gl::RGBA16 | gl::RG32F | gl::DEPTH32F_STENCIL8 => 8,
        gl::RG8 | gl::R16F | gl::R16 | gl::DEPTH_COMPONENT16 => 2,
        gl::R8 | gl::STENCIL_INDEX8 | consts::LUMINANCE | consts::ALPHA => 1,
        gl::RGBA | gl::DEPTH_COMPONENT | gl::DEPTH_STENCIL => match ty {
            gl::FLOAT if internal_format == gl::RGBA => 16,
            gl::HALF_FLOAT | consts::HALF_FLOAT_OES => 8,
            gl::UNSIGNED_SHORT => 2,
            _ => 4,
        },
        _ => 4,
    }
}

/// Clear value of one texel. Formats without an encoding clear to zero.
fn encode_color(internal_format: GLenum, color: [f32; 4], pixel_size: u32) -> Vec<u8> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    let [r, g, b, a] = color;
    match internal_format {
        gl::RGBA8 | gl::SRGB8_ALPHA8 | gl::RGBA | consts::SRGB_ALPHA_EXT if pixel_size == 4 => {
            vec![unorm(r), unorm(g), unorm(b), unorm(a)]
        }
        consts::BGRA8_EXT | gl::BGRA => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
        gl::R8 | consts::LUMINANCE => vec![unorm(r)],
        gl::RGBA32F => [r, g, b, a].iter().flat_map(|c| c.to_ne_bytes()).collect(),
        _ => vec![0; pixel_size as usize],
    }
}

/// Write depth and/or stencil into one packed 24/8 texel. Other depth
/// formats are left untouched.
fn encode_depth_stencil(internal_format: GLenum, texel: &mut [u8], depth: Option<f32>, stencil: Option<u8>) {
    if !matches!(internal_format, gl::DEPTH24_STENCIL8 | gl::DEPTH_STENCIL) || texel.len() < 4 {
        return;
    }
    let mut packed = u32::from_ne_bytes([texel[0], texel[1], texel[2], texel[3]]);
    if let Some(depth) = depth {
        packed = (((depth.clamp(0.0, 1.0) * 0xFF_FFFF as f32) as u32) << 8) | (packed & 0xFF);
    }
    if let Some(stencil) = stencil {
        packed = (packed & !0xFF) | u32::from(stencil);
    }
    texel[..4].copy_from_slice(&packed.to_ne_bytes());
}

/// Software GL device.
pub struct SoftGl {
    state: Mutex<SoftState>,
}

impl SoftGl {
    /// A desktop GL 4.3 device with a `width`x`height` window framebuffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_profile(SoftProfile::Desktop43, width, height)
    }

    pub fn with_profile(profile: SoftProfile, width: u32, height: u32) -> Self {
        Self {
            state: Mutex::new(SoftState {
                profile,
                next_id: 0,
                textures: HashMap::new(),
                renderbuffers: HashMap::new(),
                framebuffers: HashMap::new(),
                buffers: HashMap::new(),
                vertex_arrays: HashSet::new(),
                shaders: HashMap::new(),
                programs: HashMap::new(),
                active_unit: 0,
                bound_textures: HashMap::new(),
                bound_buffers: HashMap::new(),
                bound_renderbuffer: 0,
                draw_framebuffer: 0,
                read_framebuffer: 0,
                bound_vao: 0,
                program: 0,
                enabled: HashSet::from([gl::DITHER, gl::MULTISAMPLE]),
                color_mask: [true; 4],
                depth_mask: true,
                clear_color: [0.0; 4],
                clear_depth: 1.0,
                clear_stencil: 0,
                viewport: [0, 0, width as GLint, height as GLint],
                scissor: [0, 0, width as GLint, height as GLint],
                pack_alignment: 4,
                unpack_alignment: 4,
                window_color: SoftImage::new(width, height, 1, gl::RGBA8, 4),
                window_depth: SoftImage::new(width, height, 1, gl::DEPTH24_STENCIL8, 4),
                errors: Vec::new(),
                calls: HashMap::new(),
            }),
        }
    }

    /// Number of times `call` (a GL function name, e.g. `"glClear"`) was issued.
    pub fn call_count(&self, call: &str) -> usize {
        self.state.lock().calls.get(call).copied().unwrap_or(0)
    }

    pub fn reset_call_counts(&self) {
        self.state.lock().calls.clear();
    }

    /// RGBA8 texel of the window framebuffer, bottom-left origin.
    pub fn window_pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let s = self.state.lock();
        let offset = s.window_color.texel_offset(0, x, y);
        let mut texel = [0u8; 4];
        texel.copy_from_slice(&s.window_color.data[offset..offset + 4]);
        texel
    }

    /// Raw storage of a texture image (face target for cube maps).
    pub fn texture_image(&self, texture: GLuint, image_target: GLenum, level: GLint) -> Option<Vec<u8>> {
        let s = self.state.lock();
        Some(s.textures.get(&texture)?.images.get(&(image_target, level))?.data.clone())
    }

    pub fn is_framebuffer(&self, framebuffer: GLuint) -> bool {
        self.state.lock().framebuffers.contains_key(&framebuffer)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    pub fn draw_framebuffer_binding(&self) -> GLuint {
        self.state.lock().draw_framebuffer
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn buffer_contents(&self, buffer: GLuint) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }
}

impl GlApi for SoftGl {
    fn get_error(&self) -> GLenum {
        let mut s = self.state.lock();
        if s.errors.is_empty() {
            gl::NO_ERROR
        } else {
            s.errors.remove(0)
        }
    }

    fn get_string(&self, name: GLenum) -> String {
        let s = self.state.lock();
        match name {
            gl::VENDOR => "gfx".to_owned(),
            gl::RENDERER => "SoftGl".to_owned(),
            gl::VERSION => match s.profile {
                SoftProfile::Desktop43 => "4.3.0 SoftGl".to_owned(),
                SoftProfile::Es3 => "OpenGL ES 3.0 SoftGl".to_owned(),
                SoftProfile::Es2 => "OpenGL ES 2.0 SoftGl".to_owned(),
            },
            gl::EXTENSIONS => match s.profile {
                SoftProfile::Desktop43 => "GL_EXT_texture_filter_anisotropic GL_KHR_debug".to_owned(),
                SoftProfile::Es3 => "GL_EXT_texture_format_BGRA8888 GL_EXT_color_buffer_float".to_owned(),
                SoftProfile::Es2 => "GL_OES_packed_depth_stencil GL_OES_depth24 GL_OES_vertex_array_object GL_EXT_texture_format_BGRA8888 GL_EXT_texture_rg".to_owned(),
            },
            _ => String::new(),
        }
    }

    fn get_integer(&self, pname: GLenum) -> GLint {
        let s = self.state.lock();
        match pname {
            gl::MAX_TEXTURE_IMAGE_UNITS => 32,
            gl::MAX_COMBINED_TEXTURE_IMAGE_UNITS => 64,
            gl::MAX_COLOR_ATTACHMENTS | gl::MAX_DRAW_BUFFERS => 8,
            gl::MAX_VERTEX_ATTRIBS => 16,
            gl::MAX_TEXTURE_SIZE => 16384,
            gl::DRAW_FRAMEBUFFER_BINDING => s.draw_framebuffer as GLint,
            gl::READ_FRAMEBUFFER_BINDING => s.read_framebuffer as GLint,
            gl::CURRENT_PROGRAM => s.program as GLint,
            gl::VERTEX_ARRAY_BINDING => s.bound_vao as GLint,
            gl::ACTIVE_TEXTURE => (gl::TEXTURE0 + s.active_unit) as GLint,
            gl::PACK_ALIGNMENT => s.pack_alignment,
            gl::UNPACK_ALIGNMENT => s.unpack_alignment,
            _ => 0,
        }
    }

    fn get_color_mask(&self) -> [bool; 4] {
        self.state.lock().color_mask
    }

    fn get_depth_mask(&self) -> bool {
        self.state.lock().depth_mask
    }

    fn finish(&self) {
        self.state.lock().count("glFinish");
    }

    fn flush(&self) {
        self.state.lock().count("glFlush");
    }

    fn gen_texture(&self) -> GLuint {
        let mut s = self.state.lock();
        s.count("glGenTextures");
        let id = s.alloc_id();
        s.textures.insert(id, SoftTexture::default());
        id
    }

    fn delete_texture(&self, texture: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteTextures");
        s.textures.remove(&texture);
        s.bound_textures.retain(|_, bound| *bound != texture);
    }

    fn active_texture(&self, unit: GLenum) {
        let mut s = self.state.lock();
        s.count("glActiveTexture");
        s.active_unit = unit - gl::TEXTURE0;
    }

    fn bind_texture(&self, target: GLenum, texture: GLuint) {
        let mut s = self.state.lock();
        s.count("glBindTexture");
        if texture != 0 {
            match s.textures.get_mut(&texture) {
                Some(tex) if tex.target == 0 || tex.target == target => tex.target = target,
                _ => return s.error(gl::INVALID_OPERATION),
            }
        }
        let unit = s.active_unit;
        s.bound_textures.insert((unit, target), texture);
    }

    fn tex_parameter_i(&self, _target: GLenum, _pname: GLenum, _value: GLint) {
        self.state.lock().count("glTexParameteri");
    }

    fn tex_parameter_f(&self, _target: GLenum, _pname: GLenum, _value: f32) {
        self.state.lock().count("glTexParameterf");
    }

    fn tex_parameter_fv(&self, _target: GLenum, _pname: GLenum, _value: &[f32; 4]) {
        self.state.lock().count("glTexParameterfv");
    }

    fn tex_image_1d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        self.state.lock().count("glTexImage1D");
        self.store_image(target, level, internal_format as GLenum, width, 1, 1, format, ty, data);
    }

    fn tex_image_2d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        self.state.lock().count("glTexImage2D");
        self.store_image(target, level, internal_format as GLenum, width, height, 1, format, ty, data);
    }

    fn tex_image_3d(&self, target: GLenum, level: GLint, internal_format: GLint, width: GLsizei, height: GLsizei, depth: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        self.state.lock().count("glTexImage3D");
        self.store_image(target, level, internal_format as GLenum, width, height, depth, format, ty, data);
    }

    fn compressed_tex_image_2d(&self, target: GLenum, level: GLint, internal_format: GLenum, width: GLsizei, height: GLsizei, data: &[u8]) {
        let mut s = self.state.lock();
        s.count("glCompressedTexImage2D");
        let texture = s.bound_texture(target);
        let Some(tex) = s.textures.get_mut(&texture) else {
            return s.error(gl::INVALID_OPERATION);
        };
        let mut image = SoftImage::new(width as u32, height as u32, 1, internal_format, 0);
        image.data = data.to_vec();
        tex.images.insert((target, level), image);
    }

    fn tex_sub_image_2d(&self, target: GLenum, level: GLint, x: GLint, y: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        let mut s = self.state.lock();
        s.count("glTexSubImage2D");
        let source = match Self::unpack_source(&s, data) {
            Some(source) => source,
            None => return s.error(gl::INVALID_OPERATION),
        };
        if source.len() < transfer_len(width, height, format, ty, s.unpack_alignment) {
            return s.error(gl::INVALID_OPERATION);
        }
        let src_stride = align_up(width as usize * transfer_pixel_size(format, ty) as usize, s.unpack_alignment);
        let texture = s.bound_texture(target);
        let Some(image) = s
            .textures
            .get_mut(&texture)
            .and_then(|tex| tex.images.get_mut(&(target, level)))
        else {
            return s.error(gl::INVALID_OPERATION);
        };
        if x < 0 || y < 0 || (x + width) as u32 > image.width || (y + height) as u32 > image.height {
            return s.error(gl::INVALID_VALUE);
        }
        let row_bytes = width as usize * image.pixel_size as usize;
        for row in 0..height as u32 {
            let src = row as usize * src_stride;
            let dst = image.texel_offset(0, x as u32, y as u32 + row);
            image.data[dst..dst + row_bytes].copy_from_slice(&source[src..src + row_bytes]);
        }
    }

    fn pixel_store_i(&self, pname: GLenum, value: GLint) {
        let mut s = self.state.lock();
        s.count("glPixelStorei");
        match pname {
            gl::PACK_ALIGNMENT => s.pack_alignment = value,
            gl::UNPACK_ALIGNMENT => s.unpack_alignment = value,
            _ => {}
        }
    }

    fn gen_renderbuffer(&self) -> GLuint {
        let mut s = self.state.lock();
        s.count("glGenRenderbuffers");
        let id = s.alloc_id();
        s.renderbuffers.insert(id, None);
        id
    }

    fn delete_renderbuffer(&self, renderbuffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteRenderbuffers");
        s.renderbuffers.remove(&renderbuffer);
    }

    fn bind_renderbuffer(&self, renderbuffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glBindRenderbuffer");
        s.bound_renderbuffer = renderbuffer;
    }

    fn renderbuffer_storage(&self, internal_format: GLenum, width: GLsizei, height: GLsizei) {
        let mut s = self.state.lock();
        s.count("glRenderbufferStorage");
        let id = s.bound_renderbuffer;
        let size = storage_pixel_size(internal_format, gl::UNSIGNED_INT);
        match s.renderbuffers.get_mut(&id) {
            Some(slot) => *slot = Some(SoftImage::new(width as u32, height as u32, 1, internal_format, size)),
            None => s.error(gl::INVALID_OPERATION),
        }
    }

    fn gen_framebuffer(&self) -> GLuint {
        let mut s = self.state.lock();
        s.count("glGenFramebuffers");
        let id = s.alloc_id();
        s.framebuffers.insert(id, SoftFramebuffer::default());
        id
    }

    fn delete_framebuffer(&self, framebuffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteFramebuffers");
        if s.framebuffers.remove(&framebuffer).is_some() {
            if s.draw_framebuffer == framebuffer {
                s.draw_framebuffer = 0;
            }
            if s.read_framebuffer == framebuffer {
                s.read_framebuffer = 0;
            }
        }
    }

    fn bind_framebuffer(&self, target: GLenum, framebuffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glBindFramebuffer");
        if framebuffer != 0 && !s.framebuffers.contains_key(&framebuffer) {
            return s.error(gl::INVALID_OPERATION);
        }
        match target {
            gl::DRAW_FRAMEBUFFER => s.draw_framebuffer = framebuffer,
            gl::READ_FRAMEBUFFER => s.read_framebuffer = framebuffer,
            _ => {
                s.draw_framebuffer = framebuffer;
                s.read_framebuffer = framebuffer;
            }
        }
    }

    fn framebuffer_texture_1d(&self, target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint) {
        self.state.lock().count("glFramebufferTexture1D");
        self.attach(target, attachment, texture, |_| Attachment::Texture {
            texture,
            image_target: textarget,
            level,
            layer: 0,
        });
    }

    fn framebuffer_texture_2d(&self, target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint) {
        self.state.lock().count("glFramebufferTexture2D");
        self.attach(target, attachment, texture, |_| Attachment::Texture {
            texture,
            image_target: textarget,
            level,
            layer: 0,
        });
    }

    fn framebuffer_texture_layer(&self, target: GLenum, attachment: GLenum, texture: GLuint, level: GLint, layer: GLint) {
        self.state.lock().count("glFramebufferTextureLayer");
        self.attach(target, attachment, texture, |tex_target| Attachment::Texture {
            texture,
            image_target: tex_target,
            level,
            layer: layer as u32,
        });
    }

    fn framebuffer_renderbuffer(&self, target: GLenum, attachment: GLenum, renderbuffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glFramebufferRenderbuffer");
        let fb = s.framebuffer_for(target);
        match s.framebuffers.get_mut(&fb) {
            Some(framebuffer) if renderbuffer == 0 => {
                framebuffer.attachments.remove(&attachment);
            }
            Some(framebuffer) => {
                framebuffer.attachments.insert(attachment, Attachment::Renderbuffer(renderbuffer));
            }
            None => s.error(gl::INVALID_OPERATION),
        }
    }

    fn check_framebuffer_status(&self, target: GLenum) -> GLenum {
        let mut s = self.state.lock();
        s.count("glCheckFramebufferStatus");
        let fb = s.framebuffer_for(target);
        if fb == 0 {
            return gl::FRAMEBUFFER_COMPLETE;
        }
        let Some(framebuffer) = s.framebuffers.get(&fb) else {
            return gl::FRAMEBUFFER_UNDEFINED;
        };
        if framebuffer.attachments.is_empty() {
            return gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT;
        }
        for (point, attachment) in &framebuffer.attachments {
            let Some((image, layer)) = s.attachment_image(*attachment) else {
                return gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT;
            };
            let depth_point = matches!(
                *point,
                gl::DEPTH_ATTACHMENT | gl::STENCIL_ATTACHMENT | gl::DEPTH_STENCIL_ATTACHMENT
            );
            if depth_point != is_depth_format(image.internal_format)
                || is_compressed_format(image.internal_format)
                || layer >= image.depth
            {
                return gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT;
            }
        }
        gl::FRAMEBUFFER_COMPLETE
    }

    fn draw_buffer(&self, buffer: GLenum) {
        self.draw_buffers(&[buffer]);
    }

    fn draw_buffers(&self, buffers: &[GLenum]) {
        let mut s = self.state.lock();
        s.count("glDrawBuffers");
        let fb = s.draw_framebuffer;
        if let Some(framebuffer) = s.framebuffers.get_mut(&fb) {
            framebuffer.draw_buffers = buffers.iter().copied().filter(|b| *b != gl::NONE).collect();
        }
    }

    fn blit_framebuffer(&self, src: [GLint; 4], dst: [GLint; 4], mask: GLbitfield, _filter: GLenum) {
        let mut s = self.state.lock();
        s.count("glBlitFramebuffer");
        if mask & gl::COLOR_BUFFER_BIT == 0 {
            return;
        }
        let Some(source) = s.read_surface(false) else {
            return s.error(gl::INVALID_OPERATION);
        };
        let Some(dest) = s.color_surfaces(s.draw_framebuffer).first().copied() else {
            return s.error(gl::INVALID_OPERATION);
        };
        let Some((src_image, src_layer)) = s.surface_image(source).map(|(i, l)| (i.clone(), l)) else {
            return s.error(gl::INVALID_OPERATION);
        };
        let Some((dst_image, dst_layer)) = s.surface_image_mut(dest) else {
            return;
        };
        if src_image.pixel_size != dst_image.pixel_size {
            return s.error(gl::INVALID_OPERATION);
        }
        let px = src_image.pixel_size as usize;
        let (dx0, dx1) = (dst[0].min(dst[2]), dst[0].max(dst[2]));
        let (dy0, dy1) = (dst[1].min(dst[3]), dst[1].max(dst[3]));
        let src_w = (src[2] - src[0]) as f32;
        let src_h = (src[3] - src[1]) as f32;
        let dst_w = (dst[2] - dst[0]) as f32;
        let dst_h = (dst[3] - dst[1]) as f32;
        for y in dy0.max(0)..dy1.min(dst_image.height as GLint) {
            for x in dx0.max(0)..dx1.min(dst_image.width as GLint) {
                // Sample at the texel center, honoring flipped rectangles.
                let u = (x as f32 + 0.5 - dst[0] as f32) / dst_w;
                let v = (y as f32 + 0.5 - dst[1] as f32) / dst_h;
                let sx = (src[0] as f32 + u * src_w).floor() as GLint;
                let sy = (src[1] as f32 + v * src_h).floor() as GLint;
                if sx < 0 || sy < 0 || sx as u32 >= src_image.width || sy as u32 >= src_image.height {
                    continue;
                }
                let from = src_image.texel_offset(src_layer, sx as u32, sy as u32);
                let to = dst_image.texel_offset(dst_layer, x as u32, y as u32);
                dst_image.data[to..to + px].copy_from_slice(&src_image.data[from..from + px]);
            }
        }
    }

    fn read_pixels(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei, format: GLenum, ty: GLenum, dest: PixelPack<'_>) {
        let mut s = self.state.lock();
        s.count("glReadPixels");
        let depth = matches!(format, gl::DEPTH_COMPONENT | gl::DEPTH_STENCIL | gl::STENCIL_INDEX);
        let Some(surface) = s.read_surface(depth) else {
            return s.error(gl::INVALID_OPERATION);
        };
        let Some((image, layer)) = s.surface_image(surface).map(|(i, l)| (i.clone(), l)) else {
            return s.error(gl::INVALID_OPERATION);
        };
        let out_px = transfer_pixel_size(format, ty) as usize;
        let px = image.pixel_size as usize;
        let swap_rb = matches!(image.internal_format, consts::BGRA8_EXT | gl::BGRA) != (format == gl::BGRA);
        let float_out = ty == gl::FLOAT && format == gl::RGBA && px == 4 && !depth;
        if out_px != px && !float_out {
            return s.error(gl::INVALID_OPERATION);
        }
        let stride = align_up(width as usize * out_px, s.pack_alignment);
        let mut packed = vec![0u8; stride * height as usize];
        for row in 0..height.max(0) as u32 {
            for col in 0..width.max(0) as u32 {
                let (sx, sy) = (x as u32 + col, y as u32 + row);
                if sx >= image.width || sy >= image.height {
                    continue;
                }
                let from = image.texel_offset(layer, sx, sy);
                let to = row as usize * stride + col as usize * out_px;
                let texel = &image.data[from..from + px];
                if float_out {
                    for (c, byte) in texel.iter().enumerate() {
                        let value = f32::from(*byte) / 255.0;
                        packed[to + c * 4..to + c * 4 + 4].copy_from_slice(&value.to_ne_bytes());
                    }
                } else {
                    packed[to..to + px].copy_from_slice(texel);
                    if swap_rb && px == 4 && !depth {
                        packed.swap(to, to + 2);
                    }
                }
            }
        }
        let n = transfer_len(width, height, format, ty, s.pack_alignment);
        match dest {
            PixelPack::Slice(out) if out.len() >= n => out[..n].copy_from_slice(&packed[..n]),
            PixelPack::Slice(_) => s.error(gl::INVALID_OPERATION),
            PixelPack::PackBuffer(offset) => {
                let id = s.bound_buffer(gl::PIXEL_PACK_BUFFER);
                match s.buffers.get_mut(&id) {
                    Some(buffer) if offset + n <= buffer.data.len() => {
                        buffer.data[offset..offset + n].copy_from_slice(&packed[..n]);
                    }
                    _ => s.error(gl::INVALID_OPERATION),
                }
            }
        }
    }

    fn gen_buffer(&self) -> GLuint {
        let mut s = self.state.lock();
        s.count("glGenBuffers");
        let id = s.alloc_id();
        s.buffers.insert(id, SoftBuffer::default());
        id
    }

    fn delete_buffer(&self, buffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteBuffers");
        s.buffers.remove(&buffer);
        s.bound_buffers.retain(|_, bound| *bound != buffer);
    }

    fn bind_buffer(&self, target: GLenum, buffer: GLuint) {
        let mut s = self.state.lock();
        s.count("glBindBuffer");
        s.bound_buffers.insert(target, buffer);
    }

    fn bind_buffer_range(&self, _target: GLenum, _index: GLuint, _buffer: GLuint, _offset: usize, _size: usize) {
        self.state.lock().count("glBindBufferRange");
    }

    fn buffer_data(&self, target: GLenum, size: usize, data: Option<&[u8]>, _usage: GLenum) {
        let mut s = self.state.lock();
        s.count("glBufferData");
        let id = s.bound_buffer(target);
        match s.buffers.get_mut(&id) {
            Some(buffer) => {
                let mut storage = vec![0u8; size];
                if let Some(data) = data {
                    let n = data.len().min(size);
                    storage[..n].copy_from_slice(&data[..n]);
                }
                buffer.data = storage;
                buffer.mapped = false;
            }
            None => s.error(gl::INVALID_OPERATION),
        }
    }

    fn buffer_sub_data(&self, target: GLenum, offset: usize, data: &[u8]) {
        let mut s = self.state.lock();
        s.count("glBufferSubData");
        let id = s.bound_buffer(target);
        match s.buffers.get_mut(&id) {
            Some(buffer) if offset + data.len() <= buffer.data.len() => {
                buffer.data[offset..offset + data.len()].copy_from_slice(data);
            }
            _ => s.error(gl::INVALID_VALUE),
        }
    }

    fn map_buffer_range(&self, target: GLenum, offset: usize, length: usize, _access: GLbitfield) -> *mut u8 {
        let mut s = self.state.lock();
        s.count("glMapBufferRange");
        let id = s.bound_buffer(target);
        match s.buffers.get_mut(&id) {
            Some(buffer) if !buffer.mapped && offset + length <= buffer.data.len() => {
                buffer.mapped = true;
                // SAFETY: offset + length is within the allocation; the Vec
                // is not reallocated until the next glBufferData.
                unsafe { buffer.data.as_mut_ptr().add(offset) }
            }
            _ => {
                s.error(gl::INVALID_OPERATION);
                std::ptr::null_mut()
            }
        }
    }

    fn unmap_buffer(&self, target: GLenum) -> bool {
        let mut s = self.state.lock();
        s.count("glUnmapBuffer");
        let id = s.bound_buffer(target);
        match s.buffers.get_mut(&id) {
            Some(buffer) if buffer.mapped => {
                buffer.mapped = false;
                true
            }
            _ => {
                s.error(gl::INVALID_OPERATION);
                false
            }
        }
    }

    fn gen_vertex_array(&self) -> GLuint {
        let mut s = self.state.lock();
        s.count("glGenVertexArrays");
        let id = s.alloc_id();
        s.vertex_arrays.insert(id);
        id
    }

    fn delete_vertex_array(&self, vao: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteVertexArrays");
        s.vertex_arrays.remove(&vao);
    }

    fn bind_vertex_array(&self, vao: GLuint) {
        let mut s = self.state.lock();
        s.count("glBindVertexArray");
        s.bound_vao = vao;
    }

    fn enable_vertex_attrib_array(&self, _index: GLuint) {
        self.state.lock().count("glEnableVertexAttribArray");
    }

    fn disable_vertex_attrib_array(&self, _index: GLuint) {
        self.state.lock().count("glDisableVertexAttribArray");
    }

    fn vertex_attrib_pointer(&self, _index: GLuint, _size: GLint, _ty: GLenum, _normalized: bool, _stride: GLsizei, _offset: usize) {
        self.state.lock().count("glVertexAttribPointer");
    }

    fn vertex_attrib_i_pointer(&self, _index: GLuint, _size: GLint, _ty: GLenum, _stride: GLsizei, _offset: usize) {
        self.state.lock().count("glVertexAttribIPointer");
    }

    fn enable(&self, cap: GLenum) {
        let mut s = self.state.lock();
        s.count("glEnable");
        s.enabled.insert(cap);
    }

    fn disable(&self, cap: GLenum) {
        let mut s = self.state.lock();
        s.count("glDisable");
        s.enabled.remove(&cap);
    }

    fn color_mask(&self, r: bool, g: bool, b: bool, a: bool) {
        let mut s = self.state.lock();
        s.count("glColorMask");
        s.color_mask = [r, g, b, a];
    }

    fn depth_mask(&self, enabled: bool) {
        let mut s = self.state.lock();
        s.count("glDepthMask");
        s.depth_mask = enabled;
    }

    fn depth_func(&self, _func: GLenum) {
        self.state.lock().count("glDepthFunc");
    }

    fn stencil_func_separate(&self, _face: GLenum, _func: GLenum, _reference: GLint, _mask: GLuint) {
        self.state.lock().count("glStencilFuncSeparate");
    }

    fn stencil_op_separate(&self, _face: GLenum, _sfail: GLenum, _dpfail: GLenum, _dppass: GLenum) {
        self.state.lock().count("glStencilOpSeparate");
    }

    fn stencil_mask_separate(&self, _face: GLenum, _mask: GLuint) {
        self.state.lock().count("glStencilMaskSeparate");
    }

    fn blend_equation_separate(&self, _mode_rgb: GLenum, _mode_alpha: GLenum) {
        self.state.lock().count("glBlendEquationSeparate");
    }

    fn blend_func_separate(&self, _src_rgb: GLenum, _dst_rgb: GLenum, _src_alpha: GLenum, _dst_alpha: GLenum) {
        self.state.lock().count("glBlendFuncSeparate");
    }

    fn blend_color(&self, _color: [f32; 4]) {
        self.state.lock().count("glBlendColor");
    }

    fn front_face(&self, _mode: GLenum) {
        self.state.lock().count("glFrontFace");
    }

    fn cull_face(&self, _mode: GLenum) {
        self.state.lock().count("glCullFace");
    }

    fn polygon_mode(&self, _face: GLenum, _mode: GLenum) {
        self.state.lock().count("glPolygonMode");
    }

    fn polygon_offset(&self, _factor: f32, _units: f32) {
        self.state.lock().count("glPolygonOffset");
    }

    fn clear_color(&self, color: [f32; 4]) {
        let mut s = self.state.lock();
        s.count("glClearColor");
        s.clear_color = color;
    }

    fn clear_depth(&self, depth: f32) {
        let mut s = self.state.lock();
        s.count("glClearDepth");
        s.clear_depth = depth;
    }

    fn clear_stencil(&self, stencil: GLint) {
        let mut s = self.state.lock();
        s.count("glClearStencil");
        s.clear_stencil = stencil;
    }

    fn clear(&self, mask: GLbitfield) {
        let mut s = self.state.lock();
        s.count("glClear");
        let fb = s.draw_framebuffer;

        if mask & gl::COLOR_BUFFER_BIT != 0 {
            let color = s.clear_color;
            let write = s.color_mask;
            for surface in s.color_surfaces(fb) {
                let rect_source = s.surface_image(surface).map(|(img, _)| (img.width, img.height));
                let Some((w, h)) = rect_source else { continue };
                let (x0, y0, x1, y1) = s.scissor_rect(w, h);
                let Some((image, layer)) = s.surface_image_mut(surface) else { continue };
                let px = image.pixel_size as usize;
                let texel = encode_color(image.internal_format, color, image.pixel_size);
                let rgba_like = px == 4 && texel.len() == 4;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let at = image.texel_offset(layer, x, y);
                        let dst = &mut image.data[at..at + px];
                        if rgba_like && write != [true; 4] {
                            for (c, enabled) in write.iter().enumerate() {
                                if *enabled {
                                    dst[c] = texel[c];
                                }
                            }
                        } else if write.iter().any(|w| *w) {
                            dst.copy_from_slice(&texel[..px]);
                        }
                    }
                }
            }
        }

        if mask & (gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT) != 0 {
            let depth = (mask & gl::DEPTH_BUFFER_BIT != 0 && s.depth_mask).then_some(s.clear_depth);
            let stencil = (mask & gl::STENCIL_BUFFER_BIT != 0).then_some(s.clear_stencil as u8);
            for surface in s.depth_stencil_surfaces(fb) {
                let Some((w, h)) = s.surface_image(surface).map(|(img, _)| (img.width, img.height)) else {
                    continue;
                };
                let (x0, y0, x1, y1) = s.scissor_rect(w, h);
                let Some((image, layer)) = s.surface_image_mut(surface) else { continue };
                let px = image.pixel_size as usize;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let at = image.texel_offset(layer, x, y);
                        encode_depth_stencil(image.internal_format, &mut image.data[at..at + px], depth, stencil);
                    }
                }
            }
        }
    }

    fn viewport(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei) {
        let mut s = self.state.lock();
        s.count("glViewport");
        s.viewport = [x, y, width, height];
    }

    fn scissor(&self, x: GLint, y: GLint, width: GLsizei, height: GLsizei) {
        let mut s = self.state.lock();
        s.count("glScissor");
        s.scissor = [x, y, width, height];
    }

    fn depth_range(&self, _near: f32, _far: f32) {
        self.state.lock().count("glDepthRange");
    }

    fn create_shader(&self, _ty: GLenum) -> GLuint {
        let mut s = self.state.lock();
        s.count("glCreateShader");
        let id = s.alloc_id();
        s.shaders.insert(id, SoftShader::default());
        id
    }

    fn shader_source(&self, shader: GLuint, source: &str) {
        let mut s = self.state.lock();
        s.count("glShaderSource");
        if let Some(entry) = s.shaders.get_mut(&shader) {
            // `#error` is the one directive a real compiler always rejects.
            entry.log = if source.contains("#error") {
                "ERROR: 0:1: '#error' : user error".to_owned()
            } else {
                String::new()
            };
        }
    }

    fn compile_shader(&self, shader: GLuint) {
        let mut s = self.state.lock();
        s.count("glCompileShader");
        if let Some(entry) = s.shaders.get_mut(&shader) {
            entry.compiled = entry.log.is_empty();
        }
    }

    fn shader_compile_status(&self, shader: GLuint) -> bool {
        self.state.lock().shaders.get(&shader).is_some_and(|s| s.compiled)
    }

    fn shader_info_log(&self, shader: GLuint) -> String {
        self.state
            .lock()
            .shaders
            .get(&shader)
            .map(|s| s.log.clone())
            .unwrap_or_default()
    }

    fn delete_shader(&self, shader: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteShader");
        s.shaders.remove(&shader);
    }

    fn create_program(&self) -> GLuint {
        let mut s = self.state.lock();
        s.count("glCreateProgram");
        let id = s.alloc_id();
        s.programs.insert(id, SoftProgram::default());
        id
    }

    fn attach_shader(&self, program: GLuint, shader: GLuint) {
        let mut s = self.state.lock();
        s.count("glAttachShader");
        if let Some(p) = s.programs.get_mut(&program) {
            p.shaders.push(shader);
        }
    }

    fn bind_attrib_location(&self, _program: GLuint, _index: GLuint, _name: &str) {
        self.state.lock().count("glBindAttribLocation");
    }

    fn link_program(&self, program: GLuint) {
        let mut s = self.state.lock();
        s.count("glLinkProgram");
        let compiled = s
            .programs
            .get(&program)
            .map(|p| p.shaders.iter().all(|sh| s.shaders.get(sh).is_some_and(|e| e.compiled)))
            .unwrap_or(false);
        if let Some(p) = s.programs.get_mut(&program) {
            p.linked = compiled;
        }
    }

    fn program_link_status(&self, program: GLuint) -> bool {
        self.state.lock().programs.get(&program).is_some_and(|p| p.linked)
    }

    fn program_info_log(&self, _program: GLuint) -> String {
        String::new()
    }

    fn delete_program(&self, program: GLuint) {
        let mut s = self.state.lock();
        s.count("glDeleteProgram");
        s.programs.remove(&program);
    }

    fn use_program(&self, program: GLuint) {
        let mut s = self.state.lock();
        s.count("glUseProgram");
        s.program = program;
    }

    fn get_uniform_location(&self, program: GLuint, name: &str) -> GLint {
        let mut s = self.state.lock();
        let Some(p) = s.programs.get_mut(&program) else {
            return -1;
        };
        let next = p.uniforms.len() as GLint;
        *p.uniforms.entry(name.to_owned()).or_insert(next)
    }

    fn uniform_1i(&self, _location: GLint, _value: GLint) {
        self.state.lock().count("glUniform1i");
    }

    fn uniform_1fv(&self, _location: GLint, _values: &[f32]) {
        self.state.lock().count("glUniform1fv");
    }

    fn uniform_2fv(&self, _location: GLint, _values: &[f32]) {
        self.state.lock().count("glUniform2fv");
    }

    fn uniform_3fv(&self, _location: GLint, _values: &[f32]) {
        self.state.lock().count("glUniform3fv");
    }

    fn uniform_4fv(&self, _location: GLint, _values: &[f32]) {
        self.state.lock().count("glUniform4fv");
    }

    fn uniform_1iv(&self, _location: GLint, _values: &[i32]) {
        self.state.lock().count("glUniform1iv");
    }

    fn uniform_matrix_4fv(&self, _location: GLint, _values: &[f32]) {
        self.state.lock().count("glUniformMatrix4fv");
    }

    fn draw_arrays(&self, _mode: GLenum, _first: GLint, _count: GLsizei) {
        self.state.lock().count("glDrawArrays");
    }

    fn draw_elements_base_vertex(&self, _mode: GLenum, _count: GLsizei, _ty: GLenum, _offset: usize, _base_vertex: GLint) {
        self.state.lock().count("glDrawElementsBaseVertex");
    }

    fn draw_arrays_instanced(&self, _mode: GLenum, _first: GLint, _count: GLsizei, _instances: GLsizei) {
        self.state.lock().count("glDrawArraysInstanced");
    }

    fn draw_elements_instanced_base_vertex(&self, _mode: GLenum, _count: GLsizei, _ty: GLenum, _offset: usize, _instances: GLsizei, _base_vertex: GLint) {
        self.state.lock().count("glDrawElementsInstancedBaseVertex");
    }

    fn draw_arrays_indirect(&self, _mode: GLenum, _offset: usize) {
        self.state.lock().count("glDrawArraysIndirect");
    }

    fn draw_elements_indirect(&self, _mode: GLenum, _ty: GLenum, _offset: usize) {
        self.state.lock().count("glDrawElementsIndirect");
    }

    fn dispatch_compute(&self, _x: GLuint, _y: GLuint, _z: GLuint) {
        self.state.lock().count("glDispatchCompute");
    }

    fn dispatch_compute_indirect(&self, _offset: usize) {
        self.state.lock().count("glDispatchComputeIndirect");
    }

    fn push_debug_group(&self, _name: &str) {
        self.state.lock().count("glPushDebugGroup");
    }

    fn pop_debug_group(&self) {
        self.state.lock().count("glPopDebugGroup");
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

impl SoftGl {
    fn unpack_source(s: &SoftState, data: PixelData<'_>) -> Option<Vec<u8>> {
        match data {
            PixelData::None => Some(Vec::new()),
            PixelData::Slice(bytes) => Some(bytes.to_vec()),
            PixelData::UnpackBuffer(offset) => {
                let id = s.bound_buffer(gl::PIXEL_UNPACK_BUFFER);
                let buffer = s.buffers.get(&id)?;
                Some(buffer.data.get(offset..)?.to_vec())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn store_image(&self, target: GLenum, level: GLint, internal_format: GLenum, width: GLsizei, height: GLsizei, depth: GLsizei, format: GLenum, ty: GLenum, data: PixelData<'_>) {
        let mut s = self.state.lock();
        let Some(source) = Self::unpack_source(&s, data) else {
            return s.error(gl::INVALID_OPERATION);
        };
        if !source.is_empty() && source.len() < transfer_len(width, height * depth.max(1), format, ty, s.unpack_alignment) {
            return s.error(gl::INVALID_OPERATION);
        }
        let texture = s.bound_texture(target);
        let pixel_size = storage_pixel_size(internal_format, ty);
        let src_stride = align_up(width as usize * transfer_pixel_size(format, ty) as usize, s.unpack_alignment);
        let Some(tex) = s.textures.get_mut(&texture) else {
            return s.error(gl::INVALID_OPERATION);
        };
        let mut image = SoftImage::new(width as u32, height as u32, depth as u32, internal_format, pixel_size);
        if !source.is_empty() {
            let row_bytes = width as usize * pixel_size as usize;
            for row in 0..(height * depth.max(1)) as usize {
                let src = row * src_stride;
                let dst = row * row_bytes;
                if src + row_bytes > source.len() {
                    break;
                }
                image.data[dst..dst + row_bytes].copy_from_slice(&source[src..src + row_bytes]);
            }
        }
        tex.images.insert((target, level), image);
    }

    fn attach(&self, target: GLenum, attachment: GLenum, texture: GLuint, build: impl FnOnce(GLenum) -> Attachment) {
        let mut s = self.state.lock();
        let fb = s.framebuffer_for(target);
        let tex_target = s.textures.get(&texture).map(|t| t.target).unwrap_or(0);
        match s.framebuffers.get_mut(&fb) {
            Some(framebuffer) if texture == 0 => {
                framebuffer.attachments.remove(&attachment);
            }
            Some(framebuffer) => {
                framebuffer.attachments.insert(attachment, build(tex_target));
            }
            None => s.error(gl::INVALID_OPERATION),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// In-process stand-in for a windowing system's context API.
///
/// Enforces the real rule that a context is current on at most one thread.
pub struct SoftPlatform {
    main: ContextId,
    supports_shared: bool,
    next_context: AtomicU64,
    current: Mutex<HashMap<ThreadId, ContextId>>,
    window_size: (u32, u32),
    lost: AtomicBool,
    make_current_calls: AtomicUsize,
    unbind_calls: AtomicUsize,
    swaps: AtomicUsize,
}

impl SoftPlatform {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            main: ContextId(1),
            supports_shared: true,
            next_context: AtomicU64::new(2),
            current: Mutex::new(HashMap::new()),
            window_size: (width, height),
            lost: AtomicBool::new(false),
            make_current_calls: AtomicUsize::new(0),
            unbind_calls: AtomicUsize::new(0),
            swaps: AtomicUsize::new(0),
        }
    }

    /// A platform that cannot create shared contexts, forcing the
    /// main-thread creation fallback.
    pub fn without_shared_contexts(width: u32, height: u32) -> Self {
        Self {
            supports_shared: false,
            ..Self::new(width, height)
        }
    }

    pub fn make_current_calls(&self) -> usize {
        self.make_current_calls.load(Ordering::SeqCst)
    }

    pub fn unbind_calls(&self) -> usize {
        self.unbind_calls.load(Ordering::SeqCst)
    }

    pub fn swap_count(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }

    pub fn lose_context(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    pub fn restore_context(&self) {
        self.lost.store(false, Ordering::SeqCst);
    }
}

impl GlPlatform for SoftPlatform {
    fn main_context(&self) -> ContextId {
        self.main
    }

    fn create_shared_context(&self) -> Option<ContextId> {
        self.supports_shared
            .then(|| ContextId(self.next_context.fetch_add(1, Ordering::SeqCst)))
    }

    fn make_current(&self, context: Option<ContextId>) -> Result<()> {
        let me = thread::current().id();
        let mut current = self.current.lock();
        match context {
            Some(ctx) => {
                if current.iter().any(|(thread, bound)| *bound == ctx && *thread != me) {
                    bail!("context {ctx:?} is current on another thread");
                }
                self.make_current_calls.fetch_add(1, Ordering::SeqCst);
                current.insert(me, ctx);
            }
            None => {
                self.unbind_calls.fetch_add(1, Ordering::SeqCst);
                current.remove(&me);
            }
        }
        Ok(())
    }

    fn current_context(&self) -> Option<ContextId> {
        self.current.lock().get(&thread::current().id()).copied()
    }

    fn swap_buffers(&self) -> Result<()> {
        self.swaps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn window_size(&self) -> (u32, u32) {
        self.window_size
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_fbo(gl: &SoftGl, width: i32, height: i32) -> (GLuint, GLuint) {
        let tex = gl.gen_texture();
        gl.bind_texture(gl::TEXTURE_2D, tex);
        gl.tex_image_2d(gl::TEXTURE_2D, 0, gl::RGBA8 as GLint, width, height, gl::RGBA, gl::UNSIGNED_BYTE, PixelData::None);
        let fbo = gl.gen_framebuffer();
        gl.bind_framebuffer(gl::FRAMEBUFFER, fbo);
        gl.framebuffer_texture_2d(gl::FRAMEBUFFER, gl::COLOR_ATTACHMENT0, gl::TEXTURE_2D, tex, 0);
        (tex, fbo)
    }

    #[test]
    fn clear_fills_attached_texture() {
        let gl = SoftGl::new(4, 4);
        let (tex, _) = color_fbo(&gl, 2, 2);
        assert_eq!(gl.check_framebuffer_status(gl::FRAMEBUFFER), gl::FRAMEBUFFER_COMPLETE);
        gl.clear_color([1.0, 0.0, 0.0, 1.0]);
        gl.clear(gl::COLOR_BUFFER_BIT);
        let data = gl.texture_image(tex, gl::TEXTURE_2D, 0).unwrap();
        assert!(data.chunks(4).all(|p| p == [255, 0, 0, 255]));
    }

    #[test]
    fn color_mask_limits_clear() {
        let gl = SoftGl::new(2, 2);
        gl.clear_color([1.0, 1.0, 1.0, 1.0]);
        gl.color_mask(true, false, false, false);
        gl.clear(gl::COLOR_BUFFER_BIT);
        assert_eq!(gl.window_pixel(1, 1), [255, 0, 0, 0]);
    }

    #[test]
    fn empty_framebuffer_is_incomplete() {
        let gl = SoftGl::new(2, 2);
        let fbo = gl.gen_framebuffer();
        gl.bind_framebuffer(gl::FRAMEBUFFER, fbo);
        assert_eq!(
            gl.check_framebuffer_status(gl::FRAMEBUFFER),
            gl::FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT
        );
    }

    #[test]
    fn read_pixels_into_pack_buffer() {
        let gl = SoftGl::new(2, 2);
        let (_, _) = color_fbo(&gl, 2, 2);
        gl.clear_color([0.0, 1.0, 0.0, 1.0]);
        gl.clear(gl::COLOR_BUFFER_BIT);
        let pbo = gl.gen_buffer();
        gl.bind_buffer(gl::PIXEL_PACK_BUFFER, pbo);
        gl.buffer_data(gl::PIXEL_PACK_BUFFER, 16, None, gl::STREAM_READ);
        gl.read_pixels(0, 0, 2, 2, gl::RGBA, gl::UNSIGNED_BYTE, PixelPack::PackBuffer(0));
        let ptr = gl.map_buffer_range(gl::PIXEL_PACK_BUFFER, 0, 16, gl::MAP_READ_BIT);
        assert!(!ptr.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 16) };
        assert!(bytes.chunks(4).all(|p| p == [0, 255, 0, 255]));
        assert!(gl.unmap_buffer(gl::PIXEL_PACK_BUFFER));
    }

    #[test]
    fn short_client_memory_is_an_invalid_operation() {
        let gl = SoftGl::new(4, 4);
        let (tex, _) = color_fbo(&gl, 4, 4);
        gl.bind_texture(gl::TEXTURE_2D, tex);
        gl.tex_sub_image_2d(gl::TEXTURE_2D, 0, 0, 0, 4, 4, gl::RGBA, gl::UNSIGNED_BYTE, PixelData::Slice(&[9; 60]));
        assert_eq!(gl.get_error(), gl::INVALID_OPERATION);

        let mut out = [0u8; 63];
        gl.read_pixels(0, 0, 4, 4, gl::RGBA, gl::UNSIGNED_BYTE, PixelPack::Slice(&mut out));
        assert_eq!(gl.get_error(), gl::INVALID_OPERATION);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn unpadded_last_row_is_enough() {
        let gl = SoftGl::new(4, 4);
        let tex = gl.gen_texture();
        gl.bind_texture(gl::TEXTURE_2D, tex);
        // Rows of 3 bytes land 4 apart; the last row needs only 3.
        gl.tex_image_2d(gl::TEXTURE_2D, 0, gl::R8 as GLint, 3, 2, gl::RED, gl::UNSIGNED_BYTE, PixelData::Slice(&[1, 2, 3, 0, 4, 5, 6]));
        assert_eq!(gl.get_error(), gl::NO_ERROR);
    }

    #[test]
    fn depth_stencil_clear_packs_24_8() {
        let gl = SoftGl::new(1, 1);
        gl.clear_depth(1.0);
        gl.clear_stencil(3);
        gl.clear(gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT);
        let mut out = [0u8; 4];
        gl.read_pixels(0, 0, 1, 1, gl::DEPTH_STENCIL, gl::UNSIGNED_INT_24_8, PixelPack::Slice(&mut out));
        assert_eq!(u32::from_ne_bytes(out), (0xFF_FFFF << 8) | 3);
    }

    #[test]
    fn blit_copies_between_framebuffers() {
        let gl = SoftGl::new(2, 2);
        let (_, src) = color_fbo(&gl, 2, 2);
        gl.clear_color([0.0, 0.0, 1.0, 1.0]);
        gl.clear(gl::COLOR_BUFFER_BIT);
        gl.bind_framebuffer(gl::READ_FRAMEBUFFER, src);
        gl.bind_framebuffer(gl::DRAW_FRAMEBUFFER, 0);
        gl.blit_framebuffer([0, 0, 2, 2], [0, 0, 2, 2], gl::COLOR_BUFFER_BIT, gl::NEAREST);
        assert_eq!(gl.window_pixel(0, 1), [0, 0, 255, 255]);
    }

    #[test]
    fn context_cannot_be_current_on_two_threads() {
        let platform = std::sync::Arc::new(SoftPlatform::new(1, 1));
        platform.make_current(Some(platform.main_context())).unwrap();
        let other = platform.clone();
        let result = std::thread::spawn(move || other.make_current(Some(other.main_context())))
            .join()
            .unwrap();
        assert!(result.is_err());
    }
}

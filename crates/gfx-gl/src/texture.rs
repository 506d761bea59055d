//! GL textures, renderbuffers and their views.

use anyhow::Result;
use gfx_core::{
    DeviceChild, GraphicsError, GraphicsResourceUsage, Handle, LifetimeState, SamplerState,
    TextureDescription, TextureDimension, TextureFlags, TextureViewDescription,
};
use gl::types::{GLenum, GLint, GLsizei, GLuint};
use tracing::trace;

use crate::api::{GlApi, PixelData};
use crate::driver::GlDriver;
use crate::format::{convert_pixel_format, depth_renderbuffer_storage, GlFormat};

/// A texture, a depth renderbuffer, a view onto one of those, or the
/// window's default framebuffer.
///
/// Views share the parent's native names and never delete them.
#[derive(Debug)]
pub struct GlTexture {
    description: TextureDescription,
    view: TextureViewDescription,
    parent: Option<Handle<GlTexture>>,
    pub(crate) target: GLenum,
    pub(crate) texture_id: GLuint,
    /// Separate stencil renderbuffer, or `texture_id` for packed depth-stencil.
    pub(crate) stencil_id: GLuint,
    pub(crate) is_renderbuffer: bool,
    pub(crate) is_window: bool,
    pub(crate) gl_format: GlFormat,
    /// `PIXEL_PACK_BUFFER` for staging, `PIXEL_UNPACK_BUFFER` for dynamic.
    pub(crate) pixel_buffer: GLuint,
    /// CPU copy used instead of a pixel buffer on GL ES 2.
    pub(crate) staging_data: Option<Vec<u8>>,
    /// Frame of the last read into `pixel_buffer`.
    pub(crate) pixel_buffer_frame: u64,
    /// Sampler last applied to the native texture object.
    pub(crate) bound_sampler: Option<SamplerState>,
    pub(crate) row_pitch: u32,
    pub(crate) depth_pitch: u32,
    had_initial_data: bool,
    lifetime: LifetimeState,
}

impl GlTexture {
    /// Create the native storage for `description`.
    ///
    /// `initial_data` holds every subresource tightly packed, slice-major
    /// then by mip. Leaves texture unit bindings modified; callers must
    /// forget the shadowed binding of the active unit.
    pub fn create<A: GlApi>(
        gl: &GlDriver<A>,
        description: TextureDescription,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        let gl_format = convert_pixel_format(description.format, gl.caps())?;
        let (row_pitch, depth_pitch) = description.compute_pitch(0);
        let mut texture = Self {
            description,
            view: TextureViewDescription::default(),
            parent: None,
            target: texture_target(&description, gl.caps().is_es, gl.caps().is_es2)?,
            texture_id: 0,
            stencil_id: 0,
            is_renderbuffer: false,
            is_window: false,
            gl_format,
            pixel_buffer: 0,
            staging_data: None,
            pixel_buffer_frame: 0,
            bound_sampler: None,
            row_pitch,
            depth_pitch,
            had_initial_data: initial_data.is_some(),
            lifetime: LifetimeState::Active,
        };
        texture.allocate(gl, initial_data)?;
        Ok(texture)
    }

    /// The texture standing for the window's default framebuffer. It owns
    /// no native object.
    pub fn window(description: TextureDescription, gl_format: GlFormat) -> Self {
        let (row_pitch, depth_pitch) = description.compute_pitch(0);
        Self {
            description,
            view: TextureViewDescription::default(),
            parent: None,
            target: gl::TEXTURE_2D,
            texture_id: 0,
            stencil_id: 0,
            is_renderbuffer: false,
            is_window: true,
            gl_format,
            pixel_buffer: 0,
            staging_data: None,
            pixel_buffer_frame: 0,
            bound_sampler: None,
            row_pitch,
            depth_pitch,
            had_initial_data: false,
            lifetime: LifetimeState::Active,
        }
    }

    /// A view onto `parent`, which the device arena stores under
    /// `parent_handle`. Views of views resolve to the root texture.
    pub fn view(parent_handle: Handle<GlTexture>, parent: &GlTexture, view: TextureViewDescription) -> Self {
        let mut description = parent.description;
        if view.format != gfx_core::PixelFormat::None {
            description.format = view.format;
        }
        Self {
            description,
            view,
            parent: Some(parent.parent.unwrap_or(parent_handle)),
            target: parent.target,
            texture_id: parent.texture_id,
            stencil_id: parent.stencil_id,
            is_renderbuffer: parent.is_renderbuffer,
            is_window: parent.is_window,
            gl_format: parent.gl_format,
            pixel_buffer: parent.pixel_buffer,
            staging_data: None,
            pixel_buffer_frame: 0,
            bound_sampler: None,
            row_pitch: parent.row_pitch,
            depth_pitch: parent.depth_pitch,
            had_initial_data: false,
            lifetime: parent.lifetime,
        }
    }

    pub fn description(&self) -> &TextureDescription {
        &self.description
    }

    pub fn view_description(&self) -> &TextureViewDescription {
        &self.view
    }

    /// Root texture this view was created from.
    pub fn parent(&self) -> Option<Handle<GlTexture>> {
        self.parent
    }

    pub fn is_window(&self) -> bool {
        self.is_window
    }

    pub fn is_renderbuffer(&self) -> bool {
        self.is_renderbuffer
    }

    pub fn texture_id(&self) -> GLuint {
        self.texture_id
    }

    pub fn has_stencil(&self) -> bool {
        self.description.format.has_stencil()
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.description.is_depth_stencil()
    }

    pub fn width(&self) -> u32 {
        self.description.width
    }

    pub fn height(&self) -> u32 {
        self.description.height
    }

    /// Copy the native names of the parent after it was recreated.
    pub(crate) fn adopt_parent(&mut self, parent: &GlTexture) {
        self.texture_id = parent.texture_id;
        self.stencil_id = parent.stencil_id;
        self.pixel_buffer = parent.pixel_buffer;
        self.bound_sampler = None;
        self.lifetime = parent.lifetime;
    }

    /// Resize the window texture after the swap chain changed size.
    pub(crate) fn set_size(&mut self, width: u32, height: u32) {
        self.description.width = width;
        self.description.height = height;
        let (row_pitch, depth_pitch) = self.description.compute_pitch(0);
        self.row_pitch = row_pitch;
        self.depth_pitch = depth_pitch;
    }

    fn allocate<A: GlApi>(&mut self, gl: &GlDriver<A>, initial_data: Option<&[u8]>) -> Result<()> {
        let desc = self.description;
        let caps = gl.caps();

        if desc.is_depth_stencil() && !desc.is_shader_resource() {
            let storage = depth_renderbuffer_storage(desc.format, caps)?;
            let (width, height) = (desc.width as GLsizei, desc.height as GLsizei);

            self.texture_id = gl.gen_renderbuffer();
            gl.bind_renderbuffer(self.texture_id);
            gl.renderbuffer_storage(storage.depth, width, height);
            self.stencil_id = match storage.separate_stencil {
                Some(stencil_format) => {
                    let stencil = gl.gen_renderbuffer();
                    gl.bind_renderbuffer(stencil);
                    gl.renderbuffer_storage(stencil_format, width, height);
                    stencil
                }
                None if self.has_stencil() => self.texture_id,
                None => 0,
            };
            gl.bind_renderbuffer(0);
            self.is_renderbuffer = true;
            trace!(id = self.texture_id, format = ?desc.format, "created depth renderbuffer");
            return gl.check("create renderbuffer");
        }

        self.texture_id = gl.gen_texture();
        self.is_renderbuffer = false;
        gl.bind_texture(self.target, self.texture_id);

        if desc.flags.intersects(TextureFlags::RENDER_TARGET | TextureFlags::DEPTH_STENCIL) {
            gl.tex_parameter_i(self.target, gl::TEXTURE_MIN_FILTER, gl::NEAREST as GLint);
            gl.tex_parameter_i(self.target, gl::TEXTURE_MAG_FILTER, gl::NEAREST as GLint);
            gl.tex_parameter_i(self.target, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as GLint);
            gl.tex_parameter_i(self.target, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as GLint);
            self.bound_sampler = Some(SamplerState::POINT_CLAMP);
        } else if caps.is_es && desc.mip_levels <= 1 {
            gl.tex_parameter_i(self.target, gl::TEXTURE_MIN_FILTER, gl::NEAREST as GLint);
            gl.tex_parameter_i(self.target, gl::TEXTURE_MAG_FILTER, gl::LINEAR as GLint);
        }
        if !caps.is_es2 {
            gl.tex_parameter_i(self.target, gl::TEXTURE_BASE_LEVEL, 0);
            gl.tex_parameter_i(self.target, gl::TEXTURE_MAX_LEVEL, desc.mip_levels as GLint - 1);
        }

        if desc.is_depth_stencil() && self.has_stencil() {
            self.stencil_id = self.texture_id;
        }

        self.upload_all(gl, initial_data)?;
        gl.bind_texture(self.target, 0);

        self.create_pixel_buffer(gl);
        trace!(id = self.texture_id, target = self.target, format = ?desc.format, "created texture");
        gl.check("create texture")
    }

    /// Initial data is tightly packed, so rows are unpacked byte-aligned.
    fn upload_all<A: GlApi>(&self, gl: &GlDriver<A>, initial_data: Option<&[u8]>) -> Result<()> {
        if initial_data.is_none() {
            return self.upload_levels(gl, None);
        }
        let previous = gl.get_integer(gl::UNPACK_ALIGNMENT);
        gl.pixel_store_i(gl::UNPACK_ALIGNMENT, 1);
        let uploaded = self.upload_levels(gl, initial_data);
        gl.pixel_store_i(gl::UNPACK_ALIGNMENT, previous);
        uploaded
    }

    fn upload_levels<A: GlApi>(&self, gl: &GlDriver<A>, initial_data: Option<&[u8]>) -> Result<()> {
        let desc = &self.description;
        let f = self.gl_format;
        let subresource_size = |mip: u32| -> usize {
            let (_, slice_pitch) = desc.compute_pitch(mip);
            slice_pitch as usize * desc.mip_depth(mip) as usize
        };
        // Offsets of each (slice, mip) in the packed initial data.
        let offset_of = |slice: u32, mip: u32| -> usize {
            let per_slice: usize = (0..desc.mip_levels).map(subresource_size).sum();
            slice as usize * per_slice + (0..mip).map(subresource_size).sum::<usize>()
        };
        let chunk = |slice: u32, mip: u32| -> Option<&[u8]> {
            let data = initial_data?;
            let start = offset_of(slice, mip);
            data.get(start..start + subresource_size(mip))
        };

        match self.target {
            gl::TEXTURE_2D_ARRAY | gl::TEXTURE_3D => {
                for mip in 0..desc.mip_levels {
                    let (width, height) = (desc.mip_width(mip) as GLsizei, desc.mip_height(mip) as GLsizei);
                    let depth = if self.target == gl::TEXTURE_3D {
                        desc.mip_depth(mip)
                    } else {
                        desc.array_size
                    };
                    // All layers of one mip are uploaded together.
                    let gathered: Option<Vec<u8>> = initial_data.map(|_| {
                        (0..desc.array_size)
                            .filter_map(|slice| chunk(slice, mip))
                            .flatten()
                            .copied()
                            .collect()
                    });
                    let data = gathered.as_deref().map_or(PixelData::None, PixelData::Slice);
                    if f.compressed {
                        return Err(GraphicsError::unsupported("compressed volume or array textures").into());
                    }
                    gl.tex_image_3d(
                        self.target,
                        mip as GLint,
                        f.internal_format as GLint,
                        width,
                        height,
                        depth as GLsizei,
                        f.format,
                        f.ty,
                        data,
                    );
                }
            }
            gl::TEXTURE_1D => {
                for mip in 0..desc.mip_levels {
                    let data = chunk(0, mip).map_or(PixelData::None, PixelData::Slice);
                    gl.tex_image_1d(
                        self.target,
                        mip as GLint,
                        f.internal_format as GLint,
                        desc.mip_width(mip) as GLsizei,
                        f.format,
                        f.ty,
                        data,
                    );
                }
            }
            gl::TEXTURE_1D_ARRAY => {
                for mip in 0..desc.mip_levels {
                    let gathered: Option<Vec<u8>> = initial_data.map(|_| {
                        (0..desc.array_size)
                            .filter_map(|slice| chunk(slice, mip))
                            .flatten()
                            .copied()
                            .collect()
                    });
                    gl.tex_image_2d(
                        self.target,
                        mip as GLint,
                        f.internal_format as GLint,
                        desc.mip_width(mip) as GLsizei,
                        desc.array_size as GLsizei,
                        f.format,
                        f.ty,
                        gathered.as_deref().map_or(PixelData::None, PixelData::Slice),
                    );
                }
            }
            _ => {
                for slice in 0..desc.array_size {
                    let image_target = if self.target == gl::TEXTURE_CUBE_MAP {
                        gl::TEXTURE_CUBE_MAP_POSITIVE_X + slice
                    } else {
                        self.target
                    };
                    for mip in 0..desc.mip_levels {
                        let (width, height) = (desc.mip_width(mip) as GLsizei, desc.mip_height(mip) as GLsizei);
                        let data = chunk(slice, mip);
                        if f.compressed {
                            let fallback;
                            let bytes = match data {
                                Some(bytes) => bytes,
                                None => {
                                    fallback = vec![0u8; subresource_size(mip)];
                                    &fallback
                                }
                            };
                            gl.compressed_tex_image_2d(image_target, mip as GLint, f.internal_format, width, height, bytes);
                        } else {
                            gl.tex_image_2d(
                                image_target,
                                mip as GLint,
                                f.internal_format as GLint,
                                width,
                                height,
                                f.format,
                                f.ty,
                                data.map_or(PixelData::None, PixelData::Slice),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn create_pixel_buffer<A: GlApi>(&mut self, gl: &GlDriver<A>) {
        let es2 = gl.caps().is_es2;
        let (target, usage) = match self.description.usage {
            GraphicsResourceUsage::Staging => (gl::PIXEL_PACK_BUFFER, gl::STREAM_READ),
            GraphicsResourceUsage::Dynamic => (gl::PIXEL_UNPACK_BUFFER, gl::DYNAMIC_DRAW),
            _ => return,
        };
        if es2 {
            self.staging_data = Some(vec![0; self.depth_pitch as usize]);
            return;
        }
        self.pixel_buffer = gl.gen_buffer();
        gl.bind_buffer(target, self.pixel_buffer);
        gl.buffer_data(target, self.depth_pitch as usize, None, usage);
        gl.bind_buffer(target, 0);
    }

    fn release<A: GlApi>(&mut self, gl: &GlDriver<A>) {
        // Views and the window texture borrow names they do not own.
        if self.parent.is_none() && !self.is_window {
            if self.texture_id != 0 {
                if self.is_renderbuffer {
                    gl.delete_renderbuffer(self.texture_id);
                } else {
                    gl.delete_texture(self.texture_id);
                }
            }
            if self.stencil_id != 0 && self.stencil_id != self.texture_id {
                gl.delete_renderbuffer(self.stencil_id);
            }
            if self.pixel_buffer != 0 {
                gl.delete_buffer(self.pixel_buffer);
            }
        }
        self.texture_id = 0;
        self.stencil_id = 0;
        self.pixel_buffer = 0;
        self.staging_data = None;
        self.bound_sampler = None;
    }

    /// Delete the native objects for good.
    pub(crate) fn dispose<A: GlApi>(&mut self, gl: &GlDriver<A>) {
        self.release(gl);
        self.lifetime = LifetimeState::Disposed;
    }
}

impl<A: GlApi> DeviceChild<GlDriver<A>> for GlTexture {
    fn on_destroyed(&mut self, gl: &mut GlDriver<A>) {
        if self.lifetime == LifetimeState::Active {
            self.release(gl);
            self.lifetime = LifetimeState::Destroyed;
        }
    }

    fn on_recreate(&mut self, gl: &mut GlDriver<A>) -> Result<bool> {
        if self.lifetime != LifetimeState::Destroyed {
            return Ok(true);
        }
        // Views pick up the parent's names once the parent is back.
        if self.parent.is_some() || self.is_window {
            self.lifetime = LifetimeState::Active;
            return Ok(true);
        }
        self.allocate(gl, None)?;
        self.lifetime = LifetimeState::Active;
        Ok(!self.had_initial_data)
    }

    fn lifetime_state(&self) -> LifetimeState {
        self.lifetime
    }
}

fn texture_target(desc: &TextureDescription, is_es: bool, is_es2: bool) -> Result<GLenum> {
    let array = desc.array_size > 1;
    let target = match desc.dimension {
        TextureDimension::Texture1D if is_es => {
            if array {
                return Err(GraphicsError::unsupported("1D texture arrays on GL ES").into());
            }
            gl::TEXTURE_2D
        }
        TextureDimension::Texture1D if array => gl::TEXTURE_1D_ARRAY,
        TextureDimension::Texture1D => gl::TEXTURE_1D,
        TextureDimension::Texture2D if array && is_es2 => {
            return Err(GraphicsError::unsupported("texture arrays on GL ES 2").into());
        }
        TextureDimension::Texture2D if array => gl::TEXTURE_2D_ARRAY,
        TextureDimension::Texture2D => gl::TEXTURE_2D,
        TextureDimension::Texture3D if is_es2 => {
            return Err(GraphicsError::unsupported("3D textures on GL ES 2").into());
        }
        TextureDimension::Texture3D => gl::TEXTURE_3D,
        TextureDimension::TextureCube => gl::TEXTURE_CUBE_MAP,
    };
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gfx_core::PixelFormat;

    use super::*;
    use crate::soft::{SoftGl, SoftProfile};

    fn driver(profile: SoftProfile) -> GlDriver<SoftGl> {
        GlDriver::new(Arc::new(SoftGl::with_profile(profile, 4, 4)))
    }

    #[test]
    fn depth_without_srv_is_a_packed_renderbuffer() {
        let gl = driver(SoftProfile::Desktop43);
        let desc = TextureDescription::new_2d(8, 8, PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL);
        let texture = GlTexture::create(&gl, desc, None).unwrap();
        assert!(texture.is_renderbuffer);
        assert_eq!(texture.stencil_id, texture.texture_id);
    }

    #[test]
    fn es2_depth_stencil_without_packing_splits_stencil() {
        let gl = driver(SoftProfile::Es2);
        // The ES2 soft profile advertises packed depth-stencil; force the split.
        let mut caps = gl.caps().clone();
        caps.has_packed_depth_stencil = false;
        let gl = GlDriver::with_caps(gl.api_handle(), caps);

        let desc = TextureDescription::new_2d(8, 8, PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL);
        let texture = GlTexture::create(&gl, desc, None).unwrap();
        assert_ne!(texture.stencil_id, 0);
        assert_ne!(texture.stencil_id, texture.texture_id);
        assert_eq!(gl.call_count("glGenRenderbuffers"), 2);
    }

    #[test]
    fn initial_data_lands_in_each_cube_face() {
        let gl = driver(SoftProfile::Desktop43);
        let desc = TextureDescription::new_cube(1, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let data: Vec<u8> = (0..6u8).flat_map(|face| [face; 4]).collect();
        let texture = GlTexture::create(&gl, desc, Some(&data)).unwrap();

        let face3 = gl
            .texture_image(texture.texture_id, gl::TEXTURE_CUBE_MAP_POSITIVE_X + 3, 0)
            .unwrap();
        assert_eq!(face3, vec![3; 4]);
    }

    #[test]
    fn staging_gets_a_pack_buffer_or_cpu_copy() {
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::empty()).to_staging();

        let desktop = driver(SoftProfile::Desktop43);
        let texture = GlTexture::create(&desktop, desc, None).unwrap();
        assert_ne!(texture.pixel_buffer, 0);
        assert!(texture.staging_data.is_none());

        let es2 = driver(SoftProfile::Es2);
        let texture = GlTexture::create(&es2, desc, None).unwrap();
        assert_eq!(texture.pixel_buffer, 0);
        assert_eq!(texture.staging_data.as_ref().map(Vec::len), Some(64));
    }

    #[test]
    fn recreate_restores_native_names() {
        let mut gl = driver(SoftProfile::Desktop43);
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let mut texture = GlTexture::create(&gl, desc, None).unwrap();

        texture.on_destroyed(&mut gl);
        assert_eq!(texture.texture_id, 0);
        assert_eq!(DeviceChild::<GlDriver<SoftGl>>::lifetime_state(&texture), LifetimeState::Destroyed);
        assert_eq!(gl.live_textures(), 0);

        assert!(texture.on_recreate(&mut gl).unwrap());
        assert_ne!(texture.texture_id, 0);
        assert_eq!(DeviceChild::<GlDriver<SoftGl>>::lifetime_state(&texture), LifetimeState::Active);
    }

    #[test]
    fn es2_rejects_arrays() {
        let gl = driver(SoftProfile::Es2);
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE)
            .with_array_size(2);
        let err = GlTexture::create(&gl, desc, None).unwrap_err();
        assert!(matches!(gfx_core::graphics_error(&err), Some(GraphicsError::Unsupported(_))));
    }
}

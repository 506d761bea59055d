//! Framebuffer object cache.
//!
//! GL needs a framebuffer object per combination of attachments. The cache
//! maps an [`FboKey`] (depth-stencil attachment plus ordered color
//! attachments) to the native framebuffer, creating it on first use. The
//! window's own framebuffer is pre-registered so binding the back buffer
//! never creates anything.

use std::collections::HashMap;

use anyhow::Result;
use gfx_core::{Arena, GraphicsError, Handle};
use gl::types::{GLenum, GLint, GLuint};
use tracing::debug;

use crate::api::GlApi;
use crate::driver::GlDriver;
use crate::state::StateTracker;
use crate::texture::GlTexture;

/// One attachment: a root texture plus the slice and mip it renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FboTexture {
    pub texture: Handle<GlTexture>,
    pub array_slice: u32,
    pub mip_level: u32,
}

impl FboTexture {
    pub fn new(texture: Handle<GlTexture>, array_slice: u32, mip_level: u32) -> Self {
        Self {
            texture,
            array_slice,
            mip_level,
        }
    }

    /// The attachment a texture or view stands for. Views resolve to their
    /// root texture with the view's slice and mip.
    pub fn resolve(handle: Handle<GlTexture>, texture: &GlTexture) -> Self {
        match texture.parent() {
            Some(parent) => {
                let view = texture.view_description();
                Self::new(parent, view.array_slice, view.mip_level)
            }
            None => Self::new(handle, 0, 0),
        }
    }

    /// Attachment of a subresource index (mips of slice 0 first).
    pub fn from_subresource(texture: Handle<GlTexture>, subresource: u32, mip_levels: u32) -> Self {
        let mip_levels = mip_levels.max(1);
        Self::new(texture, subresource / mip_levels, subresource % mip_levels)
    }
}

/// Attachment combination of a framebuffer object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FboKey {
    pub depth_stencil: Option<FboTexture>,
    /// Color attachments by slot, up to the last bound one.
    pub render_targets: Vec<Option<FboTexture>>,
}

impl FboKey {
    pub fn new(depth_stencil: Option<FboTexture>, render_targets: &[Option<FboTexture>]) -> Self {
        let used = render_targets
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1);
        Self {
            depth_stencil,
            render_targets: render_targets[..used].to_vec(),
        }
    }

    fn references(&self, texture: Handle<GlTexture>) -> bool {
        self.depth_stencil.is_some_and(|d| d.texture == texture)
            || self.render_targets.iter().flatten().any(|rt| rt.texture == texture)
    }

    fn is_empty(&self) -> bool {
        self.depth_stencil.is_none() && self.render_targets.is_empty()
    }
}

pub struct FramebufferCache {
    entries: HashMap<FboKey, GLuint>,
    default_framebuffer: GLuint,
    window_color: Option<Handle<GlTexture>>,
}

impl FramebufferCache {
    pub fn new(default_framebuffer: GLuint) -> Self {
        Self {
            entries: HashMap::new(),
            default_framebuffer,
            window_color: None,
        }
    }

    pub fn default_framebuffer(&self) -> GLuint {
        self.default_framebuffer
    }

    /// Register the texture standing for the window's color buffer.
    pub fn register_window(&mut self, color: Handle<GlTexture>) {
        self.window_color = Some(color);
        self.insert_window_key();
    }

    fn insert_window_key(&mut self) {
        if let Some(color) = self.window_color {
            let key = FboKey::new(None, &[Some(FboTexture::new(color, 0, 0))]);
            self.entries.insert(key, self.default_framebuffer);
        }
    }

    fn is_window(&self, texture: Handle<GlTexture>) -> bool {
        Some(texture) == self.window_color
    }

    /// Cached framebuffer objects, the window entries included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &FboKey) -> Option<GLuint> {
        self.entries.get(key).copied()
    }

    /// Framebuffer with exactly these attachments. A new framebuffer is
    /// left bound through `state`.
    pub fn find_or_create<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        textures: &Arena<GlTexture>,
        depth_stencil: Option<FboTexture>,
        render_targets: &[Option<FboTexture>],
    ) -> Result<GLuint> {
        let key = FboKey::new(depth_stencil, render_targets);
        if let Some(&framebuffer) = self.entries.get(&key) {
            return Ok(framebuffer);
        }
        if key.is_empty() {
            return Ok(self.default_framebuffer);
        }
        if key
            .depth_stencil
            .iter()
            .chain(key.render_targets.iter().flatten())
            .any(|attachment| self.is_window(attachment.texture))
        {
            return Err(GraphicsError::MixedWindowTargets.into());
        }

        let framebuffer = gl.gen_framebuffer();
        state.bind_framebuffer(gl, framebuffer);
        let status = match attach_all(gl, textures, &key) {
            Ok(()) => gl.check_framebuffer_status(gl::FRAMEBUFFER),
            Err(err) => {
                gl.delete_framebuffer(framebuffer);
                state.forget_framebuffer(framebuffer);
                return Err(err);
            }
        };
        if status != gl::FRAMEBUFFER_COMPLETE {
            gl.delete_framebuffer(framebuffer);
            state.forget_framebuffer(framebuffer);
            return Err(GraphicsError::FramebufferIncomplete {
                status,
                render_targets: key.render_targets.len(),
                depth: key.depth_stencil.is_some(),
            }
            .into());
        }

        debug!(
            framebuffer,
            render_targets = key.render_targets.len(),
            depth = key.depth_stencil.is_some(),
            "created framebuffer object"
        );
        self.entries.insert(key, framebuffer);
        Ok(framebuffer)
    }

    /// Framebuffer for a single texture: depth-stencil textures bind as the
    /// depth attachment, anything else as color attachment 0.
    pub fn find_or_create_for<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        textures: &Arena<GlTexture>,
        attachment: FboTexture,
    ) -> Result<GLuint> {
        if Some(attachment.texture) == self.window_color {
            return Ok(self.default_framebuffer);
        }
        let texture = textures
            .get(attachment.texture)
            .ok_or(GraphicsError::StaleHandle("texture"))?;
        if texture.is_depth_stencil() {
            self.find_or_create(gl, state, textures, Some(attachment), &[])
        } else {
            self.find_or_create(gl, state, textures, None, &[Some(attachment)])
        }
    }

    /// Delete every framebuffer attached to `texture`.
    pub fn remove_texture<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, texture: Handle<GlTexture>) {
        let default_framebuffer = self.default_framebuffer;
        self.entries.retain(|key, framebuffer| {
            if *framebuffer == default_framebuffer || !key.references(texture) {
                return true;
            }
            gl.delete_framebuffer(*framebuffer);
            state.forget_framebuffer(*framebuffer);
            false
        });
    }

    /// Delete every framebuffer object and keep only the window entries.
    pub fn delete_all<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        for framebuffer in self.entries.values().copied() {
            if framebuffer != self.default_framebuffer {
                gl.delete_framebuffer(framebuffer);
                state.forget_framebuffer(framebuffer);
            }
        }
        self.forget_all();
    }

    /// The context was lost with every framebuffer in it.
    pub fn forget_all(&mut self) {
        self.entries.clear();
        self.insert_window_key();
    }
}

fn root<'a>(textures: &'a Arena<GlTexture>, attachment: &FboTexture) -> Result<&'a GlTexture> {
    Ok(textures
        .get(attachment.texture)
        .ok_or(GraphicsError::StaleHandle("texture"))?)
}

fn attach_all<A: GlApi>(gl: &GlDriver<A>, textures: &Arena<GlTexture>, key: &FboKey) -> Result<()> {
    for (slot, attachment) in key.render_targets.iter().enumerate() {
        if let Some(attachment) = attachment {
            attach_color(gl, root(textures, attachment)?, attachment, slot as u32)?;
        }
    }

    if !gl.caps().is_es2 {
        let count = key.render_targets.len();
        if count <= 1 && !gl.caps().is_es {
            gl.draw_buffer(if count == 1 { gl::COLOR_ATTACHMENT0 } else { gl::NONE });
        } else if count == 0 {
            gl.draw_buffers(&[gl::NONE]);
        } else {
            let buffers: Vec<GLenum> = key
                .render_targets
                .iter()
                .enumerate()
                .map(|(slot, rt)| match rt {
                    Some(_) => gl::COLOR_ATTACHMENT0 + slot as GLenum,
                    None => gl::NONE,
                })
                .collect();
            gl.draw_buffers(&buffers);
        }
    }

    if let Some(depth) = &key.depth_stencil {
        attach_depth_stencil(gl, root(textures, depth)?, depth)?;
    }
    Ok(())
}

fn attach_color<A: GlApi>(gl: &GlDriver<A>, texture: &GlTexture, attachment: &FboTexture, slot: u32) -> Result<()> {
    let caps = gl.caps();
    if caps.is_es2 && attachment.mip_level != 0 {
        return Err(GraphicsError::unsupported("rendering to mip levels other than 0 on GL ES 2").into());
    }
    let point = gl::COLOR_ATTACHMENT0 + slot;
    let level = attachment.mip_level as GLint;

    if texture.is_renderbuffer {
        gl.framebuffer_renderbuffer(gl::FRAMEBUFFER, point, texture.texture_id);
        return Ok(());
    }
    match texture.target {
        gl::TEXTURE_1D if caps.is_es => {
            return Err(GraphicsError::unsupported("1D render targets on GL ES").into());
        }
        gl::TEXTURE_1D => gl.framebuffer_texture_1d(gl::FRAMEBUFFER, point, gl::TEXTURE_1D, texture.texture_id, level),
        gl::TEXTURE_2D => gl.framebuffer_texture_2d(gl::FRAMEBUFFER, point, gl::TEXTURE_2D, texture.texture_id, level),
        gl::TEXTURE_CUBE_MAP => gl.framebuffer_texture_2d(
            gl::FRAMEBUFFER,
            point,
            gl::TEXTURE_CUBE_MAP_POSITIVE_X + attachment.array_slice % 6,
            texture.texture_id,
            level,
        ),
        gl::TEXTURE_2D_ARRAY | gl::TEXTURE_3D | gl::TEXTURE_1D_ARRAY if !caps.is_es2 => gl.framebuffer_texture_layer(
            gl::FRAMEBUFFER,
            point,
            texture.texture_id,
            level,
            attachment.array_slice as GLint,
        ),
        other => {
            return Err(GraphicsError::unsupported(format!("render target with texture target 0x{other:04X}")).into());
        }
    }
    Ok(())
}

fn attach_depth_stencil<A: GlApi>(gl: &GlDriver<A>, texture: &GlTexture, attachment: &FboTexture) -> Result<()> {
    let es2 = gl.caps().is_es2;
    if es2 && attachment.mip_level != 0 {
        return Err(GraphicsError::unsupported("depth mip levels other than 0 on GL ES 2").into());
    }
    // ES 2 has no combined attachment point.
    let shared = texture.stencil_id == texture.texture_id && !es2;
    let point = if shared {
        gl::DEPTH_STENCIL_ATTACHMENT
    } else {
        gl::DEPTH_ATTACHMENT
    };
    let separate_stencil = texture.has_stencil() && !shared;
    let level = attachment.mip_level as GLint;

    if texture.is_renderbuffer {
        gl.framebuffer_renderbuffer(gl::FRAMEBUFFER, point, texture.texture_id);
        if separate_stencil {
            gl.framebuffer_renderbuffer(gl::FRAMEBUFFER, gl::STENCIL_ATTACHMENT, texture.stencil_id);
        }
    } else {
        gl.framebuffer_texture_2d(gl::FRAMEBUFFER, point, gl::TEXTURE_2D, texture.texture_id, level);
        if separate_stencil {
            gl.framebuffer_texture_2d(gl::FRAMEBUFFER, gl::STENCIL_ATTACHMENT, gl::TEXTURE_2D, texture.stencil_id, level);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gfx_core::{PixelFormat, TextureDescription, TextureFlags};

    use super::*;
    use crate::soft::SoftGl;

    struct Fixture {
        gl: GlDriver<SoftGl>,
        state: StateTracker,
        textures: Arena<GlTexture>,
        cache: FramebufferCache,
        window: Handle<GlTexture>,
    }

    impl Fixture {
        fn new() -> Self {
            let gl = GlDriver::new(Arc::new(SoftGl::new(16, 16)));
            let mut state = StateTracker::new(8);
            state.reset(&gl);
            let mut textures = Arena::new();
            let window_desc = TextureDescription::new_2d(16, 16, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
            let window = textures.insert(GlTexture::window(window_desc, Default::default()));
            let mut cache = FramebufferCache::new(0);
            cache.register_window(window);
            Self {
                gl,
                state,
                textures,
                cache,
                window,
            }
        }

        fn texture(&mut self, format: PixelFormat, flags: TextureFlags) -> FboTexture {
            let desc = TextureDescription::new_2d(16, 16, format, flags);
            let texture = GlTexture::create(&self.gl, desc, None).unwrap();
            FboTexture::new(self.textures.insert(texture), 0, 0)
        }

        fn find(&mut self, depth: Option<FboTexture>, rts: &[Option<FboTexture>]) -> Result<GLuint> {
            self.cache
                .find_or_create(&self.gl, &mut self.state, &self.textures, depth, rts)
        }
    }

    #[test]
    fn same_attachments_share_one_framebuffer() {
        let mut f = Fixture::new();
        let color = f.texture(PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let depth = f.texture(PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL);

        let first = f.find(Some(depth), &[Some(color)]).unwrap();
        let second = f.find(Some(depth), &[Some(color), None, None]).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.gl.call_count("glGenFramebuffers"), 1);

        let color_only = f.find(None, &[Some(color)]).unwrap();
        assert_ne!(color_only, first);
        assert_eq!(f.gl.call_count("glGenFramebuffers"), 2);
    }

    #[test]
    fn window_target_uses_default_framebuffer() {
        let mut f = Fixture::new();
        let window = FboTexture::new(f.window, 0, 0);
        assert_eq!(f.find(None, &[Some(window)]).unwrap(), 0);
        assert_eq!(f.find(None, &[]).unwrap(), 0);
        assert_eq!(f.gl.call_count("glGenFramebuffers"), 0);
    }

    #[test]
    fn window_with_user_depth_is_rejected() {
        let mut f = Fixture::new();
        let depth = f.texture(PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL);
        let window = FboTexture::new(f.window, 0, 0);
        let err = f.find(Some(depth), &[Some(window)]).unwrap_err();
        assert_eq!(gfx_core::graphics_error(&err), Some(&GraphicsError::MixedWindowTargets));
    }

    #[test]
    fn incomplete_framebuffer_is_deleted() {
        let mut f = Fixture::new();
        // A sampled depth texture is not a valid color attachment.
        let depth = f.texture(
            PixelFormat::Depth24UnormStencil8,
            TextureFlags::DEPTH_STENCIL | TextureFlags::SHADER_RESOURCE,
        );
        let err = f.find(None, &[Some(depth)]).unwrap_err();
        assert!(matches!(
            gfx_core::graphics_error(&err),
            Some(GraphicsError::FramebufferIncomplete { .. })
        ));
        assert!(err.to_string().contains("0x8CD6"));
        assert_eq!(f.gl.framebuffer_count(), 0);
    }

    #[test]
    fn destroying_a_texture_drops_its_framebuffers() {
        let mut f = Fixture::new();
        let a = f.texture(PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let b = f.texture(PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let fa = f.find(None, &[Some(a)]).unwrap();
        let fab = f.find(None, &[Some(a), Some(b)]).unwrap();
        let fb = f.find(None, &[Some(b)]).unwrap();

        f.cache.remove_texture(&f.gl, &mut f.state, a.texture);
        assert!(!f.gl.is_framebuffer(fa));
        assert!(!f.gl.is_framebuffer(fab));
        assert!(f.gl.is_framebuffer(fb));
        // Window entry plus `b`.
        assert_eq!(f.cache.len(), 2);
    }

    #[test]
    fn single_texture_lookup_picks_attachment_point() {
        let mut f = Fixture::new();
        let depth = f.texture(PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL);
        let id = f
            .cache
            .find_or_create_for(&f.gl, &mut f.state, &f.textures, depth)
            .unwrap();
        assert_eq!(f.cache.get(&FboKey::new(Some(depth), &[])), Some(id));
    }

    #[test]
    fn forget_all_keeps_window_entry() {
        let mut f = Fixture::new();
        let color = f.texture(PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        f.find(None, &[Some(color)]).unwrap();
        f.cache.forget_all();
        assert_eq!(f.cache.len(), 1);
        let window = FboTexture::new(f.window, 0, 0);
        assert_eq!(f.cache.get(&FboKey::new(None, &[Some(window)])), Some(0));
    }
}

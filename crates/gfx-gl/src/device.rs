//! The GL graphics device.
//!
//! [`GlDevice`] owns every native object created through it: textures,
//! buffers and vertex arrays live in arenas and are addressed by handle.
//! Commands are recorded through [`GlDevice::command_list`], which borrows
//! the device for the duration of the recording.

use std::sync::Arc;

use anyhow::{Context, Result};
use gfx_core::{
    Arena, BufferDescription, DeviceChild, DeviceConfig, DeviceId, DeviceStatusMonitor,
    FrameStats, GraphicsDeviceStatus, GraphicsError, GraphicsProfile, Handle, PixelFormat,
    Rectangle, TextureDescription, TextureFlags, TextureViewDescription,
};
use tracing::{debug, info, warn};

use crate::api::GlApi;
use crate::buffer::{BufferContext, GlBuffer};
use crate::caps::GlCaps;
use crate::command_list::{CommandState, GlCommandList};
use crate::context::{AsyncCreationContext, ContextTracker};
use crate::copy::{CopyRegion, CopyScaler};
use crate::driver::GlDriver;
use crate::fbo::{FboTexture, FramebufferCache};
use crate::format::convert_pixel_format;
use crate::platform::GlPlatform;
use crate::program::UniformShadow;
use crate::state::StateTracker;
use crate::texture::GlTexture;
use crate::vao::{GlVertexArray, IndexBufferBinding, InputSignature, VertexArrayContext, VertexBufferBinding};

const ALL_PROFILES: [GraphicsProfile; 8] = [
    GraphicsProfile::Level_11_2,
    GraphicsProfile::Level_11_1,
    GraphicsProfile::Level_11_0,
    GraphicsProfile::Level_10_1,
    GraphicsProfile::Level_10_0,
    GraphicsProfile::Level_9_3,
    GraphicsProfile::Level_9_2,
    GraphicsProfile::Level_9_1,
];

/// A texture or a buffer, for operations that accept either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlResource {
    Texture(Handle<GlTexture>),
    Buffer(Handle<GlBuffer>),
}

impl From<Handle<GlTexture>> for GlResource {
    fn from(handle: Handle<GlTexture>) -> Self {
        GlResource::Texture(handle)
    }
}

impl From<Handle<GlBuffer>> for GlResource {
    fn from(handle: Handle<GlBuffer>) -> Self {
        GlResource::Buffer(handle)
    }
}

/// Resources whose contents did not survive a device reset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LostContents {
    pub textures: Vec<Handle<GlTexture>>,
    pub buffers: Vec<Handle<GlBuffer>>,
}

impl LostContents {
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.buffers.is_empty()
    }
}

pub struct GlDevice<A: GlApi, P: GlPlatform> {
    id: DeviceId,
    pub(crate) gl: GlDriver<A>,
    platform: Arc<P>,
    config: DeviceConfig,
    profile: GraphicsProfile,
    context: ContextTracker<P>,
    pub(crate) state: StateTracker,
    pub(crate) framebuffers: FramebufferCache,
    pub(crate) textures: Arena<GlTexture>,
    pub(crate) buffers: Arena<GlBuffer>,
    pub(crate) vertex_arrays: Arena<GlVertexArray>,
    pub(crate) window_texture: Handle<GlTexture>,
    copy_scaler: CopyScaler,
    pub(crate) uniforms: UniformShadow,
    pub(crate) commands: CommandState,
    status: DeviceStatusMonitor,
    pub(crate) stats: FrameStats,
    pub(crate) frame_counter: u64,
}

impl<A: GlApi, P: GlPlatform> GlDevice<A, P> {
    /// Create the device on the platform's main context.
    ///
    /// The main context is bound for the duration of the call and left
    /// unbound afterwards; rendering happens between [`begin`](Self::begin)
    /// and [`end`](Self::end).
    pub fn new(api: Arc<A>, platform: Arc<P>, config: DeviceConfig) -> Result<Self> {
        platform
            .make_current(Some(platform.main_context()))
            .context("binding the main GL context")?;
        let device = Self::create(api, Arc::clone(&platform), config);
        platform.make_current(None)?;
        device
    }

    fn create(api: Arc<A>, platform: Arc<P>, config: DeviceConfig) -> Result<Self> {
        let gl = GlDriver::new(api);
        let profile = select_profile(gl.caps(), &config.profiles)?;
        info!(renderer = %gl.caps().renderer, ?profile, es = gl.caps().is_es, "created GL device");

        let creation = Arc::new(AsyncCreationContext::new(Arc::clone(&platform), config.async_creation)?);
        let id = DeviceId::next();
        let context = ContextTracker::new(Arc::clone(&platform), creation, id);

        let mut state = StateTracker::new(config.max_texture_units);
        state.reset(&gl);

        let (width, height) = platform.window_size();
        let window_desc = TextureDescription::new_2d(width, height, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let window_format = convert_pixel_format(window_desc.format, gl.caps())?;
        let mut textures = Arena::new();
        let window_texture = textures.insert(GlTexture::window(window_desc, window_format));

        let mut framebuffers = FramebufferCache::new(platform.default_framebuffer());
        framebuffers.register_window(window_texture);

        let commands = CommandState::new(&config, framebuffers.default_framebuffer(), (width, height));
        Ok(Self {
            id,
            gl,
            platform,
            config,
            profile,
            context,
            state,
            framebuffers,
            textures,
            buffers: Arena::new(),
            vertex_arrays: Arena::new(),
            window_texture,
            copy_scaler: CopyScaler::default(),
            uniforms: UniformShadow::default(),
            commands,
            status: DeviceStatusMonitor::new(),
            stats: FrameStats::default(),
            frame_counter: 0,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn caps(&self) -> &GlCaps {
        self.gl.caps()
    }

    pub fn driver(&self) -> &GlDriver<A> {
        &self.gl
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Profile the context was matched to at creation.
    pub fn profile(&self) -> GraphicsProfile {
        self.profile
    }

    /// The texture standing for the window's default framebuffer.
    pub fn window_texture(&self) -> Handle<GlTexture> {
        self.window_texture
    }

    pub fn texture(&self, handle: Handle<GlTexture>) -> Option<&GlTexture> {
        self.textures.get(handle)
    }

    pub fn buffer(&self, handle: Handle<GlBuffer>) -> Option<&GlBuffer> {
        self.buffers.get(handle)
    }

    pub fn vertex_array(&self, handle: Handle<GlVertexArray>) -> Option<&GlVertexArray> {
        self.vertex_arrays.get(handle)
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    /// Number of cached framebuffer objects, window entries included.
    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    // ---- Context

    /// Make the device context current. Calls nest; only the outermost
    /// pair binds and releases.
    pub fn begin(&mut self) -> Result<()> {
        self.context.begin()
    }

    pub fn end(&mut self) -> Result<()> {
        self.context.end()
    }

    /// Begin/End nesting depth.
    pub fn context_depth(&self) -> usize {
        self.context.depth()
    }

    pub fn ensure_context_active(&self) -> Result<()> {
        self.context.ensure_context_active()
    }

    /// Start a new frame: advances the frame counter used for readback
    /// latency and clears the per-frame statistics.
    pub fn begin_frame(&mut self) {
        self.frame_counter += 1;
        self.stats.reset();
    }

    pub fn command_list(&mut self) -> GlCommandList<'_, A, P> {
        GlCommandList::new(self)
    }

    pub fn creation_context(&self) -> Arc<AsyncCreationContext<P>> {
        Arc::clone(self.context.creation())
    }

    /// Handle for creating resources from other threads.
    pub fn loader(&self) -> GlResourceLoader<A, P> {
        GlResourceLoader {
            gl: GlDriver::with_caps(self.gl.api_handle(), self.gl.caps().clone()),
            creation: self.creation_context(),
        }
    }

    /// Let background loaders waiting for the main context run. Bindings
    /// they may have changed are forgotten.
    pub(crate) fn execute_pending_tasks(&mut self) -> Result<()> {
        if self.context.creation().execute_pending_tasks()? {
            self.state.invalidate_bindings();
            self.commands.vertex_array_dirty = true;
        }
        Ok(())
    }

    /// Drain the GPU and release the contexts, e.g. when the application
    /// goes to background.
    pub fn pause(&self) -> Result<()> {
        self.context.creation().pause(&*self.gl)
    }

    pub fn resume(&self) -> Result<()> {
        self.context.creation().resume()
    }

    // ---- Resources

    /// Create a texture. `initial_data` holds every subresource tightly
    /// packed, slice-major then by mip.
    pub fn create_texture(&mut self, description: TextureDescription, initial_data: Option<&[u8]>) -> Result<Handle<GlTexture>> {
        self.ensure_context_active()?;
        let texture = GlTexture::create(&self.gl, description, initial_data)?;
        self.state.forget_active_texture_binding();
        Ok(self.textures.insert(texture))
    }

    /// A view onto a slice or mip of `parent`.
    pub fn create_texture_view(&mut self, parent: Handle<GlTexture>, view: TextureViewDescription) -> Result<Handle<GlTexture>> {
        let texture = {
            let parent_texture = self.textures.get(parent).ok_or(GraphicsError::StaleHandle("texture"))?;
            let desc = parent_texture.description();
            if view.array_slice >= desc.array_size.max(desc.depth) || view.mip_level >= desc.mip_levels {
                return Err(GraphicsError::invalid(format!(
                    "view of slice {} mip {} on a texture with {} slices and {} mips",
                    view.array_slice, view.mip_level, desc.array_size, desc.mip_levels
                ))
                .into());
            }
            GlTexture::view(parent, parent_texture, view)
        };
        Ok(self.textures.insert(texture))
    }

    pub fn create_buffer(&mut self, description: BufferDescription, initial_data: Option<&[u8]>) -> Result<Handle<GlBuffer>> {
        self.ensure_context_active()?;
        let buffer = GlBuffer::create(&self.gl, &mut self.state, description, initial_data)?;
        Ok(self.buffers.insert(buffer))
    }

    pub fn create_vertex_array(
        &mut self,
        vertex_buffers: Vec<VertexBufferBinding>,
        index_buffer: Option<IndexBufferBinding>,
        preferred_signature: Option<InputSignature>,
    ) -> Result<Handle<GlVertexArray>> {
        self.ensure_context_active()?;
        let vao = GlVertexArray::create(
            &self.gl,
            &mut self.state,
            &self.buffers,
            vertex_buffers,
            index_buffer,
            preferred_signature,
        )?;
        self.commands.vertex_array_dirty = true;
        Ok(self.vertex_arrays.insert(vao))
    }

    /// Take ownership of a texture created by a [`GlResourceLoader`].
    pub fn adopt_texture(&mut self, texture: GlTexture) -> Handle<GlTexture> {
        self.textures.insert(texture)
    }

    pub fn adopt_buffer(&mut self, buffer: GlBuffer) -> Handle<GlBuffer> {
        self.buffers.insert(buffer)
    }

    /// Delete a texture, its views and every framebuffer using it.
    pub fn destroy_texture(&mut self, handle: Handle<GlTexture>) -> Result<()> {
        if handle == self.window_texture {
            return Err(GraphicsError::invalid("the window texture is owned by the device").into());
        }
        let mut texture = self.textures.remove(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
        match texture.parent() {
            Some(_) => texture.dispose(&self.gl),
            None => {
                let mut released: Vec<_> = self
                    .textures
                    .iter()
                    .filter(|(_, t)| t.parent() == Some(handle))
                    .map(|(view, _)| view)
                    .collect();
                released.push(handle);
                for mut view in self.textures.retain(|_, t| t.parent() != Some(handle)) {
                    view.dispose(&self.gl);
                }
                self.framebuffers.remove_texture(&self.gl, &mut self.state, handle);
                self.commands.release_texture(&released, self.framebuffers.default_framebuffer());
                self.state.forget_texture(texture.texture_id());
                texture.dispose(&self.gl);
            }
        }
        Ok(())
    }

    pub fn destroy_buffer(&mut self, handle: Handle<GlBuffer>) -> Result<()> {
        let mut buffer = self.buffers.remove(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
        if self.vertex_arrays.iter().any(|(_, vao)| vao.references(handle)) {
            warn!("destroying a buffer still used by a vertex array");
        }
        buffer.dispose(&self.gl, &mut self.state);
        Ok(())
    }

    pub fn destroy_vertex_array(&mut self, handle: Handle<GlVertexArray>) -> Result<()> {
        let mut vao = self.vertex_arrays.remove(handle).ok_or(GraphicsError::StaleHandle("vertex array"))?;
        vao.dispose(&self.gl, &mut self.state);
        if self.commands.vertex_array == Some(handle) {
            self.commands.vertex_array = None;
        }
        Ok(())
    }

    // ---- Presentation

    /// Resize the window texture after the window changed size.
    pub fn set_window_size(&mut self, width: u32, height: u32) -> Result<()> {
        let window = self
            .textures
            .get_mut(self.window_texture)
            .ok_or(GraphicsError::StaleHandle("texture"))?;
        window.set_size(width, height);
        debug!(width, height, "window framebuffer resized");
        Ok(())
    }

    /// Copy `back_buffer` into the window framebuffer and swap.
    pub fn present(&mut self, back_buffer: Handle<GlTexture>) -> Result<()> {
        self.begin()?;
        let presented = self.copy_to_window(back_buffer).and_then(|()| self.platform.swap_buffers());
        let ended = self.end();
        presented.and(ended)
    }

    fn copy_to_window(&mut self, back_buffer: Handle<GlTexture>) -> Result<()> {
        let source = self.textures.get(back_buffer).ok_or(GraphicsError::StaleHandle("texture"))?;
        let (width, height) = (source.width() as i32, source.height() as i32);
        let srgb = source.description().format.is_srgb() && self.gl.caps().is_es;
        let rect = Rectangle::new(0, 0, width, height);

        if self.gl.caps().has_blit && !srgb {
            let attachment = FboTexture::resolve(back_buffer, source);
            let read = self
                .framebuffers
                .find_or_create_for(&self.gl, &mut self.state, &self.textures, attachment)?;
            self.state.bind_read_framebuffer(&self.gl, read);
            self.state
                .bind_draw_framebuffer(&self.gl, self.framebuffers.default_framebuffer());
            // The window framebuffer is bottom-up.
            self.gl
                .blit_framebuffer([0, 0, width, height], [0, height, width, 0], gl::COLOR_BUFFER_BIT, gl::NEAREST);
            self.state.bind_framebuffer(&self.gl, self.commands.bound_framebuffer);
            return self.gl.check("present blit");
        }

        let region = CopyRegion {
            source: rect,
            destination: rect,
            flip_y: true,
        };
        self.copy_scaler_2d(back_buffer, self.window_texture, &region, srgb)
    }

    /// Draw `source` into `destination` with the copy program, then put
    /// the recorded framebuffer and viewport back.
    pub(crate) fn copy_scaler_2d(
        &mut self,
        source: Handle<GlTexture>,
        destination: Handle<GlTexture>,
        region: &CopyRegion,
        srgb: bool,
    ) -> Result<()> {
        let dest = self.textures.get(destination).ok_or(GraphicsError::StaleHandle("texture"))?;
        let destination_size = (dest.width(), dest.height());
        let attachment = FboTexture::resolve(destination, dest);
        let framebuffer = self
            .framebuffers
            .find_or_create_for(&self.gl, &mut self.state, &self.textures, attachment)?;
        self.state.bind_framebuffer(&self.gl, framebuffer);

        let source = self.textures.get_mut(source).ok_or(GraphicsError::StaleHandle("texture"))?;
        let copied = self
            .copy_scaler
            .copy(&self.gl, &mut self.state, source, destination_size, region, srgb);

        self.commands.vertex_array_dirty = true;
        self.state.bind_framebuffer(&self.gl, self.commands.bound_framebuffer);
        if let Some(viewport) = self.commands.viewport {
            self.state.set_viewport(&self.gl, &viewport);
        }
        copied
    }

    // ---- Device loss

    /// Poll the device state; lost contexts report `Reset`.
    pub fn status(&self) -> GraphicsDeviceStatus {
        self.status.poll(|| {
            if self.platform.is_context_lost() {
                GraphicsDeviceStatus::Reset
            } else {
                GraphicsDeviceStatus::Normal
            }
        })
    }

    /// The next [`status`](Self::status) reports `Reset` once.
    pub fn simulate_reset(&self) {
        self.status.simulate_reset();
    }

    /// Release every native object. Handles stay valid and get new native
    /// objects in [`on_recreate`](Self::on_recreate).
    pub fn on_destroyed(&mut self) {
        for (_, vao) in self.vertex_arrays.iter_mut() {
            let mut ctx = VertexArrayContext {
                gl: &self.gl,
                state: &mut self.state,
                buffers: &self.buffers,
            };
            vao.on_destroyed(&mut ctx);
        }
        for (_, buffer) in self.buffers.iter_mut() {
            let mut ctx = BufferContext {
                gl: &self.gl,
                state: &mut self.state,
            };
            buffer.on_destroyed(&mut ctx);
        }
        for (_, texture) in self.textures.iter_mut() {
            texture.on_destroyed(&mut self.gl);
        }
        self.framebuffers.delete_all(&self.gl, &mut self.state);
        self.copy_scaler.dispose(&self.gl, &mut self.state);
        self.uniforms.clear();
        self.state.invalidate_bindings();
        self.commands.forget_native();
        info!("GL device resources destroyed");
    }

    /// Recreate native objects after a reset. Returns the resources whose
    /// initial contents must be uploaded again.
    pub fn on_recreate(&mut self) -> Result<LostContents> {
        self.state.reset(&self.gl);
        let mut lost = LostContents::default();

        // Roots first so views can pick up the new names.
        let roots: Vec<_> = self
            .textures
            .iter()
            .filter(|(_, t)| t.parent().is_none())
            .map(|(h, _)| h)
            .collect();
        for handle in roots {
            if let Some(texture) = self.textures.get_mut(handle) {
                if !texture.on_recreate(&mut self.gl)? {
                    lost.textures.push(handle);
                }
            }
        }
        self.state.forget_active_texture_binding();
        let views: Vec<_> = self
            .textures
            .iter()
            .filter_map(|(h, t)| t.parent().map(|p| (h, p)))
            .collect();
        for (view, parent) in views {
            if let Some((view, parent)) = self.textures.pair_mut(view, parent) {
                view.adopt_parent(parent);
            }
        }

        for (handle, buffer) in self.buffers.iter_mut() {
            let mut ctx = BufferContext {
                gl: &self.gl,
                state: &mut self.state,
            };
            if !buffer.on_recreate(&mut ctx)? {
                lost.buffers.push(handle);
            }
        }
        for (_, vao) in self.vertex_arrays.iter_mut() {
            let mut ctx = VertexArrayContext {
                gl: &self.gl,
                state: &mut self.state,
                buffers: &self.buffers,
            };
            vao.on_recreate(&mut ctx)?;
        }
        self.commands.vertex_array_dirty = true;
        self.commands.framebuffer_dirty = true;
        info!(
            textures = lost.textures.len(),
            buffers = lost.buffers.len(),
            "GL device resources recreated"
        );
        Ok(lost)
    }

    /// Delete everything the device owns. The device must not be used
    /// afterwards.
    pub fn dispose(&mut self) -> Result<()> {
        self.begin()?;
        for (_, mut vao) in self.vertex_arrays.drain() {
            vao.dispose(&self.gl, &mut self.state);
        }
        for (_, mut buffer) in self.buffers.drain() {
            buffer.dispose(&self.gl, &mut self.state);
        }
        for (_, mut texture) in self.textures.drain() {
            texture.dispose(&self.gl);
        }
        self.framebuffers.delete_all(&self.gl, &mut self.state);
        self.copy_scaler.dispose(&self.gl, &mut self.state);
        self.end()?;
        self.context.creation().reset_lock();
        debug!("GL device disposed");
        Ok(())
    }
}

/// First requested profile the context can run; when none fits, the best
/// profile the context supports.
fn select_profile(caps: &GlCaps, requested: &[GraphicsProfile]) -> Result<GraphicsProfile> {
    let fits = |profile: &GraphicsProfile| {
        let needed = if caps.is_es { profile.gles_version() } else { profile.gl_version() };
        caps.version >= needed
    };
    if let Some(profile) = requested.iter().copied().find(fits) {
        return Ok(profile);
    }
    match ALL_PROFILES.iter().copied().find(fits) {
        Some(profile) => {
            warn!(?requested, ?profile, "no requested graphics profile is supported; falling back");
            Ok(profile)
        }
        None => Err(GraphicsError::unsupported(format!("GL version {}.{}", caps.version.0, caps.version.1)).into()),
    }
}

// ---------------------------------------------------------------------------
// Background creation
// ---------------------------------------------------------------------------

/// Creates textures and buffers from worker threads through the device's
/// [`AsyncCreationContext`]. The results are handed to the device with
/// [`GlDevice::adopt_texture`] / [`GlDevice::adopt_buffer`].
pub struct GlResourceLoader<A, P: GlPlatform> {
    gl: GlDriver<A>,
    creation: Arc<AsyncCreationContext<P>>,
}

impl<A: GlApi, P: GlPlatform> GlResourceLoader<A, P> {
    pub fn create_texture(&self, description: TextureDescription, initial_data: Option<&[u8]>) -> Result<GlTexture> {
        self.creation.run(|| {
            let texture = GlTexture::create(&self.gl, description, initial_data)?;
            // Other contexts only see the upload once it completed.
            self.gl.finish();
            Ok(texture)
        })
    }

    pub fn create_buffer(&self, description: BufferDescription, initial_data: Option<&[u8]>) -> Result<GlBuffer> {
        self.creation.run(|| {
            let mut state = StateTracker::new(1);
            let buffer = GlBuffer::create(&self.gl, &mut state, description, initial_data)?;
            self.gl.finish();
            Ok(buffer)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use gfx_core::{AsyncCreationMode, BufferFlags, GraphicsResourceUsage};

    use super::*;
    use crate::soft::{SoftGl, SoftPlatform, SoftProfile};

    type SoftDevice = GlDevice<SoftGl, SoftPlatform>;

    fn device_with(profile: SoftProfile, platform: SoftPlatform, config: DeviceConfig) -> (SoftDevice, Arc<SoftGl>, Arc<SoftPlatform>) {
        let api = Arc::new(SoftGl::with_profile(profile, 16, 16));
        let platform = Arc::new(platform);
        let device = GlDevice::new(Arc::clone(&api), Arc::clone(&platform), config).unwrap();
        (device, api, platform)
    }

    fn device() -> (SoftDevice, Arc<SoftGl>, Arc<SoftPlatform>) {
        device_with(SoftProfile::Desktop43, SoftPlatform::new(16, 16), DeviceConfig::default())
    }

    #[test]
    fn creation_leaves_no_context_bound() {
        let (device, _, platform) = device();
        assert_eq!(platform.current_context(), None);
        assert_eq!(device.profile(), GraphicsProfile::Level_11_0);
        assert_eq!(device.framebuffer_count(), 1);
    }

    #[test]
    fn unsupported_profiles_fall_back_to_the_context_level() {
        let (device, _, _) = device_with(SoftProfile::Es2, SoftPlatform::new(16, 16), DeviceConfig::default());
        assert_eq!(device.profile(), GraphicsProfile::Level_9_3);
    }

    #[test]
    fn resources_need_an_active_context() {
        let (mut device, _, _) = device();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        if cfg!(debug_assertions) {
            let err = device.create_texture(desc, None).unwrap_err();
            assert_eq!(gfx_core::graphics_error(&err), Some(&GraphicsError::NoContext));
        }
        device.begin().unwrap();
        device.create_texture(desc, None).unwrap();
        device.end().unwrap();
    }

    #[test]
    fn destroying_a_parent_removes_its_views_and_framebuffers() {
        let (mut device, api, _) = device();
        device.begin().unwrap();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET).with_array_size(2);
        let parent = device.create_texture(desc, None).unwrap();
        let view = device.create_texture_view(parent, TextureViewDescription::single(1, 0)).unwrap();
        device.command_list().set_render_target(None, Some(view)).unwrap();
        assert_eq!(api.framebuffer_count(), 1);

        device.destroy_texture(parent).unwrap();
        assert!(device.texture(view).is_none());
        assert_eq!(api.framebuffer_count(), 0);
        assert_eq!(api.live_textures(), 0);
        device.end().unwrap();
    }

    #[test]
    fn destroying_a_bound_target_falls_back_to_the_window() {
        let (mut device, api, _) = device();
        device.begin().unwrap();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let target = device.create_texture(desc, None).unwrap();
        device.command_list().set_render_target(None, Some(target)).unwrap();
        let bound = device.commands.bound_framebuffer;
        assert_ne!(bound, device.framebuffers.default_framebuffer());
        assert_eq!(device.framebuffer_count(), 2);

        device.destroy_texture(target).unwrap();
        assert_eq!(device.framebuffer_count(), 1);
        assert!(!api.is_framebuffer(bound));
        assert_eq!(device.commands.bound_framebuffer, device.framebuffers.default_framebuffer());
        assert!(device.commands.framebuffer_dirty);

        let window = device.window_texture();
        device
            .command_list()
            .clear_render_target(window, gfx_core::Color4::new(0.0, 1.0, 0.0, 1.0))
            .unwrap();
        device.end().unwrap();
    }

    #[test]
    fn window_texture_cannot_be_destroyed() {
        let (mut device, _, _) = device();
        let window = device.window_texture();
        assert!(device.destroy_texture(window).is_err());
    }

    #[test]
    fn reset_recreates_resources_and_reports_lost_contents() {
        let (mut device, api, _) = device();
        device.begin().unwrap();
        let rt = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let target = device.create_texture(rt, None).unwrap();
        let data = [1u8; 64];
        let uploaded = device
            .create_texture(TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE), Some(&data))
            .unwrap();
        let buffer = device
            .create_buffer(BufferDescription::new(16, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default), Some(&[0; 16]))
            .unwrap();

        device.simulate_reset();
        assert_eq!(device.status(), GraphicsDeviceStatus::Reset);
        assert_eq!(device.status(), GraphicsDeviceStatus::Normal);

        device.on_destroyed();
        assert_eq!(api.live_textures(), 0);
        assert_eq!(api.live_buffers(), 0);

        let lost = device.on_recreate().unwrap();
        assert_eq!(lost.textures, vec![uploaded]);
        assert_eq!(lost.buffers, vec![buffer]);
        assert_ne!(device.texture(target).unwrap().texture_id(), 0);
        assert_eq!(api.live_textures(), 2);
        device.end().unwrap();
    }

    #[test]
    fn lost_context_is_reported_as_reset() {
        let (device, _, platform) = device();
        platform.lose_context();
        assert_eq!(device.status(), GraphicsDeviceStatus::Reset);
        platform.restore_context();
        assert_eq!(device.status(), GraphicsDeviceStatus::Normal);
    }

    #[test]
    fn loader_creates_on_the_shared_context() {
        let (mut device, api, _) = device();
        let loader = device.loader();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let texture = thread::spawn(move || loader.create_texture(desc, None)).join().unwrap().unwrap();
        let handle = device.adopt_texture(texture);
        assert_ne!(device.texture(handle).unwrap().texture_id(), 0);
        assert_eq!(api.call_count("glFinish"), 1);
    }

    #[test]
    fn main_thread_loader_is_serviced_by_draw_preparation() {
        let config = DeviceConfig::default().with_async_creation(AsyncCreationMode::MainThread);
        let (mut device, _, _) = device_with(SoftProfile::Desktop43, SoftPlatform::without_shared_contexts(16, 16), config);
        device.begin().unwrap();

        let loader = device.loader();
        let creation = device.creation_context();
        let worker = thread::spawn(move || {
            loader.create_buffer(BufferDescription::new(8, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default), None)
        });
        while !creation.has_pending_tasks() {
            thread::yield_now();
        }
        device.execute_pending_tasks().unwrap();
        let buffer = worker.join().unwrap().unwrap();
        assert_ne!(buffer.buffer_id(), 0);
        device.end().unwrap();
    }

    #[test]
    fn present_copies_the_back_buffer_and_swaps() {
        let (mut device, api, platform) = device();
        device.begin().unwrap();
        let desc = TextureDescription::new_2d(16, 16, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let back_buffer = device.create_texture(desc, None).unwrap();
        {
            let mut commands = device.command_list();
            commands.set_render_target(None, Some(back_buffer)).unwrap();
            commands.clear_render_target(back_buffer, gfx_core::Color4::new(0.0, 1.0, 0.0, 1.0)).unwrap();
        }
        device.end().unwrap();

        device.present(back_buffer).unwrap();
        assert_eq!(platform.swap_count(), 1);
        assert_eq!(api.window_pixel(3, 5), [0, 255, 0, 255]);
        assert_eq!(platform.current_context(), None);
    }
}

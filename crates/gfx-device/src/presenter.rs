//! Back buffers and the present sequence.
//!
//! The application renders into a [`BackBuffer`] owned by a [`Presenter`].
//! On GL, presenting copies it into the window framebuffer between a
//! Begin/End pair and swaps. Headless Direct3D 12 has no swap chain:
//! presenting submits the frame's commands and starts the next frame.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use gfx_core::{GraphicsError, Handle, PixelFormat, TextureDescription, TextureFlags};
use gfx_d3d12::{CommandList, D3d12Backend, D3d12Device, D3d12Texture};
use gfx_gl::{GlApi, GlDevice, GlPlatform, GlTexture};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenterDescription {
    pub width: u32,
    pub height: u32,
    pub back_buffer_format: PixelFormat,
    pub depth_stencil_format: Option<PixelFormat>,
}

impl PresenterDescription {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            back_buffer_format: PixelFormat::Rgba8Unorm,
            depth_stencil_format: Some(PixelFormat::Depth24UnormStencil8),
        }
    }

    fn color(&self) -> TextureDescription {
        TextureDescription::new_2d(
            self.width,
            self.height,
            self.back_buffer_format,
            TextureFlags::RENDER_TARGET | TextureFlags::SHADER_RESOURCE,
        )
    }

    fn depth_stencil(&self) -> Option<TextureDescription> {
        self.depth_stencil_format
            .map(|format| TextureDescription::new_2d(self.width, self.height, format, TextureFlags::DEPTH_STENCIL))
    }
}

/// The textures a frame renders into.
pub struct BackBuffer<T> {
    pub color: Handle<T>,
    pub depth_stencil: Option<Handle<T>>,
}

impl<T> Clone for BackBuffer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BackBuffer<T> {}

pub trait Presenter {
    type Texture;
    /// What the presenter needs to create textures and submit work.
    type Context;

    fn description(&self) -> &PresenterDescription;

    fn back_buffer(&self) -> BackBuffer<Self::Texture>;

    /// Recreate the back buffer at the new size. Existing handles to it
    /// become stale.
    fn resize(&mut self, context: &mut Self::Context, width: u32, height: u32) -> Result<()>;

    /// Show the back buffer and start the next frame.
    fn present(&mut self, context: &mut Self::Context) -> Result<()>;
}

fn check_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(GraphicsError::invalid(format!("back buffer size {width}x{height}")).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GL
// ---------------------------------------------------------------------------

/// Presents into the GL window framebuffer.
pub struct GlPresenter<A, P> {
    description: PresenterDescription,
    back_buffer: BackBuffer<GlTexture>,
    _device: PhantomData<fn() -> (A, P)>,
}

impl<A: GlApi, P: GlPlatform> GlPresenter<A, P> {
    pub fn new(device: &mut GlDevice<A, P>, description: PresenterDescription) -> Result<Self> {
        check_size(description.width, description.height)?;
        let back_buffer = Self::create_back_buffer(device, &description)?;
        Ok(Self {
            description,
            back_buffer,
            _device: PhantomData,
        })
    }

    fn create_back_buffer(device: &mut GlDevice<A, P>, description: &PresenterDescription) -> Result<BackBuffer<GlTexture>> {
        device.begin()?;
        let color = device.create_texture(description.color(), None);
        let depth_stencil = description
            .depth_stencil()
            .map(|desc| device.create_texture(desc, None))
            .transpose();
        device.end()?;
        Ok(BackBuffer {
            color: color?,
            depth_stencil: depth_stencil?,
        })
    }

    /// Destroy both textures, reporting the first failure.
    fn destroy_back_buffer(&self, device: &mut GlDevice<A, P>) -> Result<()> {
        let color = device.destroy_texture(self.back_buffer.color);
        let depth = match self.back_buffer.depth_stencil {
            Some(depth) => device.destroy_texture(depth),
            None => Ok(()),
        };
        color.and(depth)
    }
}

impl<A: GlApi, P: GlPlatform> Presenter for GlPresenter<A, P> {
    type Texture = GlTexture;
    type Context = GlDevice<A, P>;

    fn description(&self) -> &PresenterDescription {
        &self.description
    }

    fn back_buffer(&self) -> BackBuffer<GlTexture> {
        self.back_buffer
    }

    /// The window framebuffer follows the new size.
    fn resize(&mut self, device: &mut GlDevice<A, P>, width: u32, height: u32) -> Result<()> {
        check_size(width, height)?;
        device.begin()?;
        let resized = self
            .destroy_back_buffer(device)
            .and_then(|()| device.set_window_size(width, height));
        let ended = device.end();

        // The old back buffer is gone either way; rebuild at the size that
        // took effect.
        if resized.is_ok() {
            self.description.width = width;
            self.description.height = height;
        }
        self.back_buffer = Self::create_back_buffer(device, &self.description)?;
        resized.and(ended)?;
        debug!(width, height, "GL back buffer resized");
        Ok(())
    }

    fn present(&mut self, device: &mut GlDevice<A, P>) -> Result<()> {
        device.present(self.back_buffer.color)?;
        device.begin_frame();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Direct3D 12
// ---------------------------------------------------------------------------

/// Presents a headless Direct3D 12 frame: the command list is submitted
/// and at most one frame stays in flight.
pub struct D3d12Presenter<B: D3d12Backend> {
    device: Arc<D3d12Device<B>>,
    description: PresenterDescription,
    back_buffer: BackBuffer<D3d12Texture>,
    in_flight: Option<u64>,
}

impl<B: D3d12Backend> D3d12Presenter<B> {
    pub fn new(device: Arc<D3d12Device<B>>, description: PresenterDescription) -> Result<Self> {
        check_size(description.width, description.height)?;
        let back_buffer = Self::create_back_buffer(&device, &description)?;
        Ok(Self {
            device,
            description,
            back_buffer,
            in_flight: None,
        })
    }

    fn create_back_buffer(device: &D3d12Device<B>, description: &PresenterDescription) -> Result<BackBuffer<D3d12Texture>> {
        let color = device.create_texture(description.color(), None)?;
        let depth_stencil = description
            .depth_stencil()
            .map(|desc| device.create_texture(desc, None))
            .transpose()?;
        Ok(BackBuffer { color, depth_stencil })
    }

    /// Fence value of the last presented frame.
    pub fn last_present(&self) -> Option<u64> {
        self.in_flight
    }
}

impl<B: D3d12Backend> Presenter for D3d12Presenter<B> {
    type Texture = D3d12Texture;
    type Context = CommandList<B>;

    fn description(&self) -> &PresenterDescription {
        &self.description
    }

    fn back_buffer(&self) -> BackBuffer<D3d12Texture> {
        self.back_buffer
    }

    /// Targets bound on `list` are unbound; the old textures are released
    /// once the GPU is done with them.
    fn resize(&mut self, list: &mut CommandList<B>, width: u32, height: u32) -> Result<()> {
        check_size(width, height)?;
        list.reset_targets()?;
        self.device.destroy_texture(self.back_buffer.color)?;
        if let Some(depth) = self.back_buffer.depth_stencil {
            self.device.destroy_texture(depth)?;
        }
        self.description.width = width;
        self.description.height = height;
        self.back_buffer = Self::create_back_buffer(&self.device, &self.description)?;
        debug!(width, height, "D3D12 back buffer resized");
        Ok(())
    }

    fn present(&mut self, list: &mut CommandList<B>) -> Result<()> {
        let value = list.flush(false)?;
        if let Some(previous) = self.in_flight.replace(value) {
            self.device.wait_for_fence(previous)?;
        }
        self.device.begin_frame();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfx_core::{Color4, DeviceConfig};
    use gfx_d3d12::SoftD3d12;
    use gfx_gl::{SoftGl, SoftPlatform};

    fn gl_device() -> (GlDevice<SoftGl, SoftPlatform>, Arc<SoftPlatform>) {
        let platform = Arc::new(SoftPlatform::new(64, 48));
        let device = GlDevice::new(Arc::new(SoftGl::new(64, 48)), Arc::clone(&platform), DeviceConfig::default()).unwrap();
        (device, platform)
    }

    #[test]
    fn gl_present_swaps_and_advances_the_frame() {
        let (mut device, platform) = gl_device();
        let mut presenter = GlPresenter::new(&mut device, PresenterDescription::new(64, 48)).unwrap();

        presenter.present(&mut device).unwrap();
        presenter.present(&mut device).unwrap();
        assert_eq!(platform.swap_count(), 2);
        assert_eq!(device.frame_counter(), 2);
        assert_eq!(device.context_depth(), 0);
    }

    #[test]
    fn gl_resize_recreates_the_back_buffer() {
        let (mut device, _platform) = gl_device();
        let mut presenter = GlPresenter::new(&mut device, PresenterDescription::new(64, 48)).unwrap();
        let old = presenter.back_buffer();

        presenter.resize(&mut device, 32, 16).unwrap();
        let new = presenter.back_buffer();
        assert!(device.texture(old.color).is_none());
        let color = device.texture(new.color).unwrap();
        assert_eq!((color.width(), color.height()), (32, 16));
        assert_eq!(presenter.description().width, 32);
        let window = device.texture(device.window_texture()).unwrap();
        assert_eq!((window.width(), window.height()), (32, 16));
    }

    #[test]
    fn failed_gl_resize_still_leaves_a_live_back_buffer() {
        let (mut device, _platform) = gl_device();
        let mut presenter = GlPresenter::new(&mut device, PresenterDescription::new(64, 48)).unwrap();
        let old = presenter.back_buffer();
        device.begin().unwrap();
        device.destroy_texture(old.color).unwrap();
        device.end().unwrap();

        assert!(presenter.resize(&mut device, 32, 16).is_err());
        let new = presenter.back_buffer();
        let old_depth = old.depth_stencil.unwrap();
        assert!(device.texture(old_depth).is_none());
        let color = device.texture(new.color).unwrap();
        assert_eq!((color.width(), color.height()), (64, 48));
        assert!(device.texture(new.depth_stencil.unwrap()).is_some());
        assert_eq!(presenter.description().width, 64);
        assert_eq!(device.context_depth(), 0);
        presenter.present(&mut device).unwrap();
    }

    #[test]
    fn zero_sized_presenters_are_rejected() {
        let (mut device, _platform) = gl_device();
        assert!(GlPresenter::new(&mut device, PresenterDescription::new(0, 48)).is_err());
        let mut presenter = GlPresenter::new(&mut device, PresenterDescription::new(64, 48)).unwrap();
        assert!(presenter.resize(&mut device, 64, 0).is_err());
    }

    #[test]
    fn d3d12_present_keeps_one_frame_in_flight() {
        let device = D3d12Device::new(Arc::new(SoftD3d12::new()), DeviceConfig::default()).unwrap();
        let mut presenter = D3d12Presenter::new(Arc::clone(&device), PresenterDescription::new(16, 16)).unwrap();
        let mut list = device.create_command_list().unwrap();

        let back_buffer = presenter.back_buffer();
        list.set_render_target(back_buffer.depth_stencil, Some(back_buffer.color)).unwrap();
        list.clear_render_target(back_buffer.color, Color4::BLACK).unwrap();
        presenter.present(&mut list).unwrap();
        let first = presenter.last_present().unwrap();
        assert!(!device.is_fence_complete(first));

        presenter.present(&mut list).unwrap();
        assert!(device.is_fence_complete(first));
        assert_eq!(device.frame_counter(), 2);
    }

    #[test]
    fn d3d12_resize_unbinds_the_old_targets() {
        let device = D3d12Device::new(Arc::new(SoftD3d12::new()), DeviceConfig::default()).unwrap();
        let mut presenter = D3d12Presenter::new(Arc::clone(&device), PresenterDescription::new(16, 16)).unwrap();
        let mut list = device.create_command_list().unwrap();
        let old = presenter.back_buffer();
        list.set_render_target(old.depth_stencil, Some(old.color)).unwrap();

        presenter.resize(&mut list, 8, 8).unwrap();
        assert!(list.render_targets().is_empty());
        assert_eq!(list.depth_stencil(), None);
        assert!(device.texture(old.color).is_none());
        let new = device.texture(presenter.back_buffer().color).unwrap();
        assert_eq!(new.description().width, 8);
    }
}

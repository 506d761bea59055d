//! Backend selection.

use std::sync::Arc;

use anyhow::Result;
use gfx_core::{DeviceConfig, FrameStats, GraphicsDeviceStatus, GraphicsProfile};
use gfx_d3d12::{D3d12Backend, D3d12Device, SoftD3d12};
use gfx_gl::{GlApi, GlDevice, GlPlatform, NativeGl, SoftGl, SoftPlatform, SoftProfile};
use tracing::info;

/// Which native API a device runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    OpenGl,
    Direct3D12,
}

impl BackendKind {
    /// Direct3D 12 on Windows, OpenGL everywhere else.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            BackendKind::Direct3D12
        } else {
            BackendKind::OpenGl
        }
    }
}

/// A graphics device on either backend.
pub enum GraphicsDevice<A: GlApi, P: GlPlatform, B: D3d12Backend> {
    OpenGl(GlDevice<A, P>),
    Direct3D12(Arc<D3d12Device<B>>),
}

/// Devices on the software backends, for tests and headless tools.
pub type HeadlessDevice = GraphicsDevice<SoftGl, SoftPlatform, SoftD3d12>;

impl<A: GlApi, P: GlPlatform, B: D3d12Backend> GraphicsDevice<A, P, B> {
    pub fn kind(&self) -> BackendKind {
        match self {
            GraphicsDevice::OpenGl(_) => BackendKind::OpenGl,
            GraphicsDevice::Direct3D12(_) => BackendKind::Direct3D12,
        }
    }

    pub fn profile(&self) -> GraphicsProfile {
        match self {
            GraphicsDevice::OpenGl(device) => device.profile(),
            GraphicsDevice::Direct3D12(device) => device.profile(),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        match self {
            GraphicsDevice::OpenGl(device) => device.config(),
            GraphicsDevice::Direct3D12(device) => device.config(),
        }
    }

    pub fn as_gl(&mut self) -> Option<&mut GlDevice<A, P>> {
        match self {
            GraphicsDevice::OpenGl(device) => Some(device),
            GraphicsDevice::Direct3D12(_) => None,
        }
    }

    pub fn as_d3d12(&self) -> Option<&Arc<D3d12Device<B>>> {
        match self {
            GraphicsDevice::OpenGl(_) => None,
            GraphicsDevice::Direct3D12(device) => Some(device),
        }
    }

    pub fn status(&self) -> GraphicsDeviceStatus {
        match self {
            GraphicsDevice::OpenGl(device) => device.status(),
            GraphicsDevice::Direct3D12(device) => device.status(),
        }
    }

    /// The next [`status`](Self::status) reports `Reset` once.
    pub fn simulate_reset(&self) {
        match self {
            GraphicsDevice::OpenGl(device) => device.simulate_reset(),
            GraphicsDevice::Direct3D12(device) => device.simulate_reset(),
        }
    }

    pub fn begin_frame(&mut self) {
        match self {
            GraphicsDevice::OpenGl(device) => device.begin_frame(),
            GraphicsDevice::Direct3D12(device) => device.begin_frame(),
        }
    }

    pub fn frame_counter(&self) -> u64 {
        match self {
            GraphicsDevice::OpenGl(device) => device.frame_counter(),
            GraphicsDevice::Direct3D12(device) => device.frame_counter(),
        }
    }

    pub fn frame_stats(&self) -> FrameStats {
        match self {
            GraphicsDevice::OpenGl(device) => device.frame_stats(),
            GraphicsDevice::Direct3D12(device) => device.frame_stats(),
        }
    }

    /// Release the contexts while the application is in the background.
    /// Direct3D 12 has nothing to release.
    pub fn pause(&self) -> Result<()> {
        match self {
            GraphicsDevice::OpenGl(device) => device.pause(),
            GraphicsDevice::Direct3D12(_) => Ok(()),
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self {
            GraphicsDevice::OpenGl(device) => device.resume(),
            GraphicsDevice::Direct3D12(_) => Ok(()),
        }
    }

    pub fn dispose(&mut self) -> Result<()> {
        match self {
            GraphicsDevice::OpenGl(device) => device.dispose(),
            GraphicsDevice::Direct3D12(device) => device.dispose(),
        }
    }
}

impl<P: GlPlatform, B: D3d12Backend> GraphicsDevice<NativeGl, P, B> {
    /// Open a GL device on the platform's main context. The GL entry points
    /// are loaded on the first call.
    pub fn opengl(platform: Arc<P>, config: DeviceConfig) -> Result<Self> {
        platform.make_current(Some(platform.main_context()))?;
        let api = NativeGl::load();
        platform.make_current(None)?;
        let device = GlDevice::new(Arc::new(api?), platform, config)?;
        Ok(GraphicsDevice::OpenGl(device))
    }
}

#[cfg(windows)]
impl<A: GlApi, P: GlPlatform> GraphicsDevice<A, P, gfx_d3d12::WindowsD3d12> {
    /// Open Direct3D 12 on the first hardware adapter, or WARP.
    pub fn direct3d12(config: DeviceConfig) -> Result<Self> {
        let backend = Arc::new(gfx_d3d12::WindowsD3d12::new());
        Ok(GraphicsDevice::Direct3D12(D3d12Device::new(backend, config)?))
    }
}

impl HeadlessDevice {
    /// A device on the software backend of `kind`. `width` × `height` is the
    /// GL window size.
    pub fn headless(kind: BackendKind, width: u32, height: u32, config: DeviceConfig) -> Result<Self> {
        match kind {
            BackendKind::OpenGl => Self::headless_gl(SoftProfile::Desktop43, width, height, config),
            BackendKind::Direct3D12 => Self::headless_d3d12(config),
        }
    }

    pub fn headless_gl(profile: SoftProfile, width: u32, height: u32, config: DeviceConfig) -> Result<Self> {
        let api = Arc::new(SoftGl::with_profile(profile, width, height));
        let platform = Arc::new(SoftPlatform::new(width, height));
        let device = GlDevice::new(api, platform, config)?;
        info!(?profile, width, height, "created headless GL device");
        Ok(GraphicsDevice::OpenGl(device))
    }

    pub fn headless_d3d12(config: DeviceConfig) -> Result<Self> {
        let device = D3d12Device::new(Arc::new(SoftD3d12::new()), config)?;
        info!("created headless D3D12 device");
        Ok(GraphicsDevice::Direct3D12(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BackendKind::OpenGl)]
    #[case(BackendKind::Direct3D12)]
    fn headless_devices_start_healthy(#[case] kind: BackendKind) {
        let mut device = HeadlessDevice::headless(kind, 32, 32, DeviceConfig::default()).unwrap();
        assert_eq!(device.kind(), kind);
        assert_eq!(device.status(), GraphicsDeviceStatus::Normal);
        assert_eq!(device.frame_counter(), 0);

        device.begin_frame();
        assert_eq!(device.frame_counter(), 1);
        assert_eq!(device.frame_stats(), FrameStats::default());
    }

    #[test]
    fn accessors_match_the_backend() {
        let mut gl = HeadlessDevice::headless(BackendKind::OpenGl, 8, 8, DeviceConfig::default()).unwrap();
        assert!(gl.as_gl().is_some());
        assert!(gl.as_d3d12().is_none());

        let mut d3d12 = HeadlessDevice::headless(BackendKind::Direct3D12, 8, 8, DeviceConfig::default()).unwrap();
        assert!(d3d12.as_gl().is_none());
        assert_eq!(d3d12.profile(), GraphicsProfile::Level_11_0);
    }
}

//! Device-loss recovery.
//!
//! [`ResumeManager::on_frame`] is called once per frame before rendering.
//! It polls the device status; when the device is lost it destroys every
//! native object, then recreates them as soon as the device can be opened
//! again, reporting which resources lost their contents.

use std::sync::Arc;

use anyhow::{Context, Result};
use gfx_core::GraphicsDeviceStatus;
use gfx_d3d12::{D3d12Backend, D3d12Device};
use gfx_gl::{GlApi, GlDevice, GlPlatform};
use tracing::{error, info, warn};

use crate::device::GraphicsDevice;

/// Counts of resources whose contents must be uploaded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LostResources {
    pub textures: usize,
    pub buffers: usize,
}

/// A device that can drop and rebuild its native objects.
pub trait RecoverableDevice {
    fn status(&self) -> GraphicsDeviceStatus;

    /// Whether a new native device can be opened now. A lost GL context
    /// has to be restored by the platform first.
    fn can_recreate(&self) -> bool {
        true
    }

    fn destroy_native(&mut self) -> Result<()>;

    fn recreate_native(&mut self) -> Result<LostResources>;
}

impl<A: GlApi, P: GlPlatform> RecoverableDevice for GlDevice<A, P> {
    fn status(&self) -> GraphicsDeviceStatus {
        GlDevice::status(self)
    }

    fn can_recreate(&self) -> bool {
        !self.platform().is_context_lost()
    }

    fn destroy_native(&mut self) -> Result<()> {
        self.begin()?;
        self.on_destroyed();
        self.end()
    }

    fn recreate_native(&mut self) -> Result<LostResources> {
        self.begin()?;
        let lost = self.on_recreate();
        self.end()?;
        let lost = lost?;
        Ok(LostResources {
            textures: lost.textures.len(),
            buffers: lost.buffers.len(),
        })
    }
}

impl<B: D3d12Backend> RecoverableDevice for Arc<D3d12Device<B>> {
    fn status(&self) -> GraphicsDeviceStatus {
        D3d12Device::status(self)
    }

    fn destroy_native(&mut self) -> Result<()> {
        // A removed device may never signal the fence again.
        if let Err(err) = self.wait_idle() {
            warn!(error = %err, "could not drain the queue before destroying");
        }
        self.on_destroyed();
        Ok(())
    }

    fn recreate_native(&mut self) -> Result<LostResources> {
        let lost = self.on_recreate()?;
        Ok(LostResources {
            textures: lost.textures.len(),
            buffers: lost.buffers.len(),
        })
    }
}

impl<A: GlApi, P: GlPlatform, B: D3d12Backend> RecoverableDevice for GraphicsDevice<A, P, B> {
    fn status(&self) -> GraphicsDeviceStatus {
        GraphicsDevice::status(self)
    }

    fn can_recreate(&self) -> bool {
        match self {
            GraphicsDevice::OpenGl(device) => device.can_recreate(),
            GraphicsDevice::Direct3D12(device) => device.can_recreate(),
        }
    }

    fn destroy_native(&mut self) -> Result<()> {
        match self {
            GraphicsDevice::OpenGl(device) => device.destroy_native(),
            GraphicsDevice::Direct3D12(device) => device.destroy_native(),
        }
    }

    fn recreate_native(&mut self) -> Result<LostResources> {
        match self {
            GraphicsDevice::OpenGl(device) => device.recreate_native(),
            GraphicsDevice::Direct3D12(device) => device.recreate_native(),
        }
    }
}

/// What [`ResumeManager::on_frame`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Healthy,
    /// The device came back; the listed contents are gone.
    Recovered(LostResources),
    /// The device is lost and could not be recreated yet. Skip the frame.
    Lost(GraphicsDeviceStatus),
}

impl RecoveryOutcome {
    pub fn can_render(self) -> bool {
        !matches!(self, RecoveryOutcome::Lost(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Destroyed(GraphicsDeviceStatus),
}

/// Drives device-loss recovery from the frame loop.
#[derive(Debug)]
pub struct ResumeManager {
    state: State,
    failed_attempts: u32,
    max_attempts: u32,
}

impl Default for ResumeManager {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ResumeManager {
    /// Give up after `max_attempts` consecutive failed recreations.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: State::Running,
            failed_attempts: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self.state, State::Destroyed(_))
    }

    pub fn on_frame(&mut self, device: &mut impl RecoverableDevice) -> Result<RecoveryOutcome> {
        let status = match self.state {
            State::Destroyed(status) => status,
            State::Running => match device.status() {
                GraphicsDeviceStatus::Normal => return Ok(RecoveryOutcome::Healthy),
                GraphicsDeviceStatus::InvalidCall => {
                    error!("device reported an invalid call; not recreating");
                    return Ok(RecoveryOutcome::Lost(GraphicsDeviceStatus::InvalidCall));
                }
                status => {
                    info!(?status, "destroying device resources");
                    device.destroy_native()?;
                    self.state = State::Destroyed(status);
                    status
                }
            },
        };
        self.try_recreate(device, status)
    }

    fn try_recreate(&mut self, device: &mut impl RecoverableDevice, status: GraphicsDeviceStatus) -> Result<RecoveryOutcome> {
        if !device.can_recreate() {
            return Ok(RecoveryOutcome::Lost(status));
        }
        match device.recreate_native() {
            Ok(lost) => {
                info!(textures = lost.textures, buffers = lost.buffers, "device recovered");
                self.state = State::Running;
                self.failed_attempts = 0;
                Ok(RecoveryOutcome::Recovered(lost))
            }
            Err(err) => {
                self.failed_attempts += 1;
                if self.failed_attempts >= self.max_attempts {
                    return Err(err).with_context(|| format!("device recovery failed {} times", self.failed_attempts));
                }
                warn!(error = %err, attempt = self.failed_attempts, "device recreation failed; retrying next frame");
                Ok(RecoveryOutcome::Lost(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use gfx_core::{DeviceConfig, PixelFormat, TextureDescription, TextureFlags};
    use gfx_d3d12::SoftD3d12;
    use gfx_gl::{SoftGl, SoftPlatform};

    /// Scripted device: a status sequence and a number of failing
    /// recreations.
    struct Scripted {
        statuses: Vec<GraphicsDeviceStatus>,
        failures: u32,
        destroyed: u32,
        recreated: u32,
    }

    impl Scripted {
        fn new(statuses: &[GraphicsDeviceStatus], failures: u32) -> Self {
            Self {
                statuses: statuses.iter().rev().copied().collect(),
                failures,
                destroyed: 0,
                recreated: 0,
            }
        }
    }

    impl RecoverableDevice for Scripted {
        fn status(&self) -> GraphicsDeviceStatus {
            self.statuses.last().copied().unwrap_or_default()
        }

        fn destroy_native(&mut self) -> Result<()> {
            self.statuses.pop();
            self.destroyed += 1;
            Ok(())
        }

        fn recreate_native(&mut self) -> Result<LostResources> {
            if self.failures > 0 {
                self.failures -= 1;
                bail!("adapter unavailable");
            }
            self.recreated += 1;
            Ok(LostResources { textures: 1, buffers: 0 })
        }
    }

    #[test]
    fn healthy_devices_are_left_alone() {
        let mut device = Scripted::new(&[], 0);
        let mut manager = ResumeManager::default();
        assert_eq!(manager.on_frame(&mut device).unwrap(), RecoveryOutcome::Healthy);
        assert_eq!(device.destroyed, 0);
    }

    #[test]
    fn failed_recreations_are_retried() {
        let mut device = Scripted::new(&[GraphicsDeviceStatus::Removed], 1);
        let mut manager = ResumeManager::default();

        let outcome = manager.on_frame(&mut device).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Lost(GraphicsDeviceStatus::Removed));
        assert!(!outcome.can_render());
        assert!(manager.is_device_lost());

        let outcome = manager.on_frame(&mut device).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered(LostResources { textures: 1, buffers: 0 }));
        assert_eq!((device.destroyed, device.recreated), (1, 1));
        assert!(!manager.is_device_lost());
    }

    #[test]
    fn recovery_gives_up_after_the_attempt_limit() {
        let mut device = Scripted::new(&[GraphicsDeviceStatus::Hung], 5);
        let mut manager = ResumeManager::new(2);
        assert!(manager.on_frame(&mut device).is_ok());
        let err = manager.on_frame(&mut device).unwrap_err();
        assert!(format!("{err:#}").contains("adapter unavailable"));
    }

    #[test]
    fn invalid_calls_do_not_recreate() {
        let mut device = Scripted::new(&[GraphicsDeviceStatus::InvalidCall], 0);
        let mut manager = ResumeManager::default();
        assert_eq!(
            manager.on_frame(&mut device).unwrap(),
            RecoveryOutcome::Lost(GraphicsDeviceStatus::InvalidCall)
        );
        assert_eq!(device.destroyed, 0);
    }

    #[test]
    fn lost_gl_contexts_wait_for_the_platform() {
        let platform = Arc::new(SoftPlatform::new(16, 16));
        let mut device = GlDevice::new(Arc::new(SoftGl::new(16, 16)), Arc::clone(&platform), DeviceConfig::default()).unwrap();
        device.begin().unwrap();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let texture = device.create_texture(desc, Some(&[7; 64])).unwrap();
        device.end().unwrap();
        let mut manager = ResumeManager::default();

        platform.lose_context();
        assert_eq!(
            manager.on_frame(&mut device).unwrap(),
            RecoveryOutcome::Lost(GraphicsDeviceStatus::Reset)
        );
        assert_eq!(
            manager.on_frame(&mut device).unwrap(),
            RecoveryOutcome::Lost(GraphicsDeviceStatus::Reset)
        );

        platform.restore_context();
        match manager.on_frame(&mut device).unwrap() {
            RecoveryOutcome::Recovered(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(device.texture(texture).is_some());
        assert_eq!(manager.on_frame(&mut device).unwrap(), RecoveryOutcome::Healthy);
    }

    #[test]
    fn simulated_d3d12_reset_recovers() {
        let mut device = D3d12Device::new(Arc::new(SoftD3d12::new()), DeviceConfig::default()).unwrap();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET);
        let texture = device.create_texture(desc, None).unwrap();
        let mut manager = ResumeManager::default();

        device.simulate_reset();
        assert!(matches!(manager.on_frame(&mut device).unwrap(), RecoveryOutcome::Recovered(_)));
        assert!(device.texture(texture).unwrap().native_resource().is_some());
        assert_eq!(manager.on_frame(&mut device).unwrap(), RecoveryOutcome::Healthy);
    }
}

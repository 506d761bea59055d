//! Device status polling.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Health of the native device, polled once per frame by the presenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GraphicsDeviceStatus {
    #[default]
    Normal,
    /// The device was reset; resources must be recreated.
    Reset,
    /// The device was physically removed or the driver upgraded.
    Removed,
    Hung,
    InternalError,
    /// The application issued an invalid command.
    InvalidCall,
}

impl GraphicsDeviceStatus {
    pub fn is_lost(self) -> bool {
        self != GraphicsDeviceStatus::Normal
    }
}

/// Wraps a backend's native status query with a one-shot simulated reset.
#[derive(Debug, Default)]
pub struct DeviceStatusMonitor {
    simulate_reset: AtomicBool,
}

impl DeviceStatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next [`poll`](Self::poll) reports [`GraphicsDeviceStatus::Reset`]
    /// regardless of the native state.
    pub fn simulate_reset(&self) {
        self.simulate_reset.store(true, Ordering::Release);
    }

    pub fn poll(&self, native: impl FnOnce() -> GraphicsDeviceStatus) -> GraphicsDeviceStatus {
        if self.simulate_reset.swap(false, Ordering::AcqRel) {
            return GraphicsDeviceStatus::Reset;
        }
        let status = native();
        if status.is_lost() {
            warn!(?status, "graphics device lost");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_reset_is_reported_once() {
        let monitor = DeviceStatusMonitor::new();
        monitor.simulate_reset();
        assert_eq!(monitor.poll(|| GraphicsDeviceStatus::Normal), GraphicsDeviceStatus::Reset);
        assert_eq!(monitor.poll(|| GraphicsDeviceStatus::Normal), GraphicsDeviceStatus::Normal);
    }

    #[test]
    fn native_status_passes_through() {
        let monitor = DeviceStatusMonitor::new();
        assert_eq!(monitor.poll(|| GraphicsDeviceStatus::Hung), GraphicsDeviceStatus::Hung);
    }
}

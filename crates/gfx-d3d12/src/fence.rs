//! Queue submission and the fence that orders it.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{D3d12Backend, NativeCommandList};

/// Hands out monotonically increasing fence values, one per submission.
///
/// Values start at 1 so that 0 always reads as complete.
#[derive(Debug)]
pub struct FenceTracker {
    next_value: Mutex<u64>,
    last_completed: AtomicU64,
    wait_lock: Mutex<()>,
}

impl Default for FenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceTracker {
    pub fn new() -> Self {
        Self {
            next_value: Mutex::new(1),
            last_completed: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
        }
    }

    /// Value the next submission will signal.
    pub fn next_value(&self) -> u64 {
        *self.next_value.lock()
    }

    /// Submit `list` and signal the fence after it. Returns the signaled
    /// value.
    pub fn execute<B: D3d12Backend + ?Sized>(&self, backend: &B, list: NativeCommandList) -> Result<u64> {
        let mut next = self.next_value.lock();
        backend.execute(list).context("executing command list")?;
        let value = *next;
        backend.signal(value).context("signaling fence")?;
        *next += 1;
        trace!(value, "submitted command list");
        Ok(value)
    }

    /// Signal the fence without submitting work.
    pub fn signal<B: D3d12Backend + ?Sized>(&self, backend: &B) -> Result<u64> {
        let mut next = self.next_value.lock();
        let value = *next;
        backend.signal(value).context("signaling fence")?;
        *next += 1;
        Ok(value)
    }

    /// Refresh the cached completed value from the native fence.
    pub fn completed_value<B: D3d12Backend + ?Sized>(&self, backend: &B) -> u64 {
        let native = backend.completed_value();
        self.last_completed.fetch_max(native, Ordering::AcqRel).max(native)
    }

    pub fn is_complete<B: D3d12Backend + ?Sized>(&self, backend: &B, value: u64) -> bool {
        if value <= self.last_completed.load(Ordering::Acquire) {
            return true;
        }
        value <= self.completed_value(backend)
    }

    /// Block until `value` completed. Waits are serialized.
    pub fn wait<B: D3d12Backend + ?Sized>(&self, backend: &B, value: u64) -> Result<()> {
        if self.is_complete(backend, value) {
            return Ok(());
        }
        let _guard = self.wait_lock.lock();
        backend.wait_for_value(value).context("waiting for fence")?;
        self.last_completed.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Wait for every submission so far.
    pub fn wait_idle<B: D3d12Backend + ?Sized>(&self, backend: &B) -> Result<()> {
        let last = self.signal(backend)?;
        self.wait(backend, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftD3d12;
    use gfx_core::GraphicsProfile;

    fn backend() -> SoftD3d12 {
        let soft = SoftD3d12::new();
        soft.open(GraphicsProfile::Level_11_0, false).unwrap();
        soft
    }

    #[test]
    fn values_increase_per_submission() {
        let soft = backend();
        let fence = FenceTracker::new();
        assert_eq!(fence.next_value(), 1);
        assert!(fence.is_complete(&soft, 0));

        let allocator = soft.create_command_allocator().unwrap();
        let list = soft.create_command_list(allocator).unwrap();
        soft.close_command_list(list).unwrap();
        assert_eq!(fence.execute(&soft, list).unwrap(), 1);
        assert_eq!(fence.next_value(), 2);
        assert!(!fence.is_complete(&soft, 1));

        fence.wait(&soft, 1).unwrap();
        assert!(fence.is_complete(&soft, 1));
        assert!(!fence.is_complete(&soft, 2));
    }

    #[test]
    fn idle_wait_completes_everything() {
        let soft = backend();
        let fence = FenceTracker::new();
        fence.signal(&soft).unwrap();
        fence.signal(&soft).unwrap();
        fence.wait_idle(&soft).unwrap();
        assert!(fence.is_complete(&soft, 3));
        assert_eq!(fence.next_value(), 4);
    }
}

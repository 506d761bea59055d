//! Scoped "current device" tracking.
//!
//! Code that needs to know which device is active on this thread (resource
//! constructors called from deep inside a frame, debug checks) reads
//! [`current_device`]. Devices become current by entering a [`DeviceScope`];
//! dropping the returned guard restores the previous device, including on
//! early return or unwinding.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

thread_local! {
    static DEVICE_STACK: RefCell<Vec<DeviceId>> = const { RefCell::new(Vec::new()) };
}

/// Guard returned by [`DeviceScope::enter`].
#[must_use = "the device stops being current when the scope is dropped"]
pub struct DeviceScope {
    id: DeviceId,
    depth: usize,
    // Guards are tied to the thread whose stack they pushed onto.
    _not_send: PhantomData<*const ()>,
}

impl DeviceScope {
    pub fn enter(id: DeviceId) -> Self {
        let depth = DEVICE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(id);
            stack.len()
        });
        Self {
            id,
            depth,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }
}

impl Drop for DeviceScope {
    fn drop(&mut self) {
        DEVICE_STACK.with(|stack| {
            // Truncate rather than pop so a guard dropped out of order
            // still unwinds everything entered after it.
            stack.borrow_mut().truncate(self.depth - 1);
        });
    }
}

/// The innermost device entered on this thread.
pub fn current_device() -> Option<DeviceId> {
    DEVICE_STACK.with(|stack| stack.borrow().last().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_restore_previous() {
        let a = DeviceId::next();
        let b = DeviceId::next();
        assert_eq!(current_device(), None);
        {
            let _outer = DeviceScope::enter(a);
            assert_eq!(current_device(), Some(a));
            {
                let _inner = DeviceScope::enter(b);
                assert_eq!(current_device(), Some(b));
            }
            assert_eq!(current_device(), Some(a));
        }
        assert_eq!(current_device(), None);
    }

    #[test]
    fn scope_is_popped_on_unwind() {
        let id = DeviceId::next();
        let result = std::panic::catch_unwind(|| {
            let _scope = DeviceScope::enter(id);
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(current_device(), None);
    }
}

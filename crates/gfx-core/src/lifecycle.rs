//! Device-loss lifecycle of GPU resources.

/// Lifetime state of a resource's native handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifetimeState {
    /// The native handle is valid.
    #[default]
    Active,
    /// The device was lost; the handle was dropped and awaits recreation.
    Destroyed,
    /// The resource was disposed by its owner and will not come back.
    Disposed,
}

/// A resource whose native handle is owned by a device context `C`.
///
/// `on_destroyed` must be idempotent and must leave the resource without a
/// native handle. `on_recreate` rebuilds the handle from the stored
/// description and returns `Ok(false)` when the contents could not be
/// restored (the owner must re-upload them).
pub trait DeviceChild<C: ?Sized> {
    fn on_destroyed(&mut self, ctx: &mut C);

    fn on_recreate(&mut self, ctx: &mut C) -> anyhow::Result<bool>;

    fn lifetime_state(&self) -> LifetimeState;
}

//! Windowing-system side of a GL device: contexts, swap and window size.

use anyhow::Result;
use gl::types::GLuint;

/// Opaque identifier of a native GL context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// Context management supplied by the windowing layer (EGL, WGL, GLX, ...).
///
/// Implementations must be shareable across threads: background resource
/// creation binds contexts from worker threads.
pub trait GlPlatform: Send + Sync {
    /// The context the device renders with.
    fn main_context(&self) -> ContextId;

    /// A context sharing objects with the main one, for background
    /// creation. `None` selects the main-thread fallback.
    fn create_shared_context(&self) -> Option<ContextId>;

    /// Bind `context` on the calling thread, or unbind with `None`.
    fn make_current(&self, context: Option<ContextId>) -> Result<()>;

    /// The context bound on the calling thread.
    fn current_context(&self) -> Option<ContextId>;

    fn swap_buffers(&self) -> Result<()>;

    /// Size of the window's default framebuffer.
    fn window_size(&self) -> (u32, u32);

    /// Name of the framebuffer object the window presents from.
    fn default_framebuffer(&self) -> GLuint {
        0
    }

    /// The native context was lost (mobile background, driver reset).
    fn is_context_lost(&self) -> bool {
        false
    }
}

//! Context ownership: Begin/End nesting on the render thread and the
//! background creation context used by loader threads.
//!
//! With a shared secondary context, loader threads bind it while they
//! create resources and never touch the main context. Without one, every
//! thread shares the main context under a single lock: the render thread
//! holds it between its outermost `begin`/`end` and yields it to waiting
//! loaders from [`AsyncCreationContext::execute_pending_tasks`].

use std::sync::Arc;
use std::thread::{self, ThreadId};

use anyhow::Result;
use gfx_core::{AsyncCreationMode, DeviceId, DeviceScope, GraphicsError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::api::GlApi;
use crate::platform::{ContextId, GlPlatform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreationMode {
    Shared(ContextId),
    MainThread,
}

#[derive(Debug, Default)]
struct LockState {
    /// Thread holding the main context in main-thread mode.
    owner: Option<ThreadId>,
    /// Loader threads waiting for the main context.
    pending: usize,
    paused: bool,
}

/// Context used for resource creation off the render thread.
pub struct AsyncCreationContext<P: GlPlatform> {
    platform: Arc<P>,
    mode: CreationMode,
    /// Serializes use of the shared context; it can be current on one
    /// thread at a time.
    shared_in_use: Mutex<()>,
    lock: Mutex<LockState>,
    changed: Condvar,
}

impl<P: GlPlatform> AsyncCreationContext<P> {
    pub fn new(platform: Arc<P>, mode: AsyncCreationMode) -> Result<Self> {
        let mode = match mode {
            AsyncCreationMode::MainThread => CreationMode::MainThread,
            AsyncCreationMode::SharedContext => match platform.create_shared_context() {
                Some(context) => CreationMode::Shared(context),
                None => {
                    return Err(GraphicsError::unsupported("shared GL contexts on this platform").into());
                }
            },
            AsyncCreationMode::Auto => match platform.create_shared_context() {
                Some(context) => CreationMode::Shared(context),
                None => {
                    warn!("no shared GL context available, background creation falls back to the main context");
                    CreationMode::MainThread
                }
            },
        };
        debug!(?mode, "async creation context ready");
        Ok(Self {
            platform,
            mode,
            shared_in_use: Mutex::new(()),
            lock: Mutex::new(LockState::default()),
            changed: Condvar::new(),
        })
    }

    /// True when loaders share the main context under the lock.
    pub fn is_main_thread_mode(&self) -> bool {
        self.mode == CreationMode::MainThread
    }

    /// Loader threads are waiting for the render thread to yield.
    pub fn has_pending_tasks(&self) -> bool {
        self.lock.lock().pending > 0
    }

    /// Make a context usable for resource creation on the calling thread
    /// until the guard drops. No-op when the thread already has one.
    pub fn acquire(&self) -> Result<CreationGuard<'_, P>> {
        match self.mode {
            CreationMode::Shared(context) => {
                if self.platform.current_context().is_some() {
                    return Ok(CreationGuard::noop(self));
                }
                {
                    let mut state = self.lock.lock();
                    while state.paused {
                        self.changed.wait(&mut state);
                    }
                }
                let in_use = self.shared_in_use.lock();
                self.platform.make_current(Some(context))?;
                Ok(CreationGuard {
                    owner: self,
                    kind: GuardKind::Shared(in_use),
                })
            }
            CreationMode::MainThread => {
                let me = thread::current().id();
                {
                    let mut state = self.lock.lock();
                    if state.owner == Some(me) {
                        return Ok(CreationGuard::noop(self));
                    }
                    state.pending += 1;
                    while state.owner.is_some() || state.paused {
                        self.changed.wait(&mut state);
                    }
                    state.pending -= 1;
                    state.owner = Some(me);
                }
                if let Err(err) = self.platform.make_current(Some(self.platform.main_context())) {
                    self.release_owner(me);
                    return Err(err);
                }
                Ok(CreationGuard {
                    owner: self,
                    kind: GuardKind::Main(me),
                })
            }
        }
    }

    /// Run `f` with a creation context bound.
    pub fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        f()
    }

    /// Take the main context lock for the render thread.
    pub(crate) fn lock_main(&self) {
        let me = thread::current().id();
        let mut state = self.lock.lock();
        while state.owner.is_some_and(|owner| owner != me) {
            self.changed.wait(&mut state);
        }
        state.owner = Some(me);
    }

    pub(crate) fn unlock_main(&self) {
        self.release_owner(thread::current().id());
    }

    fn release_owner(&self, thread: ThreadId) {
        let mut state = self.lock.lock();
        if state.owner == Some(thread) {
            state.owner = None;
            self.changed.notify_all();
        }
    }

    /// Yield the main context to waiting loaders and take it back once
    /// they are all done. Returns whether anything ran.
    pub fn execute_pending_tasks(&self) -> Result<bool> {
        if !self.is_main_thread_mode() {
            return Ok(false);
        }
        let me = thread::current().id();
        {
            let state = self.lock.lock();
            if state.pending == 0 || state.owner != Some(me) {
                return Ok(false);
            }
        }

        self.platform.make_current(None)?;
        {
            let mut state = self.lock.lock();
            state.owner = None;
            self.changed.notify_all();
            while state.pending > 0 || state.owner.is_some() {
                self.changed.wait(&mut state);
            }
            state.owner = Some(me);
        }
        self.platform.make_current(Some(self.platform.main_context()))?;
        Ok(true)
    }

    /// Block loaders, drain the GPU under the creation context and leave
    /// no context bound. Called when the application goes to background.
    pub fn pause(&self, api: &impl GlApi) -> Result<()> {
        let me = thread::current().id();
        {
            let mut state = self.lock.lock();
            while state.owner.is_some_and(|owner| owner != me) {
                self.changed.wait(&mut state);
            }
            state.owner = Some(me);
            state.paused = true;
        }
        let context = match self.mode {
            CreationMode::Shared(context) => context,
            CreationMode::MainThread => self.platform.main_context(),
        };
        let _in_use = self.shared_in_use.lock();
        self.platform.make_current(Some(context))?;
        api.finish();
        self.platform.make_current(None)?;
        debug!("graphics paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        // Rebinding validates the main context against the new surface.
        let main = self.platform.main_context();
        self.platform.make_current(Some(main))?;
        self.platform.make_current(None)?;
        {
            let mut state = self.lock.lock();
            state.paused = false;
            if state.owner == Some(thread::current().id()) {
                state.owner = None;
            }
            self.changed.notify_all();
        }
        debug!("graphics resumed");
        Ok(())
    }

    /// Forget any holder of the lock; used when the device is destroyed
    /// while paused.
    pub fn reset_lock(&self) {
        let mut state = self.lock.lock();
        state.owner = None;
        state.paused = false;
        self.changed.notify_all();
    }
}

enum GuardKind<'a> {
    Noop,
    Shared(parking_lot::MutexGuard<'a, ()>),
    Main(ThreadId),
}

/// Keeps the creation context bound on this thread.
#[must_use = "the creation context is released when the guard drops"]
pub struct CreationGuard<'a, P: GlPlatform> {
    owner: &'a AsyncCreationContext<P>,
    kind: GuardKind<'a>,
}

impl<'a, P: GlPlatform> CreationGuard<'a, P> {
    fn noop(owner: &'a AsyncCreationContext<P>) -> Self {
        Self {
            owner,
            kind: GuardKind::Noop,
        }
    }
}

impl<P: GlPlatform> Drop for CreationGuard<'_, P> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.kind, GuardKind::Noop) {
            GuardKind::Noop => {}
            GuardKind::Shared(in_use) => {
                if let Err(err) = self.owner.platform.make_current(None) {
                    warn!(%err, "failed to unbind creation context");
                }
                drop(in_use);
            }
            GuardKind::Main(thread) => {
                if let Err(err) = self.owner.platform.make_current(None) {
                    warn!(%err, "failed to unbind main context");
                }
                self.owner.release_owner(thread);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Begin/End
// ---------------------------------------------------------------------------

/// Begin/End nesting of a device on the render thread.
pub struct ContextTracker<P: GlPlatform> {
    platform: Arc<P>,
    creation: Arc<AsyncCreationContext<P>>,
    device: DeviceId,
    depth: usize,
    keep_context_on_end: bool,
    scope: Option<DeviceScope>,
}

impl<P: GlPlatform> ContextTracker<P> {
    pub fn new(platform: Arc<P>, creation: Arc<AsyncCreationContext<P>>, device: DeviceId) -> Self {
        Self {
            platform,
            creation,
            device,
            depth: 0,
            keep_context_on_end: false,
            scope: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn creation(&self) -> &Arc<AsyncCreationContext<P>> {
        &self.creation
    }

    pub fn begin(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > 1 {
            return Ok(());
        }

        let main = self.platform.main_context();
        if self.creation.is_main_thread_mode() {
            self.creation.lock_main();
            self.keep_context_on_end = false;
        } else {
            self.keep_context_on_end = self.platform.current_context() == Some(main);
            if self.keep_context_on_end {
                self.scope = Some(DeviceScope::enter(self.device));
                return Ok(());
            }
        }

        if let Err(err) = self.platform.make_current(Some(main)) {
            self.depth -= 1;
            if self.creation.is_main_thread_mode() {
                self.creation.unlock_main();
            }
            return Err(err);
        }
        self.scope = Some(DeviceScope::enter(self.device));
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(GraphicsError::UnbalancedEnd.into());
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }

        self.scope = None;
        if self.creation.is_main_thread_mode() {
            let unbound = self.platform.make_current(None);
            self.creation.unlock_main();
            unbound
        } else if !self.keep_context_on_end {
            self.platform.make_current(None)
        } else {
            Ok(())
        }
    }

    /// Debug builds check that the device context is current between
    /// `begin` and `end`.
    pub fn ensure_context_active(&self) -> Result<()> {
        #[cfg(debug_assertions)]
        {
            if self.depth == 0 || self.platform.current_context() != Some(self.platform.main_context()) {
                return Err(GraphicsError::NoContext.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use gfx_core::current_device;

    use super::*;
    use crate::soft::{SoftGl, SoftPlatform};

    fn tracker(platform: &Arc<SoftPlatform>, mode: AsyncCreationMode) -> ContextTracker<SoftPlatform> {
        let creation = Arc::new(AsyncCreationContext::new(Arc::clone(platform), mode).unwrap());
        ContextTracker::new(Arc::clone(platform), creation, DeviceId::next())
    }

    #[test]
    fn nested_begin_binds_once() {
        let platform = Arc::new(SoftPlatform::new(4, 4));
        let mut contexts = tracker(&platform, AsyncCreationMode::Auto);

        contexts.begin().unwrap();
        contexts.begin().unwrap();
        assert!(contexts.ensure_context_active().is_ok());
        contexts.end().unwrap();
        assert_eq!(platform.unbind_calls(), 0);
        contexts.end().unwrap();

        assert_eq!(platform.make_current_calls(), 1);
        assert_eq!(platform.unbind_calls(), 1);
        assert_eq!(platform.current_context(), None);
        assert_eq!(current_device(), None);
    }

    #[test]
    fn extra_end_is_an_error() {
        let platform = Arc::new(SoftPlatform::new(4, 4));
        let mut contexts = tracker(&platform, AsyncCreationMode::Auto);
        contexts.begin().unwrap();
        contexts.end().unwrap();
        let err = contexts.end().unwrap_err();
        assert_eq!(gfx_core::graphics_error(&err), Some(&GraphicsError::UnbalancedEnd));
        assert_eq!(err.to_string(), "End called more than Begin");
    }

    #[test]
    fn already_current_context_is_kept() {
        let platform = Arc::new(SoftPlatform::new(4, 4));
        platform.make_current(Some(platform.main_context())).unwrap();
        let mut contexts = tracker(&platform, AsyncCreationMode::Auto);

        contexts.begin().unwrap();
        contexts.end().unwrap();
        assert_eq!(platform.unbind_calls(), 0);
        assert_eq!(platform.current_context(), Some(platform.main_context()));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn context_check_outside_begin_fails() {
        let platform = Arc::new(SoftPlatform::new(4, 4));
        let contexts = tracker(&platform, AsyncCreationMode::Auto);
        let err = contexts.ensure_context_active().unwrap_err();
        assert_eq!(gfx_core::graphics_error(&err), Some(&GraphicsError::NoContext));
    }

    #[test]
    fn shared_context_required_but_missing() {
        let platform = Arc::new(SoftPlatform::without_shared_contexts(4, 4));
        assert!(AsyncCreationContext::new(platform, AsyncCreationMode::SharedContext).is_err());
    }

    #[test]
    fn loader_binds_shared_context() {
        let platform = Arc::new(SoftPlatform::new(4, 4));
        let creation = Arc::new(AsyncCreationContext::new(Arc::clone(&platform), AsyncCreationMode::Auto).unwrap());
        assert!(!creation.is_main_thread_mode());

        let worker = {
            let platform = Arc::clone(&platform);
            let creation = Arc::clone(&creation);
            thread::spawn(move || {
                creation
                    .run(|| {
                        let bound = platform.current_context();
                        assert!(bound.is_some());
                        assert_ne!(bound, Some(platform.main_context()));
                        Ok(())
                    })
                    .unwrap();
                platform.current_context()
            })
        };
        assert_eq!(worker.join().unwrap(), None);
    }

    #[test]
    fn loader_waits_for_pending_task_service() {
        let platform = Arc::new(SoftPlatform::without_shared_contexts(4, 4));
        let mut contexts = tracker(&platform, AsyncCreationMode::Auto);
        let creation = Arc::clone(contexts.creation());
        assert!(creation.is_main_thread_mode());

        contexts.begin().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let worker = {
            let platform = Arc::clone(&platform);
            let creation = Arc::clone(&creation);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                creation
                    .run(|| {
                        assert_eq!(platform.current_context(), Some(platform.main_context()));
                        ran.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
            })
        };

        while !creation.has_pending_tasks() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!ran.load(Ordering::SeqCst));

        assert!(creation.execute_pending_tasks().unwrap());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(platform.current_context(), Some(platform.main_context()));
        contexts.end().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn pause_blocks_loaders_until_resume() {
        let platform = Arc::new(SoftPlatform::new(4, 4));
        let gl = SoftGl::new(4, 4);
        let creation = Arc::new(AsyncCreationContext::new(Arc::clone(&platform), AsyncCreationMode::Auto).unwrap());

        creation.pause(&gl).unwrap();
        assert_eq!(gl.call_count("glFinish"), 1);
        assert_eq!(platform.current_context(), None);

        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let creation = Arc::clone(&creation);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                creation.run(|| Ok(())).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));

        creation.resume().unwrap();
        worker.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}

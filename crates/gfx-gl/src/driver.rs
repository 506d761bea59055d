//! A [`GlApi`] paired with the capabilities of its context.

use std::ops::Deref;
use std::sync::Arc;

use crate::api::{check_error, GlApi};
use crate::caps::GlCaps;

/// GL entry points plus what the context supports.
///
/// Dereferences to the API so call sites read like plain GL.
pub struct GlDriver<A> {
    api: Arc<A>,
    caps: GlCaps,
}

impl<A: GlApi> GlDriver<A> {
    /// Probe capabilities on the context current on this thread.
    pub fn new(api: Arc<A>) -> Self {
        let caps = GlCaps::detect(api.as_ref());
        Self { api, caps }
    }

    pub fn with_caps(api: Arc<A>, caps: GlCaps) -> Self {
        Self { api, caps }
    }

    pub fn caps(&self) -> &GlCaps {
        &self.caps
    }

    /// Shared handle for background creation threads.
    pub fn api_handle(&self) -> Arc<A> {
        Arc::clone(&self.api)
    }

    /// Debug-build `glGetError` check after `call`.
    pub fn check(&self, call: &'static str) -> anyhow::Result<()> {
        check_error(self.api.as_ref(), call)
    }
}

impl<A> Deref for GlDriver<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.api
    }
}

//! Error taxonomy shared by every backend.
//!
//! Public entry points return [`anyhow::Result`]; the root cause is always a
//! [`GraphicsError`] so callers can `downcast_ref` and react to a specific
//! failure (for example an incomplete framebuffer versus a lost device).

use thiserror::Error;

/// Failures raised by the device layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphicsError {
    /// The driver rejected an attachment combination.
    #[error(
        "framebuffer incomplete (status 0x{status:04X}, {render_targets} render target(s), depth: {depth})"
    )]
    FramebufferIncomplete {
        status: u32,
        render_targets: usize,
        depth: bool,
    },

    /// The window-provided render target was combined with a user-created depth buffer.
    #[error("impossible to bind device provided and user created buffers")]
    MixedWindowTargets,

    /// `end` was called more times than `begin`.
    #[error("End called more than Begin")]
    UnbalancedEnd,

    /// A GL call was issued without the device context being current.
    #[error("no active graphics context on this thread")]
    NoContext,

    /// The requested operation is not available on this backend or profile.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The arguments are valid individually but not for this resource.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A handle outlived the resource it referred to.
    #[error("stale {0} handle")]
    StaleHandle(&'static str),

    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),

    #[error("program link failed: {0}")]
    ShaderLink(String),

    /// A native API call returned an error code.
    #[error("{call} failed with code 0x{code:08X}")]
    Native { call: &'static str, code: u32 },

    /// A descriptor set needs more slots than a whole shader-visible heap holds.
    #[error("descriptor set needs {requested} descriptors but the heap holds {capacity}")]
    DescriptorSetTooLarge { requested: u32, capacity: u32 },
}

impl GraphicsError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidOperation(what.into())
    }
}

/// Extract the [`GraphicsError`] at the root of an `anyhow` error, if any.
pub fn graphics_error(err: &anyhow::Error) -> Option<&GraphicsError> {
    err.chain().find_map(|cause| cause.downcast_ref::<GraphicsError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn incomplete_status_is_printed_in_hex() {
        let err = GraphicsError::FramebufferIncomplete {
            status: 0x8CD6,
            render_targets: 1,
            depth: true,
        };
        assert!(err.to_string().contains("0x8CD6"));
    }

    #[test]
    fn native_code_is_printed_in_hex() {
        let err = GraphicsError::Native {
            call: "Signal",
            code: 0x887A0005,
        };
        assert_eq!(err.to_string(), "Signal failed with code 0x887A0005");
    }

    #[test]
    fn root_cause_survives_context() {
        let err: anyhow::Error = Err::<(), _>(GraphicsError::UnbalancedEnd)
            .context("ending frame")
            .unwrap_err();
        assert_eq!(graphics_error(&err), Some(&GraphicsError::UnbalancedEnd));
    }
}

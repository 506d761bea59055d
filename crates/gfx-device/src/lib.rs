//! Backend-neutral entry point of the graphics device layer.
//!
//! # Overview
//!
//! - [`GraphicsDevice`] is a device on either backend; [`HeadlessDevice`]
//!   runs on the software implementations of both.
//! - [`Presenter`] owns the [`BackBuffer`] and runs the present sequence
//!   ([`GlPresenter`], [`D3d12Presenter`]).
//! - [`ResumeManager`] polls device status each frame and rebuilds native
//!   objects after a device loss.

pub mod device;
pub mod presenter;
pub mod recovery;

pub use device::{BackendKind, GraphicsDevice, HeadlessDevice};
pub use presenter::{BackBuffer, D3d12Presenter, GlPresenter, Presenter, PresenterDescription};
pub use recovery::{LostResources, RecoverableDevice, RecoveryOutcome, ResumeManager};

pub use gfx_core;
pub use gfx_d3d12;
pub use gfx_gl;

//! extbridge sandbox controller.
//!
//! This crate delegates the lifecycle of sandboxed execution environments to
//! an external sandboxer process addressed by name and network address.
//!
//! - **[`controller`]** -- [`SandboxController`] is bound to one sandboxer and
//!   issues create, start, platform, stop, wait, status, shutdown, metrics
//!   and update calls over one lazily dialed channel.
//! - **[`wait`]** -- [`WaitOutcome`] and [`WaitSubscription`] deliver exactly
//!   one of ready, pending or exit to the caller's callbacks.
//! - **[`state`]** -- [`SandboxState`] classifies what the sandboxer reports.
//! - **[`dialer`]** -- [`SandboxAddress`] parsing and the [`Dialer`] seam.
//! - **[`types`]** -- Request and response records of every call.
//! - **[`config`]** -- [`ControllerConfig`] deadlines.
//! - **[`error`]** -- [`SandboxError`] via [`thiserror`].

pub mod config;
pub mod controller;
pub mod dialer;
pub mod error;
pub mod state;
pub mod types;
pub mod wait;

pub use config::ControllerConfig;
pub use controller::{ControllerBuilder, SandboxController};
pub use dialer::{BoxedStream, Dialer, NetDialer, PeerStream, SandboxAddress};
pub use error::{Result, SandboxError};
pub use state::SandboxState;
pub use wait::{WaitCallbacks, WaitOutcome, WaitSubscription};

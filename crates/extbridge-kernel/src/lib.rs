//! extbridge connection kernel.
//!
//! This crate provides the multiplexing engine shared by the extbridge
//! protocol surfaces:
//!
//! - **[`frame`]** -- Length-prefixed JSON frame codec, call kinds and wire
//!   error codes.
//! - **[`correlator`]** -- Per-connection request correlator that resolves
//!   every call exactly once.
//! - **[`connection`]** -- Owned, multiplexed peer connection with reader and
//!   writer tasks and inbound request dispatch.
//! - **[`registry`]** -- Concurrent connection registry using [`DashMap`].
//! - **[`events`]** -- Publish/subscribe lifecycle event bus backed by
//!   [`tokio::sync::broadcast`].
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.
//!
//! [`DashMap`]: dashmap::DashMap

pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod frame;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use connection::{CloseSignal, Connection, InboundHandler, NoInbound};
pub use correlator::Correlator;
pub use error::{KernelError, Result};
pub use events::{Event, EventBus};
pub use frame::{CallId, CallKind, ErrorCode, Frame};
pub use registry::{ConnectionRegistry, ConnectionState, PeerInfo};

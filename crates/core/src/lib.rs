//! Avatar Core
//!
//! Session lifecycle primitives for the live avatar relay: the per-connection
//! [`session::SessionState`], the [`registry::SessionRegistry`] that owns them,
//! the idle [`sweeper::EvictionSweeper`], and the [`realtime_api::LiveSession`]
//! seam behind which the external AI streaming service sits.

pub mod error;
pub mod generic_types;
pub mod realtime_api;
pub mod registry;
pub mod session;
pub mod sweeper;

pub use error::RelayError;

//! Shared wire types for the orbd activation daemon.
//!
//! This crate defines the domain values and protocol frames exchanged between
//! the daemon, administrative tools, and supervised server processes over a Unix
//! domain socket. Frames are postcard-encoded with a little-endian `u32` length
//! prefix.

#![warn(missing_docs)]

pub mod frame;
pub mod paths;
pub mod routing;
pub mod types;

pub use frame::{FrameError, read_frame, write_frame};
pub use routing::{RoutingKey, RoutingKeyError};
pub use types::*;

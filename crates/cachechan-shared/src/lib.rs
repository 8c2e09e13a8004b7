//! Shared types and wire contract for the cachechan covert channel
//!
//! Sender and receiver are unrelated processes that coordinate through one
//! small region of POSIX shared memory. The region doubles as the signal:
//! the cache residency of its `target_line` carries one bit per turn.
//!
//! # Architecture
//!
//! - [`SharedRegion`] - Fixed `#[repr(C)]` layout both processes agree on
//! - [`RegionHost`] - Created by the receiver, owns the shared memory name
//! - [`RegionClient`] - Opened by the sender
//! - [`framing`] - Byte string <-> LSB-first bit stream
//! - [`ChannelError`] - Session and resource failures

#![deny(missing_docs)]

pub mod error;
pub mod framing;
pub mod region;
pub mod shm;

pub use error::*;
pub use region::*;
pub use shm::*;

/// Default shared memory object name (POSIX: leading slash, no other slash)
pub const DEFAULT_SHM_NAME: &str = "/cachechan_shm";

/// Size of the signaling cache line in bytes
pub const CACHELINE: usize = 64;

/// Maximum message length in bytes (both sides must use the same value)
pub const MESSAGE_MAX_LEN: usize = 128;

/// Byte written over `target_line` when a session is reinitialized
pub const LINE_FILL: u8 = 0xAA;

//! Riden RD60xx Protocol Library
//!
//! This crate provides the wire protocol and data model for Riden RD60xx
//! bench power supplies:
//!
//! - [`frame`] - Modbus RTU frame encoding/decoding with CRC-16 validation
//! - [`registers`] - Register map, fixed-point scaling, and block decoding
//! - [`state`] - Typed telemetry snapshot and write-request types
//! - [`error`] - Error types
//!
//! The crate is transport-agnostic and contains no async code; the bridge
//! layers it over a TCP stream.

pub mod error;
pub mod frame;
pub mod registers;
pub mod state;

// Re-export commonly used types at the crate root
pub use error::{FrameError, RegisterError};
pub use frame::{Decoded, Frame};
pub use registers::{Scaling, WriteOp};
pub use state::{OutputMode, Preset, ProtectionStatus, Snapshot, StateSet};

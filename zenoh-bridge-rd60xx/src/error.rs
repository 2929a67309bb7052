//! Error types for the bridge.

use rd60xx_proto::{FrameError, RegisterError};
use thiserror::Error;

/// Errors surfaced to a caller awaiting a device command.
///
/// Per-device failures stay per-device: none of these take down another
/// session, and every submitted command resolves with one of them or a
/// result.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The request cycle (including retries) hit its deadline.
    #[error("request timed out")]
    Timeout,

    /// Another request is already in flight on this session.
    #[error("another request is in flight")]
    Busy,

    /// The session died before the command resolved.
    #[error("session closed")]
    SessionClosed,

    /// The unit answered with a Modbus exception.
    #[error("device rejected request (exception {0:#04x})")]
    Rejected(u8),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

/// Errors produced while decoding a wire frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: expected {expected:#06x}, received {received:#06x}")]
    ChecksumInvalid { expected: u16, received: u16 },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Errors produced while mapping register words to typed fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("unknown model {0}, cannot scale voltage and current")]
    UnknownModel(u16),

    #[error("register block length mismatch: expected {expected} words, got {got}")]
    BlockLength { expected: usize, got: usize },
}

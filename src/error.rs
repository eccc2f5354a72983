use std::time::Duration;

use thiserror::Error;

/// Errors raised while compressing or measuring an image.
#[derive(Error, Debug)]
pub enum AstcError {
    /// A required capability or resource is absent.
    #[error("precondition missing: {0}")]
    PreconditionMissing(String),

    /// The compute queue rejected the submitted work.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// The container header has a bad magic value, invalid fields or is truncated.
    #[error("malformed ASTC header: {0}")]
    MalformedHeader(String),

    /// The two images of a PSNR measurement have different dimensions.
    #[error("images are not comparable: {source_width}x{source_height} vs {target_width}x{target_height}")]
    Incomparable {
        source_width: u32,
        source_height: u32,
        target_width: u32,
        target_height: u32,
    },

    /// A blocking buffer read did not complete in time.
    #[error("buffer readback timed out after {0:?}")]
    ReadbackTimeout(Duration),

    /// Mapping or copying a buffer back to the host failed.
    #[error("buffer readback failed: {0}")]
    ReadbackFailed(String),

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// A block uses an encoding the decoder does not understand.
    #[error("unsupported block: {0}")]
    UnsupportedBlock(String),
}

pub type Result<T> = std::result::Result<T, AstcError>;

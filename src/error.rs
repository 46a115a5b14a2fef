//! Error types for prefork.

use thiserror::Error;

/// Main error type for prefork.
#[derive(Error, Debug)]
pub enum PreforkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("required callback '{0}' is not registered")]
    CallbackMissing(&'static str),

    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    #[error("channel transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to encode frame payload: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode frame payload: {0}")]
    Decode(serde_json::Error),

    #[error("frame payload of {0} bytes does not fit the length prefix")]
    FrameTooLarge(usize),

    #[error("unknown bucket '{0}'")]
    UnknownBucket(String),

    #[error("no helper with identifier '{0}' is on record")]
    HelperNotFound(String),

    #[error("operation is only valid in the supervising parent process")]
    NotParent,

    #[error("operation is only valid in a forked child process")]
    NotChild,

    #[error("signal configuration failed: {0}")]
    SignalSetup(nix::errno::Errno),
}

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, PreforkError>;

use std::time::Duration;

use thiserror::Error;

use parlor_shared::error::{CryptoError, WireError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("username '{0}' is already taken")]
    DuplicateUsername(String),

    #[error("user '{0}' not found")]
    RecipientNotFound(String),

    #[error("cannot send a private message to yourself")]
    SelfMessage,

    #[error("peer '{0}' has no public key yet")]
    NoPublicKey(String),

    #[error("invalid file request: {0}")]
    InvalidFileRequest(String),

    #[error("file '{0}' not found")]
    FileNotFound(String),

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },

    #[error("file storage error: {0}")]
    FileStorage(String),

    #[error("delivered to '{to}' but the sender confirmation failed: {source}")]
    PartialDelivery { to: String, source: WireError },

    #[error("shutdown deadline of {0:?} exceeded with connections still draining")]
    ShutdownTimeout(Duration),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

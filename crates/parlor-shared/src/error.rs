use thiserror::Error;

/// Errors produced by the line-delimited JSON codec.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the crypto engine.
///
/// Display strings are deliberately uniform in shape: a decrypt failure
/// never names the input or the position at which it failed, so relaying
/// one to a peer leaks nothing beyond "the exchange failed".
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("keypair generation failed")]
    KeyGenerationFailed,

    #[error("invalid public key format")]
    InvalidKeyFormat,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("key unwrap failed")]
    KeyUnwrapFailed,

    #[error("payload authentication failed")]
    PayloadAuthFailed,

    #[error("invalid key length")]
    InvalidKeyLength,
}

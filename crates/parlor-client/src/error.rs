use thiserror::Error;

use parlor_shared::error::{CryptoError, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no username set, call login first")]
    NotLoggedIn,

    #[error("not connected to a server")]
    NotConnected,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection closed during handshake")]
    HandshakeInterrupted,

    #[error("unexpected {0} message during handshake")]
    UnexpectedMessage(&'static str),

    #[error("room key not received yet")]
    RoomKeyUnavailable,

    #[error("cannot send a private message to yourself")]
    SelfMessage,

    #[error("no public key cached for '{0}' yet, request sent")]
    PeerKeyUnavailable(String),

    #[error("session key setup failed")]
    KeySetup,

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

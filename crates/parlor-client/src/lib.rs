//! # parlor-client
//!
//! Client session library for the parlor chat network.
//!
//! The core exposed toward any front end (GUI, TUI, tests) is
//! [`ChatClient`]: log in, connect, send public/private messages and
//! files, and register a single display callback that receives every
//! human-readable, already-decrypted line the session produces.
//!
//! Encryption happens entirely on this side of the wire: public traffic
//! under the relay-distributed room key, direct traffic hybrid-encrypted
//! for the recipient so the relay never sees plaintext. Peer keys are
//! discovered asynchronously; direct messages typed before a peer's key
//! arrives are queued and flushed, in order, the moment it does. A
//! dropped connection flips the session into an unbounded fixed-backoff
//! reconnect loop.

pub mod connection;
pub mod error;
pub mod key_cache;
mod reconnect;
pub mod session;

pub use error::ClientError;
pub use session::ChatClient;

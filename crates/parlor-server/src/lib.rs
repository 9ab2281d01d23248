//! # parlor-server
//!
//! Relay server for the parlor chat network.
//!
//! The relay:
//! - authenticates sessions by username and tracks them in a registry
//! - distributes the RSA-wrapped **room key** to each session after key
//!   exchange
//! - fans broadcast traffic out through a bounded, explicitly lossy queue
//! - forwards hybrid-encrypted direct messages **without ever decrypting
//!   them**
//! - stores public uploads and opaque private file envelopes
//! - persists the room key across restarts and drains connections on
//!   shutdown under a bounded deadline

pub mod broadcast;
pub mod config;
pub mod error;
pub mod file_store;
mod handler;
pub mod registry;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::Server;

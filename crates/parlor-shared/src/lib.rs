//! Shared protocol layer for the parlor chat relay.
//!
//! This crate holds everything both the relay server and the client
//! session library agree on:
//! - the wire [`message::Message`] vocabulary (newline-delimited JSON)
//! - the [`wire`] codec
//! - the [`crypto`] engine (RSA-OAEP key wrapping + AES-256-GCM payloads)
//! - shared [`constants`] and [`error`] types

pub mod constants;
pub mod crypto;
pub mod error;
pub mod message;
pub mod wire;

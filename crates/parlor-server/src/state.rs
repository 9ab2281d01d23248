//! Room-key and state persistence.
//!
//! Two layers, checked in order at startup:
//! 1. a dedicated key file holding base64 of the 32 raw room-key bytes
//!    (deleting it before start rotates the key);
//! 2. a JSON state file written on shutdown, which overrides the key file
//!    when present and well-formed.
//!
//! Corruption at either layer is never fatal: the engine logs a warning
//! and falls back to generating a fresh key.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use parlor_shared::constants::ROOM_KEY_SIZE;
use parlor_shared::crypto::{self, RoomKey};

use crate::error::ServerError;

/// Everything the relay persists across restarts. Currently just the
/// room key.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(rename = "roomKey")]
    pub room_key: String,
}

fn decode_room_key(encoded: &str) -> Option<RoomKey> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    if bytes.len() != ROOM_KEY_SIZE {
        return None;
    }
    let mut key = [0u8; ROOM_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Some(key)
}

/// Load the room key from its dedicated file, generating (and writing) a
/// fresh one if the file is missing or corrupt.
pub async fn load_or_generate_room_key(path: &Path) -> Result<RoomKey, ServerError> {
    match fs::read_to_string(path).await {
        Ok(contents) => {
            if let Some(key) = decode_room_key(&contents) {
                info!(path = %path.display(), "loaded existing room key");
                return Ok(key);
            }
            warn!(path = %path.display(), "invalid room key file, generating a new key");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read room key file, generating a new key");
        }
    }

    let key = crypto::generate_room_key();
    fs::write(path, BASE64.encode(key)).await?;
    info!(path = %path.display(), "generated new room key");
    Ok(key)
}

/// Load the persisted state file. Returns `None` (with a warning) if the
/// file is missing, unparseable, or holds a malformed key.
pub async fn load_state(path: &Path) -> Option<RoomKey> {
    let data = match fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state file");
            return None;
        }
    };

    let state: PersistedState = match serde_json::from_str(&data) {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt state file, ignoring");
            return None;
        }
    };

    match decode_room_key(&state.room_key) {
        Some(key) => {
            info!(path = %path.display(), "restored room key from state file");
            Some(key)
        }
        None => {
            warn!(path = %path.display(), "state file holds an invalid room key, ignoring");
            None
        }
    }
}

/// Persist the current state.
pub async fn save_state(path: &Path, room_key: &RoomKey) -> Result<(), ServerError> {
    let state = PersistedState {
        room_key: BASE64.encode(room_key),
    };
    let data = serde_json::to_string_pretty(&state)
        .map_err(|e| ServerError::FileStorage(format!("failed to encode state: {e}")))?;
    fs::write(path, data).await?;
    Ok(())
}

/// Synchronous variant of [`save_state`] for the panic hook, where no
/// runtime is available.
pub fn save_state_sync(path: &Path, room_key: &RoomKey) -> std::io::Result<()> {
    let state = PersistedState {
        room_key: BASE64.encode(room_key),
    };
    let data = serde_json::to_string_pretty(&state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, data)
}

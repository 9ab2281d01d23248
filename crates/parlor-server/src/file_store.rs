//! Uploaded file storage.
//!
//! Public uploads are stored as raw bytes under a name namespaced by the
//! uploader, so two users sharing `photo.png` do not overwrite each other.
//! Private transfers are stored as opaque JSON envelopes -- wrapped key,
//! ciphertext and routing metadata -- that the relay can return verbatim
//! but never decrypt.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::ServerError;

/// Stored record for one private file transfer. The relay never holds
/// the recipient's private key, so the payload stays opaque to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEnvelope {
    pub encrypted_key: String,
    pub encrypted_data: String,
    pub filename: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
    max_size: usize,
}

impl FileStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::FileStorage(format!(
                "failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "file store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Store a public upload. Returns the name it was stored (and will be
    /// advertised) under.
    pub async fn store_public(
        &self,
        uploader: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::InvalidFileRequest("empty file".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::FileTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let stored_name = format!("{}__{}", uploader, sanitize(filename)?);
        let path = self.base_path.join(&stored_name);

        fs::write(&path, data).await.map_err(|e| {
            ServerError::FileStorage(format!("failed to write '{stored_name}': {e}"))
        })?;

        debug!(name = %stored_name, size = data.len(), "stored public file");
        Ok(stored_name)
    }

    /// Read back a public upload by its advertised name.
    pub async fn load_public(&self, name: &str) -> Result<Vec<u8>, ServerError> {
        let name = sanitize(name)?;
        let path = self.base_path.join(&name);

        match fs::read(&path).await {
            Ok(data) => {
                debug!(name = %name, size = data.len(), "retrieved public file");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::FileNotFound(name))
            }
            Err(e) => Err(ServerError::FileStorage(format!(
                "failed to read '{name}': {e}"
            ))),
        }
    }

    /// Store a private envelope under the (sender, recipient, filename)
    /// composite name.
    pub async fn store_envelope(&self, envelope: &FileEnvelope) -> Result<(), ServerError> {
        if envelope.encrypted_data.len() > self.max_size {
            return Err(ServerError::FileTooLarge {
                size: envelope.encrypted_data.len(),
                max: self.max_size,
            });
        }

        let name = envelope_name(&envelope.from, &envelope.to, &envelope.filename)?;
        let data = serde_json::to_vec(envelope)
            .map_err(|e| ServerError::FileStorage(format!("failed to encode envelope: {e}")))?;

        fs::write(self.base_path.join(&name), data)
            .await
            .map_err(|e| ServerError::FileStorage(format!("failed to write '{name}': {e}")))?;

        debug!(name = %name, from = %envelope.from, to = %envelope.to, "stored private envelope");
        Ok(())
    }

    /// Retrieve a private envelope, re-deriving the composite name from
    /// the claimed sender and the requester.
    pub async fn load_envelope(
        &self,
        from: &str,
        to: &str,
        filename: &str,
    ) -> Result<FileEnvelope, ServerError> {
        let name = envelope_name(from, to, filename)?;
        let path = self.base_path.join(&name);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::FileNotFound(filename.to_string()));
            }
            Err(e) => {
                return Err(ServerError::FileStorage(format!(
                    "failed to read '{name}': {e}"
                )));
            }
        };

        serde_json::from_slice(&data)
            .map_err(|e| ServerError::FileStorage(format!("corrupt envelope '{name}': {e}")))
    }
}

/// Composite storage name for a private envelope.
fn envelope_name(from: &str, to: &str, filename: &str) -> Result<String, ServerError> {
    Ok(format!(
        "private_{}_to_{}_{}.enc",
        from,
        to,
        sanitize(filename)?
    ))
}

/// Reduce a client-supplied filename to a safe base name. Anything that
/// could escape the upload directory is rejected.
fn sanitize(filename: &str) -> Result<String, ServerError> {
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return Err(ServerError::InvalidFileRequest(format!(
            "unacceptable filename '{filename}'"
        )));
    }
    Ok(filename.to_string())
}

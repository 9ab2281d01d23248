//! Connected session tracking.
//!
//! Maintains an in-memory map of authenticated sessions keyed by
//! normalized username. The registry is pure bookkeeping: it holds no
//! transport buffers, only the per-session write handle each component
//! goes through to reach a peer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use parlor_shared::constants::{USERNAME_MAX_LEN, USERNAME_MIN_LEN};
use parlor_shared::error::WireError;
use parlor_shared::message::Message;
use parlor_shared::wire;

use crate::error::ServerError;

/// Write half of a session's transport.
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One authenticated connection.
///
/// All frame writes to the peer go through [`Session::send`], which
/// serializes them behind the session's exclusive write lock so broadcast
/// fan-out, private forwards and room-key pushes never interleave partial
/// frames.
pub struct Session {
    username: String,
    joined_at: DateTime<Utc>,
    writer: Arc<Mutex<SessionWriter>>,
    public_key: RwLock<Option<RsaPublicKey>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("joined_at", &self.joined_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(username: String, writer: Arc<Mutex<SessionWriter>>) -> Self {
        Self {
            username,
            joined_at: Utc::now(),
            writer,
            public_key: RwLock::new(None),
        }
    }

    /// Normalized username this session is registered under.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Write one frame to the peer, holding the session write lock for
    /// the whole frame.
    pub async fn send(&self, msg: &Message) -> Result<(), WireError> {
        let frame = wire::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// The RSA public key pushed by the peer, if key exchange completed.
    pub async fn public_key(&self) -> Option<RsaPublicKey> {
        self.public_key.read().await.clone()
    }

    pub async fn set_public_key(&self, key: RsaPublicKey) {
        *self.public_key.write().await = Some(key);
    }
}

/// Normalize a raw username: trim whitespace, strip one leading `@`,
/// case-fold. `"@Bob "` and `"bob"` address the same session.
pub fn normalize_username(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix('@').unwrap_or(trimmed);
    stripped.to_lowercase()
}

/// Directory of connected sessions, keyed by normalized username.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new session for `raw_username`.
    ///
    /// Normalization, validation, the uniqueness check and the insert all
    /// happen under one exclusive lock, so two connections racing for the
    /// same normalized name cannot both win.
    pub async fn authenticate(
        &self,
        raw_username: &str,
        writer: Arc<Mutex<SessionWriter>>,
    ) -> Result<Arc<Session>, ServerError> {
        let username = normalize_username(raw_username);
        let len = username.chars().count();
        if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
            return Err(ServerError::InvalidUsername(format!(
                "must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters"
            )));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&username) {
            return Err(ServerError::DuplicateUsername(username));
        }

        let session = Arc::new(Session::new(username.clone(), writer));
        sessions.insert(username.clone(), session.clone());
        debug!(user = %username, "session registered");
        Ok(session)
    }

    /// Remove a session. Returns it if it was present.
    pub async fn remove(&self, username: &str) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .await
            .remove(&normalize_username(username));
        if removed.is_some() {
            debug!(user = %username, "session removed");
        }
        removed
    }

    /// Look up a session by (raw or normalized) username.
    pub async fn lookup(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&normalize_username(username))
            .cloned()
    }

    /// Sorted roster of connected usernames.
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Point-in-time snapshot of all sessions.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Attach a public key to an existing session.
    pub async fn set_public_key(&self, username: &str, key: RsaPublicKey) -> bool {
        match self.lookup(username).await {
            Some(session) => {
                session.set_public_key(key).await;
                true
            }
            None => false,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_writer() -> Arc<Mutex<SessionWriter>> {
        let (tx, _rx) = tokio::io::duplex(1024);
        Arc::new(Mutex::new(Box::new(tx) as SessionWriter))
    }

    #[tokio::test]
    async fn test_authenticate_normalizes() {
        let registry = Registry::new();
        let session = registry
            .authenticate("  @Alice ", test_writer())
            .await
            .unwrap();
        assert_eq!(session.username(), "alice");
        assert!(registry.lookup("ALICE").await.is_some());
        assert!(registry.lookup("@alice").await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_rejected_case_folded() {
        let registry = Registry::new();
        registry.authenticate("Bob", test_writer()).await.unwrap();

        let err = registry
            .authenticate("@bob", test_writer())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateUsername(name) if name == "bob"));
    }

    #[tokio::test]
    async fn test_username_length_bounds() {
        let registry = Registry::new();
        assert!(matches!(
            registry.authenticate("ab", test_writer()).await,
            Err(ServerError::InvalidUsername(_))
        ));
        assert!(matches!(
            registry
                .authenticate(&"x".repeat(21), test_writer())
                .await,
            Err(ServerError::InvalidUsername(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_frees_name() {
        let registry = Registry::new();
        registry.authenticate("carol", test_writer()).await.unwrap();
        assert!(registry.remove("Carol").await.is_some());
        assert!(registry.authenticate("carol", test_writer()).await.is_ok());
    }

    #[tokio::test]
    async fn test_roster_sorted() {
        let registry = Registry::new();
        registry.authenticate("carol", test_writer()).await.unwrap();
        registry.authenticate("alice", test_writer()).await.unwrap();
        registry.authenticate("bob", test_writer()).await.unwrap();

        assert_eq!(registry.usernames().await, vec!["alice", "bob", "carol"]);
    }
}

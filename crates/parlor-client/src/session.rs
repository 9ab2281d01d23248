//! The client session: handshake, send paths, receive dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use parlor_shared::constants::RSA_KEY_BITS;
use parlor_shared::crypto::{self, RoomKey};
use parlor_shared::message::Message;

use crate::connection::Connection;
use crate::error::ClientError;
use crate::key_cache::PublicKeyCache;
use crate::reconnect;

/// The single front-end callback: every human-readable, already-decrypted
/// line the session produces goes through here.
pub type DisplayHandler = Box<dyn Fn(String) + Send + Sync + 'static>;

struct SessionKeys {
    private: RsaPrivateKey,
    public_pem: String,
}

/// Session state shared by the public surface, the receive loop and the
/// reconnector.
pub(crate) struct Inner {
    /// Normalized username, set by `login`.
    pub(crate) username: RwLock<Option<String>>,
    /// Server address of the active connection, kept for reconnects.
    pub(crate) address: RwLock<Option<String>>,
    conn: Mutex<Option<Connection>>,
    keys: RwLock<Option<SessionKeys>>,
    room_key: RwLock<Option<RoomKey>>,
    key_cache: PublicKeyCache,
    /// Plaintexts per target awaiting key discovery, flushed in order.
    pending: Mutex<HashMap<String, Vec<String>>>,
    active_users: RwLock<Vec<String>>,
    /// Downloaded files parked for the front end to collect.
    downloads: Mutex<HashMap<String, Vec<u8>>>,
    on_display: std::sync::RwLock<Option<DisplayHandler>>,
    pub(crate) connected_tx: watch::Sender<bool>,
    /// Set on intentional disconnect; cancels the reconnect loop.
    pub(crate) closing: AtomicBool,
    /// Bumped per successful handshake so a superseded receive loop never
    /// triggers a second reconnector.
    epoch: AtomicU64,
}

/// A chat session toward one relay.
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                username: RwLock::new(None),
                address: RwLock::new(None),
                conn: Mutex::new(None),
                keys: RwLock::new(None),
                room_key: RwLock::new(None),
                key_cache: PublicKeyCache::new(),
                pending: Mutex::new(HashMap::new()),
                active_users: RwLock::new(Vec::new()),
                downloads: Mutex::new(HashMap::new()),
                on_display: std::sync::RwLock::new(None),
                connected_tx,
                closing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Register the display callback. Must be set before `connect` for
    /// the front end to see anything.
    pub fn set_display_handler<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_display
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Box::new(handler));
    }

    /// Choose a username. Normalized the same way the relay normalizes
    /// it, so self-comparisons agree with the roster.
    pub async fn login(&self, username: &str) -> Result<(), ClientError> {
        let normalized = normalize_name(username);
        if normalized.is_empty() {
            return Err(ClientError::NotLoggedIn);
        }
        *self.inner.username.write().await = Some(normalized);
        Ok(())
    }

    /// Dial the relay and run the full handshake: auth, fresh RSA
    /// keypair, public key push. Returns once the session is live; the
    /// room key arrives asynchronously shortly after.
    pub async fn connect(&self, address: &str) -> Result<(), ClientError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        // Fresh per-session keypair for each explicit connect. Reconnects
        // reuse it so cached peer state stays valid.
        *self.inner.keys.write().await = None;
        *self.inner.room_key.write().await = None;

        handshake(&self.inner, address).await?;
        *self.inner.address.write().await = Some(address.to_string());
        self.inner.connected_tx.send_replace(true);
        info!(addr = %address, "connected");
        Ok(())
    }

    /// Encrypt under the room key and broadcast to the room.
    pub async fn send_public(&self, text: &str) -> Result<(), ClientError> {
        let username = require_username(&self.inner).await?;
        let room_key = self
            .inner
            .room_key
            .read()
            .await
            .ok_or(ClientError::RoomKeyUnavailable)?;

        display(
            &self.inner,
            format!("(Global) (You) ({}): {text}", clock(None)),
        );

        let encrypted_data = crypto::encrypt_with_room_key(text.as_bytes(), &room_key)?;
        send_current(
            &self.inner,
            &Message::Public {
                from: username,
                encrypted_data,
                timestamp: Some(Utc::now()),
            },
        )
        .await
    }

    /// Send a direct message. On a key-cache hit the message goes out
    /// immediately, hybrid-encrypted; on a miss the plaintext is queued
    /// for that target and a key request goes out instead -- the queue is
    /// flushed when the `public_key_response` arrives.
    pub async fn send_private(&self, target: &str, text: &str) -> Result<(), ClientError> {
        let username = require_username(&self.inner).await?;
        let target = normalize_name(target);
        if target == username {
            return Err(ClientError::SelfMessage);
        }

        match self.inner.key_cache.get(&target).await {
            Some(key) => send_private_encrypted(&self.inner, &username, &target, &key, text).await,
            None => {
                self.inner
                    .pending
                    .lock()
                    .await
                    .entry(target.clone())
                    .or_default()
                    .push(text.to_string());
                debug!(target = %target, "peer key unknown, queued message and requested key");
                send_current(
                    &self.inner,
                    &Message::PublicKeyRequest {
                        from: username,
                        to: target,
                    },
                )
                .await
            }
        }
    }

    /// Intentional goodbye: tells the relay, closes the transport and
    /// cancels any reconnector.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.inner.closing.store(true, Ordering::SeqCst);

        if let Some(conn) = self.inner.conn.lock().await.take() {
            let username = require_username(&self.inner).await.unwrap_or_default();
            if let Err(error) = conn
                .send(&Message::Leave {
                    from: Some(username),
                    content: None,
                    timestamp: Some(Utc::now()),
                })
                .await
            {
                debug!(%error, "failed to send goodbye");
            }
            conn.close().await;
        }

        self.inner.connected_tx.send_replace(false);
        Ok(())
    }

    /// Roster as of the last `user_list` push.
    pub async fn active_users(&self) -> Vec<String> {
        self.inner.active_users.read().await.clone()
    }

    /// Observable connection state, flipped by connects, disconnects and
    /// the reconnector.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Collect a finished download. Persisting the bytes is the front
    /// end's job.
    pub async fn take_download(&self, filename: &str) -> Option<Vec<u8>> {
        self.inner.downloads.lock().await.remove(filename)
    }

    /// Upload a public file (relay-plaintext by design).
    pub async fn send_file(&self, filename: &str, data: &[u8]) -> Result<(), ClientError> {
        let username = require_username(&self.inner).await?;
        send_current(
            &self.inner,
            &Message::FileTransfer {
                from: Some(username),
                filename: filename.to_string(),
                content: BASE64.encode(data),
            },
        )
        .await
    }

    /// Upload a file for one recipient, hybrid-encrypted before it leaves
    /// this process. Unlike direct messages there is no pending queue for
    /// file payloads: a cache miss requests the key and reports it, and
    /// the caller retries once discovery completes.
    pub async fn send_private_file(
        &self,
        target: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let username = require_username(&self.inner).await?;
        let target = normalize_name(target);

        let Some(key) = self.inner.key_cache.get(&target).await else {
            send_current(
                &self.inner,
                &Message::PublicKeyRequest {
                    from: username,
                    to: target.clone(),
                },
            )
            .await?;
            return Err(ClientError::PeerKeyUnavailable(target));
        };

        let (encrypted_key, content) = crypto::hybrid_encrypt(data, &key)?;
        send_current(
            &self.inner,
            &Message::PrivateFileTransfer {
                from: username,
                to: target,
                filename: filename.to_string(),
                encrypted_key,
                content,
            },
        )
        .await
    }

    /// Ask the relay for a public file by its advertised name.
    pub async fn request_file(&self, filename: &str) -> Result<(), ClientError> {
        send_current(
            &self.inner,
            &Message::FileDownload {
                filename: filename.to_string(),
                from: None,
                content: None,
            },
        )
        .await
    }

    /// Ask the relay for a private file `sender` addressed to us.
    pub async fn request_private_file(
        &self,
        sender: &str,
        filename: &str,
    ) -> Result<(), ClientError> {
        send_current(
            &self.inner,
            &Message::PrivateFileDownload {
                to: normalize_name(sender),
                filename: filename.to_string(),
                from: None,
                encrypted_key: None,
                content: None,
            },
        )
        .await
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Trim, strip one leading `@`, case-fold: the same normalization the
/// relay applies, so both sides agree on identity.
fn normalize_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix('@').unwrap_or(trimmed);
    stripped.to_lowercase()
}

async fn require_username(inner: &Inner) -> Result<String, ClientError> {
    inner
        .username
        .read()
        .await
        .clone()
        .ok_or(ClientError::NotLoggedIn)
}

/// Dial, authenticate, push our public key and install the connection.
/// Used by both `connect` and the reconnector.
pub(crate) async fn handshake(inner: &Arc<Inner>, address: &str) -> Result<(), ClientError> {
    let username = require_username(inner).await?;

    let (conn, mut incoming) = Connection::connect(address).await?;
    conn.send(&Message::Auth {
        from: username.clone(),
    })
    .await?;

    let resp = incoming
        .recv()
        .await
        .ok_or(ClientError::HandshakeInterrupted)?;
    match resp {
        Message::AuthResp { success: true, .. } => {}
        Message::AuthResp { success: false, error } => {
            return Err(ClientError::AuthFailed(
                error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        other => return Err(ClientError::UnexpectedMessage(other.kind())),
    }

    let public_pem = ensure_keys(inner).await?;
    conn.send(&Message::PublicKey {
        from: username,
        content: public_pem,
    })
    .await?;

    if let Some(previous) = inner.conn.lock().await.replace(conn) {
        previous.close().await;
    }
    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::spawn(recv_loop(inner.clone(), incoming, epoch));
    Ok(())
}

/// Generate the per-session RSA keypair on first use. Key generation is
/// CPU-bound, so it runs off the async workers.
async fn ensure_keys(inner: &Inner) -> Result<String, ClientError> {
    let mut keys = inner.keys.write().await;
    match keys.as_ref() {
        Some(existing) => Ok(existing.public_pem.clone()),
        None => {
            let (private, public) =
                tokio::task::spawn_blocking(|| crypto::generate_keypair(RSA_KEY_BITS))
                    .await
                    .map_err(|_| ClientError::KeySetup)??;
            let public_pem = crypto::public_key_to_pem(&public)?;
            *keys = Some(SessionKeys {
                private,
                public_pem: public_pem.clone(),
            });
            Ok(public_pem)
        }
    }
}

/// Send through the current connection, frames serialized by the
/// connection's write lock.
pub(crate) async fn send_current(inner: &Inner, msg: &Message) -> Result<(), ClientError> {
    let conn = inner.conn.lock().await;
    match conn.as_ref() {
        Some(conn) => Ok(conn.send(msg).await?),
        None => Err(ClientError::NotConnected),
    }
}

async fn send_private_encrypted(
    inner: &Inner,
    username: &str,
    target: &str,
    key: &RsaPublicKey,
    text: &str,
) -> Result<(), ClientError> {
    let (encrypted_key, content) = crypto::hybrid_encrypt(text.as_bytes(), key)?;

    display(
        inner,
        format!("(Private to {target}) (You) ({}): {text}", clock(None)),
    );

    send_current(
        inner,
        &Message::Private {
            from: username.to_string(),
            to: target.to_string(),
            encrypted_key,
            content,
            timestamp: Some(Utc::now()),
        },
    )
    .await
}

pub(crate) fn display(inner: &Inner, line: String) {
    let handler = inner
        .on_display
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handler) = handler.as_ref() {
        handler(line);
    }
}

fn clock(timestamp: Option<DateTime<Utc>>) -> String {
    timestamp
        .unwrap_or_else(Utc::now)
        .format("%H:%M:%S")
        .to_string()
}

/// Consume the incoming queue until it closes, then hand off to the
/// reconnector (unless the disconnect was intentional or this loop was
/// superseded by a newer handshake).
async fn recv_loop(inner: Arc<Inner>, mut incoming: mpsc::Receiver<Message>, epoch: u64) {
    while let Some(msg) = incoming.recv().await {
        handle_incoming(&inner, msg).await;
    }

    if inner.closing.load(Ordering::SeqCst) || inner.epoch.load(Ordering::SeqCst) != epoch {
        return;
    }

    inner.connected_tx.send_replace(false);
    display(
        &inner,
        "disconnected from server, attempting to reconnect...".to_string(),
    );
    tokio::spawn(reconnect::run(inner.clone()));
}

/// Receive dispatch, mirroring the relay's vocabulary.
async fn handle_incoming(inner: &Arc<Inner>, msg: Message) {
    let own = inner.username.read().await.clone().unwrap_or_default();

    match msg {
        Message::RoomKey { encrypted_key } => {
            let keys = inner.keys.read().await;
            let Some(keys) = keys.as_ref() else {
                warn!("room key arrived before key setup");
                return;
            };
            match crypto::unwrap_room_key(&encrypted_key, &keys.private) {
                Ok(key) => {
                    *inner.room_key.write().await = Some(key);
                    debug!("room key received");
                }
                Err(error) => warn!(%error, "failed to unwrap room key"),
            }
        }

        Message::Public {
            from,
            encrypted_data,
            timestamp,
        } => {
            if from == own {
                return;
            }
            let Some(room_key) = *inner.room_key.read().await else {
                warn!(from = %from, "public message before room key, dropping");
                return;
            };
            match crypto::decrypt_with_room_key(&encrypted_data, &room_key) {
                Ok(plain) => display(
                    inner,
                    format!(
                        "(Global) ({}) {from}: {}",
                        clock(timestamp),
                        String::from_utf8_lossy(&plain)
                    ),
                ),
                Err(error) => warn!(from = %from, %error, "failed to decrypt public message"),
            }
        }

        Message::Private {
            from,
            encrypted_key,
            content,
            timestamp,
            ..
        } => {
            if from == own {
                // Our own echo, wrapped for the recipient's key: a
                // delivery confirmation, not something we can read.
                debug!("private delivery confirmed");
                return;
            }
            let keys = inner.keys.read().await;
            let Some(keys) = keys.as_ref() else {
                warn!(from = %from, "private message before key setup, dropping");
                return;
            };
            match crypto::hybrid_decrypt(&encrypted_key, &content, &keys.private) {
                Ok(plain) => display(
                    inner,
                    format!(
                        "(Private) ({}) {from}: {}",
                        clock(timestamp),
                        String::from_utf8_lossy(&plain)
                    ),
                ),
                Err(error) => warn!(from = %from, %error, "failed to decrypt private message"),
            }
        }

        Message::PublicKeyResponse {
            from,
            encrypted_key,
            content,
            ..
        } => handle_public_key_response(inner, &own, &from, &encrypted_key, &content).await,

        Message::UserList { users } => {
            *inner.active_users.write().await = users.clone();
            display(inner, format!("Active users: {}", users.join(", ")));
        }

        Message::Join { content, timestamp } => {
            display(inner, format!("(System) ({}) {content}", clock(timestamp)));
        }

        Message::Leave {
            content: Some(content),
            timestamp,
            ..
        } => {
            display(inner, format!("(System) ({}) {content}", clock(timestamp)));
        }

        Message::Info { content, timestamp } => {
            display(inner, format!("(System) ({}) {content}", clock(timestamp)));
        }

        Message::Error { content } => {
            display(inner, format!("(Error) {content}"));
        }

        Message::FileAvailable { content, .. } => display(inner, content),

        Message::PrivateFileAvailable { content, .. } => display(inner, content),

        Message::FileDownload {
            filename,
            content: Some(content),
            ..
        } => match BASE64.decode(content.as_bytes()) {
            Ok(data) => {
                let size = data.len();
                inner.downloads.lock().await.insert(filename.clone(), data);
                display(inner, format!("(File) downloaded '{filename}' ({size} bytes)"));
            }
            Err(error) => warn!(name = %filename, %error, "bad file download payload"),
        },

        Message::PrivateFileDownload {
            from: Some(from),
            filename,
            encrypted_key: Some(encrypted_key),
            content: Some(content),
            ..
        } => {
            let keys = inner.keys.read().await;
            let Some(keys) = keys.as_ref() else {
                warn!(name = %filename, "private file before key setup, dropping");
                return;
            };
            match crypto::hybrid_decrypt(&encrypted_key, &content, &keys.private) {
                Ok(data) => {
                    let size = data.len();
                    inner.downloads.lock().await.insert(filename.clone(), data);
                    display(
                        inner,
                        format!("(File) private file '{filename}' from {from} ({size} bytes)"),
                    );
                }
                Err(error) => warn!(name = %filename, %error, "failed to decrypt private file"),
            }
        }

        other => debug!(kind = other.kind(), "ignoring message"),
    }
}

/// Decrypt and cache a discovered peer key, then flush that target's
/// pending queue in original enqueue order.
async fn handle_public_key_response(
    inner: &Arc<Inner>,
    own: &str,
    from: &str,
    encrypted_key: &str,
    content: &str,
) {
    let pem = {
        let keys = inner.keys.read().await;
        let Some(keys) = keys.as_ref() else {
            warn!(from = %from, "key response before key setup, dropping");
            return;
        };
        match crypto::hybrid_decrypt(encrypted_key, content, &keys.private) {
            Ok(pem) => pem,
            Err(error) => {
                warn!(from = %from, %error, "failed to decrypt key response");
                return;
            }
        }
    };

    let pem = String::from_utf8_lossy(&pem);
    let key = match crypto::public_key_from_pem(&pem) {
        Ok(key) => key,
        Err(error) => {
            warn!(from = %from, %error, "discovered key does not parse");
            return;
        }
    };

    inner.key_cache.insert(from, key.clone()).await;
    info!(from = %from, "cached peer public key");

    let queued = inner
        .pending
        .lock()
        .await
        .remove(from)
        .unwrap_or_default();
    for text in queued {
        if let Err(error) = send_private_encrypted(inner, own, from, &key, &text).await {
            warn!(target = %from, %error, "failed to flush queued message");
        }
    }
}

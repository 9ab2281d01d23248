//! Peer public key cache.
//!
//! Populated only through the key-discovery protocol: the relay answers a
//! `public_key_request` with the target's PEM key hybrid-encrypted for
//! us, and the decrypted result lands here.

use std::collections::HashMap;

use rsa::RsaPublicKey;
use tokio::sync::RwLock;

pub struct PublicKeyCache {
    keys: RwLock<HashMap<String, RsaPublicKey>>,
}

impl PublicKeyCache {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, username: &str, key: RsaPublicKey) {
        self.keys.write().await.insert(username.to_string(), key);
    }

    pub async fn get(&self, username: &str) -> Option<RsaPublicKey> {
        self.keys.read().await.get(username).cloned()
    }
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

//! Hybrid encryption engine shared by client and relay.
//!
//! Two layers:
//! - **Room key**: one AES-256 key shared by every session, used for
//!   public broadcast traffic. Distributed RSA-wrapped per recipient.
//! - **Per-message hybrid**: a fresh AES-256 key per direct message,
//!   sealed with AES-256-GCM and wrapped with RSA-OAEP(SHA-256) under the
//!   recipient's public key. The relay forwards these opaquely.
//!
//! All AES-GCM output is `nonce || ciphertext`, base64-encoded for the
//! wire. Every call draws fresh key/nonce material from the OS RNG, so
//! encrypting the same plaintext twice never yields the same bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::constants::{GCM_NONCE_SIZE, ROOM_KEY_SIZE};
use crate::error::CryptoError;

/// The process-wide AES-256 key shared by all sessions.
pub type RoomKey = [u8; ROOM_KEY_SIZE];

/// Generate a fresh RSA keypair for one client session.
pub fn generate_keypair(bits: usize) -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let private =
        RsaPrivateKey::new(&mut OsRng, bits).map_err(|_| CryptoError::KeyGenerationFailed)?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

/// Encode a public key as SPKI PEM text.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::InvalidKeyFormat)
}

/// Parse SPKI PEM text back into a public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem.trim()).map_err(|_| CryptoError::InvalidKeyFormat)
}

// Returns nonce || ciphertext (12-byte nonce prepended).
fn seal(key: &[u8; ROOM_KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn open(key: &[u8; ROOM_KEY_SIZE], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < GCM_NONCE_SIZE {
        return Err(CryptoError::PayloadAuthFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(GCM_NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::PayloadAuthFailed)
}

/// Encrypt a payload for one recipient: fresh AES-256 key sealed with
/// GCM, key wrapped with RSA-OAEP(SHA-256). Returns
/// `(wrapped_key_b64, cipher_b64)`.
pub fn hybrid_encrypt(
    plaintext: &[u8],
    recipient: &RsaPublicKey,
) -> Result<(String, String), CryptoError> {
    let mut key = [0u8; ROOM_KEY_SIZE];
    OsRng.fill_bytes(&mut key);

    let sealed = seal(&key, plaintext)?;
    let wrapped = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((BASE64.encode(wrapped), BASE64.encode(sealed)))
}

/// Reverse of [`hybrid_encrypt`]. Fails with [`CryptoError::KeyUnwrapFailed`]
/// if the RSA layer rejects the wrapped key and
/// [`CryptoError::PayloadAuthFailed`] if the GCM tag check fails.
pub fn hybrid_decrypt(
    wrapped_key_b64: &str,
    cipher_b64: &str,
    private: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    let wrapped = BASE64
        .decode(wrapped_key_b64.trim())
        .map_err(|_| CryptoError::KeyUnwrapFailed)?;
    let sealed = BASE64
        .decode(cipher_b64.trim())
        .map_err(|_| CryptoError::PayloadAuthFailed)?;

    let key_bytes = private
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| CryptoError::KeyUnwrapFailed)?;
    if key_bytes.len() != ROOM_KEY_SIZE {
        return Err(CryptoError::KeyUnwrapFailed);
    }

    let mut key = [0u8; ROOM_KEY_SIZE];
    key.copy_from_slice(&key_bytes);
    open(&key, &sealed)
}

/// Symmetric-only encryption under the shared room key.
pub fn encrypt_with_room_key(plaintext: &[u8], room_key: &RoomKey) -> Result<String, CryptoError> {
    Ok(BASE64.encode(seal(room_key, plaintext)?))
}

/// Reverse of [`encrypt_with_room_key`].
pub fn decrypt_with_room_key(cipher_b64: &str, room_key: &RoomKey) -> Result<Vec<u8>, CryptoError> {
    let sealed = BASE64
        .decode(cipher_b64.trim())
        .map_err(|_| CryptoError::PayloadAuthFailed)?;
    open(room_key, &sealed)
}

/// Generate a fresh room key from the OS RNG.
pub fn generate_room_key() -> RoomKey {
    let mut key = [0u8; ROOM_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// RSA-OAEP wrap of the raw room key bytes for one recipient.
pub fn wrap_room_key(room_key: &RoomKey, recipient: &RsaPublicKey) -> Result<String, CryptoError> {
    let wrapped = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), room_key.as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(BASE64.encode(wrapped))
}

/// Reverse of [`wrap_room_key`].
pub fn unwrap_room_key(wrapped_b64: &str, private: &RsaPrivateKey) -> Result<RoomKey, CryptoError> {
    let wrapped = BASE64
        .decode(wrapped_b64.trim())
        .map_err(|_| CryptoError::KeyUnwrapFailed)?;
    let key_bytes = private
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| CryptoError::KeyUnwrapFailed)?;
    if key_bytes.len() != ROOM_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength);
    }

    let mut key = [0u8; ROOM_KEY_SIZE];
    key.copy_from_slice(&key_bytes);
    Ok(key)
}

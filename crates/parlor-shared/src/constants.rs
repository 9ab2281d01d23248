use std::time::Duration;

/// AES-256-GCM nonce size in bytes (96 bits)
pub const GCM_NONCE_SIZE: usize = 12;

/// Room key size in bytes (AES-256)
pub const ROOM_KEY_SIZE: usize = 32;

/// RSA modulus size for per-session keypairs
pub const RSA_KEY_BITS: usize = 2048;

/// Broadcast queue depth; producers drop messages once this is full
pub const BROADCAST_QUEUE_CAPACITY: usize = 100;

/// Client-side incoming message queue depth
pub const INCOMING_QUEUE_CAPACITY: usize = 100;

/// Fixed delay between client reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Maximum uploaded file size in bytes (50 MiB)
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Username length bounds, applied after normalization
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 20;

/// Default TCP port for the relay
pub const DEFAULT_PORT: u16 = 9000;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All wire protocol messages exchanged between client and relay.
///
/// Serialized as an internally tagged JSON object (`"type"` discriminator,
/// snake_case kinds). The set is closed: dispatchers match exhaustively and
/// new behaviour is added by extending this enum, not by overloading the
/// fields of an existing kind. Exactly one of the plaintext/ciphertext
/// carrying fields is meaningful per kind, so consumers must branch on the
/// kind before interpreting anything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message on a connection: claim a username.
    Auth { from: String },

    /// Relay verdict on an `Auth` attempt.
    AuthResp {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Client pushes its PEM-encoded RSA public key.
    PublicKey { from: String, content: String },

    /// Ask the relay for another user's public key.
    PublicKeyRequest { from: String, to: String },

    /// The target's PEM public key, hybrid-encrypted for the requester.
    /// The relay never sends a bare key.
    PublicKeyResponse {
        from: String,
        to: String,
        encrypted_key: String,
        content: String,
    },

    /// The shared room key, RSA-wrapped for one recipient. Unsolicited
    /// push after key exchange, re-sent on `Reconnect`.
    RoomKey { encrypted_key: String },

    /// Room-key-encrypted broadcast message.
    Public {
        from: String,
        encrypted_data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Hybrid-encrypted direct message, forwarded opaquely by the relay.
    Private {
        from: String,
        to: String,
        encrypted_key: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Current roster of authenticated usernames.
    UserList { users: Vec<String> },

    /// Human-readable join notice.
    Join {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Goodbye. Client -> relay carries `from`; relay -> clients carries
    /// the human-readable notice in `content`.
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Error surfaced to one peer.
    Error { content: String },

    /// Informational acknowledgement (upload confirmations and the like).
    Info {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Client asks for the room key and roster again after a dropped
    /// connection.
    Reconnect { from: String },

    /// Public file upload; `content` is base64 of the raw bytes.
    FileTransfer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        filename: String,
        content: String,
    },

    /// Public file download. Requests carry only `filename`; the relay's
    /// response fills `from` and the base64 `content`.
    FileDownload {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Broadcast notice that a public file is available for download.
    FileAvailable {
        from: String,
        filename: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Private file upload: ciphertext plus the key wrapped for the
    /// recipient, stored by the relay as an opaque envelope.
    PrivateFileTransfer {
        from: String,
        to: String,
        filename: String,
        encrypted_key: String,
        content: String,
    },

    /// Private file download. Requests carry the claimed sender in `to`
    /// and the `filename`; the response fills the envelope fields.
    PrivateFileDownload {
        to: String,
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    /// Recipient-only notice that a private file is waiting.
    PrivateFileAvailable {
        from: String,
        to: String,
        filename: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl Message {
    /// Wire name of this message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthResp { .. } => "auth_resp",
            Message::PublicKey { .. } => "public_key",
            Message::PublicKeyRequest { .. } => "public_key_request",
            Message::PublicKeyResponse { .. } => "public_key_response",
            Message::RoomKey { .. } => "room_key",
            Message::Public { .. } => "public",
            Message::Private { .. } => "private",
            Message::UserList { .. } => "user_list",
            Message::Join { .. } => "join",
            Message::Leave { .. } => "leave",
            Message::Error { .. } => "error",
            Message::Info { .. } => "info",
            Message::Reconnect { .. } => "reconnect",
            Message::FileTransfer { .. } => "file_transfer",
            Message::FileDownload { .. } => "file_download",
            Message::FileAvailable { .. } => "file_available",
            Message::PrivateFileTransfer { .. } => "private_file_transfer",
            Message::PrivateFileDownload { .. } => "private_file_download",
            Message::PrivateFileAvailable { .. } => "private_file_available",
        }
    }
}

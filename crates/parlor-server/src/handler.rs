//! Per-connection protocol state machine.
//!
//! Lifecycle: accept -> authentication loop -> key exchange -> steady
//! state -> cleanup. The read loop owns the connection's read half and
//! watches the shutdown signal; every decoded message is dispatched on its
//! own short-lived task so a slow handler (a crypto failure, a stalled
//! recipient) cannot stall the reader. Cleanup runs exactly once per
//! connection, on the single exit path below the session loop, whichever
//! event ends the session.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use parlor_shared::crypto;
use parlor_shared::error::WireError;
use parlor_shared::message::Message;
use parlor_shared::wire;

use crate::error::ServerError;
use crate::file_store::FileEnvelope;
use crate::registry::{normalize_username, Session, SessionWriter};
use crate::server::Shared;

enum Exit {
    Disconnected,
    Left,
    Shutdown,
    ReadError(WireError),
}

/// Drive one accepted connection from handshake to teardown.
pub(crate) async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    mut done: watch::Receiver<bool>,
) {
    info!(%peer, "new connection");

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer: Arc<Mutex<SessionWriter>> =
        Arc::new(Mutex::new(Box::new(write_half) as SessionWriter));

    let session = match authenticate(&shared, &mut reader, &writer, &mut done, peer).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            debug!(%peer, "connection ended before authentication");
            return;
        }
        Err(error) => {
            debug!(%peer, %error, "authentication aborted");
            return;
        }
    };

    info!(user = %session.username(), %peer, "user joined");
    shared.broadcaster.send(Message::Join {
        content: format!("{} has joined the chat", session.username()),
        timestamp: Some(Utc::now()),
    });
    shared.broadcaster.send(Message::UserList {
        users: shared.registry.usernames().await,
    });

    let mut tasks = JoinSet::new();
    let exit = session_loop(&shared, &mut reader, &session, &mut done, &mut tasks).await;
    match exit {
        Exit::Disconnected => debug!(user = %session.username(), "peer disconnected"),
        Exit::Left => debug!(user = %session.username(), "peer said goodbye"),
        Exit::Shutdown => debug!(user = %session.username(), "closing for shutdown"),
        Exit::ReadError(error) => {
            warn!(user = %session.username(), %error, "read failed, closing connection")
        }
    }

    cleanup(&shared, &session, tasks).await;
}

/// Authentication loop. A bad first message or a rejected username keeps
/// the connection open and re-offers authentication; only transport
/// failures, EOF or shutdown end it.
async fn authenticate(
    shared: &Arc<Shared>,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Arc<Mutex<SessionWriter>>,
    done: &mut watch::Receiver<bool>,
    peer: SocketAddr,
) -> Result<Option<Arc<Session>>, WireError> {
    loop {
        let read = tokio::select! {
            _ = done.changed() => return Ok(None),
            read = wire::read_message(reader) => read?,
        };
        let Some(msg) = read else {
            return Ok(None);
        };

        let from = match msg {
            Message::Auth { from } => from,
            other => {
                debug!(%peer, kind = other.kind(), "expected auth as first message");
                send_raw(
                    writer,
                    &Message::Error {
                        content: "first message must be authentication".to_string(),
                    },
                )
                .await?;
                continue;
            }
        };

        match shared.registry.authenticate(&from, writer.clone()).await {
            Ok(session) => {
                // If the success response cannot be delivered the session
                // must not stay registered.
                if let Err(error) = send_raw(
                    writer,
                    &Message::AuthResp {
                        success: true,
                        error: None,
                    },
                )
                .await
                {
                    shared.registry.remove(session.username()).await;
                    return Err(error);
                }
                return Ok(Some(session));
            }
            Err(error) => {
                debug!(%peer, raw = %from, %error, "authentication rejected");
                send_raw(
                    writer,
                    &Message::AuthResp {
                        success: false,
                        error: Some(error.to_string()),
                    },
                )
                .await?;
            }
        }
    }
}

async fn session_loop(
    shared: &Arc<Shared>,
    reader: &mut BufReader<OwnedReadHalf>,
    session: &Arc<Session>,
    done: &mut watch::Receiver<bool>,
    tasks: &mut JoinSet<()>,
) -> Exit {
    loop {
        let read = tokio::select! {
            _ = done.changed() => return Exit::Shutdown,
            read = wire::read_message(reader) => read,
        };

        match read {
            Ok(Some(Message::Leave { .. })) => return Exit::Left,
            Ok(Some(msg)) => {
                let shared = shared.clone();
                let session = session.clone();
                tasks.spawn(async move {
                    if let Err(error) = dispatch(&shared, &session, msg).await {
                        debug!(user = %session.username(), %error, "message handling failed");
                    }
                });
            }
            Ok(None) => return Exit::Disconnected,
            Err(error) => return Exit::ReadError(error),
        }
    }
}

/// Teardown for one connection. Waits for in-flight dispatch tasks, then
/// removes the session and tells the room.
async fn cleanup(shared: &Arc<Shared>, session: &Arc<Session>, mut tasks: JoinSet<()>) {
    while tasks.join_next().await.is_some() {}

    shared.registry.remove(session.username()).await;
    shared.broadcaster.send(Message::Leave {
        from: None,
        content: Some(format!("{} has left the chat", session.username())),
        timestamp: Some(Utc::now()),
    });
    shared.broadcaster.send(Message::UserList {
        users: shared.registry.usernames().await,
    });

    info!(user = %session.username(), "session closed");
}

/// Exhaustive dispatch over the message vocabulary. Kinds a client should
/// never send are logged and ignored; the connection stays open.
async fn dispatch(shared: &Shared, session: &Session, msg: Message) -> Result<(), ServerError> {
    match msg {
        Message::PublicKey { content, .. } => handle_public_key(shared, session, &content).await,
        Message::PublicKeyRequest { to, .. } => {
            handle_public_key_request(shared, session, &to).await
        }
        Message::Public { encrypted_data, .. } => {
            // Already room-key encrypted; re-broadcast verbatim to everyone
            // but the sender, identified by username rather than by
            // connection.
            shared.broadcaster.send_excluding(
                Message::Public {
                    from: session.username().to_string(),
                    encrypted_data,
                    timestamp: Some(Utc::now()),
                },
                session.username(),
            );
            Ok(())
        }
        Message::Private {
            to,
            encrypted_key,
            content,
            ..
        } => handle_private(shared, session, &to, encrypted_key, content).await,
        Message::Reconnect { .. } => handle_reconnect(shared, session).await,
        Message::FileTransfer {
            filename, content, ..
        } => handle_file_transfer(shared, session, &filename, &content).await,
        Message::FileDownload { filename, .. } => {
            handle_file_request(shared, session, &filename).await
        }
        Message::PrivateFileTransfer {
            to,
            filename,
            encrypted_key,
            content,
            ..
        } => handle_private_file_transfer(shared, session, &to, &filename, encrypted_key, content)
            .await,
        Message::PrivateFileDownload { to, filename, .. } => {
            handle_private_file_request(shared, session, &to, &filename).await
        }
        Message::Auth { .. } => {
            notify_error(session, "already authenticated").await;
            Ok(())
        }
        // Server-originated kinds have no business arriving here.
        other @ (Message::AuthResp { .. }
        | Message::PublicKeyResponse { .. }
        | Message::RoomKey { .. }
        | Message::UserList { .. }
        | Message::Join { .. }
        | Message::Leave { .. }
        | Message::Error { .. }
        | Message::Info { .. }
        | Message::FileAvailable { .. }
        | Message::PrivateFileAvailable { .. }) => {
            debug!(
                user = %session.username(),
                kind = other.kind(),
                "ignoring unexpected message"
            );
            Ok(())
        }
    }
}

/// Store the peer's public key, then push the wrapped room key. The push
/// is unsolicited: completing key exchange is what earns it.
async fn handle_public_key(
    shared: &Shared,
    session: &Session,
    pem: &str,
) -> Result<(), ServerError> {
    let key = crypto::public_key_from_pem(pem)?;
    if !shared
        .registry
        .set_public_key(session.username(), key)
        .await
    {
        warn!(user = %session.username(), "session gone before key could be stored");
        return Ok(());
    }
    info!(user = %session.username(), "stored public key");

    push_room_key(shared, session).await
}

async fn push_room_key(shared: &Shared, session: &Session) -> Result<(), ServerError> {
    let Some(public_key) = session.public_key().await else {
        warn!(user = %session.username(), "cannot send room key before key exchange");
        return Err(ServerError::NoPublicKey(session.username().to_string()));
    };

    let encrypted_key = crypto::wrap_room_key(&shared.room_key, &public_key)?;
    session.send(&Message::RoomKey { encrypted_key }).await?;
    info!(user = %session.username(), "room key sent");
    Ok(())
}

/// Return the target's PEM public key, hybrid-encrypted under the
/// requester's key. The relay never sends a bare key: only one wrapped
/// for the specific requester.
async fn handle_public_key_request(
    shared: &Shared,
    session: &Session,
    target: &str,
) -> Result<(), ServerError> {
    let Some(target_session) = shared.registry.lookup(target).await else {
        notify_error(session, &format!("user '{target}' not found")).await;
        return Err(ServerError::RecipientNotFound(target.to_string()));
    };
    let Some(target_key) = target_session.public_key().await else {
        return Err(ServerError::NoPublicKey(target_session.username().to_string()));
    };
    let Some(requester_key) = session.public_key().await else {
        return Err(ServerError::NoPublicKey(session.username().to_string()));
    };

    let pem = crypto::public_key_to_pem(&target_key)?;
    let (encrypted_key, content) = crypto::hybrid_encrypt(pem.as_bytes(), &requester_key)?;

    session
        .send(&Message::PublicKeyResponse {
            from: target_session.username().to_string(),
            to: session.username().to_string(),
            encrypted_key,
            content,
        })
        .await?;
    debug!(
        user = %session.username(),
        target = %target_session.username(),
        "public key response sent"
    );
    Ok(())
}

/// Forward an opaque direct message to its recipient and echo it back to
/// the sender as a delivery confirmation. The relay never decrypts it.
async fn handle_private(
    shared: &Shared,
    session: &Session,
    to: &str,
    encrypted_key: String,
    content: String,
) -> Result<(), ServerError> {
    if normalize_username(to) == session.username() {
        notify_error(session, "cannot send a private message to yourself").await;
        return Err(ServerError::SelfMessage);
    }

    let Some(recipient) = shared.registry.lookup(to).await else {
        notify_error(session, &format!("user '{to}' not found")).await;
        return Err(ServerError::RecipientNotFound(to.to_string()));
    };

    let forwarded = Message::Private {
        from: session.username().to_string(),
        to: recipient.username().to_string(),
        encrypted_key,
        content,
        timestamp: Some(Utc::now()),
    };

    recipient.send(&forwarded).await?;

    // No rollback on a failed echo: the recipient already has the message,
    // so report the partial failure instead.
    if let Err(source) = session.send(&forwarded).await {
        return Err(ServerError::PartialDelivery {
            to: recipient.username().to_string(),
            source,
        });
    }

    debug!(
        from = %session.username(),
        to = %recipient.username(),
        "private message relayed"
    );
    Ok(())
}

/// Resend the room key and a fresh roster to a session that missed
/// updates across a dropped connection.
async fn handle_reconnect(shared: &Shared, session: &Session) -> Result<(), ServerError> {
    push_room_key(shared, session).await?;
    session
        .send(&Message::UserList {
            users: shared.registry.usernames().await,
        })
        .await?;
    info!(user = %session.username(), "reconnect state resent");
    Ok(())
}

async fn handle_file_transfer(
    shared: &Shared,
    session: &Session,
    filename: &str,
    content: &str,
) -> Result<(), ServerError> {
    if filename.is_empty() || content.is_empty() {
        notify_error(session, "file transfer needs a filename and content").await;
        return Err(ServerError::InvalidFileRequest(
            "missing filename or content".to_string(),
        ));
    }

    let Ok(data) = BASE64.decode(content.as_bytes()) else {
        notify_error(session, "file content must be base64").await;
        return Err(ServerError::InvalidFileRequest(
            "content is not base64".to_string(),
        ));
    };

    let stored_name = match shared
        .files
        .store_public(session.username(), filename, &data)
        .await
    {
        Ok(name) => name,
        Err(error) => {
            notify_error(session, &format!("failed to store '{filename}'")).await;
            return Err(error);
        }
    };

    info!(user = %session.username(), name = %stored_name, "public file received");

    session
        .send(&Message::Info {
            content: format!("file '{filename}' uploaded as '{stored_name}'"),
            timestamp: Some(Utc::now()),
        })
        .await?;

    shared.broadcaster.send(Message::FileAvailable {
        from: session.username().to_string(),
        filename: stored_name.clone(),
        content: format!("{} shared a file: {stored_name}", session.username()),
        timestamp: Some(Utc::now()),
    });
    Ok(())
}

async fn handle_file_request(
    shared: &Shared,
    session: &Session,
    filename: &str,
) -> Result<(), ServerError> {
    if filename.is_empty() {
        notify_error(session, "file request needs a filename").await;
        return Err(ServerError::InvalidFileRequest(
            "missing filename".to_string(),
        ));
    }

    let data = match shared.files.load_public(filename).await {
        Ok(data) => data,
        Err(error) => {
            notify_error(session, &format!("file '{filename}' not found")).await;
            return Err(error);
        }
    };

    session
        .send(&Message::FileDownload {
            filename: filename.to_string(),
            from: Some("server".to_string()),
            content: Some(BASE64.encode(&data)),
        })
        .await?;
    info!(user = %session.username(), name = %filename, "public file sent");
    Ok(())
}

/// Store a sender-encrypted envelope and notify only the recipient. The
/// relay holds neither the plaintext nor the key to get at it.
async fn handle_private_file_transfer(
    shared: &Shared,
    session: &Session,
    to: &str,
    filename: &str,
    encrypted_key: String,
    content: String,
) -> Result<(), ServerError> {
    if filename.is_empty() || content.is_empty() || to.is_empty() || encrypted_key.is_empty() {
        notify_error(
            session,
            "private file transfer needs a filename, content, key and recipient",
        )
        .await;
        return Err(ServerError::InvalidFileRequest(
            "missing private file fields".to_string(),
        ));
    }

    let Some(recipient) = shared.registry.lookup(to).await else {
        notify_error(session, &format!("user '{to}' not found")).await;
        return Err(ServerError::RecipientNotFound(to.to_string()));
    };

    let envelope = FileEnvelope {
        encrypted_key,
        encrypted_data: content,
        filename: filename.to_string(),
        from: session.username().to_string(),
        to: recipient.username().to_string(),
    };

    if let Err(error) = shared.files.store_envelope(&envelope).await {
        notify_error(session, &format!("failed to store '{filename}'")).await;
        return Err(error);
    }

    info!(
        from = %session.username(),
        to = %recipient.username(),
        name = %filename,
        "private file received"
    );

    session
        .send(&Message::Info {
            content: format!(
                "private file '{filename}' sent to {}",
                recipient.username()
            ),
            timestamp: Some(Utc::now()),
        })
        .await?;

    recipient
        .send(&Message::PrivateFileAvailable {
            from: session.username().to_string(),
            to: recipient.username().to_string(),
            filename: envelope.filename.clone(),
            content: format!(
                "{} sent you a private file: {}",
                session.username(),
                envelope.filename
            ),
            timestamp: Some(Utc::now()),
        })
        .await?;
    Ok(())
}

/// Look up an envelope by (claimed sender, requester, filename) and return
/// it unmodified.
async fn handle_private_file_request(
    shared: &Shared,
    session: &Session,
    claimed_sender: &str,
    filename: &str,
) -> Result<(), ServerError> {
    if filename.is_empty() || claimed_sender.is_empty() {
        notify_error(session, "private file request needs a filename and sender").await;
        return Err(ServerError::InvalidFileRequest(
            "missing filename or sender".to_string(),
        ));
    }

    let envelope = match shared
        .files
        .load_envelope(
            &normalize_username(claimed_sender),
            session.username(),
            filename,
        )
        .await
    {
        Ok(envelope) => envelope,
        Err(error) => {
            notify_error(
                session,
                &format!("private file '{filename}' from {claimed_sender} not found"),
            )
            .await;
            return Err(error);
        }
    };

    session
        .send(&Message::PrivateFileDownload {
            to: session.username().to_string(),
            filename: envelope.filename,
            from: Some(envelope.from),
            encrypted_key: Some(envelope.encrypted_key),
            content: Some(envelope.encrypted_data),
        })
        .await?;
    info!(user = %session.username(), name = %filename, "private file sent");
    Ok(())
}

/// Send an `error` frame to the offending peer; failures only get logged,
/// the original error is what propagates.
async fn notify_error(session: &Session, text: &str) {
    let msg = Message::Error {
        content: text.to_string(),
    };
    if let Err(error) = session.send(&msg).await {
        debug!(user = %session.username(), %error, "failed to deliver error notice");
    }
}

/// Write one frame through the connection's write lock before a session
/// exists (authentication phase).
async fn send_raw(writer: &Mutex<SessionWriter>, msg: &Message) -> Result<(), WireError> {
    let frame = wire::encode(msg)?;
    let mut writer = writer.lock().await;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

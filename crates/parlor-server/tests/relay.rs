//! Integration tests driving the relay over real TCP connections with
//! raw protocol frames.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tempfile::TempDir;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

use parlor_server::{Server, ServerConfig, ServerError};
use parlor_shared::crypto;
use parlor_shared::message::Message;
use parlor_shared::wire;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: std::net::SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), ServerError>>,
    dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_timeout(Duration::from_secs(5)).await
    }

    async fn spawn_with_timeout(shutdown_timeout: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upload_dir: dir.path().join("uploads"),
            room_key_file: dir.path().join("room.key"),
            state_file: dir.path().join("server_state.json"),
            shutdown_timeout,
            max_file_size: 64 * 1024 * 1024,
        };

        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stop_rx.await;
        }));

        Self {
            addr,
            stop: Some(stop),
            handle,
            dir,
        }
    }

    async fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop.take().unwrap().send(()).unwrap();
        let result = self.handle.await.unwrap();
        // The relay persists state (e.g. server_state.json) as it stops.
        // Keep the temp dir on disk past this call so tests can inspect
        // those files; it is reclaimed when the test process exits.
        std::mem::forget(self.dir);
        result
    }
}

/// A protocol peer speaking raw frames, with its own RSA keypair.
struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    private: rsa::RsaPrivateKey,
    public_pem: String,
}

impl Peer {
    /// Dial and authenticate only.
    async fn connect(addr: std::net::SocketAddr, username: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut peer = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            // 1024-bit keys keep the suite fast.
            private: crypto::generate_keypair(1024).map(|(p, _)| p).unwrap(),
            public_pem: String::new(),
        };
        let public = rsa::RsaPublicKey::from(&peer.private);
        peer.public_pem = crypto::public_key_to_pem(&public).unwrap();

        peer.send(&Message::Auth {
            from: username.to_string(),
        })
        .await;
        let resp = peer.recv().await;
        assert_eq!(
            resp,
            Message::AuthResp {
                success: true,
                error: None
            },
            "authentication should succeed for '{username}'"
        );
        peer
    }

    /// Dial, authenticate and complete key exchange; returns the peer and
    /// its unwrapped room key.
    async fn connect_full(addr: std::net::SocketAddr, username: &str) -> (Self, crypto::RoomKey) {
        let mut peer = Self::connect(addr, username).await;
        peer.send(&Message::PublicKey {
            from: username.to_string(),
            content: peer.public_pem.clone(),
        })
        .await;

        let room_key_msg = peer
            .recv_until(|m| matches!(m, Message::RoomKey { .. }))
            .await;
        let Message::RoomKey { encrypted_key } = room_key_msg else {
            unreachable!()
        };
        let room_key = crypto::unwrap_room_key(&encrypted_key, &peer.private).unwrap();
        (peer, room_key)
    }

    async fn send(&mut self, msg: &Message) {
        wire::write_message(&mut self.writer, msg).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(READ_TIMEOUT, wire::read_message(&mut self.reader))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("stream closed unexpectedly")
    }

    /// Read frames until one matches, discarding broadcast noise (joins,
    /// rosters) on the way.
    async fn recv_until<F>(&mut self, pred: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    /// Assert that no frame matching `pred` arrives within `window`.
    async fn assert_silent<F>(&mut self, window: Duration, pred: F)
    where
        F: Fn(&Message) -> bool,
    {
        let result = timeout(window, async {
            loop {
                if let Ok(Some(msg)) = wire::read_message(&mut self.reader).await {
                    if pred(&msg) {
                        return msg;
                    }
                } else {
                    // EOF: silence achieved.
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;
        if let Ok(msg) = result {
            panic!("expected silence but received {msg:?}");
        }
    }
}

#[tokio::test]
async fn test_handshake_delivers_wrapped_room_key() {
    let server = TestServer::spawn().await;

    let (_alice, room_key) = Peer::connect_full(server.addr, "alice").await;

    // The unwrapped key actually encrypts and decrypts.
    let cipher = crypto::encrypt_with_room_key(b"hello", &room_key).unwrap();
    assert_eq!(
        crypto::decrypt_with_room_key(&cipher, &room_key).unwrap(),
        b"hello"
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_username_reoffers_authentication() {
    let server = TestServer::spawn().await;
    let _alice = Peer::connect(server.addr, "alice").await;

    // Same normalized name ("@Alice " == "alice") is rejected, but the
    // connection stays open and a new name succeeds.
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    wire::write_message(
        &mut writer,
        &Message::Auth {
            from: "@Alice ".to_string(),
        },
    )
    .await
    .unwrap();
    let resp = timeout(READ_TIMEOUT, wire::read_message(&mut reader))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match resp {
        Message::AuthResp {
            success: false,
            error: Some(error),
        } => assert!(error.contains("taken"), "unexpected error text: {error}"),
        other => panic!("expected rejection, got {other:?}"),
    }

    wire::write_message(
        &mut writer,
        &Message::Auth {
            from: "bob".to_string(),
        },
    )
    .await
    .unwrap();
    let resp = timeout(READ_TIMEOUT, wire::read_message(&mut reader))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        resp,
        Message::AuthResp {
            success: true,
            error: None
        }
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_auth_first_message_reoffered() {
    let server = TestServer::spawn().await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    wire::write_message(
        &mut writer,
        &Message::Public {
            from: "nobody".to_string(),
            encrypted_data: "eA==".to_string(),
            timestamp: None,
        },
    )
    .await
    .unwrap();

    let resp = timeout(READ_TIMEOUT, wire::read_message(&mut reader))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(resp, Message::Error { content } if content.contains("authentication")));

    // Authentication still works on the same connection.
    wire::write_message(
        &mut writer,
        &Message::Auth {
            from: "carol".to_string(),
        },
    )
    .await
    .unwrap();
    let resp = timeout(READ_TIMEOUT, wire::read_message(&mut reader))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        resp,
        Message::AuthResp {
            success: true,
            error: None
        }
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_self_private_message_rejected() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;

    alice
        .send(&Message::Private {
            from: "alice".to_string(),
            to: "alice".to_string(),
            encrypted_key: "eA==".to_string(),
            content: "eQ==".to_string(),
            timestamp: None,
        })
        .await;

    let err = alice
        .recv_until(|m| matches!(m, Message::Error { .. }))
        .await;
    assert!(matches!(err, Message::Error { content } if content.contains("yourself")));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_private_to_unknown_recipient_errors() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;

    alice
        .send(&Message::Private {
            from: "alice".to_string(),
            to: "ghost".to_string(),
            encrypted_key: "eA==".to_string(),
            content: "eQ==".to_string(),
            timestamp: None,
        })
        .await;

    let err = alice
        .recv_until(|m| matches!(m, Message::Error { .. }))
        .await;
    assert!(matches!(err, Message::Error { content } if content.contains("ghost")));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_key_request_returns_wrapped_key_only() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;
    let (bob, _) = Peer::connect_full(server.addr, "bob").await;

    alice
        .send(&Message::PublicKeyRequest {
            from: "alice".to_string(),
            to: "bob".to_string(),
        })
        .await;

    let resp = alice
        .recv_until(|m| matches!(m, Message::PublicKeyResponse { .. }))
        .await;
    let Message::PublicKeyResponse {
        from,
        to,
        encrypted_key,
        content,
    } = resp
    else {
        unreachable!()
    };
    assert_eq!(from, "bob");
    assert_eq!(to, "alice");

    // The relay never sends a bare key: the payload is bob's PEM wrapped
    // for alice, and only alice's private key opens it.
    assert_ne!(content, bob.public_pem);
    let pem = crypto::hybrid_decrypt(&encrypted_key, &content, &alice.private).unwrap();
    assert_eq!(String::from_utf8(pem).unwrap(), bob.public_pem);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_private_relay_forwards_and_echoes_opaquely() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;
    let (mut bob, _) = Peer::connect_full(server.addr, "bob").await;

    // alice discovers bob's key through the relay.
    alice
        .send(&Message::PublicKeyRequest {
            from: "alice".to_string(),
            to: "bob".to_string(),
        })
        .await;
    let resp = alice
        .recv_until(|m| matches!(m, Message::PublicKeyResponse { .. }))
        .await;
    let Message::PublicKeyResponse {
        encrypted_key,
        content,
        ..
    } = resp
    else {
        unreachable!()
    };
    let pem = crypto::hybrid_decrypt(&encrypted_key, &content, &alice.private).unwrap();
    let bob_key = crypto::public_key_from_pem(&String::from_utf8(pem).unwrap()).unwrap();

    let (wrapped, cipher) = crypto::hybrid_encrypt(b"secret", &bob_key).unwrap();
    alice
        .send(&Message::Private {
            from: "alice".to_string(),
            to: "bob".to_string(),
            encrypted_key: wrapped.clone(),
            content: cipher.clone(),
            timestamp: None,
        })
        .await;

    // bob receives the ciphertext verbatim and can decrypt it.
    let delivered = bob
        .recv_until(|m| matches!(m, Message::Private { .. }))
        .await;
    let Message::Private {
        from,
        encrypted_key: delivered_key,
        content: delivered_content,
        ..
    } = delivered
    else {
        unreachable!()
    };
    assert_eq!(from, "alice");
    assert_eq!(delivered_key, wrapped);
    assert_eq!(delivered_content, cipher);
    assert_eq!(
        crypto::hybrid_decrypt(&delivered_key, &delivered_content, &bob.private).unwrap(),
        b"secret"
    );

    // alice gets the same frame back as a delivery confirmation -- and
    // cannot decrypt it, since it was wrapped for bob.
    let echo = alice
        .recv_until(|m| matches!(m, Message::Private { .. }))
        .await;
    let Message::Private {
        from,
        encrypted_key: echo_key,
        content: echo_content,
        ..
    } = echo
    else {
        unreachable!()
    };
    assert_eq!(from, "alice");
    assert!(crypto::hybrid_decrypt(&echo_key, &echo_content, &alice.private).is_err());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_public_broadcast_skips_sender() {
    let server = TestServer::spawn().await;
    let (mut alice, room_key) = Peer::connect_full(server.addr, "alice").await;
    let (mut bob, _) = Peer::connect_full(server.addr, "bob").await;

    let encrypted_data = crypto::encrypt_with_room_key(b"hi room", &room_key).unwrap();
    alice
        .send(&Message::Public {
            from: "alice".to_string(),
            encrypted_data,
            timestamp: None,
        })
        .await;

    let delivered = bob
        .recv_until(|m| matches!(m, Message::Public { .. }))
        .await;
    let Message::Public {
        from,
        encrypted_data,
        ..
    } = delivered
    else {
        unreachable!()
    };
    assert_eq!(from, "alice");
    assert_eq!(
        crypto::decrypt_with_room_key(&encrypted_data, &room_key).unwrap(),
        b"hi room"
    );

    // The sender is skipped by username: alice sees no public frame.
    alice
        .assert_silent(Duration::from_millis(300), |m| {
            matches!(m, Message::Public { .. })
        })
        .await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_resends_room_key_and_roster() {
    let server = TestServer::spawn().await;
    let (mut alice, room_key) = Peer::connect_full(server.addr, "alice").await;

    alice
        .send(&Message::Reconnect {
            from: "alice".to_string(),
        })
        .await;

    let resent = alice
        .recv_until(|m| matches!(m, Message::RoomKey { .. }))
        .await;
    let Message::RoomKey { encrypted_key } = resent else {
        unreachable!()
    };
    assert_eq!(
        crypto::unwrap_room_key(&encrypted_key, &alice.private).unwrap(),
        room_key
    );

    let roster = alice
        .recv_until(|m| matches!(m, Message::UserList { .. }))
        .await;
    assert_eq!(
        roster,
        Message::UserList {
            users: vec!["alice".to_string()]
        }
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leave_cleanup_broadcasts_once() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;
    let (mut bob, _) = Peer::connect_full(server.addr, "bob").await;

    bob.send(&Message::Leave {
        from: Some("bob".to_string()),
        content: None,
        timestamp: None,
    })
    .await;

    let notice = alice
        .recv_until(|m| matches!(m, Message::Leave { .. }))
        .await;
    assert!(
        matches!(notice, Message::Leave { content: Some(content), .. } if content.contains("bob has left"))
    );

    let roster = alice
        .recv_until(|m| matches!(m, Message::UserList { .. }))
        .await;
    assert_eq!(
        roster,
        Message::UserList {
            users: vec!["alice".to_string()]
        }
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_public_file_upload_and_download() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;
    let (mut bob, _) = Peer::connect_full(server.addr, "bob").await;

    let payload = b"plain file bytes";
    alice
        .send(&Message::FileTransfer {
            from: Some("alice".to_string()),
            filename: "notes.txt".to_string(),
            content: BASE64.encode(payload),
        })
        .await;

    // Upload is acknowledged to the sender and advertised to everyone
    // under the uploader-namespaced name.
    let ack = alice
        .recv_until(|m| matches!(m, Message::Info { .. }))
        .await;
    assert!(matches!(ack, Message::Info { content, .. } if content.contains("alice__notes.txt")));

    let notice = bob
        .recv_until(|m| matches!(m, Message::FileAvailable { .. }))
        .await;
    let Message::FileAvailable { filename, .. } = notice else {
        unreachable!()
    };
    assert_eq!(filename, "alice__notes.txt");

    bob.send(&Message::FileDownload {
        filename: filename.clone(),
        from: None,
        content: None,
    })
    .await;
    let download = bob
        .recv_until(|m| matches!(m, Message::FileDownload { content: Some(_), .. }))
        .await;
    let Message::FileDownload {
        content: Some(content),
        ..
    } = download
    else {
        unreachable!()
    };
    assert_eq!(BASE64.decode(content).unwrap(), payload);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_private_file_envelope_flow() {
    let server = TestServer::spawn().await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;
    let (mut bob, _) = Peer::connect_full(server.addr, "bob").await;
    let (mut carol, _) = Peer::connect_full(server.addr, "carol").await;

    // alice encrypts for bob before anything leaves her process.
    let bob_public = rsa::RsaPublicKey::from(&bob.private);
    let payload = b"private file bytes";
    let (wrapped, cipher) = crypto::hybrid_encrypt(payload, &bob_public).unwrap();

    alice
        .send(&Message::PrivateFileTransfer {
            from: "alice".to_string(),
            to: "bob".to_string(),
            filename: "secret.pdf".to_string(),
            encrypted_key: wrapped,
            content: cipher,
        })
        .await;

    // Only the recipient is notified.
    let notice = bob
        .recv_until(|m| matches!(m, Message::PrivateFileAvailable { .. }))
        .await;
    assert!(
        matches!(&notice, Message::PrivateFileAvailable { from, filename, .. }
            if from == "alice" && filename == "secret.pdf")
    );
    carol
        .assert_silent(Duration::from_millis(300), |m| {
            matches!(m, Message::PrivateFileAvailable { .. })
        })
        .await;

    // bob retrieves the envelope and decrypts it.
    bob.send(&Message::PrivateFileDownload {
        to: "alice".to_string(),
        filename: "secret.pdf".to_string(),
        from: None,
        encrypted_key: None,
        content: None,
    })
    .await;
    let download = bob
        .recv_until(|m| matches!(m, Message::PrivateFileDownload { content: Some(_), .. }))
        .await;
    let Message::PrivateFileDownload {
        from: Some(from),
        encrypted_key: Some(encrypted_key),
        content: Some(content),
        ..
    } = download
    else {
        panic!("incomplete private file download response");
    };
    assert_eq!(from, "alice");
    assert_eq!(
        crypto::hybrid_decrypt(&encrypted_key, &content, &bob.private).unwrap(),
        payload
    );

    // carol asking for the same envelope misses: it is keyed to bob.
    carol
        .send(&Message::PrivateFileDownload {
            to: "alice".to_string(),
            filename: "secret.pdf".to_string(),
            from: None,
            encrypted_key: None,
            content: None,
        })
        .await;
    let err = carol
        .recv_until(|m| matches!(m, Message::Error { .. }))
        .await;
    assert!(matches!(err, Message::Error { content } if content.contains("not found")));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_shutdown_persists_state() {
    let server = TestServer::spawn().await;
    let state_file = server.dir.path().join("server_state.json");
    let key_file = server.dir.path().join("room.key");

    server.shutdown().await.unwrap();

    // The state file holds the same key the key file was seeded with.
    let persisted = parlor_server::state::load_state(&state_file).await.unwrap();
    let key_file_contents = std::fs::read_to_string(key_file).unwrap();
    assert_eq!(
        BASE64.decode(key_file_contents.trim()).unwrap(),
        persisted.as_slice()
    );
}

#[tokio::test]
async fn test_shutdown_deadline_exceeded_reports_error() {
    let server = TestServer::spawn_with_timeout(Duration::from_millis(200)).await;
    let (mut alice, _) = Peer::connect_full(server.addr, "alice").await;
    let (_bob, _) = Peer::connect_full(server.addr, "bob").await;

    // bob stops reading. alice floods him with large private messages:
    // once bob's transport buffers fill, the relay's dispatch tasks block
    // on his session write lock and alice's handler cannot drain.
    let blob = BASE64.encode(vec![0u8; 64 * 1024]);
    for _ in 0..200 {
        alice
            .send(&Message::Private {
                from: "alice".to_string(),
                to: "bob".to_string(),
                encrypted_key: "eA==".to_string(),
                content: blob.clone(),
                timestamp: None,
            })
            .await;
    }

    // Give the relay time to read and dispatch the backlog.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let result = server.shutdown().await;
    assert!(
        matches!(result, Err(ServerError::ShutdownTimeout(_))),
        "expected a shutdown deadline error, got {result:?}"
    );
}

//! Outbound connection to the relay.
//!
//! Owns both transport halves: the write half behind a lock so concurrent
//! senders never interleave frames, and a background read task that feeds
//! decoded messages into a bounded queue. A full queue drops the message
//! with a warning rather than stalling the reader.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parlor_shared::constants::INCOMING_QUEUE_CAPACITY;
use parlor_shared::error::WireError;
use parlor_shared::message::Message;
use parlor_shared::wire;

pub struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    read_task: JoinHandle<()>,
}

impl Connection {
    /// Dial the relay. Returns the connection and the receiving end of
    /// its incoming message queue; the queue closes when the read loop
    /// ends (EOF or transport error).
    pub async fn connect(address: &str) -> std::io::Result<(Self, mpsc::Receiver<Message>)> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(INCOMING_QUEUE_CAPACITY);
        let read_task = tokio::spawn(read_loop(read_half, tx));

        Ok((
            Self {
                writer: Arc::new(Mutex::new(write_half)),
                read_task,
            },
            rx,
        ))
    }

    /// Write one frame, holding the write lock for the whole frame.
    pub async fn send(&self, msg: &Message) -> Result<(), WireError> {
        let frame = wire::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Graceful close: shut the write half down so the relay sees EOF.
    /// The read task is stopped by `Drop`.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(%error, "failed to shut down writer cleanly");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_loop(read_half: OwnedReadHalf, tx: mpsc::Sender<Message>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match wire::read_message(&mut reader).await {
            Ok(Some(msg)) => {
                if let Err(TrySendError::Full(msg)) = tx.try_send(msg) {
                    warn!(kind = msg.kind(), "incoming queue full, dropping message");
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(error) => {
                warn!(%error, "read error");
                break;
            }
        }
    }
    // Dropping `tx` closes the incoming queue; the session observes the
    // disconnect there.
}

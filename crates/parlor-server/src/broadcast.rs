//! Broadcast fan-out engine.
//!
//! A single dispatcher task drains a bounded queue of outbound broadcast
//! messages. Producers never block: when the queue is full the message is
//! dropped and a warning logged -- broadcast delivery is explicitly
//! best-effort under sustained overload.
//!
//! For each dequeued item the dispatcher snapshots the registry and spawns
//! one send task per recipient, so a stalled peer cannot delay delivery to
//! the others. The batch is awaited before the next item is dequeued:
//! batches go out in enqueue order, delivery order within a batch is
//! unspecified.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use parlor_shared::constants::BROADCAST_QUEUE_CAPACITY;
use parlor_shared::message::Message;

use crate::registry::Registry;

#[derive(Debug)]
struct Outbound {
    message: Message,
    /// Username to skip, compared against each session's normalized name.
    exclude: Option<String>,
}

/// Producer handle onto the broadcast queue. Cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Outbound>,
}

impl Broadcaster {
    /// Queue a message for every connected session.
    pub fn send(&self, message: Message) {
        self.enqueue(Outbound {
            message,
            exclude: None,
        });
    }

    /// Queue a message for every session except `exclude`.
    pub fn send_excluding(&self, message: Message, exclude: &str) {
        self.enqueue(Outbound {
            message,
            exclude: Some(exclude.to_string()),
        });
    }

    fn enqueue(&self, item: Outbound) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                warn!(
                    kind = item.message.kind(),
                    "broadcast queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(item)) => {
                debug!(
                    kind = item.message.kind(),
                    "broadcast dispatcher stopped, dropping message"
                );
            }
        }
    }
}

/// Create the broadcast queue and spawn its dispatcher task.
///
/// The dispatcher exits when the shutdown watch flips or every producer
/// handle is gone.
pub fn channel(
    registry: Arc<Registry>,
    mut done: watch::Receiver<bool>,
) -> (Broadcaster, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(BROADCAST_QUEUE_CAPACITY);

    let handle = tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = done.changed() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let sessions = registry.sessions().await;
            let mut batch = JoinSet::new();
            for session in sessions {
                if item.exclude.as_deref() == Some(session.username()) {
                    continue;
                }
                let message = item.message.clone();
                batch.spawn(async move {
                    if let Err(error) = session.send(&message).await {
                        warn!(
                            user = %session.username(),
                            %error,
                            "failed to deliver broadcast"
                        );
                    }
                });
            }
            while batch.join_next().await.is_some() {}
        }
        debug!("broadcast dispatcher stopped");
    });

    (Broadcaster { tx }, handle)
}

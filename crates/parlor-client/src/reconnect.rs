//! Automatic reconnection.
//!
//! When the receive loop observes the transport closing, this task
//! re-dials the relay forever with a fixed delay between attempts: full
//! handshake, then an explicit `reconnect` control message so the relay
//! resends the room key and a fresh roster. The loop stops on the first
//! success, or as soon as the session is intentionally closed.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use parlor_shared::constants::RECONNECT_DELAY;
use parlor_shared::message::Message;

use crate::session::{self, Inner};

pub(crate) fn run(
    inner: Arc<Inner>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    // Returning a boxed future (rather than an `async fn` opaque type)
    // breaks the cyclic Send inference between `handshake`, `recv_loop`,
    // and this reconnector, all of which spawn one another.
    Box::pin(run_inner(inner))
}

async fn run_inner(inner: Arc<Inner>) {
    let Some(address) = inner.address.read().await.clone() else {
        return;
    };

    loop {
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }

        match session::handshake(&inner, &address).await {
            Ok(()) => {
                let username = inner.username.read().await.clone().unwrap_or_default();
                if let Err(error) =
                    session::send_current(&inner, &Message::Reconnect { from: username }).await
                {
                    warn!(%error, "failed to send reconnect notice");
                }

                inner.connected_tx.send_replace(true);
                session::display(&inner, "reconnected to server".to_string());
                info!(addr = %address, "reconnected");
                return;
            }
            Err(error) => {
                debug!(addr = %address, %error, "reconnect attempt failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

//! Server lifecycle: accept loop, shared subsystems, graceful shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use parlor_shared::crypto::RoomKey;

use crate::broadcast::{self, Broadcaster};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::file_store::FileStore;
use crate::handler;
use crate::registry::Registry;
use crate::state;

/// Subsystems shared by every connection handler.
pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) files: FileStore,
    /// Set once at startup, read-only thereafter.
    pub(crate) room_key: RoomKey,
}

/// The relay server, bound and ready to run.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    shared: Arc<Shared>,
    done_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Load (or generate) key material, initialize subsystems and bind
    /// the listener.
    ///
    /// The room key comes from the dedicated key file; a persisted state
    /// file from a previous shutdown overrides it when present and
    /// well-formed. Corruption at either layer falls back to a fresh key
    /// rather than failing startup.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let mut room_key = state::load_or_generate_room_key(&config.room_key_file).await?;
        if let Some(restored) = state::load_state(&config.state_file).await {
            room_key = restored;
        }

        let files = FileStore::new(config.upload_dir.clone(), config.max_file_size).await?;
        let registry = Arc::new(Registry::new());

        let (done_tx, done_rx) = watch::channel(false);
        let (broadcaster, dispatcher) = broadcast::channel(registry.clone(), done_rx);

        let listener = TcpListener::bind(config.listen_addr).await?;

        let shared = Arc::new(Shared {
            registry,
            broadcaster,
            files,
            room_key,
        });

        Ok(Self {
            config,
            listener,
            shared,
            done_tx,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Best-effort state save if the process panics: the hook writes the
    /// state file synchronously before the default handler runs.
    pub fn install_panic_state_hook(&self) {
        let path = self.config.state_file.clone();
        let room_key = self.shared.room_key;
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Err(error) = state::save_state_sync(&path, &room_key) {
                eprintln!("failed to save state from panic hook: {error}");
            }
            default_hook(info);
        }));
    }

    /// Run the accept loop until `shutdown` resolves, then drain.
    ///
    /// Shutdown order: persist state, stop accepting, flip the shared
    /// done flag so every read loop and the broadcast dispatcher exit,
    /// then wait -- bounded by the configured deadline -- for the active
    /// connection handlers to finish. Exceeding the deadline is an error,
    /// not a silent hang.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            config,
            listener,
            shared,
            done_tx,
            dispatcher,
        } = self;
        tokio::pin!(shutdown);

        let mut connections = JoinSet::new();
        info!(addr = %listener.local_addr()?, "relay listening");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = shared.clone();
                        let done = done_tx.subscribe();
                        connections.spawn(handler::handle_connection(shared, stream, peer, done));
                    }
                    Err(error) => warn!(%error, "failed to accept connection"),
                },
            }
        }

        info!("saving server state before shutdown");
        if let Err(error) = state::save_state(&config.state_file, &shared.room_key).await {
            error!(%error, "failed to save server state");
        }

        drop(listener);
        let _ = done_tx.send(true);

        let drain = async {
            while connections.join_next().await.is_some() {}
            let _ = dispatcher.await;
        };
        if tokio::time::timeout(config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            return Err(ServerError::ShutdownTimeout(config.shutdown_timeout));
        }

        info!("shutdown complete");
        Ok(())
    }

    /// Run until Ctrl+C.
    pub async fn run_until_ctrl_c(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

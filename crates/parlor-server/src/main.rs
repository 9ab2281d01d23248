use tracing::info;
use tracing_subscriber::EnvFilter;

use parlor_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parlor_server=debug")),
        )
        .init();

    info!("starting parlor relay v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "loaded configuration");

    let server = Server::bind(config).await?;

    // A panic anywhere -- including during shutdown -- still gets a
    // best-effort state save.
    server.install_panic_state_hook();

    server.run_until_ctrl_c().await?;
    Ok(())
}

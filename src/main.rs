//! inkpad-server: serve the collaborative editing API.
//!
//! Configuration is environment-driven (see `config`); shutdown on
//! SIGINT/SIGTERM flushes every loaded document's snapshot before
//! exiting.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::oneshot;

use inkpad_collab::config::Config;
use inkpad_collab::hub::Hub;
use inkpad_collab::server::build_router;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Arc::new(Config::from_env());
    std::fs::create_dir_all(&config.vault_dir)?;
    info!(
        "vault at {:?}, transform window {}, heartbeat {}s",
        config.vault_dir, config.transform_window, config.heartbeat_secs
    );

    let hub = Hub::new(config.clone());
    let app = build_router(hub.clone());

    let (signal_tx, signal_rx) = oneshot::channel();
    tokio::spawn(listen_for_shutdown(signal_tx));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("listening on {}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal_rx.await;
        })
        .await?;

    info!("flushing documents before exit");
    hub.flush_all().await;
    Ok(())
}

#[cfg(unix)]
async fn listen_for_shutdown(signal_tx: oneshot::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            let _ = signal_tx.send(());
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    let _ = signal_tx.send(());
}

#[cfg(not(unix))]
async fn listen_for_shutdown(signal_tx: oneshot::Sender<()>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received SIGINT");
    }
    let _ = signal_tx.send(());
}

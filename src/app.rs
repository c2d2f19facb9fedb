use crate::{config::Settings, detector::OrtDetector, labels::LabelCatalog, server::WsServer};
use std::error::Error;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Settings) -> Result<(), Box<dyn Error>> {
    let detector = match OrtDetector::new(&config.model) {
        Ok(detector) => detector,
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let catalog = match LabelCatalog::load(&config.labels) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!("Failed to load label catalog: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let server = WsServer::new(detector, catalog, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

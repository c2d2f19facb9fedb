use crate::{
    config::Settings, detector::Detector, labels::LabelCatalog, session::handle_session, tls,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast::Receiver,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;

/// WebSocket detection server: accepts connections, optionally terminates
/// TLS, upgrades to WebSocket, and runs one session supervisor per client.
pub struct WsServer<D: Detector> {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    detector: Arc<D>,
    catalog: Arc<LabelCatalog>,
    channel_depth: usize,
}

impl<D: Detector> WsServer<D> {
    pub async fn new(
        detector: D,
        catalog: LabelCatalog,
        config: &Settings,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.server.get_address()).await?;
        let tls = match &config.server.tls {
            Some(settings) => Some(tls::build_acceptor(settings)?),
            None => None,
        };

        Ok(Self {
            listener,
            tls,
            detector: Arc::new(detector),
            catalog: Arc::new(catalog),
            channel_depth: config.channel.depth,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown_rx: Receiver<()>) -> anyhow::Result<JoinHandle<()>> {
        tracing::info!("Listening on {}", self.listener.local_addr()?);

        let Self {
            listener,
            tls,
            detector,
            catalog,
            channel_depth,
        } = self;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let tls = tls.clone();
                            let detector = detector.clone();
                            let catalog = catalog.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(
                                    stream,
                                    peer,
                                    tls,
                                    detector,
                                    catalog,
                                    channel_depth,
                                )
                                .await
                                {
                                    tracing::warn!("Session with {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
            }
            tracing::info!("Server stopped");
        });

        Ok(handle)
    }
}

async fn serve_connection<D: Detector>(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    detector: Arc<D>,
    catalog: Arc<LabelCatalog>,
    channel_depth: usize,
) -> anyhow::Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(stream).await?;
            let ws = accept_async(stream).await?;
            handle_session(ws, peer, detector, catalog, channel_depth).await;
        }
        None => {
            let ws = accept_async(stream).await?;
            handle_session(ws, peer, detector, catalog, channel_depth).await;
        }
    }
    Ok(())
}

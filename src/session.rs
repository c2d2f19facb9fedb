use crate::{
    detector::Detector,
    labels::LabelCatalog,
    mailbox::FrameMailbox,
    protocol::{correlation_id_hint, FrameRequest, ServerMessage},
    worker::InferenceWorker,
};
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::instrument;

const OUTBOUND_BUFFER: usize = 16;

/// Supervises one client connection: a receive loop feeding the frame
/// mailbox, a writer task owning the outbound half of the socket, and one
/// inference worker.
///
/// The receive loop never waits on inference; its only synchronization
/// point is the non-blocking mailbox push. Once closure is observed, the
/// mailbox is closed and the worker and writer are shut down before this
/// function returns, so no result is ever sent past that point.
#[instrument(skip(ws, detector, catalog, channel_depth))]
pub async fn handle_session<S, D>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    detector: Arc<D>,
    catalog: Arc<LabelCatalog>,
    channel_depth: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    D: Detector,
{
    let (mut sink, mut stream) = ws.split();
    let mailbox = Arc::new(FrameMailbox::new(channel_depth));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let worker = InferenceWorker::new(
        mailbox.clone(),
        detector,
        catalog,
        outbound_tx.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));

    let mut writer_shutdown = shutdown_tx.subscribe();
    let writer_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_shutdown.recv() => break,
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("Failed to serialize response: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    tracing::info!("Client connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<FrameRequest>(&text) {
                Ok(frame) => {
                    if let Some(dropped) = mailbox.push(frame) {
                        tracing::debug!(
                            correlation_id = %dropped.correlation_id,
                            "Frame superseded before inference"
                        );
                    }
                }
                Err(e) => match correlation_id_hint(&text) {
                    Some(id) => {
                        let error = ServerMessage::error(
                            format!("Malformed frame message: {}", e),
                            Some(id),
                        );
                        // try_send keeps the receive loop from ever waiting
                        // on the writer.
                        if outbound_tx.try_send(error).is_err() {
                            tracing::warn!("Dropping error response, writer is backlogged");
                        }
                    }
                    None => tracing::warn!("Discarding malformed frame message: {}", e),
                },
            },
            Ok(Message::Binary(_)) => {
                tracing::warn!("Ignoring binary message, frames must be JSON text");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    mailbox.close();
    let _ = shutdown_tx.send(());
    drop(outbound_tx);
    let _ = worker_handle.await;
    let _ = writer_handle.await;

    tracing::info!("Client disconnected");
}

use crate::{
    decode::{decode_frame, DecodeError},
    detector::{Detector, DetectorError, RawDetection},
    labels::LabelCatalog,
    mailbox::FrameMailbox,
    protocol::{Detection, FrameRequest, ServerMessage},
};
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("Detection failed: {0}")]
    Detector(#[from] DetectorError),
}

/// Per-connection inference loop.
///
/// Dequeues one frame at a time, runs decode → detect → enrich on the
/// blocking pool, and emits exactly one outbound message per dequeued frame.
/// A failing frame produces an error message and the loop keeps going; the
/// loop only ends when the mailbox closes, the shutdown signal fires, or the
/// outbound side is gone.
pub struct InferenceWorker<D: Detector> {
    mailbox: Arc<FrameMailbox<FrameRequest>>,
    detector: Arc<D>,
    catalog: Arc<LabelCatalog>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl<D: Detector> InferenceWorker<D> {
    pub fn new(
        mailbox: Arc<FrameMailbox<FrameRequest>>,
        detector: Arc<D>,
        catalog: Arc<LabelCatalog>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            mailbox,
            detector,
            catalog,
            outbound,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                frame = self.mailbox.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            // A shutdown mid-inference abandons the blocking call; its result
            // is discarded when it eventually completes, never sent.
            let message = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                message = self.process(frame) => message,
            };

            if self.outbound.send(message).await.is_err() {
                break;
            }
        }
        tracing::debug!("Inference worker stopped");
    }

    async fn process(&self, frame: FrameRequest) -> ServerMessage {
        let detector = self.detector.clone();
        let payload = frame.image;
        let correlation_id = frame.correlation_id;

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || -> Result<Vec<RawDetection>, FrameError> {
            let image = decode_frame(&payload)?;
            Ok(detector.detect(&image)?)
        })
        .await;

        match outcome {
            Ok(Ok(raw_detections)) => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    detections = raw_detections.len(),
                    "Inference complete"
                );
                let detections = raw_detections
                    .iter()
                    .map(|raw| enrich(raw, &self.catalog))
                    .collect();
                ServerMessage::Detections {
                    request_id: correlation_id,
                    detections,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(correlation_id = %correlation_id, "Frame failed: {}", e);
                ServerMessage::error(e.to_string(), Some(correlation_id))
            }
            Err(e) => {
                tracing::error!(correlation_id = %correlation_id, "Inference task panicked: {}", e);
                ServerMessage::error("Inference task failed", Some(correlation_id))
            }
        }
    }
}

fn enrich(raw: &RawDetection, catalog: &LabelCatalog) -> Detection {
    let class_label = match catalog.class_name(raw.class_id) {
        Some(label) => label.to_string(),
        None => format!("Unknown class {}", raw.class_id),
    };
    let category = catalog.nutri_score(&class_label).to_string();

    Detection {
        class_label,
        confidence: raw.confidence,
        category,
        bbox: [raw.x1, raw.y1, raw.x2 - raw.x1, raw.y2 - raw.y1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    struct StubDetector {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    impl StubDetector {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }
        }

        fn failing_on(call: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_call: Some(call),
            }
        }
    }

    impl Detector for StubDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>, DetectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(DetectorError::Inference("accelerator fault".to_string()));
            }
            Ok(vec![RawDetection {
                class_id: 0,
                confidence: 0.9,
                x1: 10.,
                y1: 20.,
                x2: 110.,
                y2: 220.,
            }])
        }
    }

    fn catalog() -> Arc<LabelCatalog> {
        let mut scores = HashMap::new();
        scores.insert("pasta rummo".to_string(), "A".to_string());
        Arc::new(LabelCatalog::from_parts(
            vec!["pasta rummo".to_string()],
            scores,
        ))
    }

    fn frame(id: &str) -> FrameRequest {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(4, 4, Rgb([1, 2, 3]));
        let mut bytes: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        FrameRequest {
            correlation_id: id.to_string(),
            image: base64::engine::general_purpose::STANDARD.encode(&bytes),
        }
    }

    struct Harness {
        mailbox: Arc<FrameMailbox<FrameRequest>>,
        outbound_rx: mpsc::Receiver<ServerMessage>,
        shutdown_tx: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_worker(detector: StubDetector) -> Harness {
        let mailbox = Arc::new(FrameMailbox::new(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        let worker = InferenceWorker::new(
            mailbox.clone(),
            Arc::new(detector),
            catalog(),
            outbound_tx,
        );
        let handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));

        Harness {
            mailbox,
            outbound_rx,
            shutdown_tx,
            handle,
        }
    }

    #[tokio::test]
    async fn emits_one_enriched_result_per_frame() {
        let mut harness = spawn_worker(StubDetector::new());

        harness.mailbox.push(frame("req-1"));

        let message = harness.outbound_rx.recv().await.unwrap();
        match message {
            ServerMessage::Detections {
                request_id,
                detections,
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(detections.len(), 1);
                assert_eq!(detections[0].class_label, "pasta rummo");
                assert_eq!(detections[0].category, "A");
                assert_eq!(detections[0].bbox, [10., 20., 100., 200.]);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        harness.mailbox.close();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn detector_failure_produces_error_and_loop_survives() {
        let mut harness = spawn_worker(StubDetector::failing_on(0));

        harness.mailbox.push(frame("req-bad"));
        let message = harness.outbound_rx.recv().await.unwrap();
        match message {
            ServerMessage::Error { error, request_id } => {
                assert_eq!(request_id.as_deref(), Some("req-bad"));
                assert!(error.contains("accelerator fault"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        harness.mailbox.push(frame("req-good"));
        let message = harness.outbound_rx.recv().await.unwrap();
        match message {
            ServerMessage::Detections { request_id, .. } => assert_eq!(request_id, "req-good"),
            other => panic!("unexpected message: {:?}", other),
        }

        harness.mailbox.close();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_frame_produces_error_with_its_id() {
        let mut harness = spawn_worker(StubDetector::new());

        harness.mailbox.push(FrameRequest {
            correlation_id: "req-corrupt".to_string(),
            image: base64::engine::general_purpose::STANDARD.encode(b"not an image"),
        });

        let message = harness.outbound_rx.recv().await.unwrap();
        match message {
            ServerMessage::Error { request_id, .. } => {
                assert_eq!(request_id.as_deref(), Some("req-corrupt"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        harness.mailbox.close();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn frames_pushed_without_pops_collapse_to_the_freshest() {
        let mailbox = Arc::new(FrameMailbox::new(1));
        mailbox.push(frame("a"));
        mailbox.push(frame("b"));
        mailbox.push(frame("c"));

        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let worker = InferenceWorker::new(
            mailbox.clone(),
            Arc::new(StubDetector::new()),
            catalog(),
            outbound_tx,
        );
        let handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));

        let message = outbound_rx.recv().await.unwrap();
        match message {
            ServerMessage::Detections { request_id, .. } => assert_eq!(request_id, "c"),
            other => panic!("unexpected message: {:?}", other),
        }

        // Nothing else was ever delivered to the worker.
        assert!(timeout(Duration::from_millis(20), outbound_rx.recv())
            .await
            .is_err());

        mailbox.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_with_queued_frame_emits_nothing() {
        let mailbox = Arc::new(FrameMailbox::new(1));
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        mailbox.push(frame("never-processed"));
        mailbox.close();

        let worker = InferenceWorker::new(
            mailbox,
            Arc::new(StubDetector::new()),
            catalog(),
            outbound_tx,
        );
        let handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));
        handle.await.unwrap();

        assert!(outbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_an_idle_worker() {
        let harness = spawn_worker(StubDetector::new());

        harness.shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(1), harness.handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn results_follow_dequeue_order() {
        let mut harness = spawn_worker(StubDetector::new());

        harness.mailbox.push(frame("first"));
        let first = harness.outbound_rx.recv().await.unwrap();
        harness.mailbox.push(frame("second"));
        let second = harness.outbound_rx.recv().await.unwrap();

        let ids: Vec<String> = [first, second]
            .into_iter()
            .map(|m| match m {
                ServerMessage::Detections { request_id, .. } => request_id,
                other => panic!("unexpected message: {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec!["first", "second"]);

        harness.mailbox.close();
        harness.handle.await.unwrap();
    }
}

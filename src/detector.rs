use crate::config::ModelSettings;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array, ArrayD, Axis, Ix3, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;

const MODEL_INPUT_SIZE: u32 = 640;
const NMS_IOU_THRESHOLD: f32 = 0.7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Session mutex poisoned: {0}")]
    SessionPoisoned(String),
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// One detected object in pixel coordinates of the original image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Blocking detection seam. Implementations may take as long as they need;
/// callers are responsible for keeping blocking calls off the I/O context.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectorError>;
}

fn intersection(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let width = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let height = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    (width.max(0.)) * (height.max(0.))
}

fn union(box1: &RawDetection, box2: &RawDetection) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn non_max_suppression(mut boxes: Vec<RawDetection>) -> Vec<RawDetection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while !boxes.is_empty() {
        result.push(boxes[0]);
        boxes = boxes
            .iter()
            .filter(|candidate| {
                intersection(&boxes[0], candidate) / union(&boxes[0], candidate)
                    < NMS_IOU_THRESHOLD
            })
            .copied()
            .collect();
    }

    result
}

fn preprocess(image: &DynamicImage) -> (Array<f32, Ix4>, u32, u32) {
    let (img_width, img_height) = image.dimensions();
    let resized = image.resize_exact(MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, FilterType::CatmullRom);

    let size = MODEL_INPUT_SIZE as usize;
    let mut input = Array::<f32, Ix4>::zeros((1, 3, size, size));
    for pixel in resized.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    (input, img_width, img_height)
}

/// Decodes a YOLO-style output tensor of shape `[1, 4 + classes, anchors]`
/// into boxes scaled back to the original image, keeping anchors whose best
/// class probability clears `min_probability`.
fn decode_output(
    output: &ArrayD<f32>,
    min_probability: f32,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<RawDetection>, DetectorError> {
    let view = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;
    if view.shape()[1] < 5 {
        return Err(DetectorError::InvalidOutput(format!(
            "Expected shape [1, 4 + classes, anchors], got {:?}",
            view.shape()
        )));
    }

    let scale_x = img_width as f32 / MODEL_INPUT_SIZE as f32;
    let scale_y = img_height as f32 / MODEL_INPUT_SIZE as f32;

    let anchors = view.index_axis(Axis(0), 0);
    let mut boxes = Vec::new();

    for anchor in anchors.axis_iter(Axis(1)) {
        let (class_id, prob) = anchor
            .iter()
            .skip(4)
            .enumerate()
            .map(|(index, value)| (index, *value))
            .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
            .expect("output has at least one class row");

        if prob < min_probability {
            continue;
        }

        let xc = anchor[0] * scale_x;
        let yc = anchor[1] * scale_y;
        let w = anchor[2] * scale_x;
        let h = anchor[3] * scale_y;

        boxes.push(RawDetection {
            class_id,
            confidence: prob,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    Ok(non_max_suppression(boxes))
}

/// ONNX detector backed by a pool of sessions dispatched round-robin.
/// Each session is mutex-guarded: a single session must never run two
/// inferences concurrently, and one caller's output is never visible to
/// another.
pub struct OrtDetector {
    sessions: Vec<Arc<Mutex<Session>>>,
    counter: AtomicUsize,
    min_probability: f32,
}

impl OrtDetector {
    pub fn new(model_config: &ModelSettings) -> Result<Self, DetectorError> {
        ort::init().commit();

        let sessions = (0..model_config.num_instances.max(1))
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_model_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!("Created {} ONNX sessions", sessions.len());

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            min_probability: model_config.min_probability,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| DetectorError::SessionPoisoned(e.to_string()))?;

        tracing::debug!("Running inference on session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs["output0"].try_extract_tensor::<f32>()?;
        let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;

        Ok(array)
    }
}

impl Detector for OrtDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, DetectorError> {
        let (input, img_width, img_height) = preprocess(image);
        let output = self.run_inference(&input)?;
        decode_output(&output, self.min_probability, img_width, img_height)
    }
}

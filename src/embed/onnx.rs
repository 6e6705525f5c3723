//! ONNX Runtime adapters for the embedding provider contract.
//!
//! Four sessions: a face detector with a fixed 416x416 input, a 128-dim
//! face descriptor model, and the visual/text halves of a CLIP-style joint
//! model. Each session loads lazily behind a mutex; holding the lock during
//! the load coalesces concurrent load requests, and a failed load is cached
//! and surfaced on every subsequent call until `reset_models`.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EmbedConfig;
use crate::error::CoreError;
use crate::store::BoundingBox;

use super::{EmbeddingProvider, ImageSource, RawDetection, DETECTOR_INPUT_SIZE};

const DETECTION_CONFIDENCE_THRESHOLD: f32 = 0.6;
const NMS_THRESHOLD: f32 = 0.3;
const DESCRIPTOR_INPUT_SIZE: u32 = 112;
const CLIP_INPUT_SIZE: u32 = 224;

struct ModelSpec {
    filename: &'static str,
    url: &'static str,
}

const DETECTOR_MODEL: ModelSpec = ModelSpec {
    filename: "face-rfb-416.onnx",
    url: "https://huggingface.co/fovea-models/face-rfb-416/resolve/main/model.onnx",
};

const DESCRIPTOR_MODEL: ModelSpec = ModelSpec {
    filename: "mobilefacenet-128.onnx",
    url: "https://huggingface.co/fovea-models/mobilefacenet-128/resolve/main/model.onnx",
};

const VISUAL_MODEL: ModelSpec = ModelSpec {
    filename: "clip-vit-b32-vision.onnx",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
};

const TEXT_MODEL: ModelSpec = ModelSpec {
    filename: "clip-vit-b32-text.onnx",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx",
};

/// Per-model load state. `Failed` is sticky until an explicit reset.
enum ModelState {
    Unloaded,
    Ready(Session),
    Failed(String),
}

pub struct OnnxProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    models_dir: PathBuf,
    detection_timeout: Duration,
    detector: Mutex<ModelState>,
    descriptor: Mutex<ModelState>,
    visual: Mutex<ModelState>,
    text: Mutex<ModelState>,
}

impl OnnxProvider {
    pub fn new(config: &EmbedConfig) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                models_dir: config.models_dir.clone(),
                detection_timeout: Duration::from_secs(config.detection_timeout_secs),
                detector: Mutex::new(ModelState::Unloaded),
                descriptor: Mutex::new(ModelState::Unloaded),
                visual: Mutex::new(ModelState::Unloaded),
                text: Mutex::new(ModelState::Unloaded),
            }),
        }
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_faces(&self, image_path: &Path) -> Result<Vec<RawDetection>, CoreError> {
        // Detection runs on a watchdog thread so a wedged inference call
        // cannot stall the whole scan. On timeout the in-flight result is
        // discarded; the session mutex serializes any follow-up call behind
        // the still-running one.
        let inner = Arc::clone(&self.inner);
        let path = image_path.to_path_buf();
        let timeout = self.inner.detection_timeout;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(inner.detect_faces_blocking(&path));
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(path = %image_path.display(), "face detection timed out");
                Err(CoreError::DetectionTimeout(timeout.as_secs()))
            }
        }
    }

    fn face_descriptor(&self, image_path: &Path, bbox: &BoundingBox) -> Result<Vec<f32>, CoreError> {
        let img = load_image(image_path)?;
        let (width, height) = img.dimensions();
        let crop = crop_face(&img, &bbox.scaled(DETECTOR_INPUT_SIZE, width, height), width, height);
        self.inner.run_descriptor(&crop)
    }

    fn embed_image(&self, source: ImageSource<'_>) -> Result<Vec<f32>, CoreError> {
        match source {
            ImageSource::Image(img) => self.inner.run_visual_encoder(img),
            ImageSource::Path(path) => {
                let img = load_image(path)?;
                self.inner.run_visual_encoder(&img)
            }
            ImageSource::Region { path, rect } => {
                let img = load_image(path)?;
                let (width, height) = img.dimensions();
                let crop = crop_face(&img, &rect, width, height);
                self.inner.run_visual_encoder(&crop)
            }
            ImageSource::Base64(data) => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| CoreError::ImageDecode(format!("invalid base64: {e}")))?;
                let img = image::load_from_memory(&bytes)
                    .map_err(|e| CoreError::ImageDecode(e.to_string()))?;
                self.inner.run_visual_encoder(&img)
            }
        }
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        self.inner.run_text_encoder(text)
    }

    fn reset_models(&self) {
        for slot in [
            &self.inner.detector,
            &self.inner.descriptor,
            &self.inner.visual,
            &self.inner.text,
        ] {
            *lock_state(slot) = ModelState::Unloaded;
        }
        tracing::info!("model state reset");
    }
}

fn lock_state(slot: &Mutex<ModelState>) -> std::sync::MutexGuard<'_, ModelState> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn load_image(path: &Path) -> Result<DynamicImage, CoreError> {
    if !path.exists() {
        return Err(CoreError::FileNotFound(path.display().to_string()));
    }
    image::open(path).map_err(|e| CoreError::ImageDecode(e.to_string()))
}

impl ProviderInner {
    /// Run `f` against the loaded session, loading it first if needed.
    /// The lock is held across the load, so concurrent load requests
    /// coalesce into one; a failed load stays cached in the slot.
    fn with_session<T>(
        &self,
        slot: &Mutex<ModelState>,
        spec: &ModelSpec,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T, CoreError> {
        let mut state = lock_state(slot);

        if matches!(*state, ModelState::Unloaded) {
            match load_session(&self.models_dir, spec) {
                Ok(session) => *state = ModelState::Ready(session),
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(model = %spec.filename, error = %message, "model load failed");
                    *state = ModelState::Failed(message.clone());
                    return Err(CoreError::ModelLoadFailure(message));
                }
            }
        }

        match &mut *state {
            ModelState::Ready(session) => f(session).map_err(|e| CoreError::Inference(e.to_string())),
            ModelState::Failed(message) => Err(CoreError::ModelLoadFailure(message.clone())),
            ModelState::Unloaded => unreachable!("session loaded above"),
        }
    }

    fn detect_faces_blocking(&self, image_path: &Path) -> Result<Vec<RawDetection>, CoreError> {
        let img = load_image(image_path)?;
        let (orig_width, orig_height) = img.dimensions();

        let face_boxes = self.with_session(&self.detector, &DETECTOR_MODEL, |session| {
            run_detector(session, &img)
        })?;

        if face_boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut detections = Vec::new();
        for (bbox, confidence) in face_boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            // Descriptor model wants the face crop from the original image,
            // so the detector-space box is scaled up first
            let crop = crop_face(
                &img,
                &bbox.scaled(DETECTOR_INPUT_SIZE, orig_width, orig_height),
                orig_width,
                orig_height,
            );

            // A sticky load failure must surface; a per-face inference
            // hiccup only costs this face its descriptor
            let descriptor = match self.run_descriptor(&crop) {
                Ok(descriptor) => descriptor,
                Err(e @ CoreError::ModelLoadFailure(_)) => return Err(e),
                Err(_) => Vec::new(),
            };

            detections.push(RawDetection { bbox, confidence, descriptor });
        }

        Ok(detections)
    }

    fn run_descriptor(&self, face_img: &DynamicImage) -> Result<Vec<f32>, CoreError> {
        self.with_session(&self.descriptor, &DESCRIPTOR_MODEL, |session| {
            let input = image_to_tensor(face_img, DESCRIPTOR_INPUT_SIZE, |channel| {
                // MobileFaceNet normalization: (pixel - 127.5) / 127.5
                (channel - 127.5) / 127.5
            })?;

            let outputs = session.run(ort::inputs!["data" => input])?;
            let output = outputs
                .iter()
                .next()
                .ok_or_else(|| anyhow!("no descriptor output"))?;
            let (_shape, data) = output.1.try_extract_tensor::<f32>()?;
            Ok(l2_normalize(data.to_vec()))
        })
    }

    fn run_visual_encoder(&self, img: &DynamicImage) -> Result<Vec<f32>, CoreError> {
        self.with_session(&self.visual, &VISUAL_MODEL, |session| {
            // CLIP normalization constants (ImageNet stats)
            let mean = [0.48145466, 0.4578275, 0.40821073];
            let std = [0.26862954, 0.26130258, 0.27577711];

            let resized = img.resize_exact(CLIP_INPUT_SIZE, CLIP_INPUT_SIZE, image::imageops::FilterType::Triangle);
            let rgb = resized.to_rgb8();
            let size = CLIP_INPUT_SIZE as usize;
            let mut input_data = vec![0.0f32; 3 * size * size];

            for y in 0..size {
                for x in 0..size {
                    let pixel = rgb.get_pixel(x as u32, y as u32);
                    let idx = y * size + x;
                    for c in 0..3 {
                        input_data[c * size * size + idx] =
                            ((pixel[c] as f32 / 255.0) - mean[c]) / std[c];
                    }
                }
            }

            let input = Tensor::from_array(([1usize, 3, size, size], input_data.into_boxed_slice()))?;
            let outputs = session.run(ort::inputs!["pixel_values" => input])?;
            let output = outputs
                .iter()
                .next()
                .ok_or_else(|| anyhow!("no embedding output"))?;
            let (_shape, data) = output.1.try_extract_tensor::<f32>()?;
            Ok(l2_normalize(data.to_vec()))
        })
    }

    fn run_text_encoder(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        self.with_session(&self.text, &TEXT_MODEL, |session| {
            let tokens = simple_tokenize(text);

            // Pad/truncate to 77 tokens (CLIP's context length)
            let mut input_ids = vec![49406i64]; // Start token
            input_ids.extend(tokens.iter().take(75).cloned());
            input_ids.push(49407); // End token
            while input_ids.len() < 77 {
                input_ids.push(0);
            }

            let input = Tensor::from_array(([1usize, 77], input_ids.into_boxed_slice()))?;
            let outputs = session.run(ort::inputs!["input_ids" => input])?;
            let output = outputs
                .iter()
                .next()
                .ok_or_else(|| anyhow!("no embedding output"))?;
            let (_shape, data) = output.1.try_extract_tensor::<f32>()?;
            Ok(l2_normalize(data.to_vec()))
        })
    }
}

/// Download a model file if it doesn't exist
fn ensure_model(models_dir: &Path, spec: &ModelSpec) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let model_path = models_dir.join(spec.filename);

    if !model_path.exists() {
        tracing::info!(model = %spec.filename, "Downloading model...");
        let response = ureq::get(spec.url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        let mut file = std::fs::File::create(&model_path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        tracing::info!(model = %spec.filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

fn load_session(models_dir: &Path, spec: &ModelSpec) -> Result<Session> {
    let model_path = ensure_model(models_dir, spec)?;
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)?;
    Ok(session)
}

/// Run the face detector. Returned boxes are in detector space (416x416).
fn run_detector(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    let input = image_to_tensor(img, DETECTOR_INPUT_SIZE, |channel| (channel - 127.0) / 128.0)?;

    let outputs = session.run(ort::inputs!["input" => input])?;

    // Outputs: scores [1, num_anchors, 2] and boxes [1, num_anchors, 4]
    // with (x1, y1, x2, y2) normalized to [0, 1]
    let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("no scores output"))?;
    let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("no boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    let side = DETECTOR_INPUT_SIZE as f32;
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1]; // face class

        if confidence > DETECTION_CONFIDENCE_THRESHOLD {
            let x1 = (boxes_data[i * 4] * side) as i32;
            let y1 = (boxes_data[i * 4 + 1] * side) as i32;
            let x2 = (boxes_data[i * 4 + 2] * side) as i32;
            let y2 = (boxes_data[i * 4 + 3] * side) as i32;

            let bbox = BoundingBox {
                x: x1.max(0),
                y: y1.max(0),
                width: (x2 - x1).max(1),
                height: (y2 - y1).max(1),
            };

            face_boxes.push((bbox, confidence));
        }
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Resize + NCHW tensor fill with a per-channel normalization.
fn image_to_tensor(
    img: &DynamicImage,
    input_size: u32,
    normalize: impl Fn(f32) -> f32,
) -> Result<Tensor<f32>> {
    let resized = img.resize_exact(input_size, input_size, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();
    let size = input_size as usize;
    let mut input_data = vec![0.0f32; 3 * size * size];

    for y in 0..size {
        for x in 0..size {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            let idx = y * size + x;
            for c in 0..3 {
                input_data[c * size * size + idx] = normalize(pixel[c] as f32);
            }
        }
    }

    Ok(Tensor::from_array(([1usize, 3, size, size], input_data.into_boxed_slice()))?)
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(boxes[i].clone());

        for j in (i + 1)..boxes.len() {
            if suppressed[j] {
                continue;
            }

            if compute_iou(&boxes[i].0, &boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let area_a = (a.width * a.height) as f32;
    let area_b = (b.width * b.height) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region from image with padding
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    // Add 20% padding around the face
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = (bbox.x - padding_x).max(0) as u32;
    let y = (bbox.y - padding_y).max(0) as u32;
    let w = ((bbox.width + padding_x * 2) as u32).min(img_width.saturating_sub(x));
    let h = ((bbox.height + padding_y * 2) as u32).min(img_height.saturating_sub(y));

    img.crop_imm(x, y, w.max(1), h.max(1))
}

fn l2_normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter().map(|x| x / norm).collect()
    } else {
        vector
    }
}

/// Simple tokenization for common words (placeholder - real CLIP uses BPE)
fn simple_tokenize(text: &str) -> Vec<i64> {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .take(75)
        .map(|c| c as i64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        assert!((compute_iou(&a, &b) - 1.0).abs() < 0.001);

        let c = BoundingBox { x: 20, y: 20, width: 10, height: 10 };
        assert!((compute_iou(&a, &c) - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let boxes = vec![
            (BoundingBox { x: 0, y: 0, width: 10, height: 10 }, 0.9),
            (BoundingBox { x: 1, y: 1, width: 10, height: 10 }, 0.8),
            (BoundingBox { x: 100, y: 100, width: 10, height: 10 }, 0.7),
        ];
        let kept = nms(boxes, 0.3);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].1 - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(vec![3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
        // Zero vector passes through untouched
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let provider = OnnxProvider::new(&crate::config::EmbedConfig::default());
        let err = provider.detect_faces(Path::new("/nonexistent/photo.jpg")).unwrap_err();
        assert!(matches!(err, CoreError::FileNotFound(_)));
    }
}

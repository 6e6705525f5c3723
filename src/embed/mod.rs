//! Embedding provider contract.
//!
//! Two independent inference capabilities behind one trait: face-descriptor
//! extraction (fixed 128-dim vector per detected face) and joint image/text
//! embedding (fixed 512-dim vector). Implementations own their model-loaded
//! state; a failed load is sticky until `reset_models`.

pub mod onnx;

use std::path::Path;

use image::DynamicImage;

use crate::error::CoreError;
use crate::store::BoundingBox;

pub use onnx::OnnxProvider;

/// Identity descriptor dimensionality.
pub const FACE_VECTOR_DIM: usize = 128;
/// Joint image/text embedding dimensionality.
pub const SEMANTIC_VECTOR_DIM: usize = 512;
/// Fixed detector input resolution. Bounding boxes are reported in this
/// coordinate space.
pub const DETECTOR_INPUT_SIZE: u32 = 416;

/// One detected face: bounding box in detector space, detection confidence,
/// and the identity descriptor. An empty descriptor means descriptor
/// extraction failed for this face; the detection itself still stands.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub descriptor: Vec<f32>,
}

/// Input to `embed_image`: a decoded image, a file on disk, a pixel region
/// of a file, or base64-encoded bytes.
pub enum ImageSource<'a> {
    Image(&'a DynamicImage),
    Path(&'a Path),
    /// A rectangle of the image at `path`, in that image's pixel space.
    Region { path: &'a Path, rect: BoundingBox },
    Base64(&'a str),
}

pub trait EmbeddingProvider: Send + Sync {
    /// Detect faces in an image file. Bounded by a hard timeout; on timeout
    /// the call fails with `DetectionTimeout` and the image is skipped, not
    /// retried in-line.
    fn detect_faces(&self, image_path: &Path) -> Result<Vec<RawDetection>, CoreError>;

    /// Identity descriptor for a single face region. `bbox` is in detector
    /// space; the provider maps it onto the image.
    fn face_descriptor(&self, image_path: &Path, bbox: &BoundingBox) -> Result<Vec<f32>, CoreError>;

    /// 512-dim unit-length content embedding of an image.
    fn embed_image(&self, source: ImageSource<'_>) -> Result<Vec<f32>, CoreError>;

    /// 512-dim unit-length embedding of a text query.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, CoreError>;

    /// Clear cached model state, including a cached load failure.
    fn reset_models(&self);
}

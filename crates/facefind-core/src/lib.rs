//! facefind-core: face matching against a folder of reference images.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime for CPU inference.

use std::path::PathBuf;

pub mod alignment;
pub mod detector;
pub mod finder;
pub mod recognizer;
pub mod types;

pub use finder::{has_references, FindError, Matcher, OnnxMatcher};
pub use types::{identity_label, BoundingBox, Candidate, Embedding, FindOptions};

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Usual cosine-distance cut-off for ArcFace embeddings.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.68;

/// `./models` if present, else `$XDG_DATA_HOME/facefind/models`
/// (falling back to `~/.local/share/facefind/models`).
pub fn default_model_dir() -> PathBuf {
    let local = PathBuf::from("models");
    if local.is_dir() {
        return local;
    }

    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefind/models")
}

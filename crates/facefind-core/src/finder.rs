//! Reference-directory search: rank every image in a folder against a query.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Candidate, Embedding, FindOptions};
use crate::{DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};
use image::RgbImage;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// File extensions treated as reference images (compared case-insensitively).
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum FindError {
    #[error("reference directory not found: {0}")]
    ReferenceDirMissing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {message}")]
    Image { path: PathBuf, message: String },
    #[error("no face detected in {0} (detection is enforced)")]
    FaceNotDetected(PathBuf),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Finds the reference images closest to a query image.
pub trait Matcher {
    /// Rank the images under `reference_dir` against `query`.
    ///
    /// Returns candidates best first; an empty vector means no match.
    fn find(
        &mut self,
        query: &Path,
        reference_dir: &Path,
        options: &FindOptions,
    ) -> Result<Vec<Candidate>, FindError>;
}

struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl Models {
    fn load(model_dir: &Path) -> Result<Self, FindError> {
        Ok(Self {
            detector: FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?,
            recognizer: FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?,
        })
    }

    /// Embed the best face in `image`, or the whole image if none is found
    /// and detection is not enforced.
    fn represent(
        &mut self,
        image: &RgbImage,
        path: &Path,
        options: &FindOptions,
    ) -> Result<Embedding, FindError> {
        let faces = self.detector.detect(image)?;
        match faces.first() {
            Some(face) => Ok(self.recognizer.extract(image, Some(face))?),
            None if options.enforce_detection => Err(FindError::FaceNotDetected(path.to_path_buf())),
            None => {
                tracing::debug!(path = %path.display(), "no face detected, using whole image");
                Ok(self.recognizer.extract(image, None)?)
            }
        }
    }
}

struct CachedEmbedding {
    modified: Option<SystemTime>,
    embedding: Embedding,
}

/// [`Matcher`] backed by SCRFD detection and ArcFace embeddings.
///
/// Models are loaded on the first search. Reference embeddings are cached
/// per path and recomputed when the file's modification time changes.
pub struct OnnxMatcher {
    model_dir: PathBuf,
    models: Option<Models>,
    cache: HashMap<PathBuf, CachedEmbedding>,
}

impl OnnxMatcher {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            models: None,
            cache: HashMap::new(),
        }
    }

    fn search(
        models: &mut Models,
        cache: &mut HashMap<PathBuf, CachedEmbedding>,
        query: &Path,
        references: &[PathBuf],
        options: &FindOptions,
    ) -> Result<Vec<Candidate>, FindError> {
        let query_image = load_rgb(query)?;
        let probe = models.represent(&query_image, query, options)?;

        let mut gallery: Vec<(PathBuf, Embedding)> = Vec::with_capacity(references.len());
        for path in references {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            if let Some(hit) = cache.get(path).filter(|c| c.modified == modified) {
                gallery.push((path.clone(), hit.embedding.clone()));
                continue;
            }

            let embedding = match load_rgb(path).and_then(|img| models.represent(&img, path, options)) {
                Ok(embedding) => embedding,
                Err(e @ (FindError::Image { .. } | FindError::FaceNotDetected(_))) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping reference image");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if options.silent {
                tracing::debug!(path = %path.display(), "represented reference image");
            } else {
                tracing::info!(path = %path.display(), "represented reference image");
            }

            cache.insert(
                path.clone(),
                CachedEmbedding {
                    modified,
                    embedding: embedding.clone(),
                },
            );
            gallery.push((path.clone(), embedding));
        }

        Ok(rank_candidates(&probe, &gallery, options.distance_threshold))
    }
}

impl Matcher for OnnxMatcher {
    fn find(
        &mut self,
        query: &Path,
        reference_dir: &Path,
        options: &FindOptions,
    ) -> Result<Vec<Candidate>, FindError> {
        if !reference_dir.is_dir() {
            return Err(FindError::ReferenceDirMissing(reference_dir.to_path_buf()));
        }

        let references = list_reference_images(reference_dir)?;
        let live: HashSet<&PathBuf> = references.iter().collect();
        self.cache.retain(|path, _| live.contains(path));

        if references.is_empty() {
            tracing::debug!(dir = %reference_dir.display(), "no reference images");
            return Ok(Vec::new());
        }

        let mut models = match self.models.take() {
            Some(models) => models,
            None => Models::load(&self.model_dir)?,
        };
        let result = Self::search(&mut models, &mut self.cache, query, &references, options);
        self.models = Some(models);

        let candidates = result?;
        tracing::debug!(
            references = references.len(),
            candidates = candidates.len(),
            "search finished"
        );
        Ok(candidates)
    }
}

/// Distance of each gallery entry to the probe, filtered by `threshold` and
/// sorted ascending (ties broken by path).
pub fn rank_candidates(probe: &Embedding, gallery: &[(PathBuf, Embedding)], threshold: f32) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = gallery
        .iter()
        .map(|(path, embedding)| Candidate {
            identity: path.clone(),
            distance: probe.cosine_distance(embedding),
        })
        .filter(|c| c.distance <= threshold)
        .collect();

    candidates.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    candidates
}

/// All image files under `dir` (recursively), sorted by path.
pub fn list_reference_images(dir: &Path) -> Result<Vec<PathBuf>, FindError> {
    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|source| FindError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| FindError::Io {
                    path: current.clone(),
                    source,
                })?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if is_image_file(&path) {
                images.push(path);
            }
        }
    }

    images.sort();
    Ok(images)
}

/// True if `dir` exists and has at least one entry of any kind.
pub fn has_references(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

fn load_rgb(path: &Path) -> Result<RgbImage, FindError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| FindError::Image {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

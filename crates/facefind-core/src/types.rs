use std::path::{Path, PathBuf};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// One reference image ranked against a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Path of the reference image; its file stem is the identity.
    pub identity: PathBuf,
    /// Dissimilarity reported by the matcher. Lower = more similar.
    pub distance: f32,
}

impl Candidate {
    /// Identity label: reference file name without directory or extension.
    pub fn label(&self) -> String {
        identity_label(&self.identity)
    }

    /// `1 - distance`, unclamped: distances above 1 give negative values.
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Strip directory and extension from a reference path.
pub fn identity_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Options passed to [`Matcher::find`](crate::Matcher::find).
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Fail when no face is detected instead of using the whole image.
    pub enforce_detection: bool,
    /// Keep per-file progress out of the `info` log.
    pub silent: bool,
    /// Drop candidates with a larger distance.
    pub distance_threshold: f32,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            enforce_detection: true,
            silent: false,
            distance_threshold: crate::DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec() }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.cosine_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_candidate_label_strips_dir_and_extension() {
        let c = Candidate {
            identity: PathBuf::from("./db/alice.jpg"),
            distance: 0.2,
        };
        assert_eq!(c.label(), "alice");
    }

    #[test]
    fn test_label_keeps_inner_dots() {
        assert_eq!(identity_label(Path::new("db/j.r.r.tolkien.png")), "j.r.r.tolkien");
        assert_eq!(identity_label(Path::new("bob")), "bob");
    }

    #[test]
    fn test_similarity_is_one_minus_distance() {
        let c = Candidate {
            identity: PathBuf::from("db/alice.jpg"),
            distance: 0.2,
        };
        assert_eq!(c.similarity(), 1.0 - 0.2f32);
        assert_eq!(format!("{:.2}", c.similarity()), "0.80");
    }

    #[test]
    fn test_similarity_not_clamped() {
        let c = Candidate {
            identity: PathBuf::from("db/bob.png"),
            distance: 1.25,
        };
        assert!((c.similarity() + 0.25).abs() < 1e-6);
    }
}

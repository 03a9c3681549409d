use facefind_core::FindOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CAMERA_INDICES: [u32; 3] = [0, 1, 2];
/// Longest index list tried before giving up on finding a camera.
const MAX_CAMERA_INDICES: usize = 3;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 indices tried in order (default: 0,1,2; at most three).
    pub camera_indices: Vec<u32>,
    /// Reference image directory (default: db).
    pub db_dir: PathBuf,
    /// Directory the temporary capture is written to (default: working directory).
    pub capture_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Largest cosine distance still reported as a candidate.
    pub distance_threshold: f32,
    /// Frame read attempts per loop iteration.
    pub frame_read_attempts: usize,
    /// Pause between failed frame reads.
    pub frame_retry_delay: Duration,
    /// How long the captured frame stays on screen.
    pub capture_preview: Duration,
    /// How long the matched reference image stays on screen.
    pub match_preview: Duration,
}

impl Config {
    /// Load configuration from `FACEFIND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let camera_indices = get("FACEFIND_CAMERA_INDICES")
            .and_then(|v| parse_indices(&v))
            .unwrap_or_else(|| DEFAULT_CAMERA_INDICES.to_vec());

        let model_dir = get("FACEFIND_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facefind_core::default_model_dir);

        Self {
            camera_indices,
            db_dir: get("FACEFIND_DB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("db")),
            capture_dir: get("FACEFIND_CAPTURE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            model_dir,
            distance_threshold: parse_or(
                get("FACEFIND_DISTANCE_THRESHOLD"),
                facefind_core::DEFAULT_DISTANCE_THRESHOLD,
            ),
            frame_read_attempts: parse_or(get("FACEFIND_FRAME_READ_ATTEMPTS"), 3),
            frame_retry_delay: millis(get("FACEFIND_FRAME_RETRY_DELAY_MS"), 100),
            capture_preview: millis(get("FACEFIND_CAPTURE_PREVIEW_MS"), 1000),
            match_preview: millis(get("FACEFIND_MATCH_PREVIEW_MS"), 3000),
        }
    }

    /// Matcher options for an interactive capture: a frame without a clean
    /// face is still matched as a whole image, and per-file logging stays quiet.
    pub fn find_options(&self) -> FindOptions {
        FindOptions {
            enforce_detection: false,
            silent: true,
            distance_threshold: self.distance_threshold,
        }
    }
}

/// Parse "0,1, 2" into indices. `None` if any entry is invalid or the list is empty.
/// Entries past the first three are dropped.
fn parse_indices(value: &str) -> Option<Vec<u32>> {
    let mut indices = value
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<Vec<u32>>>()?;
    if indices.len() > MAX_CAMERA_INDICES {
        tracing::warn!(
            given = indices.len(),
            max = MAX_CAMERA_INDICES,
            "too many camera indices, ignoring the rest"
        );
        indices.truncate(MAX_CAMERA_INDICES);
    }
    (!indices.is_empty()).then_some(indices)
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn millis(value: Option<String>, default: u64) -> Duration {
    Duration::from_millis(parse_or(value, default))
}

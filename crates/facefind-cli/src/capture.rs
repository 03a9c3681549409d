//! Temporary JPEG file holding the frame being matched.

use chrono::{DateTime, Local};
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error("{0} was not created")]
    Missing(PathBuf),
}

/// A captured frame on disk. The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct TempCapture {
    path: PathBuf,
}

impl TempCapture {
    /// `temp_capture_<YYYYmmdd_HHMMSS>.jpg`
    pub fn file_name(now: DateTime<Local>) -> String {
        format!("temp_capture_{}.jpg", now.format("%Y%m%d_%H%M%S"))
    }

    /// Write `image` as JPEG into `dir` and check the file exists afterwards.
    pub fn save(image: &RgbImage, dir: &Path, now: DateTime<Local>) -> Result<Self, CaptureError> {
        Self::save_with(dir, now, |path| image.save_with_format(path, ImageFormat::Jpeg))
    }

    fn save_with<F>(dir: &Path, now: DateTime<Local>, write: F) -> Result<Self, CaptureError>
    where
        F: FnOnce(&Path) -> image::ImageResult<()>,
    {
        // Owned before writing so a partial file is removed on failure too.
        let capture = Self {
            path: dir.join(Self::file_name(now)),
        };

        write(&capture.path).map_err(|e| CaptureError::Write {
            path: capture.path.clone(),
            message: e.to_string(),
        })?;

        if !capture.path.exists() {
            return Err(CaptureError::Missing(capture.path.clone()));
        }

        tracing::debug!(path = %capture.path.display(), "capture saved");
        Ok(capture)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bare file name when written to the working directory, full path otherwise.
    pub fn display_name(&self) -> String {
        match (self.path.parent(), self.path.file_name()) {
            (Some(parent), Some(name)) if parent == Path::new(".") || parent.as_os_str().is_empty() => {
                name.to_string_lossy().into_owned()
            }
            _ => self.path.display().to_string(),
        }
    }
}

impl Drop for TempCapture {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "capture removed"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove capture")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::Rgb;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(
            TempCapture::file_name(fixed_time()),
            "temp_capture_20240309_070501.jpg"
        );
    }

    #[test]
    fn test_save_then_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_pixel(16, 16, Rgb([200, 10, 10]));

        let capture = TempCapture::save(&image, dir.path(), fixed_time()).unwrap();
        let path = capture.path().to_path_buf();
        assert!(path.exists());
        assert!(image::open(&path).is_ok());

        drop(capture);
        assert!(!path.exists());
    }

    #[test]
    fn test_save_into_missing_dir_fails_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let image = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));

        let result = TempCapture::save(&image, &missing, fixed_time());
        assert!(matches!(result, Err(CaptureError::Write { .. })));
        assert!(!missing.exists());
    }

    #[test]
    fn test_failed_write_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = TempCapture::save_with(dir.path(), fixed_time(), |path| {
            std::fs::write(path, b"\xFF\xD8 truncated")?;
            Err(std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full").into())
        });

        assert!(matches!(result, Err(CaptureError::Write { .. })));
        assert!(!dir.path().join(TempCapture::file_name(fixed_time())).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_without_file_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = TempCapture::save_with(dir.path(), fixed_time(), |_| Ok(()));
        match result {
            Err(CaptureError::Missing(path)) => {
                assert_eq!(path, dir.path().join("temp_capture_20240309_070501.jpg"))
            }
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_display_name() {
        let image = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let dir = tempfile::tempdir().unwrap();
        let capture = TempCapture::save(&image, dir.path(), fixed_time()).unwrap();
        assert_eq!(
            capture.display_name(),
            dir.path().join("temp_capture_20240309_070501.jpg").display().to_string()
        );

        let here = TempCapture {
            path: Path::new(".").join("temp_capture_20240309_070501.jpg"),
        };
        assert_eq!(here.display_name(), "temp_capture_20240309_070501.jpg");
        // Nothing on disk; dropping must not touch the working directory.
        std::mem::forget(here);
    }

    #[test]
    fn test_drop_tolerates_already_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let capture = TempCapture::save(&image, dir.path(), fixed_time()).unwrap();
        std::fs::remove_file(capture.path()).unwrap();
        drop(capture);
    }
}

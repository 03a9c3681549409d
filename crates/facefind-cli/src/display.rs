//! On-screen windows and keyboard polling.

use image::RgbImage;
use opencv::core::{Mat, Scalar, CV_8UC3};
use opencv::highgui;
use opencv::prelude::*;
use std::time::Duration;
use thiserror::Error;

/// Live preview window; the title carries the key instructions.
pub const PREVIEW_WINDOW: &str = "Face Recognition (c: capture, q: quit)";
pub const CAPTURE_WINDOW: &str = "Captured Image";

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display backend: {0}")]
    Backend(String),
}

impl From<opencv::Error> for DisplayError {
    fn from(e: opencv::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Keys the capture loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Capture,
    Quit,
    Other,
}

impl Key {
    /// Interpret a raw key code. Negative codes mean no key was pressed;
    /// only the low byte is significant.
    pub fn from_code(code: i32) -> Option<Key> {
        if code < 0 {
            return None;
        }
        Some(match (code & 0xFF) as u8 {
            b'c' => Key::Capture,
            b'q' => Key::Quit,
            _ => Key::Other,
        })
    }
}

/// A set of named windows plus the keyboard.
pub trait Surface {
    /// Show `image` in `window`, creating the window if needed.
    fn show(&mut self, window: &str, image: &RgbImage) -> Result<(), DisplayError>;
    /// Pump window events for up to `timeout` and return the key pressed, if any.
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<Key>, DisplayError>;
    fn close(&mut self, window: &str) -> Result<(), DisplayError>;
    fn close_all(&mut self) -> Result<(), DisplayError>;
}

/// OpenCV HighGUI windows. All windows are destroyed on drop.
#[derive(Default)]
pub struct HighguiSurface;

impl HighguiSurface {
    pub fn new() -> Self {
        Self
    }
}

impl Surface for HighguiSurface {
    fn show(&mut self, window: &str, image: &RgbImage) -> Result<(), DisplayError> {
        highgui::named_window(window, highgui::WINDOW_AUTOSIZE)?;
        let mat = to_bgr_mat(image)?;
        highgui::imshow(window, &mat)?;
        Ok(())
    }

    fn poll_key(&mut self, timeout: Duration) -> Result<Option<Key>, DisplayError> {
        // wait_key(0) blocks forever; clamp to at least 1 ms.
        let ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
        Ok(Key::from_code(highgui::wait_key(ms)?))
    }

    fn close(&mut self, window: &str) -> Result<(), DisplayError> {
        highgui::destroy_window(window)?;
        Ok(())
    }

    fn close_all(&mut self) -> Result<(), DisplayError> {
        highgui::destroy_all_windows()?;
        Ok(())
    }
}

impl Drop for HighguiSurface {
    fn drop(&mut self) {
        if let Err(e) = highgui::destroy_all_windows() {
            tracing::warn!(error = %e, "failed to close windows");
        }
    }
}

/// Copy an RGB image into a BGR `Mat` (OpenCV channel order).
fn to_bgr_mat(image: &RgbImage) -> opencv::Result<Mat> {
    let (w, h) = image.dimensions();
    let mut mat = Mat::new_rows_cols_with_default(h as i32, w as i32, CV_8UC3, Scalar::all(0.0))?;
    let dst = mat.data_bytes_mut()?;
    for (d, s) in dst.chunks_exact_mut(3).zip(image.as_raw().chunks_exact(3)) {
        d[0] = s[2];
        d[1] = s[1];
        d[2] = s[0];
    }
    Ok(mat)
}

//! facefind-hw: camera capture for the facefind preview loop.
//!
//! Opens V4L2 devices by index, streams frames and converts them to RGB.

pub mod camera;
pub mod frame;

pub use camera::{open_first, read_frame_with_retry, Camera, CameraError, FrameSource, PixelFormat};
pub use frame::Frame;

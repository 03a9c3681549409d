//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Longest wait for a buffer before a read counts as failed.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame read interrupted")]
    Interrupted,
    #[error("no camera could be opened (tried indices {tried:?})")]
    NoDeviceOpened { tried: Vec<u32> },
}

/// Anything that yields colour frames one at a time.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

/// V4L2 camera device handle with a running mmap stream.
///
/// Dropping the camera stops streaming and closes the device node.
pub struct Camera {
    stream: MmapStream<'static>,
    // Declared after `stream` so the stream is torn down first.
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open the camera at `/dev/video<index>`.
    pub fn open_index(index: u32) -> Result<Self, CameraError> {
        Self::open(&format!("/dev/video{index}"))
    }

    /// Open a V4L2 camera device by path and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::debug!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "queried camera capabilities"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; webcams that only stream compressed frames negotiate MJPG.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = pixel_format_for(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, or GREY)"
            ))
        })?;

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
        // Without a timeout a stalled device blocks the dequeue forever.
        stream.set_timeout(DEQUEUE_TIMEOUT);

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "opened camera"
        );

        Ok(Self {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Convert a raw buffer to RGB based on the negotiated format.
    fn decode(&self, buf: &[u8], sequence: u32) -> Result<Frame, CameraError> {
        let (data, width, height) = match self.pixel_format {
            PixelFormat::Yuyv => {
                let rgb = frame::yuyv_to_rgb(buf, self.width, self.height).map_err(|e| {
                    CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))
                })?;
                (rgb, self.width, self.height)
            }
            PixelFormat::Grey => {
                let rgb = frame::grey_to_rgb(buf, self.width, self.height).map_err(|e| {
                    CameraError::CaptureFailed(format!("GREY conversion failed: {e}"))
                })?;
                (rgb, self.width, self.height)
            }
            PixelFormat::Mjpg => {
                let img = frame::mjpeg_to_rgb(buf)
                    .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
                let (w, h) = img.dimensions();
                (img.into_raw(), w, h)
            }
        };

        Ok(Frame {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        // `buf` borrows the stream; decode copies it out before the next dequeue.
        let buf = buf.to_vec();
        self.decode(&buf, sequence)
    }
}

fn pixel_format_for(fourcc: FourCC) -> Option<PixelFormat> {
    if fourcc == FourCC::new(b"YUYV") {
        Some(PixelFormat::Yuyv)
    } else if fourcc == FourCC::new(b"MJPG") {
        Some(PixelFormat::Mjpg)
    } else if fourcc == FourCC::new(b"GREY") {
        Some(PixelFormat::Grey)
    } else {
        None
    }
}

/// Try each index in order and return the first source that opens.
///
/// The index list is the whole search: there is no rescan or retry.
pub fn open_first<S, F>(indices: &[u32], mut open: F) -> Result<(u32, S), CameraError>
where
    F: FnMut(u32) -> Result<S, CameraError>,
{
    for &index in indices {
        match open(index) {
            Ok(source) => {
                tracing::info!(index, "camera opened");
                return Ok((index, source));
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "camera index unavailable");
            }
        }
    }

    Err(CameraError::NoDeviceOpened {
        tried: indices.to_vec(),
    })
}

/// Read one frame, retrying up to `attempts` times with `delay` in between.
///
/// Returns the last error if every attempt fails, or `Interrupted` as soon
/// as `stop` is set before an attempt.
pub fn read_frame_with_retry<S: FrameSource + ?Sized>(
    source: &mut S,
    attempts: usize,
    delay: Duration,
    stop: &AtomicBool,
) -> Result<Frame, CameraError> {
    let attempts = attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if stop.load(Ordering::SeqCst) {
            return Err(CameraError::Interrupted);
        }
        match source.read_frame() {
            Ok(frame) => return Ok(frame),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "frame read failed");
                last_err = Some(e);
                if attempt < attempts && !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CameraError::CaptureFailed("no read attempted".into())))
}

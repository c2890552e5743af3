//! Frame source backends.
//!
//! A source produces upright-or-annotated RGB frames for the capture
//! session. Backends are selected by the source string scheme:
//! - `/dev/videoN` (or any plain path): local V4L2 device, feature-gated
//!   behind `camera-v4l2`
//! - `http(s)://`: network camera delivering JPEG snapshots or an MJPEG
//!   stream
//! - `stub://`: synthetic source, always compiled, used by the test suite
//!
//! The source layer is responsible for:
//! - Negotiating the requested resolution with the device
//! - Reporting constraint failures distinctly from permission/not-found
//! - Surfacing an unexpected end of stream as a disconnect
//!
//! The source layer MUST NOT:
//! - Store frames to disk
//! - Retain frames beyond handoff to the capture session

use url::Url;

use crate::camera::Rotation;
use crate::error::CameraError;

#[cfg(feature = "camera-v4l2")]
use crate::camera::device::DeviceSource;
use crate::camera::http::HttpSource;

/// One decoded frame as delivered by a backend.
///
/// `rotation` is the correction needed to render the frame upright; sources
/// that deliver upright pixels report `Rotation::Deg0`.
#[derive(Debug)]
pub(crate) struct SourceFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

/// Resolution request passed down to a backend.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolutionRequest {
    pub width: u32,
    pub height: u32,
    /// Exact requests fail with `ConstraintUnsatisfiable` when the device
    /// cannot deliver them; relaxed requests accept whatever the device has.
    pub exact: bool,
}

pub(crate) enum SourceBackend {
    Synthetic(SyntheticSource),
    Http(HttpSource),
    #[cfg(feature = "camera-v4l2")]
    Device(DeviceSource),
}

impl std::fmt::Debug for SourceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceBackend::Synthetic(_) => f.write_str("Synthetic"),
            SourceBackend::Http(_) => f.write_str("Http"),
            #[cfg(feature = "camera-v4l2")]
            SourceBackend::Device(_) => f.write_str("Device"),
        }
    }
}

impl SourceBackend {
    /// Open a backend for `source` and connect it with the given request.
    pub(crate) fn open(source: &str, request: ResolutionRequest) -> Result<Self, CameraError> {
        if source.starts_with("stub://") {
            let mut synthetic = SyntheticSource::new(source, request)?;
            synthetic.connect()?;
            return Ok(SourceBackend::Synthetic(synthetic));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            let mut http = HttpSource::new(source, request)?;
            http.connect()?;
            return Ok(SourceBackend::Http(http));
        }
        #[cfg(feature = "camera-v4l2")]
        {
            let mut device = DeviceSource::new(source, request)?;
            device.connect()?;
            Ok(SourceBackend::Device(device))
        }
        #[cfg(not(feature = "camera-v4l2"))]
        {
            Err(CameraError::DeviceNotFound(format!(
                "'{}' looks like a device path, but this build has no camera-v4l2 support",
                source
            )))
        }
    }

    pub(crate) fn next_frame(&mut self) -> Result<SourceFrame, CameraError> {
        match self {
            SourceBackend::Synthetic(source) => source.next_frame(),
            SourceBackend::Http(source) => source.next_frame(),
            #[cfg(feature = "camera-v4l2")]
            SourceBackend::Device(source) => source.next_frame(),
        }
    }

    /// Negotiated stream resolution, known once connected.
    pub(crate) fn dimensions(&self) -> (u32, u32) {
        match self {
            SourceBackend::Synthetic(source) => source.dimensions(),
            SourceBackend::Http(source) => source.dimensions(),
            #[cfg(feature = "camera-v4l2")]
            SourceBackend::Device(source) => source.dimensions(),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            SourceBackend::Synthetic(source) => source.describe(),
            SourceBackend::Http(source) => source.describe(),
            #[cfg(feature = "camera-v4l2")]
            SourceBackend::Device(source) => source.describe(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

/// Synthetic frame source.
///
/// Failure injection is steered by query parameters on the stub URL:
/// - `deny=permission` / `deny=notfound` / `deny=constraint`: fail
///   acquisition with the corresponding error
/// - `max_width=N`: exact requests wider than N fail with
///   `ConstraintUnsatisfiable`; relaxed requests are clamped to N
/// - `frames=N`: the stream ends after N frames (disconnect path)
/// - `rotation=90|180|270`: frames are delivered rotated and must be
///   corrected by the consumer
pub(crate) struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    rotation: Rotation,
    frames_remaining: Option<u64>,
    frame_count: u64,
    deny: Option<String>,
}

const SYNTHETIC_DEFAULT_WIDTH: u32 = 640;
const SYNTHETIC_DEFAULT_HEIGHT: u32 = 480;

impl SyntheticSource {
    pub(crate) fn new(source: &str, request: ResolutionRequest) -> Result<Self, CameraError> {
        let url = Url::parse(source)
            .map_err(|e| CameraError::DeviceNotFound(format!("invalid stub url: {}", e)))?;

        let mut max_width: Option<u32> = None;
        let mut frames_remaining: Option<u64> = None;
        let mut rotation = Rotation::Deg0;
        let mut deny: Option<String> = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "max_width" => max_width = value.parse().ok(),
                "frames" => frames_remaining = value.parse().ok(),
                "rotation" => {
                    rotation = value
                        .parse::<u32>()
                        .ok()
                        .and_then(Rotation::from_degrees)
                        .unwrap_or(Rotation::Deg0)
                }
                "deny" => deny = Some(value.to_string()),
                _ => {}
            }
        }

        let (mut width, mut height) = if request.width > 0 && request.height > 0 {
            (request.width, request.height)
        } else {
            (SYNTHETIC_DEFAULT_WIDTH, SYNTHETIC_DEFAULT_HEIGHT)
        };
        if let Some(max) = max_width {
            if width > max {
                if request.exact {
                    return Err(CameraError::ConstraintUnsatisfiable(format!(
                        "{} cannot deliver {}x{} (max width {})",
                        source, width, height, max
                    )));
                }
                // Relaxed request: clamp, preserving the aspect ratio.
                height = ((height as u64 * max as u64) / width as u64) as u32;
                width = max;
            }
        }

        Ok(Self {
            name: url.host_str().unwrap_or("camera").to_string(),
            width,
            height,
            rotation,
            frames_remaining,
            frame_count: 0,
            deny,
        })
    }

    fn connect(&mut self) -> Result<(), CameraError> {
        match self.deny.as_deref() {
            Some("permission") => {
                return Err(CameraError::PermissionDenied(format!(
                    "stub://{} denies access",
                    self.name
                )))
            }
            Some("notfound") => {
                return Err(CameraError::DeviceNotFound(format!(
                    "stub://{} reports no device",
                    self.name
                )))
            }
            Some("constraint") => {
                return Err(CameraError::ConstraintUnsatisfiable(format!(
                    "stub://{} rejects every constraint set",
                    self.name
                )))
            }
            _ => {}
        }
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{})",
            self.name,
            self.width,
            self.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<SourceFrame, CameraError> {
        if let Some(remaining) = self.frames_remaining.as_mut() {
            if *remaining == 0 {
                return Err(CameraError::StreamDisconnected(format!(
                    "stub://{} stream ended",
                    self.name
                )));
            }
            *remaining -= 1;
        }
        self.frame_count += 1;
        Ok(SourceFrame {
            pixels: self.generate_synthetic_pixels(),
            width: self.width,
            height: self.height,
            rotation: self.rotation,
        })
    }

    /// Generate synthetic RGB pixel data. A simple position/frame mix so
    /// consecutive frames differ.
    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(width: u32, height: u32) -> ResolutionRequest {
        ResolutionRequest {
            width,
            height,
            exact: true,
        }
    }

    #[test]
    fn synthetic_honors_requested_resolution() {
        let backend = SourceBackend::open("stub://meal", exact(1280, 720)).unwrap();
        assert_eq!(backend.dimensions(), (1280, 720));
    }

    #[test]
    fn exact_request_over_max_width_is_unsatisfiable() {
        let err = SourceBackend::open("stub://meal?max_width=640", exact(1280, 720)).unwrap_err();
        assert!(matches!(err, CameraError::ConstraintUnsatisfiable(_)));
    }

    #[test]
    fn relaxed_request_is_clamped() {
        let request = ResolutionRequest {
            width: 1280,
            height: 720,
            exact: false,
        };
        let backend = SourceBackend::open("stub://meal?max_width=640", request).unwrap();
        assert_eq!(backend.dimensions(), (640, 360));
    }

    #[test]
    fn stream_ends_after_frame_limit() {
        let mut backend = SourceBackend::open("stub://meal?frames=2", exact(320, 240)).unwrap();
        assert!(backend.next_frame().is_ok());
        assert!(backend.next_frame().is_ok());
        let err = backend.next_frame().unwrap_err();
        assert!(matches!(err, CameraError::StreamDisconnected(_)));
    }

    #[test]
    fn denied_stub_reports_permission() {
        let err = SourceBackend::open("stub://meal?deny=permission", exact(320, 240)).unwrap_err();
        assert!(matches!(err, CameraError::PermissionDenied(_)));
    }
}

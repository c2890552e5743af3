//! Camera capture session.
//!
//! This module owns the device-camera lifecycle:
//! - `acquire`: permission/constraint negotiation with a single relaxed
//!   fallback when the preferred constraints cannot be satisfied
//! - `bind_preview`: reads the first frame so stream metadata (resolution)
//!   is known before capture is allowed
//! - `capture`: renders the current frame into a bounded still image
//!   (scale down only, aspect preserved) and encodes it
//! - `release`: idempotent teardown, also run on drop
//!
//! The session holds at most one live `CameraHandle`; acquiring again
//! releases the previous handle first. There are no module-level globals.

pub(crate) mod source;

#[cfg(feature = "camera-v4l2")]
mod device;
mod http;

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbImage;
use url::Url;

use crate::config::CameraSettings;
use crate::error::CameraError;
use source::{ResolutionRequest, SourceBackend, SourceFrame};

/// Display/orientation rotation in 90-degree steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

/// Output encoding for captured frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CaptureFormat {
    #[default]
    Jpeg,
    Png,
}

impl CaptureFormat {
    pub fn mime(self) -> &'static str {
        match self {
            CaptureFormat::Jpeg => "image/jpeg",
            CaptureFormat::Png => "image/png",
        }
    }
}

/// An immutable still image taken from the live stream.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    bytes: Vec<u8>,
    mime: &'static str,
    width: u32,
    height: u32,
}

impl CapturedFrame {
    /// Wrap already-encoded image bytes, e.g. a file loaded from disk.
    pub fn from_encoded(bytes: Vec<u8>, mime: &'static str, width: u32, height: u32) -> Self {
        CapturedFrame {
            bytes,
            mime,
            width,
            height,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Encode as a `data:<mime>;base64,...` URL, the wire form the proxy
    /// endpoint accepts.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

/// Opaque handle to a live video stream. Owned exclusively by the session.
pub struct CameraHandle {
    backend: SourceBackend,
    relaxed_fallback: bool,
    live: bool,
    ready: bool,
    preview: Option<SourceFrame>,
}

impl CameraHandle {
    fn dimensions(&self) -> (u32, u32) {
        self.backend.dimensions()
    }
}

/// Owns the camera lifecycle for one user session.
pub struct CaptureSession {
    settings: CameraSettings,
    handle: Option<CameraHandle>,
}

impl CaptureSession {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            handle: None,
        }
    }

    /// Acquire a camera with the configured constraints.
    ///
    /// The preferred (exact) constraints are tried first; if the device
    /// reports them unsatisfiable, a single relaxed "any video source"
    /// request follows before the failure is surfaced. Permission and
    /// missing-device failures are surfaced immediately, without fallback.
    pub fn acquire(&mut self) -> Result<(), CameraError> {
        check_secure_context(&self.settings.source)?;

        // Only one handle may be live at a time.
        self.release();

        let preferred = ResolutionRequest {
            width: self.settings.width,
            height: self.settings.height,
            exact: true,
        };
        let (backend, relaxed_fallback) =
            match SourceBackend::open(&self.settings.source, preferred) {
                Ok(backend) => (backend, false),
                Err(CameraError::ConstraintUnsatisfiable(reason)) => {
                    log::warn!(
                        "preferred camera constraints unsatisfiable ({}), retrying relaxed",
                        reason
                    );
                    let relaxed = ResolutionRequest {
                        width: 0,
                        height: 0,
                        exact: false,
                    };
                    (SourceBackend::open(&self.settings.source, relaxed)?, true)
                }
                Err(err) => return Err(err),
            };

        log::info!(
            "camera acquired: {} ({}x{}{})",
            backend.describe(),
            backend.dimensions().0,
            backend.dimensions().1,
            if relaxed_fallback { ", relaxed" } else { "" }
        );
        self.handle = Some(CameraHandle {
            backend,
            relaxed_fallback,
            live: true,
            ready: false,
            preview: None,
        });
        Ok(())
    }

    /// Bind the live stream to the preview surface.
    ///
    /// Reads the first frame so the stream's metadata (dimensions) is
    /// known; until this succeeds the handle is not capture-ready.
    pub fn bind_preview(&mut self) -> Result<(), CameraError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| CameraError::DeviceNotFound("no camera acquired".to_string()))?;
        let frame = match handle.backend.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                if matches!(err, CameraError::StreamDisconnected(_)) {
                    handle.live = false;
                }
                return Err(err);
            }
        };
        handle.preview = Some(frame);
        handle.ready = true;
        Ok(())
    }

    /// Preview dimensions as they should be displayed, with the configured
    /// display rotation applied. Orientation correction happens here, at
    /// the display layer; the stored bytes of a captured frame are only
    /// rotated when the source delivers non-upright frames.
    pub fn preview_dimensions(&self) -> Option<(u32, u32)> {
        let handle = self.handle.as_ref()?;
        let frame = handle.preview.as_ref()?;
        let (mut w, mut h) = (frame.width, frame.height);
        if frame.rotation.swaps_dimensions() {
            std::mem::swap(&mut w, &mut h);
        }
        let rotation = Rotation::from_degrees(self.settings.rotation).unwrap_or(Rotation::Deg0);
        Some(if rotation.swaps_dimensions() {
            (h, w)
        } else {
            (w, h)
        })
    }

    /// Capture a still frame.
    ///
    /// `bounds` limits the output size: the frame is scaled down (never up)
    /// to fit, preserving the source aspect ratio. Without bounds the
    /// native stream resolution is kept.
    pub fn capture(
        &mut self,
        bounds: Option<(u32, u32)>,
        format: CaptureFormat,
    ) -> Result<CapturedFrame, CameraError> {
        let quality = self.settings.jpeg_quality;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| CameraError::DeviceNotFound("no camera acquired".to_string()))?;
        if !handle.live {
            return Err(CameraError::StreamDisconnected(
                "camera handle is no longer live".to_string(),
            ));
        }
        if !handle.ready {
            return Err(CameraError::PreviewNotReady);
        }

        let frame = match handle.backend.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                if matches!(err, CameraError::StreamDisconnected(_)) {
                    handle.live = false;
                }
                return Err(err);
            }
        };

        let mut image = rgb_image(frame.pixels, frame.width, frame.height)?;
        // Bake rotation into the bytes only when the source delivers
        // non-upright frames; display rotation stays a preview concern.
        image = match frame.rotation {
            Rotation::Deg0 => image,
            Rotation::Deg90 => image::imageops::rotate90(&image),
            Rotation::Deg180 => image::imageops::rotate180(&image),
            Rotation::Deg270 => image::imageops::rotate270(&image),
        };

        let (target_w, target_h) = match bounds {
            Some(bounds) => fit_within((image.width(), image.height()), bounds),
            None => (image.width(), image.height()),
        };
        if (target_w, target_h) != (image.width(), image.height()) {
            image = image::imageops::resize(
                &image,
                target_w,
                target_h,
                image::imageops::FilterType::Triangle,
            );
        }

        let bytes = encode_image(&image, format, quality)?;
        Ok(CapturedFrame {
            bytes,
            mime: format.mime(),
            width: target_w,
            height: target_h,
        })
    }

    /// Release the camera. Idempotent: stops the underlying source and
    /// clears the preview association; a second call is a no-op.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::info!("camera released: {}", handle.backend.describe());
        }
    }

    pub fn is_live(&self) -> bool {
        self.handle.as_ref().map(|h| h.live).unwrap_or(false)
    }

    pub fn is_ready(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.live && h.ready)
            .unwrap_or(false)
    }

    /// Whether the live handle came from the relaxed fallback request.
    pub fn used_relaxed_fallback(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.relaxed_fallback)
            .unwrap_or(false)
    }

    pub fn stream_dimensions(&self) -> Option<(u32, u32)> {
        self.handle.as_ref().map(|h| h.dimensions())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        // Page-teardown analog: never leave tracks running.
        self.release();
    }
}

/// Secure-context gate: a plaintext http camera target is only allowed on
/// loopback, mirroring the browser requirement that camera access needs a
/// secure origin (with the localhost exemption).
fn check_secure_context(source: &str) -> Result<(), CameraError> {
    if !source.starts_with("http://") {
        return Ok(());
    }
    let url = Url::parse(source)
        .map_err(|e| CameraError::DeviceNotFound(format!("invalid camera url: {}", e)))?;
    let host = url.host_str().unwrap_or("");
    let loopback = host == "localhost"
        || host == "::1"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
    if loopback {
        Ok(())
    } else {
        Err(CameraError::InsecureContext(format!(
            "plaintext camera source '{}' on a non-loopback host",
            source
        )))
    }
}

/// Fit `native` into `bounds` preserving aspect ratio, scaling down only.
fn fit_within(native: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (nw, nh) = native;
    let (bw, bh) = bounds;
    if bw == 0 || bh == 0 || (nw <= bw && nh <= bh) {
        return (nw, nh);
    }
    let scale = (bw as f64 / nw as f64).min(bh as f64 / nh as f64);
    let w = ((nw as f64 * scale).round() as u32).max(1);
    let h = ((nh as f64 * scale).round() as u32).max(1);
    (w, h)
}

fn rgb_image(pixels: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, CameraError> {
    RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
        CameraError::Encode(format!("frame buffer does not match {}x{}", width, height))
    })
}

fn encode_image(
    image: &RgbImage,
    format: CaptureFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, CameraError> {
    let mut bytes = Vec::new();
    match format {
        CaptureFormat::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                Cursor::new(&mut bytes),
                jpeg_quality,
            );
            image
                .write_with_encoder(encoder)
                .map_err(|e| CameraError::Encode(e.to_string()))?;
        }
        CaptureFormat::Png => {
            image
                .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
                .map_err(|e| CameraError::Encode(e.to_string()))?;
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(source: &str, width: u32, height: u32) -> CameraSettings {
        CameraSettings {
            source: source.to_string(),
            width,
            height,
            jpeg_quality: 80,
            rotation: 0,
        }
    }

    #[test]
    fn acquire_satisfies_preferred_constraints() {
        let mut session = CaptureSession::new(settings("stub://meal", 1280, 720));
        session.acquire().unwrap();
        assert!(session.is_live());
        assert!(!session.used_relaxed_fallback());
        assert_eq!(session.stream_dimensions(), Some((1280, 720)));
    }

    #[test]
    fn acquire_falls_back_once_when_constraints_unsatisfiable() {
        let mut session = CaptureSession::new(settings("stub://meal?max_width=640", 1280, 720));
        session.acquire().unwrap();
        assert!(session.used_relaxed_fallback());
        // Relaxed request takes whatever the source has.
        assert_eq!(session.stream_dimensions(), Some((640, 480)));
    }

    #[test]
    fn acquire_fails_when_relaxed_request_also_fails() {
        let mut session = CaptureSession::new(settings("stub://meal?deny=constraint", 1280, 720));
        let err = session.acquire().unwrap_err();
        assert!(matches!(err, CameraError::ConstraintUnsatisfiable(_)));
        assert!(!session.is_live());
    }

    #[test]
    fn permission_denial_skips_fallback() {
        let mut session = CaptureSession::new(settings("stub://meal?deny=permission", 1280, 720));
        let err = session.acquire().unwrap_err();
        assert!(matches!(err, CameraError::PermissionDenied(_)));
    }

    #[test]
    fn plaintext_remote_camera_is_insecure_context() {
        let mut session = CaptureSession::new(settings("http://203.0.113.9/stream", 1280, 720));
        let err = session.acquire().unwrap_err();
        assert!(matches!(err, CameraError::InsecureContext(_)));
    }

    #[test]
    fn capture_without_acquire_reports_no_device() {
        let mut session = CaptureSession::new(settings("stub://meal", 640, 480));
        let err = session.capture(None, CaptureFormat::Jpeg).unwrap_err();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn capture_before_preview_bind_is_rejected() {
        let mut session = CaptureSession::new(settings("stub://meal", 640, 480));
        session.acquire().unwrap();
        let err = session
            .capture(None, CaptureFormat::Jpeg)
            .unwrap_err();
        assert!(matches!(err, CameraError::PreviewNotReady));
    }

    #[test]
    fn capture_with_bounds_never_upscales() {
        let mut session = CaptureSession::new(settings("stub://meal", 1920, 1080));
        session.acquire().unwrap();
        session.bind_preview().unwrap();
        let frame = session
            .capture(Some((400, 400)), CaptureFormat::Jpeg)
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (400, 225));
        assert_eq!(frame.mime(), "image/jpeg");
    }

    #[test]
    fn small_frame_is_not_upscaled_to_bounds() {
        let mut session = CaptureSession::new(settings("stub://meal", 320, 240));
        session.acquire().unwrap();
        session.bind_preview().unwrap();
        let frame = session
            .capture(Some((1000, 1000)), CaptureFormat::Png)
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (320, 240));
        assert_eq!(frame.mime(), "image/png");
    }

    #[test]
    fn release_is_idempotent() {
        let mut session = CaptureSession::new(settings("stub://meal", 640, 480));
        session.acquire().unwrap();
        session.release();
        session.release();
        assert!(!session.is_live());
        assert!(session.capture(None, CaptureFormat::Jpeg).is_err());
    }

    #[test]
    fn disconnect_surfaces_and_marks_handle_dead() {
        // One frame for preview binding, then the stream ends.
        let mut session = CaptureSession::new(settings("stub://meal?frames=1", 640, 480));
        session.acquire().unwrap();
        session.bind_preview().unwrap();
        let err = session.capture(None, CaptureFormat::Jpeg).unwrap_err();
        assert!(matches!(err, CameraError::StreamDisconnected(_)));
        assert!(!session.is_live());
        // Re-acquisition is offered rather than going dark.
        session.acquire().unwrap();
        assert!(session.is_live());
    }

    #[test]
    fn rotated_source_frames_are_baked_upright() {
        let mut session = CaptureSession::new(settings("stub://meal?rotation=90", 320, 240));
        session.acquire().unwrap();
        session.bind_preview().unwrap();
        let frame = session.capture(None, CaptureFormat::Jpeg).unwrap();
        assert_eq!((frame.width(), frame.height()), (240, 320));
    }

    #[test]
    fn display_rotation_only_affects_preview_dimensions() {
        let mut cfg = settings("stub://meal", 640, 480);
        cfg.rotation = 90;
        let mut session = CaptureSession::new(cfg);
        session.acquire().unwrap();
        session.bind_preview().unwrap();
        assert_eq!(session.preview_dimensions(), Some((480, 640)));
        let frame = session.capture(None, CaptureFormat::Jpeg).unwrap();
        assert_eq!((frame.width(), frame.height()), (640, 480));
    }

    #[test]
    fn fit_within_preserves_aspect() {
        assert_eq!(fit_within((1920, 1080), (400, 400)), (400, 225));
        assert_eq!(fit_within((1080, 1920), (400, 400)), (225, 400));
        assert_eq!(fit_within((200, 100), (400, 400)), (200, 100));
    }

    #[test]
    fn data_url_declares_mime() {
        let frame = CapturedFrame {
            bytes: vec![1, 2, 3],
            mime: "image/jpeg",
            width: 1,
            height: 1,
        };
        assert!(frame.data_url().starts_with("data:image/jpeg;base64,"));
    }
}

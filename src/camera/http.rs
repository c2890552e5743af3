//! HTTP camera source.
//!
//! Ingests frames from network cameras that serve either single JPEG
//! snapshots or an MJPEG multipart stream. The transport mode is detected
//! from the Content-Type of the initial response.
//!
//! Resolution is not negotiable over plain HTTP: the camera delivers what
//! it delivers. An exact resolution request that does not match the
//! delivered frames fails with `ConstraintUnsatisfiable`; a relaxed request
//! accepts the delivered size.

use std::io::Read;

use crate::camera::source::{ResolutionRequest, SourceFrame};
use crate::camera::Rotation;
use crate::error::CameraError;

const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

pub(crate) struct HttpSource {
    url: String,
    request: ResolutionRequest,
    stream: Option<HttpStream>,
    width: u32,
    height: u32,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub(crate) fn new(url: &str, request: ResolutionRequest) -> Result<Self, CameraError> {
        Ok(Self {
            url: url.to_string(),
            request,
            stream: None,
            width: 0,
            height: 0,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<(), CameraError> {
        let response = ureq::get(&self.url).call().map_err(map_http_error)?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            // Drain the probe response; snapshots are re-fetched per frame.
            let mut probe = Vec::new();
            response
                .into_reader()
                .take(MAX_JPEG_BYTES as u64)
                .read_to_end(&mut probe)
                .map_err(|e| CameraError::StreamDisconnected(e.to_string()))?;
            self.stream = Some(HttpStream::SingleJpeg);
        }

        // Pull one frame to learn the delivered resolution (stream metadata).
        let first = self.read_frame()?;
        if self.request.exact
            && self.request.width > 0
            && (first.width, first.height) != (self.request.width, self.request.height)
        {
            self.stream = None;
            return Err(CameraError::ConstraintUnsatisfiable(format!(
                "{} delivers {}x{}, exact request was {}x{}",
                self.url, first.width, first.height, self.request.width, self.request.height
            )));
        }
        self.width = first.width;
        self.height = first.height;
        log::info!(
            "HttpSource: connected to {} ({}x{})",
            self.url,
            self.width,
            self.height
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<SourceFrame, CameraError> {
        self.read_frame()
    }

    fn read_frame(&mut self) -> Result<SourceFrame, CameraError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::StreamDisconnected("http source not connected".into()))?;
        let jpeg_bytes = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.url)?,
        };
        let (pixels, width, height) = decode_jpeg(&jpeg_bytes)?;
        Ok(SourceFrame {
            pixels,
            width,
            height,
            rotation: Rotation::Deg0,
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn describe(&self) -> String {
        self.url.clone()
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync + 'static>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync + 'static>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, CameraError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| CameraError::StreamDisconnected(e.to_string()))?;
            if read == 0 {
                return Err(CameraError::StreamDisconnected(
                    "mjpeg stream ended".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>, CameraError> {
    let response = ureq::get(url).call().map_err(map_http_error)?;
    let mut bytes = Vec::new();
    // Read one byte past the cap so an over-limit snapshot is detectable
    // instead of surfacing later as a truncated-decode failure.
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| CameraError::StreamDisconnected(e.to_string()))?;
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(CameraError::Encode(format!(
            "jpeg snapshot from {} exceeds the {} byte limit",
            url, MAX_JPEG_BYTES
        )));
    }
    if bytes.is_empty() {
        return Err(CameraError::StreamDisconnected(format!(
            "empty jpeg snapshot from {}",
            url
        )));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), CameraError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| CameraError::Encode(format!("decode jpeg frame: {}", e)))?;
    let width = image.width();
    let height = image.height();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut start = None;
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == 0xFF && buffer[i + 1] == 0xD8 {
            start = Some(i);
            break;
        }
        i += 1;
    }
    let start = start?;
    let mut j = start + 2;
    while j + 1 < buffer.len() {
        if buffer[j] == 0xFF && buffer[j + 1] == 0xD9 {
            return Some((start, j + 2));
        }
        j += 1;
    }
    None
}

fn map_http_error(err: ureq::Error) -> CameraError {
    match err {
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            CameraError::PermissionDenied("camera endpoint refused access".to_string())
        }
        ureq::Error::Status(404, _) => {
            CameraError::DeviceNotFound("camera endpoint not found".to_string())
        }
        ureq::Error::Status(status, _) => {
            CameraError::StreamDisconnected(format!("camera endpoint returned HTTP {}", status))
        }
        ureq::Error::Transport(t) => CameraError::DeviceNotFound(t.to_string()),
    }
}

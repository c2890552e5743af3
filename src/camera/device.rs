//! Local V4L2 device source (feature `camera-v4l2`).
//!
//! Talks to a local device node (e.g. /dev/video0) through libv4l. The
//! requested resolution is offered to the driver; under an exact request a
//! driver that negotiates a different format fails acquisition with
//! `ConstraintUnsatisfiable`, under a relaxed request the negotiated format
//! is accepted.

use ouroboros::self_referencing;

use crate::camera::source::{ResolutionRequest, SourceFrame};
use crate::camera::Rotation;
use crate::error::CameraError;

pub(crate) struct DeviceSource {
    path: String,
    request: ResolutionRequest,
    state: Option<DeviceState>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl DeviceSource {
    pub(crate) fn new(path: &str, request: ResolutionRequest) -> Result<Self, CameraError> {
        Ok(Self {
            path: path.to_string(),
            request,
            state: None,
            active_width: request.width,
            active_height: request.height,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<(), CameraError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.path).map_err(|err| open_error(&self.path, err))?;

        let mut format = device
            .format()
            .map_err(|err| CameraError::StreamDisconnected(format!("read v4l2 format: {}", err)))?;
        if self.request.width > 0 && self.request.height > 0 {
            format.width = self.request.width;
            format.height = self.request.height;
        }
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("DeviceSource: failed to set format on {}: {}", self.path, err);
                device.format().map_err(|err| {
                    CameraError::StreamDisconnected(format!(
                        "read v4l2 format after set failure: {}",
                        err
                    ))
                })?
            }
        };

        if self.request.exact
            && self.request.width > 0
            && (format.width, format.height) != (self.request.width, self.request.height)
        {
            return Err(CameraError::ConstraintUnsatisfiable(format!(
                "{} negotiated {}x{}, exact request was {}x{}",
                self.path, format.width, format.height, self.request.width, self.request.height
            )));
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4).map_err(
                    |err| CameraError::StreamDisconnected(format!("create v4l2 stream: {}", err)),
                )
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "DeviceSource: connected to {} ({}x{})",
            self.path,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<SourceFrame, CameraError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CameraError::StreamDisconnected("v4l2 device not connected".into()))?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| CameraError::StreamDisconnected(format!("capture v4l2 frame: {}", err)))?;

        Ok(SourceFrame {
            pixels,
            width: self.active_width,
            height: self.active_height,
            rotation: Rotation::Deg0,
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.active_width, self.active_height)
    }

    pub(crate) fn describe(&self) -> String {
        self.path.clone()
    }
}

fn open_error(path: &str, err: std::io::Error) -> CameraError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            CameraError::PermissionDenied(format!("open {}: {}", path, err))
        }
        _ => CameraError::DeviceNotFound(format!("open {}: {}", path, err)),
    }
}

//! Error taxonomy for the capture/inference pipeline.
//!
//! Camera errors are user-facing and recoverable by retry; none of them is
//! fatal to the process. Inference errors distinguish HTTP-level upstream
//! failures from structurally malformed upstream bodies.

use thiserror::Error;

/// Camera-lifecycle errors.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera access requires a secure transport (https or loopback): {0}")]
    InsecureContext(String),

    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("no camera device found: {0}")]
    DeviceNotFound(String),

    #[error("camera constraints unsatisfiable: {0}")]
    ConstraintUnsatisfiable(String),

    #[error("camera stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("preview not ready: stream metadata has not been read yet")]
    PreviewNotReady,

    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Errors from the two-stage inference call.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Non-success HTTP status from the upstream (or the proxy relaying it).
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The upstream body was 2xx but the expected structural path
    /// (non-empty candidates with textual content) is missing.
    #[error("unexpected upstream response shape: {0}")]
    UpstreamShape(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("analysis cancelled")]
    Cancelled,
}

impl From<ureq::Error> for InferenceError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "<unreadable body>".to_string());
                InferenceError::Upstream { status, message }
            }
            ureq::Error::Transport(t) => InferenceError::Transport(t.to_string()),
        }
    }
}

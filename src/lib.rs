//! Calorie camera.
//!
//! Captures a meal photo from a device camera, sends it through a
//! credential-holding proxy to a generative-vision API, and presents an
//! estimated per-dish calorie breakdown with a narrated explanation.
//!
//! # Architecture
//!
//! - `camera`: capture session — acquisition with constraint fallback,
//!   preview binding, bounded still capture, idempotent release
//! - `inference`: the two-stage client (vision, then narration) with
//!   lenient-then-strict response parsing
//! - `presenter`: the linear UI state machine
//!   (`Idle → Captured → Analyzing → Result`, retry back to `Idle`)
//! - `proxy` + `upstream`: the stateless relay that attaches the
//!   server-held credential; the client side never sees the key
//! - `config` / `error`: ambient configuration and the error taxonomy

pub mod camera;
pub mod config;
pub mod error;
pub mod inference;
pub mod presenter;
pub mod proxy;
pub mod upstream;

pub use camera::{CaptureFormat, CapturedFrame, CaptureSession, Rotation};
pub use config::{CalcamConfig, CameraSettings, ProxySettings};
pub use error::{CameraError, InferenceError};
pub use inference::{
    AnalysisBackend, AnalysisResult, CancelToken, DishItem, InferenceClient, NarrativeExplanation,
};
pub use presenter::{Presenter, PresenterError, PresenterState, ResultView};
pub use proxy::{ProxyHandle, ProxyServer};

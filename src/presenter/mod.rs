//! Result presenter.
//!
//! A strictly linear state machine over the user-facing flow:
//! `Idle → Captured → Analyzing → Result`, with a retry edge back to
//! `Idle` from any state. The machine is independent of any rendered UI;
//! transitions are named methods and the display model is produced by
//! `render()`, so the logic is testable without a page.
//!
//! Failure handling never leaves the controls dead: an analysis failure
//! returns to `Captured` (the frame is retained for re-analysis) with a
//! user-visible message, and camera failures stay in `Idle` with a retry
//! affordance.

use thiserror::Error;

use crate::camera::{CaptureFormat, CapturedFrame, CaptureSession};
use crate::error::{CameraError, InferenceError};
use crate::inference::{AnalysisBackend, AnalysisResult, CancelToken, NarrativeExplanation};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenterState {
    Idle,
    Captured,
    Analyzing,
    Result,
}

#[derive(Debug, Error)]
pub enum PresenterError {
    #[error("action '{action}' is not valid in state {state:?}")]
    InvalidState {
        action: &'static str,
        state: PresenterState,
    },

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Completed analysis: the structured breakdown plus its narrative.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub analysis: AnalysisResult,
    pub narrative: NarrativeExplanation,
}

/// Display model for the `Result` state.
#[derive(Debug, Clone)]
pub struct ResultView {
    pub rows: Vec<(String, u32)>,
    pub total_calories: u32,
    pub reported_total: Option<u32>,
    pub cooking_method: Option<String>,
    pub narrative: String,
}

pub struct Presenter {
    session: CaptureSession,
    backend: Box<dyn AnalysisBackend>,
    cancel: CancelToken,
    state: PresenterState,
    frame: Option<CapturedFrame>,
    outcome: Option<AnalysisOutcome>,
    message: Option<String>,
    capture_bounds: Option<(u32, u32)>,
    capture_format: CaptureFormat,
}

impl Presenter {
    pub fn new(session: CaptureSession, backend: Box<dyn AnalysisBackend>) -> Self {
        Self {
            session,
            backend,
            cancel: CancelToken::new(),
            state: PresenterState::Idle,
            frame: None,
            outcome: None,
            message: None,
            capture_bounds: None,
            capture_format: CaptureFormat::default(),
        }
    }

    pub fn with_capture_bounds(mut self, bounds: Option<(u32, u32)>) -> Self {
        self.capture_bounds = bounds;
        self
    }

    pub fn with_capture_format(mut self, format: CaptureFormat) -> Self {
        self.capture_format = format;
        self
    }

    /// Acquire the camera and bind the preview. Camera failures are
    /// surfaced with a user-visible message and leave the presenter in
    /// `Idle`, ready for retry.
    pub fn prepare_camera(&mut self) -> Result<(), PresenterError> {
        if let Err(err) = self.session.acquire().and_then(|_| self.session.bind_preview()) {
            self.message = Some(err.to_string());
            return Err(err.into());
        }
        self.message = None;
        Ok(())
    }

    /// `Idle --capture--> Captured`: take a still frame; its preview
    /// replaces the live feed. The frame is available via
    /// `captured_frame()`.
    pub fn capture(&mut self) -> Result<(), PresenterError> {
        if self.state != PresenterState::Idle {
            return Err(PresenterError::InvalidState {
                action: "capture",
                state: self.state,
            });
        }
        match self.session.capture(self.capture_bounds, self.capture_format) {
            Ok(frame) => {
                self.frame = Some(frame);
                self.state = PresenterState::Captured;
                self.message = None;
                Ok(())
            }
            Err(err) => {
                self.message = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    /// `Captured --analyze--> Analyzing --> Result` on success.
    ///
    /// The call is synchronous, so `Analyzing` is transitional within it;
    /// the loading indicator (`status_text`) is emitted on the log while
    /// the stages run.
    ///
    /// On failure the presenter returns to `Captured` with the frame
    /// retained, so the user can re-analyze without re-shooting.
    pub fn analyze(&mut self) -> Result<(), PresenterError> {
        let Some(frame) = self.frame.as_ref() else {
            return Err(PresenterError::InvalidState {
                action: "analyze",
                state: self.state,
            });
        };
        if self.state != PresenterState::Captured {
            return Err(PresenterError::InvalidState {
                action: "analyze",
                state: self.state,
            });
        }
        self.state = PresenterState::Analyzing;
        if let Some(status) = self.status_text() {
            log::info!("{}", status);
        }

        let staged = match self.backend.analyze_image(frame, &self.cancel) {
            Ok(analysis) => match self.backend.explain(&analysis, &self.cancel) {
                Ok(narrative) => Ok(AnalysisOutcome {
                    analysis,
                    narrative,
                }),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match staged {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                self.state = PresenterState::Result;
                self.message = None;
                Ok(())
            }
            Err(err) => {
                self.state = PresenterState::Captured;
                self.message = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Retry edge: back to `Idle` from any state. Releases the captured
    /// frame, clears rendered output, cancels an in-flight analysis and
    /// re-acquires the camera.
    pub fn retry(&mut self) -> Result<(), PresenterError> {
        self.cancel.cancel();
        self.frame = None;
        self.outcome = None;
        self.message = None;
        self.state = PresenterState::Idle;
        self.session.release();
        self.cancel.reset();
        self.prepare_camera()
    }

    pub fn state(&self) -> PresenterState {
        self.state
    }

    /// Loading-indicator text while an analysis is in flight.
    pub fn status_text(&self) -> Option<&'static str> {
        match self.state {
            PresenterState::Analyzing => Some("分析中..."),
            _ => None,
        }
    }

    /// User-visible message from the last failure, if any.
    pub fn user_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn captured_frame(&self) -> Option<&CapturedFrame> {
        self.frame.as_ref()
    }

    pub fn outcome(&self) -> Option<&AnalysisOutcome> {
        self.outcome.as_ref()
    }

    pub fn camera(&self) -> &CaptureSession {
        &self.session
    }

    /// Display model; only available in the `Result` state.
    pub fn render(&self) -> Option<ResultView> {
        if self.state != PresenterState::Result {
            return None;
        }
        let outcome = self.outcome.as_ref()?;
        Some(ResultView {
            rows: outcome
                .analysis
                .items
                .iter()
                .map(|item| (item.name.clone(), item.calories))
                .collect(),
            total_calories: outcome.analysis.total_calories,
            reported_total: outcome.analysis.reported_total,
            cooking_method: outcome.analysis.cooking_method.clone(),
            narrative: outcome.narrative.text.clone(),
        })
    }
}

impl ResultView {
    /// Plain-text table rendering for the CLI.
    pub fn to_table(&self) -> String {
        let mut out = String::new();
        out.push_str("Meal Analysis\n");
        out.push_str("=============\n");
        for (name, calories) in &self.rows {
            out.push_str(&format!("{:<24} {:>6} kcal\n", name, calories));
        }
        out.push_str("-------------------------------\n");
        out.push_str(&format!("{:<24} {:>6} kcal\n", "Total", self.total_calories));
        if let Some(reported) = self.reported_total {
            out.push_str(&format!("(model reported {} kcal)\n", reported));
        }
        if let Some(method) = &self.cooking_method {
            out.push_str(&format!("Cooking method: {}\n", method));
        }
        out.push_str("\n");
        out.push_str(&self.narrative);
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraSettings;
    use crate::error::InferenceError;
    use crate::inference::DishItem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted backend: counts stage calls and fails on demand.
    struct ScriptedBackend {
        fail_stage_one: bool,
        analyze_calls: Arc<AtomicUsize>,
        explain_calls: Arc<AtomicUsize>,
    }

    impl ScriptedBackend {
        fn new(fail_stage_one: bool) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let analyze_calls = Arc::new(AtomicUsize::new(0));
            let explain_calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    fail_stage_one,
                    analyze_calls: analyze_calls.clone(),
                    explain_calls: explain_calls.clone(),
                },
                analyze_calls,
                explain_calls,
            )
        }
    }

    impl AnalysisBackend for ScriptedBackend {
        fn analyze_image(
            &self,
            _frame: &CapturedFrame,
            _cancel: &CancelToken,
        ) -> Result<AnalysisResult, InferenceError> {
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_stage_one {
                return Err(InferenceError::Upstream {
                    status: 503,
                    message: "vision stage unavailable".to_string(),
                });
            }
            Ok(AnalysisResult::from_items(
                vec![
                    DishItem {
                        name: "rice".to_string(),
                        calories: 200,
                    },
                    DishItem {
                        name: "miso soup".to_string(),
                        calories: 80,
                    },
                ],
                None,
                Some("煮る".to_string()),
            ))
        }

        fn explain(
            &self,
            result: &AnalysisResult,
            _cancel: &CancelToken,
        ) -> Result<NarrativeExplanation, InferenceError> {
            self.explain_calls.fetch_add(1, Ordering::SeqCst);
            Ok(NarrativeExplanation {
                text: format!("合計{}kcalの食事です。", result.total_calories),
            })
        }
    }

    fn stub_session() -> CaptureSession {
        CaptureSession::new(CameraSettings {
            source: "stub://table".to_string(),
            width: 640,
            height: 480,
            jpeg_quality: 80,
            rotation: 0,
        })
    }

    fn ready_presenter(fail_stage_one: bool) -> (Presenter, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (backend, analyze_calls, explain_calls) = ScriptedBackend::new(fail_stage_one);
        let mut presenter = Presenter::new(stub_session(), Box::new(backend));
        presenter.prepare_camera().unwrap();
        (presenter, analyze_calls, explain_calls)
    }

    #[test]
    fn full_flow_renders_itemized_rows_and_total() {
        let (mut presenter, _, _) = ready_presenter(false);
        presenter.capture().unwrap();
        assert_eq!(presenter.state(), PresenterState::Captured);

        presenter.analyze().unwrap();
        assert_eq!(presenter.state(), PresenterState::Result);

        let view = presenter.render().unwrap();
        assert_eq!(view.rows.len(), 2);
        assert_eq!(view.rows[0], ("rice".to_string(), 200));
        assert_eq!(view.rows[1], ("miso soup".to_string(), 80));
        assert_eq!(view.total_calories, 280);

        let table = view.to_table();
        assert!(table.contains("rice"));
        assert!(table.contains("280 kcal"));
    }

    #[test]
    fn stage_two_is_never_called_when_stage_one_fails() {
        let (mut presenter, analyze_calls, explain_calls) = ready_presenter(true);
        presenter.capture().unwrap();
        let err = presenter.analyze().unwrap_err();
        assert!(matches!(
            err,
            PresenterError::Inference(InferenceError::Upstream { status: 503, .. })
        ));
        assert_eq!(analyze_calls.load(Ordering::SeqCst), 1);
        assert_eq!(explain_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn analysis_failure_returns_to_captured_with_message() {
        let (mut presenter, _, _) = ready_presenter(true);
        presenter.capture().unwrap();
        let _ = presenter.analyze();
        assert_eq!(presenter.state(), PresenterState::Captured);
        assert!(presenter.captured_frame().is_some());
        assert!(presenter.user_message().unwrap().contains("503"));
        // Controls are not dead: re-analysis is a valid action again.
        let _ = presenter.analyze();
    }

    #[test]
    fn status_text_absent_outside_analysis() {
        let (mut presenter, _, _) = ready_presenter(false);
        assert_eq!(presenter.status_text(), None);
        presenter.capture().unwrap();
        assert_eq!(presenter.status_text(), None);
        presenter.analyze().unwrap();
        assert_eq!(presenter.status_text(), None);
    }

    #[test]
    fn capture_requires_idle_state() {
        let (mut presenter, _, _) = ready_presenter(false);
        presenter.capture().unwrap();
        let err = presenter.capture().unwrap_err();
        assert!(matches!(err, PresenterError::InvalidState { .. }));
    }

    #[test]
    fn analyze_requires_captured_state() {
        let (mut presenter, _, _) = ready_presenter(false);
        let err = presenter.analyze().unwrap_err();
        assert!(matches!(
            err,
            PresenterError::InvalidState {
                action: "analyze",
                ..
            }
        ));
    }

    #[test]
    fn retry_from_result_returns_to_idle_with_fresh_camera() {
        let (mut presenter, _, _) = ready_presenter(false);
        presenter.capture().unwrap();
        presenter.analyze().unwrap();
        assert_eq!(presenter.state(), PresenterState::Result);

        presenter.retry().unwrap();
        assert_eq!(presenter.state(), PresenterState::Idle);
        assert!(presenter.captured_frame().is_none());
        assert!(presenter.render().is_none());
        assert!(presenter.camera().is_ready());

        // The machine is immediately usable again.
        presenter.capture().unwrap();
        assert_eq!(presenter.state(), PresenterState::Captured);
    }

    #[test]
    fn camera_failure_surfaces_message_and_stays_retryable() {
        let (backend, _, _) = ScriptedBackend::new(false);
        let mut presenter = Presenter::new(
            CaptureSession::new(CameraSettings {
                source: "stub://table?deny=permission".to_string(),
                width: 640,
                height: 480,
                jpeg_quality: 80,
                rotation: 0,
            }),
            Box::new(backend),
        );
        let err = presenter.prepare_camera().unwrap_err();
        assert!(matches!(
            err,
            PresenterError::Camera(CameraError::PermissionDenied(_))
        ));
        assert_eq!(presenter.state(), PresenterState::Idle);
        assert!(presenter.user_message().is_some());
    }
}

//! Two-stage inference client.
//!
//! Stage one (vision) interprets the captured image into a structured meal
//! breakdown; stage two (generation) narrates that breakdown. The stages
//! are strictly sequential: stage two is only issued after stage one has
//! succeeded.
//!
//! The client carries no upstream credential. Both stages go through the
//! proxy endpoint, which attaches the key server-side.
//!
//! Response parsing is lenient-then-strict: the structural path
//! (non-empty candidates with textual content) is validated first, then
//! the embedded JSON is parsed. The two failure modes are distinct error
//! kinds (`UpstreamShape` vs the HTTP-level `Upstream`).

pub mod prompts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::camera::CapturedFrame;
use crate::error::InferenceError;

/// One dish with its estimated calories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DishItem {
    pub name: String,
    pub calories: u32,
}

/// Structured decomposition of a meal.
///
/// `total_calories` is always recomputed as the sum of the itemized
/// calories. When the model reports its own total and it diverges from
/// the sum, the reported value is retained in `reported_total` and logged,
/// never silently reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub items: Vec<DishItem>,
    pub total_calories: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooking_method: Option<String>,
}

impl AnalysisResult {
    pub fn from_items(
        items: Vec<DishItem>,
        reported_total: Option<u32>,
        cooking_method: Option<String>,
    ) -> Self {
        let total_calories: u32 = items.iter().map(|item| item.calories).sum();
        let reported_total = match reported_total {
            Some(reported) if reported != total_calories => {
                log::warn!(
                    "model-reported total {} kcal diverges from itemized sum {} kcal",
                    reported,
                    total_calories
                );
                Some(reported)
            }
            _ => None,
        };
        Self {
            items,
            total_calories,
            reported_total,
            cooking_method,
        }
    }
}

/// Free-form prose describing an `AnalysisResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeExplanation {
    pub text: String,
}

/// Cooperative cancellation for an in-flight analysis.
///
/// Checked before each stage; a retry issued between the two calls aborts
/// the analysis instead of wasting the second call.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Seam between the presenter and the network: the real client talks to
/// the proxy endpoint, tests script the stages.
pub trait AnalysisBackend {
    fn analyze_image(
        &self,
        frame: &CapturedFrame,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, InferenceError>;

    fn explain(
        &self,
        result: &AnalysisResult,
        cancel: &CancelToken,
    ) -> Result<NarrativeExplanation, InferenceError>;
}

pub struct InferenceClient {
    proxy_url: String,
    agent: ureq::Agent,
}

impl InferenceClient {
    pub fn new(proxy_url: &str) -> Self {
        Self {
            proxy_url: proxy_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(60))
                .build(),
        }
    }

    /// Stage one: send the frame to the proxy's `/analyze` relay and parse
    /// the vision response into an `AnalysisResult`.
    pub fn analyze_image(
        &self,
        frame: &CapturedFrame,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        log::info!(
            "analyzing captured frame ({} bytes, {})",
            frame.bytes().len(),
            frame.mime()
        );
        let response = self
            .agent
            .post(&format!("{}/analyze", self.proxy_url))
            .send_json(serde_json::json!({ "image": frame.data_url() }))?;
        let body: Value = response
            .into_json()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        parse_vision_response(&body)
    }

    /// Stage two: narrate a successful stage-one result through the
    /// proxy's `/explain` relay. Must only be called once stage one has
    /// produced an `AnalysisResult`.
    pub fn explain(
        &self,
        result: &AnalysisResult,
        cancel: &CancelToken,
    ) -> Result<NarrativeExplanation, InferenceError> {
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        let response = self
            .agent
            .post(&format!("{}/explain", self.proxy_url))
            .send_json(serde_json::json!({ "result": result }))?;
        let body: Value = response
            .into_json()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        let text = candidate_text(&body)?;
        Ok(NarrativeExplanation {
            text: text.to_string(),
        })
    }
}

impl AnalysisBackend for InferenceClient {
    fn analyze_image(
        &self,
        frame: &CapturedFrame,
        cancel: &CancelToken,
    ) -> Result<AnalysisResult, InferenceError> {
        InferenceClient::analyze_image(self, frame, cancel)
    }

    fn explain(
        &self,
        result: &AnalysisResult,
        cancel: &CancelToken,
    ) -> Result<NarrativeExplanation, InferenceError> {
        InferenceClient::explain(self, result, cancel)
    }
}

/// Shape-check an upstream body and extract the first candidate's text.
///
/// This is the lenient first pass: it only validates that the expected
/// structural path exists.
fn candidate_text(body: &Value) -> Result<&str, InferenceError> {
    let candidates = body
        .get("candidates")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| InferenceError::UpstreamShape("no candidates in response".to_string()))?;
    let parts = candidates[0]
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            InferenceError::UpstreamShape("candidate has no content parts".to_string())
        })?;
    parts
        .iter()
        .find_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| InferenceError::UpstreamShape("candidate has no textual part".to_string()))
}

/// Parse a vision-stage upstream body into an `AnalysisResult`.
///
/// Both delivered shapes are supported: a textual part whose text embeds a
/// JSON object (possibly fenced), and a part that is already structured
/// content carrying the object directly.
pub fn parse_vision_response(body: &Value) -> Result<AnalysisResult, InferenceError> {
    // Some revisions of the upstream deliver the structured object as a
    // part directly instead of serialized into the text.
    if let Some(parts) = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
    {
        if let Some(structured) = parts.iter().find(|part| part.get("items").is_some()) {
            return analysis_from_value(structured);
        }
    }

    let text = candidate_text(body)?;
    let payload = extract_json_object(text).ok_or_else(|| {
        InferenceError::UpstreamShape("candidate text carries no JSON object".to_string())
    })?;
    let value: Value = serde_json::from_str(payload).map_err(|e| {
        InferenceError::UpstreamShape(format!("embedded JSON failed to parse: {}", e))
    })?;
    analysis_from_value(&value)
}

/// Strict second pass over the embedded object.
fn analysis_from_value(value: &Value) -> Result<AnalysisResult, InferenceError> {
    let raw_items = value
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| InferenceError::UpstreamShape("result has no items array".to_string()))?;

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| InferenceError::UpstreamShape("item without a name".to_string()))?;
        let calories = raw
            .get("calories")
            .and_then(value_as_kcal)
            .ok_or_else(|| {
                InferenceError::UpstreamShape(format!("item '{}' without calories", name))
            })?;
        items.push(DishItem {
            name: name.to_string(),
            calories,
        });
    }
    if items.is_empty() {
        return Err(InferenceError::UpstreamShape(
            "result has an empty items array".to_string(),
        ));
    }

    let reported_total = ["total", "total_calories", "totalCalories"]
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(value_as_kcal);
    let cooking_method = ["cooking_method", "cookingMethod"]
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(AnalysisResult::from_items(
        items,
        reported_total,
        cooking_method,
    ))
}

fn value_as_kcal(value: &Value) -> Option<u32> {
    match value {
        // Saturate instead of wrapping on absurd model output.
        Value::Number(n) => n
            .as_u64()
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .or_else(|| n.as_f64().map(|v| v.round().clamp(0.0, u32::MAX as f64) as u32)),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Pull the JSON object out of a candidate text that may wrap it in
/// markdown fences or surrounding prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        match rest.rfind("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        trimmed
    };
    if inner.starts_with('{') {
        return Some(inner);
    }
    let start = inner.find('{')?;
    let end = inner.rfind('}')?;
    if end > start {
        Some(&inner[start..=end])
    } else {
        None
    }
}

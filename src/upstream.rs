//! Upstream generative-vision wire layer.
//!
//! Builds the `generateContent` request bodies for the vision stage
//! (instruction text + `inlineData` image part) and the generation stage
//! (prompt text only), issues them with the server-held credential, and
//! returns the upstream JSON untouched. Only the proxy endpoint uses this
//! module; the credential never reaches the client side.

use std::time::Duration;

use serde_json::Value;

use crate::config::ProxySettings;
use crate::error::InferenceError;
use crate::inference::prompts;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

pub struct UpstreamClient {
    settings: ProxySettings,
    api_key: String,
    agent: ureq::Agent,
}

impl UpstreamClient {
    pub fn new(settings: ProxySettings, api_key: String) -> Self {
        Self {
            settings,
            api_key,
            agent: ureq::AgentBuilder::new().timeout(UPSTREAM_TIMEOUT).build(),
        }
    }

    /// Vision stage: forward inline image data, return the upstream body
    /// verbatim.
    pub fn analyze(&self, mime: &str, base64_data: &str) -> Result<Value, InferenceError> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompts::VISION_PROMPT },
                    { "inlineData": { "mimeType": mime, "data": base64_data } }
                ]
            }]
        });
        self.generate_content(&self.settings.vision_model, body)
    }

    /// Generation stage: wrap the serialized stage-one result in the fixed
    /// explanation prompt, return the upstream body verbatim.
    pub fn explain(&self, analysis: &Value) -> Result<Value, InferenceError> {
        let prompt = prompts::build_explain_prompt(&analysis.to_string());
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        self.generate_content(&self.settings.generation_model, body)
    }

    fn generate_content(&self, model: &str, body: Value) -> Result<Value, InferenceError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.settings.upstream_url.trim_end_matches('/'),
            model,
            self.api_key
        );
        log::debug!("upstream call: model {}", model);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(body)?;
        response
            .into_json()
            .map_err(|e| InferenceError::Transport(format!("read upstream body: {}", e)))
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into mime type and payload.
///
/// Bare base64 without the data-URL header is accepted as JPEG, matching
/// what older clients submitted.
pub fn split_data_url(data_url: &str) -> Option<(&str, &str)> {
    if let Some(rest) = data_url.strip_prefix("data:") {
        let (header, payload) = rest.split_once(',')?;
        let mime = header.strip_suffix(";base64")?;
        if mime.is_empty() || payload.is_empty() {
            return None;
        }
        return Some((mime, payload));
    }
    if data_url.is_empty() || data_url.contains(',') {
        return None;
    }
    Some(("image/jpeg", data_url))
}

use crate::error::RelayError;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, warn};

pub const INPUT_ASSET_REFERENCES: &str = "NVCF-INPUT-ASSET-REFERENCES";
pub const FUNCTION_ASSET_IDS: &str = "NVCF-FUNCTION-ASSET-IDS";

/// Fixed sampling parameters attached to every request
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
    pub num_frames_per_inference: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
    pub num_frames_per_inference: u32,
    pub stream: bool,
    pub model: String,
}

impl InferenceRequest {
    pub fn new(prompt: &str, media_tag: &str, params: &InferenceParams) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: "user",
                content: format!("{prompt} {media_tag}"),
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            seed: params.seed,
            num_frames_per_inference: params.num_frames_per_inference,
            stream: false,
            model: params.model.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InferenceClient {
    http: Client,
    url: String,
    api_key: String,
    params: InferenceParams,
    timeout: Duration,
}

impl InferenceClient {
    pub fn new(
        http: Client,
        url: impl Into<String>,
        api_key: impl Into<String>,
        params: InferenceParams,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            api_key: api_key.into(),
            params,
            timeout,
        }
    }

    /// Send `prompt` with its media reference and return the model's JSON verbatim.
    ///
    /// `asset_ids` are declared in the NVCF asset headers so the service can
    /// resolve `<video>` references.
    pub async fn infer(
        &self,
        prompt: &str,
        media_tag: &str,
        asset_ids: &[&str],
    ) -> Result<JsonValue, RelayError> {
        let payload = InferenceRequest::new(prompt, media_tag, &self.params);

        let mut request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json")
            .json(&payload)
            .timeout(self.timeout);

        if !asset_ids.is_empty() {
            let asset_seq = asset_ids.join(",");
            request = request
                .header(INPUT_ASSET_REFERENCES, &asset_seq)
                .header(FUNCTION_ASSET_IDS, &asset_seq);
        }

        debug!(assets = asset_ids.len(), "Sending inference request");
        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| {
                warn!(%error, "Inference request failed");
                RelayError::Inference(error.without_url().to_string())
            })?;

        response.json::<JsonValue>().await.map_err(|error| {
            warn!(%error, "Inference response was not JSON");
            RelayError::Inference(error.without_url().to_string())
        })
    }
}

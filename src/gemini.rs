use base64::Engine as _;

use crate::error::PipelineError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Text generation behind the pipeline. The model's output is opaque
/// here; callers hand it to the response coercer.
#[async_trait::async_trait]
pub trait ContentModel: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        image: Option<&InlineImage>,
    ) -> Result<String, PipelineError>;
}

/// Client for the Generative Language `generateContent` endpoint. One
/// request per call, no retries: a failed call surfaces as a page-level
/// model error and the job moves on.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_env(http: reqwest::Client) -> Result<Self, PipelineError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| PipelineError::auth("set GEMINI_API_KEY to a content model key"))?;
        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(http, base_url, api_key, model))
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait::async_trait]
impl ContentModel for GeminiClient {
    async fn generate(
        &self,
        prompt: &str,
        image: Option<&InlineImage>,
    ) -> Result<String, PipelineError> {
        let mut parts = vec![serde_json::json!({ "text": prompt })];
        if let Some(image) = image {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&image.data);
            parts.push(serde_json::json!({
                "inline_data": { "mime_type": image.mime_type, "data": encoded },
            }));
        }
        let body = serde_json::json!({ "contents": [{ "parts": parts }] });

        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                PipelineError::model_call(format!("POST {endpoint}"), Some(err.into()))
            })?;

        let status = response.status();
        let raw = response.text().await.map_err(|err| {
            PipelineError::model_call("read model response body", Some(err.into()))
        })?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            return Err(PipelineError::model_call(
                format!("model API error ({status}): {message}"),
                None,
            ));
        }

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| PipelineError::model_call("parse model response", Some(err.into())))?;
        extract_candidate_text(&value)
            .ok_or_else(|| PipelineError::model_call("model response carried no text", None))
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn extract_candidate_text(value: &serde_json::Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let mut text = String::new();
    for part in parts {
        if let Some(piece) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(piece);
        }
    }
    if text.trim().is_empty() {
        return None;
    }
    Some(text)
}

/// MIME type for an image handed to the model, by file extension. Ink
/// drawings come through as `.svg`; everything else the notes source
/// serves is treated as PNG.
pub fn mime_type_for_file(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "svg" => "image/svg+xml",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

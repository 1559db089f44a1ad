//! Gemini REST client (`models/{model}:generateContent`).
//!
//! One client serves both capabilities: text generation (optionally with the
//! `google_search` grounding tool attached) and image captioning (the image
//! travels as base64 `inlineData` next to the prompt).

use super::{
    classify_reqwest, CaptionService, Generation, GenerationRequest, GenerationService,
    ServiceError, Source,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    caption_max_tokens: usize,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Permanent {
                detail: format!("HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            caption_max_tokens: 512,
        })
    }

    /// Output token cap for a single caption. Default: 512.
    pub fn with_caption_max_tokens(mut self, n: usize) -> Self {
        self.caption_max_tokens = n;
        self
    }

    async fn generate_content(
        &self,
        model: &str,
        body: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ServiceError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &detail));
        }

        response
            .json::<GenerateContentResponse>()
            .await
            .map_err(|e| ServiceError::Transient {
                detail: format!("malformed response: {e}"),
            })
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ServiceError> {
        let body = GenerateContentRequest {
            system_instruction: request.system.as_deref().map(Content::system),
            contents: vec![Content::user(vec![Part::text(&request.prompt)])],
            tools: if request.grounded {
                vec![Tool::google_search()]
            } else {
                Vec::new()
            },
            generation_config: Some(GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            }),
        };
        let response = self.generate_content(&request.model, &body).await?;
        let generation = response.into_generation()?;
        debug!(
            "Gemini {}: {} chars, {} sources",
            request.model,
            generation.text.len(),
            generation.sources.len()
        );
        Ok(generation)
    }
}

#[async_trait]
impl CaptionService for GeminiClient {
    async fn caption(
        &self,
        model: &str,
        image: &[u8],
        mime: &str,
        prompt: &str,
    ) -> Result<String, ServiceError> {
        let body = caption_request(prompt, mime, image, self.caption_max_tokens);
        let response = self.generate_content(model, &body).await?;
        Ok(response.into_generation()?.text)
    }
}

/// Caption call body: temperature 0, output capped at `max_output_tokens`.
fn caption_request(
    prompt: &str,
    mime: &str,
    image: &[u8],
    max_output_tokens: usize,
) -> GenerateContentRequest {
    GenerateContentRequest {
        system_instruction: None,
        contents: vec![Content::user(vec![
            Part::text(prompt),
            Part::inline(mime, STANDARD.encode(image)),
        ])],
        tools: Vec::new(),
        generation_config: Some(GenerationConfig {
            temperature: Some(0.0),
            max_output_tokens: Some(max_output_tokens),
        }),
    }
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    detail: &str,
) -> ServiceError {
    let detail = format!("HTTP {status}: {}", truncate(detail, 300));
    if status == StatusCode::TOO_MANY_REQUESTS {
        ServiceError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ServiceError::Transient { detail }
    } else {
        ServiceError::Permanent { detail }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".into()),
            parts,
        }
    }

    fn system(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    inline_data: Option<InlineData>,
    /// Set on the model's internal reasoning parts; never part of the answer.
    #[serde(skip_serializing, default)]
    thought: Option<bool>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn inline(mime: &str, data: String) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: mime.to_string(),
                data,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct Tool {
    google_search: serde_json::Value,
}

impl Tool {
    fn google_search() -> Self {
        Self {
            google_search: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebChunk>,
}

#[derive(Debug, Deserialize)]
struct WebChunk {
    #[serde(default)]
    uri: String,
    #[serde(default)]
    title: String,
}

impl GenerateContentResponse {
    fn into_generation(self) -> Result<Generation, ServiceError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ServiceError::Permanent {
                detail: format!("prompt blocked: {reason}"),
            });
        }
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(ServiceError::Transient {
                detail: "response carried no candidates".into(),
            });
        };

        let text: String = candidate
            .content
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.thought != Some(true))
            .filter_map(|p| p.text)
            .collect();

        if text.trim().is_empty() {
            let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".into());
            return Err(ServiceError::Permanent {
                detail: format!("empty response (finish reason {reason})"),
            });
        }

        let mut sources: Vec<Source> = Vec::new();
        for chunk in candidate
            .grounding_metadata
            .map(|m| m.grounding_chunks)
            .unwrap_or_default()
        {
            if let Some(web) = chunk.web {
                if !web.uri.is_empty() && !sources.iter().any(|s| s.uri == web.uri) {
                    sources.push(Source {
                        title: web.title,
                        uri: web.uri,
                    });
                }
            }
        }

        Ok(Generation { text, sources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn grounded_request_body_shape() {
        let body = GenerateContentRequest {
            system_instruction: Some(Content::system("be brief")),
            contents: vec![Content::user(vec![Part::text("rust 1.88 release")])],
            tools: vec![Tool::google_search()],
            generation_config: Some(GenerationConfig {
                temperature: Some(0.1),
                max_output_tokens: Some(8192),
            }),
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(v["contents"][0]["parts"][0]["text"], "rust 1.88 release");
        assert_eq!(v["tools"][0]["google_search"], json!({}));
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 8192);
        assert!(v["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn inline_image_part() {
        let v = serde_json::to_value(Part::inline("image/png", "AAAA".into())).unwrap();
        assert_eq!(v, json!({"inlineData": {"mimeType": "image/png", "data": "AAAA"}}));
    }

    #[test]
    fn caption_request_caps_output() {
        let v = serde_json::to_value(caption_request("describe", "image/png", b"\x89PNG", 256))
            .unwrap();
        assert_eq!(v["generationConfig"]["temperature"], 0.0);
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(v["contents"][0]["parts"][0]["text"], "describe");
        assert_eq!(v["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert!(v.get("tools").is_none());
    }

    #[test]
    fn parses_text_and_sources() {
        let raw = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "Rust 1.88 "},
                    {"text": "shipped in June."}
                ]},
                "finishReason": "STOP",
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://blog.rust-lang.org/a", "title": "Rust Blog"}},
                    {"web": {"uri": "https://blog.rust-lang.org/a", "title": "Rust Blog"}},
                    {"retrievedContext": {}}
                ]}
            }]
        });
        let resp: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let g = resp.into_generation().unwrap();
        assert_eq!(g.text, "Rust 1.88 shipped in June.");
        assert_eq!(g.sources.len(), 1);
        assert_eq!(g.sources[0].title, "Rust Blog");
    }

    #[test]
    fn blocked_prompt_is_permanent() {
        let raw = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let resp: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let err = resp.into_generation().unwrap_err();
        assert!(matches!(err, ServiceError::Permanent { .. }));
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn empty_candidates_are_transient() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        assert!(resp.into_generation().unwrap_err().is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), ""),
            ServiceError::RateLimited { retry_after: Some(_) }
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, None, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, None, "bad").is_retryable());
        assert!(!classify_status(StatusCode::FORBIDDEN, None, "key").is_retryable());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}

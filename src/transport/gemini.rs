use std::env;
use std::fmt;
use std::time::Duration;

use futures::stream::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ChunkStream, Transport};
use crate::config::{AssistantConfig, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::observability::{TRANSPORT_REQUEST_ERRORS, TRANSPORT_REQUESTS};
use crate::sse::{SseEvent, process_sse};

/// Default endpoint of the generative-language API.
pub const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/";
/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Streaming transport for the Gemini `streamGenerateContent` endpoint.
///
/// The API key is held here and nowhere else; the `Debug` impl redacts it.
#[derive(Clone)]
pub struct GeminiTransport {
    api_key: String,
    client: ReqwestClient,
    base_url: Url,
    model: String,
    timeout: Option<Duration>,
}

impl fmt::Debug for GeminiTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiTransport")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url.as_str())
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GeminiTransport {
    /// Create a new transport with default settings.
    ///
    /// The API key can be provided directly or read from the `GEMINI_API_KEY` environment
    /// variable.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_options(api_key, None, None, Some(DEFAULT_TIMEOUT))
    }

    /// Create a transport from resolved assistant configuration.
    pub fn from_config(api_key: Option<String>, config: &AssistantConfig) -> Result<Self> {
        Self::with_options(
            api_key,
            Some(&config.base_url),
            Some(&config.model),
            config.timeout,
        )
    }

    /// Create a new transport with custom settings.
    ///
    /// `timeout` bounds the whole call, including the time spent streaming the body.  `None`
    /// leaves the call unbounded.
    pub fn with_options(
        api_key: Option<String>,
        base_url: Option<&str>,
        model: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let api_key = match api_key {
            Some(key) => key,
            None => env::var(API_KEY_ENV).map_err(|_| {
                Error::authentication(format!(
                    "API key not provided and {API_KEY_ENV} environment variable not set"
                ))
            })?,
        };
        if api_key.trim().is_empty() {
            return Err(Error::authentication("API key is empty"));
        }
        HeaderValue::from_str(&api_key)
            .map_err(|_| Error::authentication("API key contains invalid header characters"))?;

        let mut base_url = base_url.unwrap_or(DEFAULT_API_URL).to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base_url = Url::parse(&base_url)?;

        let mut builder = ReqwestClient::builder().connect_timeout(Duration::from_secs(10));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            Error::http_client(
                format!("Failed to build HTTP client: {e}"),
                Some(Box::new(e)),
            )
        })?;

        Ok(Self {
            api_key,
            client,
            base_url,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            timeout,
        })
    }

    /// The model this transport talks to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The streaming endpoint for the configured model.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("models/{}:streamGenerateContent", self.model))?;
        url.query_pairs_mut().append_pair("alt", "sse");
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| Error::authentication("API key contains invalid header characters"))?;
        headers.insert("x-goog-api-key", key);
        Ok(headers)
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };
        let detail = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|envelope| envelope.error);
        let status = detail.as_ref().and_then(|d| d.status.clone());
        let message = detail
            .and_then(|d| d.message)
            .unwrap_or_else(|| body.clone());

        error_for_status(status_code, status, message, retry_after)
    }
}

#[async_trait::async_trait]
impl Transport for GeminiTransport {
    async fn stream_completion(
        &self,
        preamble: &str,
        opening_reply: &str,
        query: &str,
    ) -> Result<ChunkStream> {
        let url = self.endpoint()?;
        let body = GenerateContentRequest::new(preamble, opening_reply, query);
        TRANSPORT_REQUESTS.click();
        tracing::debug!(model = %self.model, query_len = query.len(), "opening response stream");

        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                TRANSPORT_REQUEST_ERRORS.click();
                if e.is_timeout() {
                    Error::timeout(
                        format!("Request timed out: {e}"),
                        self.timeout.map(|t| t.as_secs_f64()),
                    )
                } else if e.is_connect() {
                    Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
                } else {
                    Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
                }
            })?;

        if !response.status().is_success() {
            TRANSPORT_REQUEST_ERRORS.click();
            let err = Self::process_error_response(response).await;
            tracing::warn!(error = %err, "response stream refused");
            return Err(err);
        }

        let chunks = process_sse(response.bytes_stream())
            .filter_map(|event| async move {
                match event {
                    Ok(event) => chunk_from_event(&event),
                    Err(e) => Some(Err(e)),
                }
            })
            .scan(false, |failed, item| {
                // Nothing follows a terminal error.
                let next = if *failed {
                    None
                } else {
                    *failed = item.is_err();
                    Some(item)
                };
                async move { next }
            });
        Ok(Box::pin(chunks))
    }
}

/// Map an HTTP status to the matching error variant.
fn error_for_status(
    status_code: u16,
    status: Option<String>,
    message: String,
    retry_after: Option<u64>,
) -> Error {
    match status_code {
        401 => Error::authentication(message),
        403 => Error::permission(message),
        408 => Error::timeout(message, None),
        429 => Error::rate_limit(message, retry_after),
        500 | 502..=504 => Error::service_unavailable(message, retry_after),
        _ => Error::api(status_code, status, message),
    }
}

/// Interpret one SSE event; `None` means the event carried no text.
/// Finish reasons that mean the candidate was withheld rather than finished.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "LANGUAGE",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

fn chunk_from_event(event: &SseEvent) -> Option<Result<String>> {
    let response: GenerateContentResponse = match serde_json::from_str(&event.data) {
        Ok(response) => response,
        Err(e) => return Some(Err(e.into())),
    };
    if let Some(detail) = response.error {
        let status_code = detail.code.unwrap_or(500);
        let message = detail
            .message
            .unwrap_or_else(|| "stream reported an error".to_string());
        return Some(Err(error_for_status(
            status_code,
            detail.status,
            message,
            None,
        )));
    }
    if let Some(reason) = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Some(Err(Error::api(
            400,
            Some(reason.clone()),
            format!("prompt blocked by the service: {reason}"),
        )));
    }
    let candidate = response.candidates.into_iter().next();
    if let Some(reason) = candidate
        .as_ref()
        .and_then(|candidate| candidate.finish_reason.as_deref())
        .filter(|reason| BLOCKING_FINISH_REASONS.contains(reason))
    {
        return Some(Err(Error::api(
            400,
            Some(reason.to_string()),
            format!("response blocked by the service: {reason}"),
        )));
    }
    let text: String = candidate
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();
    if text.is_empty() {
        None
    } else {
        Some(Ok(text))
    }
}

///////////////////////////////////////////// wire /////////////////////////////////////////////

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(preamble: &'a str, opening_reply: &'a str, query: &'a str) -> Self {
        Self {
            contents: vec![
                Content::text("user", preamble),
                Content::text("model", opening_reply),
                Content::text("user", query),
            ],
        }
    }
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

impl<'a> Content<'a> {
    fn text(role: &'a str, text: &'a str) -> Self {
        Self {
            role,
            parts: vec![Part { text }],
        }
    }
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn transport_creation() {
        let transport = GeminiTransport::new(Some("test-key".to_string())).unwrap();
        assert_eq!(transport.api_key, "test-key");
        assert_eq!(transport.base_url.as_str(), DEFAULT_API_URL);
        assert_eq!(transport.model(), DEFAULT_MODEL);
        assert_eq!(transport.timeout, Some(DEFAULT_TIMEOUT));

        let transport = GeminiTransport::with_options(
            Some("test-key".to_string()),
            Some("https://proxy.example.com/v1"),
            Some("gemini-2.0-flash"),
            None,
        )
        .unwrap();
        assert_eq!(transport.base_url.as_str(), "https://proxy.example.com/v1/");
        assert_eq!(transport.timeout, None);
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = GeminiTransport::new(Some("  ".to_string())).unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn debug_redacts_key() {
        let transport = GeminiTransport::new(Some("super-secret".to_string())).unwrap();
        let debug = format!("{transport:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn endpoint_targets_sse_stream() {
        let transport = GeminiTransport::new(Some("k".to_string())).unwrap();
        assert_eq!(
            transport.endpoint().unwrap().as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash-latest:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn request_body_seeds_history() {
        let body = GenerateContentRequest::new("rules", "Hello!", "What do you do?");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "rules"}]},
                    {"role": "model", "parts": [{"text": "Hello!"}]},
                    {"role": "user", "parts": [{"text": "What do you do?"}]},
                ]
            })
        );
    }

    #[test]
    fn chunk_joins_candidate_parts() {
        let chunk = chunk_from_event(&event(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#,
        ));
        assert_eq!(chunk.unwrap().unwrap(), "Hello");
    }

    #[test]
    fn empty_chunks_are_skipped() {
        assert!(chunk_from_event(&event(r#"{"candidates":[{"finishReason":"STOP"}]}"#)).is_none());
        assert!(chunk_from_event(&event(r#"{"usageMetadata":{"totalTokenCount":3}}"#)).is_none());
    }

    #[test]
    fn in_stream_error_is_terminal() {
        let chunk = chunk_from_event(&event(
            r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
        ));
        assert!(chunk.unwrap().unwrap_err().is_rate_limit());
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let chunk = chunk_from_event(&event(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#));
        let err = chunk.unwrap().unwrap_err();
        assert_eq!(err.status_code(), Some(400));
    }

    #[test]
    fn blocked_candidate_is_an_error() {
        let chunk = chunk_from_event(&event(
            r#"{"candidates":[{"finishReason":"SAFETY","safetyRatings":[]}]}"#,
        ));
        let err = chunk.unwrap().unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert!(err.to_string().contains("SAFETY"), "{err}");

        let chunk = chunk_from_event(&event(
            r#"{"candidates":[{"content":{"parts":[{"text":"quoted"}]},"finishReason":"RECITATION"}]}"#,
        ));
        assert!(chunk.unwrap().is_err());
    }

    #[test]
    fn normal_finish_reasons_keep_the_text() {
        let chunk = chunk_from_event(&event(
            r#"{"candidates":[{"content":{"parts":[{"text":"done"}]},"finishReason":"STOP"}]}"#,
        ));
        assert_eq!(chunk.unwrap().unwrap(), "done");
        let chunk = chunk_from_event(&event(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#));
        assert!(chunk.is_none());
    }

    #[test]
    fn malformed_payload_is_serialization_error() {
        let chunk = chunk_from_event(&event("not json"));
        assert!(matches!(
            chunk.unwrap().unwrap_err(),
            Error::Serialization { .. }
        ));
    }

    #[test]
    fn status_mapping() {
        assert!(error_for_status(401, None, "x".into(), None).is_authentication());
        assert!(matches!(
            error_for_status(403, None, "x".into(), None),
            Error::Permission { .. }
        ));
        assert!(error_for_status(408, None, "x".into(), None).is_timeout());
        assert!(matches!(
            error_for_status(429, None, "x".into(), Some(7)),
            Error::RateLimit {
                retry_after: Some(7),
                ..
            }
        ));
        assert!(matches!(
            error_for_status(503, None, "x".into(), None),
            Error::ServiceUnavailable { .. }
        ));
        assert_eq!(
            error_for_status(400, Some("INVALID_ARGUMENT".into()), "x".into(), None).status_code(),
            Some(400)
        );
    }

    #[tokio::test]
    #[ignore] // Ignore by default as this requires a real API key
    async fn test_stream_completion() {
        let api_key = env::var(API_KEY_ENV).ok();
        if api_key.is_none() {
            println!("Skipping test_stream_completion: {API_KEY_ENV} not set");
            return;
        }
        let transport = GeminiTransport::new(api_key).unwrap();
        let mut chunks = transport
            .stream_completion("Answer briefly.", "Hello!", "Say hi.")
            .await
            .unwrap();
        let mut received = String::new();
        while let Some(chunk) = chunks.next().await {
            received.push_str(&chunk.unwrap());
        }
        assert!(!received.is_empty());
    }
}

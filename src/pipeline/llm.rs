//! VLM interaction: build the vision request, call the API, apply retries.
//!
//! Prompt text lives in [`crate::prompts`]; response validation lives in
//! [`crate::pipeline::response`]. This module owns only the request shape,
//! the transport seam and the retry policy.
//!
//! ## Retry Strategy
//!
//! Errors are classified where they happen:
//!
//! | Failure                  | Action                                      |
//! |--------------------------|---------------------------------------------|
//! | HTTP 401                 | fail now: [`ExtractionError::InvalidCredentials`] |
//! | HTTP 429 / 5xx           | back off, retry                             |
//! | empty reply              | back off, retry                             |
//! | unparseable reply        | fail now: [`ExtractionError::MalformedResponse`] |
//! | anything else            | fail now                                    |
//!
//! The delay after failed attempt `n` (0-based) is
//! `min(base_backoff_ms × 2^n, max_backoff_ms)`: 1 s → 2 s → 4 s … capped at
//! 10 s. After `max_retries` attempts the last transient error is wrapped in
//! [`ExtractionError::RetriesExhausted`].
//!
//! ## Mock mode
//!
//! [`build_extractor`] returns a [`MockExtractor`] when no API key is
//! configured. It never touches the network and never consumes retries.

use crate::config::{ExtractionConfig, GradeLevel};
use crate::error::ExtractionError;
use crate::pipeline::response::{parse_extraction, ExtractionResult};
use crate::progress::{NoopObserver, SessionObserver};
use crate::prompts::{build_user_prompt, SYSTEM_PROMPT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ── Request / response wire types ────────────────────────────────────────

/// Chat-completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Either plain text (system turn) or a list of parts (user turn with image).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Build the two-message vision request for one extraction attempt.
pub fn build_request(
    config: &ExtractionConfig,
    image_data_url: &str,
    grade: GradeLevel,
) -> ChatRequest {
    ChatRequest {
        model: config.model.clone(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(SYSTEM_PROMPT.to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: build_user_prompt(grade),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_data_url.to_string(),
                        },
                    },
                ]),
            },
        ],
        max_tokens: Some(config.max_tokens),
        temperature: Some(config.temperature),
    }
}

// ── Transport ────────────────────────────────────────────────────────────

/// Failure reported by a [`ChatTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The server answered with a non-success HTTP status.
    Status { status: u16, message: String },
    /// No HTTP status was received.
    Network(String),
    /// A 2xx response whose body was not a chat-completions envelope.
    Decode { detail: String, body: String },
}

/// Sends one chat request and returns `choices[0].message.content`.
///
/// An absent or `null` content is returned as an empty string; the retry
/// loop decides what an empty reply means.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<String, TransportError>;
}

/// `reqwest`-backed transport for any OpenAI-compatible endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ExtractionError::Config("an API key is required".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExtractionError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url),
            api_key,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest) -> Result<String, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| TransportError::Decode {
                detail: e.to_string(),
                body: body.clone(),
            })?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Pull `error.message` out of an OpenAI-style error body, else the body itself.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no response body".to_string()
            } else {
                trimmed.chars().take(300).collect()
            }
        })
}

// ── Extractors ───────────────────────────────────────────────────────────

/// Capability to turn an encoded image into an [`ExtractionResult`].
#[async_trait]
pub trait QuestionExtractor: Send + Sync {
    /// Extract, reporting attempts and retries to `observer`.
    async fn extract_observed(
        &self,
        image_data_url: &str,
        grade: GradeLevel,
        observer: &dyn SessionObserver,
    ) -> Result<ExtractionResult, ExtractionError>;

    /// Extract without progress reporting.
    ///
    /// The attempt budget is not a per-call argument: it comes from
    /// [`ExtractionConfig::max_retries`] given when the extractor was built.
    async fn extract(
        &self,
        image_data_url: &str,
        grade: GradeLevel,
    ) -> Result<ExtractionResult, ExtractionError> {
        self.extract_observed(image_data_url, grade, &NoopObserver)
            .await
    }

    /// True for the offline mock.
    fn is_mock(&self) -> bool {
        false
    }
}

/// Pick the real or mock extractor from the configuration.
pub fn build_extractor(
    config: &ExtractionConfig,
) -> Result<Arc<dyn QuestionExtractor>, ExtractionError> {
    if config.is_mock() {
        info!("No API key configured; using mock extractor");
        return Ok(Arc::new(MockExtractor::new(Duration::from_millis(
            config.mock_delay_ms,
        ))));
    }
    let transport = HttpTransport::new(config)?;
    Ok(Arc::new(VisionExtractor::new(transport, config.clone())))
}

/// Extractor backed by a [`ChatTransport`], with retry/backoff.
pub struct VisionExtractor<T: ChatTransport> {
    transport: T,
    config: ExtractionConfig,
}

impl<T: ChatTransport> VisionExtractor<T> {
    pub fn new(transport: T, config: ExtractionConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// How the retry loop treats one failed attempt.
enum Failure {
    Transient(String),
    Fatal(ExtractionError),
}

fn classify(err: TransportError) -> Failure {
    match err {
        TransportError::Status { status: 401, .. } => {
            Failure::Fatal(ExtractionError::InvalidCredentials)
        }
        TransportError::Status { status, message } if status == 429 || status >= 500 => {
            Failure::Transient(format!("HTTP {status}: {message}"))
        }
        TransportError::Status { status, message } => {
            Failure::Fatal(ExtractionError::Api { status, message })
        }
        TransportError::Network(msg) => Failure::Fatal(ExtractionError::Request(msg)),
        TransportError::Decode { detail, body } => {
            Failure::Fatal(ExtractionError::MalformedResponse {
                reason: detail,
                raw: body,
            })
        }
    }
}

#[async_trait]
impl<T: ChatTransport> QuestionExtractor for VisionExtractor<T> {
    async fn extract_observed(
        &self,
        image_data_url: &str,
        grade: GradeLevel,
        observer: &dyn SessionObserver,
    ) -> Result<ExtractionResult, ExtractionError> {
        let request = build_request(&self.config, image_data_url, grade);
        let max_attempts = self.config.max_retries.max(1);
        let mut last_err = String::from("no attempt made");

        for attempt in 0..max_attempts {
            observer.on_attempt(attempt + 1, max_attempts);

            match self.transport.send(&request).await {
                Ok(content) if content.trim().is_empty() => {
                    warn!("Attempt {} returned an empty reply", attempt + 1);
                    last_err = "empty response from model".to_string();
                }
                Ok(content) => {
                    debug!("Attempt {} returned {} bytes", attempt + 1, content.len());
                    return parse_extraction(&content);
                }
                Err(e) => match classify(e) {
                    Failure::Fatal(err) => {
                        warn!("Attempt {} failed permanently: {}", attempt + 1, err);
                        return Err(err);
                    }
                    Failure::Transient(msg) => {
                        warn!("Attempt {} failed: {}", attempt + 1, msg);
                        last_err = msg;
                    }
                },
            }

            if attempt + 1 < max_attempts {
                let backoff = self.config.backoff_ms(attempt);
                warn!("Retry {}/{} after {}ms", attempt + 1, max_attempts - 1, backoff);
                observer.on_retry(attempt + 1, backoff);
                sleep(Duration::from_millis(backoff)).await;
            }
        }

        Err(ExtractionError::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_err,
        })
    }
}

/// Offline extractor returning [`ExtractionResult::mock`] after a fixed delay.
pub struct MockExtractor {
    delay: Duration,
}

impl MockExtractor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl QuestionExtractor for MockExtractor {
    async fn extract_observed(
        &self,
        _image_data_url: &str,
        grade: GradeLevel,
        observer: &dyn SessionObserver,
    ) -> Result<ExtractionResult, ExtractionError> {
        observer.on_attempt(1, 1);
        sleep(self.delay).await;
        debug!("Mock extraction complete");
        Ok(ExtractionResult::mock(grade))
    }

    fn is_mock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const GOOD: &str = r#"{"questionText":"Q","confidence":0.9,"noiseFiltered":true,"errorMessage":null,"educationLevel":"middle"}"#;

    /// Replays a fixed script of replies and counts calls.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<String, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(&self, _request: &ChatRequest) -> Result<String, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("script exhausted".into())))
        }
    }

    fn status(code: u16) -> Result<String, TransportError> {
        Err(TransportError::Status {
            status: code,
            message: format!("status {code}"),
        })
    }

    fn extractor(
        replies: Vec<Result<String, TransportError>>,
    ) -> VisionExtractor<ScriptedTransport> {
        let config = ExtractionConfig::builder()
            .api_key("sk-test")
            .max_retries(3)
            .build()
            .unwrap();
        VisionExtractor::new(ScriptedTransport::new(replies), config)
    }

    #[tokio::test(start_paused = true)]
    async fn two_server_errors_then_success() {
        let ex = extractor(vec![status(500), status(500), Ok(GOOD.into())]);
        let start = Instant::now();
        let r = ex.extract("data:image/png;base64,AA==", GradeLevel::Middle).await.unwrap();
        let elapsed = start.elapsed().as_millis();

        assert_eq!(r.question_text, "Q");
        assert_eq!(ex.transport().calls(), 3);
        assert!((1000..=3000).contains(&elapsed), "elapsed {elapsed}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_fails_after_one_call() {
        let ex = extractor(vec![status(401), Ok(GOOD.into())]);
        let err = ex.extract("data:,", GradeLevel::Middle).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidCredentials));
        assert_eq!(ex.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhausts_retries() {
        let ex = extractor(vec![status(429), status(429), status(503)]);
        let start = Instant::now();
        let err = ex.extract("data:,", GradeLevel::High).await.unwrap_err();
        match err {
            ExtractionError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("503"), "got: {last_error}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(ex.transport().calls(), 3);
        assert_eq!(start.elapsed().as_millis(), 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_is_retried() {
        let ex = extractor(vec![Ok(String::new()), Ok("   ".into()), Ok(GOOD.into())]);
        assert!(ex.extract("data:,", GradeLevel::Middle).await.is_ok());
        assert_eq!(ex.transport().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_replies_exhaust() {
        let ex = extractor(vec![Ok(String::new()), Ok(String::new()), Ok(String::new())]);
        let err = ex.extract("data:,", GradeLevel::Middle).await.unwrap_err();
        assert!(matches!(err, ExtractionError::RetriesExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_is_not_retried() {
        let ex = extractor(vec![Ok("I think the question is…".into()), Ok(GOOD.into())]);
        let err = ex.extract("data:,", GradeLevel::Middle).await.unwrap_err();
        assert_eq!(err.raw_payload(), Some("I think the question is…"));
        assert_eq!(ex.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_client_errors_fail_immediately() {
        let ex = extractor(vec![status(400), Ok(GOOD.into())]);
        let err = ex.extract("data:,", GradeLevel::Middle).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Api { status: 400, .. }));
        assert_eq!(ex.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_fail_immediately() {
        let ex = extractor(vec![Err(TransportError::Network("connection reset".into()))]);
        let err = ex.extract("data:,", GradeLevel::Middle).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Request(_)));
        assert_eq!(ex.transport().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_never_calls_network() {
        let config = ExtractionConfig::default();
        let ex = build_extractor(&config).unwrap();
        assert!(ex.is_mock());
        let r = ex.extract("data:,", GradeLevel::Elementary).await.unwrap();
        assert_eq!(r, ExtractionResult::mock(GradeLevel::Elementary));
    }

    #[test]
    fn keyed_config_builds_http_extractor() {
        let config = ExtractionConfig::builder().api_key("sk-test").build().unwrap();
        let ex = build_extractor(&config).unwrap();
        assert!(!ex.is_mock());
    }

    #[test]
    fn request_shape_matches_chat_completions() {
        let config = ExtractionConfig::default();
        let req = build_request(&config, "data:image/png;base64,AAAA", GradeLevel::High);
        let v = serde_json::to_value(&req).unwrap();

        assert_eq!(v["model"], config.model);
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][0]["content"], SYSTEM_PROMPT);
        assert_eq!(v["messages"][1]["role"], "user");
        assert_eq!(v["messages"][1]["content"][0]["type"], "text");
        assert!(v["messages"][1]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("high school"));
        assert_eq!(v["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            v["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            api_error_message(r#"{"error":{"message":"Incorrect API key"}}"#),
            "Incorrect API key"
        );
        assert_eq!(api_error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(api_error_message(""), "no response body");
    }
}

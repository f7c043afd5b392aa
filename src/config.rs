//! Configuration types for question extraction.
//!
//! The extraction client is configured through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. The credential lives here rather
//! than in a process-global client: an absent key selects the mock
//! extractor once, at construction time (see [`crate::pipeline::llm::build_extractor`]).
//!
//! Image compression has its own small [`CompressionConfig`] because it runs
//! on a different path (storage optimisation) from the extraction call.

use crate::error::ExtractionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum accepted upload size: 5 MiB.
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Longest edge, in pixels, of a compressed image.
pub const MAX_IMAGE_DIMENSION: u32 = 1200;

/// Default JPEG quality factor used by the compressor.
pub const DEFAULT_JPEG_QUALITY: f32 = 0.8;

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default vision model.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Configuration for the extraction client.
///
/// # Example
/// ```rust
/// use homework_lens::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .api_key("sk-test")
///     .model("gpt-4o-mini")
///     .max_retries(5)
///     .build()
///     .unwrap();
/// assert!(!config.is_mock());
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// API credential. `None` or empty selects the mock extractor.
    pub api_key: Option<String>,

    /// Base URL of a chat-completions compatible API. Default: OpenAI.
    pub base_url: String,

    /// Vision model identifier. Default: `gpt-4o`.
    pub model: String,

    /// Number of attempts before giving up on transient failures. Default: 3.
    ///
    /// Only rate limits (429), server errors (5xx) and empty replies count as
    /// transient. A 401 or a malformed reply ends the sequence immediately.
    pub max_retries: u32,

    /// Initial backoff in milliseconds, doubled after every failed attempt. Default: 1000.
    pub base_backoff_ms: u64,

    /// Upper bound on a single backoff delay. Default: 10 000.
    pub max_backoff_ms: u64,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 1000.
    ///
    /// A single question plus the JSON envelope rarely needs more than a few
    /// hundred tokens.
    pub max_tokens: u32,

    /// Per-request HTTP timeout in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Simulated latency of the mock extractor in milliseconds. Default: 1500.
    pub mock_delay_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            temperature: 0.1,
            max_tokens: 1000,
            request_timeout_secs: 60,
            mock_delay_ms: 1500,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .field("base_backoff_ms", &self.base_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("mock_delay_ms", &self.mock_delay_ms)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// True when no usable credential is configured.
    pub fn is_mock(&self) -> bool {
        self.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
    }

    /// Backoff before the retry that follows failed attempt `attempt` (0-based).
    ///
    /// `min(base × 2^attempt, max)`; with the defaults: 1 s, 2 s, 4 s, 8 s, 10 s, …
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    /// Set the key from an optional source (e.g. an env var that may be unset).
    pub fn api_key_opt(mut self, key: Option<String>) -> Self {
        self.config.api_key = key;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn base_backoff_ms(mut self, ms: u64) -> Self {
        self.config.base_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn mock_delay_ms(mut self, ms: u64) -> Self {
        self.config.mock_delay_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractionError> {
        let c = &self.config;
        if c.max_retries == 0 {
            return Err(ExtractionError::Config("max_retries must be ≥ 1".into()));
        }
        if c.model.trim().is_empty() {
            return Err(ExtractionError::Config("model must not be empty".into()));
        }
        if !(c.base_url.starts_with("http://") || c.base_url.starts_with("https://")) {
            return Err(ExtractionError::Config(format!(
                "base_url must be an HTTP(S) URL, got '{}'",
                c.base_url
            )));
        }
        if c.base_backoff_ms > c.max_backoff_ms {
            return Err(ExtractionError::Config(format!(
                "base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                c.base_backoff_ms, c.max_backoff_ms
            )));
        }
        Ok(self.config)
    }
}

/// Settings for storage-oriented image compression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Neither output dimension exceeds this. Default: 1200 px.
    pub max_dimension: u32,
    /// JPEG quality factor in (0, 1]. Default: 0.8.
    pub jpeg_quality: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_dimension: MAX_IMAGE_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl CompressionConfig {
    /// Override the quality factor, clamped to `[0.01, 1.0]`.
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.jpeg_quality = quality.clamp(0.01, 1.0);
        self
    }

    /// Quality as the 1–100 scale the JPEG encoder expects.
    pub fn jpeg_quality_percent(&self) -> u8 {
        (self.jpeg_quality.clamp(0.01, 1.0) * 100.0).round() as u8
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// School level the question is pitched at. Tailors the extraction prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeLevel {
    Elementary,
    #[default]
    Middle,
    High,
}

impl GradeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeLevel::Elementary => "elementary",
            GradeLevel::Middle => "middle",
            GradeLevel::High => "high",
        }
    }

    /// Human description used inside the prompt.
    pub fn describe(&self) -> &'static str {
        match self {
            GradeLevel::Elementary => "elementary school (grades 1-5)",
            GradeLevel::Middle => "middle school (grades 6-8)",
            GradeLevel::High => "high school (grades 9-12)",
        }
    }

    /// Parse the lowercase wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elementary" => Some(GradeLevel::Elementary),
            "middle" => Some(GradeLevel::Middle),
            "high" => Some(GradeLevel::High),
            _ => None,
        }
    }
}

impl fmt::Display for GradeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted upload formats, serialised as their MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileFormat {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/webp")]
    WebP,
}

/// MIME types the validator accepts.
pub const SUPPORTED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

impl FileFormat {
    /// Every format, in the order of [`SUPPORTED_MIME_TYPES`].
    pub const ALL: [FileFormat; 3] = [FileFormat::Jpeg, FileFormat::Png, FileFormat::WebP];

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileFormat::Jpeg => SUPPORTED_MIME_TYPES[0],
            FileFormat::Png => SUPPORTED_MIME_TYPES[1],
            FileFormat::WebP => SUPPORTED_MIME_TYPES[2],
        }
    }

    /// Exact match against [`SUPPORTED_MIME_TYPES`].
    pub fn from_mime(mime: &str) -> Option<Self> {
        SUPPORTED_MIME_TYPES
            .iter()
            .position(|m| *m == mime)
            .map(|i| Self::ALL[i])
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

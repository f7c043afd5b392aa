//! Response contract: validate the model's reply into an [`ExtractionResult`].
//!
//! The reply is untrusted input. Before any field reaches the store we check
//! that every required field is present with the right type, that
//! `confidence` lies in `[0, 1]`, and that `educationLevel` is one of the
//! known grade levels. Anything else is a [`ExtractionError::MalformedResponse`]
//! carrying the raw payload for diagnostics.
//!
//! Two cheap cleanup rules run first, because models ignore "respond with
//! ONLY JSON" often enough to matter:
//! 1. Strip an outer ```` ```json ```` fence
//! 2. Strip invisible Unicode (BOM, zero-width spaces)

use crate::config::GradeLevel;
use crate::error::ExtractionError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Text returned by the mock extractor.
pub const MOCK_QUESTION_TEXT: &str = "A train travels 240 miles in 4 hours. If it continues at \
the same speed, how many miles will it travel in 7 hours?\n\nA) 360 miles\nB) 400 miles\n\
C) 420 miles\nD) 480 miles";

/// Outcome of one successful extraction call.
///
/// "Successful" means the model answered with a valid contract; the model
/// may still report that it found no question, via `error_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    /// Extracted question; empty when extraction failed.
    pub question_text: String,
    /// Model's confidence in `[0, 1]`.
    pub confidence: f64,
    /// True if answers, marks, or other questions were removed.
    pub noise_filtered: bool,
    /// Model-reported failure reason.
    pub error_message: Option<String>,
    /// Echo of the requested grade level.
    pub education_level: GradeLevel,
}

impl ExtractionResult {
    /// The fixed result served when no credential is configured.
    pub fn mock(grade: GradeLevel) -> Self {
        Self {
            question_text: MOCK_QUESTION_TEXT.to_string(),
            confidence: 0.95,
            noise_filtered: true,
            error_message: None,
            education_level: grade,
        }
    }

    /// A result recording that no question could be extracted.
    pub fn failed(message: impl Into<String>, grade: GradeLevel) -> Self {
        Self {
            question_text: String::new(),
            confidence: 0.0,
            noise_filtered: false,
            error_message: Some(message.into()),
            education_level: grade,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Wire shape; `errorMessage` may be omitted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResult {
    question_text: String,
    confidence: f64,
    noise_filtered: bool,
    #[serde(default)]
    error_message: Option<String>,
    education_level: String,
}

/// Parse and validate a non-empty model reply.
pub fn parse_extraction(raw: &str) -> Result<ExtractionResult, ExtractionError> {
    let malformed = |reason: String| ExtractionError::MalformedResponse {
        reason,
        raw: raw.to_string(),
    };

    let cleaned = remove_invisible_chars(raw);
    let cleaned = strip_json_fences(&cleaned);

    let wire: WireResult =
        serde_json::from_str(cleaned.trim()).map_err(|e| malformed(e.to_string()))?;

    if !wire.confidence.is_finite() || !(0.0..=1.0).contains(&wire.confidence) {
        return Err(malformed(format!(
            "confidence {} is outside [0, 1]",
            wire.confidence
        )));
    }

    let education_level = GradeLevel::parse(&wire.education_level).ok_or_else(|| {
        malformed(format!(
            "unknown educationLevel '{}'",
            wire.education_level
        ))
    })?;

    let error_message = wire
        .error_message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    Ok(ExtractionResult {
        question_text: wire.question_text.trim().to_string(),
        confidence: wire.confidence,
        noise_filtered: wire.noise_filtered,
        error_message,
        education_level,
    })
}

// ── Rule 1: Strip outer code fences ─────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*)\n\s*```\s*$").unwrap());

fn strip_json_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{"questionText":"What is 2+2?","confidence":0.9,"noiseFiltered":true,"errorMessage":null,"educationLevel":"middle"}"#;

    #[test]
    fn parses_valid_reply() {
        let r = parse_extraction(GOOD).unwrap();
        assert_eq!(r.question_text, "What is 2+2?");
        assert_eq!(r.confidence, 0.9);
        assert!(r.noise_filtered);
        assert_eq!(r.error_message, None);
        assert_eq!(r.education_level, GradeLevel::Middle);
    }

    #[test]
    fn strips_json_fence() {
        let fenced = format!("```json\n{GOOD}\n```");
        assert!(parse_extraction(&fenced).is_ok());
        let bare_fence = format!("```\n{GOOD}\n```\n");
        assert!(parse_extraction(&bare_fence).is_ok());
    }

    #[test]
    fn strips_bom() {
        let with_bom = format!("\u{FEFF}{GOOD}");
        assert!(parse_extraction(&with_bom).is_ok());
    }

    #[test]
    fn missing_error_message_means_none() {
        let raw = r#"{"questionText":"Q","confidence":1,"noiseFiltered":false,"educationLevel":"high"}"#;
        let r = parse_extraction(raw).unwrap();
        assert_eq!(r.error_message, None);
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn model_reported_failure_is_ok_with_message() {
        let raw = r#"{"questionText":"","confidence":0,"noiseFiltered":false,"errorMessage":"Image too blurry","educationLevel":"elementary"}"#;
        let r = parse_extraction(raw).unwrap();
        assert!(r.is_failure());
        assert_eq!(r.error_message.as_deref(), Some("Image too blurry"));
    }

    #[test]
    fn blank_error_message_normalised_to_none() {
        let raw = r#"{"questionText":"Q","confidence":0.5,"noiseFiltered":false,"errorMessage":"  ","educationLevel":"middle"}"#;
        assert_eq!(parse_extraction(raw).unwrap().error_message, None);
    }

    #[test]
    fn not_json_is_malformed_with_raw() {
        let err = parse_extraction("Sure! The question is: what is 2+2?").unwrap_err();
        assert_eq!(err.raw_payload(), Some("Sure! The question is: what is 2+2?"));
    }

    #[test]
    fn confidence_out_of_range_is_malformed() {
        let raw = r#"{"questionText":"Q","confidence":1.5,"noiseFiltered":true,"errorMessage":null,"educationLevel":"middle"}"#;
        let err = parse_extraction(raw).unwrap_err();
        assert!(err.to_string().contains("outside [0, 1]"), "got: {err}");
    }

    #[test]
    fn unknown_education_level_is_malformed() {
        let raw = r#"{"questionText":"Q","confidence":0.5,"noiseFiltered":true,"errorMessage":null,"educationLevel":"college"}"#;
        assert!(matches!(
            parse_extraction(raw),
            Err(ExtractionError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn wrong_types_are_malformed() {
        for raw in [
            r#"{"questionText":42,"confidence":0.5,"noiseFiltered":true,"educationLevel":"middle"}"#,
            r#"{"questionText":"Q","confidence":"high","noiseFiltered":true,"educationLevel":"middle"}"#,
            r#"{"questionText":"Q","confidence":0.5,"noiseFiltered":"yes","educationLevel":"middle"}"#,
            r#"{"questionText":"Q","confidence":0.5,"noiseFiltered":true}"#,
            r#"["not", "an", "object"]"#,
        ] {
            assert!(
                matches!(parse_extraction(raw), Err(ExtractionError::MalformedResponse { .. })),
                "accepted: {raw}"
            );
        }
    }

    #[test]
    fn mock_result_shape() {
        let r = ExtractionResult::mock(GradeLevel::High);
        assert_eq!(r.confidence, 0.95);
        assert!(r.noise_filtered);
        assert!(r.error_message.is_none());
        assert_eq!(r.education_level, GradeLevel::High);
        assert!(!r.question_text.is_empty());
    }

    #[test]
    fn serialises_camel_case() {
        let failed = ExtractionResult::failed("x", GradeLevel::Middle);
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"questionText\""));
        assert!(json.contains("\"errorMessage\":\"x\""));
        assert!(json.contains("\"educationLevel\":\"middle\""));
    }
}

//! Error types for the homework-lens library.
//!
//! One error enum per pipeline component, so callers can tell at a glance
//! which stage rejected the upload:
//!
//! * [`ValidationError`]: the file metadata was rejected before any I/O.
//! * [`EncodingError`]: the image could not be read or decoded.
//! * [`ExtractionError`]: the VLM call failed (after the retry policy ran).
//! * [`StoreError`]: the local question store refused or failed a mutation.
//!
//! [`LensError`] wraps all four so the session orchestrator can use `?`
//! across stage boundaries. Every `Display` message is written to be shown
//! to the student as-is.

use std::path::PathBuf;
use thiserror::Error;

/// The file was rejected by the validator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Declared MIME type is not JPEG, PNG or WebP.
    #[error("Unsupported file format '{mime_type}'. Please upload a JPEG, PNG, or WebP image.")]
    UnsupportedFormat { mime_type: String },

    /// File exceeds the 5 MiB upload limit. `size_mb` is rounded to 2 decimals.
    #[error("File too large: {size_mb:.2}MB. Maximum size is 5MB.")]
    TooLarge { size_mb: f64 },
}

/// The image could not be turned into a transportable encoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The file could not be read from disk.
    #[error("Failed to read image '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bytes are not a decodable image (or re-encoding failed).
    #[error("Failed to decode image: {detail}")]
    DecodeError { detail: String },
}

/// The question could not be extracted from the image.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    /// The VLM API rejected the credential (HTTP 401). Never retried.
    #[error("Invalid API key. Check your credentials and try again.")]
    InvalidCredentials,

    /// The model answered, but not with the agreed JSON contract. Never retried.
    #[error("Failed to parse extraction result: {reason}")]
    MalformedResponse { reason: String, raw: String },

    /// Every attempt hit a transient failure (429, 5xx, empty reply).
    #[error("Extraction failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The API returned a non-retryable HTTP status other than 401.
    #[error("Vision API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// The request never produced an HTTP status (DNS, TLS, timeout, …).
    #[error("Vision API request failed: {0}")]
    Request(String),

    /// The extraction client could not be constructed.
    #[error("Invalid extraction configuration: {0}")]
    Config(String),
}

impl ExtractionError {
    /// Raw model payload for diagnostics, when the failure was a parse error.
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            ExtractionError::MalformedResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// The local question store failed an operation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No record with this id exists.
    #[error("Question '{id}' not found")]
    NotFound { id: String },

    /// The backing store has no remaining capacity. In-memory state is kept.
    #[error("Storage quota exceeded. Delete some old questions to free up space.")]
    QuotaExceeded,

    /// A container with a different schema version is already persisted.
    #[error("Stored data uses schema version {found}, expected {expected}. Migration required.")]
    SchemaMigrationRequired { found: String, expected: String },

    /// Only records whose extraction did not fail may be confirmed.
    #[error("Question '{id}' cannot be confirmed because its extraction failed")]
    NotConfirmable { id: String },

    /// A confirmed record's extraction can no longer be replaced.
    #[error("Question '{id}' is already confirmed and cannot be re-extracted")]
    AlreadyConfirmed { id: String },

    /// Persisted container could not be parsed.
    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    /// Any other backend failure.
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Any error produced by the upload pipeline.
#[derive(Debug, Error)]
pub enum LensError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The session was asked to do something its current state doesn't allow.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

//! Upload validation: format first, then size.
//!
//! Runs on metadata only, before any bytes are decoded or sent anywhere.
//! The order matters: a 20 MB PDF reports "unsupported format", not
//! "too large".

use crate::config::{FileFormat, MAX_FILE_SIZE};
use crate::error::ValidationError;
use tracing::debug;

/// What the validator needs to know about an incoming file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Original file name, for messages only.
    pub name: String,
    /// Declared MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size,
        }
    }
}

/// Check a file's declared format and size.
///
/// Returns the parsed [`FileFormat`] on success so later stages don't have
/// to re-derive it from the MIME string.
pub fn validate(file: &FileDescriptor) -> Result<FileFormat, ValidationError> {
    let format = FileFormat::from_mime(&file.mime_type).ok_or_else(|| {
        debug!("Rejected '{}': unsupported type {}", file.name, file.mime_type);
        ValidationError::UnsupportedFormat {
            mime_type: file.mime_type.clone(),
        }
    })?;

    if file.size > MAX_FILE_SIZE {
        debug!("Rejected '{}': {} bytes", file.name, file.size);
        return Err(ValidationError::TooLarge {
            size_mb: size_in_mb(file.size),
        });
    }

    Ok(format)
}

/// Bytes → MiB, rounded to two decimals.
fn size_in_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}

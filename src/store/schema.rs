//! Persisted data model: the versioned container and its question records.
//!
//! The whole store is one JSON document:
//!
//! ```text
//! { "version": "1.0.0",
//!   "questions": { "<id>": QuestionRecord, … },
//!   "metadata": { "createdAt", "lastModified", "totalQuestions" } }
//! ```
//!
//! Field names are camelCase on the wire.

use crate::config::{FileFormat, GradeLevel};
use crate::pipeline::response::ExtractionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Current schema version. A stored container with any other version is
/// refused rather than migrated.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Backend key under which the container is stored.
pub const STORAGE_KEY: &str = "homework-lens.questions";

/// Quota assumed when the backend cannot report one: 5 MiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Success,
    Failed,
}

impl ProcessingStatus {
    /// `Failed` iff the extraction reported an error, else `Pending`.
    pub fn from_extraction(result: &ExtractionResult) -> Self {
        if result.error_message.is_some() {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Success => "success",
            ProcessingStatus::Failed => "failed",
        }
    }
}

/// The uploaded image as stored alongside the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    /// Data URL of the image.
    pub data: String,
    /// Size of the original upload in bytes.
    pub file_size: u64,
    pub file_format: FileFormat,
}

/// One extracted (and possibly confirmed) question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
    pub id: String,
    pub image: StoredImage,
    pub extracted_text: String,
    pub confidence: f64,
    pub noise_filtered: bool,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub upload_timestamp: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_level: Option<GradeLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl QuestionRecord {
    /// Build an unconfirmed record with a fresh id.
    pub fn new(image: StoredImage, result: &ExtractionResult, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            image,
            extracted_text: result.question_text.clone(),
            confidence: result.confidence,
            noise_filtered: result.noise_filtered,
            processing_status: ProcessingStatus::from_extraction(result),
            error_message: result.error_message.clone(),
            upload_timestamp: now,
            confirmed_at: None,
            grade_level: Some(result.education_level),
            subject: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetadata {
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub total_questions: usize,
}

/// Everything the store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub version: String,
    pub questions: HashMap<String, QuestionRecord>,
    pub metadata: ContainerMetadata,
}

impl Container {
    /// Empty container at the current schema version.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            questions: HashMap::new(),
            metadata: ContainerMetadata {
                created_at: now,
                last_modified: now,
                total_questions: 0,
            },
        }
    }

    /// Mark the container modified and resync the count.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata.last_modified = now;
        self.metadata.total_questions = self.questions.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> StoredImage {
        StoredImage {
            data: "data:image/png;base64,AA==".into(),
            file_size: 1,
            file_format: FileFormat::Png,
        }
    }

    #[test]
    fn status_follows_error_message() {
        let ok = ExtractionResult::mock(GradeLevel::Middle);
        let bad = ExtractionResult::failed("blurry", GradeLevel::Middle);
        assert_eq!(ProcessingStatus::from_extraction(&ok), ProcessingStatus::Pending);
        assert_eq!(ProcessingStatus::from_extraction(&bad), ProcessingStatus::Failed);
    }

    #[test]
    fn new_records_get_distinct_ids() {
        let r = ExtractionResult::mock(GradeLevel::Middle);
        let now = Utc::now();
        let a = QuestionRecord::new(image(), &r, now);
        let b = QuestionRecord::new(image(), &r, now);
        assert_ne!(a.id, b.id);
        assert!(a.confirmed_at.is_none());
        assert_eq!(a.grade_level, Some(GradeLevel::Middle));
    }

    #[test]
    fn container_wire_format() {
        let now = Utc::now();
        let mut c = Container::new(now);
        let rec = QuestionRecord::new(image(), &ExtractionResult::mock(GradeLevel::High), now);
        let id = rec.id.clone();
        c.questions.insert(id.clone(), rec);
        c.touch(now);

        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["version"], SCHEMA_VERSION);
        assert_eq!(v["metadata"]["totalQuestions"], 1);
        let q = &v["questions"][&id];
        assert_eq!(q["processingStatus"], "pending");
        assert_eq!(q["image"]["fileFormat"], "image/png");
        assert_eq!(q["confirmedAt"], serde_json::Value::Null);
        assert_eq!(q["gradeLevel"], "high");

        let back: Container = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }
}

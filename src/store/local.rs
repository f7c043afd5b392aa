//! CRUD over the versioned question container.
//!
//! Every mutation updates the record, `lastModified` and `totalQuestions`
//! together in memory, then writes the whole container through the backend.
//! If that write fails, the in-memory change is kept: the caller gets the
//! error and may call [`LocalStore::persist`] again later, or
//! [`LocalStore::reload`] to throw the change away.
//!
//! There is no cross-process locking. Two stores over the same backend race
//! and the last write wins.

use super::schema::{
    Container, ProcessingStatus, QuestionRecord, StoredImage, DEFAULT_QUOTA_BYTES,
    SCHEMA_VERSION, STORAGE_KEY,
};
use super::{BackendError, StorageBackend};
use crate::config::{FileFormat, GradeLevel};
use crate::error::StoreError;
use crate::pipeline::response::ExtractionResult;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Read-only usage summary. Derived, not authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetrics {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub confirmed: usize,
    /// Size of the serialised container in bytes.
    pub estimated_bytes: u64,
    /// Quota used for the percentage: the backend's, or [`DEFAULT_QUOTA_BYTES`].
    pub quota_bytes: u64,
    pub usage_percent: f64,
}

/// The question store.
pub struct LocalStore<B: StorageBackend> {
    backend: B,
    container: Container,
}

impl<B: StorageBackend> LocalStore<B> {
    /// Load the persisted container, or create and persist an empty one.
    ///
    /// # Errors
    /// [`StoreError::SchemaMigrationRequired`] when a container with another
    /// version exists; [`StoreError::Corrupt`] when it isn't valid JSON.
    pub async fn initialize(backend: B) -> Result<Self, StoreError> {
        match load(&backend).await? {
            Some(container) => {
                info!(
                    "Loaded question store ({} questions)",
                    container.questions.len()
                );
                Ok(Self { backend, container })
            }
            None => {
                let store = Self {
                    backend,
                    container: Container::new(Utc::now()),
                };
                store.persist().await?;
                info!("Created empty question store");
                Ok(store)
            }
        }
    }

    /// Current in-memory container, including any unpersisted change.
    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Insert a new unconfirmed record and return its id.
    ///
    /// Status is `failed` if `result` carries an error message, else `pending`.
    /// The grade level is taken from the extraction's echo.
    pub async fn create(
        &mut self,
        image_data_url: impl Into<String>,
        file_size: u64,
        file_format: FileFormat,
        result: &ExtractionResult,
    ) -> Result<String, StoreError> {
        let now = Utc::now();
        let record = QuestionRecord::new(
            StoredImage {
                data: image_data_url.into(),
                file_size,
                file_format,
            },
            result,
            now,
        );
        let id = record.id.clone();
        debug!("Creating question {} ({})", id, record.processing_status.as_str());

        self.container.questions.insert(id.clone(), record);
        self.container.touch(now);
        self.persist().await?;
        Ok(id)
    }

    /// Insert a record that is confirmed from the start, in a single write.
    ///
    /// Used when the user accepts an extraction that was never stored, so a
    /// failed write cannot leave a pending copy behind. Failed extractions
    /// are refused before anything changes.
    pub async fn create_confirmed(
        &mut self,
        image_data_url: impl Into<String>,
        file_size: u64,
        file_format: FileFormat,
        result: &ExtractionResult,
        subject: Option<String>,
    ) -> Result<String, StoreError> {
        let now = Utc::now();
        let mut record = QuestionRecord::new(
            StoredImage {
                data: image_data_url.into(),
                file_size,
                file_format,
            },
            result,
            now,
        );
        if record.processing_status == ProcessingStatus::Failed {
            return Err(StoreError::NotConfirmable { id: record.id });
        }
        record.confirmed_at = Some(now);
        record.processing_status = ProcessingStatus::Success;
        record.subject = subject.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let id = record.id.clone();
        self.container.questions.insert(id.clone(), record);
        self.container.touch(now);
        info!("Created confirmed question {}", id);
        self.persist().await?;
        Ok(id)
    }

    /// All records, oldest upload first.
    pub fn get_all(&self) -> Vec<QuestionRecord> {
        let mut all: Vec<QuestionRecord> = self.container.questions.values().cloned().collect();
        all.sort_by(|a, b| {
            a.upload_timestamp
                .cmp(&b.upload_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn get_by_id(&self, id: &str) -> Result<&QuestionRecord, StoreError> {
        self.container
            .questions
            .get(id)
            .ok_or_else(|| not_found(id))
    }

    /// Mark a record as confirmed by the user.
    ///
    /// Confirming twice just moves `confirmedAt` forward. Records whose
    /// extraction failed cannot be confirmed.
    pub async fn confirm(&mut self, id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let record = self
            .container
            .questions
            .get_mut(id)
            .ok_or_else(|| not_found(id))?;
        if record.processing_status == ProcessingStatus::Failed {
            return Err(StoreError::NotConfirmable { id: id.to_string() });
        }
        record.confirmed_at = Some(now);
        record.processing_status = ProcessingStatus::Success;

        self.container.touch(now);
        info!("Confirmed question {}", id);
        self.persist().await
    }

    /// Replace a record's extraction fields and recompute its status.
    ///
    /// Only unconfirmed records can be updated; a confirmed record keeps the
    /// text the user accepted.
    pub async fn update_extraction(
        &mut self,
        id: &str,
        result: &ExtractionResult,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let record = self
            .container
            .questions
            .get_mut(id)
            .ok_or_else(|| not_found(id))?;
        if record.is_confirmed() {
            return Err(StoreError::AlreadyConfirmed { id: id.to_string() });
        }
        record.extracted_text = result.question_text.clone();
        record.confidence = result.confidence;
        record.noise_filtered = result.noise_filtered;
        record.error_message = result.error_message.clone();
        record.processing_status = ProcessingStatus::from_extraction(result);

        self.container.touch(now);
        debug!("Updated extraction for {}", id);
        self.persist().await
    }

    /// Set the contextual tags of a record.
    pub async fn tag(
        &mut self,
        id: &str,
        grade_level: Option<GradeLevel>,
        subject: Option<String>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let record = self
            .container
            .questions
            .get_mut(id)
            .ok_or_else(|| not_found(id))?;
        record.grade_level = grade_level;
        record.subject = subject.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        self.container.touch(now);
        self.persist().await
    }

    pub async fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        if self.container.questions.remove(id).is_none() {
            return Err(not_found(id));
        }
        self.container.touch(Utc::now());
        info!("Deleted question {}", id);
        self.persist().await
    }

    /// Remove every record. The container itself (and `createdAt`) survive.
    pub async fn clear_all(&mut self) -> Result<(), StoreError> {
        let removed = self.container.questions.len();
        self.container.questions.clear();
        self.container.touch(Utc::now());
        info!("Cleared {} questions", removed);
        self.persist().await
    }

    /// Counts by status plus an estimate of storage usage.
    pub async fn metrics(&self) -> Result<StoreMetrics, StoreError> {
        let questions = self.container.questions.values();
        let (mut pending, mut success, mut failed, mut confirmed) = (0, 0, 0, 0);
        for q in questions {
            match q.processing_status {
                ProcessingStatus::Pending => pending += 1,
                ProcessingStatus::Success => success += 1,
                ProcessingStatus::Failed => failed += 1,
            }
            if q.is_confirmed() {
                confirmed += 1;
            }
        }

        let estimated_bytes = serialise(&self.container)?.len() as u64;
        let quota_bytes = self
            .backend
            .estimate_quota()
            .await
            .filter(|q| *q > 0)
            .unwrap_or(DEFAULT_QUOTA_BYTES);
        let usage_percent =
            (estimated_bytes as f64 / quota_bytes as f64 * 10_000.0).round() / 100.0;

        Ok(StoreMetrics {
            total: self.container.questions.len(),
            pending,
            success,
            failed,
            confirmed,
            estimated_bytes,
            quota_bytes,
            usage_percent,
        })
    }

    /// Write the in-memory container through the backend.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let json = serialise(&self.container)?;
        match self.backend.set(STORAGE_KEY, &json).await {
            Ok(()) => Ok(()),
            Err(BackendError::QuotaExceeded) => {
                warn!("Storage quota exceeded writing {} bytes", json.len());
                Err(StoreError::QuotaExceeded)
            }
            Err(BackendError::Other(msg)) => {
                warn!("Storage write failed: {}", msg);
                Err(StoreError::Backend(msg))
            }
        }
    }

    /// Drop in-memory state and re-read the backend.
    pub async fn reload(&mut self) -> Result<(), StoreError> {
        self.container = load(&self.backend)
            .await?
            .unwrap_or_else(|| Container::new(Utc::now()));
        Ok(())
    }
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound { id: id.to_string() }
}

fn serialise(container: &Container) -> Result<String, StoreError> {
    serde_json::to_string(container).map_err(|e| StoreError::Backend(e.to_string()))
}

/// Read and version-check the persisted container.
async fn load<B: StorageBackend>(backend: &B) -> Result<Option<Container>, StoreError> {
    let raw = match backend.get(STORAGE_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(None),
        Err(BackendError::QuotaExceeded) => return Err(StoreError::QuotaExceeded),
        Err(BackendError::Other(msg)) => return Err(StoreError::Backend(msg)),
    };

    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let version = value
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or("<missing>");
    if version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMigrationRequired {
            found: version.to_string(),
            expected: SCHEMA_VERSION.to_string(),
        });
    }

    let mut container: Container =
        serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    container.metadata.total_questions = container.questions.len();
    Ok(Some(container))
}

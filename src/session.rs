//! Upload session: validate → encode → extract → review → confirm or retry.
//!
//! An [`UploadSession`] holds at most one candidate at a time. The candidate
//! lives only in memory until the user confirms it; only then is it written
//! to the [`LocalStore`]. Retrying re-runs extraction on the already encoded
//! image.
//!
//! ```text
//! Idle ──start──▶ AwaitingDecision ──confirm──▶ Saved
//!   ▲                 │   ▲    │
//!   │                 │   └────┘ retry
//!   │                 └──discard──▶ Discarded
//!   └── any stage error ──▶ Failed
//! ```
//!
//! Stages run strictly in order and a session never has two extractions in
//! flight: every transition takes `&mut self`.

use crate::config::{CompressionConfig, FileFormat, GradeLevel};
use crate::error::{LensError, StoreError};
use crate::pipeline::encode::{compress_async, decode_data_url, encode};
use crate::pipeline::input::ImageFile;
use crate::pipeline::llm::QuestionExtractor;
use crate::pipeline::response::ExtractionResult;
use crate::pipeline::validate::validate;
use crate::progress::{NoopObserver, ObserverHandle, SessionStage};
use crate::store::{LocalStore, StorageBackend};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An extraction waiting for the user's decision.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub file_name: String,
    /// Original upload as a data URL; what was sent to the model.
    pub image_data_url: String,
    pub file_size: u64,
    pub file_format: FileFormat,
    pub grade_level: GradeLevel,
    pub result: ExtractionResult,
}

impl Candidate {
    /// Whether the extraction produced a question that may be saved.
    pub fn is_confirmable(&self) -> bool {
        !self.result.is_failure()
    }
}

/// Where a session is.
#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    AwaitingDecision(Box<Candidate>),
    Saved { id: String },
    Discarded,
    Failed { error: String },
}

/// Drives one upload from file to stored question.
pub struct UploadSession {
    extractor: Arc<dyn QuestionExtractor>,
    observer: ObserverHandle,
    compression: Option<CompressionConfig>,
    state: SessionState,
}

impl UploadSession {
    pub fn new(extractor: Arc<dyn QuestionExtractor>) -> Self {
        Self {
            extractor,
            observer: Arc::new(NoopObserver),
            compression: None,
            state: SessionState::Idle,
        }
    }

    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = observer;
        self
    }

    /// Store a downscaled JPEG instead of the original upload on confirm.
    pub fn with_compression(mut self, config: CompressionConfig) -> Self {
        self.compression = Some(config);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        match &self.state {
            SessionState::AwaitingDecision(c) => Some(c),
            _ => None,
        }
    }

    /// Run validation, encoding and extraction for a new upload.
    ///
    /// Not allowed while a previous candidate awaits a decision.
    pub async fn start(
        &mut self,
        file: ImageFile,
        grade: GradeLevel,
    ) -> Result<&Candidate, LensError> {
        if self.candidate().is_some() {
            return Err(LensError::InvalidState(
                "a question is already awaiting confirmation".into(),
            ));
        }

        let outcome = self.run_pipeline(file, grade).await;
        match outcome {
            Ok(candidate) => {
                self.observer.on_stage(SessionStage::AwaitingDecision);
                self.state = SessionState::AwaitingDecision(Box::new(candidate));
                self.candidate()
                    .ok_or_else(|| LensError::Internal("candidate vanished".into()))
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        file: ImageFile,
        grade: GradeLevel,
    ) -> Result<Candidate, LensError> {
        self.observer.on_stage(SessionStage::Validating);
        let file_format = validate(&file.descriptor())?;

        self.observer.on_stage(SessionStage::Encoding);
        let image_data_url = encode(&file);

        self.observer.on_stage(SessionStage::Extracting);
        let result = self
            .extractor
            .extract_observed(&image_data_url, grade, self.observer.as_ref())
            .await?;
        self.observer.on_extracted(&result);
        info!(
            "Extracted '{}' (confidence {:.2}, error: {:?})",
            file.name, result.confidence, result.error_message
        );

        Ok(Candidate {
            file_name: file.name.clone(),
            file_size: file.size(),
            image_data_url,
            file_format,
            grade_level: grade,
            result,
        })
    }

    /// Re-run extraction on the pending candidate's image.
    ///
    /// On failure the previous candidate is kept, so the user can retry
    /// again or discard.
    pub async fn retry(&mut self) -> Result<&Candidate, LensError> {
        let (image, grade) = match self.candidate() {
            Some(c) => (c.image_data_url.clone(), c.grade_level),
            None => return Err(LensError::InvalidState("nothing to retry".into())),
        };

        self.observer.on_stage(SessionStage::Extracting);
        let outcome = self
            .extractor
            .extract_observed(&image, grade, self.observer.as_ref())
            .await;
        let result = match outcome {
            Ok(r) => r,
            Err(e) => {
                let e = LensError::from(e);
                self.observer.on_error(&e.to_string());
                self.observer.on_stage(SessionStage::AwaitingDecision);
                return Err(e);
            }
        };
        self.observer.on_extracted(&result);

        if let SessionState::AwaitingDecision(c) = &mut self.state {
            c.result = result;
        }
        self.observer.on_stage(SessionStage::AwaitingDecision);
        self.candidate()
            .ok_or_else(|| LensError::Internal("candidate vanished".into()))
    }

    /// Persist the candidate as a confirmed question and return its id.
    ///
    /// The record is written once, already confirmed. On a storage failure
    /// (typically [`StoreError::QuotaExceeded`]) the unwritten change is
    /// discarded from the store and the candidate is kept, so confirming
    /// again after freeing space works and discarding leaves nothing behind.
    pub async fn confirm<B: StorageBackend>(
        &mut self,
        store: &mut LocalStore<B>,
        subject: Option<String>,
    ) -> Result<String, LensError> {
        let candidate = self
            .candidate()
            .cloned()
            .ok_or_else(|| LensError::InvalidState("nothing to confirm".into()))?;
        if !candidate.is_confirmable() {
            return Err(LensError::InvalidState(
                "extraction failed; retry or discard this question".into(),
            ));
        }

        self.observer.on_stage(SessionStage::Saving);

        let (image, format) = match self.compression {
            Some(cfg) => {
                let (mime, bytes) = decode_data_url(&candidate.image_data_url)?;
                let file = ImageFile::from_bytes(candidate.file_name.clone(), mime, bytes);
                let small = compress_async(&file, cfg).await?;
                debug!(
                    "Compressed {} to {}x{} ({} bytes)",
                    candidate.file_name, small.width, small.height, small.byte_len
                );
                (small.data_url, FileFormat::Jpeg)
            }
            None => (candidate.image_data_url.clone(), candidate.file_format),
        };

        let saved = store
            .create_confirmed(image, candidate.file_size, format, &candidate.result, subject)
            .await;
        let id = match saved {
            Ok(id) => id,
            Err(e) => return Err(self.storage_failure(store, e).await),
        };

        info!("Saved question {}", id);
        self.state = SessionState::Saved { id: id.clone() };
        Ok(id)
    }

    /// Drop the pending candidate without saving it.
    pub fn discard(&mut self) -> Option<Candidate> {
        match std::mem::replace(&mut self.state, SessionState::Discarded) {
            SessionState::AwaitingDecision(c) => Some(*c),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Return to `Idle` from any finished state.
    pub fn reset(&mut self) {
        if self.candidate().is_none() {
            self.state = SessionState::Idle;
        }
    }

    fn fail(&mut self, e: &LensError) {
        let msg = e.to_string();
        warn!("Upload session failed: {}", msg);
        self.observer.on_error(&msg);
        self.state = SessionState::Failed { error: msg };
    }

    async fn storage_failure<B: StorageBackend>(
        &self,
        store: &mut LocalStore<B>,
        e: StoreError,
    ) -> LensError {
        warn!("Saving question failed: {}", e);
        if let Err(reload_err) = store.reload().await {
            warn!("Could not discard unsaved changes: {}", reload_err);
        }
        self.observer.on_error(&e.to_string());
        self.observer.on_stage(SessionStage::AwaitingDecision);
        LensError::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;
    use crate::pipeline::llm::MockExtractor;
    use crate::progress::SessionObserver;
    use crate::store::{Container, MemoryBackend, ProcessingStatus, STORAGE_KEY};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn png_file() -> ImageFile {
        ImageFile::from_bytes("q.png", "image/png", vec![0x89, b'P', b'N', b'G'])
    }

    fn mock() -> Arc<dyn QuestionExtractor> {
        Arc::new(MockExtractor::new(Duration::from_millis(0)))
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuestionExtractor for Flaky {
        async fn extract_observed(
            &self,
            _image: &str,
            grade: GradeLevel,
            _observer: &dyn SessionObserver,
        ) -> Result<ExtractionResult, ExtractionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Ok(ExtractionResult::failed("no question found", grade))
            } else {
                Ok(ExtractionResult::mock(grade))
            }
        }
    }

    #[derive(Default)]
    struct Stages(Mutex<Vec<SessionStage>>);

    impl SessionObserver for Stages {
        fn on_stage(&self, stage: SessionStage) {
            self.0.lock().unwrap().push(stage);
        }
    }

    #[tokio::test]
    async fn happy_path_saves_confirmed_record() {
        let mut store = LocalStore::initialize(MemoryBackend::new()).await.unwrap();
        let stages = Arc::new(Stages::default());
        let mut session = UploadSession::new(mock()).with_observer(stages.clone());

        let c = session.start(png_file(), GradeLevel::Middle).await.unwrap();
        assert!(c.is_confirmable());
        assert!(store.get_all().is_empty(), "nothing stored before confirm");

        let id = session.confirm(&mut store, Some("Math".into())).await.unwrap();
        let rec = store.get_by_id(&id).unwrap();
        assert_eq!(rec.processing_status, ProcessingStatus::Success);
        assert!(rec.confirmed_at.is_some());
        assert_eq!(rec.subject.as_deref(), Some("Math"));
        assert!(matches!(session.state(), SessionState::Saved { .. }));

        assert_eq!(
            *stages.0.lock().unwrap(),
            vec![
                SessionStage::Validating,
                SessionStage::Encoding,
                SessionStage::Extracting,
                SessionStage::AwaitingDecision,
                SessionStage::Saving,
            ]
        );
    }

    #[tokio::test]
    async fn validation_error_fails_session() {
        let mut session = UploadSession::new(mock());
        let pdf = ImageFile::from_bytes("q.pdf", "application/pdf", vec![1, 2, 3]);
        let err = session.start(pdf, GradeLevel::Middle).await.unwrap_err();
        assert!(matches!(err, LensError::Validation(_)));
        assert!(matches!(session.state(), SessionState::Failed { .. }));
    }

    #[tokio::test]
    async fn retry_replaces_failed_candidate() {
        let flaky = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let mut store = LocalStore::initialize(MemoryBackend::new()).await.unwrap();
        let mut session = UploadSession::new(flaky.clone());

        let c = session.start(png_file(), GradeLevel::High).await.unwrap();
        assert!(!c.is_confirmable());
        assert!(matches!(
            session.confirm(&mut store, None).await,
            Err(LensError::InvalidState(_))
        ));

        let c = session.retry().await.unwrap();
        assert!(c.is_confirmable());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        session.confirm(&mut store, None).await.unwrap();
        assert_eq!(store.get_all().len(), 1);
    }

    #[tokio::test]
    async fn start_refused_while_candidate_pending() {
        let mut session = UploadSession::new(mock());
        session.start(png_file(), GradeLevel::Middle).await.unwrap();
        assert!(matches!(
            session.start(png_file(), GradeLevel::Middle).await,
            Err(LensError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn discard_drops_candidate() {
        let mut session = UploadSession::new(mock());
        session.start(png_file(), GradeLevel::Middle).await.unwrap();
        assert!(session.discard().is_some());
        assert!(matches!(session.state(), SessionState::Discarded));
        assert!(session.discard().is_none());
        session.reset();
        assert!(matches!(session.state(), SessionState::Idle));
    }

    #[tokio::test]
    async fn compression_stores_downscaled_jpeg() {
        let img = image::RgbImage::from_pixel(2400, 600, image::Rgb([200, 10, 10]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let file = ImageFile::from_bytes("wide.png", "image/png", buf.into_inner());

        let mut store = LocalStore::initialize(MemoryBackend::new()).await.unwrap();
        let mut session = UploadSession::new(mock()).with_compression(CompressionConfig::default());
        session.start(file, GradeLevel::Elementary).await.unwrap();
        let id = session.confirm(&mut store, None).await.unwrap();

        let rec = store.get_by_id(&id).unwrap();
        assert_eq!(rec.image.file_format, FileFormat::Jpeg);
        assert!(rec.image.data.starts_with("data:image/jpeg;base64,"));
        let (_, bytes) = decode_data_url(&rec.image.data).unwrap();
        let stored = image::load_from_memory(&bytes).unwrap();
        assert_eq!((stored.width(), stored.height()), (1200, 300));
    }

    /// A store with one pending filler record and just enough room left for
    /// that record to be rewritten, but not for a second one.
    async fn nearly_full_store() -> (LocalStore<MemoryBackend>, String) {
        let image = encode(&png_file());
        let filler = ExtractionResult::mock(GradeLevel::Middle);

        let mut sizing = LocalStore::initialize(MemoryBackend::new()).await.unwrap();
        sizing
            .create(image.clone(), 4, FileFormat::Png, &filler)
            .await
            .unwrap();
        let one_record = sizing.backend().raw(STORAGE_KEY).unwrap().len() as u64;

        let mut store = LocalStore::initialize(MemoryBackend::with_capacity(one_record + 150))
            .await
            .unwrap();
        let id = store
            .create(image, 4, FileFormat::Png, &filler)
            .await
            .unwrap();
        (store, id)
    }

    fn persisted(store: &LocalStore<MemoryBackend>) -> Container {
        serde_json::from_str(&store.backend().raw(STORAGE_KEY).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn failed_save_then_discard_leaves_nothing_behind() {
        let (mut store, filler) = nearly_full_store().await;
        let mut session = UploadSession::new(mock());
        session.start(png_file(), GradeLevel::Middle).await.unwrap();

        let err = session.confirm(&mut store, Some("Math".into())).await.unwrap_err();
        assert!(matches!(err, LensError::Store(StoreError::QuotaExceeded)));
        assert!(session.discard().is_some());

        assert_eq!(store.get_all().len(), 1);
        assert!(store.get_by_id(&filler).is_ok());
        let on_disk = persisted(&store);
        assert_eq!(on_disk.questions.len(), 1);
        assert!(on_disk.questions.contains_key(&filler));
    }

    #[tokio::test]
    async fn confirm_again_after_freeing_space_saves_once() {
        let (mut store, filler) = nearly_full_store().await;
        let mut session = UploadSession::new(mock());
        session.start(png_file(), GradeLevel::Middle).await.unwrap();

        assert!(session.confirm(&mut store, None).await.is_err());
        assert!(session.candidate().is_some());

        store.delete(&filler).await.unwrap();
        let id = session.confirm(&mut store, None).await.unwrap();

        let all = store.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].processing_status, ProcessingStatus::Success);
        assert!(all[0].confirmed_at.is_some());
        let on_disk = persisted(&store);
        assert_eq!(on_disk.questions.len(), 1);
        assert_eq!(on_disk.metadata.total_questions, 1);
    }

    #[tokio::test]
    async fn quota_failure_keeps_candidate_and_store_clean() {
        let empty_len = serde_json::to_string(&Container::new(chrono::Utc::now()))
            .unwrap()
            .len() as u64;
        let mut store = LocalStore::initialize(MemoryBackend::with_capacity(empty_len + 40))
            .await
            .unwrap();
        let mut session = UploadSession::new(mock());
        session.start(png_file(), GradeLevel::Middle).await.unwrap();

        let err = session.confirm(&mut store, None).await.unwrap_err();
        assert!(matches!(err, LensError::Store(StoreError::QuotaExceeded)));
        assert!(session.candidate().is_some());
        assert!(store.get_all().is_empty());
    }
}

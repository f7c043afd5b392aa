//! # homework-lens
//!
//! Turn a photo of a homework page into one clean question.
//!
//! ## Why this crate?
//!
//! Photos of worksheets are noisy: handwritten answers, crossed-out work,
//! page numbers, neighbouring exercises. Plain OCR returns all of it. This
//! crate sends the image to a Vision Language Model with instructions to keep
//! only the first complete question, validates what comes back, and keeps the
//! user-confirmed questions in a local store.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Photo
//!  │
//!  ├─ 1. Validate  MIME type (JPEG / PNG / WebP) and 5 MB size limit
//!  ├─ 2. Encode    bytes → data URL (optional JPEG downscale for storage)
//!  ├─ 3. Extract   VLM chat completion with retry/backoff, or offline mock
//!  ├─ 4. Review    candidate held in memory until the user decides
//!  └─ 5. Store     confirmed question persisted as versioned JSON
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use homework_lens::{
//!     build_extractor, ExtractionConfig, FileBackend, GradeLevel, ImageFile, LocalStore,
//!     UploadSession,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // No API key: the offline mock extractor is used.
//!     let config = ExtractionConfig::builder()
//!         .api_key_opt(std::env::var("OPENAI_API_KEY").ok())
//!         .build()?;
//!     let extractor = build_extractor(&config)?;
//!
//!     let mut store = LocalStore::initialize(FileBackend::new("./questions")).await?;
//!     let mut session = UploadSession::new(extractor);
//!
//!     let photo = ImageFile::read("worksheet.jpg").await?;
//!     let candidate = session.start(photo, GradeLevel::Middle).await?;
//!     println!("{}", candidate.result.question_text);
//!
//!     let id = session.confirm(&mut store, Some("Math".into())).await?;
//!     println!("saved as {id}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `hwlens` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! homework-lens = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CompressionConfig, ExtractionConfig, ExtractionConfigBuilder, FileFormat, GradeLevel,
};
pub use error::{EncodingError, ExtractionError, LensError, StoreError, ValidationError};
pub use pipeline::encode::{compress, compress_async, encode, CompressedImage};
pub use pipeline::input::ImageFile;
pub use pipeline::llm::{build_extractor, MockExtractor, QuestionExtractor, VisionExtractor};
pub use pipeline::response::ExtractionResult;
pub use pipeline::validate::{validate, FileDescriptor};
pub use progress::{SessionObserver, SessionStage};
pub use session::{Candidate, SessionState, UploadSession};
pub use store::{
    FileBackend, LocalStore, MemoryBackend, NullBackend, ProcessingStatus, QuestionRecord,
    StorageBackend, StoreMetrics,
};

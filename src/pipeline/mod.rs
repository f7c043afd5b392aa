//! Pipeline stages for homework question extraction.
//!
//! Each submodule implements exactly one step, so each can be tested
//! without the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ validate ──▶ encode ──▶ llm ──▶ response
//! (file)    (metadata)   (data URL) (VLM)  (JSON contract)
//! ```
//!
//! 1. [`input`]:    read an image from disk with its declared MIME type
//! 2. [`validate`]: reject unsupported formats and oversized files; pure
//! 3. [`encode`]:   base64 data URL; optional JPEG downscale for storage
//! 4. [`llm`]:      build the vision request and drive the retry policy;
//!    the only stage with network I/O
//! 5. [`response`]: treat the model reply as untrusted input and validate
//!    it into an [`response::ExtractionResult`]

pub mod encode;
pub mod input;
pub mod llm;
pub mod response;
pub mod validate;

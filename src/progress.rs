//! Observer trait for upload-session events.
//!
//! Inject an [`Arc<dyn SessionObserver>`] into
//! [`crate::session::UploadSession::with_observer`] to follow a session as it
//! moves through validation, encoding and extraction. The CLI uses it to
//! drive a spinner; a GUI could forward the same events to its view layer.
//!
//! # Example
//!
//! ```rust
//! use homework_lens::progress::{SessionObserver, SessionStage};
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! struct RetryCounter(AtomicU32);
//!
//! impl SessionObserver for RetryCounter {
//!     fn on_retry(&self, attempt: u32, delay_ms: u64) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("retry {attempt} in {delay_ms}ms");
//!     }
//! }
//! ```

use crate::pipeline::response::ExtractionResult;
use std::fmt;
use std::sync::Arc;

/// Where an upload session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Validating,
    Encoding,
    Extracting,
    AwaitingDecision,
    Saving,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStage::Validating => "Validating",
            SessionStage::Encoding => "Encoding",
            SessionStage::Extracting => "Extracting",
            SessionStage::AwaitingDecision => "Review",
            SessionStage::Saving => "Saving",
        };
        f.write_str(s)
    }
}

/// Called by the session as it processes an upload.
///
/// All methods default to no-ops so implementors override only what they
/// need.
pub trait SessionObserver: Send + Sync {
    /// A new stage has started.
    fn on_stage(&self, stage: SessionStage) {
        let _ = stage;
    }

    /// An extraction request is about to be sent (1-based).
    fn on_attempt(&self, attempt: u32, max_attempts: u32) {
        let _ = (attempt, max_attempts);
    }

    /// Attempt `attempt` failed transiently; the next one starts after `delay_ms`.
    fn on_retry(&self, attempt: u32, delay_ms: u64) {
        let _ = (attempt, delay_ms);
    }

    /// Extraction finished with a valid result (which may carry a model error).
    fn on_extracted(&self, result: &ExtractionResult) {
        let _ = result;
    }

    /// The session failed; `error` is display-ready.
    fn on_error(&self, error: &str) {
        let _ = error;
    }
}

/// Observer that ignores every event. The default.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Shared observer handle.
pub type ObserverHandle = Arc<dyn SessionObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GradeLevel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recorder {
        fn on_stage(&self, stage: SessionStage) {
            self.events.lock().unwrap().push(format!("stage:{stage}"));
        }

        fn on_retry(&self, attempt: u32, delay_ms: u64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("retry:{attempt}:{delay_ms}"));
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let o = NoopObserver;
        o.on_stage(SessionStage::Validating);
        o.on_attempt(1, 3);
        o.on_retry(1, 1000);
        o.on_extracted(&ExtractionResult::mock(GradeLevel::Middle));
        o.on_error("boom");
    }

    #[test]
    fn recorder_sees_overridden_events_only() {
        let r = Recorder::default();
        r.on_stage(SessionStage::Extracting);
        r.on_attempt(1, 3);
        r.on_retry(1, 1000);
        r.on_error("ignored");
        assert_eq!(
            *r.events.lock().unwrap(),
            vec!["stage:Extracting".to_string(), "retry:1:1000".to_string()]
        );
    }

    #[test]
    fn arc_dyn_observer_works() {
        let o: ObserverHandle = Arc::new(NoopObserver);
        o.on_stage(SessionStage::Saving);
    }
}

//! Wake word detection (pipeline stage A)
//!
//! Consumes recognizer transcript segments, finds wake phrases, extracts
//! the trailing question, rate-limits per session, and emits command
//! records. This is a best-effort side-stream consumer: it must never
//! block or fail the upstream transcription flow.

mod detector;
mod fuzzy;
pub mod patterns;
mod rate_limit;
mod service;

pub use detector::{Detection, WakeDetector};
pub use fuzzy::damerau_levenshtein;
pub use patterns::{PatternKind, SharedPatterns, WakePatterns};
pub use rate_limit::RateLimiter;
pub use service::WakeService;

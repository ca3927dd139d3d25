//! Raven pipeline - in-meeting voice assistant
//!
//! This library implements the streaming pipeline that turns a spoken
//! "hey raven" inside a live meeting into an audible reply from the
//! meeting bot:
//! - Wake word detection over recognizer transcript segments
//! - LLM reply generation with per-session conversation context
//! - Text-to-speech synthesis with a fallback engine
//! - Bot-side playback with microphone gating
//!
//! # Architecture
//!
//! ```text
//! [Recognizer]
//!      │ transcripts
//! ┌────▼─────────────────────────────────────────────────────┐
//! │ WakeDetector ─▶ hey_raven_commands ─▶ Responder          │
//! │                                          │ llm_responses │
//! │ Player ◀─ tts_audio_queue ◀─ Synthesizer ◀┘              │
//! └────┬─────────────────────────────────────────────────────┘
//!      │ plays audio / mutes mic
//! [Meeting bot browser]
//! ```
//!
//! The stages communicate through Redis Streams with consumer groups:
//! at-least-once delivery, per-record acknowledgment, and stale-entry
//! recovery via claim. Every stage is an independent process started by
//! the `raven` binary.

pub mod api;
pub mod bot;
pub mod broker;
pub mod config;
pub mod error;
pub mod language;
pub mod responder;
pub mod stats;
pub mod synth;
pub mod wake;

pub use broker::{Broker, MemoryBroker, RedisBroker, StreamEntry};
pub use config::{BotConfig, BrokerConfig, ResponderConfig, SynthConfig, WakeConfig};
pub use error::{Error, Result};
pub use language::Language;
pub use stats::StageStats;

//! Speech synthesis (pipeline stage C)
//!
//! Consumes LLM replies, synthesizes them to audio entirely in memory
//! with a networked primary engine and a local fallback, and emits
//! audio records with base64 payloads and format metadata.

pub mod audio;
mod engine;
mod service;

pub use engine::{EngineSnapshot, EspeakEngine, RemoteEngine, TtsEngine, TtsGateway, TtsOutput};
pub use service::SynthService;

//! Error types for the Raven pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Raven pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker (stream log) error
    #[error("broker error: {0}")]
    Broker(String),

    /// Record decode/validation error
    #[error("record error: {0}")]
    Record(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// LLM gateway error
    #[error("llm error: {0}")]
    Llm(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Audio payload error
    #[error("audio error: {0}")]
    Audio(String),

    /// Browser automation error
    #[error("browser error: {0}")]
    Browser(String),

    /// Session identity error
    #[error("session error: {0}")]
    Session(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis protocol error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

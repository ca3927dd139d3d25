//! Configuration for the Raven pipeline stages
//!
//! Every stage is configured through environment variables; the wake
//! detector additionally reads a JSON pattern file whose path comes from
//! `WAKE_CONFIG_PATH` (see [`crate::wake::patterns`]).

use std::time::Duration;

use crate::{Error, Result};

/// Read an environment variable with a default.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable with a default.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Worker pool size: hardware threads clamped to [2, 16], overridable
/// via `WORKER_POOL_SIZE`.
pub fn worker_pool_size() -> usize {
    let hw = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4);
    env_parse("WORKER_POOL_SIZE", hw.clamp(2, 16)).unwrap_or(4)
}

/// Consumer identity: `POD_NAME` in orchestrated deployments, otherwise
/// a stage-specific default with the process id.
pub fn consumer_name(stage: &str) -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("CONSUMER_NAME"))
        .unwrap_or_else(|_| format!("{stage}-{}", std::process::id()))
}

/// Broker connection and consumer-loop settings shared by all stages.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis connection URL
    pub url: String,

    /// Batch size for `XREADGROUP`
    pub read_count: usize,

    /// Block time for `XREADGROUP`
    pub block: Duration,

    /// Pending entries idle longer than this are eligible for claim
    pub stale_idle: Duration,

    /// Interval between stale-claim sweeps
    pub claim_interval: Duration,

    /// Entries delivered more than this many times are dead-lettered
    pub max_deliveries: u64,
}

impl BrokerConfig {
    /// Load from environment, mirroring the stage service defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but unparseable.
    pub fn from_env() -> Result<Self> {
        let host = env_or("REDIS_HOST", "redis");
        let port: u16 = env_parse("REDIS_PORT", 6379)?;
        let db: u32 = env_parse("REDIS_DB", 0)?;

        Ok(Self {
            url: env_or("REDIS_URL", &format!("redis://{host}:{port}/{db}")),
            read_count: env_parse("REDIS_STREAM_READ_COUNT", 10)?,
            block: Duration::from_millis(env_parse("REDIS_STREAM_BLOCK_MS", 2000)?),
            stale_idle: Duration::from_millis(env_parse("PENDING_MSG_TIMEOUT_MS", 60_000)?),
            claim_interval: Duration::from_secs(env_parse("CLAIM_INTERVAL_S", 30)?),
            max_deliveries: env_parse("MAX_DELIVERIES", 5)?,
        })
    }
}

/// Wake detector (stage A) configuration.
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Path to the JSON pattern file; `None` uses built-in defaults
    pub patterns_path: Option<std::path::PathBuf>,

    /// Input stream of recognizer segments
    pub input_stream: String,

    /// Output stream of wake commands
    pub output_stream: String,

    /// Consumer group name
    pub group: String,

    /// HTTP port for /health and /stats
    pub http_port: u16,
}

impl WakeConfig {
    /// Load from environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but unparseable.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            patterns_path: std::env::var("WAKE_CONFIG_PATH").ok().map(Into::into),
            input_stream: env_or("REDIS_INPUT_STREAM_NAME", "transcripts"),
            output_stream: env_or("REDIS_OUTPUT_STREAM_NAME", "hey_raven_commands"),
            group: env_or("REDIS_CONSUMER_GROUP", "wake_detector_group"),
            http_port: env_parse("HTTP_PORT", 8000)?,
        })
    }
}

/// Default persona preamble, overridable via `RAVEN_PERSONALITY_PROMPT`.
const PERSONA_PROMPT: &str = "You are Raven, a helpful AI assistant integrated into a \
meeting system. Provide concise, helpful responses to questions during meetings. Keep \
responses brief and relevant to the meeting context.";

/// Responder (stage B) configuration.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Ollama base URL
    pub ollama_url: String,

    /// Model identifier, pulled at startup if absent
    pub model: String,

    /// Per-request deadline for generation calls
    pub api_timeout: Duration,

    /// Retry budget for transient LLM failures
    pub max_retries: u32,

    /// Sampling temperature
    pub temperature: f64,

    /// Token budget per reply
    pub max_tokens: u32,

    /// Conversation turns retained per session
    pub history_turns: usize,

    /// Persona preamble prepended to every prompt
    pub persona_prompt: String,

    /// Input stream of wake commands
    pub input_stream: String,

    /// Output stream of LLM replies
    pub output_stream: String,

    /// Consumer group name
    pub group: String,

    /// HTTP port for /health and /stats
    pub http_port: u16,
}

impl ResponderConfig {
    /// Load from environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but unparseable.
    pub fn from_env() -> Result<Self> {
        let host = env_or("OLLAMA_HOST", "localhost");
        let port: u16 = env_parse("OLLAMA_PORT", 11434)?;

        Ok(Self {
            ollama_url: env_or("OLLAMA_URL", &format!("http://{host}:{port}")),
            model: env_or("OLLAMA_MODEL", "mistral:7b"),
            api_timeout: Duration::from_secs(env_parse("OLLAMA_API_TIMEOUT", 60)?),
            max_retries: env_parse("OLLAMA_MAX_RETRIES", 3)?,
            temperature: env_parse("RESPONSE_TEMPERATURE", 0.7)?,
            max_tokens: env_parse("MAX_RESPONSE_LENGTH", 500)?,
            history_turns: env_parse("HISTORY_TURNS", 10)?,
            persona_prompt: env_or("RAVEN_PERSONALITY_PROMPT", PERSONA_PROMPT),
            input_stream: env_or("REDIS_INPUT_STREAM_NAME", "hey_raven_commands"),
            output_stream: env_or("REDIS_OUTPUT_STREAM_NAME", "llm_responses"),
            group: env_or("REDIS_CONSUMER_GROUP", "llm_processor_group"),
            http_port: env_parse("HTTP_PORT", 8000)?,
        })
    }
}

/// Synthesizer (stage C) configuration.
#[derive(Debug, Clone)]
pub struct SynthConfig {
    /// Preferred engine: "remote" or "espeak"
    pub preferred_engine: String,

    /// Base URL of the remote speech endpoint
    pub remote_url: String,

    /// API key for the remote engine
    pub remote_api_key: Option<String>,

    /// Remote voice identifier
    pub remote_voice: String,

    /// Default language when detection is inconclusive
    pub default_language: String,

    /// Per-call synthesis deadline
    pub timeout: Duration,

    /// Attempts per engine before falling back
    pub retry_attempts: u32,

    /// Delay between same-engine retries
    pub retry_delay: Duration,

    /// Text longer than this is truncated at a word boundary
    pub max_text_length: usize,

    /// Input stream of LLM replies
    pub input_stream: String,

    /// Output stream of audio records
    pub output_stream: String,

    /// Consumer group name
    pub group: String,

    /// HTTP port for /health and /stats
    pub http_port: u16,
}

impl SynthConfig {
    /// Load from environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but unparseable.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            preferred_engine: env_or("TTS_ENGINE", "remote"),
            remote_url: env_or("TTS_REMOTE_URL", "https://api.openai.com"),
            remote_api_key: std::env::var("TTS_REMOTE_API_KEY").ok(),
            remote_voice: env_or("TTS_REMOTE_VOICE", "alloy"),
            default_language: env_or("TTS_LANGUAGE", "en"),
            timeout: Duration::from_secs(env_parse("TTS_TIMEOUT", 10)?),
            retry_attempts: env_parse("TTS_RETRY_ATTEMPTS", 3)?,
            retry_delay: Duration::from_secs_f64(env_parse("TTS_RETRY_DELAY", 1.0)?),
            max_text_length: env_parse("MAX_TEXT_LENGTH", 1000)?,
            input_stream: env_or("REDIS_INPUT_STREAM_NAME", "llm_responses"),
            output_stream: env_or("REDIS_OUTPUT_STREAM_NAME", "tts_audio_queue"),
            group: env_or("REDIS_CONSUMER_GROUP", "tts_processor_group"),
            http_port: env_parse("HTTP_PORT", 8000)?,
        })
    }
}

/// Bot/player (stage D) configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Connection id assigned by the bot manager at dispatch
    pub connection_id: String,

    /// Meeting id the bot is attached to
    pub meeting_id: String,

    /// Meeting URL the bot's browser joins
    pub meeting_url: Option<String>,

    /// Bot-manager callback URL for the exit report
    pub manager_url: Option<String>,

    /// Input stream of audio records
    pub audio_stream: String,

    /// Dedupe window for replayed audio records
    pub dedupe_window: Duration,

    /// Playback timeout floor when metadata carries no duration
    pub fallback_cap: Duration,

    /// Grace added on top of the expected playback duration
    pub playback_grace: Duration,

    /// Hard cap on draining at shutdown
    pub drain_timeout: Duration,

    /// HTTP port for /health and /stats
    pub http_port: u16,
}

impl BotConfig {
    /// Load from environment. `RAVEN_CONNECTION_ID` and
    /// `RAVEN_MEETING_ID` are required: a bot without an identity cannot
    /// report back to its manager or gate audio.
    ///
    /// # Errors
    ///
    /// Returns error if required identity variables are missing or a
    /// variable is set but unparseable.
    pub fn from_env() -> Result<Self> {
        let connection_id = std::env::var("RAVEN_CONNECTION_ID")
            .map_err(|_| Error::Config("RAVEN_CONNECTION_ID is required".to_string()))?;
        let meeting_id = std::env::var("RAVEN_MEETING_ID")
            .map_err(|_| Error::Config("RAVEN_MEETING_ID is required".to_string()))?;

        Ok(Self {
            connection_id,
            meeting_id,
            meeting_url: std::env::var("RAVEN_MEETING_URL").ok(),
            manager_url: std::env::var("RAVEN_MANAGER_URL").ok(),
            audio_stream: env_or("REDIS_INPUT_STREAM_NAME", "tts_audio_queue"),
            dedupe_window: Duration::from_secs(env_parse("PLAYBACK_DEDUPE_WINDOW_S", 300)?),
            fallback_cap: Duration::from_secs(env_parse("PLAYBACK_FALLBACK_CAP_S", 30)?),
            playback_grace: Duration::from_secs(env_parse("PLAYBACK_GRACE_S", 2)?),
            drain_timeout: Duration::from_secs(env_parse("DRAIN_TIMEOUT_S", 15)?),
            http_port: env_parse("HTTP_PORT", 8000)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_default_when_unset() {
        let v: u32 = env_parse("RAVEN_TEST_UNSET_VAR", 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn worker_pool_within_bounds() {
        let size = worker_pool_size();
        assert!((2..=16).contains(&size));
    }
}

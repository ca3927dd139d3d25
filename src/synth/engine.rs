//! TTS engines and the fallback-aware gateway
//!
//! Two engines sit behind one `synthesize` call: a networked primary
//! (an OpenAI-compatible speech endpoint returning MP3) and a local
//! fallback (`espeak-ng` writing WAV to stdout). The gateway tries the
//! preferred engine with a small retry budget, then the other; if both
//! fail the caller acknowledges the reply and the user hears nothing.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use super::audio::validate_audio;
use crate::broker::AudioFormat;
use crate::config::SynthConfig;
use crate::language::Language;
use crate::{Error, Result};

/// A synthesized blob with its provenance.
#[derive(Debug, Clone)]
pub struct TtsOutput {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    /// Name of the engine that produced the blob
    pub engine: &'static str,
}

/// One speech synthesis backend.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Convert text to an in-memory audio blob.
    async fn synthesize(&self, text: &str, language: Language) -> Result<TtsOutput>;
}

/// Networked engine: OpenAI-compatible `/v1/audio/speech`.
pub struct RemoteEngine {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    voice: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

impl RemoteEngine {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(config: &SynthConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.remote_url.trim_end_matches('/').to_string(),
            api_key: config.remote_api_key.clone(),
            voice: config.remote_voice.clone(),
        })
    }
}

#[async_trait]
impl TtsEngine for RemoteEngine {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn synthesize(&self, text: &str, _language: Language) -> Result<TtsOutput> {
        let request = SpeechRequest {
            model: "tts-1",
            input: text,
            voice: &self.voice,
            response_format: "mp3",
        };

        let mut builder = self
            .http
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("remote TTS error {status}: {body}")));
        }

        let audio = resp.bytes().await?.to_vec();
        if !validate_audio(&audio) {
            return Err(Error::Tts("remote engine returned invalid audio".to_string()));
        }

        Ok(TtsOutput {
            audio,
            format: AudioFormat::Mp3,
            engine: self.name(),
        })
    }
}

/// Local fallback engine: `espeak-ng --stdout` producing WAV.
pub struct EspeakEngine {
    timeout: Duration,
}

impl EspeakEngine {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TtsEngine for EspeakEngine {
    fn name(&self) -> &'static str {
        "espeak"
    }

    async fn synthesize(&self, text: &str, language: Language) -> Result<TtsOutput> {
        let mut child = tokio::process::Command::new("espeak-ng")
            .arg("--stdout")
            .arg("-v")
            .arg(language.code())
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tts(format!("cannot spawn espeak-ng: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Tts("espeak-ng stdout unavailable".to_string()))?;

        let read = async {
            use tokio::io::AsyncReadExt as _;
            let mut reader = stdout;
            let mut audio = Vec::new();
            reader.read_to_end(&mut audio).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((audio, status))
        };

        let (audio, status) = tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| Error::Tts("espeak-ng timed out".to_string()))?
            .map_err(|e| Error::Tts(format!("espeak-ng io error: {e}")))?;

        if !status.success() {
            return Err(Error::Tts(format!("espeak-ng exited with {status}")));
        }
        if !validate_audio(&audio) {
            return Err(Error::Tts("espeak-ng returned invalid audio".to_string()));
        }

        Ok(TtsOutput {
            audio,
            format: AudioFormat::Wav,
            engine: self.name(),
        })
    }
}

/// Per-engine observability counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineSnapshot {
    pub generations: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    generations: u64,
    successes: u64,
    failures: u64,
    avg_duration_ms: f64,
}

impl EngineCounters {
    fn record_success(&mut self, elapsed: Duration) {
        self.successes += 1;
        // Rolling average over successful generations
        let n = self.successes as f64;
        self.avg_duration_ms =
            (self.avg_duration_ms * (n - 1.0) + elapsed.as_secs_f64() * 1000.0) / n;
    }
}

/// Primary-with-fallback synthesis front end.
pub struct TtsGateway {
    engines: Vec<Box<dyn TtsEngine>>,
    /// Index into `engines` of the preferred engine
    preferred: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    stats: Mutex<HashMap<&'static str, EngineCounters>>,
}

impl TtsGateway {
    /// Build the production gateway from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the remote engine cannot be constructed.
    pub fn from_config(config: &SynthConfig) -> Result<Self> {
        let engines: Vec<Box<dyn TtsEngine>> = vec![
            Box::new(RemoteEngine::new(config)?),
            Box::new(EspeakEngine::new(config.timeout)),
        ];
        Ok(Self::new(
            engines,
            &config.preferred_engine,
            config.retry_attempts,
            config.retry_delay,
        ))
    }

    /// Assemble a gateway from explicit engines; the preferred engine
    /// is looked up by name, defaulting to the first.
    #[must_use]
    pub fn new(
        engines: Vec<Box<dyn TtsEngine>>,
        preferred: &str,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        let index = engines
            .iter()
            .position(|e| e.name() == preferred)
            .unwrap_or(0);

        Self {
            engines,
            preferred: index,
            retry_attempts,
            retry_delay,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Engine names in fallback order.
    #[must_use]
    pub fn engines(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.engines.iter().map(|e| e.name()).collect();
        names.rotate_left(self.preferred);
        names
    }

    /// Synthesize with the preferred engine, falling back to the others
    /// in order. Exhausting every engine is an error; the stage decides
    /// what that means for the reply.
    ///
    /// # Errors
    ///
    /// Returns the last engine error when all engines fail.
    pub async fn synthesize(&self, text: &str, language: Language) -> Result<TtsOutput> {
        let order: Vec<usize> = (0..self.engines.len())
            .map(|i| (self.preferred + i) % self.engines.len())
            .collect();

        let mut last_error = Error::Tts("no engines configured".to_string());
        for engine_index in order {
            let engine = &self.engines[engine_index];

            for attempt in 0..self.retry_attempts.max(1) {
                let started = Instant::now();
                self.bump_generations(engine.name());

                match engine.synthesize(text, language).await {
                    Ok(output) => {
                        self.record_success(engine.name(), started.elapsed());
                        tracing::info!(
                            engine = engine.name(),
                            chars = text.len(),
                            bytes = output.audio.len(),
                            "synthesis succeeded"
                        );
                        return Ok(output);
                    }
                    Err(e) => {
                        self.record_failure(engine.name());
                        tracing::warn!(
                            engine = engine.name(),
                            attempt,
                            error = %e,
                            "synthesis attempt failed"
                        );
                        last_error = e;
                        if attempt + 1 < self.retry_attempts {
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Whether any engine can produce audio right now.
    pub async fn health(&self) -> bool {
        self.synthesize("TTS health check", Language::En).await.is_ok()
    }

    /// Current per-engine counters.
    #[must_use]
    pub fn stats(&self) -> HashMap<&'static str, EngineSnapshot> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats
            .iter()
            .map(|(name, c)| {
                (
                    *name,
                    EngineSnapshot {
                        generations: c.generations,
                        successes: c.successes,
                        failures: c.failures,
                        avg_duration_ms: c.avg_duration_ms,
                    },
                )
            })
            .collect()
    }

    fn bump_generations(&self, engine: &'static str) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.entry(engine).or_default().generations += 1;
    }

    fn record_success(&self, engine: &'static str, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.entry(engine).or_default().record_success(elapsed);
    }

    fn record_failure(&self, engine: &'static str) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.entry(engine).or_default().failures += 1;
    }
}

#[async_trait]
impl crate::api::BackendProbe for TtsGateway {
    fn name(&self) -> &'static str {
        "tts"
    }

    async fn healthy(&self) -> bool {
        // A real end-to-end probe: generate a short test utterance
        self.health().await
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "engines": self.engines(),
            "stats": self.stats(),
        })
    }
}

//! Durable message broker abstraction
//!
//! The pipeline stages communicate through an append-only stream log
//! with per-stream consumer groups: at-least-once delivery, per-record
//! acknowledgment, and reclaim of entries left pending by a crashed
//! peer. [`RedisBroker`] is the production implementation over Redis
//! Streams; [`MemoryBroker`] backs the test suite.

mod consumer;
mod memory;
mod record;
mod redis;

pub use consumer::{Disposition, StageHandler, StageWorker};
pub use memory::MemoryBroker;
pub use record::{
    Audio, AudioFormat, AudioMetadata, Command, Reply, Segment, decode_record, encode_record,
};
pub use redis::RedisBroker;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::Result;

/// Stream of recognizer transcript segments
pub const TRANSCRIPTS_STREAM: &str = "transcripts";
/// Stream of admitted wake commands
pub const COMMANDS_STREAM: &str = "hey_raven_commands";
/// Stream of LLM replies
pub const REPLIES_STREAM: &str = "llm_responses";
/// Stream of synthesized audio records
pub const AUDIO_STREAM: &str = "tts_audio_queue";

/// Dead-letter stream name for a source stream.
#[must_use]
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}.dlq")
}

/// One delivered stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Broker-assigned entry id
    pub id: String,
    /// String field map
    pub fields: HashMap<String, String>,
}

/// A delivered-but-unacknowledged entry, as reported by the broker.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Entry id
    pub id: String,
    /// Consumer the entry is currently assigned to
    pub consumer: String,
    /// Milliseconds since last delivery
    pub idle_ms: u64,
    /// Total delivery count
    pub deliveries: u64,
}

/// Stream introspection summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamInfo {
    /// Number of entries currently retained
    pub length: u64,
    /// Oldest retained entry id
    pub first_id: Option<String>,
    /// Newest entry id
    pub last_id: Option<String>,
}

/// Consumer-group introspection summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupInfo {
    /// Group name
    pub name: String,
    /// Registered consumers
    pub consumers: u64,
    /// Delivered-but-unacknowledged entries
    pub pending: u64,
}

/// Stream log with consumer-group semantics.
///
/// All stages use this seam; implementations must tolerate concurrent
/// consumers and preserve per-stream append order.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append an entry and return its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// Create the consumer group (and the stream) if missing.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` new entries for this consumer, blocking up to
    /// `block_ms` when none are available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge a delivered entry.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// List delivered-but-unacknowledged entries for the group.
    async fn pending(&self, stream: &str, group: &str, count: usize)
        -> Result<Vec<PendingEntry>>;

    /// Transfer pending entries idle for at least `min_idle_ms` to this
    /// consumer, returning the reclaimed entries.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>>;

    /// Stream length and boundary ids.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    /// Consumer groups registered on the stream.
    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;
}

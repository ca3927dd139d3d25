//! In-process implementation of the [`Broker`] trait
//!
//! Backs the test suite so stage logic can be exercised without a
//! running Redis server. Semantics mirror Redis Streams: monotonic
//! entry ids, per-group delivery cursors, pending-entry ownership, and
//! idle-based claim with delivery counting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use super::{Broker, GroupInfo, PendingEntry, StreamEntry, StreamInfo};
use crate::{Error, Result};

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct MemGroup {
    /// Index into the entry vector of the next undelivered entry
    cursor: usize,
    pending: HashMap<String, PendingState>,
}

#[derive(Debug, Default)]
struct MemStream {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, MemGroup>,
}

/// In-memory stream log with consumer groups.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, MemStream>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let s = streams.entry(stream.to_string()).or_default();

        s.next_seq += 1;
        let id = format!("{}-0", s.next_seq);
        s.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.iter().cloned().collect(),
        });

        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let s = streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Error::Broker(format!("no such stream: {stream}")))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::Broker(format!("no such group: {group}")))?;

        let mut delivered = Vec::new();
        while g.cursor < s.entries.len() && delivered.len() < count {
            let entry = s.entries[g.cursor].clone();
            g.pending.insert(
                entry.id.clone(),
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            delivered.push(entry);
            g.cursor += 1;
        }

        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            g.pending.remove(id);
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(g) = streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<PendingEntry> = g
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle_ms: p.delivered_at.elapsed().as_millis() as u64,
                deliveries: p.deliveries,
            })
            .collect();

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.truncate(count);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(s) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for id in ids {
            let Some(p) = g.pending.get_mut(id) else {
                continue;
            };
            if p.delivered_at.elapsed().as_millis() as u64 >= min_idle_ms {
                p.consumer = consumer.to_string();
                p.delivered_at = Instant::now();
                p.deliveries += 1;
                if let Some(entry) = s.entries.iter().find(|e| &e.id == id) {
                    claimed.push(entry.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(s) = streams.get(stream) else {
            return Ok(StreamInfo {
                length: 0,
                first_id: None,
                last_id: None,
            });
        };

        Ok(StreamInfo {
            length: s.entries.len() as u64,
            first_id: s.entries.first().map(|e| e.id.clone()),
            last_id: s.entries.last().map(|e| e.id.clone()),
        })
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        Ok(s.groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: 1,
                pending: g.pending.len() as u64,
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

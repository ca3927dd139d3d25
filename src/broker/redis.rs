//! Redis Streams implementation of the [`Broker`] trait

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamInfoStreamReply,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;

use super::{Broker, GroupInfo, PendingEntry, StreamEntry, StreamInfo};
use crate::{Error, Result};

/// Broker over Redis Streams consumer groups.
///
/// The connection manager reconnects transparently; callers see
/// transient errors during a reconnect window and are expected to rely
/// on redelivery rather than retry in place.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect and verify the server responds to PING.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        let broker = Self { conn };
        broker.ping().await?;
        tracing::info!(url, "broker connected");

        Ok(broker)
    }

    fn entry_from_stream_id(id: &StreamId) -> StreamEntry {
        let mut fields = HashMap::with_capacity(id.map.len());
        for (key, value) in &id.map {
            if let Ok(text) = redis::from_redis_value::<String>(value) {
                fields.insert(key.clone(), text);
            } else {
                tracing::warn!(id = %id.id, field = %key, "dropping non-string stream field");
            }
        }

        StreamEntry {
            id: id.id.clone(),
            fields,
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;

        match created {
            Ok(_) => {
                tracing::info!(stream, group, "created consumer group");
                Ok(())
            }
            // Group already exists from a previous run
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(usize::try_from(block_ms).unwrap_or(usize::MAX));

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in &key.ids {
                entries.push(Self::entry_from_stream_id(id));
            }
        }

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, &[id]).await?;
        if acked == 0 {
            tracing::debug!(stream, group, id, "ack had no pending entry");
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                deliveries: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms as usize, ids)
            .await?;

        Ok(reply
            .ids
            .iter()
            .map(Self::entry_from_stream_id)
            .collect())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let mut conn = self.conn.clone();
        let info: StreamInfoStreamReply = conn.xinfo_stream(stream).await?;

        let boundary = |id: &StreamId| {
            if id.id.is_empty() {
                None
            } else {
                Some(id.id.clone())
            }
        };

        Ok(StreamInfo {
            length: info.length as u64,
            first_id: boundary(&info.first_entry),
            last_id: boundary(&info.last_entry),
        })
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(stream).await?;

        Ok(reply
            .groups
            .into_iter()
            .map(|g| GroupInfo {
                name: g.name,
                consumers: g.consumers as u64,
                pending: g.pending as u64,
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::Broker(format!("unexpected PING reply: {pong}")))
        }
    }
}

//! Partitioned event log on Redis Streams.
//!
//! Topic `t` with `n` partitions is stored as the streams `t:0` .. `t:{n-1}`.
//! Each entry carries the fields `key`, `payload` and one `h:<name>` per
//! header. Consumers read through a consumer group, so an entry that is
//! never acknowledged stays pending and is handed back to the same consumer
//! name after a restart.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::ports::{
    partition_for, Delivery, EventLog, EventLogError, EventRecord, EventSource, PublishReceipt,
};

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";
const HEADER_PREFIX: &str = "h:";

pub fn stream_name(topic: &str, partition: u32) -> String {
    format!("{topic}:{partition}")
}

#[derive(Clone)]
pub struct RedisEventLog {
    connection: MultiplexedConnection,
    partitions: u32,
    max_len: usize,
}

impl RedisEventLog {
    pub async fn connect(url: &str, partitions: u32, max_len: usize) -> Result<Self, EventLogError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            partitions: partitions.max(1),
            max_len,
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn publish(
        &self,
        topic: &str,
        record: EventRecord,
    ) -> Result<PublishReceipt, EventLogError> {
        let partition = partition_for(&record.key, self.partitions);
        let stream = stream_name(topic, partition);

        let mut fields: Vec<(String, String)> = Vec::with_capacity(record.headers.len() + 2);
        fields.push((KEY_FIELD.to_string(), record.key));
        fields.push((PAYLOAD_FIELD.to_string(), record.payload));
        for (name, value) in record.headers {
            fields.push((format!("{HEADER_PREFIX}{name}"), value));
        }

        let mut conn = self.connection.clone();
        let offset: String = conn
            .xadd_maxlen(&stream, StreamMaxlen::Approx(self.max_len), "*", &fields)
            .await?;

        Ok(PublishReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn ping(&self) -> Result<(), EventLogError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

/// Consumer-group reader over every partition of one topic.
pub struct RedisEventSource {
    connection: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    streams: Vec<String>,
    draining_pending: AtomicBool,
}

impl RedisEventSource {
    /// Connects and creates the consumer group on every partition if needed.
    pub async fn connect(
        url: &str,
        topic: &str,
        partitions: u32,
        group: &str,
        consumer: &str,
    ) -> Result<Self, EventLogError> {
        let client = redis::Client::open(url)?;
        let mut connection = client.get_multiplexed_async_connection().await?;

        let streams: Vec<String> = (0..partitions.max(1))
            .map(|partition| stream_name(topic, partition))
            .collect();

        for stream in &streams {
            let created: redis::RedisResult<()> =
                connection.xgroup_create_mkstream(stream, group, "0").await;
            match created {
                Ok(()) => tracing::info!(stream = %stream, group, "Created consumer group"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Self {
            connection,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams,
            draining_pending: AtomicBool::new(true),
        })
    }

    async fn read(
        &self,
        start_id: &str,
        max: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>, EventLogError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let ids: Vec<&str> = vec![start_id; self.streams.len()];
        let mut conn = self.connection.clone();
        let reply: Option<StreamReadReply> =
            conn.xread_options(self.streams.as_slice(), ids.as_slice(), &options).await?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            let partition = partition_of(&stream.key);
            for entry in stream.ids {
                match decode_entry(&entry) {
                    Ok(record) => deliveries.push(Delivery {
                        topic: self.topic.clone(),
                        partition,
                        offset: entry.id.clone(),
                        record,
                    }),
                    Err(e) => {
                        // Acknowledge so the entry cannot block its partition.
                        tracing::warn!(stream = %stream.key, error = %e, "Dropping malformed log entry");
                        let _: i64 = conn.xack(&stream.key, &self.group, &[entry.id.as_str()]).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl EventSource for RedisEventSource {
    async fn poll(&self, max: usize, block: Duration) -> Result<Vec<Delivery>, EventLogError> {
        // Entries delivered before a restart but never acknowledged come first.
        if self.draining_pending.load(Ordering::Acquire) {
            let pending = self.read("0", max, None).await?;
            if !pending.is_empty() {
                tracing::info!(count = pending.len(), group = %self.group, "Redelivering pending entries");
                return Ok(pending);
            }
            self.draining_pending.store(false, Ordering::Release);
        }

        self.read(">", max, Some(block)).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), EventLogError> {
        let stream = stream_name(&delivery.topic, delivery.partition);
        let mut conn = self.connection.clone();
        let _: i64 = conn.xack(&stream, &self.group, &[delivery.offset.as_str()]).await?;
        Ok(())
    }
}

fn partition_of(stream: &str) -> u32 {
    stream
        .rsplit_once(':')
        .and_then(|(_, partition)| partition.parse().ok())
        .unwrap_or(0)
}

fn decode_entry(entry: &StreamId) -> Result<EventRecord, EventLogError> {
    let malformed = |reason: &str| EventLogError::Malformed {
        id: entry.id.clone(),
        reason: reason.to_string(),
    };

    let mut key = None;
    let mut payload = None;
    let mut headers = BTreeMap::new();
    for (field, value) in &entry.map {
        let value: String = redis::from_redis_value(value)
            .map_err(|e| malformed(&format!("field {field}: {e}")))?;
        if field == KEY_FIELD {
            key = Some(value);
        } else if field == PAYLOAD_FIELD {
            payload = Some(value);
        } else if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
            headers.insert(name.to_string(), value);
        }
    }

    Ok(EventRecord {
        key: key.ok_or_else(|| malformed("missing key field"))?,
        payload: payload.ok_or_else(|| malformed("missing payload field"))?,
        headers,
    })
}

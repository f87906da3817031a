//! Redis Streams backend.
//!
//! - **Stream**: `<stream>`, read through one consumer group
//! - **Reclaim**: `XAUTOCLAIM` hands entries idle past `min_idle` to the reader
//! - **Delayed entries**: `<stream>:delayed` sorted set scored by visibility
//!   time, promoted into the stream by whichever reader sees them due
//! - **Dead letters**: `<stream>:dlq`
//!
//! Promotion and heartbeats are Lua scripts: each runs as one command, so a
//! dropped connection never leaves a delayed entry half moved, and a touch
//! never takes an entry away from the consumer that reclaimed it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::queue::backend::{BackendError, DeadLetterEntry, Delivery, EntryId, StreamBackend};

const PAYLOAD_FIELD: &str = "payload";

/// KEYS: stream, delayed set. ARGV: now (ms), payload field name.
/// Members are `<token>|<payload>`; each due member is appended and removed
/// in the same call.
const PROMOTE_DELAYED: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(due) do
  local sep = string.find(member, '|', 1, true)
  if sep then
    redis.call('XADD', KEYS[1], '*', ARGV[2], string.sub(member, sep + 1))
  end
  redis.call('ZREM', KEYS[2], member)
end
return #due
"#;

/// KEYS: stream. ARGV: group, entry id, consumer.
/// Resets the idle time only if `consumer` still owns the pending entry.
const TOUCH_OWNED: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #pending == 0 or pending[1][2] ~= ARGV[3] then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
return 1
"#;

pub struct RedisStream {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    stream_key: String,
    group: String,
    delayed_key: String,
    dlq_key: String,
    promote_script: redis::Script,
    touch_script: redis::Script,
}

fn map_err(e: redis::RedisError) -> BackendError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        BackendError::Unavailable(e.to_string())
    } else {
        BackendError::Command(e.to_string())
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// `[id, [field, value, ...]]` into the id and its field pairs.
fn parse_entry(entry: &Value) -> Option<(String, Vec<(String, String)>)> {
    let Value::Bulk(parts) = entry else {
        return None;
    };
    let id = as_string(parts.first()?)?;
    let Some(Value::Bulk(raw)) = parts.get(1) else {
        return None;
    };
    let fields = raw
        .chunks(2)
        .filter_map(|pair| match pair {
            [k, v] => Some((as_string(k)?, as_string(v)?)),
            _ => None,
        })
        .collect();
    Some((id, fields))
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

impl RedisStream {
    pub fn new(redis_url: &str, stream_key: &str, group: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url).map_err(map_err)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            delayed_key: format!("{stream_key}:delayed"),
            dlq_key: format!("{stream_key}:dlq"),
            promote_script: redis::Script::new(PROMOTE_DELAYED),
            touch_script: redis::Script::new(TOUCH_OWNED),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, BackendError> {
        self.conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(map_err)
            })
            .await
            .cloned()
    }

    /// Create the consumer group (and stream) if missing.
    pub async fn ensure_group(&self) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => {
                tracing::info!(stream = %self.stream_key, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn xadd(
        &self,
        conn: &mut MultiplexedConnection,
        payload: &str,
    ) -> Result<EntryId, BackendError> {
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(conn)
            .await
            .map_err(map_err)
    }

    /// Move due delayed entries into the stream.
    async fn promote_delayed(&self, conn: &mut MultiplexedConnection) -> Result<(), BackendError> {
        let promoted: i64 = self
            .promote_script
            .key(&self.stream_key)
            .key(&self.delayed_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PAYLOAD_FIELD)
            .invoke_async(conn)
            .await
            .map_err(map_err)?;
        if promoted > 0 {
            tracing::debug!(stream = %self.stream_key, promoted, "Promoted delayed entries");
        }
        Ok(())
    }

    async fn delivery_count(
        &self,
        conn: &mut MultiplexedConnection,
        entry_id: &str,
    ) -> Result<u32, BackendError> {
        let pending: Vec<(String, String, u64, u32)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(map_err)?;
        Ok(pending.first().map(|(_, _, _, count)| *count).unwrap_or(1))
    }
}

#[async_trait]
impl StreamBackend for RedisStream {
    async fn append(
        &self,
        payload: &str,
        visible_after: Duration,
    ) -> Result<EntryId, BackendError> {
        let mut conn = self.conn().await?;
        if visible_after.is_zero() {
            return self.xadd(&mut conn, payload).await;
        }

        let token = Uuid::new_v4();
        let visible_at = Utc::now().timestamp_millis() + visible_after.as_millis() as i64;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(visible_at)
            .arg(format!("{token}|{payload}"))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(format!("delayed-{token}"))
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<Delivery>, BackendError> {
        let mut conn = self.conn().await?;
        self.promote_delayed(&mut conn).await?;

        let mut deliveries = Vec::new();

        // Reply: [next_cursor, [entries...], (deleted ids)]
        let reclaimed: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if let Value::Bulk(parts) = &reclaimed {
            if let Some(Value::Bulk(entries)) = parts.get(1) {
                for entry in entries {
                    let Some((entry_id, fields)) = parse_entry(entry) else {
                        continue;
                    };
                    let Some(payload) = field(&fields, PAYLOAD_FIELD) else {
                        continue;
                    };
                    let delivery_count = self.delivery_count(&mut conn, &entry_id).await?;
                    tracing::debug!(stream = %self.stream_key, entry_id = %entry_id, to = consumer, "Reclaimed idle entry");
                    deliveries.push(Delivery {
                        entry_id,
                        payload: payload.to_string(),
                        delivery_count,
                    });
                }
            }
        }

        let remaining = count.saturating_sub(deliveries.len());
        if remaining == 0 {
            return Ok(deliveries);
        }

        // Reply: [[stream, [entries...]]] or nil
        let fresh: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(remaining)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if let Value::Bulk(streams) = &fresh {
            for stream in streams {
                let Value::Bulk(parts) = stream else { continue };
                let Some(Value::Bulk(entries)) = parts.get(1) else {
                    continue;
                };
                for entry in entries {
                    if let Some((entry_id, fields)) = parse_entry(entry) {
                        if let Some(payload) = field(&fields, PAYLOAD_FIELD) {
                            deliveries.push(Delivery {
                                entry_id,
                                payload: payload.to_string(),
                                delivery_count: 1,
                            });
                        }
                    }
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, entry_id: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let acked: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if acked > 0 {
            let _: i64 = redis::cmd("XDEL")
                .arg(&self.stream_key)
                .arg(entry_id)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
        }
        Ok(acked > 0)
    }

    async fn touch(&self, entry_id: &str, consumer: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        // JUSTID resets the idle time without bumping the delivery counter
        let touched: i64 = self
            .touch_script
            .key(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(consumer)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(touched == 1)
    }

    async fn dead_letter(&self, payload: &str, reason: &str) -> Result<EntryId, BackendError> {
        let mut conn = self.conn().await?;
        let entry_id: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        tracing::warn!(dlq = %self.dlq_key, entry_id = %entry_id, reason, "Entry sent to dead-letter stream");
        Ok(entry_id)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, BackendError> {
        let mut conn = self.conn().await?;
        let entries: Value = redis::cmd("XRANGE")
            .arg(&self.dlq_key)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        let Value::Bulk(entries) = entries else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter_map(parse_entry)
            .map(|(entry_id, fields)| DeadLetterEntry {
                entry_id,
                payload: field(&fields, PAYLOAD_FIELD).unwrap_or_default().to_string(),
                reason: field(&fields, "reason").unwrap_or_default().to_string(),
                failed_at: field(&fields, "failed_at")
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| ts.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn pending_count(&self) -> Result<usize, BackendError> {
        let mut conn = self.conn().await?;
        // Summary form: [count, min_id, max_id, [[consumer, count], ...]]
        let summary: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        match summary {
            Value::Bulk(parts) => match parts.first() {
                Some(Value::Int(count)) => Ok(*count as usize),
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_stream_entry() {
        let entry = Value::Bulk(vec![
            data("1700000000000-0"),
            Value::Bulk(vec![data("payload"), data("{\"a\":1}"), data("reason"), data("boom")]),
        ]);
        let (id, fields) = parse_entry(&entry).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(field(&fields, "payload"), Some("{\"a\":1}"));
        assert_eq!(field(&fields, "reason"), Some("boom"));
        assert_eq!(field(&fields, "missing"), None);
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(parse_entry(&data("not an entry")).is_none());
        assert!(parse_entry(&Value::Bulk(vec![data("1-0")])).is_none());
    }

    /// Live-server tests run only when `SLICER_TEST_REDIS_URL` is set.
    async fn live_stream() -> Option<RedisStream> {
        let url = std::env::var("SLICER_TEST_REDIS_URL").ok()?;
        let key = format!("slicer-test:{}", Uuid::new_v4());
        let stream = RedisStream::new(&url, &key, "workers").unwrap();
        stream.ensure_group().await.unwrap();
        Some(stream)
    }

    #[tokio::test]
    async fn delayed_entry_moves_into_stream_once() {
        let Some(stream) = live_stream().await else {
            return;
        };
        stream.append("retry", Duration::from_millis(50)).await.unwrap();
        assert!(stream
            .read_group("a", 10, Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = stream.read_group("a", 10, Duration::from_secs(60)).await.unwrap();
        let second = stream.read_group("b", 10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, "retry");
        assert!(second.is_empty());

        let mut conn = stream.conn().await.unwrap();
        let delayed: i64 = redis::cmd("ZCARD")
            .arg(&stream.delayed_key)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(delayed, 0);
    }

    #[tokio::test]
    async fn touch_refuses_entry_owned_by_another_consumer() {
        let Some(stream) = live_stream().await else {
            return;
        };
        stream.append("job", Duration::ZERO).await.unwrap();
        let delivered = stream.read_group("a", 1, Duration::from_secs(60)).await.unwrap();
        let entry_id = delivered[0].entry_id.clone();

        // Reclaimed by b once idle
        let reclaimed = stream.read_group("b", 1, Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed[0].entry_id, entry_id);

        assert!(!stream.touch(&entry_id, "a").await.unwrap());
        assert!(stream.touch(&entry_id, "b").await.unwrap());
    }
}

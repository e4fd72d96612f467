//! Redis Streams-backed [`Broker`] implementation.
//!
//! Built directly on raw `XADD` / `XGROUP` / `XREADGROUP` / `XACK` / `XCLAIM`
//! / `XPENDING` commands rather than a higher-level streams wrapper.
//! Connections are managed by `redis::aio::ConnectionManager`, which
//! reconnects transparently and is safe to clone and share across tasks.

use redis::aio::ConnectionManager;
use redis::{RedisResult, Value};

use async_trait::async_trait;

use crate::{Broker, BrokerError, BrokerResult, Fields, StreamEntry};

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`) and build a
    /// broker backed by a managed connection.
    pub async fn connect(redis_url: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, stream: &str, fields: Fields, max_len: u64) -> BrokerResult<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if max_len > 0 {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (key, value) in &fields {
            cmd.arg(key).arg(value);
        }

        let entry_id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(entry_id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        // BUSYGROUP means the group already exists; every other error is real.
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::GroupSetup(e.to_string())),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: RedisResult<Value> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(Value::Nil) => Ok(Vec::new()),
            Ok(value) => parse_streams_reply(&value, stream)
                .map_err(|e| BrokerError::Read(e.to_string())),
            Err(e) => Err(BrokerError::Read(e.to_string())),
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let pending_ids = self.pending_entry_ids(stream, group, min_idle_ms).await?;
        if pending_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in &pending_ids {
            cmd.arg(id);
        }

        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Claim(e.to_string()))?;

        parse_entries_array(&reply).map_err(|e| BrokerError::Claim(e.to_string()))
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<(String, u64)>> {
        let mut conn = self.conn.clone();
        let reply: RedisResult<Value> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(value) => parse_pending_summary(&value).map_err(|e| BrokerError::Read(e.to_string())),
            Err(e) if e.to_string().contains("NOGROUP") => Ok(Vec::new()),
            Err(e) => Err(BrokerError::Read(e.to_string())),
        }
    }
}

impl RedisBroker {
    async fn pending_entry_ids(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
    ) -> BrokerResult<Vec<String>> {
        let pending = self.pending_range(stream, group, 1000).await?;
        Ok(pending
            .into_iter()
            .filter(|(_, idle)| *idle >= min_idle_ms)
            .map(|(id, _)| id)
            .collect())
    }
}

fn bulk_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Parse the `STREAMS` reply of `XREADGROUP`/`XREAD`:
/// `[[stream_name, [[entry_id, [field, value, ...]], ...]], ...]`.
fn parse_streams_reply(value: &Value, stream: &str) -> Result<Vec<StreamEntry>, String> {
    let Value::Array(streams) = value else {
        return Err("expected array reply from XREADGROUP".to_string());
    };

    for entry in streams {
        let Value::Array(pair) = entry else {
            continue;
        };
        if pair.len() != 2 {
            continue;
        }
        let name = bulk_string(&pair[0]).unwrap_or_default();
        if name != stream {
            continue;
        }
        return parse_entries_array(&pair[1]);
    }

    Ok(Vec::new())
}

/// Parse `[[entry_id, [field, value, ...]], ...]` as returned by XCLAIM and
/// nested inside the XREADGROUP reply.
fn parse_entries_array(value: &Value) -> Result<Vec<StreamEntry>, String> {
    let Value::Array(entries) = value else {
        return Err("expected array of stream entries".to_string());
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(pair) = entry else {
            return Err("malformed stream entry".to_string());
        };
        if pair.len() != 2 {
            return Err("malformed stream entry".to_string());
        }
        let entry_id = bulk_string(&pair[0]).ok_or("missing entry id")?;
        let Value::Array(flat_fields) = &pair[1] else {
            return Err("malformed field list".to_string());
        };

        let mut fields = Fields::new();
        for chunk in flat_fields.chunks(2) {
            if let [k, v] = chunk {
                if let (Some(key), Some(value)) = (bulk_string(k), bulk_string(v)) {
                    fields.push((key, value));
                }
            }
        }
        out.push((entry_id, fields));
    }
    Ok(out)
}

/// Parse the verbose form of `XPENDING key group - + count`:
/// `[[entry_id, consumer, idle_ms, delivery_count], ...]`.
fn parse_pending_summary(value: &Value) -> Result<Vec<(String, u64)>, String> {
    let Value::Array(entries) = value else {
        return Err("expected array reply from XPENDING".to_string());
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(fields) = entry else {
            continue;
        };
        if fields.len() < 3 {
            continue;
        }
        let entry_id = bulk_string(&fields[0]).ok_or("missing pending entry id")?;
        let idle_ms = match &fields[2] {
            Value::Int(i) => *i as u64,
            other => bulk_string(other)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or("malformed idle time")?,
        };
        out.push((entry_id, idle_ms));
    }
    Ok(out)
}

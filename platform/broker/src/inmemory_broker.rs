//! Single-process double for [`Broker`], for tests and local development.
//!
//! Keeps the consumer-group and pending-entry semantics a real Redis Streams
//! deployment provides, so the worker pipeline can be exercised (claim on
//! timeout, duplicate delivery, crash recovery) without a live Redis server.
//! A simpler broadcast-channel double would suffice for pub/sub alone, but
//! this trait's ack/pending/claim semantics need real per-consumer-group
//! bookkeeping to behave like the production Redis implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use crate::{Broker, BrokerError, BrokerResult, Fields, StreamEntry};

struct PendingEntry {
    fields: Fields,
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Index into the stream's entry log of the next entry this group has
    /// not yet delivered to any consumer.
    next_index: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, Fields)>,
    groups: HashMap<String, GroupState>,
}

/// In-memory stand-in for a Redis Streams broker.
///
/// Entry ids are assigned from a single monotonically increasing counter
/// shared across all streams, formatted `"<n>-0"` to look like a Redis
/// Streams id without claiming millisecond-timestamp semantics.
pub struct InMemoryBroker {
    streams: Mutex<HashMap<String, StreamState>>,
    next_id: Mutex<u64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    fn next_entry_id(&self) -> String {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        format!("{id}-0")
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, stream: &str, fields: Fields, max_len: u64) -> BrokerResult<String> {
        let entry_id = self.next_entry_id();
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.entries.push((entry_id.clone(), fields));

        let max_len = max_len as usize;
        if max_len > 0 && state.entries.len() > max_len {
            let overflow = state.entries.len() - max_len;
            state.entries.drain(0..overflow);
            for group in state.groups.values_mut() {
                group.next_index = group.next_index.saturating_sub(overflow);
            }
        }

        Ok(entry_id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            next_index: state.entries.len(),
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        _block_ms: u64,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::Read(format!("unknown stream {stream}")))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::Read(format!("unknown group {group} on {stream}")))?;

        let available = &state.entries[group_state.next_index..];
        let take = available.len().min(max);
        let delivered: Vec<StreamEntry> = available[..take].to_vec();
        group_state.next_index += take;

        for (entry_id, fields) in &delivered {
            group_state.pending.insert(
                entry_id.clone(),
                PendingEntry {
                    fields: fields.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                },
            );
        }

        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> BrokerResult<()> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::Claim(format!("unknown stream {stream}")))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::Claim(format!("unknown group {group} on {stream}")))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (entry_id, pending) in group_state.pending.iter_mut() {
            let idle = now.duration_since(pending.delivered_at).as_millis() as u64;
            if idle >= min_idle_ms {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                claimed.push((entry_id.clone(), pending.fields.clone()));
            }
        }
        Ok(claimed)
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<(String, u64)>> {
        let streams = self.streams.lock().unwrap();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut entries: Vec<(String, u64)> = group_state
            .pending
            .iter()
            .map(|(entry_id, pending)| {
                let idle = now.duration_since(pending.delivered_at).as_millis() as u64;
                (entry_id.clone(), idle)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.truncate(count);
        Ok(entries)
    }
}

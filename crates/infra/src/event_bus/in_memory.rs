//! In-process stream bus with consumer-group semantics.
//!
//! Used by tests and by the binary's in-memory mode. Behaves like a Redis stream
//! for everything the consumers rely on: groups start at the beginning of the
//! stream, read entries stay pending until acknowledged, and idle pending entries
//! are re-claimed with an incremented delivery count.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;

use creditflow_events::StreamMessage;

use super::{BusError, ReadRequest, StreamBus, fields_to_map};

#[derive(Debug)]
struct Entry {
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    last_delivered: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the first entry never delivered to this group.
    next_index: usize,
    /// Delivered but unacknowledged entries, keyed by entry index.
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<Entry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
pub struct InMemoryStreamBus {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryStreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with a connection error until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of bus calls served so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Every entry of `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        let Ok(streams) = self.streams.lock() else {
            return vec![];
        };
        streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| StreamMessage::new(stream, e.id.clone(), e.fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivered-but-unacknowledged entries of one group.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let Ok(streams) = self.streams.lock() else {
            return 0;
        };
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn enter(&self) -> Result<(), BusError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Connection("in-memory bus is offline".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StreamState>>, BusError> {
        self.streams
            .lock()
            .map_err(|_| BusError::Command("stream state lock poisoned".to_string()))
    }

    fn try_read(&self, request: &ReadRequest) -> Result<Vec<StreamMessage>, BusError> {
        let mut streams = self.lock()?;
        let now = Instant::now();
        let mut out = Vec::new();

        for name in &request.streams {
            let state = streams.get_mut(name).ok_or_else(|| unknown_group(name, &request.group))?;
            let group = state
                .groups
                .get_mut(&request.group)
                .ok_or_else(|| unknown_group(name, &request.group))?;

            for (index, pending) in group.pending.iter_mut() {
                if out.len() >= request.count {
                    break;
                }
                if now.duration_since(pending.last_delivered) < request.pending_idle {
                    continue;
                }
                pending.consumer = request.consumer.clone();
                pending.last_delivered = now;
                pending.delivery_count += 1;

                let entry = &state.entries[*index];
                let mut msg = StreamMessage::new(name.clone(), entry.id.clone(), entry.fields.clone());
                msg.delivery_count = pending.delivery_count;
                out.push(msg);
            }
        }
        if !out.is_empty() {
            return Ok(out);
        }

        for name in &request.streams {
            let Some(state) = streams.get_mut(name) else { continue };
            let Some(group) = state.groups.get_mut(&request.group) else { continue };

            while group.next_index < state.entries.len() && out.len() < request.count {
                let index = group.next_index;
                group.next_index += 1;
                group.pending.insert(
                    index,
                    PendingEntry {
                        consumer: request.consumer.clone(),
                        last_delivered: now,
                        delivery_count: 1,
                    },
                );
                let entry = &state.entries[index];
                out.push(StreamMessage::new(name.clone(), entry.id.clone(), entry.fields.clone()));
            }
        }

        Ok(out)
    }
}

fn unknown_group(stream: &str, group: &str) -> BusError {
    BusError::UnknownGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

#[async_trait]
impl StreamBus for InMemoryStreamBus {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        self.enter()?;
        let mut streams = self.lock()?;
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(&self, request: &ReadRequest) -> Result<Vec<StreamMessage>, BusError> {
        self.enter()?;
        let deadline = tokio::time::Instant::now() + request.block;

        loop {
            // Registered before reading so an append in between still wakes us.
            let appended = self.appended.notified();
            let batch = self.try_read(request)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BusError> {
        self.enter()?;
        let mut streams = self.lock()?;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group) = state.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            if let Some(index) = state.entries.iter().position(|e| &e.id == id) {
                if group.pending.remove(&index).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn append(&self, stream: &str, fields: Vec<(String, String)>) -> Result<String, BusError> {
        self.enter()?;
        let id = {
            let mut streams = self.lock()?;
            let state = streams.entry(stream.to_string()).or_default();
            let id = format!("{}-0", state.entries.len() + 1);
            state.entries.push(Entry {
                id: id.clone(),
                fields: fields_to_map(fields),
            });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.enter()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn request(pending_idle: Duration) -> ReadRequest {
        ReadRequest {
            group: "g".to_string(),
            consumer: "c1".to_string(),
            streams: vec!["s".to_string()],
            count: 10,
            block: Duration::from_millis(20),
            pending_idle,
        }
    }

    fn fields(n: u32) -> Vec<(String, String)> {
        vec![("n".to_string(), n.to_string())]
    }

    #[tokio::test]
    async fn group_reads_from_start_and_tracks_pending() {
        let bus = InMemoryStreamBus::new();
        bus.append("s", fields(1)).await.unwrap();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", fields(2)).await.unwrap();

        let batch = bus.read_group(&request(Duration::from_secs(60))).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(bus.pending_count("s", "g"), 2);

        assert_eq!(bus.ack("s", "g", &[batch[0].id.clone()]).await.unwrap(), 1);
        assert_eq!(bus.pending_count("s", "g"), 1);

        // Nothing new and the pending entry is not idle yet.
        assert!(bus.read_group(&request(Duration::from_secs(60))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_pending_entries_are_redelivered_first() {
        let bus = InMemoryStreamBus::new();
        bus.ensure_group("s", "g").await.unwrap();
        bus.append("s", fields(1)).await.unwrap();

        let first = bus.read_group(&request(Duration::ZERO)).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);
        bus.append("s", fields(2)).await.unwrap();

        let again = bus.read_group(&request(Duration::ZERO)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        assert_eq!(again[0].delivery_count, 2);
        assert!(again[0].is_redelivery());
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let bus = std::sync::Arc::new(InMemoryStreamBus::new());
        bus.ensure_group("s", "g").await.unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut req = request(Duration::from_secs(60));
                req.block = Duration::from_secs(5);
                bus.read_group(&req).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.append("s", fields(7)).await.unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields["n"], "7");
    }

    #[tokio::test]
    async fn offline_bus_reports_transient_errors() {
        let bus = InMemoryStreamBus::new();
        bus.set_offline(true);
        let err = bus.ping().await.unwrap_err();
        assert!(err.is_transient());

        bus.set_offline(false);
        assert!(bus.ping().await.is_ok());
        let err = bus.read_group(&request(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownGroup { .. }));
        assert!(!err.is_transient());
    }
}

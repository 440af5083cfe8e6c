//! The broker client contract (C2): the minimal surface the core needs
//! over an append-only stream broker with consumer-group semantics.
//!
//! Concrete backends (Redis Streams, in `leaflet-broker-redis`) implement
//! [`BrokerClient`]; this module also ships an in-memory reference
//! implementation used by the core's own tests, mirroring the teacher's
//! `InMemory` event store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::model::EncodedFields;

/// Parses a broker message id of the form `<ms>-<seq>` into its numeric
/// components. Tolerant of ids that omit the sequence (`seq` defaults to
/// `0`); unparseable components default to `0` rather than panicking,
/// since a malformed id should fail decoding elsewhere, not here.
#[must_use]
pub fn parse_stream_id(id: &str) -> (u64, u64) {
    match id.split_once('-') {
        Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (id.parse().unwrap_or(0), 0),
    }
}

/// Orders two broker message ids by their numeric `(ms, seq)` components.
/// Byte-order comparison only works when every id shares one fixed width
/// and padding; real ids (e.g. native Redis Stream ids) and zero-padded
/// test-double ids do not, so every cross-id comparison must go through
/// here instead of `str`'s `Ord`.
#[must_use]
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    parse_stream_id(a).cmp(&parse_stream_id(b))
}

/// Where a group read should resume from, per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPosition {
    /// Only entries never before delivered to this group (broker's `">"`).
    New,
    /// This consumer's own still-unacked entries, replayed for recovery
    /// after a restart (broker's `"0"`).
    Pending,
}

/// One decoded entry read from a stream: its broker-assigned id and its
/// field map.
pub type StreamEntry = (String, EncodedFields);

/// The entries a single stream yielded from a read call.
#[derive(Debug, Clone, Default)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// Abstract surface over the stream broker (§4.2). Implementors must
/// classify connection failures as [`Error::Transient`] and never let a
/// backend-specific error type cross this boundary.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Appends one entry, returning the broker-assigned, per-stream
    /// monotone message id.
    async fn append(&self, stream: &str, fields: EncodedFields) -> Result<String, Error>;

    /// Idempotently ensures `stream`/`group` exists, creating the stream if
    /// absent. Absorbs "group already exists" silently.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Error>;

    /// Reads up to `max` entries per stream for `consumer` in `group`,
    /// blocking up to `block` and returning empty on timeout.
    async fn read_group(
        &self,
        streams: &[(String, StreamPosition)],
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, Error>;

    /// Marks `ids` on `stream`/`group` as delivered.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), Error>;

    /// Non-group tail read, for archival and live stats. `positions` gives,
    /// per stream, the id to read strictly after (`""` or `"0"` means from
    /// the start).
    async fn read_tail(
        &self,
        positions: &[(String, String)],
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, Error>;

    /// Deletes entries with id < `min_id`. No-op if `stream` doesn't exist.
    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<(), Error>;

    /// Approximate entry count for `stream`.
    async fn length(&self, stream: &str) -> Result<u64, Error>;
}

/// Blanket forwarding impl so a broker can be shared across actors (e.g.
/// two archivers, or a worker and a test harness) via `Arc`, the same way
/// the teacher's store adapters are cloned behind a connection pool handle.
#[async_trait]
impl<T: BrokerClient + ?Sized> BrokerClient for std::sync::Arc<T> {
    async fn append(&self, stream: &str, fields: EncodedFields) -> Result<String, Error> {
        (**self).append(stream, fields).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        (**self).ensure_group(stream, group).await
    }

    async fn read_group(
        &self,
        streams: &[(String, StreamPosition)],
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, Error> {
        (**self).read_group(streams, group, consumer, max, block).await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), Error> {
        (**self).ack(stream, group, ids).await
    }

    async fn read_tail(
        &self,
        positions: &[(String, String)],
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, Error> {
        (**self).read_tail(positions, max, block).await
    }

    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<(), Error> {
        (**self).trim_min_id(stream, min_id).await
    }

    async fn length(&self, stream: &str) -> Result<u64, Error> {
        (**self).length(stream).await
    }
}

#[derive(Debug, Default, Clone)]
struct GroupState {
    /// Index into the stream's entry log of the next entry to deliver.
    next_new: usize,
    /// Unacked entries handed to each consumer, by id, for recovery replay.
    pending: HashMap<String, Vec<StreamEntry>>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

/// An in-memory [`BrokerClient`] used by the core's own test suite and by
/// integration tests exercising end-to-end scenarios without a real
/// broker.
#[derive(Default)]
pub struct InMemoryBroker {
    streams: Mutex<HashMap<String, StreamState>>,
    next_id: Mutex<u64>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_message_id(&self) -> String {
        let mut counter = self.next_id.lock().expect("lock poisoned");
        let id = *counter;
        *counter += 1;
        format!("{id:020}-0")
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn append(&self, stream: &str, fields: EncodedFields) -> Result<String, Error> {
        let id = self.next_message_id();
        let mut streams = self.streams.lock().expect("lock poisoned");
        streams
            .entry(stream.to_owned())
            .or_default()
            .entries
            .push((id.clone(), fields));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        let mut streams = self.streams.lock().expect("lock poisoned");
        let state = streams.entry(stream.to_owned()).or_default();
        state.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[(String, StreamPosition)],
        group: &str,
        consumer: &str,
        max: usize,
        _block: Duration,
    ) -> Result<Vec<StreamBatch>, Error> {
        let mut guard = self.streams.lock().expect("lock poisoned");
        let mut out = Vec::with_capacity(streams.len());

        for (stream, position) in streams {
            let Some(state) = guard.get_mut(stream) else {
                continue;
            };
            let Some(group_state) = state.groups.get_mut(group) else {
                continue;
            };

            let batch = match position {
                StreamPosition::New => {
                    let available = &state.entries[group_state.next_new.min(state.entries.len())..];
                    let take = available.len().min(max);
                    let taken: Vec<StreamEntry> = available[..take].to_vec();
                    group_state.next_new += take;
                    group_state
                        .pending
                        .entry(consumer.to_owned())
                        .or_default()
                        .extend(taken.iter().cloned());
                    taken
                }
                StreamPosition::Pending => {
                    let pending = group_state.pending.entry(consumer.to_owned()).or_default();
                    let take = pending.len().min(max);
                    pending.iter().take(take).cloned().collect()
                }
            };

            if !batch.is_empty() {
                out.push(StreamBatch {
                    stream: stream.clone(),
                    entries: batch,
                });
            }
        }

        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), Error> {
        let mut streams = self.streams.lock().expect("lock poisoned");
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                for pending in group_state.pending.values_mut() {
                    pending.retain(|(id, _)| !ids.contains(id));
                }
            }
        }
        Ok(())
    }

    async fn read_tail(
        &self,
        positions: &[(String, String)],
        max: usize,
        _block: Duration,
    ) -> Result<Vec<StreamBatch>, Error> {
        let streams = self.streams.lock().expect("lock poisoned");
        let mut out = Vec::with_capacity(positions.len());

        for (stream, after_id) in positions {
            let Some(state) = streams.get(stream) else {
                continue;
            };
            let start = if after_id.is_empty() || after_id == "0" {
                0
            } else {
                state
                    .entries
                    .iter()
                    .position(|(id, _)| id == after_id)
                    .map_or(0, |idx| idx + 1)
            };
            let entries: Vec<StreamEntry> = state
                .entries
                .get(start..)
                .unwrap_or_default()
                .iter()
                .take(max)
                .cloned()
                .collect();

            if !entries.is_empty() {
                out.push(StreamBatch {
                    stream: stream.clone(),
                    entries,
                });
            }
        }

        Ok(out)
    }

    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<(), Error> {
        let mut streams = self.streams.lock().expect("lock poisoned");
        if let Some(state) = streams.get_mut(stream) {
            state
                .entries
                .retain(|(id, _)| compare_stream_ids(id, min_id) != std::cmp::Ordering::Less);
        }
        Ok(())
    }

    async fn length(&self, stream: &str) -> Result<u64, Error> {
        let streams = self.streams.lock().expect("lock poisoned");
        Ok(streams.get(stream).map_or(0, |s| s.entries.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> EncodedFields {
        EncodedFields::from([("value".to_owned(), v.to_owned())])
    }

    #[tokio::test]
    async fn append_assigns_monotone_ids() {
        let broker = InMemoryBroker::new();
        let first = broker.append("s1", fields("1")).await.unwrap();
        let second = broker.append("s1", fields("2")).await.unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let broker = InMemoryBroker::new();
        broker.ensure_group("s1", "g1").await.unwrap();
        broker.ensure_group("s1", "g1").await.unwrap();
    }

    #[tokio::test]
    async fn read_group_delivers_each_entry_once() {
        let broker = InMemoryBroker::new();
        broker.ensure_group("s1", "g1").await.unwrap();
        broker.append("s1", fields("1")).await.unwrap();

        let streams = vec![("s1".to_owned(), StreamPosition::New)];
        let first = broker
            .read_group(&streams, "g1", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].entries.len(), 1);

        let second = broker
            .read_group(&streams, "g1", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn unacked_entries_replay_as_pending() {
        let broker = InMemoryBroker::new();
        broker.ensure_group("s1", "g1").await.unwrap();
        let id = broker.append("s1", fields("1")).await.unwrap();

        let new_pos = vec![("s1".to_owned(), StreamPosition::New)];
        broker
            .read_group(&new_pos, "g1", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();

        let pending_pos = vec![("s1".to_owned(), StreamPosition::Pending)];
        let replayed = broker
            .read_group(&pending_pos, "g1", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(replayed[0].entries[0].0, id);

        broker.ack("s1", "g1", &[id]).await.unwrap();
        let replayed_after_ack = broker
            .read_group(&pending_pos, "g1", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert!(replayed_after_ack.is_empty());
    }

    #[tokio::test]
    async fn trim_min_id_deletes_older_entries() {
        let broker = InMemoryBroker::new();
        let first = broker.append("s1", fields("1")).await.unwrap();
        let _second = broker.append("s1", fields("2")).await.unwrap();
        let third = broker.append("s1", fields("3")).await.unwrap();

        broker.trim_min_id("s1", &third).await.unwrap();
        assert_eq!(broker.length("s1").await.unwrap(), 1);

        // no-op on a stream that was never created
        broker.trim_min_id("missing", &first).await.unwrap();
    }

    #[test]
    fn stream_id_ordering_is_numeric_not_lexicographic() {
        // A zero-padded test-double id and a native, unpadded Redis id
        // referring to the same instant must compare equal numerically
        // even though their byte representations differ in width.
        assert_eq!(
            compare_stream_ids("00000000001700000000-0", "1700000000-0"),
            std::cmp::Ordering::Equal
        );

        // Byte order would rank "99-0" above "100-0" (`'9' > '1'`); numeric
        // order must not.
        assert_eq!(compare_stream_ids("99-0", "100-0"), std::cmp::Ordering::Less);

        // A large unpadded Redis-shaped id must still compare greater than
        // a small zero-padded one, not less (the defect this guards).
        assert_eq!(
            compare_stream_ids("1753512345678-3", "00000000000000000003-0"),
            std::cmp::Ordering::Greater
        );
    }

    #[tokio::test]
    async fn trim_min_id_compares_numerically_across_differently_shaped_ids() {
        let broker = InMemoryBroker::new();
        let first = broker.append("s1", fields("1")).await.unwrap();
        let _second = broker.append("s1", fields("2")).await.unwrap();
        let third = broker.append("s1", fields("3")).await.unwrap();

        // `min_id` shaped like a native Redis id (no zero padding) but
        // numerically equal to `third`: must retain exactly the entries at
        // or after `third`, the same as trimming with `third` itself.
        let (ms, seq) = parse_stream_id(&third);
        broker.trim_min_id("s1", &format!("{ms}-{seq}")).await.unwrap();

        let _ = first;
        assert_eq!(broker.length("s1").await.unwrap(), 1);
    }
}

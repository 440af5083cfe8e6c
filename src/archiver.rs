//! The archiver (C7): periodic drain of every tracked broker stream into
//! the cold store, with idempotent per-entry archival and retention trim.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use tokio::sync::watch;

use crate::broker::{compare_stream_ids, BrokerClient};
use crate::config::Config;
use crate::error::Result;
use crate::model::{MonoEvent, MultiEvent};
use crate::store::ColdStore;
use crate::{log_debug, log_error, log_warn};

/// Which record type a tracked stream carries, threaded explicitly instead
/// of inspected at runtime (§9 design note on tagged polymorphism).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    Mono,
    Multi,
}

/// A broker stream the archiver drains, together with the record type it
/// carries.
#[derive(Debug, Clone)]
pub struct TrackedStream {
    pub name: String,
    pub class: StreamClass,
}

enum DecodedEvent {
    Mono(MonoEvent),
    Multi(MultiEvent),
}

/// Drains every [`TrackedStream`] into the cold store on a fixed cadence,
/// then trims the broker down to the retention cutoff (§4.7).
pub struct Archiver<B: BrokerClient, S: ColdStore> {
    broker: B,
    store: S,
    streams: Vec<TrackedStream>,
    max_batch: usize,
    interval: Duration,
    retention: Duration,
    cursors: HashMap<String, String>,
    malformed_count: u64,
}

impl<B: BrokerClient, S: ColdStore> Archiver<B, S> {
    #[must_use]
    pub fn new(broker: B, store: S, config: &Config, streams: Vec<TrackedStream>) -> Self {
        Self {
            broker,
            store,
            streams,
            max_batch: config.max_events_per_archive_batch as usize,
            interval: config.archival_interval(),
            retention: config.retention(),
            cursors: HashMap::new(),
            malformed_count: 0,
        }
    }

    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    /// Runs archival cycles until `shutdown` reports `true`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, shutdown)))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.seed_cursors().await?;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if let Err(err) = self.run_cycle().await {
                if err.is_retryable() {
                    log_error!(error = %err, "archival cycle aborted, retrying next interval");
                } else {
                    return Err(err);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Looks up every tracked stream's latest checkpoint concurrently,
    /// rather than one round trip at a time.
    async fn seed_cursors(&mut self) -> Result<()> {
        let streams = self.streams.clone();
        let lookups = streams
            .iter()
            .map(|stream| self.store.latest_checkpoint_id(&stream.name));
        let results = try_join_all(lookups).await?;

        for (stream, id) in streams.iter().zip(results) {
            if let Some(id) = id {
                self.cursors.insert(stream.name.clone(), id);
            }
        }
        Ok(())
    }

    /// One archival pass over every tracked stream, followed by retention
    /// trim.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    async fn run_cycle(&mut self) -> Result<()> {
        for stream in self.streams.clone() {
            self.archive_stream(&stream).await?;
        }
        self.trim_retained().await?;
        Ok(())
    }

    async fn archive_stream(&mut self, stream: &TrackedStream) -> Result<()> {
        let after = self.cursors.get(&stream.name).cloned().unwrap_or_default();
        let positions = vec![(stream.name.clone(), after)];
        let batches = self
            .broker
            .read_tail(&positions, self.max_batch, Duration::ZERO)
            .await?;

        for batch in batches {
            for (msg_id, fields) in batch.entries {
                let decoded = match stream.class {
                    StreamClass::Mono => {
                        MonoEvent::decode(&fields, stream.name.clone()).map(DecodedEvent::Mono)
                    }
                    StreamClass::Multi => MultiEvent::decode(&fields).map(DecodedEvent::Multi),
                };

                let event = match decoded {
                    Ok(event) => event,
                    Err(err) => {
                        self.malformed_count += 1;
                        log_warn!(stream = %stream.name, id = %msg_id, error = %err, "skipping malformed archive entry without checkpoint");
                        continue;
                    }
                };

                let mut unit = self.store.begin_archive_unit().await?;
                let event_id = match &event {
                    DecodedEvent::Mono(mono) => {
                        unit.insert_mono(mono).await?;
                        mono.event_id
                    }
                    DecodedEvent::Multi(multi) => {
                        unit.insert_multi(multi).await?;
                        multi.event_id
                    }
                };

                let newly_archived = unit.try_mark_archived(&stream.name, &msg_id, event_id).await?;
                if newly_archived {
                    unit.commit().await?;
                } else {
                    log_debug!(stream = %stream.name, id = %msg_id, "already archived by a concurrent archiver");
                    unit.rollback().await?;
                }

                self.cursors.insert(stream.name.clone(), msg_id);
            }
        }

        Ok(())
    }

    async fn trim_retained(&mut self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        // Unpadded `<ms>-0`, matching the shape real broker ids take (e.g.
        // native Redis Stream ids) rather than any one backend's padding,
        // since `compare_stream_ids` below compares numeric components.
        let cutoff_id = format!("{}-0", cutoff.timestamp_millis().max(0));

        for stream in &self.streams {
            let safe_cutoff = match self.cursors.get(&stream.name) {
                Some(archived) if compare_stream_ids(archived, &cutoff_id) == std::cmp::Ordering::Less => {
                    archived.clone()
                }
                Some(_) => cutoff_id.clone(),
                None => continue,
            };
            self.broker.trim_min_id(&stream.name, &safe_cutoff).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, StreamBatch, StreamPosition};
    use crate::error::Error;
    use crate::model::{EncodedFields, Metadata};
    use crate::store::{InMemoryColdStore, MonoFilter};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn config() -> Config {
        Config {
            input_streams: vec!["s1".to_owned()],
            max_events_per_archive_batch: 1000,
            ..Config::default()
        }
    }

    /// A `BrokerClient` whose message ids take the native, unpadded
    /// `<ms>-<seq>` shape a real Redis broker returns, as opposed to
    /// `InMemoryBroker`'s zero-padded test-double ids — used to exercise
    /// `trim_retained`'s cross-format id comparison.
    #[derive(Default)]
    struct UnpaddedIdBroker {
        entries: Mutex<Vec<(String, EncodedFields)>>,
        trimmed_to: Mutex<Option<String>>,
    }

    #[async_trait]
    impl BrokerClient for UnpaddedIdBroker {
        async fn append(&self, _stream: &str, _fields: EncodedFields) -> Result<String, Error> {
            unreachable!("the archiver never appends to the streams it tracks")
        }

        async fn ensure_group(&self, _stream: &str, _group: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn read_group(
            &self,
            _streams: &[(String, StreamPosition)],
            _group: &str,
            _consumer: &str,
            _max: usize,
            _block: Duration,
        ) -> Result<Vec<StreamBatch>, Error> {
            Ok(Vec::new())
        }

        async fn ack(&self, _stream: &str, _group: &str, _ids: &[String]) -> Result<(), Error> {
            Ok(())
        }

        async fn read_tail(
            &self,
            positions: &[(String, String)],
            max: usize,
            _block: Duration,
        ) -> Result<Vec<StreamBatch>, Error> {
            let entries = self.entries.lock().expect("lock poisoned");
            let mut out = Vec::with_capacity(positions.len());
            for (stream, after_id) in positions {
                let start = if after_id.is_empty() {
                    0
                } else {
                    entries.iter().position(|(id, _)| id == after_id).map_or(0, |i| i + 1)
                };
                let batch: Vec<_> = entries.get(start..).unwrap_or_default().iter().take(max).cloned().collect();
                if !batch.is_empty() {
                    out.push(StreamBatch {
                        stream: stream.clone(),
                        entries: batch,
                    });
                }
            }
            Ok(out)
        }

        async fn trim_min_id(&self, _stream: &str, min_id: &str) -> Result<(), Error> {
            *self.trimmed_to.lock().expect("lock poisoned") = Some(min_id.to_owned());
            self.entries
                .lock()
                .expect("lock poisoned")
                .retain(|(id, _)| compare_stream_ids(id, min_id) != std::cmp::Ordering::Less);
            Ok(())
        }

        async fn length(&self, _stream: &str) -> Result<u64, Error> {
            Ok(self.entries.lock().expect("lock poisoned").len() as u64)
        }
    }

    #[tokio::test]
    async fn archival_is_idempotent_across_two_runs() {
        let broker = InMemoryBroker::new();
        let store = InMemoryColdStore::new();

        for i in 0..5 {
            let event = MonoEvent::new(Utc::now(), "s1", "A", i as f64, Metadata::new()).unwrap();
            broker.append("s1", event.encode()).await.unwrap();
        }

        let streams = vec![TrackedStream {
            name: "s1".to_owned(),
            class: StreamClass::Mono,
        }];
        let mut archiver = Archiver::new(broker, store, &config(), streams);

        archiver.run_cycle().await.unwrap();
        archiver.run_cycle().await.unwrap();

        let rows = archiver
            .store
            .query_mono(&MonoFilter::default(), 100, 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn malformed_entry_is_skipped_without_checkpoint() {
        let broker = InMemoryBroker::new();
        let store = InMemoryColdStore::new();
        let mut bad_fields = std::collections::HashMap::new();
        bad_fields.insert("event_id".to_owned(), "not-a-uuid".to_owned());
        broker.append("s1", bad_fields).await.unwrap();

        let streams = vec![TrackedStream {
            name: "s1".to_owned(),
            class: StreamClass::Mono,
        }];
        let mut archiver = Archiver::new(broker, store, &config(), streams);
        archiver.run_cycle().await.unwrap();

        assert_eq!(archiver.malformed_count(), 1);
        let rows = archiver
            .store
            .query_mono(&MonoFilter::default(), 100, 0)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn trim_retained_does_not_outrun_the_archived_cursor_with_unpadded_ids() {
        // The archiver has fallen behind: its cursor for `s1` sits a minute
        // in the past, well before the retention cutoff below. The safety
        // net (Open Question #3) must trim only up to that cursor, never
        // past it — regardless of the cursor's id format.
        let now_ms = Utc::now().timestamp_millis();
        let archived_id = format!("{}-0", now_ms - 60_000);

        let broker = UnpaddedIdBroker::default();
        let store = InMemoryColdStore::new();
        let mut cfg = config();
        cfg.redis_ttl_seconds = 5; // cutoff is `now - 5s`, long after `archived_id`
        let streams = vec![TrackedStream {
            name: "s1".to_owned(),
            class: StreamClass::Mono,
        }];

        let mut archiver = Archiver::new(broker, store, &cfg, streams);
        archiver.cursors.insert("s1".to_owned(), archived_id.clone());

        archiver.trim_retained().await.unwrap();

        let trimmed_to = archiver.broker.trimmed_to.lock().unwrap().clone();
        assert_eq!(
            trimmed_to,
            Some(archived_id),
            "trim must stop at the archived cursor, not the unguarded wall-clock cutoff"
        );
    }
}

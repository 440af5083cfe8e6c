//! The CEP worker (C6): single-consumer read → buffer → evaluate →
//! emit-then-ack loop over one consumer group.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::broker::{BrokerClient, StreamBatch, StreamPosition};
use crate::config::Config;
use crate::error::Result;
use crate::model::{CorrelationRule, MonoEvent};
use crate::rules::RuleEngine;
use crate::window::SlidingWindowBuffer;
use crate::{log_error, log_warn};

/// Single-consumer CEP loop: `ensure_group`, then read → decode → buffer →
/// evaluate → emit-then-ack, with exponential backoff on transient broker
/// failures (§4.6).
pub struct CepWorker<B: BrokerClient> {
    broker: B,
    input_streams: Vec<String>,
    integrated_stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    buffer: SlidingWindowBuffer,
    engine: RuleEngine,
}

impl<B: BrokerClient> CepWorker<B> {
    #[must_use]
    pub fn new(broker: B, config: &Config, consumer: impl Into<String>, rules: Vec<CorrelationRule>) -> Self {
        let max_window = config.max_window(&rules);
        Self {
            broker,
            input_streams: config.input_streams.clone(),
            integrated_stream: config.integrated_stream.clone(),
            group: config.consumer_group.clone(),
            consumer: consumer.into(),
            batch_size: config.event_batch_size as usize,
            block: Duration::from_millis(500),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
            buffer: SlidingWindowBuffer::new(config.max_pending_events, max_window),
            engine: RuleEngine::new(rules),
        }
    }

    /// Runs until `shutdown` reports `true`. Cancellation is observed
    /// between iterations and at every blocking read's boundary (§5).
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, shutdown)))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        for stream in self.input_streams.clone() {
            self.broker.ensure_group(&stream, &self.group).await?;
        }

        // Reclaim this consumer's own unacked entries from a prior crash
        // before joining the shared ">" cursor, so a kill between emission
        // and ack re-triggers rule evaluation on restart.
        self.drain_pending(&mut shutdown).await?;

        let mut backoff = self.backoff_base;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let positions: Vec<(String, StreamPosition)> = self
                .input_streams
                .iter()
                .cloned()
                .map(|s| (s, StreamPosition::New))
                .collect();

            let read = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                result = self.broker.read_group(&positions, &self.group, &self.consumer, self.batch_size, self.block) => result,
            };

            let batches = match read {
                Ok(batches) => {
                    backoff = self.backoff_base;
                    batches
                }
                Err(err) if err.is_retryable() => {
                    log_error!(backoff_ms = backoff.as_millis() as u64, error = %err, "broker read failed, backing off");
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.backoff_cap);
                    continue;
                }
                Err(err) => return Err(err),
            };

            for batch in batches {
                self.process_batch(batch).await?;
            }
        }
    }

    /// Replays this consumer's own previously-delivered-but-unacked
    /// entries, one read at a time, until the pending list is empty.
    async fn drain_pending(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let positions: Vec<(String, StreamPosition)> = self
                .input_streams
                .iter()
                .cloned()
                .map(|s| (s, StreamPosition::Pending))
                .collect();

            let batches = self
                .broker
                .read_group(&positions, &self.group, &self.consumer, self.batch_size, Duration::ZERO)
                .await?;

            if batches.is_empty() {
                return Ok(());
            }

            for batch in batches {
                self.process_batch(batch).await?;
            }
        }
    }

    /// Processes one stream's batch entry by entry: decode, buffer,
    /// evaluate every rule, append any emissions, then ack — in that
    /// order, so a crash before ack replays the triggering input (§4.6).
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(skip(self, batch), fields(stream = %batch.stream, entries = batch.entries.len()))
    )]
    async fn process_batch(&mut self, batch: StreamBatch) -> Result<()> {
        let StreamBatch { stream, entries } = batch;

        for (id, fields) in entries {
            match MonoEvent::decode(&fields, stream.clone()) {
                Ok(event) => {
                    let now = Utc::now();
                    self.buffer.push(event, now);

                    let emissions = self.engine.evaluate(&self.buffer, now);
                    for multi in &emissions {
                        self.broker.append(&self.integrated_stream, multi.encode()).await?;
                    }
                }
                Err(err) => {
                    log_warn!(stream = %stream, id = %id, error = %err, "dropping malformed mono event");
                }
            }

            self.broker.ack(&stream, &self.group, &[id]).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::model::{EventType, Metadata};
    use std::collections::BTreeSet;

    fn config_with_streams() -> Config {
        Config {
            input_streams: vec!["s1".to_owned(), "s2".to_owned()],
            integrated_stream: "integrated".to_owned(),
            event_batch_size: 10,
            max_pending_events: 100,
            ..Config::default()
        }
    }

    fn rule_ab() -> CorrelationRule {
        let mut types = BTreeSet::new();
        types.insert(EventType::new("A"));
        types.insert(EventType::new("B"));
        CorrelationRule::new("AB", Duration::from_secs(2), types, 2).unwrap()
    }

    #[tokio::test]
    async fn worker_emits_and_acks_on_convergence() {
        let broker = InMemoryBroker::new();
        let a = MonoEvent::new(Utc::now(), "s1", "A", 10.0, Metadata::new()).unwrap();
        broker.append("s1", a.encode()).await.unwrap();
        let b = MonoEvent::new(Utc::now(), "s2", "B", 20.0, Metadata::new()).unwrap();
        broker.append("s2", b.encode()).await.unwrap();

        let config = config_with_streams();
        let mut worker = CepWorker::new(broker, &config, "worker-1", vec![rule_ab()]);

        let (_tx, rx) = watch::channel(false);
        for stream in &config.input_streams {
            worker.broker.ensure_group(stream, &config.consumer_group).await.unwrap();
        }
        worker.drain_pending(&mut rx.clone()).await.unwrap();

        for stream in config.input_streams.clone() {
            let positions = vec![(stream.clone(), StreamPosition::New)];
            let batches = worker
                .broker
                .read_group(&positions, &config.consumer_group, "worker-1", 10, Duration::ZERO)
                .await
                .unwrap();
            for batch in batches {
                worker.process_batch(batch).await.unwrap();
            }
        }

        let length = worker.broker.length("integrated").await.unwrap();
        assert_eq!(length, 1);
    }

    #[tokio::test]
    async fn malformed_entry_is_dropped_and_acked() {
        let broker = InMemoryBroker::new();
        let mut bad_fields = std::collections::HashMap::new();
        bad_fields.insert("event_id".to_owned(), "not-a-uuid".to_owned());
        broker.append("s1", bad_fields).await.unwrap();

        let config = config_with_streams();
        let mut worker = CepWorker::new(broker, &config, "worker-1", vec![rule_ab()]);
        worker.broker.ensure_group("s1", &config.consumer_group).await.unwrap();

        let positions = vec![("s1".to_owned(), StreamPosition::New)];
        let batches = worker
            .broker
            .read_group(&positions, &config.consumer_group, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();
        for batch in batches {
            worker.process_batch(batch).await.unwrap();
        }

        // entry acked despite being malformed: it must not be redelivered
        let pending_positions = vec![("s1".to_owned(), StreamPosition::Pending)];
        let replay = worker
            .broker
            .read_group(&pending_positions, &config.consumer_group, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(replay.is_empty());
        assert!(worker.buffer.is_empty());
    }

    #[tokio::test]
    async fn crash_before_ack_replays_and_re_emits() {
        // Shared via `Arc` so a second, independent worker can reuse the
        // same broker after the first one "crashes" (§8 scenario 6).
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let a = MonoEvent::new(Utc::now(), "s1", "A", 10.0, Metadata::new()).unwrap();
        broker.append("s1", a.encode()).await.unwrap();
        let b = MonoEvent::new(Utc::now(), "s2", "B", 20.0, Metadata::new()).unwrap();
        broker.append("s2", b.encode()).await.unwrap();

        let config = config_with_streams();
        let mut worker = CepWorker::new(broker.clone(), &config, "worker-1", vec![rule_ab()]);
        for stream in &config.input_streams {
            worker.broker.ensure_group(stream, &config.consumer_group).await.unwrap();
        }

        // Read and decode both inputs into the buffer, emitting the multi
        // event, but stop short of acking — simulating a crash between
        // emission and ack (§4.6).
        for stream in config.input_streams.clone() {
            let positions = vec![(stream.clone(), StreamPosition::New)];
            let batches = worker
                .broker
                .read_group(&positions, &config.consumer_group, "worker-1", 10, Duration::ZERO)
                .await
                .unwrap();
            for batch in batches {
                for (_id, fields) in batch.entries {
                    let event = MonoEvent::decode(&fields, stream.clone()).unwrap();
                    let now = Utc::now();
                    worker.buffer.push(event, now);
                    for multi in worker.engine.evaluate(&worker.buffer, now) {
                        worker.broker.append(&worker.integrated_stream, multi.encode()).await.unwrap();
                    }
                }
            }
        }
        assert_eq!(worker.broker.length("integrated").await.unwrap(), 1);
        drop(worker); // the crash: in-memory buffer and per-rule dedup state are gone

        // Restart: a brand new worker process, same consumer identity,
        // drains the unacked pending entries before joining the shared
        // cursor. Its `RuleEngine` starts with no dedup history, so the
        // same selection is free to fire again.
        let mut restarted = CepWorker::new(broker, &config, "worker-1", vec![rule_ab()]);
        let mut rx = watch::channel(false).1;
        restarted.drain_pending(&mut rx).await.unwrap();

        // At-least-once semantics: a second multi event is emitted with a
        // new event_id but the same source selection, not deduplicated.
        assert_eq!(restarted.broker.length("integrated").await.unwrap(), 2);
    }
}

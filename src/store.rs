//! The cold store contract (C3): idempotent persistence of mono/multi
//! records and archival checkpoints, plus indexed reads.
//!
//! Concrete backends (PostgreSQL via `sqlx`, in `leaflet-store-postgres`)
//! implement [`ColdStore`]; this module also ships an in-memory reference
//! implementation exercising the same transactional contract, used by the
//! core's own tests and by the archiver's integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{EventType, MonoEvent, MultiEvent};

/// Filter parameters for [`ColdStore::query_mono`], mirroring the
/// out-of-scope HTTP query API's accepted fields.
#[derive(Debug, Clone, Default)]
pub struct MonoFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub source_stream: Option<String>,
    pub event_type: Option<EventType>,
}

/// Filter parameters for [`ColdStore::query_multi`].
#[derive(Debug, Clone, Default)]
pub struct MultiFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub correlation_rule: Option<String>,
    pub min_confidence: Option<f64>,
}

/// One archival entry's atomic insert-then-checkpoint unit (§4.3, §4.7):
/// both succeed, or both roll back.
#[async_trait]
pub trait ArchiveUnit: Send {
    async fn insert_mono(&mut self, event: &MonoEvent) -> Result<(), Error>;
    async fn insert_multi(&mut self, event: &MultiEvent) -> Result<(), Error>;

    /// Records `(stream, broker_message_id)` as archived, back-referencing
    /// `event_id`. Returns `false` without effect if the pair was already
    /// archived by a concurrent unit (I5) — the caller must then discard
    /// this unit via [`ArchiveUnit::rollback`] rather than commit it.
    async fn try_mark_archived(
        &mut self,
        stream: &str,
        broker_message_id: &str,
        event_id: Uuid,
    ) -> Result<bool, Error>;

    async fn commit(self: Box<Self>) -> Result<(), Error>;
    async fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// Abstract surface over the cold, indexed, durable store (§4.3).
#[async_trait]
pub trait ColdStore: Send + Sync {
    /// Idempotent via PK on `event_id`.
    async fn insert_mono(&self, event: &MonoEvent) -> Result<(), Error>;

    /// Idempotent via PK on `event_id`.
    async fn insert_multi(&self, event: &MultiEvent) -> Result<(), Error>;

    /// True iff newly inserted; false on unique-constraint collision.
    async fn try_mark_archived(
        &self,
        stream: &str,
        broker_message_id: &str,
        event_id: Uuid,
    ) -> Result<bool, Error>;

    /// The largest `broker_message_id` already archived for `stream`, used
    /// to seed the archiver's cursor on startup. `None` if nothing has been
    /// archived for this stream yet.
    async fn latest_checkpoint_id(&self, stream: &str) -> Result<Option<String>, Error>;

    /// Time-ordered descending.
    async fn query_mono(
        &self,
        filter: &MonoFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MonoEvent>, Error>;

    /// Time-ordered descending.
    async fn query_multi(
        &self,
        filter: &MultiFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MultiEvent>, Error>;

    /// Starts one archival entry's transactional insert-then-checkpoint
    /// unit.
    async fn begin_archive_unit(&self) -> Result<Box<dyn ArchiveUnit>, Error>;
}

#[derive(Debug, Default)]
struct Checkpoint {
    archived_at: DateTime<Utc>,
    event_id: Uuid,
}

#[derive(Default)]
struct ColdStoreState {
    mono: HashMap<Uuid, MonoEvent>,
    multi: HashMap<Uuid, MultiEvent>,
    checkpoints: HashMap<(String, String), Checkpoint>,
}

/// An in-memory [`ColdStore`] used by the core's own test suite.
#[derive(Clone, Default)]
pub struct InMemoryColdStore {
    state: Arc<Mutex<ColdStoreState>>,
}

impl InMemoryColdStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ColdStore for InMemoryColdStore {
    async fn insert_mono(&self, event: &MonoEvent) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.mono.entry(event.event_id).or_insert_with(|| event.clone());
        Ok(())
    }

    async fn insert_multi(&self, event: &MultiEvent) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.multi.entry(event.event_id).or_insert_with(|| event.clone());
        Ok(())
    }

    async fn try_mark_archived(
        &self,
        stream: &str,
        broker_message_id: &str,
        event_id: Uuid,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = (stream.to_owned(), broker_message_id.to_owned());
        if state.checkpoints.contains_key(&key) {
            return Ok(false);
        }
        state.checkpoints.insert(
            key,
            Checkpoint {
                archived_at: Utc::now(),
                event_id,
            },
        );
        Ok(true)
    }

    async fn latest_checkpoint_id(&self, stream: &str) -> Result<Option<String>, Error> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .checkpoints
            .keys()
            .filter(|(s, _)| s == stream)
            .map(|(_, id)| id.clone())
            .max())
    }

    async fn query_mono(
        &self,
        filter: &MonoFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MonoEvent>, Error> {
        let state = self.state.lock().expect("lock poisoned");
        let mut matched: Vec<MonoEvent> = state
            .mono
            .values()
            .filter(|e| matches_mono(e, filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(paginate(matched, limit, offset))
    }

    async fn query_multi(
        &self,
        filter: &MultiFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MultiEvent>, Error> {
        let state = self.state.lock().expect("lock poisoned");
        let mut matched: Vec<MultiEvent> = state
            .multi
            .values()
            .filter(|e| matches_multi(e, filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(paginate(matched, limit, offset))
    }

    async fn begin_archive_unit(&self) -> Result<Box<dyn ArchiveUnit>, Error> {
        Ok(Box::new(InMemoryArchiveUnit {
            state: Arc::clone(&self.state),
            staged_mono: Vec::new(),
            staged_multi: Vec::new(),
        }))
    }
}

fn matches_mono(event: &MonoEvent, filter: &MonoFilter) -> bool {
    filter.start_time.map_or(true, |t| event.timestamp >= t)
        && filter.end_time.map_or(true, |t| event.timestamp <= t)
        && filter
            .source_stream
            .as_ref()
            .map_or(true, |s| &event.source_stream == s)
        && filter.event_type.as_ref().map_or(true, |t| &event.event_type == t)
}

fn matches_multi(event: &MultiEvent, filter: &MultiFilter) -> bool {
    filter.start_time.map_or(true, |t| event.timestamp >= t)
        && filter.end_time.map_or(true, |t| event.timestamp <= t)
        && filter
            .correlation_rule
            .as_ref()
            .map_or(true, |r| &event.correlation_rule == r)
        && filter.min_confidence.map_or(true, |c| event.confidence >= c)
}

fn paginate<T>(items: Vec<T>, limit: u32, offset: u32) -> Vec<T> {
    items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}

/// The in-memory [`ArchiveUnit`]: inserts stage locally until commit, while
/// the checkpoint check-and-set happens eagerly and atomically against the
/// shared state, since it is the single source of truth for I5.
struct InMemoryArchiveUnit {
    state: Arc<Mutex<ColdStoreState>>,
    staged_mono: Vec<MonoEvent>,
    staged_multi: Vec<MultiEvent>,
}

#[async_trait]
impl ArchiveUnit for InMemoryArchiveUnit {
    async fn insert_mono(&mut self, event: &MonoEvent) -> Result<(), Error> {
        self.staged_mono.push(event.clone());
        Ok(())
    }

    async fn insert_multi(&mut self, event: &MultiEvent) -> Result<(), Error> {
        self.staged_multi.push(event.clone());
        Ok(())
    }

    async fn try_mark_archived(
        &mut self,
        stream: &str,
        broker_message_id: &str,
        event_id: Uuid,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = (stream.to_owned(), broker_message_id.to_owned());
        if state.checkpoints.contains_key(&key) {
            return Ok(false);
        }
        state.checkpoints.insert(
            key,
            Checkpoint {
                archived_at: Utc::now(),
                event_id,
            },
        );
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        for event in self.staged_mono {
            state.mono.entry(event.event_id).or_insert(event);
        }
        for event in self.staged_multi {
            state.multi.entry(event.event_id).or_insert(event);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

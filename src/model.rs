//! Canonical mono/multi event records and their wire-form serialization.
//!
//! Mono events are created by external producers and observed by exactly
//! one CEP worker; multi events are created by the [rule engine][crate::rules]
//! once a [`CorrelationRule`] is satisfied. Neither is ever mutated after
//! construction — invalid values are rejected at the constructor, not
//! patched up later.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Encoded wire form of an event: a flat string-to-string map, matching
/// what the broker stores per stream entry.
pub type EncodedFields = HashMap<String, String>;

/// A scalar value attached to a [`MonoEvent`] under a metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
}

/// Free-form metadata attached to a [`MonoEvent`]; may be empty.
pub type Metadata = HashMap<String, MetadataValue>;

/// A tag identifying the kind of a [`MonoEvent`].
///
/// Modeled as a newtype around a string, rather than a closed enum, because
/// the tag set is "closed but extensible additively" (§3): new tags can be
/// introduced by producers without a code change here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    /// Fixed tag carried by every [`MultiEvent`].
    pub const MULTI_ORIGINATED: &'static str = "MULTI_ORIGINATED";

    /// Creates a new event type tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single-source ("mono-originated") event observed on one input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonoEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_stream: String,
    pub event_type: EventType,
    pub value: f64,
    pub metadata: Metadata,
}

impl MonoEvent {
    /// Constructs a new mono event, generating a fresh [`Uuid`] for
    /// `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `value` is not finite (NaN/Inf are
    /// rejected per §3).
    pub fn new(
        timestamp: DateTime<Utc>,
        source_stream: impl Into<String>,
        event_type: impl Into<EventType>,
        value: f64,
        metadata: Metadata,
    ) -> Result<Self, Error> {
        if !value.is_finite() {
            return Err(Error::Config(format!(
                "mono event value must be finite, got {value}"
            )));
        }

        Ok(Self {
            event_id: Uuid::now_v7(),
            timestamp,
            source_stream: source_stream.into(),
            event_type: event_type.into(),
            value,
            metadata,
        })
    }

    /// Encodes this event into the broker's flat string wire form (§4.1).
    #[must_use]
    pub fn encode(&self) -> EncodedFields {
        let mut fields = EncodedFields::new();
        fields.insert("event_id".to_owned(), self.event_id.to_string());
        fields.insert(
            "timestamp".to_owned(),
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        fields.insert("source_stream".to_owned(), self.source_stream.clone());
        fields.insert("event_type".to_owned(), self.event_type.as_str().to_owned());
        fields.insert("value".to_owned(), self.value.to_string());
        fields.insert(
            "metadata".to_owned(),
            serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_owned()),
        );
        fields
    }

    /// Decodes a mono event from its broker wire form.
    ///
    /// `source_stream` is supplied separately because the broker associates
    /// it with the stream the entry arrived on, not the entry's own fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] on a missing field, a bad numeric
    /// or timestamp parse, a bad id, or invalid embedded JSON.
    pub fn decode(fields: &EncodedFields, source_stream: impl Into<String>) -> Result<Self, Error> {
        let event_id = field(fields, "event_id")?;
        let event_id = Uuid::parse_str(event_id)
            .map_err(|e| Error::malformed(format!("bad event_id: {e}")))?;

        let timestamp = field(fields, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| Error::malformed(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);

        let event_type = field(fields, "event_type")?;

        let value = field(fields, "value")?;
        let value: f64 = value
            .parse()
            .map_err(|e| Error::malformed(format!("bad value: {e}")))?;
        if !value.is_finite() {
            return Err(Error::malformed("value must be finite"));
        }

        let metadata = match fields.get("metadata") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| Error::malformed(format!("bad metadata json: {e}")))?,
            _ => Metadata::new(),
        };

        Ok(Self {
            event_id,
            timestamp,
            source_stream: source_stream.into(),
            event_type: EventType::new(event_type.clone()),
            value,
            metadata,
        })
    }
}

/// A single source's representative contribution inside a [`MultiEvent`]'s
/// lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// An integrated ("multi-originated") event correlating two or more mono
/// events across distinct source streams within a time window.
///
/// Only ever constructed by the [rule engine][crate::rules]: its derived
/// fields (`integrated_value`, `confidence`) and its `lineage` are fixed
/// functions of `source_events`, so there is no public fallible
/// constructor — correctness is upheld by the rule engine, not by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_events: Vec<Uuid>,
    pub correlation_rule: String,
    pub integrated_value: f64,
    pub confidence: f64,
    pub lineage: HashMap<String, LineageEntry>,
}

impl MultiEvent {
    /// The fixed event type tag carried by every multi event.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        EventType::MULTI_ORIGINATED
    }

    /// Encodes this event into the broker's flat string wire form (§4.1).
    #[must_use]
    pub fn encode(&self) -> EncodedFields {
        let mut fields = EncodedFields::new();
        fields.insert("event_id".to_owned(), self.event_id.to_string());
        fields.insert(
            "timestamp".to_owned(),
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        fields.insert("event_type".to_owned(), self.event_type().to_owned());
        fields.insert(
            "source_events".to_owned(),
            self.source_events
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        fields.insert("correlation_rule".to_owned(), self.correlation_rule.clone());
        fields.insert("integrated_value".to_owned(), self.integrated_value.to_string());
        fields.insert("confidence".to_owned(), self.confidence.to_string());
        fields.insert(
            "lineage".to_owned(),
            serde_json::to_string(&self.lineage).unwrap_or_else(|_| "{}".to_owned()),
        );
        fields
    }

    /// Decodes a multi event from its broker wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] on a missing field, a bad numeric
    /// or timestamp parse, a bad id list, or invalid embedded JSON.
    pub fn decode(fields: &EncodedFields) -> Result<Self, Error> {
        let event_id = field(fields, "event_id")?;
        let event_id = Uuid::parse_str(event_id)
            .map_err(|e| Error::malformed(format!("bad event_id: {e}")))?;

        let timestamp = field(fields, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| Error::malformed(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);

        let source_events = field(fields, "source_events")?;
        let source_events = source_events
            .split(',')
            .map(|s| {
                Uuid::parse_str(s).map_err(|e| Error::malformed(format!("bad source event id: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if source_events.len() < 2 {
            return Err(Error::malformed("source_events must have at least 2 entries"));
        }

        let correlation_rule = field(fields, "correlation_rule")?.clone();

        let integrated_value: f64 = field(fields, "integrated_value")?
            .parse()
            .map_err(|e| Error::malformed(format!("bad integrated_value: {e}")))?;

        let confidence: f64 = field(fields, "confidence")?
            .parse()
            .map_err(|e| Error::malformed(format!("bad confidence: {e}")))?;

        let lineage = match fields.get("lineage") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| Error::malformed(format!("bad lineage json: {e}")))?,
            _ => HashMap::new(),
        };

        Ok(Self {
            event_id,
            timestamp,
            source_events,
            correlation_rule,
            integrated_value,
            confidence,
            lineage,
        })
    }
}

fn field<'a>(fields: &'a EncodedFields, name: &'static str) -> Result<&'a String, Error> {
    fields
        .get(name)
        .ok_or_else(|| Error::malformed(format!("missing field `{name}`")))
}

/// A correlation rule: a window, a set of required event types, and a
/// minimum cardinality, as described in §3/§4.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRule {
    pub name: String,
    pub window_duration: Duration,
    pub required_event_types: BTreeSet<EventType>,
    pub min_events: u32,
}

impl CorrelationRule {
    const MIN_WINDOW: Duration = Duration::from_millis(100);
    const MAX_WINDOW: Duration = Duration::from_secs(60);

    /// Constructs a new correlation rule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `window_duration` is outside
    /// `[0.1s, 60s]`, `required_event_types` is empty, or `min_events` is
    /// outside `[2, 10]`.
    pub fn new(
        name: impl Into<String>,
        window_duration: Duration,
        required_event_types: BTreeSet<EventType>,
        min_events: u32,
    ) -> Result<Self, Error> {
        if window_duration < Self::MIN_WINDOW || window_duration > Self::MAX_WINDOW {
            return Err(Error::Config(format!(
                "window_duration must be within [0.1s, 60s], got {window_duration:?}"
            )));
        }
        if required_event_types.is_empty() {
            return Err(Error::Config(
                "required_event_types must not be empty".to_owned(),
            ));
        }
        if !(2..=10).contains(&min_events) {
            return Err(Error::Config(format!(
                "min_events must be within [2, 10], got {min_events}"
            )));
        }

        Ok(Self {
            name: name.into(),
            window_duration,
            required_event_types,
            min_events,
        })
    }
}

/// A persisted marker that a given `(stream_name, broker_message_id)` pair
/// has been durably archived, used to enforce idempotent archival (I5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivalCheckpoint {
    pub stream_name: String,
    pub broker_message_id: String,
    pub archived_at: DateTime<Utc>,
    pub event_id: Uuid,
}

//! Complex event processing core: ingests mono-originated events from
//! multiple producers, correlates them inside a sliding time window, emits
//! multi-originated events carrying source lineage, and archives both
//! tiers into durable storage.
//!
//! This crate is transport-agnostic: [`broker::BrokerClient`] and
//! [`store::ColdStore`] are trait contracts. Concrete backends live in
//! sibling workspace crates (`leaflet-broker-redis`, `leaflet-store-postgres`);
//! in-memory reference implementations here back this crate's own tests.

pub mod archiver;
pub mod broker;
pub mod config;
pub mod error;
pub mod model;
pub mod rules;
pub mod store;
pub mod telemetry;
pub mod window;
pub mod worker;

pub use archiver::{Archiver, StreamClass, TrackedStream};
pub use broker::{
    compare_stream_ids, parse_stream_id, BrokerClient, InMemoryBroker, StreamBatch, StreamPosition,
};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use model::{
    ArchivalCheckpoint, CorrelationRule, EncodedFields, EventType, LineageEntry, Metadata,
    MetadataValue, MonoEvent, MultiEvent,
};
pub use rules::RuleEngine;
pub use store::{ArchiveUnit, ColdStore, InMemoryColdStore, MonoFilter, MultiFilter};
pub use window::SlidingWindowBuffer;
pub use worker::CepWorker;

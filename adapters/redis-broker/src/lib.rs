//! Redis Streams backend for the `leaflet-cep` broker client contract.
//!
//! ```ignore
//! let broker = RedisBroker::connect("redis://127.0.0.1:6379").await?;
//! ```

mod client;
mod error;

pub use client::RedisBroker;
pub use error::BrokerError;

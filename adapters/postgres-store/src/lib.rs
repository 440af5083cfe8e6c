//! PostgreSQL backend for the `leaflet-cep` cold store contract.
//!
//! ```ignore
//! let store = PgColdStore::connect("postgres://localhost/leaflet").await?;
//! ```

mod error;
mod store;

pub use error::StoreError;
pub use store::{PgColdStore, MIGRATIONS};

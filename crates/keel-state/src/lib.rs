//! keel-state: embedded state store for keel.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for application records, registries, and cluster settings.
//!
//! # Architecture
//!
//! ```text
//!   AppsDataStore ──┐                  ┌─ apps        (name -> AppDefinition)
//!                   ├──► StateStore ───┼─ registries  ("list" -> [RegistryInfo])
//!   RegistriesDataStore ┘              └─ settings    ("cluster" -> ClusterSettings)
//! ```
//!
//! `StateStore` is the raw typed layer; the data stores on top of it enforce
//! the record rules (name validation, version history, custom domains).
//! Read-modify-write operations run inside a single redb write transaction,
//! so a failed validation leaves the stored record untouched.

pub mod apps;
pub mod error;
pub mod registries;
pub mod store;
pub mod tables;

pub use apps::{AppUpdate, AppsDataStore};
pub use error::{StateError, StateResult};
pub use registries::RegistriesDataStore;
pub use store::StateStore;

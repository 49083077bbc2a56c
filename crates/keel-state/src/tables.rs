//! redb table definitions for the keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Application records keyed by app name.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Registry list stored under [`REGISTRY_LIST_KEY`]. Order is significant
/// for credential lookup, so the list is kept as one value.
pub const REGISTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("registries");

/// Cluster settings stored under [`CLUSTER_SETTINGS_KEY`].
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

pub const REGISTRY_LIST_KEY: &str = "list";
pub const CLUSTER_SETTINGS_KEY: &str = "cluster";

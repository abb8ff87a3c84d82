//! redb table definitions for the tierlift state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Application records keyed by `{tenant}.{application}.{instance}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Job outcomes keyed by `{version}/{application}/{job_type}/{number}`.
pub const OUTCOMES: TableDefinition<&str, &[u8]> = TableDefinition::new("outcomes");

/// Singleton values (the system version) keyed by name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Key of the system version in [`META`].
pub const SYSTEM_VERSION_KEY: &str = "system_version";

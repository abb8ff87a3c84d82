//! StateStore — redb-backed version registry and outcome history.
//!
//! Provides typed operations over applications, the system version, and job
//! outcomes. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing and simulation).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use tierlift_core::{ApplicationId, Change, Environment, Version};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(OUTCOMES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── System version ─────────────────────────────────────────────

    /// The current system version, if one has been set.
    pub fn system_version(&self) -> StateResult<Option<Version>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        match table.get(SYSTEM_VERSION_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let version: Version =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    /// Set the system version. It only ever moves forward.
    pub fn set_system_version(&self, version: &Version) -> StateResult<()> {
        if let Some(current) = self.system_version()? {
            if &current > version {
                return Err(StateError::VersionRegression {
                    current,
                    proposed: version.clone(),
                });
            }
            if &current == version {
                return Ok(());
            }
        }

        let value = serde_json::to_vec(version).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(META).map_err(map_err!(Table))?;
            table
                .insert(SYSTEM_VERSION_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%version, "system version updated");
        Ok(())
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application record.
    pub fn put_application(&self, record: &ApplicationRecord) -> StateResult<()> {
        check_id(&record.id)?;
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "application stored");
        Ok(())
    }

    /// Get an application by id.
    pub fn get_application(&self, id: &ApplicationId) -> StateResult<Option<ApplicationRecord>> {
        let key = id.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ApplicationRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Get an application by id, failing if it is unknown.
    pub fn require_application(&self, id: &ApplicationId) -> StateResult<ApplicationRecord> {
        self.get_application(id)?
            .ok_or_else(|| StateError::NotFound(format!("application {id}")))
    }

    /// List all applications, ordered by id.
    pub fn list_applications(&self) -> StateResult<Vec<ApplicationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ApplicationRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }

    /// Delete an application. Returns true if it existed.
    pub fn delete_application(&self, id: &ApplicationId) -> StateResult<bool> {
        let key = id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "application deleted");
        Ok(existed)
    }

    /// The lowest version the application runs in an environment.
    pub fn deployed_version(
        &self,
        id: &ApplicationId,
        environment: Environment,
    ) -> StateResult<Option<Version>> {
        Ok(self.require_application(id)?.deployed_version(environment))
    }

    /// Set the change an application is adopting.
    ///
    /// Setting the current change again is a no-op. A different change is
    /// refused while a job for the current one is outstanding.
    pub fn set_pending_change(&self, id: &ApplicationId, change: &Change) -> StateResult<()> {
        let mut record = self.require_application(id)?;
        if record.change.as_ref() == Some(change) {
            return Ok(());
        }
        if !record.accepts_change(change) {
            return Err(StateError::Conflict(format!(
                "{id} has a job in flight; it must complete or be cancelled first"
            )));
        }
        record.change = Some(change.clone());
        record.updated_at = epoch_secs();
        self.put_application(&record)
    }

    /// Clear the change an application is adopting, along with its in-flight job.
    pub fn clear_pending_change(&self, id: &ApplicationId) -> StateResult<()> {
        let mut record = self.require_application(id)?;
        if record.change.is_none() && record.in_flight.is_none() {
            return Ok(());
        }
        record.change = None;
        record.in_flight = None;
        record.updated_at = epoch_secs();
        self.put_application(&record)
    }

    // ── Outcomes ───────────────────────────────────────────────────

    /// Append a job outcome. Returns false if the same job instance was
    /// already recorded.
    pub fn record_outcome(&self, outcome: &JobOutcome) -> StateResult<bool> {
        check_id(&outcome.application)?;
        let key = outcome.table_key();
        let value = serde_json::to_vec(outcome).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(OUTCOMES).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if !exists {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, inserted, "outcome recorded");
        Ok(inserted)
    }

    /// All outcomes recorded for a version, ordered by application, job and number.
    pub fn outcomes_for_version(&self, version: &Version) -> StateResult<Vec<JobOutcome>> {
        let prefix = outcome_prefix(version);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OUTCOMES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let outcome: JobOutcome =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(outcome);
            }
        }
        Ok(results)
    }

    /// Distinct versions with recorded outcomes.
    pub fn outcome_versions(&self) -> StateResult<BTreeSet<Version>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OUTCOMES).map_err(map_err!(Table))?;
        let mut versions = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(version) = key_version(key.value()) {
                versions.insert(version);
            }
        }
        Ok(versions)
    }

    /// Drop outcomes for versions older than `cutoff`. Returns number deleted.
    pub fn prune_outcomes_before(&self, cutoff: &Version) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(OUTCOMES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    key_version(&k).is_some_and(|v| &v < cutoff).then_some(k)
                })
                .collect()
        };
        if keys.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(OUTCOMES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cutoff, pruned = count, "outcome history pruned");
        Ok(count)
    }
}

/// Parse the version prefix of an outcome key.
fn key_version(key: &str) -> Option<Version> {
    key.split('/').next()?.parse().ok()
}

/// Ids whose components hold `.` or `/` would collide with other keys.
fn check_id(id: &ApplicationId) -> StateResult<()> {
    if id.is_valid() {
        Ok(())
    } else {
        Err(StateError::InvalidKey(format!("application id '{id}'")))
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! StateStore: redb-backed state persistence for keel.
//!
//! Provides typed CRUD operations over application records, registries and
//! cluster settings. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use keel_core::{AppDefinition, ClusterSettings, RegistryInfo};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn app_not_found(name: &str) -> StateError {
    StateError::NotFound(format!(
        "App ({name}) could not be found. Make sure that you have created the app."
    ))
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

    /// Create an ephemeral in-memory state store (for testing).
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

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(REGISTRIES).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Apps ───────────────────────────────────────────────────────

    /// Store a new app record. Fails if the name is taken.
    pub fn insert_app(&self, app: &AppDefinition) -> StateResult<()> {
        let key = app.name.as_str();
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(
                    "App Name already exists. Please use a different name".to_string(),
                ));
            }
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "app stored");
        Ok(())
    }

    /// Overwrite an app record unconditionally.
    pub fn put_app(&self, app: &AppDefinition) -> StateResult<()> {
        let key = app.name.as_str();
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "app stored");
        Ok(())
    }

    pub fn get_app(&self, name: &str) -> StateResult<Option<AppDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let app: AppDefinition =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// List all apps, ordered by name.
    pub fn list_apps(&self) -> StateResult<Vec<AppDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let app: AppDefinition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(app);
        }
        Ok(results)
    }

    /// Delete an app by name. Returns true if it existed.
    pub fn delete_app(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %name, existed, "app deleted");
        Ok(existed)
    }

    /// Read-modify-write an app record in one transaction.
    ///
    /// If `f` fails the transaction is dropped and nothing is written.
    pub fn update_app<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut AppDefinition) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            let bytes = table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| app_not_found(name))?;
            let mut app: AppDefinition =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            result = f(&mut app)?;
            let value = serde_json::to_vec(&app).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %name, "app updated");
        Ok(result)
    }

    /// Move a record from `old` to `new`, applying `f` on the way.
    pub fn rename_app(
        &self,
        old: &str,
        new: &str,
        f: impl FnOnce(&mut AppDefinition) -> StateResult<()>,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            if table.get(new).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(
                    "App Name already exists. Please use a different name".to_string(),
                ));
            }
            let bytes = table
                .remove(old)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| app_not_found(old))?;
            let mut app: AppDefinition =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            app.name = new.to_string();
            f(&mut app)?;
            let value = serde_json::to_vec(&app).map_err(map_err!(Serialize))?;
            table.insert(new, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%old, %new, "app renamed");
        Ok(())
    }

    // ── Registries ─────────────────────────────────────────────────

    pub fn get_registries(&self) -> StateResult<Vec<RegistryInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REGISTRIES).map_err(map_err!(Table))?;
        match table.get(REGISTRY_LIST_KEY).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write the registry list in one transaction.
    pub fn update_registries<R>(
        &self,
        f: impl FnOnce(&mut Vec<RegistryInfo>) -> StateResult<R>,
    ) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(REGISTRIES).map_err(map_err!(Table))?;
            let bytes = table
                .get(REGISTRY_LIST_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let mut registries: Vec<RegistryInfo> = match bytes {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?,
                None => Vec::new(),
            };
            result = f(&mut registries)?;
            let value = serde_json::to_vec(&registries).map_err(map_err!(Serialize))?;
            table
                .insert(REGISTRY_LIST_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!("registries updated");
        Ok(result)
    }

    // ── Settings ───────────────────────────────────────────────────

    /// Cluster settings, or defaults if none were stored yet.
    pub fn get_settings(&self) -> StateResult<ClusterSettings> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        match table.get(CLUSTER_SETTINGS_KEY).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Ok(ClusterSettings::default()),
        }
    }

    pub fn put_settings(&self, settings: &ClusterSettings) -> StateResult<()> {
        let value = serde_json::to_vec(settings).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            table
                .insert(CLUSTER_SETTINGS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(root_domain = %settings.root_domain, "cluster settings stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app(name: &str) -> AppDefinition {
        AppDefinition::new(name, false, "keel-overlay-network", "./keel-definition")
    }

    #[test]
    fn test_app_crud() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_app(&test_app("api")).unwrap();
        store.insert_app(&test_app("worker")).unwrap();

        let got = store.get_app("api").unwrap().unwrap();
        assert_eq!(got.name, "api");

        let names: Vec<_> = store.list_apps().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["api", "worker"]);

        assert!(store.delete_app("api").unwrap());
        assert!(!store.delete_app("api").unwrap());
        assert!(store.get_app("api").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_app(&test_app("api")).unwrap();
        let err = store.insert_app(&test_app("api")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_app(&test_app("api")).unwrap();

        let result: StateResult<()> = store.update_app("api", |app| {
            app.instance_count = 7;
            Err(StateError::Invalid("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.get_app("api").unwrap().unwrap().instance_count, 1);

        store.update_app("api", |app| {
            app.instance_count = 3;
            Ok(())
        })
        .unwrap();
        assert_eq!(store.get_app("api").unwrap().unwrap().instance_count, 3);
    }

    #[test]
    fn test_update_missing_app_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.update_app("ghost", |_| Ok(())).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn test_rename_moves_record() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_app(&test_app("api")).unwrap();
        store.insert_app(&test_app("taken")).unwrap();

        assert!(store.rename_app("api", "taken", |_| Ok(())).is_err());
        assert!(store.get_app("api").unwrap().is_some());

        store.rename_app("api", "api-v2", |_| Ok(())).unwrap();
        assert!(store.get_app("api").unwrap().is_none());
        assert_eq!(store.get_app("api-v2").unwrap().unwrap().name, "api-v2");
    }

    #[test]
    fn test_settings_default_and_put() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.get_settings().unwrap(), ClusterSettings::default());
        let settings = ClusterSettings {
            root_domain: "apps.example.com".into(),
            ..Default::default()
        };
        store.put_settings(&settings).unwrap();
        assert_eq!(store.get_settings().unwrap().root_domain, "apps.example.com");
    }

    #[test]
    fn test_persistent_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.insert_app(&test_app("api")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_app("api").unwrap().is_some());
    }
}

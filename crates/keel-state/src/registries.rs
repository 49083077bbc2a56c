//! Registry records and the default push registry.

use keel_core::names::remove_http_https;
use keel_core::{RegistryInfo, RegistryKind};
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

#[derive(Clone)]
pub struct RegistriesDataStore {
    store: StateStore,
}

impl RegistriesDataStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// All registries in the order they were added.
    pub fn get_all(&self) -> StateResult<Vec<RegistryInfo>> {
        self.store.get_registries()
    }

    pub fn get_by_id(&self, id: &str) -> StateResult<RegistryInfo> {
        self.get_all()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StateError::NotFound("Registry not found".to_string()))
    }

    pub fn default_push_registry_id(&self) -> StateResult<Option<String>> {
        Ok(self.store.get_settings()?.default_push_registry)
    }

    pub fn default_push_registry(&self) -> StateResult<Option<RegistryInfo>> {
        match self.default_push_registry_id()? {
            Some(id) => Ok(self.get_all()?.into_iter().find(|r| r.id == id)),
            None => Ok(None),
        }
    }

    /// Set (or clear, with `None`) the default push registry.
    pub fn set_default_push_registry(&self, id: Option<&str>) -> StateResult<()> {
        if let Some(id) = id {
            self.get_by_id(id)?;
        }
        let mut settings = self.store.get_settings()?;
        settings.default_push_registry = id.map(str::to_string);
        self.store.put_settings(&settings)?;
        info!(registry = ?id, "default push registry set");
        Ok(())
    }

    /// Store a registry. The first one added becomes the default push registry.
    pub fn add(
        &self,
        user: &str,
        password: &str,
        domain: &str,
        image_prefix: &str,
        kind: RegistryKind,
    ) -> StateResult<String> {
        if user.is_empty() || password.is_empty() || domain.is_empty() {
            return Err(StateError::IllegalParameter(
                "User, password and domain are required.".to_string(),
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let record = RegistryInfo {
            id: id.clone(),
            user: user.to_string(),
            password: password.to_string(),
            domain: remove_http_https(domain).to_string(),
            image_prefix: image_prefix.to_string(),
            kind,
        };
        let was_empty = self.store.update_registries(|regs| {
            let was_empty = regs.is_empty();
            regs.push(record);
            Ok(was_empty)
        })?;
        info!(registry = %id, %domain, "registry added");
        if was_empty {
            self.set_default_push_registry(Some(&id))?;
        }
        Ok(id)
    }

    pub fn update(
        &self,
        id: &str,
        user: &str,
        password: &str,
        domain: &str,
        image_prefix: &str,
    ) -> StateResult<()> {
        if id.is_empty() || user.is_empty() || password.is_empty() || domain.is_empty() {
            return Err(StateError::IllegalParameter(
                "User, password and domain are required.".to_string(),
            ));
        }
        self.store.update_registries(|regs| {
            let reg = regs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StateError::NotFound("Registry ID not found".to_string()))?;
            if reg.kind == RegistryKind::Local {
                return Err(StateError::IllegalOperation(
                    "You cannot edit self-hosted registry".to_string(),
                ));
            }
            reg.user = user.to_string();
            reg.password = password.to_string();
            reg.domain = remove_http_https(domain).to_string();
            reg.image_prefix = image_prefix.to_string();
            Ok(())
        })?;
        info!(registry = %id, "registry updated");
        Ok(())
    }

    /// Remove a registry. The default push registry cannot be removed, and
    /// the self-hosted one only when `allow_local` is set.
    pub fn delete(&self, id: &str, allow_local: bool) -> StateResult<()> {
        if self.default_push_registry_id()?.as_deref() == Some(id) {
            return Err(StateError::IllegalParameter(
                "Cannot remove the default push registry. First change the default push registry."
                    .to_string(),
            ));
        }
        self.store.update_registries(|regs| {
            let pos = regs
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| StateError::NotFound("Registry not found".to_string()))?;
            if regs[pos].kind == RegistryKind::Local && !allow_local {
                return Err(StateError::IllegalOperation(
                    "You cannot delete self-hosted registry.".to_string(),
                ));
            }
            regs.remove(pos);
            Ok(())
        })?;
        info!(registry = %id, "registry deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ApiStatus;

    fn data_store() -> RegistriesDataStore {
        RegistriesDataStore::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_first_registry_becomes_default() {
        let ds = data_store();
        let first = ds
            .add("u", "p", "https://reg.example.com", "", RegistryKind::Remote)
            .unwrap();
        let second = ds
            .add("u", "p", "other.example.com", "team", RegistryKind::Remote)
            .unwrap();
        assert_eq!(ds.default_push_registry_id().unwrap(), Some(first.clone()));
        let all = ds.get_all().unwrap();
        assert_eq!(all[0].domain, "reg.example.com");
        assert_eq!(all[1].id, second);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let ds = data_store();
        let err = ds.add("", "p", "reg.io", "", RegistryKind::Remote).unwrap_err();
        assert_eq!(err.status(), ApiStatus::IllegalParameter);
    }

    #[test]
    fn test_delete_rules() {
        let ds = data_store();
        let default = ds.add("u", "p", "a.io", "", RegistryKind::Remote).unwrap();
        let local = ds.add("u", "p", "b.io", "", RegistryKind::Local).unwrap();

        let err = ds.delete(&default, false).unwrap_err();
        assert_eq!(err.status(), ApiStatus::IllegalParameter);

        let err = ds.delete(&local, false).unwrap_err();
        assert_eq!(err.status(), ApiStatus::IllegalOperation);
        ds.delete(&local, true).unwrap();

        ds.set_default_push_registry(None).unwrap();
        ds.delete(&default, false).unwrap();
        assert!(ds.get_all().unwrap().is_empty());
        assert_eq!(ds.delete("nope", false).unwrap_err().status(), ApiStatus::NotFound);
    }

    #[test]
    fn test_update_refuses_local() {
        let ds = data_store();
        let local = ds.add("u", "p", "b.io", "", RegistryKind::Local).unwrap();
        let err = ds.update(&local, "u2", "p2", "b.io", "").unwrap_err();
        assert_eq!(err.status(), ApiStatus::IllegalOperation);
    }

    #[test]
    fn test_set_default_unknown_registry() {
        let ds = data_store();
        let err = ds.set_default_push_registry(Some("missing")).unwrap_err();
        assert_eq!(err.status(), ApiStatus::NotFound);
    }
}

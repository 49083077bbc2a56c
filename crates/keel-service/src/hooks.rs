//! Pre-deploy hooks: named transforms applied to the draft service spec
//! right before it is submitted.
//!
//! An application opts in by naming a hook in its definition. Hooks are
//! registered in-process at startup; there is no way to inject code
//! through an application record.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use keel_core::AppDefinition;
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};

#[async_trait]
pub trait PreDeployHook: Send + Sync {
    /// Return the spec to submit, derived from `draft`.
    async fn apply(&self, app: &AppDefinition, draft: Value) -> ServiceResult<Value>;
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<RwLock<HashMap<String, Arc<dyn PreDeployHook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, hook: Arc<dyn PreDeployHook>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), hook);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The hook `app` asks for, if any.
    pub fn for_app(&self, app: &AppDefinition) -> ServiceResult<Option<Arc<dyn PreDeployHook>>> {
        let Some(name) = app.pre_deploy_hook.as_deref() else {
            return Ok(None);
        };
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                ServiceError::Hook(format!(
                    "pre-deploy hook {name} requested by {} is not registered",
                    app.name
                ))
            })
    }
}

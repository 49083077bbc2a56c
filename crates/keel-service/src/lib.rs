//! keel-service: converge orchestrator services to their app records.
//!
//! # Components
//!
//! - **`reconciler`**: `ServiceReconciler`: placeholder creation, versioned
//!   updates, node pinning, removal
//! - **`patch`**: `ServicePatch`, field-level edits of a live service spec
//! - **`overrides`**: `serviceUpdateOverride` parsing and deep merge
//! - **`hooks`**: named pre-deploy hooks run on the final spec

pub mod error;
pub mod hooks;
pub mod overrides;
pub mod patch;
pub mod reconciler;

pub use error::{ServiceError, ServiceResult};
pub use hooks::{HookRegistry, PreDeployHook};
pub use patch::{SecretRef, ServicePatch};
pub use reconciler::{DraftUpdate, ServiceReconciler};

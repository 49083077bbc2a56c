//! keel-scheduler: deployment scheduling and application management.
//!
//! ```text
//!   schedule_deploy ──► BuildScheduler ──► DeployPipeline
//!                       (one slot,          ├─ create_new_version
//!                        FIFO queue,        ├─ ImageBuilder::ensure_image
//!                        coalescing)        ├─ set_deployed_version_and_image
//!                                           └─ ServiceReconciler (after the slot is freed)
//!
//!   AppManager ──► rename / remove / update / domains / SSL / cleanup
//! ```

pub mod error;
pub mod manager;
pub mod pipeline;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use manager::{AppManager, CertificateAuthority, UnusedImage};
pub use pipeline::DeployPipeline;
pub use scheduler::{
    BuildScheduler, DeployHandle, DeployOutcome, DeployRunner, DeployedVersion, QueuedBuild,
};

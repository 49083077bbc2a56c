pub mod config;
pub mod error;
pub mod names;
pub mod registry;
pub mod source;
pub mod status;
pub mod types;

pub use config::KeelConfig;
pub use error::{CoreError, CoreResult};
pub use source::{BuildSource, RepoInfo};
pub use status::{ApiStatus, DeployFailure};
pub use types::*;

//! keel-build: from source to a deployable image.
//!
//! Accepts an uploaded tarball, a git repository or an inline definition
//! file, locates the definition, and either pulls the named image or builds
//! one from a Dockerfile (literal, path or template). Built images are tagged
//! `img-{namespace}-{app}:{version}` and pushed to the default push registry
//! when one is configured.
//!
//! # Components
//!
//! - **`builder`**: `ImageBuilder`, the build flow and its cleanup
//! - **`definition`**: definition file parsing (schemaVersion 2)
//! - **`templates`**: built-in Dockerfile templates
//! - **`git`**: HTTPS and SSH clones
//! - **`build_log`**: fixed-size per-app build logs
//! - **`registry_helper`**: registry logins, auth lookup and push

pub mod archive;
pub mod build_log;
pub mod builder;
pub mod definition;
pub mod error;
pub mod git;
mod output;
pub mod registry_helper;
pub mod templates;

pub use build_log::{AppBuildLog, BuildLog, BuildLogsManager};
pub use builder::{ImageBuilder, ImageRequest};
pub use definition::{Definition, DefinitionSource};
pub use error::{BuildError, BuildResult};
pub use registry_helper::RegistryHelper;

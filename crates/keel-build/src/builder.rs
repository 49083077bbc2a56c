//! ImageBuilder: turn a build source into a deployable image.
//!
//! ```text
//!   tarball ─┐
//!   git ─────┼─► source_files/ ─► definition ─┬─ imageName ──► pull ─────────────┐
//!   inline ──┘                                └─ Dockerfile ─► tar ─► build ─► tag ┴─► push (if a
//!                                                                                      default registry)
//! ```
//!
//! Every build works in `{raw_source_base}/{app}/{version}`, which is
//! removed afterwards together with any uploaded archive, whether the build
//! succeeded or not.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_core::names::{image_name, is_contained_relative_path};
use keel_core::{BuildSource, BuiltImage, EnvVar, KeelConfig};
use keel_docker::{BuildOptions, Orchestrator};
use tracing::{debug, info, warn};

use crate::archive;
use crate::build_log::{AppBuildLog, BuildLogsManager};
use crate::definition::{Definition, DefinitionSource, DOCKERFILE};
use crate::error::{BuildError, BuildResult};
use crate::git;
use crate::output;
use crate::registry_helper::RegistryHelper;

const RAW_SOURCE_DIRECTORY: &str = "source_files";
const BUILD_CONTEXT_TAR: &str = "image.tar";

/// One image build request.
#[derive(Debug, Clone)]
pub struct ImageRequest<'a> {
    pub source: &'a BuildSource,
    pub app: &'a str,
    /// Definition file location inside the source tree.
    pub definition_path: &'a str,
    pub version: u32,
    pub env_vars: &'a [EnvVar],
}

#[derive(Clone)]
pub struct ImageBuilder {
    orchestrator: Arc<dyn Orchestrator>,
    registry: RegistryHelper,
    logs: BuildLogsManager,
    namespace: String,
    raw_source_base: PathBuf,
    temp_dir: PathBuf,
    git_sha_env_var: String,
}

impl ImageBuilder {
    pub fn new(
        config: &KeelConfig,
        orchestrator: Arc<dyn Orchestrator>,
        registry: RegistryHelper,
        logs: BuildLogsManager,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            logs,
            namespace: config.namespace.clone(),
            raw_source_base: config.paths.raw_source_base(),
            temp_dir: config.paths.temp_dir(),
            git_sha_env_var: config.build.git_sha_env_var.clone(),
        }
    }

    pub fn logs(&self) -> &BuildLogsManager {
        &self.logs
    }

    pub fn registry(&self) -> &RegistryHelper {
        &self.registry
    }

    fn work_dir(&self, app: &str, version: u32) -> PathBuf {
        self.raw_source_base.join(app).join(version.to_string())
    }

    /// Build (or pull) the image for `req`, returning the name to deploy.
    pub async fn ensure_image(&self, req: &ImageRequest<'_>) -> BuildResult<BuiltImage> {
        let log = self.logs.for_app(req.app);
        log.clear();
        log.log(format!("------------------------- {}", chrono::Utc::now().to_rfc2822()));
        log.log(format!("Build started for {}", req.app));
        info!(app = %req.app, version = req.version, source = %req.source.describe(), "build started");

        let base_dir = self.work_dir(req.app, req.version);
        let result = self.build_in(&base_dir, req, &log).await;

        if let Err(e) = remove_dir_if_exists(&base_dir).await {
            warn!(app = %req.app, error = %e, "failed to remove build directory");
        }
        if let BuildSource::Tarball { uploaded_tar_path, .. } = req.source {
            if let Err(e) = remove_file_if_exists(uploaded_tar_path).await {
                warn!(app = %req.app, error = %e, "failed to remove uploaded archive");
            }
        }

        match result {
            Ok(image) => {
                log.log("Build has finished successfully!");
                info!(app = %req.app, image = %image.image_name, "build finished");
                Ok(image)
            }
            Err(e) => {
                log.log("Build has failed!");
                warn!(app = %req.app, error = %e, "build failed");
                Err(e)
            }
        }
    }

    async fn build_in(
        &self,
        base_dir: &Path,
        req: &ImageRequest<'_>,
        log: &AppBuildLog,
    ) -> BuildResult<BuiltImage> {
        let raw_dir = base_dir.join(RAW_SOURCE_DIRECTORY);
        let revision = self.extract(req, &raw_dir).await?;

        let mut env_vars = req.env_vars.to_vec();
        if let Some(rev) = revision.as_deref().filter(|r| !r.is_empty()) {
            if !env_vars.iter().any(|e| e.key == self.git_sha_env_var) {
                env_vars.push(EnvVar::new(&self.git_sha_env_var, rev));
            }
        }

        let definition_file = locate_definition(&raw_dir, req.definition_path).await?;
        let content = tokio::fs::read_to_string(&definition_file).await?;
        let definition = Definition::parse(&content)?;
        let context_dir = definition_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| raw_dir.clone());

        let image_name = match &definition.source {
            DefinitionSource::Image(image) => self.pull_explicit(image, log).await?,
            _ => {
                self.build_and_push(&definition, &context_dir, base_dir, req, &env_vars, log)
                    .await?
            }
        };
        Ok(BuiltImage {
            image_name,
            source_revision: revision,
        })
    }

    /// Materialize the source into `raw_dir`, returning its revision.
    async fn extract(&self, req: &ImageRequest<'_>, raw_dir: &Path) -> BuildResult<Option<String>> {
        tokio::fs::create_dir_all(raw_dir).await?;
        match req.source {
            BuildSource::Tarball {
                uploaded_tar_path,
                source_revision,
            } => {
                archive::extract(uploaded_tar_path, raw_dir).await?;
                Ok(source_revision.clone())
            }
            BuildSource::Git(repo) => {
                git::clone_repo(repo, raw_dir, &self.temp_dir).await?;
                Ok(Some(git::last_hash(raw_dir).await?))
            }
            BuildSource::Definition {
                content,
                source_revision,
            } => {
                let path = join_definition(raw_dir, req.definition_path)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, content).await?;
                Ok(source_revision.clone())
            }
        }
    }

    async fn pull_explicit(&self, image: &str, log: &AppBuildLog) -> BuildResult<String> {
        log.log(format!(
            "An explicit image name was provided ({image}). Therefore, no build process is needed."
        ));
        log.log(format!(
            "Pulling this image: {image} This process might take a few minutes."
        ));
        let auth = self.registry.auth_for_image(image)?;
        let rx = self.orchestrator.pull_image(image, auth.as_ref()).await?;
        output::drain_pull(rx).await.map_err(BuildError::Pull)?;
        Ok(image.to_string())
    }

    async fn build_and_push(
        &self,
        definition: &Definition,
        context_dir: &Path,
        base_dir: &Path,
        req: &ImageRequest<'_>,
        env_vars: &[EnvVar],
        log: &AppBuildLog,
    ) -> BuildResult<String> {
        let dockerfile = definition.dockerfile_content(context_dir).await?;
        tokio::fs::write(context_dir.join(DOCKERFILE), dockerfile).await?;

        let tar_path = archive::pack_dir(context_dir, &base_dir.join(BUILD_CONTEXT_TAR)).await?;
        let base_image = image_name(&self.namespace, req.app);

        if !env_vars.is_empty() {
            log.log("Ignore warnings for unconsumed build-args if there is any");
        }
        let options = BuildOptions {
            tag: base_image.clone(),
            build_args: env_vars
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect::<BTreeMap<_, _>>(),
            registry_config: self.registry.build_registry_config()?,
        };

        debug!(app = %req.app, image = %base_image, "building image, this might take a few minutes");
        let build_failed = |e: String| BuildError::Build(e.trim().to_string());
        let rx = self
            .orchestrator
            .build_image(&tar_path, &options)
            .await
            .map_err(|e| build_failed(e.to_string()))?;
        output::drain_logged(rx, log).await.map_err(build_failed)?;
        self.orchestrator
            .tag_image(&base_image, &base_image, &req.version.to_string())
            .await
            .map_err(|e| build_failed(e.to_string()))?;

        self.registry
            .retag_and_push_if_default_push_exists(&base_image, req.version, log)
            .await
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// True if `dir` holds a definition file, or a Dockerfile that has just
/// been wrapped with a generated definition.
async fn has_definition_or_dockerfile(dir: &Path, definition_path: &str) -> BuildResult<bool> {
    let definition = join_definition(dir, definition_path)?;
    if is_file(&definition).await {
        return Ok(true);
    }
    if !is_file(&dir.join(DOCKERFILE)).await {
        return Ok(false);
    }
    if let Some(parent) = definition.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&definition, Definition::for_dockerfile().to_json()).await?;
    Ok(true)
}

/// `dir` joined with the app's definition path, which must stay inside `dir`.
fn join_definition(dir: &Path, definition_path: &str) -> BuildResult<PathBuf> {
    if !is_contained_relative_path(definition_path) {
        return Err(BuildError::Definition(format!(
            "Definition path must be relative to the source root: {definition_path}"
        )));
    }
    Ok(dir.join(definition_path))
}

/// Absolute path of the definition file. Archives of a folder (rather than
/// its contents) are handled by looking one level down when the root holds
/// a single entry.
async fn locate_definition(raw_dir: &Path, definition_path: &str) -> BuildResult<PathBuf> {
    if has_definition_or_dockerfile(raw_dir, definition_path).await? {
        return join_definition(raw_dir, definition_path);
    }

    let mut entries = tokio::fs::read_dir(raw_dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        children.push(entry.path());
    }
    if let [only] = children.as_slice() {
        if has_definition_or_dockerfile(only, definition_path).await? {
            return join_definition(only, definition_path);
        }
    }
    Err(BuildError::Definition(
        "Definition file does not exist!".to_string(),
    ))
}

async fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ApiStatus, RegistryKind};
    use keel_docker::MemoryOrchestrator;
    use keel_state::{RegistriesDataStore, StateStore};
    use std::io::Read;

    struct Fixture {
        _root: tempfile::TempDir,
        uploads: tempfile::TempDir,
        builder: ImageBuilder,
        orch: MemoryOrchestrator,
        config: KeelConfig,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mut config = KeelConfig::default();
        config.paths.root = root.path().to_path_buf();
        let store = StateStore::open_in_memory().unwrap();
        let orch = MemoryOrchestrator::new();
        let shared: Arc<dyn Orchestrator> = Arc::new(orch.clone());
        let registry = RegistryHelper::new(RegistriesDataStore::new(store), shared.clone());
        let builder = ImageBuilder::new(&config, shared, registry, BuildLogsManager::new(50));
        Fixture {
            _root: root,
            uploads: tempfile::tempdir().unwrap(),
            builder,
            orch,
            config,
        }
    }

    /// Write `files` into a fresh archive under the uploads dir.
    fn make_tar(fx: &Fixture, files: &[(&str, &str)]) -> PathBuf {
        let src = tempfile::tempdir().unwrap();
        for (name, content) in files {
            let path = src.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let tar_path = fx.uploads.path().join("upload.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
        builder.append_dir_all(".", src.path()).unwrap();
        builder.into_inner().unwrap();
        tar_path
    }

    fn dockerfile_in_context(context: &[u8]) -> String {
        let mut archive = tar::Archive::new(context);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().file_name().and_then(|n| n.to_str()) == Some(DOCKERFILE) {
                let mut out = String::new();
                entry.read_to_string(&mut out).unwrap();
                return out;
            }
        }
        panic!("no Dockerfile in build context");
    }

    fn request<'a>(source: &'a BuildSource, version: u32) -> ImageRequest<'a> {
        ImageRequest {
            source,
            app: "api",
            definition_path: "./keel-definition",
            version,
            env_vars: &[],
        }
    }

    #[tokio::test]
    async fn test_tarball_with_dockerfile_path() {
        let fx = fixture();
        let tar_path = make_tar(
            &fx,
            &[
                ("keel-definition", r#"{"schemaVersion":2,"dockerfilePath":"./Dockerfile"}"#),
                ("Dockerfile", "FROM busybox\nCMD [\"true\"]\n"),
            ],
        );
        let source = BuildSource::Tarball {
            uploaded_tar_path: tar_path.clone(),
            source_revision: Some("abc123".into()),
        };

        let built = fx.builder.ensure_image(&request(&source, 3)).await.unwrap();
        assert_eq!(built.image_name, "img-keel-api:3");
        assert_eq!(built.source_revision.as_deref(), Some("abc123"));

        let builds = fx.orch.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].options.tag, "img-keel-api");
        assert_eq!(
            builds[0].options.build_args.get("KEEL_GIT_COMMIT_SHA").map(String::as_str),
            Some("abc123")
        );
        assert!(dockerfile_in_context(&builds[0].context).starts_with("FROM busybox"));
        assert_eq!(
            fx.orch.tags(),
            vec![("img-keel-api".into(), "img-keel-api".into(), "3".into())]
        );

        assert!(!tar_path.exists());
        assert!(!fx.config.paths.raw_source_base().join("api/3").exists());
        let lines = fx.builder.logs().logs("api").lines;
        assert!(lines.contains(&"Build started for api".to_string()));
        assert_eq!(lines.last().unwrap(), "Build has finished successfully!");
    }

    #[tokio::test]
    async fn test_definition_path_outside_source_rejected() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        let planted = outside.path().join("planted");
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"dockerfileLines":["FROM alpine"]}"#.into(),
            source_revision: None,
        };
        let escaping = planted.to_string_lossy().into_owned();
        for definition_path in [escaping.as_str(), "../../planted"] {
            let req = ImageRequest {
                definition_path,
                ..request(&source, 1)
            };
            let err = fx.builder.ensure_image(&req).await.unwrap_err();
            assert!(matches!(err, BuildError::Definition(_)), "{definition_path}");
        }
        assert!(!planted.exists());
        assert!(fx.orch.builds().is_empty());
    }

    #[tokio::test]
    async fn test_nested_folder_with_bare_dockerfile() {
        let fx = fixture();
        let tar_path = make_tar(&fx, &[("myproject/Dockerfile", "FROM alpine\n")]);
        let source = BuildSource::Tarball {
            uploaded_tar_path: tar_path,
            source_revision: None,
        };
        let built = fx.builder.ensure_image(&request(&source, 1)).await.unwrap();
        assert_eq!(built.image_name, "img-keel-api:1");
        assert!(fx.orch.builds()[0].options.build_args.is_empty());
    }

    #[tokio::test]
    async fn test_missing_definition_fails_and_cleans_up() {
        let fx = fixture();
        let tar_path = make_tar(&fx, &[("a/readme.md", "hi"), ("b/readme.md", "hi")]);
        let source = BuildSource::Tarball {
            uploaded_tar_path: tar_path.clone(),
            source_revision: None,
        };
        let err = fx.builder.ensure_image(&request(&source, 1)).await.unwrap_err();
        assert_eq!(err.to_string(), "Definition file does not exist!");
        assert!(!tar_path.exists());
        assert_eq!(
            fx.builder.logs().logs("api").lines.last().unwrap(),
            "Build has failed!"
        );
    }

    #[tokio::test]
    async fn test_explicit_image_is_pulled_not_built() {
        let fx = fixture();
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"imageName":"nginx:1.25"}"#.into(),
            source_revision: None,
        };
        let built = fx.builder.ensure_image(&request(&source, 2)).await.unwrap();
        assert_eq!(built.image_name, "nginx:1.25");
        assert_eq!(fx.orch.pulls(), vec!["nginx:1.25".to_string()]);
        assert!(fx.orch.builds().is_empty());
    }

    #[tokio::test]
    async fn test_pull_failure_is_reported() {
        let fx = fixture();
        fx.orch.fail_pulls_with("manifest unknown");
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"imageName":"nginx:nope"}"#.into(),
            source_revision: None,
        };
        let err = fx.builder.ensure_image(&request(&source, 2)).await.unwrap_err();
        assert!(matches!(err, BuildError::Pull(ref m) if m.contains("manifest unknown")));
    }

    #[tokio::test]
    async fn test_template_definition_renders_dockerfile() {
        let fx = fixture();
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"templateId":"node/18"}"#.into(),
            source_revision: None,
        };
        fx.builder.ensure_image(&request(&source, 1)).await.unwrap();
        let dockerfile = dockerfile_in_context(&fx.orch.builds()[0].context);
        assert!(dockerfile.starts_with("FROM library/node:18-alpine"));
    }

    #[tokio::test]
    async fn test_build_error_maps_to_build_status() {
        let fx = fixture();
        fx.orch.fail_builds_with("The command '/bin/sh -c make' returned a non-zero code: 2");
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"dockerfileLines":["FROM alpine","RUN make"]}"#.into(),
            source_revision: None,
        };
        let err = fx.builder.ensure_image(&request(&source, 5)).await.unwrap_err();
        assert_eq!(err.status(), ApiStatus::BuildError);
        assert!(fx.orch.tags().is_empty());
        assert!(!fx.config.paths.raw_source_base().join("api/5").exists());
    }

    #[tokio::test]
    async fn test_existing_sha_env_var_wins() {
        let fx = fixture();
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"dockerfileLines":["FROM alpine"]}"#.into(),
            source_revision: Some("from-source".into()),
        };
        let env = vec![EnvVar::new("KEEL_GIT_COMMIT_SHA", "pinned")];
        let req = ImageRequest {
            env_vars: &env,
            ..request(&source, 1)
        };
        fx.builder.ensure_image(&req).await.unwrap();
        let args = &fx.orch.builds()[0].options.build_args;
        assert_eq!(args.get("KEEL_GIT_COMMIT_SHA").map(String::as_str), Some("pinned"));
    }

    #[tokio::test]
    async fn test_default_registry_push_names_image() {
        let fx = fixture();
        fx.builder
            .registry()
            .add_registry("bob", "pw", "reg.example.com", "team", RegistryKind::Remote)
            .await
            .unwrap();
        let source = BuildSource::Definition {
            content: r#"{"schemaVersion":2,"dockerfileLines":["FROM alpine"]}"#.into(),
            source_revision: None,
        };
        let built = fx.builder.ensure_image(&request(&source, 7)).await.unwrap();
        assert_eq!(built.image_name, "reg.example.com/team/img-keel-api:7");
        assert_eq!(fx.orch.pushes(), vec![built.image_name.clone()]);
        assert_eq!(fx.orch.builds()[0].options.registry_config.len(), 1);
    }
}

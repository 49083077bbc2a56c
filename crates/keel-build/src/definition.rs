//! Definition files: how an application's image is obtained.
//!
//! A definition declares `schemaVersion: 2` and exactly one image source:
//!
//! ```json
//! { "schemaVersion": 2, "dockerfilePath": "./Dockerfile" }
//! { "schemaVersion": 2, "dockerfileLines": ["FROM nginx:1", "COPY . /usr/share/nginx/html"] }
//! { "schemaVersion": 2, "templateId": "node/18" }
//! { "schemaVersion": 2, "imageName": "nginx:1" }
//! ```

use std::path::Path;

use keel_core::names::is_contained_relative_path;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{BuildError, BuildResult};
use crate::templates;

pub const SCHEMA_VERSION: u64 = 2;
pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionSource {
    /// Built-in template, `{name}/{version}`.
    Template(String),
    /// Prebuilt image; pulled instead of built.
    Image(String),
    /// Dockerfile relative to the definition file.
    DockerfilePath(String),
    DockerfileLines(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub source: DefinitionSource,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    schema_version: Option<Value>,
    template_id: Option<String>,
    image_name: Option<String>,
    dockerfile_path: Option<String>,
    dockerfile_lines: Option<Vec<String>>,
}

fn invalid(msg: &str) -> BuildError {
    BuildError::Definition(msg.to_string())
}

impl Definition {
    /// Parse and validate definition file content.
    pub fn parse(content: &str) -> BuildResult<Self> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| BuildError::Definition(format!("Definition file is not valid JSON: {e}")))?;
        if value.is_null() {
            return Err(invalid("Definition file is empty!"));
        }
        let raw: RawDefinition = serde_json::from_value(value)
            .map_err(|e| BuildError::Definition(format!("Definition file is malformed: {e}")))?;

        match raw.schema_version {
            None | Some(Value::Null) => return Err(invalid("Definition version is empty!")),
            Some(v) if v.as_u64() != Some(SCHEMA_VERSION) => {
                return Err(invalid(
                    "Definition version is not supported! Read migration guides to schemaVersion 2",
                ));
            }
            Some(_) => {}
        }

        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        let mut present = Vec::new();
        if let Some(id) = non_empty(raw.template_id) {
            present.push(DefinitionSource::Template(id));
        }
        if let Some(image) = non_empty(raw.image_name) {
            present.push(DefinitionSource::Image(image));
        }
        if let Some(path) = non_empty(raw.dockerfile_path) {
            present.push(DefinitionSource::DockerfilePath(path));
        }
        if let Some(lines) = raw.dockerfile_lines.filter(|l| !l.is_empty()) {
            present.push(DefinitionSource::DockerfileLines(lines));
        }

        if present.len() != 1 {
            return Err(invalid(
                "One, and only one, of these properties should be present in the definition file: \
                 templateId, imageName, dockerfilePath, or dockerfileLines",
            ));
        }
        let source = present.remove(0);
        if let DefinitionSource::DockerfilePath(path) = &source {
            if path.contains("..") || !is_contained_relative_path(path) {
                return Err(invalid("dockerfilePath should not refer to parent directory!"));
            }
        }
        Ok(Self { source })
    }

    /// Definition used when the source has a Dockerfile but no definition file.
    pub fn for_dockerfile() -> Self {
        Self {
            source: DefinitionSource::DockerfilePath(format!("./{DOCKERFILE}")),
        }
    }

    pub fn to_json(&self) -> String {
        let mut value = json!({ "schemaVersion": SCHEMA_VERSION });
        match &self.source {
            DefinitionSource::Template(id) => value["templateId"] = json!(id),
            DefinitionSource::Image(name) => value["imageName"] = json!(name),
            DefinitionSource::DockerfilePath(path) => value["dockerfilePath"] = json!(path),
            DefinitionSource::DockerfileLines(lines) => value["dockerfileLines"] = json!(lines),
        }
        value.to_string()
    }

    /// Dockerfile content this definition resolves to. `dir` is the
    /// directory holding the definition file.
    pub async fn dockerfile_content(&self, dir: &Path) -> BuildResult<String> {
        match &self.source {
            DefinitionSource::Template(id) => templates::render(id),
            DefinitionSource::DockerfileLines(lines) => Ok(lines.join("\n")),
            DefinitionSource::DockerfilePath(path) => {
                Ok(tokio::fs::read_to_string(dir.join(path)).await?)
            }
            DefinitionSource::Image(_) => Err(invalid("ImageName cannot be rebuilt")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_source_accepted() {
        let def = Definition::parse(r#"{"schemaVersion":2,"dockerfilePath":"./Dockerfile"}"#).unwrap();
        assert_eq!(def.source, DefinitionSource::DockerfilePath("./Dockerfile".into()));

        let def = Definition::parse(r#"{"schemaVersion":2,"imageName":"nginx:1"}"#).unwrap();
        assert_eq!(def.source, DefinitionSource::Image("nginx:1".into()));

        let def = Definition::parse(r#"{"schemaVersion":2,"dockerfileLines":["FROM a","RUN b"]}"#)
            .unwrap();
        assert!(matches!(def.source, DefinitionSource::DockerfileLines(ref l) if l.len() == 2));
    }

    #[test]
    fn test_zero_or_many_sources_rejected() {
        for content in [
            r#"{"schemaVersion":2}"#,
            r#"{"schemaVersion":2,"dockerfileLines":[]}"#,
            r#"{"schemaVersion":2,"imageName":"nginx","templateId":"node/18"}"#,
            r#"{"schemaVersion":2,"dockerfilePath":"./D","dockerfileLines":["FROM a"]}"#,
        ] {
            let err = Definition::parse(content).unwrap_err();
            assert!(err.to_string().starts_with("One, and only one"), "{content}");
        }
    }

    #[test]
    fn test_schema_version_checked() {
        let err = Definition::parse(r#"{"imageName":"nginx"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Definition version is empty!");
        let err = Definition::parse(r#"{"schemaVersion":1,"imageName":"nginx"}"#).unwrap_err();
        assert!(err.to_string().contains("not supported"));
        let err = Definition::parse("null").unwrap_err();
        assert_eq!(err.to_string(), "Definition file is empty!");
    }

    #[test]
    fn test_parent_path_rejected_before_read() {
        let err = Definition::parse(r#"{"schemaVersion":2,"dockerfilePath":"../secrets/Dockerfile"}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "dockerfilePath should not refer to parent directory!");
        let err = Definition::parse(r#"{"schemaVersion":2,"dockerfilePath":"./a/../../b"}"#)
            .unwrap_err();
        assert!(matches!(err, BuildError::Definition(_)));
    }

    #[test]
    fn test_absolute_dockerfile_path_rejected() {
        let err = Definition::parse(r#"{"schemaVersion":2,"dockerfilePath":"/etc/shadow"}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "dockerfilePath should not refer to parent directory!");
        let def = Definition::parse(r#"{"schemaVersion":2,"dockerfilePath":"deploy/Dockerfile"}"#)
            .unwrap();
        assert_eq!(def.source, DefinitionSource::DockerfilePath("deploy/Dockerfile".into()));
    }

    #[test]
    fn test_dockerfile_wrapper_round_trips() {
        let wrapped = Definition::for_dockerfile();
        assert_eq!(Definition::parse(&wrapped.to_json()).unwrap(), wrapped);
    }

    #[tokio::test]
    async fn test_dockerfile_content_from_each_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM busybox\n").unwrap();

        let def = Definition::for_dockerfile();
        assert_eq!(def.dockerfile_content(dir.path()).await.unwrap(), "FROM busybox\n");

        let def = Definition {
            source: DefinitionSource::DockerfileLines(vec!["FROM a".into(), "RUN b".into()]),
        };
        assert_eq!(def.dockerfile_content(dir.path()).await.unwrap(), "FROM a\nRUN b");

        let def = Definition {
            source: DefinitionSource::Image("nginx".into()),
        };
        assert!(def.dockerfile_content(dir.path()).await.is_err());
    }
}

//! Build source shapes accepted by the deploy pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where the source for a build comes from. The three shapes are mutually
/// exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSource {
    /// An uploaded archive. The file is removed once the build finishes.
    Tarball {
        uploaded_tar_path: PathBuf,
        source_revision: Option<String>,
    },
    /// A git repository cloned with the given credentials.
    Git(RepoInfo),
    /// Definition file content supplied inline, with no source tree.
    Definition {
        content: String,
        source_revision: Option<String>,
    },
}

impl BuildSource {
    pub fn describe(&self) -> String {
        match self {
            BuildSource::Tarball { uploaded_tar_path, .. } => {
                format!("tarball {}", uploaded_tar_path.display())
            }
            BuildSource::Git(repo) => format!("git {} ({})", repo.repo, repo.branch),
            BuildSource::Definition { .. } => "inline definition".to_string(),
        }
    }
}

/// Git repository coordinates and credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub ssh_key: Option<String>,
}

impl std::fmt::Debug for RepoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoInfo")
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssh_key", &self.ssh_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_info_debug_redacts_secrets() {
        let repo = RepoInfo {
            repo: "github.com/acme/api".into(),
            branch: "main".into(),
            user: "bob".into(),
            password: "hunter2".into(),
            ssh_key: Some("-----BEGIN".into()),
        };
        let out = format!("{repo:?}");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("BEGIN"));
        assert!(out.contains("github.com/acme/api"));
    }

    #[test]
    fn test_source_tagged_serde() {
        let src = BuildSource::Definition {
            content: "{}".into(),
            source_revision: None,
        };
        let json = serde_json::to_value(&src).unwrap();
        assert_eq!(json["kind"], "definition");
    }
}

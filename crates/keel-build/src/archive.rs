//! Tar extraction and packaging, run on the blocking pool.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> BuildResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BuildError::Generic(format!("archive task failed: {e}")))?
        .map_err(BuildError::from)
}

/// Unpack `tar_path` into `dest`.
pub async fn extract(tar_path: &Path, dest: &Path) -> BuildResult<()> {
    let tar_path = tar_path.to_path_buf();
    let dest = dest.to_path_buf();
    blocking(move || {
        let mut archive = tar::Archive::new(File::open(&tar_path)?);
        archive.unpack(&dest)
    })
    .await
}

/// Write the contents of `dir` (not `dir` itself) to `tar_path`.
/// Symlinks are stored as links, never followed.
pub async fn pack_dir(dir: &Path, tar_path: &Path) -> BuildResult<PathBuf> {
    let dir = dir.to_path_buf();
    let tar_path = tar_path.to_path_buf();
    blocking(move || {
        let mut builder = tar::Builder::new(File::create(&tar_path)?);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        builder.into_inner()?;
        Ok(tar_path)
    })
    .await
}

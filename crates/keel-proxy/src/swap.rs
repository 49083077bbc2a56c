//! Atomic replacement of a config file through `.fut` / `.bak` / `.conf`.
//!
//! The new content is written in full to `{base}.fut`. Then the old backup
//! is removed, `{base}.conf` becomes `{base}.bak`, and `{base}.fut` becomes
//! `{base}.conf`. Each step is a single rename, so `.conf` is never partially
//! written.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ProxyResult;

pub const FUTURE_EXT: &str = "fut";
pub const BACKUP_EXT: &str = "bak";
pub const CONFIG_EXT: &str = "conf";

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

pub fn config_path(base: &Path) -> PathBuf {
    with_ext(base, CONFIG_EXT)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Replace `{base}.conf` with `content`, keeping the previous one as `{base}.bak`.
pub async fn swap_config(base: &Path, content: &str) -> ProxyResult<()> {
    let future = with_ext(base, FUTURE_EXT);
    let backup = with_ext(base, BACKUP_EXT);
    let config = with_ext(base, CONFIG_EXT);

    if let Some(dir) = base.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    remove_if_exists(&future).await?;
    tokio::fs::write(&future, content).await?;
    remove_if_exists(&backup).await?;
    if tokio::fs::metadata(&config).await.is_err() {
        tokio::fs::write(&config, "").await?;
    }
    tokio::fs::rename(&config, &backup).await?;
    tokio::fs::rename(&future, &config).await?;
    debug!(config = %config.display(), bytes = content.len(), "config swapped");
    Ok(())
}

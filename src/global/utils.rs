use std::path::PathBuf;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;

pub fn get_global_cache_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("org", "kitsmith", "kitsmith")
        .ok_or_else(|| anyhow!("Could not get project directories"))?;
    Ok(proj_dirs.cache_dir().to_path_buf())
}

/// Package root used when the configuration names no `package-dir`.
pub fn default_package_dir() -> Result<PathBuf> {
    Ok(get_global_cache_dir()?.join("packages"))
}

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Creates `path` and all of its parents if they don't already exist.
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> std::io::Result<PathBuf> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

/// Returns the current target triple (e.g. `x86_64-unknown-linux-gnu`)
/// based on the host system's architecture and operating system.
pub fn current_target_triple() -> String {
    let arch = std::env::consts::ARCH;
    let os = std::env::consts::OS;

    match (arch, os) {
        ("x86_64", "linux") => "x86_64-unknown-linux-gnu".to_string(),
        ("x86", "windows") => "i686-pc-windows-msvc".to_string(),
        ("x86_64", "windows") => "x86_64-pc-windows-msvc".to_string(),
        ("aarch64", "linux") => "aarch64-unknown-linux-gnu".to_string(),
        ("aarch64", "macos") => "aarch64-apple-darwin".to_string(),
        ("x86_64", "macos") => "x86_64-apple-darwin".to_string(),
        _ => format!("{}-unknown-{}", arch, os),
    }
}

/// Strips the `sha256:` prefix and any trailing file name from a hash.
///
/// Accepts both bare digests and `sha256sum` output (`<hex>  <file>`).
pub fn format_hash(hash: &str) -> String {
    let hash = hash.trim();
    let hash = hash.strip_prefix("sha256:").unwrap_or(hash);
    hash.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Hex-encoded SHA-256 of the file at `path`, read in chunks.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copies `src` into `dst`, skipping `skip` (relative names) at the top level.
pub fn copy_dir_all(src: &Path, dst: &Path, skip: &[&str]) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        if relative
            .components()
            .next()
            .is_some_and(|c| skip.iter().any(|s| c.as_os_str() == std::ffi::OsStr::new(s)))
        {
            continue;
        }
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Could not create directory {:?}", target))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Could not copy {:?} to {:?}", entry.path(), target))?;
        }
    }
    Ok(())
}

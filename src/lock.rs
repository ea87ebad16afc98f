use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};

/// `vendor.lock`: content hashes of everything vendored into one package root.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct VendorLock {
    #[serde(default)]
    pub artifact: Vec<LockedArtifact>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockedArtifact {
    /// Manifest-relative path, e.g. `tools/rustup-init`.
    pub path: String,
    pub url: String,
    pub sha256: String,
}

impl VendorLock {
    /// An unreadable or malformed lock is treated as empty; every file is then
    /// re-hashed from scratch on the next vendor run.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        if path.as_ref().exists() {
            let content = fs::read_to_string(path).unwrap_or_default();
            toml::from_str(&content).unwrap_or_default()
        }
        else {
            VendorLock::default()
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let content = toml::to_string_pretty(&self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    pub fn get(&self, path: &str) -> Option<&LockedArtifact> {
        self.artifact.iter().find(|a| a.path == path)
    }

    /// Inserts or replaces the entry for `entry.path`, keeping entries sorted by path.
    pub fn upsert(&mut self, entry: LockedArtifact) {
        match self.artifact.binary_search_by(|a| a.path.cmp(&entry.path)) {
            Ok(i) => self.artifact[i] = entry,
            Err(i) => self.artifact.insert(i, entry),
        }
    }
}

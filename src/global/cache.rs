use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::config::ToolkitEdition;
use crate::model::TargetTriple;

/// Directory, relative to a package root, holding downloaded tool artifacts.
pub const TOOLS_DIRNAME: &str = "tools";
/// Directory, relative to a package root, holding the toolchain dist server mirror.
pub const TOOLCHAIN_DIRNAME: &str = "toolchain";
pub const LOCK_FILENAME: &str = "vendor.lock";

/// Maps remote artifacts of one (toolkit, target) pair onto local files.
///
/// Layout: `<package-dir>/<toolkit full name>/<triple>/tools/<file name>`.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    root: PathBuf,
}

/// Where a single artifact lives once vendored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub name: String,
    /// Path as written into offline manifests, always `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

impl ArtifactLocator {
    pub fn new(package_dir: &Path, toolkit: &ToolkitEdition, target: &TargetTriple) -> Self {
        Self {
            root: package_root(package_dir, &toolkit.full_name(), target),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join(TOOLS_DIRNAME)
    }

    pub fn toolchain_dist_dir(&self) -> PathBuf {
        self.root.join(TOOLCHAIN_DIRNAME).join("dist")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILENAME)
    }

    /// Returns `None` when neither `filename` nor the URL path yields a name.
    pub fn locate(&self, url: &Url, filename: Option<&str>) -> Option<LocatedArtifact> {
        let name = artifact_name(url, filename)?;
        Some(self.tool(name))
    }

    /// The bootstrap installer that every offline package ships.
    pub fn rustup_init(&self, target: &TargetTriple) -> LocatedArtifact {
        self.tool(format!("rustup-init{}", target.exe_suffix()))
    }

    /// A file below `toolchain/dist`, given by its `/`-separated path.
    pub fn toolchain_file(&self, dist_path: &str) -> LocatedArtifact {
        let path = dist_path
            .split('/')
            .fold(self.toolchain_dist_dir(), |acc, part| acc.join(part));
        LocatedArtifact {
            name: dist_path.rsplit('/').next().unwrap_or(dist_path).to_string(),
            relative: format!("{TOOLCHAIN_DIRNAME}/dist/{dist_path}"),
            path,
        }
    }

    fn tool(&self, name: String) -> LocatedArtifact {
        LocatedArtifact {
            relative: format!("{TOOLS_DIRNAME}/{name}"),
            path: self.tools_dir().join(&name),
            name,
        }
    }
}

pub fn package_root(package_dir: &Path, full_name: &str, target: &TargetTriple) -> PathBuf {
    package_dir.join(full_name).join(target.as_str())
}

/// The explicit `filename`, or else the last non-empty segment of the URL path.
pub fn artifact_name(url: &Url, filename: Option<&str>) -> Option<String> {
    if let Some(name) = filename.filter(|n| !n.is_empty()) {
        return Some(name.to_string());
    }
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

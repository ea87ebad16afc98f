//! Serializes resolved tool tables into online (URL-based) or offline
//! (path-based) installer manifests.
//!
//! Both modes are projections of the same resolved records. Every map is a
//! `BTreeMap`, so components and targets come out in lexicographic order and
//! repeated runs produce byte-identical files.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ToolkitEdition;
use crate::error::EmitError;
use crate::global::cache::{TOOLCHAIN_DIRNAME, TOOLS_DIRNAME, artifact_name};
use crate::model::{ComponentId, Location, Profile, ResolvedTool, Strategy, TargetTriple};
use crate::resolve::ResolvedManifest;

pub const GENERATED_HEADER: &str = "# This file was automatically generated by kitsmith.\n\
# Edit the master configuration instead and run `kitsmith split` again.\n\n";

/// Component -> manifest-relative path, per vendored target.
pub type VendoredPaths = BTreeMap<TargetTriple, BTreeMap<ComponentId, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Online,
    Offline,
}

impl Mode {
    pub fn dirname(self) -> &'static str {
        match self {
            Mode::Online => "online",
            Mode::Offline => "offline",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dirname())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub rust: RustBlock,
    #[serde(default)]
    pub tools: ToolsBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RustBlock {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_components: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_dist_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    /// Target triple -> bootstrap installer path; offline only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rustup: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsBlock {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub descriptions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target: BTreeMap<String, BTreeMap<String, ToolEntry>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One `[tools.target.<triple>.<component>]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ToolEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ToolEntry {
    /// The record as resolved, with its location in whichever form it has.
    pub fn from_tool(tool: &ResolvedTool) -> Self {
        let (url, path) = match &tool.location {
            Some(Location::Remote(url)) => (Some(url.to_string()), None),
            Some(Location::Local(path)) => (None, Some(path.clone())),
            None => (None, None),
        };
        Self {
            version: tool.version.clone(),
            ver: tool.ver.clone(),
            identifier: tool.identifier.clone(),
            required: tool.required,
            optional: tool.optional,
            url,
            path,
            filename: tool.filename.clone(),
        }
    }
}

/// Toolchain components carry nothing but flags; they are installed through
/// the `rust` block and get no tool table.
fn is_toolchain_component(tool: &ResolvedTool) -> bool {
    matches!(tool.strategy(), Strategy::Bundled) && tool.version.is_none()
}

pub struct Emitter<'a> {
    toolkit: &'a ToolkitEdition,
}

impl<'a> Emitter<'a> {
    pub fn new(toolkit: &'a ToolkitEdition) -> Self {
        Self { toolkit }
    }

    /// Builds the document for `resolved` in `mode`.
    ///
    /// In offline mode, a target present in `vendored` takes its paths from
    /// there and components missing from it are left out; any other target
    /// gets the paths the vendor step would produce.
    pub fn document(
        &self,
        resolved: &[ResolvedManifest],
        mode: Mode,
        vendored: Option<&VendoredPaths>,
    ) -> ManifestDocument {
        let toolkit = self.toolkit;
        let ids = |list: &[ComponentId]| list.iter().map(|id| id.to_string()).collect::<Vec<_>>();

        let mut rust = RustBlock {
            version: toolkit.rust.version.clone(),
            group: toolkit.rust.group.clone(),
            components: ids(&toolkit.rust.components),
            optional_components: ids(&toolkit.rust.optional_components),
            offline_dist_server: None,
            profile: toolkit.rust.profile.clone(),
            rustup: BTreeMap::new(),
        };

        let mut target = BTreeMap::new();
        for manifest in resolved {
            let paths = vendored.and_then(|v| v.get(&manifest.target));
            let mut table = BTreeMap::new();
            for (id, tool) in &manifest.tools {
                if is_toolchain_component(tool) {
                    continue;
                }
                let entry = match mode {
                    Mode::Online => self.online_entry(tool),
                    Mode::Offline => self.offline_entry(manifest, id, tool, paths),
                };
                if let Some(entry) = entry {
                    table.insert(id.to_string(), entry);
                }
            }
            if mode == Mode::Offline {
                rust.rustup.insert(
                    manifest.target.to_string(),
                    format!("{TOOLS_DIRNAME}/rustup-init{}", manifest.target.exe_suffix()),
                );
            }
            target.insert(manifest.target.to_string(), table);
        }
        if mode == Mode::Offline {
            rust.offline_dist_server = Some(TOOLCHAIN_DIRNAME.to_string());
        }

        ManifestDocument {
            name: toolkit.name.clone(),
            version: toolkit.version.clone(),
            rust,
            tools: ToolsBlock {
                descriptions: toolkit
                    .descriptions
                    .iter()
                    .map(|(id, text)| (id.to_string(), text.clone()))
                    .collect(),
                group: toolkit
                    .groups
                    .iter()
                    .map(|(name, members)| {
                        (name.clone(), members.iter().map(|m| m.to_string()).collect())
                    })
                    .collect(),
                target,
            },
        }
    }

    fn online_entry(&self, tool: &ResolvedTool) -> Option<ToolEntry> {
        match tool.location {
            Some(Location::Local(_)) => None,
            _ => Some(ToolEntry::from_tool(tool)),
        }
    }

    fn offline_entry(
        &self,
        manifest: &ResolvedManifest,
        id: &ComponentId,
        tool: &ResolvedTool,
        vendored: Option<&BTreeMap<ComponentId, String>>,
    ) -> Option<ToolEntry> {
        let mut entry = ToolEntry::from_tool(tool);
        let Some(url) = tool.remote_url() else {
            return Some(entry);
        };
        let path = match vendored {
            Some(paths) => paths.get(id).cloned(),
            None => artifact_name(url, tool.filename.as_deref())
                .map(|name| format!("{TOOLS_DIRNAME}/{name}")),
        };
        let Some(path) = path else {
            warn!(
                toolkit = %manifest.toolkit,
                target = %manifest.target,
                component = %id,
                "no local artifact, left out of the offline manifest"
            );
            return None;
        };
        entry.url = None;
        entry.path = Some(path);
        Some(entry)
    }

    pub fn render(document: &ManifestDocument) -> Result<String, EmitError> {
        let body = toml::to_string_pretty(document)?;
        Ok(format!("{GENERATED_HEADER}{body}"))
    }

    /// Location of the `mode` manifest below `out_dir`.
    pub fn output_path(&self, out_dir: &Path, mode: Mode) -> PathBuf {
        out_dir
            .join(mode.dirname())
            .join(format!("{}.toml", self.toolkit.key))
    }

    /// Renders and writes `out_dir/<mode>/<toolkit>.toml`.
    pub fn emit(
        &self,
        out_dir: &Path,
        resolved: &[ResolvedManifest],
        mode: Mode,
        vendored: Option<&VendoredPaths>,
    ) -> Result<PathBuf, EmitError> {
        let document = self.document(resolved, mode, vendored);
        let content = Self::render(&document)?;
        let path = self.output_path(out_dir, mode);
        write_file(&path, &content)?;
        debug!(toolkit = %self.toolkit.key, %mode, "wrote {}", path.display());
        Ok(path)
    }
}

pub fn write_file(path: &Path, content: &str) -> Result<(), EmitError> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    };
    write().map_err(|source| EmitError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::resolve::Resolver;

    const SAMPLE: &str = include_str!("../tests/fixtures/toolkits.toml");

    fn resolve_all(config: &MasterConfig) -> Vec<ResolvedManifest> {
        let toolkit = config.toolkit("basic").unwrap();
        Resolver::new(&config.global, toolkit)
            .resolve_all()
            .into_iter()
            .map(|(_, r)| r.unwrap())
            .collect()
    }

    #[test]
    fn test_online_has_no_paths_offline_has_no_urls() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let resolved = resolve_all(&config);

        let online = emitter.document(&resolved, Mode::Online, None);
        let offline = emitter.document(&resolved, Mode::Offline, None);
        for table in online.tools.target.values() {
            assert!(table.values().all(|e| e.path.is_none()));
        }
        for table in offline.tools.target.values() {
            assert!(table.values().all(|e| e.url.is_none()));
        }

        let msvc_online = &online.tools.target["x86_64-pc-windows-msvc"];
        let msvc_offline = &offline.tools.target["x86_64-pc-windows-msvc"];
        assert!(!msvc_online.contains_key("Visual Studio Build Tools (MSVC)"));
        assert!(msvc_offline.contains_key("Visual Studio Build Tools (MSVC)"));
        assert_eq!(
            msvc_offline["cargo-nextest"].path.as_deref(),
            Some("tools/cargo-nextest-0.9.87-x86_64-pc-windows-msvc.zip")
        );
    }

    #[test]
    fn test_offline_rust_block() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let resolved = resolve_all(&config);

        let offline = emitter.document(&resolved, Mode::Offline, None);
        assert_eq!(offline.rust.offline_dist_server.as_deref(), Some("toolchain"));
        assert_eq!(
            offline.rust.rustup["x86_64-pc-windows-gnu"],
            "tools/rustup-init.exe"
        );
        assert_eq!(
            offline.rust.rustup["x86_64-unknown-linux-gnu"],
            "tools/rustup-init"
        );

        let online = emitter.document(&resolved, Mode::Online, None);
        assert!(online.rust.offline_dist_server.is_none());
        assert!(online.rust.rustup.is_empty());
    }

    #[test]
    fn test_toolchain_components_have_no_tool_table() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let online = emitter.document(&resolve_all(&config), Mode::Online, None);
        let linux = &online.tools.target["x86_64-unknown-linux-gnu"];
        assert!(!linux.contains_key("clippy"));
        assert!(!linux.contains_key("rust-src"));
        assert_eq!(linux["cargo-expand"].ver.as_deref(), Some("1.0.95"));
        assert_eq!(online.rust.components, vec!["clippy", "rustfmt"]);
    }

    #[test]
    fn test_missing_vendored_path_is_omitted() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let resolved = resolve_all(&config);
        let linux = TargetTriple::parse("x86_64-unknown-linux-gnu").unwrap();

        let mut vendored = VendoredPaths::new();
        vendored.insert(linux, BTreeMap::new());
        let offline = emitter.document(&resolved, Mode::Offline, Some(&vendored));

        assert!(!offline.tools.target["x86_64-unknown-linux-gnu"].contains_key("cargo-nextest"));
        assert!(offline.tools.target["x86_64-pc-windows-gnu"].contains_key("cargo-nextest"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let first = Emitter::render(&emitter.document(&resolve_all(&config), Mode::Offline, None)).unwrap();
        let second = Emitter::render(&emitter.document(&resolve_all(&config), Mode::Offline, None)).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("# This file was automatically generated"));

        let parsed: ManifestDocument = toml::from_str(&first).unwrap();
        assert_eq!(parsed.name, "Example Toolkit");
        assert_eq!(parsed.tools.group["Prerequisites"].len(), 2);
    }

    #[test]
    fn test_group_members_keep_authored_order() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let document = emitter.document(&resolve_all(&config), Mode::Online, None);
        assert_eq!(
            document.tools.group["Cargo Extensions"],
            ["cargo-nextest", "cargo-expand"]
        );
    }

    #[test]
    fn test_emit_writes_mode_directories() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let emitter = Emitter::new(config.toolkit("basic").unwrap());
        let out = tempfile::tempdir().unwrap();
        let path = emitter
            .emit(out.path(), &resolve_all(&config), Mode::Online, None)
            .unwrap();
        assert_eq!(path, out.path().join("online").join("basic.toml"));
        assert!(path.is_file());
    }
}

//! Merges global defaults, toolkit selections and per-target overrides into one
//! resolved tool table per (toolkit, target) pair.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::config::{GlobalConfig, ToolkitEdition};
use crate::error::ResolutionError;
use crate::model::{ComponentId, ResolvedTool, TargetTriple};

/// The final tool table for one (toolkit, target) pair.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub toolkit: String,
    pub target: TargetTriple,
    pub tools: BTreeMap<ComponentId, ResolvedTool>,
}

/// Resolver for one toolkit edition.
///
/// The set of targets every known component applies to is computed once on
/// construction and reused for each target.
#[derive(Debug)]
pub struct Resolver<'a> {
    global: &'a GlobalConfig,
    toolkit: &'a ToolkitEdition,
    applicable: BTreeMap<&'a ComponentId, BTreeSet<&'a TargetTriple>>,
    wildcards: BTreeSet<&'a ComponentId>,
}

impl<'a> Resolver<'a> {
    pub fn new(global: &'a GlobalConfig, toolkit: &'a ToolkitEdition) -> Self {
        let catalog: BTreeSet<&TargetTriple> = global.triples().collect();
        let mut applicable: BTreeMap<&ComponentId, BTreeSet<&TargetTriple>> = BTreeMap::new();
        let mut wildcards = BTreeSet::new();

        let known = toolkit
            .descriptions
            .keys()
            .chain(toolkit.defaults.keys())
            .chain(toolkit.rust.components.iter())
            .chain(toolkit.rust.optional_components.iter())
            .chain(global.components.iter().map(|c| &c.id));
        for id in known {
            applicable.entry(id).or_insert_with(|| catalog.clone());
        }

        for shared in &global.components {
            let targets = applicable.entry(&shared.id).or_default();
            if let Some(pinned) = &shared.target {
                targets.retain(|t| *t == pinned);
            }
            for excluded in &shared.excluded {
                targets.remove(excluded);
            }
            if shared.wildcard {
                wildcards.insert(&shared.id);
            }
        }
        for (id, default) in &toolkit.defaults {
            let targets = applicable.entry(id).or_default();
            for excluded in &default.excluded {
                targets.remove(excluded);
            }
            if default.wildcard {
                wildcards.insert(id);
            }
        }

        trace!(toolkit = %toolkit.key, ?wildcards, "computed component scopes");
        Self {
            global,
            toolkit,
            applicable,
            wildcards,
        }
    }

    pub fn global(&self) -> &'a GlobalConfig {
        self.global
    }

    pub fn toolkit(&self) -> &'a ToolkitEdition {
        self.toolkit
    }

    /// Whether `id` may appear in the tool table of `target`.
    pub fn applies_to(&self, id: &ComponentId, target: &TargetTriple) -> bool {
        self.applicable
            .get(id)
            .is_some_and(|targets| targets.contains(target))
    }

    pub fn resolve(&self, target: &TargetTriple) -> Result<ResolvedManifest, ResolutionError> {
        let toolkit = self.toolkit;
        let overrides = toolkit.overrides.get(target);

        let mut selected: BTreeSet<&ComponentId> = toolkit
            .rust
            .components
            .iter()
            .chain(toolkit.rust.optional_components.iter())
            .chain(self.wildcards.iter().copied())
            .collect();
        for id in overrides.into_iter().flat_map(|table| table.keys()) {
            if !toolkit.declares(id) && !self.wildcards.contains(id) {
                return Err(ResolutionError::DanglingOverride {
                    toolkit: toolkit.key.clone(),
                    target: target.clone(),
                    component: id.clone(),
                });
            }
            selected.insert(id);
        }

        let mut tools = BTreeMap::new();
        for id in selected {
            let over = overrides.and_then(|table| table.get(id));
            if !self.applies_to(id, target) {
                let required = over
                    .and_then(|o| o.required)
                    .or_else(|| toolkit.defaults.get(id).and_then(|d| d.fields.required));
                if required == Some(true) {
                    return Err(ResolutionError::RequiredButExcluded {
                        toolkit: toolkit.key.clone(),
                        target: target.clone(),
                        component: id.clone(),
                    });
                }
                trace!(component = %id, %target, "excluded");
                continue;
            }

            let mut fields = toolkit
                .defaults
                .get(id)
                .map(|d| d.fields.clone())
                .unwrap_or_default();
            if fields.required.is_none() && toolkit.is_required(id) {
                fields.required = Some(true);
            }
            if fields.optional.is_none() && toolkit.is_optional(id) {
                fields.optional = Some(true);
            }
            let merged = match over {
                Some(over) => fields.overlay(over),
                None => fields,
            };
            tools.insert(id.clone(), ResolvedTool::from(merged));
        }

        debug!(toolkit = %toolkit.key, %target, tools = tools.len(), "resolved");
        Ok(ResolvedManifest {
            toolkit: toolkit.key.clone(),
            target: target.clone(),
            tools,
        })
    }

    /// Resolves every target in the catalog; a failing pair does not stop the others.
    pub fn resolve_all(&self) -> Vec<(TargetTriple, Result<ResolvedManifest, ResolutionError>)> {
        self.global
            .triples()
            .map(|t| (t.clone(), self.resolve(t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::model::{Location, Strategy};

    const SAMPLE: &str = include_str!("../tests/fixtures/toolkits.toml");

    fn triple(s: &str) -> TargetTriple {
        TargetTriple::parse(s).unwrap()
    }

    fn resolve(config: &MasterConfig, key: &str, target: &str) -> ResolvedManifest {
        let toolkit = config.toolkit(key).unwrap();
        Resolver::new(&config.global, toolkit)
            .resolve(&triple(target))
            .unwrap()
    }

    #[test]
    fn test_exclusion_removes_component() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let musl = resolve(&config, "basic", "aarch64-unknown-linux-musl");
        let linux = resolve(&config, "basic", "x86_64-unknown-linux-gnu");
        assert!(!musl.tools.contains_key("rust-docs"));
        assert!(linux.tools.contains_key("rust-docs"));
    }

    #[test]
    fn test_required_components_on_every_target() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let toolkit = config.toolkit("basic").unwrap();
        let resolver = Resolver::new(&config.global, toolkit);
        for (target, result) in resolver.resolve_all() {
            let manifest = result.unwrap();
            for id in &toolkit.rust.components {
                if resolver.applies_to(id, &target) {
                    assert!(manifest.tools.contains_key(id), "{id} on {target}");
                }
            }
        }
    }

    #[test]
    fn test_override_merges_fields_with_default() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let gnu = resolve(&config, "basic", "x86_64-pc-windows-gnu");
        let linux = resolve(&config, "basic", "x86_64-unknown-linux-gnu");

        let nextest = &gnu.tools["cargo-nextest"];
        assert_eq!(nextest.version.as_deref(), Some("0.9.87"));
        assert!(nextest.optional);
        let url = nextest.remote_url().unwrap();
        assert_eq!(url.as_str(), "https://get.nexte.st/0.9.87/windows");

        let linux_url = linux.tools["cargo-nextest"].remote_url().unwrap();
        assert!(linux_url.as_str().contains("x86_64-unknown-linux-gnu"));
        assert_ne!(linux_url, url);
    }

    #[test]
    fn test_wildcard_component_on_every_target_but_exclusions() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        for target in config.global.triples() {
            let manifest = resolve(&config, "basic", target.as_str());
            assert!(manifest.tools.contains_key("rust-src"));
            let expand = manifest.tools.get("cargo-expand");
            if target.as_str() == "aarch64-unknown-linux-musl" {
                assert!(expand.is_none());
            } else {
                let expand = expand.unwrap();
                assert!(matches!(expand.strategy(), Strategy::Registry { .. }));
            }
        }
    }

    #[test]
    fn test_pinned_shared_component() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let toolkit = config.toolkit("basic").unwrap();
        let resolver = Resolver::new(&config.global, toolkit);
        let mingw = ComponentId::new("rust-mingw");
        assert!(resolver.applies_to(&mingw, &triple("x86_64-pc-windows-gnu")));
        assert!(!resolver.applies_to(&mingw, &triple("x86_64-pc-windows-msvc")));
    }

    #[test]
    fn test_component_keys_are_opaque() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let msvc = resolve(&config, "basic", "x86_64-pc-windows-msvc");
        let buildtools = &msvc.tools["Visual Studio Build Tools (MSVC)"];
        assert!(buildtools.required);
        assert!(matches!(buildtools.location, Some(Location::Local(_))));
    }

    #[test]
    fn test_optional_override_beats_required_list() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let musl = resolve(&config, "basic", "aarch64-unknown-linux-musl");
        let rustfmt = &musl.tools["rustfmt"];
        assert!(rustfmt.optional);
        assert!(!rustfmt.required);

        let linux = resolve(&config, "basic", "x86_64-unknown-linux-gnu");
        assert!(linux.tools["rustfmt"].required);
    }

    const BROKEN: &str = r#"
[config]
rust-server = "https://static.example.org"
rustup-server = "https://static.example.org/rustup"
targets = ["x86_64-unknown-linux-gnu", "x86_64-pc-windows-msvc"]

[toolkit.t.config]
date = "2024-01-01"

[toolkit.t.value]
name = "T"

[toolkit.t.value.rust]
version = "1.80.0"

[toolkit.t.value.tools.descriptions]
t1 = "tool one"

[toolkit.t.value.tools.default]
t1 = { version = "1.0", excluded-targets = ["x86_64-unknown-linux-gnu"] }

[toolkit.t.value.tools.target.x86_64-unknown-linux-gnu]
t1 = { required = true }

[toolkit.t.value.tools.target.x86_64-pc-windows-msvc]
t1 = { required = true }
ghost = { version = "0.1" }
"#;

    #[test]
    fn test_failures_are_per_pair() {
        let config = MasterConfig::parse(BROKEN).unwrap();
        let toolkit = config.toolkit("t").unwrap();
        let resolver = Resolver::new(&config.global, toolkit);

        match resolver.resolve(&triple("x86_64-unknown-linux-gnu")) {
            Err(ResolutionError::RequiredButExcluded { component, .. }) => {
                assert_eq!(component.as_str(), "t1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        match resolver.resolve(&triple("x86_64-pc-windows-msvc")) {
            Err(ResolutionError::DanglingOverride { component, target, .. }) => {
                assert_eq!(component.as_str(), "ghost");
                assert_eq!(target.as_str(), "x86_64-pc-windows-msvc");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_required_default_on_catalog_excluded_target() {
        let input = r#"
[config]
rust-server = "https://static.example.org"
rustup-server = "https://static.example.org/rustup"
targets = ["x86_64-unknown-linux-gnu", "x86_64-pc-windows-msvc"]
components = [{ name = "rust-docs", excluded-targets = ["x86_64-unknown-linux-gnu"] }]

[toolkit.t.config]
date = "2024-01-01"

[toolkit.t.value]
name = "T"

[toolkit.t.value.rust]
version = "1.80.0"
components = ["rust-docs"]

[toolkit.t.value.tools.descriptions]
rust-docs = "documentation"

[toolkit.t.value.tools.default]
rust-docs = { required = true }
"#;
        let config = MasterConfig::parse(input).unwrap();
        let resolver = Resolver::new(&config.global, config.toolkit("t").unwrap());

        assert!(matches!(
            resolver.resolve(&triple("x86_64-unknown-linux-gnu")),
            Err(ResolutionError::RequiredButExcluded { .. })
        ));
        let msvc = resolver.resolve(&triple("x86_64-pc-windows-msvc")).unwrap();
        assert!(msvc.tools["rust-docs"].required);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let config = MasterConfig::parse(SAMPLE).unwrap();
        let a = resolve(&config, "basic", "x86_64-pc-windows-gnu");
        let b = resolve(&config, "basic", "x86_64-pc-windows-gnu");
        assert_eq!(a.tools, b.tools);
    }
}

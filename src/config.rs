use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, ResolutionError};
use crate::model::{ComponentId, Location, Profile, ReleaseMode, TargetTriple, ToolFields};

/// The validated master configuration: global settings plus every toolkit edition.
#[derive(Debug)]
pub struct MasterConfig {
    pub global: GlobalConfig,
    pub toolkits: BTreeMap<String, ToolkitEdition>,
}

/// Settings shared by every toolkit edition.
#[derive(Debug)]
pub struct GlobalConfig {
    /// Server hosting toolchain dist packages.
    pub rust_server: Url,
    /// Server hosting the bootstrap installer.
    pub rustup_server: Url,
    pub targets: Vec<Target>,
    /// Toolchain components packaged for offline installs.
    pub components: Vec<SharedComponent>,
    /// Where vendored packages go; `None` means the per-user cache directory.
    pub package_dir: Option<PathBuf>,
    pub fetch: FetchSettings,
}

impl GlobalConfig {
    pub fn target(&self, triple: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.triple.as_str() == triple)
    }

    pub fn triples(&self) -> impl Iterator<Item = &TargetTriple> {
        self.targets.iter().map(|t| &t.triple)
    }

    /// Full URL of `path` under the `dist` directory of the toolchain server.
    pub fn rust_dist_url(&self, path: &str) -> String {
        format!("{}/dist/{path}", self.rust_server.as_str().trim_end_matches('/'))
    }

    /// URL of the bootstrap installer binary for `triple`.
    pub fn rustup_init_url(&self, triple: &TargetTriple) -> String {
        format!(
            "{}/dist/{triple}/rustup-init{}",
            self.rustup_server.as_str().trim_end_matches('/'),
            triple.exe_suffix()
        )
    }
}

#[derive(Debug, Clone)]
pub struct Target {
    pub triple: TargetTriple,
    pub release_mode: ReleaseMode,
}

/// A toolchain component from the shared `config.components` list.
#[derive(Debug, Clone)]
pub struct SharedComponent {
    pub id: ComponentId,
    /// Restricts the component to a single target.
    pub target: Option<TargetTriple>,
    /// Target-independent package, such as `rust-src`.
    pub wildcard: bool,
    pub excluded: BTreeSet<TargetTriple>,
}

/// Download tuning, read from `[config.fetch]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct FetchSettings {
    /// Size of the download worker pool.
    pub jobs: usize,
    /// Attempts per artifact, the first one included.
    pub retries: u32,
    pub timeout_secs: u64,
    /// Delay before the first retry; doubled for each following one.
    pub backoff_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            jobs: 4,
            retries: 3,
            timeout_secs: 180,
            backoff_ms: 500,
        }
    }
}

/// One `toolkit.<key>` block.
#[derive(Debug)]
pub struct ToolkitEdition {
    pub key: String,
    pub name: String,
    pub version: Option<String>,
    pub date: String,
    pub rust: RustSpec,
    pub descriptions: BTreeMap<ComponentId, String>,
    /// Group name -> members, in authored order.
    pub groups: BTreeMap<String, Vec<ComponentId>>,
    pub defaults: BTreeMap<ComponentId, ComponentDefault>,
    pub overrides: BTreeMap<TargetTriple, BTreeMap<ComponentId, ToolFields>>,
}

impl ToolkitEdition {
    /// Name and version joined, with spaces replaced, e.g. `Basic-Toolkit-1.0`.
    pub fn full_name(&self) -> String {
        format!(
            "{}{}",
            self.name,
            self.version
                .as_deref()
                .map(|v| format!("-{v}"))
                .unwrap_or_default()
        )
        .replace(' ', "-")
    }

    pub fn is_required(&self, id: &ComponentId) -> bool {
        self.rust.components.contains(id)
    }

    pub fn is_optional(&self, id: &ComponentId) -> bool {
        self.rust.optional_components.contains(id)
    }

    /// Whether the toolkit knows about `id` at all.
    pub fn declares(&self, id: &ComponentId) -> bool {
        self.descriptions.contains_key(id)
            || self.defaults.contains_key(id)
            || self.is_required(id)
            || self.is_optional(id)
    }
}

#[derive(Debug, Clone)]
pub struct RustSpec {
    pub version: String,
    pub group: Option<String>,
    /// Components installed by default.
    pub components: Vec<ComponentId>,
    pub optional_components: Vec<ComponentId>,
    pub profile: Option<Profile>,
}

/// A component's default field set together with its target scoping.
#[derive(Debug, Clone, Default)]
pub struct ComponentDefault {
    pub fields: ToolFields,
    pub wildcard: bool,
    pub excluded: BTreeSet<TargetTriple>,
}

impl MasterConfig {
    /// Reads and validates the configuration at `path`.
    ///
    /// A relative `package-dir` is resolved against the directory holding `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content)?;
        if let (Some(dir), Some(base)) = (config.global.package_dir.as_mut(), path.parent()) {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawMaster = toml::from_str(content)?;
        let global = convert_global(raw.config)?;
        let mut toolkits = BTreeMap::new();
        for (key, toolkit) in raw.toolkit {
            let edition = convert_toolkit(&global, key.clone(), toolkit)?;
            debug!(toolkit = %key, "loaded toolkit");
            toolkits.insert(key, edition);
        }
        Ok(Self { global, toolkits })
    }

    pub fn toolkit(&self, key: &str) -> Result<&ToolkitEdition, ResolutionError> {
        self.toolkits
            .get(key)
            .ok_or_else(|| ResolutionError::UnknownToolkit {
                toolkit: key.to_string(),
            })
    }

    /// Validates a requested target against the catalog.
    pub fn target(&self, toolkit: &str, raw: &str) -> Result<TargetTriple, ResolutionError> {
        self.global
            .target(raw)
            .map(|t| t.triple.clone())
            .ok_or_else(|| ResolutionError::UnknownTarget {
                toolkit: toolkit.to_string(),
                target: raw.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMaster {
    config: RawGlobal,
    #[serde(default)]
    toolkit: BTreeMap<String, RawToolkit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawGlobal {
    rust_server: String,
    rustup_server: String,
    targets: Vec<RawTarget>,
    #[serde(default)]
    components: Vec<RawSharedComponent>,
    package_dir: Option<PathBuf>,
    #[serde(default)]
    fetch: FetchSettings,
}

/// A bare string or a table.
///
/// Errors inside the table, such as an unknown key, are reported as they are
/// instead of being swallowed the way `#[serde(untagged)]` does.
#[derive(Debug)]
enum StringOrTable<T> {
    Plain(String),
    Table(T),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for StringOrTable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PlainOrTable<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for PlainOrTable<T> {
            type Value = StringOrTable<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or a table")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(StringOrTable::Plain(v.to_string()))
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
                T::deserialize(de::value::MapAccessDeserializer::new(map)).map(StringOrTable::Table)
            }
        }

        deserializer.deserialize_any(PlainOrTable(PhantomData))
    }
}

type RawTarget = StringOrTable<RawTargetTable>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTargetTable {
    triple: String,
    release_mode: Option<ReleaseMode>,
}

type RawSharedComponent = StringOrTable<RawComponentTable>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawComponentTable {
    name: String,
    target: Option<String>,
    #[serde(default)]
    wildcard_target: bool,
    #[serde(default)]
    excluded_targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolkit {
    config: RawToolkitConfig,
    value: RawToolkitValue,
}

#[derive(Debug, Deserialize)]
struct RawToolkitConfig {
    date: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolkitValue {
    name: String,
    version: Option<String>,
    rust: RawRust,
    #[serde(default)]
    tools: RawTools,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRust {
    version: String,
    group: Option<String>,
    #[serde(default)]
    components: Vec<String>,
    #[serde(default)]
    optional_components: Vec<String>,
    profile: Option<Profile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTools {
    #[serde(default)]
    descriptions: BTreeMap<String, String>,
    #[serde(default)]
    group: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    default: BTreeMap<String, RawToolSpec>,
    #[serde(default)]
    target: BTreeMap<String, BTreeMap<String, RawToolSpec>>,
}

/// `tool = "1.0"` is shorthand for `tool = { version = "1.0" }`.
type RawToolSpec = StringOrTable<RawToolFields>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawToolFields {
    version: Option<String>,
    ver: Option<String>,
    identifier: Option<String>,
    required: Option<bool>,
    optional: Option<bool>,
    url: Option<String>,
    path: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    excluded_targets: Vec<String>,
    #[serde(default)]
    wildcard_target: bool,
}

impl RawToolSpec {
    fn into_fields(self) -> RawToolFields {
        match self {
            Self::Plain(version) => RawToolFields {
                version: Some(version),
                ..Default::default()
            },
            Self::Table(fields) => fields,
        }
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("invalid URL `{raw}`: {e}"),
    })
}

fn catalog_triple(
    key: &str,
    raw: &str,
    catalog: &BTreeSet<TargetTriple>,
) -> Result<TargetTriple, ConfigError> {
    let triple = TargetTriple::parse(raw).map_err(|reason| ConfigError::Invalid {
        key: key.to_string(),
        reason,
    })?;
    if !catalog.contains(&triple) {
        return Err(ConfigError::UnknownTarget {
            key: key.to_string(),
            triple: raw.to_string(),
        });
    }
    Ok(triple)
}

fn convert_global(raw: RawGlobal) -> Result<GlobalConfig, ConfigError> {
    let rust_server = parse_url("config.rust-server", &raw.rust_server)?;
    let rustup_server = parse_url("config.rustup-server", &raw.rustup_server)?;

    let mut targets = Vec::with_capacity(raw.targets.len());
    let mut catalog = BTreeSet::new();
    for (i, target) in raw.targets.into_iter().enumerate() {
        let key = format!("config.targets[{i}]");
        let (triple, release_mode) = match target {
            StringOrTable::Plain(triple) => (triple, None),
            StringOrTable::Table(RawTargetTable {
                triple,
                release_mode,
            }) => (triple, release_mode),
        };
        let triple = TargetTriple::parse(&triple)
            .map_err(|reason| ConfigError::Invalid { key: key.clone(), reason })?;
        if !catalog.insert(triple.clone()) {
            return Err(ConfigError::Invalid {
                key,
                reason: format!("target `{triple}` is listed twice"),
            });
        }
        targets.push(Target {
            triple,
            release_mode: release_mode.unwrap_or_default(),
        });
    }

    let mut components = Vec::with_capacity(raw.components.len());
    for (i, component) in raw.components.into_iter().enumerate() {
        let key = format!("config.components[{i}]");
        let shared = match component {
            StringOrTable::Plain(name) => SharedComponent {
                id: ComponentId::new(name),
                target: None,
                wildcard: false,
                excluded: BTreeSet::new(),
            },
            StringOrTable::Table(RawComponentTable {
                name,
                target,
                wildcard_target,
                excluded_targets,
            }) => SharedComponent {
                id: ComponentId::new(name),
                target: target
                    .map(|t| catalog_triple(&format!("{key}.target"), &t, &catalog))
                    .transpose()?,
                wildcard: wildcard_target,
                excluded: excluded_targets
                    .iter()
                    .map(|t| catalog_triple(&format!("{key}.excluded-targets"), t, &catalog))
                    .collect::<Result<_, _>>()?,
            },
        };
        components.push(shared);
    }

    let fetch = raw.fetch;
    if fetch.jobs == 0 || fetch.retries == 0 {
        return Err(ConfigError::Invalid {
            key: "config.fetch".to_string(),
            reason: "`jobs` and `retries` must be at least 1".to_string(),
        });
    }

    Ok(GlobalConfig {
        rust_server,
        rustup_server,
        targets,
        components,
        package_dir: raw.package_dir,
        fetch,
    })
}

fn convert_toolkit(
    global: &GlobalConfig,
    key: String,
    raw: RawToolkit,
) -> Result<ToolkitEdition, ConfigError> {
    let prefix = format!("toolkit.{key}.value");
    let catalog: BTreeSet<TargetTriple> = global.triples().cloned().collect();
    let value = raw.value;

    let descriptions: BTreeMap<ComponentId, String> = value
        .tools
        .descriptions
        .into_iter()
        .map(|(name, text)| (ComponentId::new(name), text))
        .collect();
    let declared = |list_key: &str, name: String| -> Result<ComponentId, ConfigError> {
        if descriptions.contains_key(name.as_str()) {
            Ok(ComponentId::new(name))
        } else {
            Err(ConfigError::UndeclaredComponent {
                key: list_key.to_string(),
                name,
            })
        }
    };

    let components = value
        .rust
        .components
        .into_iter()
        .map(|name| declared(&format!("{prefix}.rust.components"), name))
        .collect::<Result<Vec<_>, _>>()?;
    let optional_components = value
        .rust
        .optional_components
        .into_iter()
        .map(|name| declared(&format!("{prefix}.rust.optional-components"), name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups = BTreeMap::new();
    for (group, members) in value.tools.group {
        let group_key = format!("{prefix}.tools.group.{group}");
        let members = members
            .into_iter()
            .map(|name| declared(&group_key, name))
            .collect::<Result<Vec<_>, _>>()?;
        groups.insert(group, members);
    }

    let mut defaults = BTreeMap::new();
    for (name, spec) in value.tools.default {
        let field_key = format!("{prefix}.tools.default.{name}");
        let raw_fields = spec.into_fields();
        let excluded = raw_fields
            .excluded_targets
            .iter()
            .map(|t| catalog_triple(&format!("{field_key}.excluded-targets"), t, &catalog))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let wildcard = raw_fields.wildcard_target;
        let fields = convert_fields(&field_key, raw_fields)?;
        if fields.required == Some(true) {
            if let Some(target) = excluded.first() {
                return Err(ConfigError::Conflict {
                    key: format!("{field_key}.excluded-targets"),
                    source: ResolutionError::RequiredButExcluded {
                        toolkit: key.clone(),
                        target: target.clone(),
                        component: ComponentId::new(name),
                    },
                });
            }
        }
        defaults.insert(
            ComponentId::new(name),
            ComponentDefault {
                fields,
                wildcard,
                excluded,
            },
        );
    }

    let mut overrides = BTreeMap::new();
    for (raw_triple, tools) in value.tools.target {
        let target_key = format!("{prefix}.tools.target.{raw_triple}");
        let triple = catalog_triple(&target_key, &raw_triple, &catalog)?;
        let mut table = BTreeMap::new();
        for (name, spec) in tools {
            let field_key = format!("{target_key}.{name}");
            let raw_fields = spec.into_fields();
            if raw_fields.wildcard_target || !raw_fields.excluded_targets.is_empty() {
                return Err(ConfigError::Invalid {
                    key: field_key,
                    reason: "`wildcard-target` and `excluded-targets` belong in `tools.default`"
                        .to_string(),
                });
            }
            table.insert(ComponentId::new(name), convert_fields(&field_key, raw_fields)?);
        }
        overrides.insert(triple, table);
    }

    Ok(ToolkitEdition {
        key,
        name: value.name,
        version: value.version,
        date: raw.config.date,
        rust: RustSpec {
            version: value.rust.version,
            group: value.rust.group,
            components,
            optional_components,
            profile: value.rust.profile,
        },
        descriptions,
        groups,
        defaults,
        overrides,
    })
}

fn convert_fields(key: &str, raw: RawToolFields) -> Result<ToolFields, ConfigError> {
    let location = match (raw.url, raw.path) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Invalid {
                key: key.to_string(),
                reason: "`url` and `path` are mutually exclusive".to_string(),
            });
        }
        (Some(url), None) => Some(Location::Remote(parse_url(&format!("{key}.url"), &url)?)),
        (None, Some(path)) => Some(Location::Local(path)),
        (None, None) => None,
    };
    Ok(ToolFields {
        version: raw.version,
        ver: raw.ver,
        identifier: raw.identifier,
        required: raw.required,
        optional: raw.optional,
        location,
        filename: raw.filename,
    })
}

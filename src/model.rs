//! Strongly typed building blocks shared by the loader, resolver and emitter.

use std::borrow::Borrow;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Identity of a component as written in the master configuration.
///
/// The key is opaque: it may contain spaces, non-ASCII text or parenthetical
/// annotations such as `"Visual Studio Build Tools (MSVC)"`, and it is never
/// split or normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ComponentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

static TRIPLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_.]+(-[a-z0-9_.]+){1,3}$").expect("target triple pattern is valid")
});

/// A validated platform identifier such as `x86_64-pc-windows-msvc`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TargetTriple(String);

impl TargetTriple {
    /// Checks the `arch-vendor-os[-env]` shape; it does not check the catalog.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if TRIPLE_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(format!("`{raw}` is not a valid target triple"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_windows(&self) -> bool {
        self.0.contains("windows")
    }

    /// Executable suffix used by binaries built for this target.
    pub fn exe_suffix(&self) -> &'static str {
        if self.is_windows() { ".exe" } else { "" }
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TargetTriple {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Which installer flavours a target is released with.
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMode {
    Cli,
    Gui,
    #[default]
    Both,
}

impl fmt::Display for ReleaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cli => "cli",
            Self::Gui => "gui",
            Self::Both => "both",
        };
        f.write_str(s)
    }
}

/// Toolchain profile shown by the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Where an artifact comes from. A record holds at most one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Remote(Url),
    Local(String),
}

/// A partial field set: the component default or a per-target override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFields {
    pub version: Option<String>,
    pub ver: Option<String>,
    pub identifier: Option<String>,
    pub required: Option<bool>,
    pub optional: Option<bool>,
    pub location: Option<Location>,
    pub filename: Option<String>,
}

impl ToolFields {
    /// Applies `over` on top of `self`, field by field.
    ///
    /// `location` and `filename` travel together: an override that names a
    /// new location also drops the default's file name. Setting one of
    /// `required`/`optional` to true while staying silent on the other clears
    /// the other.
    pub fn overlay(&self, over: &ToolFields) -> ToolFields {
        let (required, optional) = match (over.required, over.optional) {
            (Some(true), None) => (Some(true), Some(false)),
            (None, Some(true)) => (Some(false), Some(true)),
            (required, optional) => (required.or(self.required), optional.or(self.optional)),
        };
        let (location, filename) = match &over.location {
            Some(location) => (Some(location.clone()), over.filename.clone()),
            None => (
                self.location.clone(),
                over.filename.clone().or_else(|| self.filename.clone()),
            ),
        };
        ToolFields {
            version: over.version.clone().or_else(|| self.version.clone()),
            ver: over.ver.clone().or_else(|| self.ver.clone()),
            identifier: over.identifier.clone().or_else(|| self.identifier.clone()),
            required,
            optional,
            location,
            filename,
        }
    }
}

/// The fully merged record for one component on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub version: Option<String>,
    pub ver: Option<String>,
    pub identifier: Option<String>,
    pub required: bool,
    pub optional: bool,
    pub location: Option<Location>,
    pub filename: Option<String>,
}

/// How the installer obtains a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy<'a> {
    /// Fixed download from a URL.
    Download(&'a Url),
    /// Pre-placed local file or directory.
    LocalPath(&'a str),
    /// Package-registry lookup through `ver` and an optional `identifier`.
    Registry {
        ver: &'a str,
        identifier: Option<&'a str>,
    },
    /// Nothing to fetch; a toolchain component or a plain version pin.
    Bundled,
}

impl ResolvedTool {
    pub fn strategy(&self) -> Strategy<'_> {
        match (&self.location, &self.ver) {
            (Some(Location::Remote(url)), _) => Strategy::Download(url),
            (Some(Location::Local(path)), _) => Strategy::LocalPath(path),
            (None, Some(ver)) => Strategy::Registry {
                ver,
                identifier: self.identifier.as_deref(),
            },
            (None, None) => Strategy::Bundled,
        }
    }

    pub fn remote_url(&self) -> Option<&Url> {
        match &self.location {
            Some(Location::Remote(url)) => Some(url),
            _ => None,
        }
    }
}

impl From<ToolFields> for ResolvedTool {
    fn from(fields: ToolFields) -> Self {
        Self {
            version: fields.version,
            ver: fields.ver,
            identifier: fields.identifier,
            required: fields.required.unwrap_or(false),
            optional: fields.optional.unwrap_or(false),
            location: fields.location,
            filename: fields.filename,
        }
    }
}

//! Error taxonomy.
//!
//! Every failure is attributed to the most specific context available: the
//! offending key path for configuration problems, and the toolkit, target and
//! component for anything that happens after loading.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{ComponentId, TargetTriple};

/// Malformed or inconsistent master configuration.
///
/// Always raised before any network or filesystem side effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("`{key}`: target `{triple}` is not listed in `config.targets`")]
    UnknownTarget { key: String, triple: String },
    #[error("`{key}`: component `{name}` is not declared in `tools.descriptions`")]
    UndeclaredComponent { key: String, name: String },
    #[error("`{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error("`{key}`: {source}")]
    Conflict {
        key: String,
        #[source]
        source: ResolutionError,
    },
}

/// Failure to resolve one (toolkit, target) pair.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("toolkit `{toolkit}` does not exist in the configuration")]
    UnknownToolkit { toolkit: String },
    #[error("{toolkit}: target `{target}` is not a supported target")]
    UnknownTarget { toolkit: String, target: String },
    #[error(
        "{toolkit} ({target}): override for `{component}` does not match any component selected by this toolkit"
    )]
    DanglingOverride {
        toolkit: String,
        target: TargetTriple,
        component: ComponentId,
    },
    #[error("{toolkit} ({target}): `{component}` is marked required but excludes this target")]
    RequiredButExcluded {
        toolkit: String,
        target: TargetTriple,
        component: ComponentId,
    },
}

/// Failure to materialize one artifact.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("`{artifact}`: {url} was not found")]
    NotFound { artifact: String, url: String },
    #[error("`{artifact}`: {url} answered with HTTP {status}")]
    Status {
        artifact: String,
        url: String,
        status: u16,
    },
    #[error("`{artifact}`: giving up on {url} after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        artifact: String,
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("`{artifact}`: checksum mismatch, expected {expected}, got {actual}")]
    ChecksumMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },
    #[error("`{artifact}`: cannot derive a file name from {url}")]
    Unnamed { artifact: String, url: String },
    #[error("`{artifact}`: file name `{name}` is already taken by `{other}` with a different URL")]
    Collision {
        artifact: String,
        name: String,
        other: String,
    },
    #[error("`{artifact}`: I/O error on `{}`", path.display())]
    Io {
        artifact: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{artifact}`: cancelled")]
    Cancelled { artifact: String },
}

impl FetchError {
    /// The artifact (component identity or auxiliary label) this failure belongs to.
    pub fn artifact(&self) -> &str {
        match self {
            Self::NotFound { artifact, .. }
            | Self::Status { artifact, .. }
            | Self::RetriesExhausted { artifact, .. }
            | Self::ChecksumMismatch { artifact, .. }
            | Self::Unnamed { artifact, .. }
            | Self::Collision { artifact, .. }
            | Self::Io { artifact, .. }
            | Self::Cancelled { artifact } => artifact,
        }
    }
}

/// Failure to produce one output manifest.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("could not serialize manifest: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("could not write `{}`", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Crate-level error carrying toolkit/target context.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("{toolkit} ({target}): {source}")]
    Fetch {
        toolkit: String,
        target: TargetTriple,
        #[source]
        source: FetchError,
    },
    #[error("{toolkit}: {source}")]
    Emit {
        toolkit: String,
        #[source]
        source: EmitError,
    },
}

//! # kitsmith
//!
//! Expands a hand-written master toolkit configuration into fully resolved,
//! per-target installer manifests, and vendors the artifacts those manifests
//! point at for offline distribution.
//!
//! A run flows through the modules in this order:
//!
//! - [`config`] parses and validates `toolkits.toml`
//! - [`resolve`] merges defaults and per-target overrides into one tool table per (toolkit, target)
//! - [`global`] maps remote artifacts onto local package paths
//! - [`vendor`] downloads them, tracked by [`lock`] (`vendor.lock`)
//! - [`emit`] writes online (URL) and offline (path) manifests
//! - [`dist`] packs a vendored target into a release archive
//!
//! This library is built for the `kitsmith` CLI, but the resolver and emitter
//! can be reused on their own.

pub mod config;
pub mod dist;
pub mod emit;
pub mod error;
pub mod global;
pub mod lock;
pub mod model;
pub mod resolve;
pub mod util;
pub mod vendor;

pub use config::*;
pub use emit::{Emitter, ManifestDocument, Mode, ToolEntry, VendoredPaths};
pub use error::*;
pub use global::cache::*;
pub use lock::*;
pub use model::*;
pub use resolve::*;
pub use vendor::{CancelFlag, VendorContext, VendorOptions, VendorReport};

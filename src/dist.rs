//! Assembles a release archive from an already vendored package root.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

use crate::emit::{Emitter, Mode, VendoredPaths, write_file};
use crate::global::cache::{ArtifactLocator, LOCK_FILENAME, TOOLCHAIN_DIRNAME};
use crate::resolve::{ResolvedManifest, Resolver};
use crate::util::copy_dir_all;

/// File name of the offline manifest inside a release archive.
pub const MANIFEST_FILENAME: &str = "toolset-manifest.toml";

#[derive(Debug, Clone)]
pub struct DistOptions {
    pub dist_dir: PathBuf,
    /// Installer binary copied next to the manifest.
    pub installer: Option<PathBuf>,
}

#[derive(Debug)]
pub struct DistOutcome {
    pub archive: PathBuf,
    /// Optional components that were not vendored and got left out.
    pub skipped: Vec<String>,
}

pub fn dist_target(
    package_dir: &Path,
    resolver: &Resolver<'_>,
    resolved: &ResolvedManifest,
    options: &DistOptions,
) -> Result<DistOutcome> {
    let toolkit = resolver.toolkit();
    let target = &resolved.target;
    let locator = ArtifactLocator::new(package_dir, toolkit, target);
    let root = locator.root();
    if !root.is_dir() {
        bail!(
            "package root {} does not exist, perhaps you forgot to run `kitsmith vendor` first",
            root.display()
        );
    }

    let mut paths = BTreeMap::new();
    let mut skipped = Vec::new();
    for (id, tool) in &resolved.tools {
        let Some(url) = tool.remote_url() else {
            continue;
        };
        let located = locator.locate(url, tool.filename.as_deref());
        match located {
            Some(located) if located.path.is_file() => {
                paths.insert(id.clone(), located.relative);
            }
            _ if tool.optional => {
                warn!(%target, component = %id, "optional artifact was not vendored, leaving it out");
                skipped.push(id.to_string());
            }
            _ => bail!("{} ({target}): required artifact `{id}` was not vendored", toolkit.key),
        }
    }

    let rustup = locator.rustup_init(target);
    if !rustup.path.is_file() {
        bail!("{} ({target}): missing {}", toolkit.key, rustup.relative);
    }
    if root.join(TOOLCHAIN_DIRNAME).is_dir() {
        let channel = locator.toolchain_file(&format!("channel-rust-{}.toml", toolkit.rust.version));
        if !channel.path.is_file() {
            bail!("{} ({target}): toolchain mirror is incomplete, missing {}", toolkit.key, channel.relative);
        }
    }

    let mut vendored = VendoredPaths::new();
    vendored.insert(target.clone(), paths);
    let emitter = Emitter::new(toolkit);
    let document = emitter.document(std::slice::from_ref(resolved), Mode::Offline, Some(&vendored));
    let manifest = Emitter::render(&document)?;

    let stem = format!("{}-{target}", toolkit.full_name());
    let staging = options.dist_dir.join(&stem);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .with_context(|| format!("Could not clear {}", staging.display()))?;
    }
    std::fs::create_dir_all(&staging)?;
    copy_dir_all(root, &staging, &[LOCK_FILENAME])?;
    write_file(&staging.join(MANIFEST_FILENAME), &manifest)?;
    write_file(&staging.join("README.md"), &readme(&document.name, document.version.as_deref(), &target.to_string()))?;

    if let Some(installer) = &options.installer {
        let name = installer
            .file_name()
            .with_context(|| format!("{} is not a file", installer.display()))?;
        std::fs::copy(installer, staging.join(name))
            .with_context(|| format!("Could not copy installer {}", installer.display()))?;
    }

    let archive = if target.is_windows() {
        let archive = options.dist_dir.join(format!("{stem}.zip"));
        write_zip(&staging, &stem, &archive)?;
        archive
    } else {
        let archive = options.dist_dir.join(format!("{stem}.tar.gz"));
        write_tar_gz(&staging, &stem, &archive)?;
        archive
    };
    std::fs::remove_dir_all(&staging)
        .with_context(|| format!("Could not remove staging directory {}", staging.display()))?;

    info!(toolkit = %toolkit.key, %target, "packaged {}", archive.display());
    Ok(DistOutcome { archive, skipped })
}

fn readme(name: &str, version: Option<&str>, target: &str) -> String {
    let title = match version {
        Some(version) => format!("{name} {version}"),
        None => name.to_string(),
    };
    format!(
        "# {title} ({target})\n\n\
         Offline installation package. Every artifact the installer needs is\n\
         included; `{MANIFEST_FILENAME}` lists them by relative path.\n"
    )
}

fn write_zip(staging: &Path, top: &str, archive: &Path) -> Result<()> {
    let file = File::create(archive)
        .with_context(|| format!("Could not create {}", archive.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o755);

    for entry in WalkDir::new(staging).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(staging)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .fold(top.to_string(), |acc, part| format!("{acc}/{part}"));
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else {
            debug!("adding {name}");
            zip.start_file(name, options)?;
            let mut source = File::open(entry.path())?;
            std::io::copy(&mut source, &mut zip)?;
        }
    }
    zip.finish()?;
    Ok(())
}

fn write_tar_gz(staging: &Path, top: &str, archive: &Path) -> Result<()> {
    let file = File::create(archive)
        .with_context(|| format!("Could not create {}", archive.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(top, staging)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

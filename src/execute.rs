use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result, bail};
use colored::Colorize;
use semver::Version;
use kitsmith::dist::{DistOptions, dist_target};
use kitsmith::emit::{Emitter, Mode, ToolEntry, VendoredPaths};
use kitsmith::global::utils::default_package_dir;
use kitsmith::util::current_target_triple;
use kitsmith::{MasterConfig, ResolvedManifest, Resolver, ToolkitEdition, VendorContext, VendorOptions, VendorReport};
use crate::cli::{CLI, KitCommand};

/// Collects per-pair errors so that one failing target does not stop the others.
#[derive(Default)]
struct Failures(Vec<anyhow::Error>);

impl Failures {
    fn push<E: Into<anyhow::Error>>(&mut self, error: E) {
        self.0.push(error.into());
    }

    fn finish(self) -> Result<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        for error in &self.0 {
            eprintln!("{} {:#}", "error:".red().bold(), error);
        }
        bail!("{} operation(s) failed", self.0.len())
    }
}

pub fn execute(cli: CLI) -> Result<()> {
    let config = MasterConfig::load(&cli.config)
        .with_context(|| format!("Could not load {}", cli.config.display()))?;
    match cli.command {
        KitCommand::Vendor { name, targets, jobs, no_toolchain, download_only, out } => {
            execute_vendor(&config, &name, &targets, jobs, !no_toolchain, download_only, &out)
        }
        KitCommand::Split { name, out } => {
            execute_split(&config, name.as_deref(), &out)
        }
        KitCommand::Dist { name, targets, installer, dist_dir } => {
            execute_dist(&config, &name, &targets, DistOptions { dist_dir, installer })
        }
        KitCommand::Resolve { name, target, json } => {
            execute_resolve(&config, &name, &target, json)
        }
        KitCommand::List => {
            execute_list(&config)
        }
        KitCommand::Clean { name } => {
            execute_clean(&config, &name)
        }
    }
}

fn package_dir(config: &MasterConfig) -> Result<PathBuf> {
    match &config.global.package_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_package_dir(),
    }
}

/// Resolves each requested target, recording unknown targets and resolution errors.
fn resolve_targets(
    config: &MasterConfig,
    resolver: &Resolver<'_>,
    name: &str,
    targets: &[String],
    failures: &mut Failures,
) -> Vec<ResolvedManifest> {
    let mut resolved = Vec::new();
    for raw in targets {
        let result = config
            .target(name, raw)
            .and_then(|target| resolver.resolve(&target));
        match result {
            Ok(manifest) => resolved.push(manifest),
            Err(e) => failures.push(e),
        }
    }
    resolved
}

fn emit_both(
    config: &MasterConfig,
    toolkit: &ToolkitEdition,
    out: &Path,
    resolved: &[ResolvedManifest],
    vendored: Option<&VendoredPaths>,
    failures: &mut Failures,
) {
    let emitter = Emitter::new(toolkit);
    for mode in [Mode::Online, Mode::Offline] {
        match emitter.emit(out, resolved, mode, vendored) {
            Ok(path) => println!("{} {}", "wrote".green(), path.display()),
            Err(source) => failures.push(kitsmith::Error::Emit {
                toolkit: toolkit.key.clone(),
                source,
            }),
        }
    }
}

pub fn execute_vendor(
    config: &MasterConfig,
    name: &str,
    targets: &[String],
    jobs: Option<usize>,
    toolchain: bool,
    download_only: bool,
    out: &Path,
) -> Result<()> {
    let toolkit = config.toolkit(name)?;
    let resolver = Resolver::new(&config.global, toolkit);
    let mut context = VendorContext::new(package_dir(config)?, config.global.fetch.clone())
        .context("Could not create HTTP client")?;
    if let Some(jobs) = jobs {
        context = context.with_jobs(jobs);
    }
    let options = VendorOptions { toolchain };

    let mut failures = Failures::default();
    let resolved = resolve_targets(config, &resolver, name, targets, &mut failures);
    let mut vendored = VendoredPaths::new();
    for manifest in &resolved {
        let mut report = context.vendor_target(&resolver, manifest, &options);
        print_report(&report);
        // An incomplete target keeps the paths a complete vendor run would produce.
        if report.is_success() {
            vendored.insert(manifest.target.clone(), std::mem::take(&mut report.paths));
        }
        for error in report.into_errors() {
            failures.push(error);
        }
    }

    if !download_only && !resolved.is_empty() {
        let catalog = resolve_catalog(&resolver, targets);
        emit_both(config, toolkit, out, &catalog, Some(&vendored), &mut failures);
    }
    failures.finish()
}

/// Every catalog target of the toolkit, so that vendoring a subset still writes
/// complete manifests. Targets outside `requested` that fail to resolve are
/// reported as warnings and left out.
fn resolve_catalog(resolver: &Resolver<'_>, requested: &[String]) -> Vec<ResolvedManifest> {
    let mut resolved = Vec::new();
    for (target, result) in resolver.resolve_all() {
        match result {
            Ok(manifest) => resolved.push(manifest),
            Err(e) if !requested.iter().any(|t| t == target.as_str()) => {
                eprintln!("{} {}", "warning:".yellow(), e);
            }
            Err(_) => {}
        }
    }
    resolved
}

fn print_report(report: &VendorReport) {
    let status = if report.is_success() {
        "vendored".green().bold()
    } else {
        "incomplete".red().bold()
    };
    println!(
        "{} {} ({}): {} fetched, {} already present -> {}",
        status,
        report.toolkit,
        report.target,
        report.fetched,
        report.reused,
        report.root.display()
    );
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
}

pub fn execute_split(config: &MasterConfig, name: Option<&str>, out: &Path) -> Result<()> {
    let toolkits: Vec<&ToolkitEdition> = match name {
        Some(name) => vec![config.toolkit(name)?],
        None => config.toolkits.values().collect(),
    };
    if toolkits.is_empty() {
        println!("No toolkits");
        return Ok(());
    }

    let mut failures = Failures::default();
    for toolkit in toolkits {
        let resolver = Resolver::new(&config.global, toolkit);
        let mut resolved = Vec::new();
        for (_, result) in resolver.resolve_all() {
            match result {
                Ok(manifest) => resolved.push(manifest),
                Err(e) => failures.push(e),
            }
        }
        emit_both(config, toolkit, out, &resolved, None, &mut failures);
    }
    failures.finish()
}

pub fn execute_dist(
    config: &MasterConfig,
    name: &str,
    targets: &[String],
    options: DistOptions,
) -> Result<()> {
    let toolkit = config.toolkit(name)?;
    let resolver = Resolver::new(&config.global, toolkit);
    let package_dir = package_dir(config)?;

    let mut failures = Failures::default();
    for manifest in resolve_targets(config, &resolver, name, targets, &mut failures) {
        match dist_target(&package_dir, &resolver, &manifest, &options) {
            Ok(outcome) => {
                println!("{} {}", "packaged".green().bold(), outcome.archive.display());
                for skipped in &outcome.skipped {
                    println!("  {} `{}` was not vendored and is left out", "warning:".yellow(), skipped);
                }
            }
            Err(e) => failures.push(e),
        }
    }
    failures.finish()
}

pub fn execute_resolve(config: &MasterConfig, name: &str, target: &str, json: bool) -> Result<()> {
    let toolkit = config.toolkit(name)?;
    let target = config.target(name, target)?;
    let manifest = Resolver::new(&config.global, toolkit).resolve(&target)?;
    let table: BTreeMap<String, ToolEntry> = manifest
        .tools
        .iter()
        .map(|(id, tool)| (id.to_string(), ToolEntry::from_tool(tool)))
        .collect();
    let output = if json {
        serde_json::to_string_pretty(&table)?
    } else {
        toml::to_string_pretty(&table)?
    };
    println!("{}", output);
    Ok(())
}

pub fn execute_list(config: &MasterConfig) -> Result<()> {
    let mut toolkits: Vec<&ToolkitEdition> = config.toolkits.values().collect();
    toolkits.sort_by(|a, b| {
        let a_ver = Version::parse(&a.rust.version).ok();
        let b_ver = Version::parse(&b.rust.version).ok();
        b_ver.cmp(&a_ver).then_with(|| a.key.cmp(&b.key))
    });

    if toolkits.is_empty() {
        println!("No toolkits");
    }
    for toolkit in toolkits {
        println!("{}: {}", toolkit.key.bold(), toolkit.full_name());
        println!("   rust {} ({})", toolkit.rust.version, toolkit.date);
    }
    println!();

    let host = current_target_triple();
    println!("{}", "targets:".bold());
    for target in &config.global.targets {
        let marker = if target.triple.as_str() == host { " (host)" } else { "" };
        println!("   {} [{}]{}", target.triple, target.release_mode, marker);
    }
    Ok(())
}

pub fn execute_clean(config: &MasterConfig, name: &str) -> Result<()> {
    let toolkit = config.toolkit(name)?;
    let dir = package_dir(config)?.join(toolkit.full_name());
    if !dir.exists() {
        println!("Nothing to clean for {}", toolkit.key);
        return Ok(());
    }
    std::fs::remove_dir_all(&dir)
        .with_context(|| format!("Could not remove {}", dir.display()))?;
    println!("{} {}", "removed".green(), dir.display());
    Ok(())
}

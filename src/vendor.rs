//! Downloads every artifact a (toolkit, target) pair needs into its package root.
//!
//! Fetches run on a bounded pool of worker threads. Each artifact is streamed
//! into a temporary file next to its destination and renamed into place only
//! after the transfer (and checksum, where one is published) succeeded, so a
//! file that exists under its final name is always complete.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::FetchSettings;
use crate::error::{Error, FetchError};
use crate::global::cache::{ArtifactLocator, LocatedArtifact};
use crate::lock::{LockedArtifact, VendorLock};
use crate::model::{ComponentId, TargetTriple};
use crate::resolve::{ResolvedManifest, Resolver};
use crate::util::{ensure_dir, format_hash, sha256_file};

/// Shared cancellation switch; workers stop taking jobs and abort in-flight
/// transfers once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct VendorOptions {
    /// Also mirror the toolchain dist packages.
    pub toolchain: bool,
}

impl Default for VendorOptions {
    fn default() -> Self {
        Self { toolchain: true }
    }
}

/// Resources scoped to one vendor invocation.
#[derive(Debug)]
pub struct VendorContext {
    client: Client,
    package_dir: PathBuf,
    settings: FetchSettings,
    cancel: CancelFlag,
}

/// Outcome of vendoring one (toolkit, target) pair.
#[derive(Debug)]
pub struct VendorReport {
    pub toolkit: String,
    pub target: TargetTriple,
    pub root: PathBuf,
    /// Manifest-relative path of every component materialized.
    pub paths: BTreeMap<ComponentId, String>,
    pub fetched: usize,
    pub reused: usize,
    /// Failures of optional components; they are left out of `paths`.
    pub warnings: Vec<FetchError>,
    pub failures: Vec<FetchError>,
}

impl VendorReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_errors(self) -> Vec<Error> {
        let VendorReport {
            toolkit,
            target,
            failures,
            ..
        } = self;
        failures
            .into_iter()
            .map(|source| Error::Fetch {
                toolkit: toolkit.clone(),
                target: target.clone(),
                source,
            })
            .collect()
    }

    fn record(&mut self, required: bool, error: FetchError) {
        if required {
            warn!(toolkit = %self.toolkit, target = %self.target, "{error}");
            self.failures.push(error);
        } else {
            warn!(toolkit = %self.toolkit, target = %self.target, "optional artifact skipped: {error}");
            self.warnings.push(error);
        }
    }
}

#[derive(Debug)]
struct FetchJob {
    label: String,
    component: Option<ComponentId>,
    url: String,
    located: LocatedArtifact,
    required: bool,
    /// Published `.sha256` sidecar the download is verified against.
    checksum_url: Option<String>,
}

#[derive(Debug)]
enum JobOutcome {
    Fetched(String),
    Reused(String),
    Failed(FetchError),
}

enum Attempt {
    Fatal(FetchError),
    Retry(String),
}

impl VendorContext {
    pub fn new(package_dir: PathBuf, settings: FetchSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(concat!("kitsmith/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            package_dir,
            settings,
            cancel: CancelFlag::default(),
        })
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.settings.jobs = jobs.max(1);
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Vendors everything `resolved` needs. Never fails as a whole: per-artifact
    /// errors end up in the report.
    pub fn vendor_target(
        &self,
        resolver: &Resolver<'_>,
        resolved: &ResolvedManifest,
        options: &VendorOptions,
    ) -> VendorReport {
        let toolkit = resolver.toolkit();
        let target = &resolved.target;
        let locator = ArtifactLocator::new(&self.package_dir, toolkit, target);
        let mut report = VendorReport {
            toolkit: toolkit.key.clone(),
            target: target.clone(),
            root: locator.root().to_path_buf(),
            paths: BTreeMap::new(),
            fetched: 0,
            reused: 0,
            warnings: Vec::new(),
            failures: Vec::new(),
        };

        let (jobs, aliases) = self.plan(resolver, resolved, &locator, options, &mut report);
        info!(
            toolkit = %toolkit.key,
            %target,
            artifacts = jobs.len(),
            "vendoring into {}",
            locator.root().display()
        );

        let lock_path = locator.lock_path();
        let mut lock = VendorLock::load_or_default(&lock_path);
        let outcomes = self.run_pool(&jobs, &lock);

        let mut materialized = vec![false; jobs.len()];
        for (i, (job, outcome)) in jobs.iter().zip(outcomes).enumerate() {
            let outcome = outcome.unwrap_or_else(|| {
                JobOutcome::Failed(FetchError::Cancelled {
                    artifact: job.label.clone(),
                })
            });
            let sha256 = match outcome {
                JobOutcome::Fetched(sha) => {
                    report.fetched += 1;
                    sha
                }
                JobOutcome::Reused(sha) => {
                    report.reused += 1;
                    sha
                }
                JobOutcome::Failed(error) => {
                    report.record(job.required, error);
                    continue;
                }
            };
            materialized[i] = true;
            lock.upsert(LockedArtifact {
                path: job.located.relative.clone(),
                url: job.url.clone(),
                sha256,
            });
            if let Some(id) = &job.component {
                report.paths.insert(id.clone(), job.located.relative.clone());
            }
        }
        for (id, index) in aliases {
            if materialized[index] {
                report
                    .paths
                    .insert(id, jobs[index].located.relative.clone());
            }
        }

        let saved = ensure_dir(locator.root()).and_then(|_| lock.save(&lock_path));
        if let Err(source) = saved {
            report.failures.push(FetchError::Io {
                artifact: "vendor.lock".to_string(),
                path: lock_path,
                source,
            });
        }

        info!(
            toolkit = %report.toolkit,
            target = %report.target,
            fetched = report.fetched,
            reused = report.reused,
            warnings = report.warnings.len(),
            failures = report.failures.len(),
            "vendor finished"
        );
        report
    }

    /// Builds the job list; the second value maps components sharing an
    /// identical URL onto the job that fetches it.
    fn plan(
        &self,
        resolver: &Resolver<'_>,
        resolved: &ResolvedManifest,
        locator: &ArtifactLocator,
        options: &VendorOptions,
        report: &mut VendorReport,
    ) -> (Vec<FetchJob>, Vec<(ComponentId, usize)>) {
        let global = resolver.global();
        let toolkit = resolver.toolkit();
        let target = &resolved.target;
        let mut jobs: Vec<FetchJob> = Vec::new();
        let mut aliases = Vec::new();
        let mut names: BTreeMap<String, usize> = BTreeMap::new();

        for (id, tool) in &resolved.tools {
            let Some(url) = tool.remote_url() else {
                continue;
            };
            let required = !tool.optional;
            let Some(located) = locator.locate(url, tool.filename.as_deref()) else {
                report.record(
                    required,
                    FetchError::Unnamed {
                        artifact: id.to_string(),
                        url: url.to_string(),
                    },
                );
                continue;
            };
            if let Some(&index) = names.get(&located.name) {
                let other = &mut jobs[index];
                if other.url == url.as_str() {
                    other.required |= required;
                    aliases.push((id.clone(), index));
                } else {
                    let error = FetchError::Collision {
                        artifact: id.to_string(),
                        name: located.name,
                        other: other.label.clone(),
                    };
                    report.record(required, error);
                }
                continue;
            }
            names.insert(located.name.clone(), jobs.len());
            jobs.push(FetchJob {
                label: id.to_string(),
                component: Some(id.clone()),
                url: url.to_string(),
                located,
                required,
                checksum_url: None,
            });
        }

        let rustup = locator.rustup_init(target);
        if let Some(&index) = names.get(&rustup.name) {
            report.record(
                true,
                FetchError::Collision {
                    artifact: rustup.name.clone(),
                    name: rustup.name,
                    other: jobs[index].label.clone(),
                },
            );
        } else {
            jobs.push(FetchJob {
                label: rustup.name.clone(),
                component: None,
                url: global.rustup_init_url(target),
                located: rustup,
                required: true,
                checksum_url: None,
            });
        }

        if options.toolchain {
            let version = &toolkit.rust.version;
            let channel = format!("channel-rust-{version}.toml");
            let url = global.rust_dist_url(&channel);
            jobs.push(FetchJob {
                label: channel.clone(),
                component: None,
                checksum_url: Some(format!("{url}.sha256")),
                url,
                located: locator.toolchain_file(&channel),
                required: true,
            });
            for shared in &global.components {
                if !resolver.applies_to(&shared.id, target) {
                    continue;
                }
                let package = if shared.wildcard {
                    format!("{}-{version}", shared.id)
                } else {
                    format!("{}-{version}-{target}", shared.id)
                };
                let dist_path = format!("{}/{package}.tar.xz", toolkit.date);
                jobs.push(FetchJob {
                    label: package,
                    component: None,
                    url: global.rust_dist_url(&dist_path),
                    located: locator.toolchain_file(&dist_path),
                    required: true,
                    checksum_url: None,
                });
            }
        }
        (jobs, aliases)
    }

    fn run_pool(&self, jobs: &[FetchJob], lock: &VendorLock) -> Vec<Option<JobOutcome>> {
        let mut outcomes: Vec<Option<JobOutcome>> = jobs.iter().map(|_| None).collect();
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        let workers = self.settings.jobs.max(1).min(jobs.len());

        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                s.spawn(move || {
                    loop {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(i) else {
                            break;
                        };
                        let outcome = self.run_job(job, lock);
                        if tx.send((i, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        for (i, outcome) in rx {
            outcomes[i] = Some(outcome);
        }
        outcomes
    }

    fn run_job(&self, job: &FetchJob, lock: &VendorLock) -> JobOutcome {
        let dest = &job.located.path;
        let sidecar = job.checksum_url.as_ref().map(|_| sidecar_path(dest));
        let locked = lock.get(&job.located.relative);

        if dest.is_file() && locked.is_none_or(|entry| entry.url == job.url) {
            let expected = sidecar
                .as_ref()
                .and_then(|p| fs::read_to_string(p).ok())
                .map(|text| format_hash(&text))
                .or_else(|| locked.map(|entry| entry.sha256.clone()));
            match sha256_file(dest) {
                Ok(actual) if expected.as_ref().is_none_or(|e| *e == actual) => {
                    debug!(artifact = %job.label, "already vendored");
                    return JobOutcome::Reused(actual);
                }
                Ok(_) => warn!(artifact = %job.label, "hash changed on disk, fetching again"),
                Err(e) => warn!(artifact = %job.label, "could not hash {}: {e}", dest.display()),
            }
        }

        if let Some(parent) = dest.parent() {
            if let Err(source) = ensure_dir(parent) {
                return JobOutcome::Failed(FetchError::Io {
                    artifact: job.label.clone(),
                    path: parent.to_path_buf(),
                    source,
                });
            }
        }

        let checksum = match &job.checksum_url {
            Some(url) => match self.download(job, url) {
                Ok((file, _)) => match fs::read_to_string(file.path()) {
                    Ok(text) => Some((file, format_hash(&text))),
                    Err(source) => {
                        return JobOutcome::Failed(FetchError::Io {
                            artifact: job.label.clone(),
                            path: file.path().to_path_buf(),
                            source,
                        });
                    }
                },
                Err(e) => return JobOutcome::Failed(e),
            },
            None => None,
        };

        let (file, actual) = match self.download(job, &job.url) {
            Ok(done) => done,
            Err(e) => return JobOutcome::Failed(e),
        };
        if let Some((_, expected)) = &checksum {
            if *expected != actual {
                return JobOutcome::Failed(FetchError::ChecksumMismatch {
                    artifact: job.label.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if let Err(e) = file.persist(dest) {
            return JobOutcome::Failed(FetchError::Io {
                artifact: job.label.clone(),
                path: dest.clone(),
                source: e.error,
            });
        }
        if let (Some((file, _)), Some(path)) = (checksum, sidecar) {
            if let Err(e) = file.persist(&path) {
                warn!(artifact = %job.label, "could not keep {}: {}", path.display(), e.error);
            }
        }
        info!(artifact = %job.label, "fetched {}", job.url);
        JobOutcome::Fetched(actual)
    }

    /// Downloads `url` into a temporary file beside the job's destination,
    /// retrying transient failures with exponential backoff.
    fn download(&self, job: &FetchJob, url: &str) -> Result<(NamedTempFile, String), FetchError> {
        let attempts = self.settings.retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self
                    .settings
                    .backoff_ms
                    .saturating_mul(1u64 << (attempt - 2).min(16));
                debug!(artifact = %job.label, attempt, delay_ms = delay, "retrying");
                thread::sleep(Duration::from_millis(delay));
            }
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    artifact: job.label.clone(),
                });
            }
            match self.download_once(job, url) {
                Ok(done) => return Ok(done),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(message)) => {
                    warn!(artifact = %job.label, attempt, "{url}: {message}");
                    last_error = message;
                }
            }
        }
        Err(FetchError::RetriesExhausted {
            artifact: job.label.clone(),
            url: url.to_string(),
            attempts,
            last_error,
        })
    }

    fn download_once(&self, job: &FetchJob, url: &str) -> Result<(NamedTempFile, String), Attempt> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Attempt::Retry(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Attempt::Fatal(FetchError::NotFound {
                artifact: job.label.clone(),
                url: url.to_string(),
            }));
        }
        if status.is_client_error() {
            return Err(Attempt::Fatal(FetchError::Status {
                artifact: job.label.clone(),
                url: url.to_string(),
                status: status.as_u16(),
            }));
        }
        if !status.is_success() {
            return Err(Attempt::Retry(format!("HTTP {status}")));
        }

        let dir = job.located.path.parent().unwrap_or(Path::new("."));
        let io_error = |path: &Path, source| {
            Attempt::Fatal(FetchError::Io {
                artifact: job.label.clone(),
                path: path.to_path_buf(),
                source,
            })
        };
        let mut file = tempfile::Builder::new()
            .prefix(".kitsmith-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|source| io_error(dir, source))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if self.cancel.is_cancelled() {
                return Err(Attempt::Fatal(FetchError::Cancelled {
                    artifact: job.label.clone(),
                }));
            }
            let n = response
                .read(&mut buf)
                .map_err(|e| Attempt::Retry(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .map_err(|source| io_error(file.path(), source))?;
        }
        file.flush().map_err(|source| io_error(file.path(), source))?;
        Ok((file, hex::encode(hasher.finalize())))
    }
}

fn sidecar_path(dest: &Path) -> PathBuf {
    let mut path = dest.as_os_str().to_owned();
    path.push(".sha256");
    PathBuf::from(path)
}

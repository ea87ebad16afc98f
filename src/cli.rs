use std::path::PathBuf;
use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    /// Path to the master toolkit configuration
    #[clap(long, global = true, default_value = "toolkits.toml")]
    pub(crate) config: PathBuf,
    /// More output: -v info, -vv debug, -vvv trace. `RUST_LOG` takes precedence
    #[clap(short, long, global = true, action = ArgAction::Count)]
    pub(crate) verbose: u8,
    #[command(subcommand)]
    pub(crate) command: KitCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum KitCommand {
    /// Downloads every artifact of a toolkit for the given targets, then writes its manifests
    Vendor {
        /// Toolkit key, the `<name>` in `toolkit.<name>`
        #[clap(long)]
        name: String,
        /// Target triple; repeat for several
        #[clap(long = "target", required = true)]
        targets: Vec<String>,
        /// Number of parallel downloads, overrides `config.fetch.jobs`
        #[clap(long)]
        jobs: Option<usize>,
        /// Skip mirroring the toolchain dist packages
        #[clap(long)]
        no_toolchain: bool,
        /// Only download, don't write manifests
        #[clap(long)]
        download_only: bool,
        /// Manifest output directory
        #[clap(long, default_value = "toolkit-manifest")]
        out: PathBuf,
    },
    /// Writes online and offline manifests without downloading anything. Defaults to all toolkits
    Split {
        #[clap(long)]
        name: Option<String>,
        /// Manifest output directory
        #[clap(long, default_value = "toolkit-manifest")]
        out: PathBuf,
    },
    /// Packs vendored artifacts and the offline manifest into a release archive
    Dist {
        #[clap(long)]
        name: String,
        #[clap(long = "target", required = true)]
        targets: Vec<String>,
        /// Installer binary to ship inside the archive
        #[clap(long)]
        installer: Option<PathBuf>,
        #[clap(long, default_value = "dist")]
        dist_dir: PathBuf,
    },
    /// Prints the resolved tool table of one toolkit for one target
    Resolve {
        #[clap(long)]
        name: String,
        #[clap(long)]
        target: String,
        /// Print JSON instead of TOML
        #[clap(long)]
        json: bool,
    },
    /// Lists toolkits and targets
    List,
    /// Removes the vendored packages of a toolkit
    Clean {
        #[clap(long)]
        name: String,
    },
}

//! CLI argument definitions using clap derive

use crate::pipeline::TestMode;
use crate::store::ArtifactKind;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Vectis - build and test Debian packages in disposable VMs
///
/// Cached VM images and chroot tarballs are built once per
/// architecture, vendor and suite, then reused for every build.
#[derive(Parser, Debug)]
#[command(name = "vectis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(long, global = true, env = "VECTIS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub target: TargetArgs,
}

/// What to build for, overriding the `[defaults]` config section
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Artifact storage root
    #[arg(long, global = true, env = "VECTIS_STORAGE")]
    pub storage: Option<PathBuf>,

    /// Distribution vendor (debian, ubuntu, ...)
    #[arg(long, global = true)]
    pub vendor: Option<String>,

    /// Suite (sid, bookworm, ...)
    #[arg(long, global = true)]
    pub suite: Option<String>,

    /// Debian architecture (amd64, arm64, ...)
    #[arg(long, global = true)]
    pub arch: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a VM image for a root suite from scratch
    Bootstrap,

    /// Derive a suite's VM image from its parent suite's image
    New,

    /// Create an sbuild chroot tarball
    SbuildTarball,

    /// Create a minimal debootstrap tarball
    MinbaseTarball,

    /// Create everything a build needs: the image chain and the sbuild tarball
    Prepare(PrepareArgs),

    /// Build source packages with sbuild
    Build(BuildArgs),

    /// Run autopkgtest on source or binary packages
    Test(TestArgs),

    /// Install and purge binary packages with piuparts
    Piuparts(PiupartsArgs),

    /// Run a command in a fresh VM
    Run(RunArgs),

    /// Inspect and manage cached artifacts
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the prepare command
#[derive(Parser, Debug)]
pub struct PrepareArgs {
    /// Also create the minimal debootstrap tarball
    #[arg(long)]
    pub minbase: bool,
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Source packages (.dsc)
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Build architecture-independent packages only
    #[arg(long, conflicts_with = "any")]
    pub all: bool,

    /// Build architecture-specific packages only
    #[arg(long)]
    pub any: bool,

    /// Where build results are copied (defaults to current directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

/// Arguments for the test command
#[derive(Parser, Debug)]
pub struct TestArgs {
    /// Packages to test: each .dsc starts a test run, .deb and .changes
    /// files join the run before them
    #[arg(required = true)]
    pub packages: Vec<PathBuf>,

    /// Testbed: vm (the suite's image) or schroot (its minbase tarball);
    /// repeat to test in several
    #[arg(long = "mode", default_value = "vm")]
    pub modes: Vec<TestMode>,

    /// Where autopkgtest results are copied (defaults to current directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

/// Arguments for the piuparts command
#[derive(Parser, Debug)]
pub struct PiupartsArgs {
    /// .deb or .changes files, or package names to install from the archive
    #[arg(required = true)]
    pub packages: Vec<String>,

    /// Where piuparts logs are copied (defaults to current directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Shell one-liner; trailing arguments become $0, $1, ...
    #[arg(short = 'c', long = "shell")]
    pub shell: Option<String>,

    /// File or directory copied in as $VECTIS_IN
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Where $VECTIS_OUT is copied (defaults to ./vectis-run_<timestamp>)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Working directory: in, out, tmp, . or an absolute guest path
    #[arg(long, default_value = "tmp")]
    pub chdir: String,

    /// Program and arguments
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one path per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached artifacts and leftover staging files
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Print where an artifact of the selected suite is stored
    Path {
        /// vm-image, sbuild-tarball or minbase-tarball
        #[arg(default_value = "vm-image")]
        kind: ArtifactKind,
    },

    /// Remove a cached artifact of the selected suite
    Remove {
        /// vm-image, sbuild-tarball or minbase-tarball
        kind: ArtifactKind,
    },

    /// Delete staging files left by interrupted builds (run while nothing is building)
    Clean,

    /// Replace a symlinked artifact with a private writable copy
    Materialize {
        /// vm-image, sbuild-tarball or minbase-tarball
        #[arg(default_value = "vm-image")]
        kind: ArtifactKind,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

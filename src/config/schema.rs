//! Configuration schema for vectis
//!
//! Configuration is stored at `~/.config/vectis/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Artifact storage
    pub storage: StorageConfig,

    /// What to build when the command line does not say
    pub defaults: DefaultsConfig,

    /// Virtualization worker settings
    pub worker: WorkerConfig,

    /// Distribution vendors, keyed by name
    pub vendors: BTreeMap<String, VendorConfig>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Record stage outcomes in the storage journal
    pub journal: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            journal: true,
        }
    }
}

/// Artifact storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root; defaults to `~/.cache/vectis`
    pub root: Option<PathBuf>,
}

/// Build target defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Vendor to build for
    pub vendor: String,

    /// Suite to build for (vendor default when unset)
    pub suite: Option<String>,

    /// Architecture to build for (host architecture when unset)
    pub architecture: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            vendor: "debian".to_string(),
            suite: None,
            architecture: None,
        }
    }
}

/// Virtualization worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Backend kind used to boot cached images (e.g. "qemu")
    pub backend: String,

    /// Backend selector used for the bootstrap stage (e.g. "null")
    pub bootstrap_backend: String,

    /// Guest memory in MiB for VM backends
    pub ram_size_mb: Option<u32>,

    /// Upper bound for a single in-guest command
    pub command_timeout_secs: u64,

    /// Upper bound for a single protocol request
    pub request_timeout_secs: u64,

    /// How many times a rejected file transfer is attempted
    pub transfer_attempts: u32,

    /// Suite whose image runs tarball and build stages (target suite when unset)
    pub worker_suite: Option<String>,

    /// Disk size passed to the image builder
    pub image_size: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: "qemu".to_string(),
            bootstrap_backend: "null".to_string(),
            ram_size_mb: None,
            command_timeout_secs: 6 * 60 * 60,
            request_timeout_secs: 10 * 60,
            transfer_attempts: 3,
            worker_suite: None,
            image_size: "42G".to_string(),
        }
    }
}

/// A distribution vendor (debian, ubuntu, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    /// Canonical archive URI
    pub archive_uri: Option<String>,

    /// Mirror URL, or "direct" to use `archive_uri`
    pub mirror: Option<String>,

    /// Archive components
    pub components: Vec<String>,

    /// Suite built when none is given
    pub default_suite: Option<String>,

    /// Kernel package installed into bootstrapped images
    pub kernel_package: Option<String>,

    /// Known suites; keys may be wildcards of the form `*-suffix`
    pub suites: BTreeMap<String, SuiteConfig>,
}

impl VendorConfig {
    /// Fill unset fields from another (built-in) vendor definition
    pub fn fill_from(&mut self, other: &VendorConfig) {
        if self.archive_uri.is_none() {
            self.archive_uri = other.archive_uri.clone();
        }
        if self.mirror.is_none() {
            self.mirror = other.mirror.clone();
        }
        if self.components.is_empty() {
            self.components = other.components.clone();
        }
        if self.default_suite.is_none() {
            self.default_suite = other.default_suite.clone();
        }
        if self.kernel_package.is_none() {
            self.kernel_package = other.kernel_package.clone();
        }
        for (name, suite) in &other.suites {
            self.suites
                .entry(name.clone())
                .or_insert_with(|| suite.clone());
        }
    }
}

/// A suite of a vendor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Parent suite; `*` in a wildcard entry means the matched prefix
    pub base: Option<String>,

    /// Suite-specific mirror, overriding the vendor's
    pub mirror: Option<String>,

    /// Suite-specific components, overriding the vendor's
    pub components: Option<Vec<String>>,

    /// Name used in apt sources if it differs from the suite name
    pub apt_suite: Option<String>,
}

impl SuiteConfig {
    fn root() -> Self {
        Self::default()
    }

    fn derived(base: &str) -> Self {
        Self {
            base: Some(base.to_string()),
            ..Self::default()
        }
    }
}

/// Vendors known without any configuration file
pub fn builtin_vendors() -> BTreeMap<String, VendorConfig> {
    let mut vendors = BTreeMap::new();

    let mut debian = VendorConfig {
        archive_uri: Some("http://deb.debian.org/debian".to_string()),
        mirror: None,
        components: vec!["main".to_string()],
        default_suite: Some("sid".to_string()),
        kernel_package: None,
        suites: BTreeMap::new(),
    };
    for suite in ["sid", "trixie", "bookworm", "bullseye"] {
        debian.suites.insert(suite.to_string(), SuiteConfig::root());
    }
    debian
        .suites
        .insert("experimental".to_string(), SuiteConfig::derived("sid"));
    debian
        .suites
        .insert("*-backports".to_string(), SuiteConfig::derived("*"));
    vendors.insert("debian".to_string(), debian);

    let mut ubuntu = VendorConfig {
        archive_uri: Some("http://archive.ubuntu.com/ubuntu".to_string()),
        mirror: None,
        components: vec!["main".to_string(), "universe".to_string()],
        default_suite: Some("noble".to_string()),
        kernel_package: Some("linux-image-generic".to_string()),
        suites: BTreeMap::new(),
    };
    for suite in ["noble", "jammy"] {
        ubuntu.suites.insert(suite.to_string(), SuiteConfig::root());
    }
    for wildcard in ["*-updates", "*-backports", "*-proposed"] {
        ubuntu
            .suites
            .insert(wildcard.to_string(), SuiteConfig::derived("*"));
    }
    vendors.insert("ubuntu".to_string(), ubuntu);

    vendors
}

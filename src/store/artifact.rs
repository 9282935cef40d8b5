//! Artifact identity and state

use crate::config::Suite;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// What a cached artifact is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Bootable VM disk image
    VmImage,
    /// Chroot tarball for sbuild
    SbuildTarball,
    /// Minimal debootstrap tarball
    MinbaseTarball,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::VmImage,
        ArtifactKind::SbuildTarball,
        ArtifactKind::MinbaseTarball,
    ];

    /// File name inside the suite's storage directory
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::VmImage => "autopkgtest.qcow2",
            ArtifactKind::SbuildTarball => "sbuild.tar.gz",
            ArtifactKind::MinbaseTarball => "minbase.tar.gz",
        }
    }

    /// Kind stored under `file_name`, if any
    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.file_name() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::VmImage => "vm-image",
            ArtifactKind::SbuildTarball => "sbuild-tarball",
            ArtifactKind::MinbaseTarball => "minbase-tarball",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown artifact kind '{}' (expected vm-image, sbuild-tarball or minbase-tarball)",
                    s
                )
            })
    }
}

/// Identity of one artifact: `(architecture, vendor, suite, kind)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub architecture: String,
    pub vendor: String,
    pub suite: String,
    pub kind: ArtifactKind,
}

impl ArtifactKey {
    pub fn new(
        architecture: impl Into<String>,
        vendor: impl Into<String>,
        suite: impl Into<String>,
        kind: ArtifactKind,
    ) -> Self {
        Self {
            architecture: architecture.into(),
            vendor: vendor.into(),
            suite: suite.into(),
            kind,
        }
    }

    /// Key for a resolved suite
    pub fn for_suite(suite: &Suite, kind: ArtifactKind) -> Self {
        Self::new(&suite.architecture, &suite.vendor, &suite.name, kind)
    }

    /// Location relative to the storage root
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.architecture)
            .join(&self.vendor)
            .join(&self.suite)
            .join(self.kind.file_name())
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.architecture,
            self.vendor,
            self.suite,
            self.kind.file_name()
        )
    }
}

/// A published artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
    pub key: ArtifactKey,
    pub path: PathBuf,
    /// The stored path is a symlink; it must never be written through
    pub read_only: bool,
}

/// Storage state of an artifact file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// A staging file exists, either in progress or left by a crash
    Building,
    /// Published at its final name
    Published,
    /// Published as a symlink to a file managed elsewhere
    Linked,
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactState::Building => write!(f, "building"),
            ArtifactState::Published => write!(f, "published"),
            ArtifactState::Linked => write!(f, "linked"),
        }
    }
}

/// One file found in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub key: ArtifactKey,
    pub state: ArtifactState,
    pub path: PathBuf,
    pub size_bytes: u64,
}

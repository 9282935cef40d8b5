//! Virtualization backend abstraction
//!
//! A backend is an external virt server process. The [`Worker`] only ever
//! talks to it through these traits, so the concrete kind (qemu, schroot,
//! null, ...) is chosen at runtime from a selector string.
//!
//! [`Worker`]: crate::worker::Worker

use crate::config::expand_home;
use crate::error::{VectisError, VectisResult};
use crate::virt::process::ProcessConnection;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backend kind plus its arguments, e.g. `qemu /srv/autopkgtest.qcow2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSelector {
    /// Backend kind (qemu, schroot, null, ...)
    pub kind: String,
    /// Backend-specific arguments
    pub args: Vec<String>,
}

impl BackendSelector {
    /// Parse a whitespace-separated selector string
    pub fn parse(selector: &str) -> VectisResult<Self> {
        let mut words = selector.split_whitespace().map(|w| {
            if w.starts_with("~/") {
                expand_home(Path::new(w)).display().to_string()
            } else {
                w.to_string()
            }
        });

        let kind = words
            .next()
            .ok_or_else(|| VectisError::User("empty backend selector".to_string()))?;

        Ok(Self {
            kind,
            args: words.collect(),
        })
    }

    /// Selector that boots a disk image with the given backend kind
    pub fn for_image(kind: &str, image: &Path, ram_size_mb: Option<u32>) -> Self {
        let mut args = Vec::new();
        if let Some(ram) = ram_size_mb {
            args.push(format!("--ram-size={}", ram));
        }
        args.push(image.display().to_string());
        Self {
            kind: kind.to_string(),
            args,
        }
    }
}

impl fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A kind of virt server that can be launched
#[async_trait]
pub trait VirtualizationBackend: Send + Sync {
    /// Human-readable backend name for logs and errors
    fn name(&self) -> String;

    /// Command line of the virt server process
    fn argv(&self) -> Vec<String>;

    /// Start the virt server and return its control channel
    async fn launch(&self) -> VectisResult<Box<dyn BackendConnection>> {
        let conn = ProcessConnection::spawn(&self.name(), &self.argv()).await?;
        Ok(Box::new(conn))
    }
}

/// Control channel to one running virt server
#[async_trait]
pub trait BackendConnection: Send {
    /// Write one request line
    async fn send(&mut self, line: &str) -> VectisResult<()>;

    /// Read one response line; `None` once the server has gone away
    async fn recv(&mut self) -> VectisResult<Option<String>>;

    /// Run a host-side command (the server's execute prefix plus a guest
    /// command), capturing output into the given files
    async fn run(
        &mut self,
        argv: &[String],
        stdin: Option<&Path>,
        stdout: &Path,
        stderr: &Path,
    ) -> VectisResult<i32>;

    /// Wait for the server to exit, forcing it after `grace`
    async fn terminate(&mut self, grace: Duration) -> VectisResult<()>;

    /// Kill the server without waiting
    fn kill(&mut self);
}

/// Creates backends from selectors
///
/// The orchestrator goes through this so tests can substitute scripted
/// backends.
pub trait BackendFactory: Send + Sync {
    /// Build the backend for a selector
    fn create(&self, selector: &BackendSelector) -> VectisResult<Box<dyn VirtualizationBackend>>;
}

/// Locate a virt server program, trying the autopkgtest naming schemes
pub fn find_virt_program(kind: &str) -> VectisResult<PathBuf> {
    let expanded = expand_home(Path::new(kind));
    if expanded.is_absolute() {
        return Ok(expanded);
    }

    for prefix in ["autopkgtest-virt-", "adt-virt-", ""] {
        if let Ok(path) = which::which(format!("{}{}", prefix, kind)) {
            return Ok(path);
        }
    }

    Err(VectisError::BackendUnavailable {
        backend: kind.to_string(),
        reason: "virtualization provider not found on PATH".to_string(),
    })
}

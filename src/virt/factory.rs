//! Backend factory
//!
//! Maps a [`BackendSelector`] to a concrete backend.

use crate::error::{VectisError, VectisResult};
use crate::virt::backend::{BackendFactory, BackendSelector, VirtualizationBackend};
use crate::virt::container::ContainerBackend;
use crate::virt::qemu::QemuBackend;

/// Backend kinds whose arguments are passed through verbatim
const PASSTHROUGH_KINDS: &[&str] = &[
    "null", "schroot", "lxc", "lxd", "incus", "podman", "docker", "unshare", "ssh", "chroot",
];

/// Create the backend for a selector
pub fn create_backend(selector: &BackendSelector) -> VectisResult<Box<dyn VirtualizationBackend>> {
    match selector.kind.as_str() {
        "qemu" => QemuBackend::from_args(&selector.args)
            .map(|b| Box::new(b) as Box<dyn VirtualizationBackend>)
            .ok_or_else(|| VectisError::BackendUnavailable {
                backend: selector.to_string(),
                reason: "qemu needs a disk image as its last argument".to_string(),
            }),
        kind if PASSTHROUGH_KINDS.contains(&kind) || kind.starts_with('/') => Ok(Box::new(
            ContainerBackend::new(kind, selector.args.clone()),
        )),
        other => Err(VectisError::BackendUnavailable {
            backend: other.to_string(),
            reason: "unknown backend kind".to_string(),
        }),
    }
}

/// Factory that launches real virt server processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBackendFactory;

impl BackendFactory for ProcessBackendFactory {
    fn create(&self, selector: &BackendSelector) -> VectisResult<Box<dyn VirtualizationBackend>> {
        create_backend(selector)
    }
}

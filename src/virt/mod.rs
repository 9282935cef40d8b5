//! Virtualization backends
//!
//! Backends are autopkgtest virt servers driven over a line protocol:
//! - qemu: boots a cached disk image
//! - schroot, lxc, podman, ...: container and chroot providers
//! - null: the host itself

pub mod backend;
mod container;
mod factory;
mod process;
pub mod protocol;
mod qemu;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendConnection, BackendFactory, BackendSelector, VirtualizationBackend};
pub use container::ContainerBackend;
pub use factory::{create_backend, ProcessBackendFactory};
pub use process::ProcessConnection;
pub use qemu::QemuBackend;

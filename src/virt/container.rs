//! Virt servers whose arguments pass through unchanged
//!
//! Covers container and chroot providers (schroot, lxc, podman, unshare,
//! ...) and the host itself (`null`).

use crate::virt::backend::VirtualizationBackend;

/// A virt server identified only by its kind and arguments
pub struct ContainerBackend {
    kind: String,
    args: Vec<String>,
}

impl ContainerBackend {
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    /// Run directly on the host, with no isolation beyond a scratch dir
    pub fn null() -> Self {
        Self::new("null", Vec::new())
    }
}

impl VirtualizationBackend for ContainerBackend {
    fn name(&self) -> String {
        match self.args.last() {
            Some(target) => format!("{}:{}", self.kind, target),
            None => self.kind.clone(),
        }
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.kind.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

//! QEMU virt server booting a cached disk image

use crate::virt::backend::VirtualizationBackend;
use std::path::{Path, PathBuf};

/// `autopkgtest-virt-qemu` with a disk image
pub struct QemuBackend {
    image: PathBuf,
    ram_size_mb: Option<u32>,
    extra_args: Vec<String>,
}

impl QemuBackend {
    /// Boot `image`, discarding guest writes when the session ends
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            ram_size_mb: None,
            extra_args: Vec::new(),
        }
    }

    /// Guest memory size
    pub fn with_ram_size(mut self, ram_size_mb: Option<u32>) -> Self {
        self.ram_size_mb = ram_size_mb;
        self
    }

    /// Extra options passed through to the virt server
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build from selector arguments: options first, the image last
    pub(crate) fn from_args(args: &[String]) -> Option<Self> {
        let (image, options) = args.split_last()?;
        if image.starts_with('-') {
            return None;
        }
        Some(Self::new(image).with_args(options.to_vec()))
    }

    /// Disk image this backend boots
    pub fn image(&self) -> &Path {
        &self.image
    }
}

impl VirtualizationBackend for QemuBackend {
    fn name(&self) -> String {
        format!("qemu:{}", self.image.display())
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = vec!["qemu".to_string()];
        if let Some(ram) = self.ram_size_mb {
            argv.push(format!("--ram-size={}", ram));
        }
        argv.extend(self.extra_args.iter().cloned());
        argv.push(self.image.display().to_string());
        argv
    }
}

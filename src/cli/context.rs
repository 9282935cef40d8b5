//! Everything a command needs besides its own arguments

use crate::cli::args::TargetArgs;
use crate::config::{expand_home, Config, Suite};
use crate::error::{VectisError, VectisResult};
use crate::journal::StageJournal;
use crate::pipeline::{Orchestrator, PipelineSettings};
use crate::store::ArtifactStore;
use crate::ui::UiContext;
use crate::virt::{BackendFactory, ProcessBackendFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Loaded configuration plus command-line target overrides
pub struct CommandContext {
    pub config: Config,
    pub config_path: PathBuf,
    pub target: TargetArgs,
    pub ui: UiContext,
    pub cancel: CancellationToken,
    backends: Arc<dyn BackendFactory>,
}

impl CommandContext {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        target: TargetArgs,
        ui: UiContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            config_path,
            target,
            ui,
            cancel,
            backends: Arc::new(ProcessBackendFactory),
        }
    }

    /// Launch workers through `backends` instead of real virt servers
    pub fn with_backends(mut self, backends: Arc<dyn BackendFactory>) -> Self {
        self.backends = backends;
        self
    }

    pub fn vendor(&self) -> &str {
        self.target
            .vendor
            .as_deref()
            .unwrap_or(&self.config.defaults.vendor)
    }

    pub fn architecture(&self) -> String {
        self.target
            .arch
            .clone()
            .unwrap_or_else(|| self.config.default_architecture())
    }

    /// The suite selected on the command line, or the configured default
    pub fn suite(&self) -> VectisResult<Arc<Suite>> {
        let vendor = self.vendor();
        let name = match &self.target.suite {
            Some(name) => name.clone(),
            None => self.config.default_suite(vendor).ok_or_else(|| {
                VectisError::User(format!(
                    "No suite given and vendor {} has no default suite; use --suite",
                    vendor
                ))
            })?,
        };
        self.config
            .resolve_suite(vendor, &name, &self.architecture())
    }

    pub fn storage_root(&self) -> PathBuf {
        match &self.target.storage {
            Some(root) => expand_home(root),
            None => self.config.storage_root(),
        }
    }

    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::new(self.storage_root())
    }

    /// Orchestrator for the selected vendor and architecture
    pub fn orchestrator(&self) -> VectisResult<Orchestrator> {
        let settings =
            PipelineSettings::from_config(&self.config, self.vendor(), &self.architecture())?;
        let journal = StageJournal::new(&self.storage_root(), self.config.general.journal);

        Ok(
            Orchestrator::new(self.store(), Arc::clone(&self.backends), settings)
                .with_journal(journal)
                .with_cancellation(self.cancel.clone()),
        )
    }
}

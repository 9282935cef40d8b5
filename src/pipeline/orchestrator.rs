//! Stage execution

use crate::config::{Config, Suite};
use crate::error::{VectisError, VectisResult};
use crate::journal::StageJournal;
use crate::package::{BinaryPackage, TestSubject};
use crate::pipeline::autopkgtest::AutopkgtestRecipe;
use crate::pipeline::build::BuildRecipe;
use crate::pipeline::image::{BootstrapRecipe, DeriveRecipe};
use crate::pipeline::piuparts::PiupartsRecipe;
use crate::pipeline::recipe::Recipe;
use crate::pipeline::run::{RunRecipe, RunRequest};
use crate::pipeline::stage::{plan, BuildArch, PlannedStage, Stage, StageResult, TestMode};
use crate::pipeline::tarball::{MinbaseTarballRecipe, SbuildTarballRecipe};
use crate::store::{ArtifactHandle, ArtifactKey, ArtifactKind, ArtifactStore, StagingArtifact};
use crate::virt::{BackendFactory, BackendSelector, VirtualizationBackend};
use crate::worker::{Worker, WorkerOptions, WorkerState};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything about how stages run that does not change between stages
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Backend kind that boots cached VM images
    pub image_backend: String,
    /// Where images are bootstrapped and derived
    pub bootstrap_backend: BackendSelector,
    pub ram_size_mb: Option<u32>,
    pub worker: WorkerOptions,
    /// Total tries for one file transfer
    pub transfer_attempts: u32,
    /// Suite whose image builds tarballs and packages, instead of the target
    pub worker_suite: Option<Arc<Suite>>,
    pub image_size: String,
}

impl PipelineSettings {
    /// Settings for building `architecture` artifacts of `vendor`
    ///
    /// `worker.worker_suite` may name a suite of another vendor as
    /// `vendor/suite`.
    pub fn from_config(config: &Config, vendor: &str, architecture: &str) -> VectisResult<Self> {
        let worker_suite = match config.worker.worker_suite.as_deref() {
            Some(qualified) => {
                let (worker_vendor, name) = qualified.split_once('/').unwrap_or((vendor, qualified));
                Some(config.resolve_suite(worker_vendor, name, architecture)?)
            }
            None => None,
        };

        Ok(Self {
            image_backend: config.worker.backend.clone(),
            bootstrap_backend: BackendSelector::parse(&config.worker.bootstrap_backend)?,
            ram_size_mb: config.worker.ram_size_mb,
            worker: WorkerOptions::from_config(&config.worker),
            transfer_attempts: config.worker.transfer_attempts.max(1),
            worker_suite,
            image_size: config.worker.image_size.clone(),
        })
    }
}

/// Runs stages against an artifact store
pub struct Orchestrator {
    store: ArtifactStore,
    backends: Arc<dyn BackendFactory>,
    settings: PipelineSettings,
    journal: StageJournal,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: ArtifactStore,
        backends: Arc<dyn BackendFactory>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            backends,
            settings,
            journal: StageJournal::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_journal(mut self, journal: StageJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Stop running stages when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Stages producing `target` for `suite`, in order
    pub fn plan(&self, target: ArtifactKind, suite: &Arc<Suite>) -> Vec<PlannedStage> {
        plan(target, suite, self.settings.worker_suite.as_ref())
    }

    /// Run planned stages in order, stopping at the first failure
    pub async fn run_plan(&self, planned: &[PlannedStage]) -> VectisResult<Vec<StageResult>> {
        let mut results = Vec::with_capacity(planned.len());
        for (i, entry) in planned.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, planned.len(), entry);
            results.push(self.run_stage(&entry.stage, &entry.suite).await?);
        }
        Ok(results)
    }

    /// Run one stage
    ///
    /// A stage whose artifact is already published returns it without
    /// touching a backend. Errors come back wrapped in
    /// [`VectisError::StageFailed`].
    pub async fn run_stage(&self, stage: &Stage, suite: &Arc<Suite>) -> VectisResult<StageResult> {
        let started = Instant::now();
        self.journal
            .log("stage.started", &json!({ "stage": stage.name(), "suite": suite.label() }))
            .await;

        let result = self.dispatch(stage, suite).await;
        self.finish(stage.name(), suite, started, result).await
    }

    /// Run a command in a fresh worker booted from the suite's image
    pub async fn run_command(&self, suite: &Arc<Suite>, request: &RunRequest) -> VectisResult<StageResult> {
        const NAME: &str = "run";
        let started = Instant::now();

        let result: VectisResult<StageResult> = async {
            request.validate()?;
            let image = self.image_for(NAME, suite).await?;
            let mut recipe = RunRecipe {
                suite: suite.as_ref(),
                request,
                transfer_attempts: self.settings.transfer_attempts,
                outputs: Vec::new(),
            };
            self.execute(&self.image_selector(&image), &mut recipe).await?;
            Ok::<_, VectisError>(StageResult {
                stage: NAME.to_string(),
                suite: suite.label(),
                artifact: None,
                outputs: recipe.outputs,
                cached: false,
            })
        }
        .await;

        self.finish(NAME, suite, started, result).await
    }

    async fn finish(
        &self,
        name: &str,
        suite: &Suite,
        started: Instant,
        result: VectisResult<StageResult>,
    ) -> VectisResult<StageResult> {
        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(r) if r.cached => {
                self.journal
                    .log("stage.cached", &json!({ "stage": name, "suite": suite.label() }))
                    .await;
            }
            Ok(r) => {
                let event = if r.artifact.is_some() {
                    "stage.published"
                } else {
                    "stage.succeeded"
                };
                let artifact = r.artifact.as_ref().map(|a| a.path.display().to_string());
                self.journal
                    .log(
                        event,
                        &json!({
                            "stage": name,
                            "suite": suite.label(),
                            "artifact": artifact,
                            "outputs": r.outputs,
                            "elapsed_secs": elapsed,
                        }),
                    )
                    .await;
                info!("{} for {} finished in {:.0}s", name, suite.label(), elapsed);
            }
            Err(e) => {
                self.journal
                    .log(
                        "stage.failed",
                        &json!({
                            "stage": name,
                            "suite": suite.label(),
                            "error": e.to_string(),
                            "elapsed_secs": elapsed,
                        }),
                    )
                    .await;
            }
        }
        result.map_err(|e| e.in_stage(name, suite.label()))
    }

    async fn dispatch(&self, stage: &Stage, suite: &Arc<Suite>) -> VectisResult<StageResult> {
        if let Some(kind) = stage.produces() {
            let key = ArtifactKey::for_suite(suite, kind);
            if let Some(handle) = self.store.lookup(&key).await? {
                info!("{} is already available at {}", key, handle.path.display());
                return Ok(StageResult::cached(stage, suite, handle));
            }
        }

        if self.cancel.is_cancelled() {
            return Err(VectisError::Cancelled);
        }

        match stage {
            Stage::Bootstrap => self.bootstrap(stage, suite).await,
            Stage::New => self.derive(stage, suite).await,
            Stage::SbuildTarball | Stage::MinbaseTarball => self.tarball(stage, suite).await,
            Stage::Build {
                arch,
                sources,
                output_dir,
            } => self.build(stage, suite, *arch, sources, output_dir).await,
            Stage::Test {
                mode,
                subjects,
                output_dir,
            } => self.test(stage, suite, *mode, subjects, output_dir).await,
            Stage::Piuparts {
                packages,
                output_dir,
            } => self.piuparts(stage, suite, packages, output_dir).await,
        }
    }

    async fn bootstrap(&self, stage: &Stage, suite: &Arc<Suite>) -> VectisResult<StageResult> {
        if let Some(parent) = &suite.parent {
            return Err(VectisError::User(format!(
                "{} is derived from {}; create it with the new stage",
                suite.label(),
                parent.label()
            )));
        }

        let key = ArtifactKey::for_suite(suite, ArtifactKind::VmImage);
        let staging = self.store.begin_build(&key).await?;
        let output = staging.path().to_path_buf();

        let mut recipe = BootstrapRecipe {
            suite: suite.as_ref(),
            output: &output,
            image_size: &self.settings.image_size,
            transfer_attempts: self.settings.transfer_attempts,
        };
        self.execute(&self.settings.bootstrap_backend, &mut recipe)
            .await?;

        self.publish(stage, suite, staging).await
    }

    async fn derive(&self, stage: &Stage, suite: &Arc<Suite>) -> VectisResult<StageResult> {
        let parent = suite.parent.as_ref().ok_or_else(|| {
            VectisError::User(format!(
                "{} has no parent suite; create it with the bootstrap stage",
                suite.label()
            ))
        })?;

        let parent_key = ArtifactKey::for_suite(parent, ArtifactKind::VmImage);
        let parent_image = self.store.lookup(&parent_key).await?.ok_or_else(|| {
            VectisError::MissingDependency {
                stage: stage.name().to_string(),
                needed: format!("{} at {}", parent_key, self.store.path_for(&parent_key).display()),
            }
        })?;

        let key = ArtifactKey::for_suite(suite, ArtifactKind::VmImage);
        let staging = self.store.begin_build_from(&key, &parent_image).await?;
        let image = staging.path().to_path_buf();

        let mut recipe = DeriveRecipe {
            suite: suite.as_ref(),
            image: &image,
            transfer_attempts: self.settings.transfer_attempts,
        };
        self.execute(&self.settings.bootstrap_backend, &mut recipe)
            .await?;

        self.publish(stage, suite, staging).await
    }

    async fn tarball(&self, stage: &Stage, suite: &Arc<Suite>) -> VectisResult<StageResult> {
        let worker_suite = self.worker_suite_for(suite);
        let image = self.image_for(stage.name(), &worker_suite).await?;
        let selector = self.image_selector(&image);

        let kind = stage
            .produces()
            .ok_or_else(|| VectisError::Internal(format!("{} produces no artifact", stage)))?;
        let key = ArtifactKey::for_suite(suite, kind);
        let staging = self.store.begin_build(&key).await?;
        let output = staging.path().to_path_buf();

        match stage {
            Stage::SbuildTarball => {
                let mut recipe = SbuildTarballRecipe {
                    suite: suite.as_ref(),
                    worker_suite: worker_suite.as_ref(),
                    output: &output,
                    transfer_attempts: self.settings.transfer_attempts,
                };
                self.execute(&selector, &mut recipe).await?;
            }
            _ => {
                let mut recipe = MinbaseTarballRecipe {
                    suite: suite.as_ref(),
                    worker_suite: worker_suite.as_ref(),
                    output: &output,
                    transfer_attempts: self.settings.transfer_attempts,
                };
                self.execute(&selector, &mut recipe).await?;
            }
        }

        self.publish(stage, suite, staging).await
    }

    async fn build(
        &self,
        stage: &Stage,
        suite: &Arc<Suite>,
        arch: BuildArch,
        sources: &[PathBuf],
        output_dir: &Path,
    ) -> VectisResult<StageResult> {
        if sources.is_empty() {
            return Err(VectisError::User("no source packages to build".to_string()));
        }

        let tarball = self
            .tarball_for(stage.name(), ArtifactKind::SbuildTarball, suite)
            .await?;
        let worker_suite = self.worker_suite_for(suite);
        let image = self.image_for(stage.name(), &worker_suite).await?;

        let mut recipe = BuildRecipe {
            suite: suite.as_ref(),
            worker_suite: worker_suite.as_ref(),
            tarball: &tarball.path,
            arch,
            sources,
            output_dir,
            transfer_attempts: self.settings.transfer_attempts,
            outputs: Vec::new(),
        };
        self.execute(&self.image_selector(&image), &mut recipe)
            .await?;

        Ok(StageResult::with_outputs(stage, suite, recipe.outputs))
    }

    async fn test(
        &self,
        stage: &Stage,
        suite: &Arc<Suite>,
        mode: TestMode,
        subjects: &[TestSubject],
        output_dir: &Path,
    ) -> VectisResult<StageResult> {
        if subjects.is_empty() {
            return Err(VectisError::User("no packages to test".to_string()));
        }

        let (worker_suite, tarball) = match mode {
            TestMode::Vm => (Arc::clone(suite), None),
            TestMode::Schroot => {
                let tarball = self
                    .tarball_for(stage.name(), ArtifactKind::MinbaseTarball, suite)
                    .await?;
                (self.worker_suite_for(suite), Some(tarball))
            }
        };
        let image = self.image_for(stage.name(), &worker_suite).await?;

        let mut recipe = AutopkgtestRecipe {
            mode,
            suite: suite.as_ref(),
            worker_suite: worker_suite.as_ref(),
            tarball: tarball.as_ref().map(|t| t.path.as_path()),
            subjects,
            output_dir,
            transfer_attempts: self.settings.transfer_attempts,
            outputs: Vec::new(),
        };
        self.execute(&self.image_selector(&image), &mut recipe)
            .await?;

        Ok(StageResult::with_outputs(stage, suite, recipe.outputs))
    }

    async fn piuparts(
        &self,
        stage: &Stage,
        suite: &Arc<Suite>,
        packages: &[BinaryPackage],
        output_dir: &Path,
    ) -> VectisResult<StageResult> {
        if packages.is_empty() {
            return Err(VectisError::User("no packages to test with piuparts".to_string()));
        }

        let tarball = self
            .tarball_for(stage.name(), ArtifactKind::MinbaseTarball, suite)
            .await?;
        let worker_suite = self.worker_suite_for(suite);
        let image = self.image_for(stage.name(), &worker_suite).await?;

        let mut recipe = PiupartsRecipe {
            suite: suite.as_ref(),
            worker_suite: worker_suite.as_ref(),
            tarball: &tarball.path,
            packages,
            output_dir,
            transfer_attempts: self.settings.transfer_attempts,
            outputs: Vec::new(),
        };
        self.execute(&self.image_selector(&image), &mut recipe)
            .await?;

        Ok(StageResult::with_outputs(stage, suite, recipe.outputs))
    }

    /// Published chroot tarball of `kind` for `suite` or its nearest ancestor
    async fn tarball_for(
        &self,
        stage: &str,
        kind: ArtifactKind,
        suite: &Suite,
    ) -> VectisResult<ArtifactHandle> {
        self.store
            .lookup_chain(kind, suite)
            .await?
            .ok_or_else(|| VectisError::MissingDependency {
                stage: stage.to_string(),
                needed: format!("{} for {} or one of its parents", kind, suite.label()),
            })
    }

    fn worker_suite_for(&self, suite: &Arc<Suite>) -> Arc<Suite> {
        self.settings
            .worker_suite
            .clone()
            .unwrap_or_else(|| Arc::clone(suite))
    }

    /// Published VM image for `suite` or its nearest ancestor
    async fn image_for(&self, stage: &str, suite: &Suite) -> VectisResult<ArtifactHandle> {
        self.store
            .lookup_chain(ArtifactKind::VmImage, suite)
            .await?
            .ok_or_else(|| VectisError::MissingDependency {
                stage: stage.to_string(),
                needed: format!(
                    "{} for {} or one of its parents",
                    ArtifactKind::VmImage,
                    suite.label()
                ),
            })
    }

    fn image_selector(&self, image: &ArtifactHandle) -> BackendSelector {
        BackendSelector::for_image(
            &self.settings.image_backend,
            &image.path,
            self.settings.ram_size_mb,
        )
    }

    async fn publish(
        &self,
        stage: &Stage,
        suite: &Suite,
        mut staging: StagingArtifact,
    ) -> VectisResult<StageResult> {
        staging.seal().await?;
        let handle = self.store.publish(staging).await?;
        Ok(StageResult::published(stage, suite, handle))
    }

    fn worker_options(&self, selector: &BackendSelector) -> WorkerOptions {
        WorkerOptions {
            require_isolation: selector.kind != "null",
            ..self.settings.worker.clone()
        }
    }

    async fn open_worker(
        &self,
        backend: &dyn VirtualizationBackend,
        options: WorkerOptions,
    ) -> VectisResult<Worker> {
        tokio::select! {
            opened = Worker::open(backend, options) => opened,
            _ = self.cancel.cancelled() => Err(VectisError::Cancelled),
        }
    }

    /// One worker session around a recipe
    ///
    /// The session is closed on every path. Between steps the guest is
    /// reverted, or the session reopened where the backend cannot revert.
    async fn execute(&self, selector: &BackendSelector, recipe: &mut dyn Recipe) -> VectisResult<()> {
        let backend = self.backends.create(selector)?;
        let options = self.worker_options(selector);
        let mut worker = self.open_worker(backend.as_ref(), options.clone()).await?;

        let mut outcome = Ok(());
        for step in 0..recipe.steps() {
            if step > 0 {
                worker = self.reset(worker, backend.as_ref(), &options).await?;
            }
            outcome = tokio::select! {
                done = recipe.run_step(&mut worker, step) => done,
                _ = self.cancel.cancelled() => Err(VectisError::Cancelled),
            };
            if outcome.is_err() {
                break;
            }
        }

        self.end_session(worker, outcome).await
    }

    async fn reset(
        &self,
        mut worker: Worker,
        backend: &dyn VirtualizationBackend,
        options: &WorkerOptions,
    ) -> VectisResult<Worker> {
        if worker.can_revert() {
            if let Err(e) = worker.revert().await {
                if let Err(close_err) = worker.close().await {
                    warn!("Also failed to close worker: {}", close_err);
                }
                return Err(e);
            }
            return Ok(worker);
        }

        info!(
            "{} cannot revert, starting a new session for the next step",
            worker.backend_name()
        );
        worker.close().await?;
        self.open_worker(backend, options.clone()).await
    }

    async fn end_session(&self, mut worker: Worker, outcome: VectisResult<()>) -> VectisResult<()> {
        if matches!(outcome, Err(VectisError::Cancelled))
            && worker.state() == WorkerState::Ready
            && worker.can_revert()
        {
            info!("Cancelled, reverting {}", worker.backend_name());
            if let Err(e) = worker.revert().await {
                warn!("Revert after cancellation failed: {}", e);
            }
        }

        let closed = worker.close().await;
        match (outcome, closed) {
            (Err(e), Err(close_err)) => {
                warn!("Also failed to close worker: {}", close_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), closed) => closed,
        }
    }
}

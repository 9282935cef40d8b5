//! Stages and plans

use crate::config::Suite;
use crate::package::{BinaryPackage, TestSubject};
use crate::store::{ArtifactHandle, ArtifactKind};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Which half of a source package's binaries to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildArch {
    /// Architecture-independent packages only
    All,
    /// Architecture-specific packages only
    Any,
}

impl BuildArch {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildArch::All => "all",
            BuildArch::Any => "any",
        }
    }
}

/// Where autopkgtest puts its testbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// The worker VM booted from the suite's own image
    Vm,
    /// A schroot unpacked from the suite's `minbase.tar.gz`, inside a worker
    Schroot,
}

impl TestMode {
    pub const ALL: [TestMode; 2] = [TestMode::Vm, TestMode::Schroot];

    pub fn as_str(self) -> &'static str {
        match self {
            TestMode::Vm => "vm",
            TestMode::Schroot => "schroot",
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown test mode '{}' (expected vm or schroot)", s))
    }
}

/// One unit of pipeline work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Create a VM image for a root suite from scratch
    Bootstrap,
    /// Derive a suite's VM image from its parent's
    New,
    /// Build an sbuild chroot tarball
    SbuildTarball,
    /// Build a minimal debootstrap tarball
    MinbaseTarball,
    /// Build source packages with sbuild
    Build {
        arch: BuildArch,
        sources: Vec<PathBuf>,
        output_dir: PathBuf,
    },
    /// Run autopkgtest
    Test {
        mode: TestMode,
        subjects: Vec<TestSubject>,
        output_dir: PathBuf,
    },
    /// Install, upgrade and purge binaries with piuparts
    Piuparts {
        packages: Vec<BinaryPackage>,
        output_dir: PathBuf,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Bootstrap => "bootstrap",
            Stage::New => "new",
            Stage::SbuildTarball => "sbuild-tarball",
            Stage::MinbaseTarball => "minbase-tarball",
            Stage::Build {
                arch: BuildArch::All,
                ..
            } => "build-all",
            Stage::Build {
                arch: BuildArch::Any,
                ..
            } => "build-any",
            Stage::Test {
                mode: TestMode::Vm,
                ..
            } => "test",
            Stage::Test {
                mode: TestMode::Schroot,
                ..
            } => "test-schroot",
            Stage::Piuparts { .. } => "piuparts",
        }
    }

    /// The store artifact this stage publishes, if any
    pub fn produces(&self) -> Option<ArtifactKind> {
        match self {
            Stage::Bootstrap | Stage::New => Some(ArtifactKind::VmImage),
            Stage::SbuildTarball => Some(ArtifactKind::SbuildTarball),
            Stage::MinbaseTarball => Some(ArtifactKind::MinbaseTarball),
            Stage::Build { .. } | Stage::Test { .. } | Stage::Piuparts { .. } => None,
        }
    }

    /// Stage that produces `kind` for `suite`
    pub fn producing(kind: ArtifactKind, suite: &Suite) -> Self {
        match kind {
            ArtifactKind::VmImage if suite.parent.is_some() => Stage::New,
            ArtifactKind::VmImage => Stage::Bootstrap,
            ArtifactKind::SbuildTarball => Stage::SbuildTarball,
            ArtifactKind::MinbaseTarball => Stage::MinbaseTarball,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A stage bound to the suite it runs for
#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub stage: Stage,
    pub suite: Arc<Suite>,
}

impl fmt::Display for PlannedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.stage, self.suite.label())
    }
}

/// What a stage left behind
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub suite: String,
    /// Published (or already cached) artifact
    pub artifact: Option<ArtifactHandle>,
    /// Files copied out to the host
    pub outputs: Vec<PathBuf>,
    /// Nothing ran: the artifact was already published
    pub cached: bool,
}

impl StageResult {
    pub(crate) fn cached(stage: &Stage, suite: &Suite, handle: ArtifactHandle) -> Self {
        Self {
            stage: stage.name().to_string(),
            suite: suite.label(),
            artifact: Some(handle),
            outputs: Vec::new(),
            cached: true,
        }
    }

    pub(crate) fn published(stage: &Stage, suite: &Suite, handle: ArtifactHandle) -> Self {
        Self {
            stage: stage.name().to_string(),
            suite: suite.label(),
            artifact: Some(handle),
            outputs: Vec::new(),
            cached: false,
        }
    }

    pub(crate) fn with_outputs(stage: &Stage, suite: &Suite, outputs: Vec<PathBuf>) -> Self {
        Self {
            stage: stage.name().to_string(),
            suite: suite.label(),
            artifact: None,
            outputs,
            cached: false,
        }
    }
}

/// Ordered stages that produce `target` for `suite`
///
/// VM images come first, root ancestor down to the suite itself. A tarball
/// is built inside a VM image, so when a separate worker suite is configured
/// its image chain is planned ahead of the suite's. Stages already
/// published are still listed; running them is a cache hit.
pub fn plan(
    target: ArtifactKind,
    suite: &Arc<Suite>,
    worker_suite: Option<&Arc<Suite>>,
) -> Vec<PlannedStage> {
    let mut planned: Vec<PlannedStage> = Vec::new();

    let mut push = |stage: Stage, suite: Arc<Suite>| {
        let duplicate = planned
            .iter()
            .any(|p| p.stage == stage && p.suite.label() == suite.label());
        if !duplicate {
            planned.push(PlannedStage { stage, suite });
        }
    };

    let image_suite = match (target, worker_suite) {
        (ArtifactKind::VmImage, _) | (_, None) => suite,
        (_, Some(worker)) => worker,
    };
    for ancestor in chain_root_first(image_suite) {
        push(Stage::producing(ArtifactKind::VmImage, &ancestor), ancestor);
    }

    if target != ArtifactKind::VmImage {
        push(Stage::producing(target, suite), Arc::clone(suite));
    }

    planned
}

fn chain_root_first(suite: &Arc<Suite>) -> Vec<Arc<Suite>> {
    let mut chain = Vec::new();
    let mut current = Some(Arc::clone(suite));
    while let Some(s) = current {
        current = s.parent.clone();
        chain.push(s);
    }
    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{builtin_vendors, Config, SuiteConfig};

    fn config() -> Config {
        Config {
            vendors: builtin_vendors(),
            ..Config::default()
        }
    }

    fn resolve(config: &Config, name: &str) -> Arc<Suite> {
        config.resolve_suite("debian", name, "amd64").unwrap()
    }

    fn names(plan: &[PlannedStage]) -> Vec<String> {
        plan.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Bootstrap.name(), "bootstrap");
        let build = Stage::Build {
            arch: BuildArch::Any,
            sources: vec![],
            output_dir: PathBuf::from("."),
        };
        assert_eq!(build.name(), "build-any");
        assert_eq!(build.produces(), None);
        assert_eq!(Stage::New.produces(), Some(ArtifactKind::VmImage));

        let test = |mode| Stage::Test {
            mode,
            subjects: vec![],
            output_dir: PathBuf::from("."),
        };
        assert_eq!(test(TestMode::Vm).name(), "test");
        assert_eq!(test(TestMode::Schroot).name(), "test-schroot");
        assert_eq!(test(TestMode::Schroot).produces(), None);
    }

    #[test]
    fn test_modes_parse() {
        assert_eq!("vm".parse::<TestMode>(), Ok(TestMode::Vm));
        assert_eq!("schroot".parse::<TestMode>(), Ok(TestMode::Schroot));
        assert!("lxc".parse::<TestMode>().unwrap_err().contains("expected vm or schroot"));
    }

    #[test]
    fn image_plan_for_root_suite() {
        let config = config();
        let sid = resolve(&config, "sid");
        assert_eq!(
            names(&plan(ArtifactKind::VmImage, &sid, None)),
            vec!["bootstrap debian/sid/amd64"]
        );
    }

    #[test]
    fn plan_walks_chain_root_first() {
        let config = config();
        let experimental = resolve(&config, "experimental");
        assert_eq!(
            names(&plan(ArtifactKind::SbuildTarball, &experimental, None)),
            vec![
                "bootstrap debian/sid/amd64",
                "new debian/experimental/amd64",
                "sbuild-tarball debian/experimental/amd64",
            ]
        );
    }

    #[test]
    fn worker_suite_images_come_first() {
        let mut config = config();
        if let Some(debian) = config.vendors.get_mut("debian") {
            debian
                .suites
                .insert("stable-work".to_string(), SuiteConfig {
                    base: Some("bookworm".to_string()),
                    ..SuiteConfig::default()
                });
        }
        let sid = resolve(&config, "sid");
        let worker = resolve(&config, "stable-work");

        assert_eq!(
            names(&plan(ArtifactKind::MinbaseTarball, &sid, Some(&worker))),
            vec![
                "bootstrap debian/bookworm/amd64",
                "new debian/stable-work/amd64",
                "minbase-tarball debian/sid/amd64",
            ]
        );

        // Images themselves never depend on the worker suite
        assert_eq!(
            names(&plan(ArtifactKind::VmImage, &sid, Some(&worker))),
            vec!["bootstrap debian/sid/amd64"]
        );
    }
}

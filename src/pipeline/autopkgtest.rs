//! autopkgtest recipe
//!
//! In [`TestMode::Vm`] the worker booted from the suite's image is the
//! testbed (`-- null`). In [`TestMode::Schroot`] the worker runs the worker
//! suite and autopkgtest drives a file-type schroot unpacked from the
//! suite's `minbase.tar.gz`, as the worker's unprivileged user.

use crate::config::Suite;
use crate::error::{VectisError, VectisResult};
use crate::package::{file_name, TestSubject};
use crate::pipeline::build::chroot_config;
use crate::pipeline::recipe::{copy_out_retrying, Recipe};
use crate::pipeline::stage::TestMode;
use crate::worker::{GuestCommand, Worker};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// Exit statuses autopkgtest uses for runs that did not fail
///
/// 0 all passed, 2 some skipped, 8 no tests in the package.
const PASSING_STATUSES: [i32; 3] = [0, 2, 8];

pub(crate) fn autopkgtest_passed(exit_code: i32) -> bool {
    PASSING_STATUSES.contains(&exit_code)
}

/// schroot name for a suite's minbase tarball
pub(crate) fn test_chroot_name(suite: &Suite) -> String {
    format!("{}-{}-autopkgtest", suite.name, suite.architecture)
}

/// Host directory a subject's results land in
pub(crate) fn results_dir(
    output_dir: &Path,
    mode: TestMode,
    subject: &TestSubject,
) -> VectisResult<PathBuf> {
    let first = subject
        .source
        .as_ref()
        .or_else(|| subject.binaries.first())
        .ok_or_else(|| VectisError::User("nothing to test".to_string()))?;
    let name = file_name(first)?;
    let stem = name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or(name);
    Ok(match mode {
        TestMode::Vm => output_dir.join(format!("autopkgtest_{}", stem)),
        TestMode::Schroot => output_dir.join(format!("autopkgtest_schroot_{}", stem)),
    })
}

/// Runs autopkgtest for each subject, one clean worker per subject
pub(crate) struct AutopkgtestRecipe<'a> {
    pub mode: TestMode,
    pub suite: &'a Suite,
    /// Suite whose image the worker booted
    pub worker_suite: &'a Suite,
    /// `minbase.tar.gz` on the host, for [`TestMode::Schroot`]
    pub tarball: Option<&'a Path>,
    pub subjects: &'a [TestSubject],
    pub output_dir: &'a Path,
    pub transfer_attempts: u32,
    pub outputs: Vec<PathBuf>,
}

impl AutopkgtestRecipe<'_> {
    /// Install autopkgtest, plus the schroot when testing in one
    ///
    /// Returns the `--` virt server arguments.
    async fn set_up_testbed(&self, worker: &mut Worker) -> VectisResult<Vec<String>> {
        worker.set_up_apt(self.worker_suite).await?;

        let tarball = match (self.mode, self.tarball) {
            (TestMode::Vm, _) => {
                worker.install(&["autopkgtest"]).await?;
                return Ok(vec!["null".to_string()]);
            }
            (TestMode::Schroot, Some(tarball)) => tarball,
            (TestMode::Schroot, None) => {
                return Err(VectisError::Internal(
                    "schroot test mode without a minbase tarball".to_string(),
                ))
            }
        };

        worker.install(&["autopkgtest", "python3", "schroot"]).await?;
        let chroot = test_chroot_name(self.suite);
        let guest_tarball = worker.make_file_available(tarball, true).await?;
        let groups = format!("root,{}", worker.user());
        worker
            .check(&GuestCommand::new(["mkdir", "-p", "/etc/schroot/chroot.d"]))
            .await?;
        worker
            .write_file(
                &format!("/etc/schroot/chroot.d/{}", chroot),
                &chroot_config(&chroot, &guest_tarball, &groups, "default"),
            )
            .await?;
        Ok(vec!["schroot".to_string(), chroot])
    }
}

#[async_trait]
impl Recipe for AutopkgtestRecipe<'_> {
    fn steps(&self) -> usize {
        self.subjects.len()
    }

    async fn run_step(&mut self, worker: &mut Worker, step: usize) -> VectisResult<()> {
        let subjects = self.subjects;
        let subject = subjects
            .get(step)
            .ok_or_else(|| VectisError::Internal(format!("no test subject for step {}", step)))?;

        let virt = self.set_up_testbed(worker).await?;

        let mut argv = Vec::new();
        if self.mode == TestMode::Schroot {
            argv.extend(["runuser", "-u", worker.user(), "--"].map(str::to_string));
        }
        argv.extend(["autopkgtest".to_string(), "--apt-upgrade".to_string()]);

        for binary in &subject.binaries {
            let guest = if binary.extension().is_some_and(|e| e == "changes") {
                worker.make_control_file_available(binary).await?
            } else {
                worker.make_file_available(binary, false).await?
            };
            argv.push(guest);
        }
        if let Some(source) = &subject.source {
            argv.push(worker.make_control_file_available(source).await?);
        }

        let dir = worker.new_directory("autopkgtest-").await?;
        let out = format!("{}/out", dir);
        argv.push(format!("--output-dir={}", out));

        if self.mode == TestMode::Schroot {
            let sources = format!("{}/sources.list", dir);
            worker.write_file(&sources, &self.suite.sources_list()).await?;
            argv.push(format!("--copy={}:/etc/apt/sources.list", sources));

            let user = worker.user().to_string();
            worker
                .check(&GuestCommand::new(["chown", user.as_str(), dir.as_str()]))
                .await?;
        }
        argv.push("--".to_string());
        argv.extend(virt);

        let command = GuestCommand::new(argv).env("DEBIAN_FRONTEND", "noninteractive");
        let result = worker.execute(&command).await?;
        info!("autopkgtest exited with status {}", result.exit_code);

        let host = results_dir(self.output_dir, self.mode, subject)?;
        fs::create_dir_all(self.output_dir)
            .await
            .map_err(|e| VectisError::io(format!("creating {}", self.output_dir.display()), e))?;
        match copy_out_retrying(worker, &format!("{}/", out), &host, self.transfer_attempts).await {
            Ok(()) => self.outputs.push(host),
            // autopkgtest that failed early may not have made the directory
            Err(e) if !autopkgtest_passed(result.exit_code) => {
                warn!("No autopkgtest results to copy: {}", e)
            }
            Err(e) => return Err(e),
        }

        if !autopkgtest_passed(result.exit_code) {
            return Err(VectisError::BuildFailure {
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr_tail().await,
            });
        }
        Ok(())
    }
}

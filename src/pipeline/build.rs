//! Package build recipe
//!
//! Each source package is built by sbuild inside the worker, in a
//! file-type schroot unpacked from the suite's `sbuild.tar.gz`. Everything
//! sbuild leaves in its output directory, build log included, is copied
//! back even when the build fails.

use crate::config::Suite;
use crate::error::{VectisError, VectisResult};
use crate::pipeline::recipe::{copy_out_retrying, Recipe};
use crate::pipeline::stage::BuildArch;
use crate::worker::{GuestCommand, Worker};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// schroot setup hook copying per-chroot apt sources into the session
const SOURCES_HOOK: &str = r#"#!/bin/sh
set -e
if [ "$1" = setup-start ] || [ "$1" = setup-recover ]; then
    if [ -f "/etc/schroot/sources.list.d/${CHROOT_ALIAS}" ]; then
        echo "$0: Copying /etc/schroot/sources.list.d/${CHROOT_ALIAS} into ${CHROOT_PATH}" >&2
        cp "/etc/schroot/sources.list.d/${CHROOT_ALIAS}" "${CHROOT_PATH}/etc/apt/sources.list"
    fi
fi
"#;

/// schroot name for a suite's tarball
pub(crate) fn chroot_name(suite: &Suite) -> String {
    format!("{}-{}-sbuild", suite.name, suite.architecture)
}

/// schroot definition for a file-type chroot
///
/// `groups` may enter the chroot and become root in it.
pub(crate) fn chroot_config(chroot: &str, tarball: &str, groups: &str, profile: &str) -> String {
    format!(
        "[{chroot}]\n\
         type=file\n\
         description={chroot}\n\
         file={tarball}\n\
         groups={groups}\n\
         root-groups={groups}\n\
         profile={profile}\n"
    )
}

pub(crate) fn sbuild_command(suite: &Suite, chroot: &str, arch: BuildArch, dsc: &str) -> GuestCommand {
    let mut argv = vec![
        "runuser".to_string(),
        "-u".to_string(),
        "sbuild".to_string(),
        "--".to_string(),
        "sbuild".to_string(),
        "-c".to_string(),
        chroot.to_string(),
        "-d".to_string(),
        suite.apt_suite.clone(),
        "--no-run-lintian".to_string(),
    ];
    match arch {
        BuildArch::All => {
            argv.push("-A".to_string());
            argv.push("--no-arch-any".to_string());
        }
        BuildArch::Any => {
            argv.push(format!("--arch={}", suite.architecture));
            argv.push("--no-arch-all".to_string());
        }
    }
    argv.push(dsc.to_string());
    GuestCommand::new(argv)
}

pub(crate) struct BuildRecipe<'a> {
    pub suite: &'a Suite,
    pub worker_suite: &'a Suite,
    pub tarball: &'a Path,
    pub arch: BuildArch,
    pub sources: &'a [PathBuf],
    pub output_dir: &'a Path,
    pub transfer_attempts: u32,
    /// Host files copied out so far
    pub outputs: Vec<PathBuf>,
}

impl BuildRecipe<'_> {
    async fn set_up_chroot(&self, worker: &mut Worker, chroot: &str) -> VectisResult<()> {
        worker.set_up_apt(self.worker_suite).await?;
        worker.install(&["sbuild", "schroot"]).await?;

        let tarball = worker.make_file_available(self.tarball, true).await?;
        worker
            .check(&GuestCommand::new([
                "mkdir",
                "-p",
                "/etc/schroot/chroot.d",
                "/etc/schroot/sources.list.d",
            ]))
            .await?;
        worker
            .write_file(
                &format!("/etc/schroot/chroot.d/{}", chroot),
                &chroot_config(chroot, &tarball, "root,sbuild", "sbuild"),
            )
            .await?;
        worker
            .write_file(
                &format!("/etc/schroot/sources.list.d/{}", chroot),
                &self.suite.sources_list(),
            )
            .await?;

        let hook = "/etc/schroot/setup.d/60vectis-sources";
        worker.write_file(hook, SOURCES_HOOK).await?;
        worker
            .check(&GuestCommand::new(["chmod", "0755", hook]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Recipe for BuildRecipe<'_> {
    fn steps(&self) -> usize {
        self.sources.len()
    }

    async fn run_step(&mut self, worker: &mut Worker, step: usize) -> VectisResult<()> {
        let sources = self.sources;
        let dsc = sources
            .get(step)
            .ok_or_else(|| VectisError::Internal(format!("no source package for step {}", step)))?;
        let chroot = chroot_name(self.suite);

        info!(
            "Building {} (arch {}) for {}",
            dsc.display(),
            self.arch.as_str(),
            self.suite.label()
        );
        self.set_up_chroot(worker, &chroot).await?;

        let guest_dsc = worker.make_control_file_available(dsc).await?;
        let dir = worker.new_directory("build-").await?;
        let out = format!("{}/out", dir);
        worker
            .check(&GuestCommand::new([
                "install", "-d", "-m755", "-osbuild", "-gsbuild", out.as_str(),
            ]))
            .await?;

        let command = sbuild_command(self.suite, &chroot, self.arch, &guest_dsc).cwd(out.as_str());
        let result = worker.execute(&command).await?;

        fs::create_dir_all(self.output_dir)
            .await
            .map_err(|e| VectisError::io(format!("creating {}", self.output_dir.display()), e))?;

        let listing = worker
            .check_output(&GuestCommand::new(["ls", "-1A", out.as_str()]))
            .await?;
        for name in listing.lines().map(str::trim).filter(|n| !n.is_empty()) {
            let host = self.output_dir.join(name);
            copy_out_retrying(
                worker,
                &format!("{}/{}", out, name),
                &host,
                self.transfer_attempts,
            )
            .await?;
            self.outputs.push(host);
        }

        if !result.success() {
            return Err(VectisError::BuildFailure {
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr_tail().await,
            });
        }
        Ok(())
    }
}

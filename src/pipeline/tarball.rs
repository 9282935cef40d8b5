//! Chroot tarball recipes

use crate::config::Suite;
use crate::error::VectisResult;
use crate::pipeline::recipe::{copy_out_retrying, Recipe};
use crate::worker::{GuestCommand, Worker};
use async_trait::async_trait;
use std::path::Path;

/// Packages every sbuild chroot gets on top of the buildd set
const SBUILD_EXTRA_PACKAGES: &str = "fakeroot,sudo,vim";

pub(crate) fn sbuild_createchroot_command(suite: &Suite, tarball: &str, chroot: &str) -> GuestCommand {
    GuestCommand::new([
        "sbuild-createchroot".to_string(),
        format!("--arch={}", suite.architecture),
        format!("--include={}", SBUILD_EXTRA_PACKAGES),
        format!("--components={}", suite.components.join(",")),
        format!("--make-sbuild-tarball={}", tarball),
        suite.apt_suite.clone(),
        chroot.to_string(),
        suite.mirror.clone(),
    ])
    .env("DEBIAN_FRONTEND", "noninteractive")
}

pub(crate) fn debootstrap_minbase_command(suite: &Suite, chroot: &str) -> GuestCommand {
    GuestCommand::new([
        "debootstrap".to_string(),
        format!("--arch={}", suite.architecture),
        format!("--components={}", suite.components.join(",")),
        "--variant=minbase".to_string(),
        "--verbose".to_string(),
        suite.apt_suite.clone(),
        chroot.to_string(),
        suite.mirror.clone(),
    ])
}

/// Builds `sbuild.tar.gz` with `sbuild-createchroot`
///
/// `worker_suite` is the suite whose image the worker booted.
pub(crate) struct SbuildTarballRecipe<'a> {
    pub suite: &'a Suite,
    pub worker_suite: &'a Suite,
    pub output: &'a Path,
    pub transfer_attempts: u32,
}

#[async_trait]
impl Recipe for SbuildTarballRecipe<'_> {
    async fn run_step(&mut self, worker: &mut Worker, _step: usize) -> VectisResult<()> {
        worker.set_up_apt(self.worker_suite).await?;
        worker
            .install(&["debootstrap", "python3", "sbuild", "schroot"])
            .await?;

        let dir = worker.new_directory("sbuild-tarball-").await?;
        let tarball = format!("{}/sbuild.tar.gz", dir);
        let chroot = format!("{}/chroot", dir);

        worker
            .check(&sbuild_createchroot_command(self.suite, &tarball, &chroot))
            .await?;

        copy_out_retrying(worker, &tarball, self.output, self.transfer_attempts).await
    }
}

/// Builds `minbase.tar.gz` from a `debootstrap --variant=minbase` chroot
pub(crate) struct MinbaseTarballRecipe<'a> {
    pub suite: &'a Suite,
    pub worker_suite: &'a Suite,
    pub output: &'a Path,
    pub transfer_attempts: u32,
}

#[async_trait]
impl Recipe for MinbaseTarballRecipe<'_> {
    async fn run_step(&mut self, worker: &mut Worker, _step: usize) -> VectisResult<()> {
        worker.set_up_apt(self.worker_suite).await?;
        worker.install(&["debootstrap", "python3"]).await?;

        let dir = worker.new_directory("minbase-tarball-").await?;
        let tarball = format!("{}/minbase.tar.gz", dir);
        let chroot = format!("{}/chroot", dir);

        worker
            .check(&debootstrap_minbase_command(self.suite, &chroot))
            .await?;
        worker
            .check(&GuestCommand::new(["chroot", chroot.as_str(), "apt-get", "clean"]))
            .await?;
        worker
            .check(&GuestCommand::new([
                "tar",
                "-C",
                chroot.as_str(),
                "-f",
                tarball.as_str(),
                "-z",
                "-c",
                ".",
            ]))
            .await?;

        copy_out_retrying(worker, &tarball, self.output, self.transfer_attempts).await
    }
}

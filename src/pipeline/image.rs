//! VM image recipes

use crate::config::Suite;
use crate::error::VectisResult;
use crate::pipeline::recipe::{copy_in_retrying, copy_out_retrying, install_if_isolated, Recipe};
use crate::worker::{GuestCommand, Worker};
use async_trait::async_trait;
use std::path::Path;

const SETUP_TESTBED: &str = "/usr/share/autopkgtest/setup-commands/setup-testbed";

/// Default kernel flavour for an architecture
fn default_kernel_package(architecture: &str) -> String {
    let flavour = match architecture {
        "i386" => "686",
        "armhf" | "armel" => "armmp",
        "ppc64el" => "powerpc64le",
        other => other,
    };
    format!("linux-image-{}", flavour)
}

/// The `vmdebootstrap` invocation that creates a raw image
pub(crate) fn vmdebootstrap_command(suite: &Suite, size: &str, image: &str) -> GuestCommand {
    let kernel = suite
        .kernel_package
        .clone()
        .unwrap_or_else(|| default_kernel_package(&suite.architecture));

    let argv = vec![
        "vmdebootstrap".to_string(),
        "--log=/dev/stderr".to_string(),
        "--verbose".to_string(),
        "--serial-console".to_string(),
        format!("--distribution={}", suite.apt_suite),
        "--user=user".to_string(),
        "--hostname=host".to_string(),
        "--sparse".to_string(),
        format!("--size={}", size),
        format!("--mirror={}", suite.mirror),
        format!("--arch={}", suite.architecture),
        "--grub".to_string(),
        "--no-extlinux".to_string(),
        format!("--kernel-package={}", kernel),
        format!("--debootstrapopts=components={}", suite.components.join(",")),
        format!("--customize={}", SETUP_TESTBED),
        format!("--image={}", image),
    ];

    GuestCommand::new(argv)
        .env("AUTOPKGTEST_APT_PROXY", "DIRECT")
        .env("MIRROR", &suite.mirror)
        .env("RELEASE", &suite.apt_suite)
        .env("DEBIAN_FRONTEND", "noninteractive")
}

/// Creates a root suite's image from nothing
pub(crate) struct BootstrapRecipe<'a> {
    pub suite: &'a Suite,
    pub output: &'a Path,
    pub image_size: &'a str,
    pub transfer_attempts: u32,
}

#[async_trait]
impl Recipe for BootstrapRecipe<'_> {
    async fn run_step(&mut self, worker: &mut Worker, _step: usize) -> VectisResult<()> {
        install_if_isolated(
            worker,
            &["autopkgtest", "grub2-common", "python3", "qemu-utils", "vmdebootstrap"],
        )
        .await?;

        let dir = worker.new_directory("bootstrap-").await?;
        let raw = format!("{}/output.raw", dir);
        let qcow2 = format!("{}/autopkgtest.qcow2", dir);

        worker
            .check(&vmdebootstrap_command(self.suite, self.image_size, &raw))
            .await?;
        worker
            .check(&GuestCommand::new([
                "qemu-img", "convert", "-f", "raw", "-O", "qcow2", "-c", "-p", raw.as_str(), qcow2.as_str(),
            ]))
            .await?;

        copy_out_retrying(worker, &qcow2, self.output, self.transfer_attempts).await
    }
}

/// Turns a copy of the parent's image into the derived suite's image
///
/// `image` starts out as that copy and is overwritten with the result.
pub(crate) struct DeriveRecipe<'a> {
    pub suite: &'a Suite,
    pub image: &'a Path,
    pub transfer_attempts: u32,
}

#[async_trait]
impl Recipe for DeriveRecipe<'_> {
    async fn run_step(&mut self, worker: &mut Worker, _step: usize) -> VectisResult<()> {
        install_if_isolated(worker, &["libguestfs-tools", "qemu-utils"]).await?;

        let dir = worker.new_directory("new-").await?;
        let input = format!("{}/input.qcow2", dir);
        let output = format!("{}/autopkgtest.qcow2", dir);
        let sources = format!("{}/sources.list", dir);

        copy_in_retrying(worker, self.image, &input, self.transfer_attempts).await?;
        worker.write_file(&sources, &self.suite.sources_list()).await?;

        let copy_sources = format!("{}:/etc/apt", sources);
        worker
            .check(
                &GuestCommand::new([
                    "virt-customize",
                    "-a",
                    input.as_str(),
                    "--copy-in",
                    copy_sources.as_str(),
                    "--run-command",
                    "apt-get update",
                    "--run-command",
                    "DEBIAN_FRONTEND=noninteractive apt-get -y dist-upgrade",
                    "--run-command",
                    "DEBIAN_FRONTEND=noninteractive apt-get -y --no-install-recommends install python3 sbuild schroot",
                ])
                .env("LIBGUESTFS_BACKEND", "direct"),
            )
            .await?;
        worker
            .check(&GuestCommand::new([
                "qemu-img", "convert", "-f", "qcow2", "-O", "qcow2", "-c", "-p", input.as_str(), output.as_str(),
            ]))
            .await?;

        copy_out_retrying(worker, &output, self.image, self.transfer_attempts).await
    }
}

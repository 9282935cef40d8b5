//! piuparts recipe
//!
//! piuparts runs inside a worker booted from the worker suite and builds
//! its own chroots from the target suite's `minbase.tar.gz`. Local `.deb`
//! files are copied in; named packages come from the suite's archive.

use crate::config::Suite;
use crate::error::{VectisError, VectisResult};
use crate::package::BinaryPackage;
use crate::pipeline::recipe::{copy_out_retrying, Recipe};
use crate::worker::{GuestCommand, Worker};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// apt arguments: the suite as `-d`/`--mirror`, ancestors as extra repos
fn apt_arguments(suite: &Suite) -> Vec<String> {
    let mut argv = vec![
        "-d".to_string(),
        suite.apt_suite.clone(),
        "--mirror".to_string(),
        format!("{} {}", suite.mirror, suite.components.join(" ")),
    ];
    for ancestor in suite.hierarchy().skip(1) {
        argv.push("--extra-repo".to_string());
        argv.push(format!(
            "deb {} {} {}",
            ancestor.mirror,
            ancestor.apt_suite,
            ancestor.components.join(" ")
        ));
    }
    argv
}

/// `piuparts` install/purge run over `packages` (guest paths or names)
pub(crate) fn piuparts_command(
    suite: &Suite,
    tarball: &str,
    log: &str,
    packages: &[String],
    from_apt: bool,
) -> GuestCommand {
    let mut argv = vec![
        "piuparts".to_string(),
        "--arch".to_string(),
        suite.architecture.clone(),
        "-b".to_string(),
        tarball.to_string(),
    ];
    if from_apt {
        argv.push("--apt".to_string());
    }
    argv.push("-l".to_string());
    argv.push(log.to_string());
    argv.extend(apt_arguments(suite));
    argv.extend(packages.iter().cloned());
    GuestCommand::new(argv)
}

/// Host directory piuparts logs land in
pub(crate) fn results_dir(output_dir: &Path, packages: &[BinaryPackage]) -> VectisResult<PathBuf> {
    let first = packages
        .first()
        .ok_or_else(|| VectisError::User("nothing to test with piuparts".to_string()))?;
    Ok(output_dir.join(format!("piuparts_{}", first.label())))
}

pub(crate) struct PiupartsRecipe<'a> {
    pub suite: &'a Suite,
    pub worker_suite: &'a Suite,
    pub tarball: &'a Path,
    pub packages: &'a [BinaryPackage],
    pub output_dir: &'a Path,
    pub transfer_attempts: u32,
    pub outputs: Vec<PathBuf>,
}

#[async_trait]
impl Recipe for PiupartsRecipe<'_> {
    async fn run_step(&mut self, worker: &mut Worker, _step: usize) -> VectisResult<()> {
        worker.set_up_apt(self.worker_suite).await?;
        worker.install(&["piuparts"]).await?;

        let tarball = worker.make_file_available(self.tarball, true).await?;
        let mut packages = Vec::with_capacity(self.packages.len());
        let mut from_apt = false;
        for package in self.packages {
            match package {
                BinaryPackage::Deb(path) => {
                    packages.push(worker.make_file_available(path, false).await?)
                }
                BinaryPackage::Named(name) => {
                    from_apt = true;
                    packages.push(name.clone());
                }
            }
        }

        let dir = worker.new_directory("piuparts-").await?;
        let log = format!("{}/piuparts.log", dir);
        let command = piuparts_command(self.suite, &tarball, &log, &packages, from_apt);
        let result = worker.execute(&command).await?;
        info!("piuparts exited with status {}", result.exit_code);

        let host = results_dir(self.output_dir, self.packages)?;
        fs::create_dir_all(self.output_dir)
            .await
            .map_err(|e| VectisError::io(format!("creating {}", self.output_dir.display()), e))?;
        match copy_out_retrying(worker, &format!("{}/", dir), &host, self.transfer_attempts).await {
            Ok(()) => self.outputs.push(host),
            Err(e) if !result.success() => warn!("No piuparts log to copy: {}", e),
            Err(e) => return Err(e),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{builtin_vendors, Config};

    fn resolve(name: &str) -> std::sync::Arc<Suite> {
        let config = Config {
            vendors: builtin_vendors(),
            ..Config::default()
        };
        config.resolve_suite("debian", name, "amd64").unwrap()
    }

    #[test]
    fn piuparts_arguments_for_derived_suite() {
        let experimental = resolve("experimental");
        let command = piuparts_command(
            &experimental,
            "/w/minbase.tar.gz",
            "/w/out/piuparts.log",
            &["/w/a/hello_1_amd64.deb".to_string(), "coreutils".to_string()],
            true,
        );
        let argv = command.argv();

        assert_eq!(
            &argv[..8],
            &[
                "piuparts",
                "--arch",
                "amd64",
                "-b",
                "/w/minbase.tar.gz",
                "--apt",
                "-l",
                "/w/out/piuparts.log",
            ]
        );
        let d = argv.iter().position(|a| a == "-d").unwrap();
        assert_eq!(argv[d + 1], "experimental");
        let extra = argv.iter().position(|a| a == "--extra-repo").unwrap();
        assert!(argv[extra + 1].starts_with("deb "));
        assert!(argv[extra + 1].contains(" sid "));
        assert_eq!(argv.last().map(String::as_str), Some("coreutils"));
    }

    #[test]
    fn root_suite_needs_no_extra_repos() {
        let sid = resolve("sid");
        let command = piuparts_command(&sid, "/t", "/l", &["/x.deb".to_string()], false);
        assert!(!command.argv().contains(&"--extra-repo".to_string()));
        assert!(!command.argv().contains(&"--apt".to_string()));
    }

    #[test]
    fn results_named_after_first_package() {
        let packages = vec![
            BinaryPackage::Deb(PathBuf::from("/src/hello_1.0_amd64.deb")),
            BinaryPackage::Named("coreutils".to_string()),
        ];
        assert_eq!(
            results_dir(Path::new("/out"), &packages).unwrap(),
            PathBuf::from("/out/piuparts_hello_1.0_amd64")
        );
        assert!(results_dir(Path::new("/out"), &[]).is_err());
    }
}

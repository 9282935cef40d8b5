//! Running an arbitrary command in a suite's image

use crate::config::Suite;
use crate::error::{VectisError, VectisResult};
use crate::package::file_name;
use crate::pipeline::recipe::{copy_in_retrying, copy_out_retrying, Recipe};
use crate::worker::{GuestCommand, Worker};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// A command to run in a fresh worker
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Program and arguments, or the positional parameters of `shell`
    pub argv: Vec<String>,
    /// Shell one-liner run with `sh -c`
    pub shell: Option<String>,
    /// Host file or directory made available as `$VECTIS_IN`
    pub input: Option<PathBuf>,
    /// Host directory receiving `$VECTIS_OUT`
    pub output_dir: PathBuf,
    /// `in`, `out`, `tmp`, `.` or an absolute guest path
    pub chdir: String,
}

impl RunRequest {
    pub fn new(argv: Vec<String>, output_dir: PathBuf) -> Self {
        Self {
            argv,
            shell: None,
            input: None,
            output_dir,
            chdir: "tmp".to_string(),
        }
    }

    /// `vectis-run_<timestamp>` under `parent`
    pub fn default_output_dir(parent: &Path) -> PathBuf {
        parent.join(format!("vectis-run_{}", Utc::now().format("%Y%m%dt%H%M%S")))
    }

    pub fn validate(&self) -> VectisResult<()> {
        if self.shell.is_none() && self.argv.is_empty() {
            return Err(VectisError::User(
                "Usage: vectis run -- PROGRAM [ARGS...] or vectis run -c 'shell one-liner' [$0 [$1...]]"
                    .to_string(),
            ));
        }
        match self.chdir.as_str() {
            "in" | "out" | "tmp" | "." => Ok(()),
            dir if dir.starts_with('/') => Ok(()),
            other => Err(VectisError::User(format!(
                "--chdir must be 'in', 'out', 'tmp', '.' or absolute, not '{}'",
                other
            ))),
        }
    }
}

pub(crate) struct RunRecipe<'a> {
    pub suite: &'a Suite,
    pub request: &'a RunRequest,
    pub transfer_attempts: u32,
    pub outputs: Vec<PathBuf>,
}

#[async_trait]
impl Recipe for RunRecipe<'_> {
    async fn run_step(&mut self, worker: &mut Worker, _step: usize) -> VectisResult<()> {
        let request = self.request;
        worker.set_up_apt(self.suite).await?;

        let dir = worker.new_directory("run-").await?;
        let mut input = format!("{}/in", dir);
        let artifacts = format!("{}/out", dir);
        let temp = format!("{}/tmp", dir);
        worker
            .check(&GuestCommand::new([
                "mkdir",
                input.as_str(),
                artifacts.as_str(),
                temp.as_str(),
            ]))
            .await?;

        let cwd = match request.chdir.as_str() {
            "in" => input.clone(),
            "out" => artifacts.clone(),
            "tmp" => temp.clone(),
            other => other.to_string(),
        };

        if let Some(host) = &request.input {
            if host.is_dir() {
                copy_in_retrying(worker, host, &input, self.transfer_attempts).await?;
            } else {
                input = format!("{}/{}", input, file_name(host)?);
                copy_in_retrying(worker, host, &input, self.transfer_attempts).await?;
            }
        }

        let mut argv = Vec::new();
        if let Some(shell) = &request.shell {
            argv.extend(["sh".to_string(), "-c".to_string(), shell.clone()]);
        }
        argv.extend(request.argv.iter().cloned());

        let mut command = GuestCommand::new(argv)
            .cwd(cwd)
            .env("AUTOPKGTEST_ARTIFACTS", &artifacts)
            .env("ADT_ARTIFACTS", &artifacts)
            .env("VECTIS_OUT", &artifacts)
            .env("VECTIS_TMP", &temp)
            .env("AUTOPKGTEST_TMP", &temp)
            .env("ADTTMP", &temp);
        if request.input.is_some() {
            command = command.env("VECTIS_IN", &input);
        }

        let result = worker.execute(&command).await?;

        let listing = worker
            .check_output(&GuestCommand::new(["ls", "-1A", artifacts.as_str()]))
            .await?;
        if listing.trim().is_empty() {
            info!("Command produced no artifacts");
        } else {
            fs::create_dir_all(&request.output_dir).await.map_err(|e| {
                VectisError::io(format!("creating {}", request.output_dir.display()), e)
            })?;
            copy_out_retrying(
                worker,
                &format!("{}/", artifacts),
                &request.output_dir,
                self.transfer_attempts,
            )
            .await?;
            info!(
                "Artifacts produced by command are in {}",
                request.output_dir.display()
            );
            self.outputs.push(request.output_dir.clone());
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

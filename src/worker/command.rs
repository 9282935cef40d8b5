//! Commands run inside the guest and their captured output

use crate::error::{VectisError, VectisResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Max number of stderr lines kept in a build failure
const ERROR_TAIL_LINES: usize = 50;

/// Changes directory before exec'ing the real command
const CHDIR_WRAPPER: &str = "cd \"$1\" && shift && exec \"$@\"";

/// A command line to run in the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    argv: Vec<String>,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    stdin: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl GuestCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Run in this guest directory
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the command
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed a host file to the command's stdin
    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Override the worker's command timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn stdin_path(&self) -> Option<&Path> {
        self.stdin.as_deref()
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    /// The argv handed to the execute prefix, including cwd and env handling
    pub fn wrapped(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(ref cwd) = self.cwd {
            out.extend([
                "sh".to_string(),
                "-c".to_string(),
                CHDIR_WRAPPER.to_string(),
                "sh".to_string(),
                cwd.clone(),
            ]);
        }
        if !self.env.is_empty() {
            out.push("env".to_string());
            out.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        }
        out.extend(self.argv.iter().cloned());
        out
    }
}

impl fmt::Display for GuestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// Where a finished command's output was captured on the host
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Captured stdout, decoded lossily
    pub async fn stdout(&self) -> VectisResult<String> {
        read_lossy(&self.stdout_path).await
    }

    /// Captured stderr, decoded lossily
    pub async fn stderr(&self) -> VectisResult<String> {
        read_lossy(&self.stderr_path).await
    }

    /// Last lines of stderr, for error messages
    pub async fn stderr_tail(&self) -> String {
        match self.stderr().await {
            Ok(text) => tail(&text, ERROR_TAIL_LINES),
            Err(_) => String::new(),
        }
    }
}

async fn read_lossy(path: &Path) -> VectisResult<String> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| VectisError::io(format!("reading {}", path.display()), e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The last `lines` lines of `text`
pub(crate) fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

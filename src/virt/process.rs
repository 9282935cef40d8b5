//! Virt server running as a child process
//!
//! Requests go to the server's stdin, responses come back one per line on
//! its stdout. The server's stderr is passed through to ours.

use crate::error::{VectisError, VectisResult};
use crate::virt::backend::{find_virt_program, BackendConnection};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// How long to wait after SIGTERM before killing
const SIGTERM_GRACE: Duration = Duration::from_secs(5);

/// Control channel over a child process's stdio
pub struct ProcessConnection {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessConnection {
    /// Spawn the virt server named by `argv[0]`
    pub async fn spawn(name: &str, argv: &[String]) -> VectisResult<Self> {
        let (kind, args) = argv.split_first().ok_or_else(|| VectisError::BackendUnavailable {
            backend: name.to_string(),
            reason: "empty command line".to_string(),
        })?;
        let program = find_virt_program(kind)?;

        debug!("Launching {}: {} {:?}", name, program.display(), args);

        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VectisError::BackendUnavailable {
                backend: name.to_string(),
                reason: format!("failed to start {}: {}", program.display(), e),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| VectisError::BackendUnavailable {
            backend: name.to_string(),
            reason: "no stdout pipe".to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    fn send_sigterm(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let pid = Pid::from_raw(pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            if e != Errno::ESRCH {
                warn!("Failed to send SIGTERM to {}: {}", self.name, e);
            }
        }
    }
}

#[async_trait]
impl BackendConnection for ProcessConnection {
    async fn send(&mut self, line: &str) -> VectisResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VectisError::protocol(&self.name, line, "control channel closed"))?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        stdin
            .write_all(&buf)
            .await
            .map_err(|e| VectisError::protocol(&self.name, line, format!("write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| VectisError::protocol(&self.name, line, format!("write failed: {}", e)))
    }

    async fn recv(&mut self) -> VectisResult<Option<String>> {
        self.stdout
            .next_line()
            .await
            .map_err(|e| VectisError::protocol(&self.name, "<read>", format!("read failed: {}", e)))
    }

    async fn run(
        &mut self,
        argv: &[String],
        stdin: Option<&Path>,
        stdout: &Path,
        stderr: &Path,
    ) -> VectisResult<i32> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| VectisError::Internal("empty command".to_string()))?;

        let out = std::fs::File::create(stdout)
            .map_err(|e| VectisError::io(format!("creating {}", stdout.display()), e))?;
        let err = std::fs::File::create(stderr)
            .map_err(|e| VectisError::io(format!("creating {}", stderr.display()), e))?;
        let input = match stdin {
            Some(path) => Stdio::from(
                std::fs::File::open(path)
                    .map_err(|e| VectisError::io(format!("opening {}", path.display()), e))?,
            ),
            None => Stdio::null(),
        };

        let status = Command::new(program)
            .args(args)
            .stdin(input)
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| VectisError::BackendUnavailable {
                backend: self.name.clone(),
                reason: format!("failed to run {}: {}", program, e),
            })?;

        Ok(status.code().unwrap_or(-1))
    }

    async fn terminate(&mut self, grace: Duration) -> VectisResult<()> {
        // Closing stdin is the server's cue to exit
        drop(self.stdin.take());

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} exited with {}", self.name, status);
                return Ok(());
            }
            Ok(Err(e)) => {
                return Err(VectisError::io(format!("waiting for {}", self.name), e));
            }
            Err(_) => {
                warn!("{} did not exit after {}s, terminating", self.name, grace.as_secs());
            }
        }

        self.send_sigterm();
        if tokio::time::timeout(SIGTERM_GRACE, self.child.wait())
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!("{} ignored SIGTERM, killing", self.name);
        self.child
            .kill()
            .await
            .map_err(|e| VectisError::io(format!("killing {}", self.name), e))
    }

    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

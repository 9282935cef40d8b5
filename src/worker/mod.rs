//! Worker sessions
//!
//! A [`Worker`] owns one virt server process for its whole life: it
//! performs the handshake, runs commands in the guest, moves files across
//! the boundary and shuts the server down. Every protocol exchange is
//! bounded by a timeout; a timeout or an unexpected reply leaves the
//! session `Failed`, after which only [`Worker::close`] is accepted.

pub mod command;
pub mod state;

pub use command::{ExecOutput, GuestCommand};
pub use state::{Capabilities, WorkerState};

use crate::config::schema::WorkerConfig;
use crate::config::Suite;
use crate::error::{VectisError, VectisResult};
use crate::package::{file_name, listed_files, sibling_dir};
use crate::virt::backend::{BackendConnection, VirtualizationBackend};
use crate::virt::protocol::{ok_payload, parse_execute_command, quote, quote_path};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long the server gets to exit after `quit`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Limits and requirements for a session
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Upper bound for one protocol request
    pub request_timeout: Duration,
    /// Upper bound for one guest command
    pub command_timeout: Duration,
    /// Refuse backends without machine or container isolation
    pub require_isolation: bool,
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            require_isolation: true,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// An open session with a virt server
pub struct Worker {
    backend: String,
    connection: Box<dyn BackendConnection>,
    state: WorkerState,
    capabilities: Capabilities,
    scratch: String,
    exec_prefix: Vec<String>,
    host_scratch: PathBuf,
    options: WorkerOptions,
    cached_copies: HashMap<PathBuf, String>,
    session_open: bool,
    exec_count: u64,
    finished: bool,
}

impl Worker {
    /// Launch the backend and perform the handshake
    ///
    /// On failure the backend process has already been shut down.
    pub async fn open(
        backend: &dyn VirtualizationBackend,
        options: WorkerOptions,
    ) -> VectisResult<Self> {
        let name = backend.name();
        info!("Starting worker: {}", name);

        let connection = backend.launch().await?;
        let mut worker = Self {
            backend: name,
            connection,
            state: WorkerState::Opening,
            capabilities: Capabilities::default(),
            scratch: String::new(),
            exec_prefix: Vec::new(),
            host_scratch: std::env::temp_dir().join(format!("vectis-worker-{}", Uuid::new_v4())),
            options,
            cached_copies: HashMap::new(),
            session_open: false,
            exec_count: 0,
            finished: false,
        };

        match worker.handshake().await {
            Ok(()) => Ok(worker),
            Err(e) => {
                if let Err(close_err) = worker.shutdown().await {
                    debug!("Cleanup after failed open: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> VectisResult<()> {
        fs::create_dir_all(&self.host_scratch)
            .await
            .map_err(|e| VectisError::io(format!("creating {}", self.host_scratch.display()), e))?;

        let limit = self.options.request_timeout;
        let received = tokio::time::timeout(limit, self.connection.recv()).await;
        let greeting = match received {
            Err(_) => {
                self.fail();
                return Err(VectisError::TimeoutError {
                    operation: format!("waiting for {} to start", self.backend),
                    seconds: limit.as_secs(),
                });
            }
            Ok(Err(e)) => {
                self.fail();
                return Err(VectisError::BackendUnavailable {
                    backend: self.backend.clone(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(None)) => {
                self.fail();
                return Err(VectisError::BackendUnavailable {
                    backend: self.backend.clone(),
                    reason: "exited before greeting".to_string(),
                });
            }
            Ok(Ok(Some(line))) => line,
        };

        if greeting != "ok" {
            self.fail();
            return Err(VectisError::protocol(&self.backend, "<greeting>", greeting));
        }

        let response = self.request("capabilities").await?;
        let payload = ok_payload(&response)
            .ok_or_else(|| VectisError::protocol(&self.backend, "capabilities", response.as_str()))?;
        self.capabilities = Capabilities::parse(payload);
        debug!(
            "{} capabilities: {:?}",
            self.backend,
            self.capabilities.iter().collect::<Vec<_>>()
        );

        if !self.capabilities.has("root-on-testbed") {
            return Err(VectisError::BackendUnavailable {
                backend: self.backend.clone(),
                reason: "does not have root-on-testbed capability".to_string(),
            });
        }
        if self.options.require_isolation && !self.capabilities.suitable_for_builds() {
            return Err(VectisError::BackendUnavailable {
                backend: self.backend.clone(),
                reason: "does not have sufficient isolation".to_string(),
            });
        }

        let response = self.request("open").await?;
        let scratch = ok_payload(&response)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VectisError::protocol(&self.backend, "open", response.as_str()))?;
        self.scratch = scratch.to_string();
        self.session_open = true;

        let response = self.request("print-execute-command").await?;
        let prefix = ok_payload(&response)
            .map(parse_execute_command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                VectisError::protocol(&self.backend, "print-execute-command", response.as_str())
            })?;
        self.exec_prefix = prefix;

        self.state.transition(WorkerState::Ready)?;
        info!("Worker {} ready, scratch directory {}", self.backend, self.scratch);
        Ok(())
    }

    /// Backend name, for messages
    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Guest scratch directory for this session
    pub fn scratch(&self) -> &str {
        &self.scratch
    }

    pub fn can_revert(&self) -> bool {
        self.capabilities.can_revert()
    }

    /// Unprivileged guest user
    pub fn user(&self) -> &str {
        self.capabilities.suggested_user().unwrap_or("user")
    }

    /// Send one request and read its response line
    async fn request(&mut self, line: &str) -> VectisResult<String> {
        debug!("{} <- {}", self.backend, line);

        let limit = self.options.request_timeout;
        let connection = &mut self.connection;
        let exchange = async move {
            connection.send(line).await?;
            connection.recv().await
        };

        let outcome = tokio::time::timeout(limit, exchange).await;
        match outcome {
            Err(_) => {
                self.fail();
                Err(VectisError::TimeoutError {
                    operation: format!("{}: {}", self.backend, line),
                    seconds: limit.as_secs(),
                })
            }
            Ok(Err(e)) => {
                self.fail();
                Err(e)
            }
            Ok(Ok(None)) => {
                self.fail();
                Err(VectisError::protocol(&self.backend, line, "connection closed"))
            }
            Ok(Ok(Some(response))) => {
                debug!("{} -> {}", self.backend, response);
                Ok(response)
            }
        }
    }

    fn fail(&mut self) {
        if self.state != WorkerState::Closed {
            self.state = WorkerState::Failed;
        }
    }

    fn ensure_ready(&self, operation: &str) -> VectisResult<()> {
        if self.state == WorkerState::Ready {
            Ok(())
        } else {
            Err(VectisError::InvalidState {
                state: self.state.to_string(),
                operation: operation.to_string(),
            })
        }
    }

    fn begin(&mut self, busy: WorkerState, operation: &str) -> VectisResult<()> {
        self.ensure_ready(operation)?;
        self.state.transition(busy)
    }

    fn end(&mut self) {
        if matches!(self.state, WorkerState::Executing | WorkerState::Reverting) {
            self.state = WorkerState::Ready;
        }
    }

    /// Run a command in the guest
    ///
    /// A nonzero exit status is not an error here; see [`Worker::check`].
    pub async fn execute(&mut self, command: &GuestCommand) -> VectisResult<ExecOutput> {
        self.begin(WorkerState::Executing, "execute")?;

        self.exec_count += 1;
        let stdout_path = self.host_scratch.join(format!("{:04}.stdout", self.exec_count));
        let stderr_path = self.host_scratch.join(format!("{:04}.stderr", self.exec_count));

        let mut argv = self.exec_prefix.clone();
        argv.extend(command.wrapped());

        info!("{}: {}", self.backend, command);
        let limit = command
            .timeout_override()
            .unwrap_or(self.options.command_timeout);

        let run = self
            .connection
            .run(&argv, command.stdin_path(), &stdout_path, &stderr_path);

        let outcome = tokio::time::timeout(limit, run).await;
        match outcome {
            Err(_) => {
                self.fail();
                Err(VectisError::TimeoutError {
                    operation: command.to_string(),
                    seconds: limit.as_secs(),
                })
            }
            Ok(Err(e)) => {
                self.fail();
                Err(e)
            }
            Ok(Ok(exit_code)) => {
                self.end();
                debug!("{} exited with status {}", command, exit_code);
                Ok(ExecOutput {
                    exit_code,
                    stdout_path,
                    stderr_path,
                })
            }
        }
    }

    /// Run a command, turning a nonzero exit into [`VectisError::BuildFailure`]
    pub async fn check(&mut self, command: &GuestCommand) -> VectisResult<ExecOutput> {
        let output = self.execute(command).await?;
        if output.success() {
            return Ok(output);
        }

        Err(VectisError::BuildFailure {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr_tail().await,
        })
    }

    /// Run a command and return its stdout
    pub async fn check_output(&mut self, command: &GuestCommand) -> VectisResult<String> {
        let output = self.check(command).await?;
        output.stdout().await
    }

    async fn guest_file_size(&mut self, path: &str) -> VectisResult<Option<u64>> {
        let output = self
            .execute(&GuestCommand::new(["stat", "-c", "%s", "--", path]))
            .await?;
        if !output.success() {
            return Ok(None);
        }

        let text = output.stdout().await?;
        text.trim()
            .parse()
            .map(Some)
            .map_err(|_| VectisError::Internal(format!("unexpected stat output for {}: {}", path, text)))
    }

    async fn guest_exists(&mut self, path: &str) -> VectisResult<bool> {
        let output = self.execute(&GuestCommand::new(["test", "-e", path])).await?;
        Ok(output.success())
    }

    /// Copy a host file or directory into the guest
    ///
    /// Regular files are checked for size on arrival.
    pub async fn copy_in(&mut self, host: &Path, guest: &str) -> VectisResult<()> {
        self.ensure_ready("copy in")?;

        let meta = fs::metadata(host).await.map_err(|e| {
            VectisError::transfer(host.display().to_string(), guest, format!("cannot read source: {}", e))
        })?;
        let suffix = if meta.is_dir() { "/" } else { "" };
        let guest = guest.trim_end_matches('/');

        info!("Copying host:{} to guest:{}", host.display(), guest);
        let line = format!(
            "copydown {}{} {}{}",
            quote_path(host),
            suffix,
            quote(guest),
            suffix
        );

        self.begin(WorkerState::Executing, "copy in")?;
        let response = self.request(&line).await?;
        self.end();

        if response != "ok" {
            return Err(VectisError::transfer(host.display().to_string(), guest, response));
        }

        if meta.is_file() {
            match self.guest_file_size(guest).await? {
                Some(len) if len == meta.len() => {}
                Some(len) => {
                    return Err(VectisError::transfer(
                        host.display().to_string(),
                        guest,
                        format!("size mismatch: {} bytes sent, {} arrived", meta.len(), len),
                    ))
                }
                None => {
                    return Err(VectisError::transfer(
                        host.display().to_string(),
                        guest,
                        "missing in guest after copy",
                    ))
                }
            }
        }

        Ok(())
    }

    /// Copy a guest file, or a directory given with a trailing `/`, to the host
    pub async fn copy_out(&mut self, guest: &str, host: &Path) -> VectisResult<()> {
        self.ensure_ready("copy out")?;

        let is_dir = guest.ends_with('/');
        let expected = if is_dir {
            if !self.guest_exists(guest.trim_end_matches('/')).await? {
                return Err(VectisError::transfer(guest, host.display().to_string(), "does not exist"));
            }
            None
        } else {
            let size = self.guest_file_size(guest).await?.ok_or_else(|| {
                VectisError::transfer(guest, host.display().to_string(), "does not exist")
            })?;
            Some(size)
        };

        info!("Copying guest:{} to host:{}", guest, host.display());
        let line = if is_dir {
            format!("copyup {}/ {}/", quote(guest.trim_end_matches('/')), quote_path(host))
        } else {
            format!("copyup {} {}", quote(guest), quote_path(host))
        };

        self.begin(WorkerState::Executing, "copy out")?;
        let response = self.request(&line).await?;
        self.end();

        if response != "ok" {
            return Err(VectisError::transfer(guest, host.display().to_string(), response));
        }

        if let Some(len) = expected {
            let actual = fs::metadata(host)
                .await
                .map_err(|e| {
                    VectisError::transfer(guest, host.display().to_string(), format!("missing on host: {}", e))
                })?
                .len();
            if actual != len {
                return Err(VectisError::transfer(
                    guest,
                    host.display().to_string(),
                    format!("size mismatch: {} bytes in guest, {} received", len, actual),
                ));
            }
        }

        Ok(())
    }

    /// Reset the guest to its state when the session was opened
    pub async fn revert(&mut self) -> VectisResult<()> {
        if !self.capabilities.can_revert() {
            return Err(VectisError::Unsupported {
                backend: self.backend.clone(),
                operation: "revert".to_string(),
            });
        }

        self.begin(WorkerState::Reverting, "revert")?;
        let response = self.request("revert").await?;

        match ok_payload(&response).filter(|s| !s.is_empty()) {
            Some(scratch) => {
                self.scratch = scratch.to_string();
                self.cached_copies.clear();
                self.end();
                info!("Reverted {}", self.backend);
                Ok(())
            }
            None => {
                self.fail();
                Err(VectisError::protocol(&self.backend, "revert", response.as_str()))
            }
        }
    }

    /// Copy a host file into a fresh guest directory and return its guest path
    ///
    /// With `cache`, a file already copied during this session (and not
    /// reverted away since) is reused.
    pub async fn make_file_available(&mut self, host: &Path, cache: bool) -> VectisResult<String> {
        if cache {
            if let Some(guest) = self.cached_copies.get(host) {
                info!("host:{} is already available at guest:{}", host.display(), guest);
                return Ok(guest.clone());
            }
        }

        let name = file_name(host)?;
        let dir = format!("{}/{}", self.scratch, Uuid::new_v4().simple());
        self.check(&GuestCommand::new(["mkdir", "-p", dir.as_str()]))
            .await?;

        let guest = format!("{}/{}", dir, name);
        self.copy_in(host, &guest).await?;

        if cache {
            self.cached_copies.insert(host.to_path_buf(), guest.clone());
        }
        Ok(guest)
    }

    /// Create a new world-readable directory under the scratch directory
    pub async fn new_directory(&mut self, prefix: &str) -> VectisResult<String> {
        let prefix = if prefix.is_empty() { "vectis-" } else { prefix };
        let tmpdir = format!("--tmpdir={}", self.scratch);
        let template = format!("{}XXXXXXXXXX", prefix);

        let out = self
            .check_output(&GuestCommand::new([
                "mktemp",
                "-d",
                tmpdir.as_str(),
                template.as_str(),
            ]))
            .await?;
        let dir = out.trim_end().to_string();
        if dir.is_empty() {
            return Err(VectisError::Internal("mktemp printed nothing".to_string()));
        }

        self.check(&GuestCommand::new(["chmod", "0755", dir.as_str()]))
            .await?;
        Ok(dir)
    }

    /// Copy a `.dsc` or `.changes` file and everything it lists into a new
    /// guest directory; returns the guest path of the control file
    pub async fn make_control_file_available(&mut self, control: &Path) -> VectisResult<String> {
        let listed = listed_files(control).await?;
        let dir = self.new_directory("").await?;

        let guest = format!("{}/{}", dir, file_name(control)?);
        self.copy_in(control, &guest).await?;

        let from = sibling_dir(control);
        for name in listed {
            self.copy_in(&from.join(&name), &format!("{}/{}", dir, name))
                .await?;
        }

        Ok(guest)
    }

    /// Point apt at the suite's mirrors and refresh package lists
    pub async fn set_up_apt(&mut self, suite: &Suite) -> VectisResult<()> {
        info!("Configuring apt in {} for {}", self.backend, suite.label());

        let sources = self.host_scratch.join("sources.list");
        fs::write(&sources, suite.sources_list())
            .await
            .map_err(|e| VectisError::io(format!("writing {}", sources.display()), e))?;

        self.copy_in(&sources, "/etc/apt/sources.list").await?;
        self.check(&apt_get(&["update"])).await?;
        Ok(())
    }

    /// Install packages with apt
    pub async fn install(&mut self, packages: &[&str]) -> VectisResult<()> {
        let mut args = vec!["install", "--no-install-recommends"];
        args.extend_from_slice(packages);
        self.check(&apt_get(&args)).await?;
        Ok(())
    }

    /// Write `contents` to a guest file
    pub async fn write_file(&mut self, guest: &str, contents: &str) -> VectisResult<()> {
        self.exec_count += 1;
        let local = self
            .host_scratch
            .join(format!("{:04}.upload", self.exec_count));
        fs::write(&local, contents)
            .await
            .map_err(|e| VectisError::io(format!("writing {}", local.display()), e))?;
        self.copy_in(&local, guest).await
    }

    /// End the session
    ///
    /// Sends `close` and `quit` where the session is still healthy, then
    /// waits for the server to exit. Consumes the worker, so a session is
    /// closed exactly once.
    pub async fn close(mut self) -> VectisResult<()> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> VectisResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        // An interrupted exchange leaves the channel out of step
        let healthy = matches!(self.state, WorkerState::Opening | WorkerState::Ready);
        let mut result = Ok(());

        if healthy {
            if let Err(e) = self.state.transition(WorkerState::Closing) {
                warn!("{}: {}", self.backend, e);
                self.state = WorkerState::Closing;
            }
            if self.session_open {
                match self.request("close").await {
                    Ok(response) if response == "ok" => {}
                    Ok(response) => result = Err(VectisError::protocol(&self.backend, "close", response)),
                    Err(e) => result = Err(e),
                }
            }
        } else {
            warn!("Closing {} worker {}", self.state, self.backend);
        }

        if let Err(e) = self.connection.send("quit").await {
            debug!("{}: quit not delivered: {}", self.backend, e);
        }
        if let Err(e) = self.connection.terminate(SHUTDOWN_GRACE).await {
            warn!("{} did not shut down cleanly: {}", self.backend, e);
            if result.is_ok() {
                result = Err(e);
            }
        }

        if let Err(e) = fs::remove_dir_all(&self.host_scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.host_scratch.display(), e);
            }
        }

        self.state = WorkerState::Closed;
        info!("Worker {} closed", self.backend);
        result
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Worker {} dropped without close, killing backend", self.backend);
            self.connection.kill();
            let _ = std::fs::remove_dir_all(&self.host_scratch);
        }
    }
}

/// Non-interactive apt-get invocation
pub fn apt_get(args: &[&str]) -> GuestCommand {
    let mut argv = vec!["apt-get", "-y"];
    argv.extend_from_slice(args);
    GuestCommand::new(argv).env("DEBIAN_FRONTEND", "noninteractive")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::testing::{ExecRule, FakeBackend, FAKE_SCRATCH};
    use tempfile::TempDir;

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            request_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
            require_isolation: true,
        }
    }

    async fn open(backend: &FakeBackend) -> Worker {
        Worker::open(backend, fast_options()).await.unwrap()
    }

    #[tokio::test]
    async fn open_handshake() {
        let backend = FakeBackend::new();
        let worker = open(&backend).await;

        assert_eq!(worker.state(), WorkerState::Ready);
        assert_eq!(worker.scratch(), FAKE_SCRATCH);
        assert!(worker.can_revert());
        assert_eq!(
            backend.state().requests,
            vec!["capabilities", "open", "print-execute-command"]
        );

        worker.close().await.unwrap();
        let state = backend.state();
        assert_eq!(state.count("close"), 1);
        assert_eq!(state.count("quit"), 1);
        assert_eq!(state.terminations, 1);
    }

    #[tokio::test]
    async fn bad_greeting_is_protocol_error() {
        let backend = FakeBackend::new();
        backend.state().greeting = "hello".to_string();

        let err = Worker::open(&backend, fast_options()).await.err().unwrap();
        assert!(matches!(err, VectisError::ProtocolError { .. }));
        assert_eq!(backend.state().terminations, 1);
    }

    #[tokio::test]
    async fn missing_capabilities_rejected() {
        let backend = FakeBackend::new();
        backend.state().capabilities = vec!["revert".to_string()];

        let err = Worker::open(&backend, fast_options()).await.err().unwrap();
        assert!(matches!(err, VectisError::BackendUnavailable { .. }));
        let state = backend.state();
        assert_eq!(state.count("open"), 0);
        assert_eq!(state.terminations, 1);
    }

    #[tokio::test]
    async fn crash_before_greeting_is_unavailable() {
        let backend = FakeBackend::new();
        backend.state().greeting.clear();

        let err = Worker::open(&backend, fast_options()).await.err().unwrap();
        assert!(matches!(err, VectisError::BackendUnavailable { .. }));
        assert!(err.is_fatal_to_session());
        assert!(backend.state().requests.is_empty());
    }

    #[tokio::test]
    async fn crash_mid_session_fails_it() {
        let backend = FakeBackend::new();
        backend.state().crash_on = Some("copyup".to_string());
        let mut worker = open(&backend).await;
        backend.state().files.insert("/tmp/x".to_string(), b"x".to_vec());

        let temp = TempDir::new().unwrap();
        let err = worker
            .copy_out("/tmp/x", &temp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, VectisError::ProtocolError { .. }));
        assert_eq!(worker.state(), WorkerState::Failed);

        worker.close().await.unwrap();
        assert_eq!(backend.state().terminations, 1);
    }

    #[tokio::test]
    async fn execute_captures_output() {
        let backend = FakeBackend::new().with_rule(
            ExecRule::new("dpkg --print-architecture")
                .stdout("amd64\n")
                .stderr("warning\n"),
        );
        let mut worker = open(&backend).await;

        let output = worker
            .execute(&GuestCommand::new(["dpkg", "--print-architecture"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout().await.unwrap(), "amd64\n");
        assert_eq!(output.stderr().await.unwrap(), "warning\n");
        assert_eq!(worker.state(), WorkerState::Ready);

        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error_until_checked() {
        let backend = FakeBackend::new().with_rule(ExecRule::new("false").exit(3).stderr("nope"));
        let mut worker = open(&backend).await;

        let output = worker.execute(&GuestCommand::new(["false"])).await.unwrap();
        assert_eq!(output.exit_code, 3);

        let err = worker.check(&GuestCommand::new(["false"])).await.unwrap_err();
        match err {
            VectisError::BuildFailure {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(worker.state(), WorkerState::Ready);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn command_timeout_fails_session() {
        let backend = FakeBackend::new().with_rule(ExecRule::new("sleep").hang());
        let mut worker = open(&backend).await;

        let err = worker
            .execute(&GuestCommand::new(["sleep", "infinity"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VectisError::TimeoutError { .. }));
        assert_eq!(worker.state(), WorkerState::Failed);

        let err = worker
            .execute(&GuestCommand::new(["true"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VectisError::InvalidState { .. }));

        worker.close().await.unwrap();
        let state = backend.state();
        // A failed session gets no close request, but is still shut down
        assert_eq!(state.count("close"), 0);
        assert_eq!(state.terminations, 1);
    }

    #[tokio::test]
    async fn request_timeout_fails_session() {
        let backend = FakeBackend::new();
        backend.state().hang_on = Some("revert".to_string());
        let mut worker = open(&backend).await;

        let err = worker.revert().await.unwrap_err();
        assert!(matches!(err, VectisError::TimeoutError { .. }));
        assert_eq!(worker.state(), WorkerState::Failed);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn copy_round_trip_preserves_bytes() {
        let temp = TempDir::new().unwrap();
        let backend = FakeBackend::new();
        let mut worker = open(&backend).await;

        let empty = temp.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        let spaced = temp.path().join("with space.bin");
        std::fs::write(&spaced, vec![7u8; 4096]).unwrap();
        let large = temp.path().join("large.img");
        let content: Vec<u8> = (0..8 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&large, &content).unwrap();

        for source in [&empty, &spaced, &large] {
            let guest = format!("{}/{}", FAKE_SCRATCH, source.file_name().unwrap().to_string_lossy());
            worker.copy_in(source, &guest).await.unwrap();

            let back = temp.path().join("back");
            worker.copy_out(&guest, &back).await.unwrap();
            assert_eq!(std::fs::read(&back).unwrap(), std::fs::read(source).unwrap());
        }

        assert!(backend
            .state()
            .requests
            .iter()
            .any(|r| r.contains("with%20space.bin")));
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn copy_in_directory_uses_trailing_slash() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/a"), b"a").unwrap();

        let backend = FakeBackend::new();
        let mut worker = open(&backend).await;
        worker
            .copy_in(&temp.path().join("src"), "/tmp/dest")
            .await
            .unwrap();

        let state = backend.state();
        assert!(state.requests.iter().any(|r| r.starts_with("copydown") && r.ends_with("/tmp/dest/")));
        assert_eq!(state.files.get("/tmp/dest/a").map(Vec::as_slice), Some(&b"a"[..]));
        drop(state);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn truncated_copy_detected() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("big");
        std::fs::write(&source, vec![1u8; 100]).unwrap();

        let backend = FakeBackend::new();
        backend.state().truncate_copydown = true;
        let mut worker = open(&backend).await;

        let err = worker.copy_in(&source, "/tmp/big").await.unwrap_err();
        assert!(matches!(err, VectisError::TransferError { .. }));
        assert!(err.to_string().contains("size mismatch"));
        // Transfer errors leave the session usable
        assert_eq!(worker.state(), WorkerState::Ready);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn copy_out_missing_file() {
        let temp = TempDir::new().unwrap();
        let backend = FakeBackend::new();
        let mut worker = open(&backend).await;

        let err = worker
            .copy_out("/nonexistent", &temp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, VectisError::TransferError { .. }));
        assert_eq!(backend.state().count("copyup"), 0);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn revert_restores_and_clears_cache() {
        let temp = TempDir::new().unwrap();
        let tarball = temp.path().join("sbuild.tar.gz");
        std::fs::write(&tarball, b"tarball").unwrap();

        let backend = FakeBackend::new();
        let mut worker = open(&backend).await;

        let first = worker.make_file_available(&tarball, true).await.unwrap();
        let again = worker.make_file_available(&tarball, true).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(backend.state().count("copydown"), 1);

        worker.revert().await.unwrap();
        assert!(!backend.state().files.contains_key(&first));

        let after = worker.make_file_available(&tarball, true).await.unwrap();
        assert_ne!(first, after);
        assert_eq!(backend.state().count("copydown"), 2);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn revert_unsupported() {
        let backend = FakeBackend::new().without_revert();
        let mut worker = open(&backend).await;

        let err = worker.revert().await.unwrap_err();
        assert!(matches!(err, VectisError::Unsupported { .. }));
        assert_eq!(backend.state().count("revert"), 0);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_revert_is_fatal() {
        let backend = FakeBackend::new();
        backend.state().revert_fails = true;
        let mut worker = open(&backend).await;

        let err = worker.revert().await.unwrap_err();
        assert!(matches!(err, VectisError::ProtocolError { .. }));
        assert_eq!(worker.state(), WorkerState::Failed);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn new_directory_under_scratch() {
        let backend = FakeBackend::new();
        let mut worker = open(&backend).await;

        let dir = worker.new_directory("").await.unwrap();
        assert!(dir.starts_with(FAKE_SCRATCH));
        assert!(backend.state().ran("chmod 0755"));
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn control_file_brings_listed_files() {
        let temp = TempDir::new().unwrap();
        let dsc = temp.path().join("hello_1.0.dsc");
        std::fs::write(&dsc, "Source: hello\nFiles:\n abc 5 hello_1.0.tar.gz\n").unwrap();
        std::fs::write(temp.path().join("hello_1.0.tar.gz"), b"12345").unwrap();

        let backend = FakeBackend::new();
        let mut worker = open(&backend).await;

        let guest = worker.make_control_file_available(&dsc).await.unwrap();
        assert!(guest.ends_with("/hello_1.0.dsc"));
        let dir = guest.trim_end_matches("/hello_1.0.dsc");
        assert!(backend
            .state()
            .files
            .contains_key(&format!("{}/hello_1.0.tar.gz", dir)));
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_worker_kills_backend() {
        let backend = FakeBackend::new();
        let worker = open(&backend).await;
        drop(worker);

        let state = backend.state();
        assert_eq!(state.kills, 1);
        assert_eq!(state.terminations, 0);
    }
}

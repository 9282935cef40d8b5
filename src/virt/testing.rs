//! Scripted in-memory virt server for tests
//!
//! Guest files live in a map, commands are matched against rules, and every
//! request is recorded so tests can assert on the exact protocol traffic.

use crate::error::{VectisError, VectisResult};
use crate::virt::backend::{BackendConnection, BackendFactory, BackendSelector, VirtualizationBackend};
use crate::virt::protocol::unquote;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const FAKE_SCRATCH: &str = "/tmp/fake-scratch";
const EXEC_PREFIX: &str = "fake-exec";

/// Canned outcome for commands containing `pattern`
#[derive(Debug, Clone, Default)]
pub struct ExecRule {
    pub pattern: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Guest files the command leaves behind
    pub creates: Vec<(String, Vec<u8>)>,
    /// Never finish
    pub hang: bool,
}

impl ExecRule {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            ..Self::default()
        }
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout = text.to_string();
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr = text.to_string();
        self
    }

    pub fn creates(mut self, path: &str, content: &[u8]) -> Self {
        self.creates.push((path.to_string(), content.to_vec()));
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[derive(Debug)]
pub struct FakeState {
    pub greeting: String,
    pub capabilities: Vec<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    snapshot: BTreeMap<String, Vec<u8>>,
    pub rules: Vec<ExecRule>,
    pub requests: Vec<String>,
    pub commands: Vec<Vec<String>>,
    pub launches: usize,
    pub terminations: usize,
    pub kills: usize,
    pub reject_copyup: usize,
    pub reject_copydown: usize,
    pub truncate_copydown: bool,
    pub revert_fails: bool,
    pub launch_fails: bool,
    /// Exit without answering once a request starts with this
    pub crash_on: Option<String>,
    /// Never answer a request starting with this
    pub hang_on: Option<String>,
    temp_dirs: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            greeting: "ok".to_string(),
            capabilities: vec![
                "revert".to_string(),
                "root-on-testbed".to_string(),
                "isolation-machine".to_string(),
            ],
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            snapshot: BTreeMap::new(),
            rules: Vec::new(),
            requests: Vec::new(),
            commands: Vec::new(),
            launches: 0,
            terminations: 0,
            kills: 0,
            reject_copyup: 0,
            reject_copydown: 0,
            truncate_copydown: false,
            revert_fails: false,
            launch_fails: false,
            crash_on: None,
            hang_on: None,
            temp_dirs: 0,
        }
    }
}

impl FakeState {
    /// Number of requests starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.requests.iter().filter(|r| r.starts_with(prefix)).count()
    }

    /// Whether any executed command contains `needle`
    pub fn ran(&self, needle: &str) -> bool {
        self.commands.iter().any(|c| c.join(" ").contains(needle))
    }

    /// Requests other than the handshake and shutdown
    pub fn worker_operations(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| {
                !matches!(
                    r.split_whitespace().next(),
                    Some("capabilities" | "open" | "print-execute-command" | "close" | "quit")
                )
            })
            .count()
            + self.commands.len()
    }
}

/// Scripted backend; clones share state
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_revert(self) -> Self {
        self.state().capabilities.retain(|c| c != "revert");
        self
    }

    pub fn with_rule(self, rule: ExecRule) -> Self {
        self.state().rules.push(rule);
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.state().files.insert(path.to_string(), content.to_vec());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl VirtualizationBackend for FakeBackend {
    fn name(&self) -> String {
        "fake".to_string()
    }

    fn argv(&self) -> Vec<String> {
        vec!["fake".to_string()]
    }

    async fn launch(&self) -> VectisResult<Box<dyn BackendConnection>> {
        let greeting = {
            let mut state = self.state();
            if state.launch_fails {
                return Err(VectisError::BackendUnavailable {
                    backend: "fake".to_string(),
                    reason: "launch refused".to_string(),
                });
            }
            state.launches += 1;
            state.greeting.clone()
        };

        // An empty greeting means the server dies before saying anything
        let alive = !greeting.is_empty();
        let pending = if alive {
            VecDeque::from([greeting])
        } else {
            VecDeque::new()
        };

        Ok(Box::new(FakeConnection {
            backend: self.clone(),
            pending,
            alive,
            hanging: false,
        }))
    }
}

/// Factory handing out one shared fake, remembering the selectors asked for
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub backend: FakeBackend,
    pub selectors: Arc<Mutex<Vec<BackendSelector>>>,
}

impl FakeFactory {
    pub fn new(backend: FakeBackend) -> Self {
        Self {
            backend,
            selectors: Arc::default(),
        }
    }

    pub fn selectors(&self) -> Vec<BackendSelector> {
        match self.selectors.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl BackendFactory for FakeFactory {
    fn create(&self, selector: &BackendSelector) -> VectisResult<Box<dyn VirtualizationBackend>> {
        if let Ok(mut selectors) = self.selectors.lock() {
            selectors.push(selector.clone());
        }
        Ok(Box::new(self.backend.clone()))
    }
}

struct FakeConnection {
    backend: FakeBackend,
    pending: VecDeque<String>,
    alive: bool,
    hanging: bool,
}

impl FakeConnection {
    fn respond(&mut self, line: &str) {
        let mut state = self.backend.state();
        state.requests.push(line.to_string());

        if state.crash_on.as_deref().is_some_and(|p| line.starts_with(p)) {
            self.alive = false;
            return;
        }
        if state.hang_on.as_deref().is_some_and(|p| line.starts_with(p)) {
            self.hanging = true;
            return;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let response = match words.as_slice() {
            ["capabilities"] => format!("ok {}", state.capabilities.join(" ")),
            ["open"] => {
                state.snapshot = state.files.clone();
                format!("ok {}", FAKE_SCRATCH)
            }
            ["print-execute-command"] => format!("ok {},--", EXEC_PREFIX),
            ["copydown", host, guest] => copydown(&mut state, &unquote(host), &unquote(guest)),
            ["copyup", guest, host] => copyup(&mut state, &unquote(guest), &unquote(host)),
            ["revert"] => {
                if state.revert_fails {
                    "error revert failed".to_string()
                } else {
                    state.files = state.snapshot.clone();
                    format!("ok {}", FAKE_SCRATCH)
                }
            }
            ["close"] => "ok".to_string(),
            ["quit"] => {
                self.alive = false;
                return;
            }
            _ => format!("error unknown command {}", line),
        };
        self.pending.push_back(response);
    }
}

fn copydown(state: &mut FakeState, host: &str, guest: &str) -> String {
    if state.reject_copydown > 0 {
        state.reject_copydown -= 1;
        return "error copydown rejected".to_string();
    }

    if let Some(dir) = host.strip_suffix('/') {
        let guest_dir = guest.trim_end_matches('/');
        let mut stack = vec![PathBuf::from(dir)];
        while let Some(current) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&current) else {
                return format!("error cannot read {}", current.display());
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let (Ok(rel), Ok(content)) =
                    (path.strip_prefix(dir), std::fs::read(&path))
                {
                    state
                        .files
                        .insert(format!("{}/{}", guest_dir, rel.display()), content);
                }
            }
        }
        state.dirs.insert(guest_dir.to_string());
        return "ok".to_string();
    }

    match std::fs::read(host) {
        Ok(mut content) => {
            if state.truncate_copydown {
                content.truncate(content.len() / 2);
            }
            state.files.insert(guest.to_string(), content);
            "ok".to_string()
        }
        Err(e) => format!("error {}", e),
    }
}

fn copyup(state: &mut FakeState, guest: &str, host: &str) -> String {
    if state.reject_copyup > 0 {
        state.reject_copyup -= 1;
        return "error copyup rejected".to_string();
    }

    if let Some(dir) = guest.strip_suffix('/') {
        let host_dir = Path::new(host.trim_end_matches('/'));
        let prefix = format!("{}/", dir);
        for (path, content) in state.files.iter() {
            if let Some(rel) = path.strip_prefix(&prefix) {
                let target = host_dir.join(rel);
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&target, content) {
                    return format!("error {}", e);
                }
            }
        }
        let _ = std::fs::create_dir_all(host_dir);
        return "ok".to_string();
    }

    match state.files.get(guest) {
        Some(content) => match std::fs::write(host, content) {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("error {}", e),
        },
        None => format!("error {} does not exist", guest),
    }
}

/// Strip the execute prefix, `sh -c 'cd ...'` wrapper and leading `env K=V`
fn guest_argv(argv: &[String]) -> Vec<String> {
    let mut rest: &[String] = argv;
    if rest.first().map(String::as_str) == Some(EXEC_PREFIX) {
        rest = &rest[1..];
    }
    if rest.first().map(String::as_str) == Some("--") {
        rest = &rest[1..];
    }
    if rest.len() >= 5 && rest[0] == "sh" && rest[1] == "-c" && rest[3] == "sh" {
        rest = &rest[5..];
    }
    if rest.first().map(String::as_str) == Some("env") {
        rest = &rest[1..];
        while rest.first().is_some_and(|w| w.contains('=') && !w.starts_with('-')) {
            rest = &rest[1..];
        }
    }
    rest.to_vec()
}

struct Outcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl Outcome {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

fn builtin(state: &mut FakeState, argv: &[String]) -> Outcome {
    let words: Vec<&str> = argv.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["stat", "-c", "%s", "--", path] | ["stat", "-c", "%s", path] => {
            match state.files.get(*path) {
                Some(content) => Outcome::ok(format!("{}\n", content.len())),
                None => Outcome::fail(format!("stat: cannot statx '{}': No such file or directory", path)),
            }
        }
        ["test", "-e", path] => {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let exists = state.files.contains_key(*path)
                || state.dirs.contains(*path)
                || state.files.keys().any(|f| f.starts_with(&prefix));
            if exists {
                Outcome::ok("")
            } else {
                Outcome::fail("")
            }
        }
        ["mktemp", "-d", ..] => {
            state.temp_dirs += 1;
            let dir = format!("{}/fake-dir-{}", FAKE_SCRATCH, state.temp_dirs);
            state.dirs.insert(dir.clone());
            Outcome::ok(format!("{}\n", dir))
        }
        ["ls", "-1A", dir] => {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let names: BTreeSet<&str> = state
                .files
                .keys()
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter_map(|rel| rel.split('/').next())
                .collect();
            let mut out = String::new();
            for name in names {
                out.push_str(name);
                out.push('\n');
            }
            Outcome::ok(out)
        }
        ["mkdir", .., path] | ["install", "-d", .., path] => {
            state.dirs.insert(path.trim_end_matches('/').to_string());
            Outcome::ok("")
        }
        _ => Outcome::ok(""),
    }
}

#[async_trait]
impl BackendConnection for FakeConnection {
    async fn send(&mut self, line: &str) -> VectisResult<()> {
        if !self.alive {
            return Err(VectisError::protocol("fake", line, "write failed: broken pipe"));
        }
        self.respond(line);
        Ok(())
    }

    async fn recv(&mut self) -> VectisResult<Option<String>> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }
        if self.hanging {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn run(
        &mut self,
        argv: &[String],
        _stdin: Option<&Path>,
        stdout: &Path,
        stderr: &Path,
    ) -> VectisResult<i32> {
        let command = guest_argv(argv);
        let joined = command.join(" ");

        let (outcome, hang) = {
            let mut state = self.backend.state();
            state.commands.push(command.clone());

            let rule = state
                .rules
                .iter()
                .rev()
                .find(|r| joined.contains(&r.pattern))
                .cloned();

            match rule {
                Some(rule) => {
                    for (path, content) in &rule.creates {
                        state.files.insert(path.clone(), content.clone());
                    }
                    (
                        Outcome {
                            exit_code: rule.exit_code,
                            stdout: rule.stdout,
                            stderr: rule.stderr,
                        },
                        rule.hang,
                    )
                }
                None => (builtin(&mut state, &command), false),
            }
        };

        if hang {
            std::future::pending::<()>().await;
        }

        std::fs::write(stdout, outcome.stdout)
            .map_err(|e| VectisError::io(format!("writing {}", stdout.display()), e))?;
        std::fs::write(stderr, outcome.stderr)
            .map_err(|e| VectisError::io(format!("writing {}", stderr.display()), e))?;
        Ok(outcome.exit_code)
    }

    async fn terminate(&mut self, _grace: Duration) -> VectisResult<()> {
        self.alive = false;
        self.backend.state().terminations += 1;
        Ok(())
    }

    fn kill(&mut self) {
        self.alive = false;
        self.backend.state().kills += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_command_wrappers() {
        let argv: Vec<String> = [
            "fake-exec", "--", "sh", "-c", "cd \"$1\" && shift && exec \"$@\"", "sh", "/w",
            "env", "A=1", "B=2", "apt-get", "-y", "update",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(guest_argv(&argv), vec!["apt-get", "-y", "update"]);
    }
}

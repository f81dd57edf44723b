//! Typed invocation of external command-line collaborators.
//!
//! Every tool kship drives (`kubectl`, `docker`, `ctr`, `ssh`, `scp`,
//! `sshpass`, `git`) is called through a [`CommandRunner`]. Arguments are
//! always passed as a vector, never through a shell, and credentials only
//! travel as [`Secret`] values in the environment or on stdin. The `Display`
//! form of an [`Invocation`] is what appears in logs and recovery hints, so it
//! never renders either.

use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{DeployError, Result};

/// Cap on captured output per stream, keeping the tail.
const MAX_OUTPUT: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A credential that must never be printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Plain(String),
    Secret(Secret),
}

impl EnvValue {
    fn expose(&self) -> &str {
        match self {
            EnvValue::Plain(v) => v,
            EnvValue::Secret(s) => s.expose(),
        }
    }
}

/// A single external command: program, argument vector, environment
/// overrides, optional secret stdin and optional timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, EnvValue)>,
    pub stdin: Option<Secret>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            cwd: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), EnvValue::Plain(value.into())));
        self
    }

    pub fn secret_env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.env.push((key.into(), EnvValue::Secret(value)));
        self
    }

    /// Feed `value` followed by a newline on the child's stdin.
    pub fn stdin_secret(mut self, value: Secret) -> Self {
        self.stdin = Some(value);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg...` with shell quoting, safe to paste into a terminal.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Quote `s` for a POSIX shell. Plain words are returned unchanged.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | ',' | '+')
        });
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short human-readable reason for a failure: stderr if present, else
    /// stdout, else the exit status.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match (text.is_empty(), self.exit_code) {
            (false, _) => text.lines().last().unwrap_or(text).to_string(),
            (true, Some(code)) => format!("exit code {code}"),
            (true, None) => "terminated by signal".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Executes an [`Invocation`]. A non-zero exit is not an error: callers
/// inspect [`CommandOutput`] and decide. `Err` means the process could not be
/// started at all.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::debug!(command = %invocation, "exec");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value.expose());
        }
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| DeployError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

        if let (Some(secret), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            // The child may exit without reading; a broken pipe is not our failure.
            let _ = stdin.write_all(secret.expose().as_bytes());
            let _ = stdin.write_all(b"\n");
        }

        let child_pid = child.id();

        // Dedicated reader threads avoid pipe-buffer deadlocks.
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || read_capped(stdout_handle));
        let stderr_thread = std::thread::spawn(move || read_capped(stderr_handle));

        let wait_result = match invocation.timeout {
            None => child.wait(),
            Some(limit) => {
                let (tx, rx) = std::sync::mpsc::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(child.wait());
                });
                match rx.recv_timeout(limit) {
                    Ok(result) => result,
                    Err(_) => {
                        // Reader threads finish on their own once the pipes
                        // close; grandchildren may keep them open, so they are
                        // not joined here.
                        kill_process(child_pid);
                        return Ok(CommandOutput {
                            exit_code: None,
                            timed_out: true,
                            ..Default::default()
                        });
                    }
                }
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();
        let status = wait_result?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            timed_out: false,
        })
    }
}

/// Drain `handle`, holding at most the last [`MAX_OUTPUT`] bytes at a time.
fn read_capped<R: Read>(handle: Option<R>) -> String {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(MAX_OUTPUT);
    if let Some(mut r) = handle {
        let mut chunk = [0u8; 8192];
        loop {
            let n = match r.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            tail.extend(&chunk[..n]);
            let excess = tail.len().saturating_sub(MAX_OUTPUT);
            tail.drain(..excess);
        }
    }
    String::from_utf8_lossy(tail.make_contiguous()).into_owned()
}

/// SIGKILL by PID. Best-effort.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

// ---------------------------------------------------------------------------
// Scripted runner for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    type Matcher = Box<dyn Fn(&Invocation) -> bool + Send + Sync>;

    struct Rule {
        matcher: Matcher,
        outputs: Mutex<VecDeque<CommandOutput>>,
    }

    /// Records every invocation and answers from a list of rules. The first
    /// matching rule wins; a rule with several outputs returns them in order
    /// and then keeps repeating the last. Unmatched invocations succeed with
    /// empty output.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        rules: Vec<Rule>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl FakeRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn on(self, needle: &str, output: CommandOutput) -> Self {
            self.on_seq(needle, vec![output])
        }

        pub(crate) fn on_seq(self, needle: &str, outputs: Vec<CommandOutput>) -> Self {
            let needle = needle.to_string();
            self.on_match(move |inv| inv.command_line().contains(&needle), outputs)
        }

        pub(crate) fn on_match(
            mut self,
            matcher: impl Fn(&Invocation) -> bool + Send + Sync + 'static,
            outputs: Vec<CommandOutput>,
        ) -> Self {
            self.rules.push(Rule {
                matcher: Box::new(matcher),
                outputs: Mutex::new(outputs.into()),
            });
            self
        }

        pub(crate) fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn lines(&self) -> Vec<String> {
            self.calls().iter().map(Invocation::command_line).collect()
        }

        pub(crate) fn count(&self, needle: &str) -> usize {
            self.lines().iter().filter(|l| l.contains(needle)).count()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            for rule in &self.rules {
                if (rule.matcher)(invocation) {
                    let mut outputs = rule.outputs.lock().unwrap();
                    let out = if outputs.len() > 1 {
                        outputs.pop_front().unwrap_or_default()
                    } else {
                        outputs.front().cloned().unwrap_or_default()
                    };
                    return Ok(out);
                }
            }
            Ok(ok(""))
        }
    }

    pub(crate) fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
        }
    }

    pub(crate) fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
            timed_out: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

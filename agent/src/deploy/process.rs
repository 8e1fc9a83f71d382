//! Typed external process execution
//!
//! Every call into the container runtime, version control, or a build tool
//! goes through [`ProcessRunner`]. Commands are an argument vector, never a
//! shell string, and always carry a timeout.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::AgentError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR_EXCERPT: usize = 400;

/// A command to execute
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
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

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg0 arg1 ...` for log lines, URL credentials masked
    pub fn display(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| mask_userinfo(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn mask_userinfo(arg: &str) -> String {
    let Some(scheme_end) = arg.find("://") else {
        return arg.to_string();
    };
    let rest = &arg[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}***{}", &arg[..scheme_end + 3], &rest[at..]),
        None => arg.to_string(),
    }
}

// Env values and stdin may hold credentials
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args.iter().map(|a| mask_userinfo(a)).collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("stdin", &self.stdin.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into a `ProcessError`
    pub fn into_result(self, context: &str) -> Result<ProcessOutput, AgentError> {
        if self.success() {
            return Ok(self);
        }
        Err(AgentError::ProcessError(format!(
            "{} exited with {}: {}",
            context,
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            self.stderr_excerpt()
        )))
    }

    /// Trimmed tail of stderr, bounded for error messages
    pub fn stderr_excerpt(&self) -> String {
        let trimmed = self.stderr.trim();
        let start = trimmed
            .char_indices()
            .rev()
            .nth(STDERR_EXCERPT)
            .map(|(i, _)| i)
            .unwrap_or(0);
        trimmed[start..].to_string()
    }
}

/// Executes external commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, AgentError>;
}

/// Runs commands as tokio child processes
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, AgentError> {
        debug!("Running: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            AgentError::ProcessError(format!("Failed to spawn {}: {}", spec.program, e))
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
        }

        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AgentError::TimeoutError(format!("{} after {:?}", spec.display(), spec.timeout))
            })??;

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Check that a binary can be executed
pub async fn tool_available(runner: &dyn ProcessRunner, program: &str, version_arg: &str) -> bool {
    let spec = CommandSpec::new(program)
        .arg(version_arg)
        .timeout(Duration::from_secs(10));
    matches!(runner.run(&spec).await, Ok(output) if output.success())
}

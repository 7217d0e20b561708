//! DUT process handling
//!
//! Starts the DUT binary with the flag pointing it at its controller
//! transport, exposes its piped standard streams, and terminates it
//! idempotently.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::transport::HciEndpoint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Standard {0} was not piped")]
    MissingPipe(&'static str),

    #[error("Process I/O error: {0}")]
    Io(String),
}

/// How to invoke the DUT: `<program> --bt-dev=<host>:<port> [extra args...]`.
#[derive(Debug, Clone)]
pub struct DutCommand {
    program: PathBuf,
    endpoint: HciEndpoint,
    extra_args: Vec<String>,
    env: Vec<(String, String)>,
}

impl DutCommand {
    pub fn new(program: impl AsRef<Path>, endpoint: HciEndpoint) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            endpoint,
            extra_args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The value passed to the DUT to locate its controller.
    pub fn bt_dev_flag(&self) -> String {
        format!("--bt-dev={}", self.endpoint)
    }

    /// Arguments after the program name, in order.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.bt_dev_flag()];
        argv.extend(self.extra_args.iter().cloned());
        argv
    }

    /// Start the DUT with stdin and stdout piped. The child is killed if its
    /// handle is dropped without being terminated.
    pub fn spawn(&self) -> Result<DutProcess, ProcessError> {
        let program = self.program.display().to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("input"))?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("output"))?;
        let pid = child.id();

        log::debug!("started {} (pid {:?}) {}", program, pid, self.bt_dev_flag());
        Ok(DutProcess {
            program: program.clone(),
            pid,
            child,
            stdin: StdinWriter {
                program,
                inner: Arc::new(Mutex::new(stdin)),
            },
            stdout: Some(stdout),
            exit_status: None,
        })
    }
}

/// Shared writer for the DUT's standard input.
#[derive(Clone)]
pub struct StdinWriter {
    program: String,
    inner: Arc<Mutex<ChildStdin>>,
}

impl StdinWriter {
    /// Write `line` (a trailing newline is added if missing) and flush.
    pub async fn write_line(&self, line: &str) -> Result<(), ProcessError> {
        let mut stdin = self.inner.lock().await;
        let io = |e: std::io::Error| ProcessError::Io(format!("{}: {}", self.program, e));
        stdin.write_all(line.as_bytes()).await.map_err(io)?;
        if !line.ends_with('\n') {
            stdin.write_all(b"\n").await.map_err(io)?;
        }
        stdin.flush().await.map_err(io)
    }
}

/// A running (or finished) DUT.
pub struct DutProcess {
    program: String,
    pid: Option<u32>,
    child: Child,
    stdin: StdinWriter,
    stdout: Option<ChildStdout>,
    exit_status: Option<ExitStatus>,
}

impl DutProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand over standard output, typically to a line monitor. Only the
    /// first call returns it.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn stdin(&self) -> StdinWriter {
        self.stdin.clone()
    }

    pub async fn write_line(&self, line: &str) -> Result<(), ProcessError> {
        self.stdin.write_line(line).await
    }

    /// Whether the process has exited, without waiting.
    pub fn has_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("Failed to poll {}: {}", self.program, e);
                false
            }
        }
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Io(e.to_string()))?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Kill the process and reap it. Terminating a process that already
    /// exited (or was already terminated) is a no-op.
    pub async fn terminate(&mut self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }
        if let Err(e) = self.child.start_kill() {
            // Lost a race with a natural exit.
            if self.has_exited() {
                return Ok(());
            }
            return Err(ProcessError::Io(format!("kill {}: {}", self.program, e)));
        }
        let status = self.wait().await?;
        log::debug!("terminated {} ({})", self.program, status);
        Ok(())
    }
}

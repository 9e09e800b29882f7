//! Spawning the node executable
//!
//! A [`ProcessLauncher`] runs one command, streams every output line to a
//! sink and resolves either when a trigger substring is seen (leaving the
//! process running) or when the process exits. Two launchers are provided:
//!
//! - [`StreamingLauncher`]: async pipes on the tokio runtime
//! - [`BlockingLauncher`]: `std::process` on a blocking worker thread, which
//!   on Windows also suppresses the console window
//!
//! [`ProcessRunner`] binds a launcher to one node directory.

use crate::error::{Result, TahoeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives each non-empty output line as it arrives
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// How a launched command resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutput {
    /// The process exited cleanly; combined stdout/stderr
    Completed(String),
    /// The trigger substring was seen; the process keeps running
    Triggered { pid: Option<u32> },
}

impl RunOutput {
    /// Captured output, empty for a triggered run
    pub fn into_output(self) -> String {
        match self {
            RunOutput::Completed(output) => output,
            RunOutput::Triggered { .. } => String::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            RunOutput::Triggered { pid } => *pid,
            RunOutput::Completed(_) => None,
        }
    }
}

/// A fully resolved command line
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub trigger: Option<String>,
}

impl LaunchRequest {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn matches_trigger(&self, line: &str) -> bool {
        self.trigger.as_deref().is_some_and(|t| line.contains(t))
    }
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest, on_line: LineSink) -> Result<RunOutput>;
}

/// Which launcher implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    Streaming,
    Blocking,
}

impl LauncherKind {
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            LauncherKind::Blocking
        } else {
            LauncherKind::Streaming
        }
    }

    pub fn build(self) -> Arc<dyn ProcessLauncher> {
        match self {
            LauncherKind::Streaming => Arc::new(StreamingLauncher),
            LauncherKind::Blocking => Arc::new(BlockingLauncher),
        }
    }
}

fn finish(success: bool, output: String) -> Result<RunOutput> {
    let output = output.trim().to_string();
    if success {
        Ok(RunOutput::Completed(output))
    } else {
        Err(TahoeError::Command(output))
    }
}

/// Async launcher built on `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingLauncher;

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>, on_line: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    // Keep draining after the receiver is gone so a still-running daemon
    // never blocks on a full pipe.
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            on_line(&line);
        }
        let _ = tx.send(line);
    }
}

#[async_trait]
impl ProcessLauncher for StreamingLauncher {
    async fn launch(&self, request: LaunchRequest, on_line: LineSink) -> Result<RunOutput> {
        let mut child = tokio::process::Command::new(&request.program)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone(), on_line.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone(), on_line.clone()));
        }
        drop(tx);

        let mut output = String::new();
        while let Some(line) = rx.recv().await {
            output.push_str(&line);
            output.push('\n');
            if request.matches_trigger(&line) {
                debug!(pid = ?pid, "Trigger matched; leaving process running");
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        warn!("Failed to reap child process: {}", e);
                    }
                });
                return Ok(RunOutput::Triggered { pid });
            }
        }

        let status = child.wait().await?;
        finish(status.success(), output)
    }
}

/// Launcher that blocks a worker thread for the lifetime of the command
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingLauncher;

fn forward_lines_blocking<R>(reader: R, tx: std::sync::mpsc::Sender<String>, on_line: LineSink)
where
    R: std::io::Read,
{
    use std::io::BufRead;
    for line in std::io::BufReader::new(reader).lines() {
        let Ok(line) = line else { break };
        if !line.is_empty() {
            on_line(&line);
        }
        let _ = tx.send(line);
    }
}

fn run_blocking(request: LaunchRequest, on_line: LineSink) -> Result<RunOutput> {
    let mut command = std::process::Command::new(&request.program);
    command
        .args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    let mut child = command.spawn()?;
    let pid = child.id();

    let (tx, rx) = std::sync::mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        let (tx, sink) = (tx.clone(), on_line.clone());
        std::thread::spawn(move || forward_lines_blocking(stdout, tx, sink));
    }
    if let Some(stderr) = child.stderr.take() {
        let (tx, sink) = (tx.clone(), on_line.clone());
        std::thread::spawn(move || forward_lines_blocking(stderr, tx, sink));
    }
    drop(tx);

    let mut output = String::new();
    for line in rx {
        output.push_str(&line);
        output.push('\n');
        if request.matches_trigger(&line) {
            std::thread::spawn(move || {
                let _ = child.wait();
            });
            return Ok(RunOutput::Triggered { pid: Some(pid) });
        }
    }

    let status = child.wait()?;
    finish(status.success(), output)
}

#[async_trait]
impl ProcessLauncher for BlockingLauncher {
    async fn launch(&self, request: LaunchRequest, on_line: LineSink) -> Result<RunOutput> {
        tokio::task::spawn_blocking(move || run_blocking(request, on_line))
            .await
            .map_err(|e| TahoeError::Command(format!("Launcher worker failed: {e}")))?
    }
}

/// Runs the node executable against one node directory
#[derive(Clone)]
pub struct ProcessRunner {
    nodedir: PathBuf,
    name: String,
    executable: Option<PathBuf>,
    launcher: Arc<dyn ProcessLauncher>,
    observer: Option<LineSink>,
}

impl ProcessRunner {
    pub fn new(
        nodedir: impl Into<PathBuf>,
        executable: Option<PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let nodedir = nodedir.into();
        let name = nodedir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            nodedir,
            name,
            executable,
            launcher,
            observer: None,
        }
    }

    /// Also forward every output line to `observer`
    pub fn with_observer(mut self, observer: LineSink) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn nodedir(&self) -> &Path {
        &self.nodedir
    }

    pub fn launcher(&self) -> Arc<dyn ProcessLauncher> {
        self.launcher.clone()
    }

    /// The configured executable, or the first `tahoe` on `PATH`
    pub fn executable(&self) -> Result<PathBuf> {
        match &self.executable {
            Some(exe) => Ok(exe.clone()),
            None => which::which("tahoe").map_err(|_| TahoeError::ExecutableNotFound),
        }
    }

    pub fn configured_executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    /// Run `tahoe -d <nodedir> <args..>`
    pub async fn run(&self, args: &[&str], trigger: Option<&str>) -> Result<RunOutput> {
        let program = self.executable()?;
        let mut full_args = vec!["-d".to_string(), self.nodedir.to_string_lossy().into_owned()];
        full_args.extend(args.iter().map(|a| a.to_string()));
        debug!("Executing: {} {}", program.display(), full_args.join(" "));

        let mut request = LaunchRequest::new(program, full_args).with_env("PYTHONUNBUFFERED", "1");
        if let Some(trigger) = trigger {
            request = request.with_trigger(trigger);
        }

        let name = self.name.clone();
        let observer = self.observer.clone();
        let sink: LineSink = Arc::new(move |line: &str| {
            debug!("[{}] >>> {}", name, line);
            if let Some(observer) = &observer {
                observer(line);
            }
        });

        self.launcher.launch(request, sink).await
    }

    /// Run to completion and return the captured output
    pub async fn command(&self, args: &[&str]) -> Result<String> {
        Ok(self.run(args, None).await?.into_output())
    }
}

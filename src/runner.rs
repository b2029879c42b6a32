//! Subprocess launch and collection.
//!
//! Every child started here shares the session log sink: stdout and stderr
//! are appended with line-granularity interleaving, and each launch is
//! preceded by a `Running: <argv>` record. Stdin is always closed so a child
//! can never block waiting for input.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Error;

/// Destination for child output and launch records.
///
/// Either the process's own standard output or a file truncated at session
/// start. Clones share one handle; the kernel serializes writes, so
/// interleaving from concurrent children stays at line granularity.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

enum SinkInner {
    Stdout,
    File { path: PathBuf, file: Mutex<File> },
}

impl LogSink {
    /// Log to the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            inner: Arc::new(SinkInner::Stdout),
        }
    }

    /// Truncate `path` and open it for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn file(path: &Path) -> Result<Self, Error> {
        // children share this file description, so their writes append
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            inner: Arc::new(SinkInner::File {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            }),
        })
    }

    /// Path of the sink when it is a real file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &*self.inner {
            SinkInner::Stdout => None,
            SinkInner::File { path, .. } => Some(path),
        }
    }

    /// Append one record, flushed immediately.
    pub fn write_line(&self, line: &str) {
        match &*self.inner {
            SinkInner::Stdout => println!("{line}"),
            SinkInner::File { file, .. } => {
                let mut file = file.lock().expect("log sink lock");
                if let Err(err) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                    warn!(%err, "failed to write session log");
                }
            }
        }
    }

    /// Stdio pair (stdout, stderr) wiring a child into the sink.
    fn child_stdio(&self) -> std::io::Result<(Stdio, Stdio)> {
        match &*self.inner {
            SinkInner::Stdout => Ok((Stdio::inherit(), Stdio::inherit())),
            SinkInner::File { file, .. } => {
                let file = file.lock().expect("log sink lock");
                let out = file.try_clone()?;
                let err = file.try_clone()?;
                Ok((Stdio::from(out), Stdio::from(err)))
            }
        }
    }
}

/// Handle over a launched OS process.
pub struct ChildProcess {
    name: String,
    child: tokio::process::Child,
}

impl ChildProcess {
    /// Human-readable role of this child (used in supervision messages).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, `None` once the child has been reaped.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// True while the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the child has finished, without blocking.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Ask the child to shut down (SIGTERM).
    pub fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(name = %self.name, %err, "SIGTERM delivery failed");
            }
        }
    }

    /// Forcibly kill the child (SIGKILL).
    pub fn force_kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(name = %self.name, %err, "SIGKILL delivery failed");
        }
    }

    /// Wait up to `timeout` for the child to exit.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }
}

/// Uniform launcher for external commands.
#[derive(Clone)]
pub struct CommandRunner {
    sink: LogSink,
}

impl CommandRunner {
    #[must_use]
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }

    /// The session log sink shared by all children.
    #[must_use]
    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    fn log_launch(&self, argv: &[&str]) {
        self.sink.write_line(&format!("Running: {}", argv.join(" ")));
    }

    fn command(&self, argv: &[&str]) -> Result<Command, Error> {
        let (out, err) = self.sink.child_stdio()?;
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            // a cancelled launch (signal during startup) must not orphan the child
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Run `argv` to completion; a non-zero exit is an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExternalCommandFailed`] on non-zero exit.
    pub async fn run(&self, argv: &[&str]) -> Result<(), Error> {
        self.log_launch(argv);
        let status = self.command(argv)?.status().await?;
        if !status.success() {
            return Err(Error::command_failed(argv, status, String::new()));
        }
        Ok(())
    }

    /// Run `argv` with `input` piped to its stdin.
    ///
    /// Used for manifests applied over stdin so nothing touches disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExternalCommandFailed`] on non-zero exit.
    pub async fn run_with_stdin(&self, argv: &[&str], input: &str) -> Result<(), Error> {
        self.log_launch(argv);
        let (out, err) = self.sink.child_stdio()?;
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(out)
            .stderr(err)
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::command_failed(argv, status, String::new()));
        }
        Ok(())
    }

    /// Blocking variant of [`run`](Self::run) for teardown paths, where no
    /// async runtime can be assumed to still be polling us.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExternalCommandFailed`] on non-zero exit.
    pub fn run_blocking(&self, argv: &[&str]) -> Result<(), Error> {
        self.log_launch(argv);
        let (out, err) = self.sink.child_stdio()?;
        let mut cmd = std::process::Command::new(argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err);
        let status = cmd.status()?;
        if !status.success() {
            return Err(Error::command_failed(argv, status, String::new()));
        }
        Ok(())
    }

    /// Run `argv` and return its trimmed stdout.
    ///
    /// Stderr is copied to the log sink and, on failure, into the error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExternalCommandFailed`] on non-zero exit.
    pub async fn capture(&self, argv: &[&str]) -> Result<String, Error> {
        self.log_launch(argv);
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = cmd.output().await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            self.sink.write_line(line);
        }

        if !output.status.success() {
            return Err(Error::command_failed(
                argv,
                output.status,
                stderr.into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Start a long-lived helper wired into the log sink.
    ///
    /// The child is never restarted; its death is the supervision signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    pub fn spawn(&self, name: &str, argv: &[&str]) -> Result<ChildProcess, Error> {
        self.log_launch(argv);
        let child = self.command(argv)?.spawn()?;
        debug!(name, pid = ?child.id(), "spawned helper");
        Ok(ChildProcess {
            name: name.to_string(),
            child,
        })
    }

    /// Start a child that inherits the terminal (the local shell).
    ///
    /// `envs` is layered on top of the inherited environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    pub fn spawn_interactive(
        &self,
        name: &str,
        argv: &[&str],
        envs: &[(String, String)],
    ) -> Result<ChildProcess, Error> {
        self.log_launch(argv);
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..])
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        debug!(name, pid = ?child.id(), "spawned interactive child");
        Ok(ChildProcess {
            name: name.to_string(),
            child,
        })
    }
}

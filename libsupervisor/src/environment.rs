//! The process execution environment the supervisor drives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, UpdateKind};
use tokio::process::Command;
use tracing::{debug, warn};

/// Everything needed to launch one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Overrides on top of the daemon's own environment.
    pub env: BTreeMap<String, String>,
    /// Append stdout and stderr of the worker to this file.
    pub log_path: Option<PathBuf>,
}

/// How a worker ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

pub struct SpawnedWorker {
    pub pid: u32,
    /// Resolves once the process has terminated.
    pub exited: BoxFuture<'static, ExitOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the worker to shut down (SIGTERM).
    Graceful,
    /// Kill it outright (SIGKILL).
    Forced,
}

#[async_trait]
pub trait ProcessEnvironment: Send + Sync + 'static {
    async fn spawn(&self, command: &LaunchCommand) -> std::io::Result<SpawnedWorker>;

    /// Deliver a stop signal to the worker and whatever it launched itself.
    fn signal(&self, pid: u32, signal: StopSignal) -> std::io::Result<()>;

    /// Kill whatever is left in the process group the worker led, once the
    /// worker itself has exited. An empty group is not an error.
    fn kill_group(&self, pid: u32) -> std::io::Result<()>;

    /// Kill every process whose command line contains `pattern`, returning the
    /// pids that were signalled.
    fn sweep(&self, pattern: &str) -> Vec<u32>;
}

/// Runs workers as real child processes of the daemon.
///
/// Each worker is placed in its own process group so a stop reaches the
/// capability servers it launched. Launchers that re-parent or create their
/// own groups escape this, which is why the supervisor also sweeps by
/// command line.
#[derive(Debug, Default, Clone)]
pub struct HostEnvironment;

impl HostEnvironment {
    pub fn new() -> Self {
        HostEnvironment
    }
}

#[async_trait]
impl ProcessEnvironment for HostEnvironment {
    async fn spawn(&self, launch: &LaunchCommand) -> std::io::Result<SpawnedWorker> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }

        match &launch.log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let log = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?
                    .into_std()
                    .await;
                cmd.stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned worker has no process id"))?;
        debug!(pid, program = %launch.program, "worker process spawned");

        let exited = async move {
            match child.wait().await {
                Ok(status) => ExitOutcome {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(pid, "failed to wait for worker: {e}");
                    ExitOutcome::default()
                }
            }
        }
        .boxed();
        Ok(SpawnedWorker { pid, exited })
    }

    fn signal(&self, pid: u32, stop: StopSignal) -> std::io::Result<()> {
        let sig = match stop {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forced => Signal::SIGKILL,
        };
        let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
        // the worker leads its own group; fall back to the single pid if the
        // group is already gone
        match signal::killpg(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => match signal::kill(Pid::from_raw(raw), sig) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn kill_group(&self, pid: u32) -> std::io::Result<()> {
        let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
        // no fallback to the single pid here: the leader is reaped and its
        // pid may already belong to someone else
        match signal::killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sweep(&self, pattern: &str) -> Vec<u32> {
        if pattern.is_empty() {
            return Vec::new();
        }
        let own = sysinfo::get_current_pid().ok();
        let mut system = sysinfo::System::new();
        // command lines are only read when asked for
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

        let mut killed = Vec::new();
        for (pid, process) in system.processes() {
            if Some(*pid) == own {
                continue;
            }
            let cmdline = process.cmd().join(" ");
            if !cmdline.contains(pattern) {
                continue;
            }
            if process.kill_with(sysinfo::Signal::Kill).unwrap_or(false) {
                killed.push(pid.as_u32());
            } else {
                warn!(pid = pid.as_u32(), "failed to kill leftover worker process");
            }
        }
        killed
    }
}

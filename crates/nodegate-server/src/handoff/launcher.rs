//! Worker process launch.
//!
//! The launcher builds the worker's arguments from the protocol template,
//! starts the worker with the accepted socket's descriptor inherited, and
//! waits for it to exit. It never reads or writes the socket: the worker
//! owns the session from the moment it starts. The launcher's own copy of
//! the descriptor stays open and untouched until the worker exits, then
//! it is closed.

use super::window::{
    minimize_when_ready, NoWindows, WindowControl, WINDOW_POLL_ATTEMPTS, WINDOW_POLL_INTERVAL,
};
use nodegate_core::{CommandLine, GateError, GateResult};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Starts workers for one protocol.
pub struct HandoffLauncher {
    command: CommandLine,
    working_dir: PathBuf,
    minimize: bool,
    windows: Arc<dyn WindowControl>,
}

impl HandoffLauncher {
    pub fn new(command: CommandLine, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            working_dir: working_dir.into(),
            minimize: false,
            windows: Arc::new(NoWindows),
        }
    }

    /// Minimise the worker's window after start.
    pub fn minimized(mut self, minimize: bool) -> Self {
        self.minimize = minimize;
        self
    }

    pub fn with_window_control(mut self, windows: Arc<dyn WindowControl>) -> Self {
        self.windows = windows;
        self
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Hand `socket` to a worker for `node` and wait for the worker to exit.
    ///
    /// The socket is switched to blocking mode, its descriptor number is
    /// substituted for `@H`, and close-on-exec is cleared for that
    /// descriptor in the child only.
    #[cfg(unix)]
    pub async fn handoff(&self, node: u32, socket: std::net::TcpStream) -> GateResult<ExitStatus> {
        use std::os::fd::AsRawFd;

        socket.set_nonblocking(false)?;
        let fd = socket.as_raw_fd();
        let args = self.command.build_args(node, i64::from(fd));
        debug!(node, fd, args = %args, "handing off socket");

        let mut cmd = self.build_command(&args);
        // SAFETY: the closure only calls fcntl(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || clear_cloexec(fd));
        }

        let result = self.spawn_and_wait(cmd, node).await;
        drop(socket);
        result
    }

    #[cfg(not(unix))]
    pub async fn handoff(&self, node: u32, socket: std::net::TcpStream) -> GateResult<ExitStatus> {
        drop(socket);
        Err(GateError::Unsupported(format!(
            "socket handoff for node {node} requires a Unix host"
        )))
    }

    /// Start a local (console) session for `node`; there is no socket.
    pub async fn launch_local(&self, node: u32) -> GateResult<ExitStatus> {
        let args = self.command.build_local_args(node);
        debug!(node, args = %args, "launching local node");
        let cmd = self.build_command(&args);
        self.spawn_and_wait(cmd, node).await
    }

    fn build_command(&self, args: &str) -> Command {
        let mut cmd = Command::new(self.command.executable());
        cmd.args(CommandLine::split_args(args));
        if !self.working_dir.as_os_str().is_empty() {
            cmd.current_dir(&self.working_dir);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn spawn_and_wait(&self, mut cmd: Command, node: u32) -> GateResult<ExitStatus> {
        let mut child = cmd.spawn().map_err(|e| {
            GateError::Launch(format!("cannot start {}: {e}", self.command.executable()))
        })?;

        let pid = child.id();
        info!(node, pid = ?pid, "worker started");

        if self.minimize {
            if let Some(pid) = pid {
                minimize_when_ready(
                    self.windows.as_ref(),
                    pid,
                    WINDOW_POLL_ATTEMPTS,
                    WINDOW_POLL_INTERVAL,
                )
                .await;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| GateError::Launch(format!("wait for worker failed: {e}")))?;
        info!(node, code = ?status.code(), "worker exited");
        Ok(status)
    }
}

#[cfg(unix)]
fn clear_cloexec(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

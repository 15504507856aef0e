//! Daemon spawn strategies used by client auto-start.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::BoxFuture;

/// Starts a daemon process listening on a given socket.
///
/// `spawn` returns once the process has been launched; the caller polls the
/// socket to find out when it is ready.
pub trait DaemonSpawner: Send + Sync {
    fn spawn<'a>(&'a self, socket_path: &'a Path) -> BoxFuture<'a, io::Result<()>>;

    /// Whether this strategy can start a daemon at all.
    fn enabled(&self) -> bool {
        true
    }

    /// Strategy name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Re-executes a `stagebox` binary as `daemon run --socket <path>`.
///
/// The child gets its own process group and null stdio, so it outlives the
/// invoking command and never writes to its terminal.
#[derive(Debug, Clone, Default)]
pub struct ExecSpawner {
    program: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl ExecSpawner {
    /// Spawn the currently running executable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `program` instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Pass `--config <path>` through to the daemon.
    pub fn with_config(mut self, config_path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(config_path.into());
        self
    }

    fn command(&self, socket_path: &Path) -> io::Result<Command> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        let mut cmd = Command::new(program);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.args(["daemon", "run", "--socket"])
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        Ok(cmd)
    }
}

impl DaemonSpawner for ExecSpawner {
    fn spawn<'a>(&'a self, socket_path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let child = self.command(socket_path)?.spawn()?;
            debug!(pid = child.id(), socket = %socket_path.display(), "spawned daemon");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "exec"
    }
}

/// Never starts a daemon. Clients fail fast instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSpawner;

impl DaemonSpawner for DisabledSpawner {
    fn spawn<'a>(&'a self, _socket_path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "daemon auto-start is disabled",
            ))
        })
    }

    fn enabled(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exec_command_line() {
        let spawner = ExecSpawner::new()
            .with_program("/usr/local/bin/stagebox")
            .with_config("/etc/stagebox.toml");
        let cmd = spawner.command(Path::new("/run/user/1/stagebox/daemon.sock")).unwrap();

        assert_eq!(cmd.get_program(), "/usr/local/bin/stagebox");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "--config",
                "/etc/stagebox.toml",
                "daemon",
                "run",
                "--socket",
                "/run/user/1/stagebox/daemon.sock"
            ]
        );
    }

    #[test]
    fn test_exec_defaults_to_current_exe() {
        let cmd = ExecSpawner::new().command(Path::new("/tmp/x.sock")).unwrap();
        assert_eq!(cmd.get_program(), std::env::current_exe().unwrap().as_os_str());
    }

    #[tokio::test]
    async fn test_disabled_spawner_fails() {
        let spawner = DisabledSpawner;
        assert!(!spawner.enabled());
        let err = spawner.spawn(Path::new("/tmp/x.sock")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}

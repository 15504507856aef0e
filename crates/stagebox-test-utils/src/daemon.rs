//! Daemon test helpers.
//!
//! [`TestDaemon`] runs a real daemon as a task in the test process, bound to
//! a socket inside an owned temp directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stagebox_config::DaemonConfig;
use stagebox_core::ipc::{DisabledSpawner, PeerVerifier};
use stagebox_core::{
    Daemon, DaemonError, DaemonHandle, IpcClient, SecureStateStore, ShutdownReason, StagingStore,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::config::TestConfigBuilder;
use crate::spawn::InProcessSpawner;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(10);

/// A running in-process daemon on a temp socket.
///
/// The temp directory is deleted automatically when this value is dropped,
/// and the daemon is asked to shut down, guaranteeing cleanup even on panic.
pub struct TestDaemon {
    socket_path: PathBuf,
    handle: DaemonHandle,
    store: Arc<SecureStateStore>,
    task: Option<JoinHandle<Result<ShutdownReason, DaemonError>>>,
    _temp_dir: TempDir,
}

impl TestDaemon {
    /// Start a daemon with the test defaults.
    pub async fn start() -> Self {
        Self::with_config(TestConfigBuilder::new().build_daemon()).await
    }

    /// Start a daemon with the given `[daemon]` section. Its socket path is
    /// ignored in favour of the temp directory.
    pub async fn with_config(config: DaemonConfig) -> Self {
        Self::launch(config, None).await
    }

    /// Start a daemon that checks peers with `verifier`.
    pub async fn with_verifier(verifier: Box<dyn PeerVerifier>) -> Self {
        Self::launch(TestConfigBuilder::new().build_daemon(), Some(verifier)).await
    }

    async fn launch(config: DaemonConfig, verifier: Option<Box<dyn PeerVerifier>>) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let socket_path = temp_dir.path().join("daemon.sock");

        let mut daemon = Daemon::new(config, &socket_path).with_signal_handling(false);
        if let Some(verifier) = verifier {
            daemon = daemon.with_verifier(verifier);
        }
        let handle = daemon.handle();
        let store = Arc::clone(daemon.store());
        let task = tokio::spawn(daemon.run());

        let test_daemon = Self {
            socket_path,
            handle,
            store,
            task: Some(task),
            _temp_dir: temp_dir,
        };
        test_daemon.wait_until_listening().await;
        test_daemon
    }

    // Peer-rejecting daemons never answer a ping, so wait for the socket
    // file instead.
    async fn wait_until_listening(&self) {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        while !self.socket_path.exists() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "test daemon did not bind {}",
                self.socket_path.display()
            );
            tokio::time::sleep(READY_POLL).await;
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// The daemon's state store, for asserting on state without going
    /// through the socket.
    pub fn state_store(&self) -> &SecureStateStore {
        &self.store
    }

    /// A client that never spawns a daemon.
    pub fn client(&self) -> IpcClient {
        IpcClient::new(&self.socket_path).with_spawner(DisabledSpawner)
    }

    /// A client that respawns an in-process daemon when this one is gone.
    pub fn auto_start_client(&self, spawner: InProcessSpawner) -> IpcClient {
        IpcClient::new(&self.socket_path).with_spawner(spawner)
    }

    /// A staging façade for one scope over a non-spawning client.
    pub fn staging(&self, account_id: &str, region: &str) -> StagingStore {
        StagingStore::new(Arc::new(self.client()), account_id, region)
    }

    /// Wait for the daemon to exit on its own. `None` on timeout.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<ShutdownReason> {
        let task = self.task.as_mut()?;
        let joined = tokio::time::timeout(timeout, task).await.ok()?;
        self.task = None;
        joined
            .expect("daemon task panicked")
            .ok()
    }

    /// Whether the daemon task has finished.
    pub fn has_exited(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Shut the daemon down and wait for it.
    pub async fn stop(mut self) -> Option<ShutdownReason> {
        self.handle.shutdown();
        self.wait_for_exit(READY_TIMEOUT).await
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

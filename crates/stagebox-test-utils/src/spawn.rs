//! An auto-start strategy that runs the daemon as a task in the test process.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stagebox_config::DaemonConfig;
use stagebox_core::ipc::DaemonSpawner;
use stagebox_core::{BoxFuture, Daemon, DaemonHandle};

use crate::config::TestConfigBuilder;

/// Spawns daemons with `tokio::spawn` instead of a child process.
///
/// Clones share their spawn counter and handles, so a test can hand one
/// clone to an [`IpcClient`](stagebox_core::IpcClient) and inspect another.
#[derive(Clone)]
pub struct InProcessSpawner {
    config: DaemonConfig,
    spawns: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<DaemonHandle>>>,
}

impl InProcessSpawner {
    pub fn new() -> Self {
        Self::with_config(TestConfigBuilder::new().build_daemon())
    }

    pub fn with_config(config: DaemonConfig) -> Self {
        Self {
            config,
            spawns: Arc::new(AtomicUsize::new(0)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// How many daemons this spawner (and its clones) started.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Ask every daemon started so far to shut down.
    pub fn shutdown_all(&self) {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.iter() {
            handle.shutdown();
        }
    }
}

impl Default for InProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonSpawner for InProcessSpawner {
    fn spawn<'a>(&'a self, socket_path: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let daemon = Daemon::new(self.config.clone(), socket_path).with_signal_handling(false);
            self.handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(daemon.handle());
            self.spawns.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                if let Err(e) = daemon.run().await {
                    tracing::warn!(error = %e, "in-process daemon failed");
                }
            });
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

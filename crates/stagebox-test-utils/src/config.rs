//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. Unlike
//! [`AppConfig::default`], the builder starts with memory locking off so
//! test processes never `mlockall`.

use std::path::Path;

use stagebox_config::{AppConfig, DaemonConfig};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .socket_path(dir.path().join("daemon.sock"))
///     .auto_shutdown(false)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.daemon.lock_memory = false;
        Self { config }
    }

    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.daemon.socket_path = Some(path.as_ref().display().to_string());
        self
    }

    pub fn timeouts_ms(mut self, read: u64, write: u64) -> Self {
        self.config.daemon.read_timeout_ms = read;
        self.config.daemon.write_timeout_ms = write;
        self
    }

    pub fn auto_shutdown(mut self, enabled: bool) -> Self {
        self.config.daemon.auto_shutdown = enabled;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }

    /// Just the `[daemon]` section.
    pub fn build_daemon(self) -> DaemonConfig {
        self.config.daemon
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

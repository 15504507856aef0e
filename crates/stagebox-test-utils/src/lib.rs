#![deny(unsafe_code)]

//! Shared test utilities for the stagebox workspace.
//!
//! Provides an in-process daemon harness, an in-process spawn strategy for
//! exercising client auto-start, config builders, and tracing helpers so
//! that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! stagebox-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod spawn;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::TestDaemon;
pub use spawn::InProcessSpawner;

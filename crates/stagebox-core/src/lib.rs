#![deny(unsafe_code)]

//! stagebox core: the staging daemon and its clients.
//!
//! Staged configuration and secret changes live only in the memory of a
//! per-user background daemon. CLI invocations talk to it over a Unix socket
//! through [`IpcClient`], usually via the scope-bound [`StagingStore`]
//! façade. The daemon starts on demand and exits once nothing is staged.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, the return type for async trait
/// methods that need dynamic dispatch (`dyn Trait`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Daemon lifecycle: startup, signal handling, auto-shutdown.
pub mod daemon;
/// Method dispatch onto the state store.
pub mod handler;
/// Unix socket transport, peer checks, and the client with auto-start.
pub mod ipc;
/// Wire envelope, staged state model, and socket address resolution.
pub mod protocol;
/// Zero-on-destroy buffers.
pub mod secrets;
/// Process hardening (core dumps, ptrace, swap).
pub mod security;
/// Application-facing staging API for one scope.
pub mod staging;
/// In-memory staged state, one secure buffer per scope.
pub mod store;

pub use daemon::{Daemon, DaemonError, DaemonHandle, ShutdownReason};
pub use handler::RequestHandler;
pub use ipc::{IpcClient, IpcClientError, TransportServer};
pub use secrets::SecureBuffer;
pub use staging::{StagingError, StagingStore};
pub use store::{SecureStateStore, StoreError};

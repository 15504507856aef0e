//! Daemon IPC: Unix domain socket transport between the CLI and the daemon.
//!
//! The daemon exposes a single HTTP/JSON endpoint over a Unix socket. Every
//! command connects, sends one request envelope, reads one response
//! envelope, and disconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐         Unix socket        ┌──────────────────┐
//! │   CLI    │───────────────────────────▶│ TransportServer  │
//! │ IpcClient│  HTTP/1.1 + JSON           │  (hyper http1)   │
//! └────┬─────┘  POST /v1/rpc              └────────┬─────────┘
//!      │                                           │
//!      │ spawns on demand                  ┌───────▼────────┐
//!      └──────────────────────────────────▶│ RequestHandler │
//!                                          │ SecureStateStore│
//!                                          └────────────────┘
//! ```

pub mod client;
pub mod peer;
pub mod server;
pub mod spawn;

pub use client::{IpcClient, IpcClientError};
pub use peer::{NoopVerifier, PeerError, PeerVerifier, SameUserVerifier, platform_verifier};
pub use server::{PostResponseHook, RPC_PATH, RequestHandlerFn, TransportError, TransportServer};
pub use spawn::{DaemonSpawner, DisabledSpawner, ExecSpawner};

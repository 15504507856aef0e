//! Core daemon process: startup, shutdown, and auto-shutdown.
//!
//! The daemon owns one [`SecureStateStore`], one [`RequestHandler`] and one
//! [`TransportServer`]. Every shutdown trigger (the `Shutdown` method, an OS
//! signal, auto-shutdown, or [`DaemonHandle::shutdown`]) goes through the
//! same [`DaemonHandle`], so there is exactly one shutdown path.
//!
//! Auto-shutdown: after a successful `Unstage*` call, or a read, finds the
//! store empty everywhere, the daemon schedules its own shutdown. Its
//! resident lifetime is therefore bounded by "while there is staged work".
//! Once it commits to going down it refuses new staged state with
//! `shutting_down`, which clients retry against a fresh daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stagebox_config::DaemonConfig;

use crate::handler::{Admission, RequestHandler};
use crate::ipc::peer::PeerVerifier;
use crate::ipc::server::{TransportError, TransportServer};
use crate::protocol::{Method, Request, Response};
use crate::security::harden_process;
use crate::store::SecureStateStore;

/// Why the daemon is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `Shutdown` method or [`DaemonHandle::shutdown`].
    Requested,
    /// SIGINT or SIGTERM.
    Signal,
    /// The last staged change was unstaged.
    Idle,
}

/// Cloneable trigger for the daemon's single shutdown path.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl DaemonHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.trigger(ShutdownReason::Requested);
    }

    /// The pending shutdown reason, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    fn trigger(&self, reason: ShutdownReason) {
        // An explicit request or signal outranks a pending idle shutdown.
        self.tx.send_if_modified(|current| match current {
            None => {
                *current = Some(reason);
                true
            }
            Some(ShutdownReason::Idle) if reason != ShutdownReason::Idle => {
                *current = Some(reason);
                true
            }
            Some(_) => false,
        });
    }

    /// Withdraw a pending idle shutdown.
    fn cancel_idle(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == Some(ShutdownReason::Idle) {
                *current = None;
                true
            } else {
                false
            }
        })
    }

    async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::Requested;
            }
        }
    }
}

/// The stagebox staging daemon.
pub struct Daemon {
    config: DaemonConfig,
    socket_path: PathBuf,
    store: Arc<SecureStateStore>,
    handle: DaemonHandle,
    verifier: Option<Box<dyn PeerVerifier>>,
    handle_signals: bool,
}

impl Daemon {
    /// Create a daemon serving `socket_path` with the given configuration.
    pub fn new(config: DaemonConfig, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            socket_path: socket_path.into(),
            store: Arc::new(SecureStateStore::new()),
            handle: DaemonHandle::new(),
            verifier: None,
            handle_signals: true,
        }
    }

    /// Replace the platform peer verifier.
    pub fn with_verifier(mut self, verifier: Box<dyn PeerVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Whether SIGINT/SIGTERM trigger shutdown (on by default).
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &Arc<SecureStateStore> {
        &self.store
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Request a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Bind the socket and serve until shutdown.
    ///
    /// Fails only when the socket cannot be bound; a graceful stop returns
    /// `Ok`. The store is wiped before this returns.
    pub async fn run(mut self) -> Result<ShutdownReason, DaemonError> {
        let report = harden_process(self.config.lock_memory);
        info!(
            core_dumps_disabled = report.core_dumps_disabled,
            non_dumpable = report.non_dumpable,
            memory_locked = report.memory_locked,
            "process hardened"
        );

        let handler = RequestHandler::new(Arc::clone(&self.store));
        let admission = handler.admission().clone();
        let mut server = TransportServer::new(&self.socket_path, move |req: &Request| {
            handler.handle(req)
        })
        .with_timeouts(self.config.read_timeout(), self.config.write_timeout())
        .with_hook(post_response_hook(
            Arc::clone(&self.store),
            self.handle.clone(),
            self.config.auto_shutdown,
        ));
        if let Some(verifier) = self.verifier.take() {
            server = server.with_verifier(verifier);
        }

        // Handlers go in before the socket exists, so a signal sent as soon
        // as the daemon is reachable is never fatal.
        let signals = self.handle_signals.then(|| spawn_signal_listener(self.handle.clone()));
        if let Err(e) = server.start().await {
            if let Some(signals) = signals {
                signals.abort();
            }
            self.store.destroy();
            return Err(e.into());
        }
        info!(
            path = %self.socket_path.display(),
            pid = std::process::id(),
            version = %crate::build_info::version_string(),
            "stagebox daemon started"
        );

        let server = Arc::new(server);
        let watcher = tokio::spawn(watch_shutdown(
            self.handle.clone(),
            Arc::clone(&self.store),
            admission,
            Arc::clone(&server),
        ));

        let served = server.serve().await;

        if let Some(signals) = signals {
            signals.abort();
        }
        watcher.abort();
        self.store.destroy();

        let reason = self.handle.reason().unwrap_or(ShutdownReason::Requested);
        info!(?reason, "stagebox daemon stopped");
        served?;
        Ok(reason)
    }
}

/// Trigger shutdown after `Shutdown`, and after an unstage or a read that
/// found the store empty.
///
/// Reads count so that a daemon auto-started by `stage list` on an empty
/// store does not stay resident. `IsEmpty` and `Ping` do not: status checks
/// must not stop the daemon they inspect.
fn post_response_hook(
    store: Arc<SecureStateStore>,
    handle: DaemonHandle,
    auto_shutdown: bool,
) -> impl Fn(&Request, &Response) + Send + Sync + 'static {
    move |req: &Request, resp: &Response| {
        if !resp.success {
            return;
        }
        if req.method == Method::Shutdown {
            info!("shutdown requested by client");
            handle.trigger(ShutdownReason::Requested);
        } else if auto_shutdown && (req.method.is_unstage() || req.method.is_read()) {
            match store.is_empty() {
                Ok(true) => {
                    debug!(method = ?req.method, "store is empty; scheduling shutdown");
                    handle.trigger(ShutdownReason::Idle);
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "could not check store emptiness"),
            }
        }
    }
}

/// Wait for a trigger, then shut the transport down.
///
/// An idle trigger closes admission and then re-checks the store. A stage
/// that landed before the re-check keeps the daemon up; one that arrives
/// after it is refused with `shutting_down` and never acknowledged.
async fn watch_shutdown(
    handle: DaemonHandle,
    store: Arc<SecureStateStore>,
    admission: Admission,
    server: Arc<TransportServer>,
) {
    loop {
        let reason = handle.wait().await;
        if reason == ShutdownReason::Idle {
            tokio::task::yield_now().await;
            admission.close();
            if !store.is_empty().unwrap_or(true) && handle.cancel_idle() {
                admission.reopen();
                debug!("staged state reappeared; staying up");
                continue;
            }
        }
        info!(?reason, "shutting down");
        server.shutdown().await;
        return;
    }
}

/// Install SIGTERM and SIGINT handlers now and trigger shutdown on either.
fn spawn_signal_listener(handle: DaemonHandle) -> JoinHandle<()> {
    let mut term = install(SignalKind::terminate(), "SIGTERM");
    let mut interrupt = install(SignalKind::interrupt(), "SIGINT");
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = recv(&mut term) => "SIGTERM",
            _ = recv(&mut interrupt) => "SIGINT",
        };
        warn!(signal = name, "signal received, initiating graceful shutdown");
        handle.trigger(ShutdownReason::Signal);
    })
}

fn install(kind: SignalKind, name: &'static str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(signal = name, error = %e, "failed to install signal handler");
            None
        }
    }
}

async fn recv(stream: &mut Option<Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(#[from] TransportError),
}

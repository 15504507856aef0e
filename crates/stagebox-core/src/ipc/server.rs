//! Transport server: HTTP/1.1 over a Unix domain socket.
//!
//! Each accepted connection carries exactly one `POST /v1/rpc` exchange and
//! is then closed. Connections are served by short-lived workers tracked in
//! a `JoinSet`, so shutdown can wait for every in-flight exchange.
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept ──▶ peer check ──▶ read request ──▶ handler ──▶ write response ──▶ close
//!            (403 on        └── read deadline ──┘        └─ write deadline ─┘
//!             mismatch)                                              │
//!                                                                    ▼
//!                                                           post-response hook
//! ```
//!
//! The read deadline is absolute from accept. Once the handler has produced
//! a response, the deadline is re-armed to `now + write_timeout`. A worker
//! whose deadline fires simply drops the connection.

use std::convert::Infallible;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method as HttpMethod, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::peer::{PeerError, PeerVerifier, log_rejection, platform_verifier};
use crate::protocol::address::{prepare_socket_dir, restrict_socket};
use crate::protocol::{
    ErrorCode, MAX_MESSAGE_BYTES, Request, Response, decode_request, encode_response,
};

/// The single RPC endpoint.
pub const RPC_PATH: &str = "/v1/rpc";

/// Default per-connection read deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-connection write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `start` waits for an existing socket to answer before treating
/// it as stale.
const LIVENESS_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Produces one response per decoded request.
pub type RequestHandlerFn = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Observes each completed (request, response) exchange.
pub type PostResponseHook = Arc<dyn Fn(&Request, &Response) + Send + Sync>;

/// Errors from starting or running the transport server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("another daemon is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("{0} exists and is not a socket; refusing to replace it")]
    NotASocket(PathBuf),

    #[error("failed to prepare socket directory for {path}: {source}")]
    SocketDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("transport server was not started")]
    NotStarted,
}

/// Everything a connection worker needs, shared across workers.
struct Shared {
    handler: RequestHandlerFn,
    hook: Option<PostResponseHook>,
    verifier: Arc<dyn PeerVerifier>,
    read_timeout: Duration,
    write_timeout: Duration,
}

/// Unix socket server dispatching one request per connection.
pub struct TransportServer {
    socket_path: PathBuf,
    handler: RequestHandlerFn,
    hook: Option<PostResponseHook>,
    verifier: Arc<dyn PeerVerifier>,
    read_timeout: Duration,
    write_timeout: Duration,
    listener: Mutex<Option<UnixListener>>,
    shutdown_tx: watch::Sender<bool>,
    /// `true` whenever no accept loop is running.
    stopped_tx: watch::Sender<bool>,
}

impl TransportServer {
    /// A server for `socket_path` answering requests with `handler`.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(true);
        Self {
            socket_path: socket_path.into(),
            handler: Arc::new(handler),
            hook: None,
            verifier: Arc::from(platform_verifier()),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            listener: Mutex::new(None),
            shutdown_tx,
            stopped_tx,
        }
    }

    /// Override the per-connection read and write deadlines.
    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Replace the platform peer verifier.
    pub fn with_verifier(mut self, verifier: Box<dyn PeerVerifier>) -> Self {
        self.verifier = Arc::from(verifier);
        self
    }

    /// Install a hook that runs after every completed exchange.
    pub fn with_hook(
        mut self,
        hook: impl Fn(&Request, &Response) + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and return once it is listening.
    ///
    /// Creates the parent directory with mode 0700, replaces a stale socket
    /// file left by a dead daemon, and restricts the new socket to mode 0600.
    pub async fn start(&self) -> Result<(), TransportError> {
        let path = &self.socket_path;
        prepare_socket_dir(path).map_err(|source| TransportError::SocketDir {
            path: path.clone(),
            source,
        })?;
        self.clear_stale_socket().await?;

        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        restrict_socket(path).map_err(bind_err)?;

        info!(
            path = %path.display(),
            verifier = self.verifier.name(),
            "transport listening"
        );
        *lock(&self.listener) = Some(listener);
        Ok(())
    }

    async fn clear_stale_socket(&self) -> Result<(), TransportError> {
        let path = &self.socket_path;
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source,
                });
            }
        };
        if !meta.file_type().is_socket() {
            return Err(TransportError::NotASocket(path.clone()));
        }

        let answered = tokio::time::timeout(LIVENESS_CHECK_TIMEOUT, UnixStream::connect(path)).await;
        if let Ok(Ok(_)) = answered {
            return Err(TransportError::AlreadyRunning(path.clone()));
        }

        debug!(path = %path.display(), "removing stale socket");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TransportError::Bind {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Returns after the listener is closed, the socket file is removed and
    /// every in-flight worker has finished.
    pub async fn serve(&self) -> Result<(), TransportError> {
        if *self.shutdown_tx.borrow() {
            return Ok(());
        }
        let listener = lock(&self.listener)
            .take()
            .ok_or(TransportError::NotStarted)?;
        self.stopped_tx.send_replace(false);

        let shared = Arc::new(Shared {
            handler: Arc::clone(&self.handler),
            hook: self.hook.clone(),
            verifier: Arc::clone(&self.verifier),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        });
        let mut workers = JoinSet::new();
        let mut shutdown = pin!(wait_for_flag(self.shutdown_tx.subscribe()));

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        workers.spawn(serve_connection(Arc::clone(&shared), stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    reap(joined);
                }
            }
        }

        drop(listener);
        remove_socket(&self.socket_path);
        debug!(in_flight = workers.len(), "waiting for connection workers");
        while let Some(joined) = workers.join_next().await {
            reap(joined);
        }

        info!(path = %self.socket_path.display(), "transport stopped");
        self.stopped_tx.send_replace(true);
        Ok(())
    }

    /// Stop accepting and wait for the accept loop and its workers to finish.
    ///
    /// Idempotent. Must not be awaited from inside a connection worker: the
    /// worker would wait for itself.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        // Started but never served.
        if lock(&self.listener).take().is_some() {
            remove_socket(&self.socket_path);
        }

        wait_for_flag(self.stopped_tx.subscribe()).await;
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove socket");
    }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        warn!("connection worker panicked");
    }
}

/// Resolve once the flag in `rx` is `true` (or its sender is gone).
async fn wait_for_flag(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Per-connection state shared between the service and the worker.
struct Exchange {
    shared: Arc<Shared>,
    rejected: Option<PeerError>,
    deadline: watch::Sender<Instant>,
    completed: Mutex<Option<(Request, Response)>>,
}

async fn serve_connection(shared: Arc<Shared>, stream: UnixStream) {
    let rejected = match shared.verifier.verify(&stream) {
        Ok(()) => None,
        Err(e) => {
            log_rejection(shared.verifier.as_ref(), &e);
            Some(e)
        }
    };

    let (deadline_tx, mut deadline_rx) = watch::channel(Instant::now() + shared.read_timeout);
    let exchange = Arc::new(Exchange {
        shared: Arc::clone(&shared),
        rejected,
        deadline: deadline_tx,
        completed: Mutex::new(None),
    });

    let service = {
        let exchange = Arc::clone(&exchange);
        service_fn(move |req| {
            let exchange = Arc::clone(&exchange);
            async move { Ok::<_, Infallible>(exchange.respond(req).await) }
        })
    };
    let conn = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service);
    let mut conn = pin!(conn);

    let sleep = tokio::time::sleep_until(*deadline_rx.borrow_and_update());
    let mut sleep = pin!(sleep);
    loop {
        // A re-armed deadline must be seen before the stale one fires.
        tokio::select! {
            biased;
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(error = %e, "connection ended with error");
                }
                break;
            }
            Ok(()) = deadline_rx.changed() => {
                sleep.as_mut().reset(*deadline_rx.borrow_and_update());
            }
            _ = sleep.as_mut() => {
                debug!("connection deadline exceeded; closing");
                break;
            }
        }
    }

    let completed = lock(&exchange.completed).take();
    if let (Some(hook), Some((req, resp))) = (&shared.hook, completed) {
        hook(&req, &resp);
    }
}

impl Exchange {
    async fn respond(&self, req: hyper::Request<Incoming>) -> hyper::Response<Full<Bytes>> {
        if let Some(e) = &self.rejected {
            return reply(
                StatusCode::FORBIDDEN,
                &Response::err(ErrorCode::PeerRejected, e.to_string()),
            );
        }
        if req.uri().path() != RPC_PATH {
            return reply(
                StatusCode::NOT_FOUND,
                &Response::err(
                    ErrorCode::InvalidRequest,
                    format!("unknown path {}", req.uri().path()),
                ),
            );
        }
        if req.method() != HttpMethod::POST {
            return reply(
                StatusCode::METHOD_NOT_ALLOWED,
                &Response::err(ErrorCode::InvalidRequest, "expected POST"),
            );
        }

        let body = match Limited::new(req.into_body(), MAX_MESSAGE_BYTES)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let status = if e.is::<http_body_util::LengthLimitError>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                return reply(
                    status,
                    &Response::err(ErrorCode::InvalidRequest, format!("failed to read body: {e}")),
                );
            }
        };

        let request = match decode_request(&body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "rejecting malformed request");
                return reply(
                    StatusCode::BAD_REQUEST,
                    &Response::err(ErrorCode::InvalidRequest, e.to_string()),
                );
            }
        };

        let response = (self.shared.handler)(&request);
        self.deadline
            .send_replace(Instant::now() + self.shared.write_timeout);
        trace!(method = ?request.method, success = response.success, "request handled");

        let http = reply(StatusCode::OK, &response);
        *lock(&self.completed) = Some((request, response));
        http
    }
}

fn reply(status: StatusCode, resp: &Response) -> hyper::Response<Full<Bytes>> {
    let body = encode_response(resp)
        .or_else(|e| encode_response(&Response::err(ErrorCode::Internal, e.to_string())))
        .unwrap_or_default();

    let mut http = hyper::Response::new(Full::new(Bytes::from(body)));
    *http.status_mut() = status;
    http.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    http
}

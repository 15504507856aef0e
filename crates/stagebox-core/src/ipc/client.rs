//! IPC client: one HTTP exchange over the daemon socket per request.
//!
//! Request-issuing calls go through [`IpcClient::ensure_daemon`] first, which
//! pings the daemon and, when nothing is listening, starts one through the
//! configured [`DaemonSpawner`] and polls until it answers. The pure
//! introspection calls ([`ping`](IpcClient::ping),
//! [`is_empty`](IpcClient::is_empty),
//! [`shutdown_daemon`](IpcClient::shutdown_daemon)) never spawn.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method as HttpMethod, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use stagebox_config::{AppConfig, ClientConfig, ENV_AUTO_START};

use super::server::RPC_PATH;
use super::spawn::{DaemonSpawner, DisabledSpawner, ExecSpawner};
use crate::protocol::{
    ErrorCode, MAX_MESSAGE_BYTES, Method, PingInfo, ProtocolError, Request, Response,
    decode_response, default_socket_path, encode_request,
};

/// Upper bound for the startup poll interval.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error(
        "staging daemon is not running at {path} and auto-start is disabled; \
         start it with `stagebox daemon run` or unset {env}",
        path = .0.display(),
        env = ENV_AUTO_START
    )]
    AutoStartDisabled(PathBuf),

    #[error("failed to start staging daemon: {0}")]
    Spawn(#[source] io::Error),

    #[error("staging daemon did not become ready at {} within {waited:?}", .path.display())]
    DaemonUnavailable { path: PathBuf, waited: Duration },

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build HTTP request: {0}")]
    BuildRequest(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("daemon answered with HTTP {0} and an unreadable body")]
    Status(StatusCode),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("unexpected response payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("daemon response carried no payload")]
    EmptyPayload,

    #[error("daemon error: {message}")]
    Daemon {
        code: Option<ErrorCode>,
        message: String,
    },
}

impl IpcClientError {
    /// True for connect failures that mean "no daemon is listening".
    pub fn is_daemon_absent(&self) -> bool {
        match self {
            IpcClientError::Connect { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// True when the request was not applied and resending it to a fresh
    /// daemon is safe: no daemon listening, a daemon refusing new state on
    /// its way down, or a connection closed before any response arrived.
    pub fn is_retryable(&self) -> bool {
        match self {
            IpcClientError::Http(e) => closed_before_response(e),
            IpcClientError::Daemon {
                code: Some(ErrorCode::ShuttingDown),
                ..
            } => true,
            other => other.is_daemon_absent(),
        }
    }

    /// Failures worth polling through while a daemon starts up.
    fn is_transient(&self) -> bool {
        self.is_daemon_absent() || matches!(self, IpcClientError::Timeout { .. })
    }

    /// The wire error code, when the daemon itself reported the failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            IpcClientError::Daemon { code, .. } => *code,
            _ => None,
        }
    }
}

/// Client for the staging daemon.
///
/// Requests from one client are serialized; they are never pipelined.
pub struct IpcClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    request_timeout: Duration,
    startup_timeout: Duration,
    poll_interval: Duration,
    spawner: Arc<dyn DaemonSpawner>,
    lock: Mutex<()>,
}

impl IpcClient {
    /// A client for `socket_path` with default timeouts that auto-starts the
    /// daemon by re-executing the current binary.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::with_client_config(socket_path, &ClientConfig::default())
    }

    /// A client configured from the `[client]` and `[daemon]` sections.
    pub fn from_config(config: &AppConfig) -> Self {
        let socket_path = config
            .daemon
            .socket_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_socket_path);
        Self::with_client_config(socket_path, &config.client)
    }

    fn with_client_config(socket_path: impl Into<PathBuf>, client: &ClientConfig) -> Self {
        let spawner: Arc<dyn DaemonSpawner> = if client.auto_start {
            Arc::new(ExecSpawner::new())
        } else {
            Arc::new(DisabledSpawner)
        };
        Self {
            socket_path: socket_path.into(),
            connect_timeout: client.connect_timeout(),
            request_timeout: client.request_timeout(),
            startup_timeout: client.startup_timeout(),
            poll_interval: client.poll_interval(),
            spawner,
            lock: Mutex::new(()),
        }
    }

    /// Replace the spawn strategy.
    pub fn with_spawner(mut self, spawner: impl DaemonSpawner + 'static) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    /// Override how long [`ensure_daemon`](Self::ensure_daemon) waits for a
    /// freshly spawned daemon.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Ping the daemon without spawning one.
    pub async fn ping(&self) -> Result<PingInfo, IpcClientError> {
        let resp = self.round_trip(&Request::new(Method::Ping)).await?;
        into_data(resp)
    }

    /// Whether a daemon answers on the socket.
    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Whether the daemon holds no staged state anywhere.
    ///
    /// A missing daemon holds nothing, so this reports `true` without
    /// spawning one.
    pub async fn is_empty(&self) -> Result<bool, IpcClientError> {
        let _guard = self.lock.lock().await;
        match self.round_trip(&Request::new(Method::IsEmpty)).await {
            Ok(resp) => into_data(resp),
            Err(e) if e.is_daemon_absent() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Ask a running daemon to exit. Returns `false` when none was running.
    pub async fn shutdown_daemon(&self) -> Result<bool, IpcClientError> {
        let _guard = self.lock.lock().await;
        match self.round_trip(&Request::new(Method::Shutdown)).await {
            Ok(resp) => {
                check(resp)?;
                Ok(true)
            }
            Err(e) if e.is_daemon_absent() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Make sure a daemon answers on the socket, starting one if needed.
    pub async fn ensure_daemon(&self) -> Result<(), IpcClientError> {
        match self.ping().await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_daemon_absent() => {
                debug!(path = %self.socket_path.display(), error = %e, "no daemon answering");
            }
            Err(e) => return Err(e),
        }

        if !self.spawner.enabled() {
            return Err(IpcClientError::AutoStartDisabled(self.socket_path.clone()));
        }

        info!(
            path = %self.socket_path.display(),
            spawner = self.spawner.name(),
            "starting staging daemon"
        );
        self.spawner
            .spawn(&self.socket_path)
            .await
            .map_err(IpcClientError::Spawn)?;
        self.wait_until_ready().await
    }

    async fn wait_until_ready(&self) -> Result<(), IpcClientError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        let mut interval = self.poll_interval;
        loop {
            match self.ping().await {
                Ok(info) => {
                    debug!(pid = info.pid, version = %info.version, "daemon ready");
                    return Ok(());
                }
                Err(e) if e.is_transient() => debug!(error = %e, "daemon not ready yet"),
                // A daemon that answers but refuses us will not change its
                // mind before the deadline.
                Err(e) => return Err(e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(IpcClientError::DaemonUnavailable {
                    path: self.socket_path.clone(),
                    waited: self.startup_timeout,
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Wait for a daemon that is going down to stop answering.
    async fn wait_until_gone(&self) -> Result<(), IpcClientError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            match self.ping().await {
                Err(e) if e.is_daemon_absent() => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => {
                    return Err(IpcClientError::Timeout {
                        phase: "daemon shutdown",
                        after: self.startup_timeout,
                    });
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Send one request, starting the daemon first if needed.
    ///
    /// A daemon that exits between the readiness check and the request (for
    /// example through auto-shutdown) is restarted once. The same holds for
    /// a daemon that answers `shutting_down` or drops the connection before
    /// responding. In every case the request was not applied, so resending
    /// is safe.
    pub async fn send_request(&self, req: &Request) -> Result<Response, IpcClientError> {
        let _guard = self.lock.lock().await;
        self.ensure_daemon().await?;
        match self.round_trip(req).await {
            Ok(resp) if resp.code == Some(ErrorCode::ShuttingDown) => {
                warn!("daemon is shutting down; retrying once against a fresh daemon");
                self.wait_until_gone().await?;
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "daemon went away before the request; retrying once");
            }
            other => return other,
        }
        self.ensure_daemon().await?;
        self.round_trip(req).await
    }

    /// Send a request and require a successful response.
    pub async fn call(&self, req: &Request) -> Result<Response, IpcClientError> {
        check(self.send_request(req).await?)
    }

    /// Send a request and decode its payload.
    pub async fn call_for<T: DeserializeOwned>(&self, req: &Request) -> Result<T, IpcClientError> {
        into_data(self.send_request(req).await?)
    }

    /// Send a request and decode its payload, which may be `null`.
    pub async fn call_for_optional<T: DeserializeOwned>(
        &self,
        req: &Request,
    ) -> Result<Option<T>, IpcClientError> {
        check(self.send_request(req).await?)?
            .decode_data()
            .map_err(IpcClientError::Payload)
    }

    async fn round_trip(&self, req: &Request) -> Result<Response, IpcClientError> {
        let body = encode_request(req)?;
        let (status, bytes) = post(
            &self.socket_path,
            HttpMethod::POST,
            RPC_PATH,
            body,
            self.connect_timeout,
            self.request_timeout,
        )
        .await?;

        match decode_response(&bytes) {
            Ok(resp) => Ok(resp),
            Err(_) if !status.is_success() => Err(IpcClientError::Status(status)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Turn an unsuccessful response into [`IpcClientError::Daemon`].
pub(crate) fn check(resp: Response) -> Result<Response, IpcClientError> {
    if resp.success {
        Ok(resp)
    } else {
        Err(IpcClientError::Daemon {
            code: resp.code,
            message: resp.error_message().to_string(),
        })
    }
}

/// Check a response and decode its required payload.
pub(crate) fn into_data<T: DeserializeOwned>(resp: Response) -> Result<T, IpcClientError> {
    check(resp)?
        .decode_data()
        .map_err(IpcClientError::Payload)?
        .ok_or(IpcClientError::EmptyPayload)
}

/// Whether the daemon hung up before any response arrived: it was drained
/// from the listen backlog, or its worker died.
fn closed_before_response(e: &hyper::Error) -> bool {
    if e.is_incomplete_message() || e.is_canceled() || e.is_closed() {
        return true;
    }
    std::error::Error::source(e)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|io| {
            matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            )
        })
}

/// One HTTP exchange on a fresh connection to `socket_path`.
pub(crate) async fn post(
    socket_path: &Path,
    method: HttpMethod,
    uri: &str,
    body: Vec<u8>,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<(StatusCode, Bytes), IpcClientError> {
    let stream = match tokio::time::timeout(connect_timeout, UnixStream::connect(socket_path)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(IpcClientError::Connect {
                path: socket_path.to_path_buf(),
                source,
            });
        }
        Err(_) => {
            return Err(IpcClientError::Timeout {
                phase: "connect",
                after: connect_timeout,
            });
        }
    };

    tokio::time::timeout(request_timeout, exchange(stream, method, uri, body))
        .await
        .map_err(|_| IpcClientError::Timeout {
            phase: "request",
            after: request_timeout,
        })?
}

async fn exchange(
    stream: UnixStream,
    method: HttpMethod,
    uri: &str,
    body: Vec<u8>,
) -> Result<(StatusCode, Bytes), IpcClientError> {
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream)).await?;

    // Drive the connection in the background
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "IPC connection error");
        }
    });

    let req = hyper::Request::builder()
        .method(method)
        .uri(uri)
        .header(HOST, "localhost")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| IpcClientError::BuildRequest(e.to_string()))?;

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let bytes = Limited::new(resp.into_body(), MAX_MESSAGE_BYTES)
        .collect()
        .await
        .map_err(|e| IpcClientError::Body(e.to_string()))?
        .to_bytes();

    Ok((status, bytes))
}

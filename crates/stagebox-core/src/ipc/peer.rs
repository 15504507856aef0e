//! Peer credential checks on accepted connections.
//!
//! Socket file permissions already keep other users out, but the daemon
//! verifies the connecting process's uid as well, so a misconfigured
//! directory mode does not become a cross-user leak.

use tokio::net::UnixStream;
use tracing::warn;

/// Why a connection was refused.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("failed to read peer credentials: {0}")]
    Credentials(#[from] std::io::Error),

    #[error("peer uid {peer} does not match daemon uid {expected}")]
    UidMismatch { peer: u32, expected: u32 },
}

/// Decides whether the process on the other end of a connection may talk to
/// the daemon.
pub trait PeerVerifier: Send + Sync {
    fn verify(&self, stream: &UnixStream) -> Result<(), PeerError>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Accept only peers running as the daemon's own effective uid.
#[derive(Debug, Clone, Copy)]
pub struct SameUserVerifier {
    uid: u32,
}

impl SameUserVerifier {
    pub fn new() -> Self {
        Self {
            uid: crate::protocol::address::current_uid(),
        }
    }

    /// Expect a specific uid instead of our own.
    pub fn with_uid(uid: u32) -> Self {
        Self { uid }
    }
}

impl Default for SameUserVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerVerifier for SameUserVerifier {
    fn verify(&self, stream: &UnixStream) -> Result<(), PeerError> {
        let cred = stream.peer_cred()?;
        let peer = cred.uid();
        if peer != self.uid {
            return Err(PeerError::UidMismatch {
                peer,
                expected: self.uid,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "same-uid"
    }
}

/// Accepts every peer. Used where peer credentials are unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

impl PeerVerifier for NoopVerifier {
    fn verify(&self, _stream: &UnixStream) -> Result<(), PeerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// The strongest verifier this platform supports.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub fn platform_verifier() -> Box<dyn PeerVerifier> {
    Box::new(SameUserVerifier::new())
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub fn platform_verifier() -> Box<dyn PeerVerifier> {
    warn!("peer credentials unavailable on this platform; relying on socket permissions only");
    Box::new(NoopVerifier)
}

/// Log a refused peer before the server drops its stream.
pub(crate) fn log_rejection(verifier: &dyn PeerVerifier, err: &PeerError) {
    warn!(verifier = verifier.name(), error = %err, "rejected connection");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_user_accepts_self() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(SameUserVerifier::new().verify(&a).is_ok());
    }

    #[tokio::test]
    async fn test_uid_mismatch_is_rejected() {
        let (a, _b) = UnixStream::pair().unwrap();
        let other = crate::protocol::address::current_uid().wrapping_add(1);
        let err = SameUserVerifier::with_uid(other).verify(&a).unwrap_err();
        assert!(matches!(err, PeerError::UidMismatch { expected, .. } if expected == other));
    }

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(NoopVerifier.verify(&a).is_ok());
        assert_eq!(NoopVerifier.name(), "noop");
    }

    #[test]
    fn test_platform_verifier_is_strict_here() {
        assert_eq!(platform_verifier().name(), "same-uid");
    }
}

//! Daemon socket address resolution.
//!
//! The socket lives in a per-user directory so that users sharing a host
//! never collide, and so that a directory planted by someone else is
//! detected instead of trusted:
//!
//! 1. `$XDG_RUNTIME_DIR/stagebox/daemon.sock` when the runtime dir is set
//! 2. on macOS, `$TMPDIR/stagebox/daemon.sock` (`TMPDIR` is per-user there)
//! 3. `/tmp/stagebox-<uid>/daemon.sock`
//!
//! Resolution is pure: the same environment and uid always produce the same
//! path. Callers go through [`default_socket_path`] or
//! [`resolve_socket_path`] rather than building paths themselves.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Directory name created under the per-user base directory.
pub const SOCKET_DIR_NAME: &str = "stagebox";

/// Socket file name inside the socket directory.
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

/// `sun_path` is 104 bytes on macOS and the BSDs, 108 on Linux; keep room for the NUL.
const MAX_SOCKET_PATH_BYTES: usize = 103;

/// Resolve the socket path for the given environment lookup and user id.
pub fn resolve_socket_path(lookup: impl Fn(&str) -> Option<String>, uid: u32) -> PathBuf {
    let usable = |var: &str| {
        lookup(var)
            .map(PathBuf::from)
            .filter(|dir| dir.is_absolute())
    };

    let mut candidates = Vec::new();
    if let Some(runtime) = usable("XDG_RUNTIME_DIR") {
        candidates.push(runtime.join(SOCKET_DIR_NAME).join(SOCKET_FILE_NAME));
    }
    if cfg!(target_os = "macos") {
        if let Some(tmp) = usable("TMPDIR") {
            candidates.push(tmp.join(SOCKET_DIR_NAME).join(SOCKET_FILE_NAME));
        }
    }

    candidates
        .into_iter()
        .find(|path| path.as_os_str().len() <= MAX_SOCKET_PATH_BYTES)
        .unwrap_or_else(|| fallback_socket_path(uid))
}

/// The uid-derived location used when no per-user directory is available.
pub fn fallback_socket_path(uid: u32) -> PathBuf {
    PathBuf::from("/tmp")
        .join(format!("{SOCKET_DIR_NAME}-{uid}"))
        .join(SOCKET_FILE_NAME)
}

/// Resolve the socket path for the current process.
pub fn default_socket_path() -> PathBuf {
    resolve_socket_path(|var| std::env::var(var).ok(), current_uid())
}

/// Effective uid of the current process.
pub fn current_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

/// Create the socket's parent directory with owner-only permissions.
///
/// Fails with `PermissionDenied` when the directory already exists but is
/// owned by another user.
pub fn prepare_socket_dir(socket_path: &Path) -> io::Result<()> {
    let Some(dir) = socket_path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(dir)?;

    let meta = fs::metadata(dir)?;
    let uid = current_uid();
    if meta.uid() != uid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "socket directory {} is owned by uid {}, not {uid}",
                dir.display(),
                meta.uid()
            ),
        ));
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o700 {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Restrict the socket file itself to its owner.
pub fn restrict_socket(socket_path: &Path) -> io::Result<()> {
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn prefers_xdg_runtime_dir() {
        let path = resolve_socket_path(env(&[("XDG_RUNTIME_DIR", "/run/user/1000")]), 1000);
        assert_eq!(path, PathBuf::from("/run/user/1000/stagebox/daemon.sock"));
    }

    #[test]
    fn falls_back_to_uid_path() {
        let path = resolve_socket_path(env(&[]), 4242);
        assert_eq!(path, PathBuf::from("/tmp/stagebox-4242/daemon.sock"));
    }

    #[test]
    fn ignores_relative_runtime_dir() {
        let path = resolve_socket_path(env(&[("XDG_RUNTIME_DIR", "run/user")]), 7);
        assert_eq!(path, fallback_socket_path(7));
    }

    #[test]
    fn ignores_runtime_dir_that_would_overflow_sun_path() {
        let long = format!("/{}", "x".repeat(120));
        let path = resolve_socket_path(env(&[("XDG_RUNTIME_DIR", &long)]), 7);
        assert_eq!(path, fallback_socket_path(7));
    }

    #[test]
    fn resolution_is_deterministic() {
        let lookup = env(&[("XDG_RUNTIME_DIR", "/run/user/5")]);
        assert_eq!(resolve_socket_path(&lookup, 5), resolve_socket_path(&lookup, 5));
    }

    #[test]
    fn different_users_never_share_fallback() {
        assert_ne!(fallback_socket_path(1000), fallback_socket_path(1001));
    }

    #[test]
    fn prepare_creates_private_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let socket = tmp.path().join("nested").join("daemon.sock");
        prepare_socket_dir(&socket).unwrap();

        let mode = fs::metadata(tmp.path().join("nested"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn prepare_tightens_existing_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("open");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        prepare_socket_dir(&dir.join("daemon.sock")).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}

//! Build-time metadata embedded by the build script.
//!
//! Reported by the daemon in its ping reply so `stagebox daemon status` can
//! tell which build is serving the socket.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("STAGEBOX_GIT_HASH");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("STAGEBOX_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return a formatted version string including git hash and profile.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_contains_parts() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
        assert!(v.ends_with(&format!("{BUILD_PROFILE})")));
    }

    #[test]
    fn test_git_hash_not_empty() {
        assert!(!GIT_HASH.is_empty());
    }
}

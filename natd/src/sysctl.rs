//! Kernel IP forwarding flag via /proc/sys.
//!
//! Check-then-set semantics: read first, write only when disabled, re-read
//! to confirm the write took effect.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

/// Path of the IPv4 forwarding flag, relative to the sysctl root.
const IP_FORWARD: &str = "net/ipv4/ip_forward";

/// Sysctl errors.
#[derive(Debug, Error)]
pub enum SysctlError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unexpected value in {path}: {value:?}")]
    Parse { path: PathBuf, value: String },

    #[error("Forwarding flag still reads disabled after writing {path}")]
    NotApplied { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, SysctlError>;

/// Handle to the sysctl tree, rooted at /proc/sys.
///
/// The root is overridable so tests can run against a scratch directory
/// without privileges.
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Sysctl {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc/sys"),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn flag_path(&self) -> PathBuf {
        self.root.join(IP_FORWARD)
    }

    fn read_flag(&self) -> Result<bool> {
        let path = self.flag_path();
        let raw = fs::read_to_string(&path).map_err(|source| SysctlError::Read {
            path: path.clone(),
            source,
        })?;

        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(SysctlError::Parse {
                path,
                value: other.to_string(),
            }),
        }
    }

    /// Whether the kernel currently forwards IPv4 packets between interfaces.
    pub fn ip_forwarding_enabled(&self) -> Result<bool> {
        self.read_flag()
    }

    /// Enable IPv4 forwarding.
    ///
    /// Returns `true` if the flag was changed, `false` if it was already
    /// enabled and no write was performed.
    pub fn enable_ip_forwarding(&self) -> Result<bool> {
        if self.read_flag()? {
            debug!("IP forwarding already enabled");
            return Ok(false);
        }

        let path = self.flag_path();
        fs::write(&path, "1\n").map_err(|source| SysctlError::Write {
            path: path.clone(),
            source,
        })?;

        // A write to /proc/sys can be silently dropped; confirm it took.
        if !self.read_flag()? {
            return Err(SysctlError::NotApplied { path });
        }

        info!("IP forwarding enabled");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_sysctl(initial: &str) -> (tempfile::TempDir, Sysctl) {
        let dir = tempfile::tempdir().unwrap();
        let flag_dir = dir.path().join("net/ipv4");
        fs::create_dir_all(&flag_dir).unwrap();
        fs::write(flag_dir.join("ip_forward"), initial).unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        (dir, sysctl)
    }

    #[test]
    fn enable_writes_when_disabled() {
        let (_dir, sysctl) = scratch_sysctl("0\n");
        assert!(!sysctl.ip_forwarding_enabled().unwrap());

        let changed = sysctl.enable_ip_forwarding().unwrap();
        assert!(changed);
        assert!(sysctl.ip_forwarding_enabled().unwrap());
    }

    #[test]
    fn enable_is_a_noop_when_already_enabled() {
        let (_dir, sysctl) = scratch_sysctl("1\n");

        let changed = sysctl.enable_ip_forwarding().unwrap();
        assert!(!changed);
        assert!(sysctl.ip_forwarding_enabled().unwrap());
    }

    #[test]
    fn repeated_enable_stays_enabled() {
        let (_dir, sysctl) = scratch_sysctl("0\n");

        assert!(sysctl.enable_ip_forwarding().unwrap());
        for _ in 0..3 {
            assert!(!sysctl.enable_ip_forwarding().unwrap());
        }
        assert!(sysctl.ip_forwarding_enabled().unwrap());
    }

    #[test]
    fn missing_flag_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());

        let err = sysctl.ip_forwarding_enabled().unwrap_err();
        assert!(matches!(err, SysctlError::Read { .. }));
        assert!(err.to_string().contains("ip_forward"));
    }

    #[test]
    fn garbage_flag_value_is_a_parse_error() {
        let (_dir, sysctl) = scratch_sysctl("banana\n");

        let err = sysctl.ip_forwarding_enabled().unwrap_err();
        assert!(matches!(err, SysctlError::Parse { .. }));
    }
}

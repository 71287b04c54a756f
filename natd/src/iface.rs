//! Egress interface validation and default-route detection.
//!
//! The interface name is the one configuration input whose mismatch breaks
//! all NAT traffic, so it is validated before any kernel state is touched.

use std::fs;
use std::io;

use thiserror::Error;
use tracing::debug;

const SYS_CLASS_NET: &str = "/sys/class/net";
const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Interface lookup errors.
#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("Interface {name} does not exist (host interfaces: {available})")]
    NotFound { name: String, available: String },

    #[error("No IPv4 default route, cannot detect the egress interface")]
    NoDefaultRoute,

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, IfaceError>;

/// Whether a network interface with this name exists on the host.
pub fn exists(name: &str) -> bool {
    nix::net::if_::if_nametoindex(name).is_ok()
}

/// Error unless the interface exists; the error names what does exist so an
/// interface mismatch is visible immediately.
pub fn require(name: &str) -> Result<()> {
    if exists(name) {
        debug!(iface = name, "egress interface present");
        return Ok(());
    }

    let available = list_interfaces().unwrap_or_default().join(", ");
    Err(IfaceError::NotFound {
        name: name.to_string(),
        available,
    })
}

/// Names of all network interfaces on the host, sorted.
pub fn list_interfaces() -> Result<Vec<String>> {
    let entries = fs::read_dir(SYS_CLASS_NET).map_err(|source| IfaceError::Io {
        path: SYS_CLASS_NET.to_string(),
        source,
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// Whether the interface reports operstate "up".
pub fn is_up(name: &str) -> Result<bool> {
    let path = format!("{SYS_CLASS_NET}/{name}/operstate");
    let state = fs::read_to_string(&path).map_err(|source| IfaceError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(state.trim() == "up")
}

/// Interface carrying the IPv4 default route.
pub fn default_egress() -> Result<String> {
    let table = fs::read_to_string(PROC_NET_ROUTE).map_err(|source| IfaceError::Io {
        path: PROC_NET_ROUTE.to_string(),
        source,
    })?;
    parse_default_route(&table).ok_or(IfaceError::NoDefaultRoute)
}

/// Find the default-route interface in /proc/net/route contents.
///
/// Columns are `Iface Destination Gateway Flags ...`, hex-encoded; a
/// destination of 00000000 is the default route.
fn parse_default_route(table: &str) -> Option<String> {
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() >= 2 && cols[1] == "00000000" {
            return Some(cols[0].to_string());
        }
    }
    None
}

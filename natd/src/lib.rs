//! natd: NAT instance bootstrap agent.
//!
//! Turns the host into an IPv4 NAT router at boot: enables kernel IP
//! forwarding and installs a masquerade rule on the egress interface via
//! nftables. Apply is idempotent and every step is checked, so a broken
//! step fails the boot instead of leaving a silently non-functional NAT
//! path. A resident mode keeps re-verifying kernel state and serves the
//! result on an HTTP health endpoint for orchestrator-driven replacement.
//!
//! # Architecture
//!
//! ```text
//! boot --> natd apply --> sysctl net.ipv4.ip_forward = 1
//!                     --> nft: table inet natd / postrouting masquerade
//!
//! natd serve --> monitor (periodic verify) --> GET /healthz (200 / 503)
//! ```

pub mod configurator;
pub mod health;
pub mod iface;
pub mod nft;
pub mod sysctl;

// Re-export commonly used types
pub use configurator::{ConfigError, NatSpec, NatStatus};
pub use health::StatusHandle;
pub use nft::MasqueradeRule;
pub use sysctl::Sysctl;

//! One-shot NAT configuration: validate, enable forwarding, reconcile rules.
//!
//! `apply` runs the ordered boot sequence with every step checked, and is
//! idempotent: re-running it converges on the same kernel state instead of
//! stacking duplicate rules. `verify` recomputes the observed state without
//! mutating anything.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::iface;
use crate::nft::{self, MasqueradeRule};
use crate::sysctl::{self, Sysctl};

/// Configuration errors, one per failure class. None of them are silent:
/// each carries the failing step's context and aborts the apply.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Egress interface check failed: {0}")]
    Iface(#[from] iface::IfaceError),

    #[error("IP forwarding setup failed: {0}")]
    Sysctl(#[from] sysctl::SysctlError),

    #[error("NAT rule setup failed: {0}")]
    Nft(#[from] nft::NftError),

    #[error("NAT path degraded after apply: {0}")]
    Degraded(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Desired NAT configuration for this host.
#[derive(Debug, Clone)]
pub struct NatSpec {
    /// Egress interface the masquerade rule is scoped to.
    pub iface: String,
    /// Source subnets to translate. Empty means everything leaving `iface`.
    pub sources: Vec<Ipv4Net>,
}

impl NatSpec {
    pub fn new(iface: &str, sources: Vec<Ipv4Net>) -> Self {
        Self {
            iface: iface.to_string(),
            sources,
        }
    }

    /// The masquerade rules this spec expands to.
    fn rules(&self) -> Vec<MasqueradeRule> {
        if self.sources.is_empty() {
            vec![MasqueradeRule::new(&self.iface, None)]
        } else {
            self.sources
                .iter()
                .map(|source| MasqueradeRule::new(&self.iface, Some(*source)))
                .collect()
        }
    }
}

/// Observed NAT state, served verbatim on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NatStatus {
    pub iface: String,
    pub iface_exists: bool,
    pub iface_up: bool,
    pub forwarding: bool,
    pub rule_count: usize,
    pub expected_rules: usize,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

impl NatStatus {
    /// Derive health from the observed pieces: the interface must exist,
    /// forwarding must be on, and the installed rules must be exactly the
    /// desired ones (no missing rule, no duplicate, no stale leftover).
    fn derive(
        spec: &NatSpec,
        iface_exists: bool,
        iface_up: bool,
        forwarding: bool,
        installed: &[MasqueradeRule],
    ) -> Self {
        let desired = spec.rules();
        let matched = desired
            .iter()
            .filter(|rule| installed.iter().any(|r| r.matches(rule)))
            .count();
        let healthy = iface_exists
            && forwarding
            && matched == desired.len()
            && installed.len() == desired.len();

        Self {
            iface: spec.iface.clone(),
            iface_exists,
            iface_up,
            forwarding,
            rule_count: installed.len(),
            expected_rules: desired.len(),
            healthy,
            checked_at: Utc::now(),
        }
    }

    /// Status for the case where kernel state could not be read at all.
    pub(crate) fn unavailable(spec: &NatSpec) -> Self {
        Self {
            iface: spec.iface.clone(),
            iface_exists: false,
            iface_up: false,
            forwarding: false,
            rule_count: 0,
            expected_rules: spec.rules().len(),
            healthy: false,
            checked_at: Utc::now(),
        }
    }
}

/// Apply the spec to the kernel: ordered, checked, idempotent.
///
/// Aborts on the first failing step; a partial apply is recovered by
/// re-running, which converges rather than duplicating state.
pub fn apply(spec: &NatSpec) -> Result<NatStatus> {
    iface::require(&spec.iface)?;

    match iface::is_up(&spec.iface) {
        Ok(true) => {}
        Ok(false) => warn!(iface = %spec.iface, "egress interface is not up yet"),
        Err(e) => warn!(iface = %spec.iface, error = %e, "could not read interface operstate"),
    }

    Sysctl::new().enable_ip_forwarding()?;

    nft::init_table()?;

    let desired = spec.rules();
    for rule in &desired {
        nft::ensure_masquerade(rule)?;
    }

    // Drop managed rules that no longer match the spec (config changes).
    for installed in nft::list_masquerade_rules()? {
        if !desired.iter().any(|rule| rule.matches(&installed)) {
            warn!(iface = %installed.out_iface, "removing stale masquerade rule");
            nft::remove_masquerade(&installed)?;
        }
    }

    let status = verify(spec)?;
    if !status.healthy {
        return Err(ConfigError::Degraded(format!(
            "forwarding={} rules={}/{}",
            status.forwarding, status.rule_count, status.expected_rules
        )));
    }

    info!(iface = %spec.iface, rules = status.rule_count, "NAT configuration applied");
    Ok(status)
}

/// Recompute the observed NAT state from the live kernel. Never mutates.
pub fn verify(spec: &NatSpec) -> Result<NatStatus> {
    let iface_exists = iface::exists(&spec.iface);
    let iface_up = iface_exists && iface::is_up(&spec.iface).unwrap_or(false);
    let forwarding = Sysctl::new().ip_forwarding_enabled().unwrap_or(false);
    let installed = nft::list_masquerade_rules()?;

    Ok(NatStatus::derive(
        spec,
        iface_exists,
        iface_up,
        forwarding,
        &installed,
    ))
}

/// Remove everything `apply` installed.
///
/// The forwarding flag is left as-is; other software on the host may
/// depend on it. natd only owns the `inet natd` table.
pub fn teardown() -> Result<()> {
    nft::delete_table()?;
    info!("NAT configuration removed");
    Ok(())
}

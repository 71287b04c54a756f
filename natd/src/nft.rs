//! Masquerade rule management via nftables.
//!
//! natd owns a single table (`inet natd`) with one srcnat postrouting
//! chain. Rule insertion is existence-checked, so repeated applies never
//! stack duplicate rules.

use std::io;
use std::process::Command;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::info;

const TABLE_FAMILY: &str = "inet";
const TABLE_NAME: &str = "natd";
const NAT_CHAIN: &str = "postrouting";

/// NAT rule management errors.
#[derive(Debug, Error)]
pub enum NftError {
    #[error("Failed to execute nft command: {0}")]
    Command(io::Error),

    #[error("nft command failed: {0}")]
    NftFailed(String),
}

pub type Result<T> = std::result::Result<T, NftError>;

/// One masquerade rule in the natd postrouting chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradeRule {
    /// Egress interface the rule is scoped to.
    pub out_iface: String,
    /// Source subnet restriction; `None` translates everything leaving
    /// the interface.
    pub source: Option<Ipv4Net>,
    /// Kernel rule handle, present on rules parsed from `nft -a list`.
    pub handle: Option<u32>,
}

impl MasqueradeRule {
    pub fn new(out_iface: &str, source: Option<Ipv4Net>) -> Self {
        Self {
            out_iface: out_iface.to_string(),
            source,
            handle: None,
        }
    }

    /// Whether two rules translate the same traffic (handles ignored).
    pub fn matches(&self, other: &MasqueradeRule) -> bool {
        self.out_iface == other.out_iface && self.source == other.source
    }

    /// Rule body in nft syntax.
    fn to_nft(&self) -> String {
        match self.source {
            Some(saddr) => format!(
                "ip saddr {} oifname \"{}\" masquerade",
                saddr, self.out_iface
            ),
            None => format!("oifname \"{}\" masquerade", self.out_iface),
        }
    }
}

fn run_nft(args: &[&str]) -> Result<std::process::Output> {
    Command::new("nft")
        .args(args)
        .output()
        .map_err(NftError::Command)
}

/// Create the natd table and postrouting chain if they do not exist yet.
pub fn init_table() -> Result<()> {
    let output = run_nft(&["add", "table", TABLE_FAMILY, TABLE_NAME])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Ignore "already exists" error
        if !stderr.contains("exists") {
            return Err(NftError::NftFailed(stderr.to_string()));
        }
    }

    let output = run_nft(&[
        "add",
        "chain",
        TABLE_FAMILY,
        TABLE_NAME,
        NAT_CHAIN,
        "{ type nat hook postrouting priority srcnat; policy accept; }",
    ])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("exists") {
            return Err(NftError::NftFailed(stderr.to_string()));
        }
    }

    info!(table = TABLE_NAME, chain = NAT_CHAIN, "nftables table ready");
    Ok(())
}

/// List the masquerade rules currently installed in the natd chain.
///
/// An absent table or chain reads as an empty rule set.
pub fn list_masquerade_rules() -> Result<Vec<MasqueradeRule>> {
    let output = run_nft(&["-a", "list", "chain", TABLE_FAMILY, TABLE_NAME, NAT_CHAIN])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") || stderr.contains("does not exist") {
            return Ok(Vec::new());
        }
        return Err(NftError::NftFailed(stderr.to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_rule_line).collect())
}

/// Install a masquerade rule unless an equivalent one is already present.
///
/// Returns `true` if a rule was added.
pub fn ensure_masquerade(rule: &MasqueradeRule) -> Result<bool> {
    if list_masquerade_rules()?.iter().any(|r| r.matches(rule)) {
        return Ok(false);
    }

    let body = rule.to_nft();
    let output = run_nft(&["add", "rule", TABLE_FAMILY, TABLE_NAME, NAT_CHAIN, &body])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NftError::NftFailed(stderr.to_string()));
    }

    info!(iface = %rule.out_iface, source = ?rule.source.map(|s| s.to_string()), "masquerade rule added");
    Ok(true)
}

/// Remove every installed rule translating the same traffic as `rule`.
pub fn remove_masquerade(rule: &MasqueradeRule) -> Result<()> {
    for installed in list_masquerade_rules()? {
        if installed.matches(rule) {
            if let Some(handle) = installed.handle {
                delete_by_handle(handle)?;
                info!(iface = %rule.out_iface, handle, "masquerade rule removed");
            }
        }
    }
    Ok(())
}

fn delete_by_handle(handle: u32) -> Result<()> {
    let handle = handle.to_string();
    let output = run_nft(&[
        "delete", "rule", TABLE_FAMILY, TABLE_NAME, NAT_CHAIN, "handle", &handle,
    ])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NftError::NftFailed(stderr.to_string()));
    }
    Ok(())
}

/// Delete the natd table and everything in it.
pub fn delete_table() -> Result<()> {
    let output = run_nft(&["delete", "table", TABLE_FAMILY, TABLE_NAME])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Ignore "no such table" error
        if !stderr.contains("No such") && !stderr.contains("does not exist") {
            return Err(NftError::NftFailed(stderr.to_string()));
        }
    } else {
        info!(table = TABLE_NAME, "nftables table removed");
    }
    Ok(())
}

/// Parse one `nft -a list` output line into a masquerade rule.
///
/// Example: `ip saddr 10.0.0.0/16 oifname "eth0" masquerade # handle 7`
fn parse_rule_line(line: &str) -> Option<MasqueradeRule> {
    let line = line.trim();
    if !line.split_whitespace().any(|tok| tok == "masquerade") {
        return None;
    }

    let handle = extract_handle(line);
    let mut out_iface = None;
    let mut source = None;

    let mut tokens = line.split_whitespace();
    while let Some(tok) = tokens.next() {
        match tok {
            "oifname" => {
                out_iface = tokens.next().map(|s| s.trim_matches('"').to_string());
            }
            "saddr" => {
                source = tokens.next().and_then(|s| s.parse().ok());
            }
            _ => {}
        }
    }

    Some(MasqueradeRule {
        out_iface: out_iface?,
        source,
        handle,
    })
}

/// Extract the handle number from an `nft -a` output line.
fn extract_handle(line: &str) -> Option<u32> {
    line.split("# handle ").nth(1)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_handle() {
        let line = r#"  oifname "eth0" masquerade # handle 5"#;
        assert_eq!(extract_handle(line), Some(5));

        let line = r#"  ip saddr 10.0.0.0/16 oifname "eth0" masquerade # handle 123"#;
        assert_eq!(extract_handle(line), Some(123));

        let line = r#"  oifname "eth0" masquerade"#;
        assert_eq!(extract_handle(line), None);
    }

    #[test]
    fn parses_bare_masquerade_rule() {
        let rule = parse_rule_line(r#"    oifname "eth0" masquerade # handle 2"#).unwrap();
        assert_eq!(rule.out_iface, "eth0");
        assert_eq!(rule.source, None);
        assert_eq!(rule.handle, Some(2));
    }

    #[test]
    fn parses_subnet_scoped_rule() {
        let rule =
            parse_rule_line(r#"    ip saddr 10.0.0.0/16 oifname "ens5" masquerade # handle 7"#)
                .unwrap();
        assert_eq!(rule.out_iface, "ens5");
        assert_eq!(rule.source, Some("10.0.0.0/16".parse().unwrap()));
        assert_eq!(rule.handle, Some(7));
    }

    #[test]
    fn parses_unquoted_oifname() {
        let rule = parse_rule_line("    oifname eth0 masquerade # handle 4").unwrap();
        assert_eq!(rule.out_iface, "eth0");
        assert_eq!(rule.source, None);
    }

    #[test]
    fn ignores_non_rule_lines() {
        assert!(parse_rule_line("table inet natd {").is_none());
        assert!(parse_rule_line("  chain postrouting { # handle 1").is_none());
        assert!(parse_rule_line("    type nat hook postrouting priority srcnat; policy accept;").is_none());
        assert!(parse_rule_line("}").is_none());
    }

    #[test]
    fn masquerade_without_oifname_is_skipped() {
        assert!(parse_rule_line("    ip saddr 10.0.0.0/8 masquerade # handle 9").is_none());
    }

    #[test]
    fn rule_equivalence_ignores_handles() {
        let desired = MasqueradeRule::new("eth0", None);
        let installed = MasqueradeRule {
            out_iface: "eth0".to_string(),
            source: None,
            handle: Some(12),
        };
        assert!(desired.matches(&installed));

        let other_iface = MasqueradeRule::new("ens5", None);
        assert!(!desired.matches(&other_iface));

        let scoped = MasqueradeRule::new("eth0", Some("10.0.0.0/16".parse().unwrap()));
        assert!(!desired.matches(&scoped));
    }

    #[test]
    fn rule_body_renders_nft_syntax() {
        let bare = MasqueradeRule::new("eth0", None);
        assert_eq!(bare.to_nft(), r#"oifname "eth0" masquerade"#);

        let scoped = MasqueradeRule::new("eth0", Some("192.168.0.0/24".parse().unwrap()));
        assert_eq!(
            scoped.to_nft(),
            r#"ip saddr 192.168.0.0/24 oifname "eth0" masquerade"#
        );
    }
}

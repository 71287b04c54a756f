//! End-to-end NAT configuration tests against the real kernel.
//!
//! These mutate host networking state (ip_forward sysctl, nftables) and
//! need CAP_NET_ADMIN plus the nft binary - run with:
//!   sudo -E cargo test --package natd --test nat_apply -- --ignored

use natd::configurator::{self, NatSpec};
use natd::nft;

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Apply, re-apply, verify, teardown - the full lifecycle in one test so
/// parallel tests never race on the shared kernel tables.
#[test]
#[ignore = "mutates kernel state; requires CAP_NET_ADMIN and nft"]
fn apply_lifecycle_is_idempotent() {
    if !is_root() {
        eprintln!("skipping apply_lifecycle_is_idempotent: requires root");
        return;
    }

    let spec = NatSpec::new("lo", vec!["10.99.0.0/24".parse().unwrap()]);

    let status = configurator::apply(&spec).expect("first apply failed");
    assert!(status.healthy);
    assert!(status.forwarding, "forwarding flag must read enabled");
    assert_eq!(status.rule_count, 1, "exactly one masquerade rule expected");

    // Idempotence: N applies still leave exactly one rule.
    for _ in 0..3 {
        let status = configurator::apply(&spec).expect("re-apply failed");
        assert_eq!(status.rule_count, 1, "re-apply must not duplicate the rule");
    }

    // Read-only verification agrees.
    let status = configurator::verify(&spec).expect("verify failed");
    assert!(status.healthy);

    // A spec change reconciles away the stale rule instead of stacking.
    let changed = NatSpec::new("lo", vec!["10.98.0.0/24".parse().unwrap()]);
    let status = configurator::apply(&changed).expect("apply after spec change failed");
    assert_eq!(status.rule_count, 1, "stale rule must be reconciled away");

    configurator::teardown().expect("teardown failed");
    assert!(
        nft::list_masquerade_rules()
            .expect("list after teardown failed")
            .is_empty(),
        "teardown must remove all managed rules"
    );
}

/// A nonexistent egress interface must fail loudly before any kernel
/// mutation. Needs no privileges: validation is the first step.
#[test]
fn apply_fails_loudly_for_missing_interface() {
    let spec = NatSpec::new("natd-no-such0", vec![]);

    let err = configurator::apply(&spec).expect_err("apply must fail for a missing interface");
    let msg = err.to_string();
    assert!(msg.contains("natd-no-such0"), "error must name the interface: {msg}");
}

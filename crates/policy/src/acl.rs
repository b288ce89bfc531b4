//! Per-node ACL compilation from the legacy role-pair rules.
//!
//! For a target node, every enabled rule whose destination role matches
//! (or is `*`) is expanded against the active nodes carrying the source
//! role, one wire entry per source. The list is sorted most-specific
//! first and closed by the three trailing rules: accept established,
//! accept ICMP echo-request, default drop.

use nw_domain::model::{Node, NodeStatus, Protocol, RuleAction};
use nw_protocol::{trailer, WireAclRule};
use nw_registry::RegistrySnapshot;

/// Compile the ACL list for one target node.
///
/// Pure function of `(target, snapshot)`; calling it twice on the same
/// inputs yields the same list.
pub fn compile_node_acl(target: &Node, snapshot: &RegistrySnapshot) -> Vec<WireAclRule> {
    let mut rules = Vec::new();

    for policy in snapshot.acl_policies.iter().filter(|p| p.enabled) {
        if !policy.dst_role.matches(target.role) {
            continue;
        }
        for source in snapshot
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active && n.role == policy.src_role)
        {
            rules.push(WireAclRule {
                src_ip: Some(format!("{}/32", source.overlay_ip)),
                dst_ip: Some(format!("{}/32", target.overlay_ip)),
                protocol: policy.protocol,
                port: policy.port,
                action: policy.action,
                description: Some(policy.name.clone()),
            });
        }
    }

    // Stable sort: ties keep the enumeration order of the source rules.
    rules.sort_by_key(|r| std::cmp::Reverse(specificity(r)));

    rules.push(WireAclRule {
        src_ip: None,
        dst_ip: None,
        protocol: Protocol::Any,
        port: None,
        action: RuleAction::Allow,
        description: Some(trailer::ESTABLISHED.to_string()),
    });
    rules.push(WireAclRule {
        src_ip: None,
        dst_ip: None,
        protocol: Protocol::Icmp,
        port: None,
        action: RuleAction::Allow,
        description: Some(trailer::ICMP_ECHO.to_string()),
    });
    rules.push(WireAclRule {
        src_ip: None,
        dst_ip: None,
        protocol: Protocol::Any,
        port: None,
        action: RuleAction::Deny,
        description: Some(trailer::DEFAULT_DROP.to_string()),
    });

    rules
}

/// Specificity score: `/32` on either address +100, any other CIDR +50,
/// a concrete port +25, a concrete protocol +10. Higher sorts earlier.
fn specificity(rule: &WireAclRule) -> u32 {
    let mut score = 0;
    for ip in [&rule.src_ip, &rule.dst_ip] {
        match ip {
            Some(cidr) if cidr.ends_with("/32") => score += 100,
            Some(_) => score += 50,
            None => {}
        }
    }
    if rule.port.is_some() {
        score += 25;
    }
    if rule.protocol != Protocol::Any {
        score += 10;
    }
    score
}

//! User × resource access evaluation over the rich policy model.
//!
//! Matching policies are sorted by ascending priority and the first one
//! wins. No match means deny: the model is closed by default.

use std::net::Ipv4Addr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;

use nw_domain::model::{AccessContext, AccessPolicy, PolicyAction, Resource, Subject};
use nw_registry::RegistrySnapshot;

/// The resource an access attempt targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceQuery {
    /// A hostname, matched against `domain` policies by suffix.
    Domain(String),
    /// An address, matched against `ip_range` policies by containment.
    Ip(Ipv4Addr),
    /// Matched against `zone` policies literally.
    Zone(String),
    /// Matched against `service` policies literally.
    Service(String),
    /// A URL, matched against `url_pattern` policies by glob.
    Url(String),
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct AccessDecision {
    pub action: PolicyAction,
    /// Id of the winning policy; `None` for the default deny.
    pub matched_policy: Option<u64>,
    pub reason: String,
}

/// Evaluate whether `user_id` may reach `query` under `ctx`.
pub fn evaluate_access(
    snapshot: &RegistrySnapshot,
    user_id: u64,
    query: &ResourceQuery,
    ctx: &AccessContext,
) -> AccessDecision {
    let now = ctx.timestamp.unwrap_or_else(Utc::now);
    let user_groups = snapshot.user_groups_transitive(user_id);

    let mut candidates: Vec<&AccessPolicy> = snapshot
        .policies
        .iter()
        .filter(|p| p.enabled)
        .filter(|p| within_validity(p, now))
        .filter(|p| subject_matches(&p.subject, user_id, &user_groups))
        .filter(|p| resource_matches(&p.resource, query))
        .filter(|p| conditions_hold(p, ctx, now))
        .collect();

    // Stable by id within one priority: deterministic for equal-priority
    // policies.
    candidates.sort_by_key(|p| (p.priority, p.id));

    match candidates.first() {
        Some(policy) => AccessDecision {
            action: policy.action,
            matched_policy: Some(policy.id),
            reason: format!("policy \"{}\" (priority {})", policy.name, policy.priority),
        },
        None => AccessDecision {
            action: PolicyAction::Deny,
            matched_policy: None,
            reason: "no matching policy (default deny)".to_string(),
        },
    }
}

fn within_validity(policy: &AccessPolicy, now: DateTime<Utc>) -> bool {
    if let Some(from) = policy.valid_from {
        if now < from {
            return false;
        }
    }
    if let Some(until) = policy.valid_until {
        if now > until {
            return false;
        }
    }
    true
}

fn subject_matches(
    subject: &Subject,
    user_id: u64,
    user_groups: &std::collections::HashSet<u64>,
) -> bool {
    match subject {
        Subject::All => true,
        Subject::User { id } => *id == user_id,
        Subject::Group { id } => user_groups.contains(id),
    }
}

fn resource_matches(resource: &Resource, query: &ResourceQuery) -> bool {
    match (resource, query) {
        (Resource::Domain(pattern), ResourceQuery::Domain(host)) => {
            domain_matches(pattern, host)
        }
        (Resource::IpRange(range), ResourceQuery::Ip(ip)) => range
            .parse::<Ipv4Net>()
            .map(|net| net.contains(ip))
            .unwrap_or(false),
        (Resource::Zone(zone), ResourceQuery::Zone(q)) => zone == q,
        (Resource::Service(service), ResourceQuery::Service(q)) => service == q,
        (Resource::UrlPattern(pattern), ResourceQuery::Url(url)) => glob::Pattern::new(pattern)
            .map(|p| p.matches(url))
            .unwrap_or(false),
        _ => false,
    }
}

/// Suffix match with a `*` wildcard: `*.internal.example` matches any
/// subdomain; a bare `internal.example` matches itself and subdomains.
fn domain_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

fn conditions_hold(policy: &AccessPolicy, ctx: &AccessContext, now: DateTime<Utc>) -> bool {
    let conditions = &policy.conditions;

    if !conditions.device_types.is_empty() {
        match &ctx.device_type {
            Some(device) if conditions.device_types.iter().any(|d| d == device) => {}
            _ => return false,
        }
    }

    if !conditions.time_windows.is_empty() {
        let weekday = now.weekday().num_days_from_monday() as u8;
        let minutes = (now.hour() * 60 + now.minute()) as u16;
        let in_window = conditions.time_windows.iter().any(|w| {
            if !w.days.contains(&weekday) {
                return false;
            }
            match (
                nw_registry::store::parse_hhmm(&w.start),
                nw_registry::store::parse_hhmm(&w.end),
            ) {
                (Some(start), Some(end)) => start <= minutes && minutes < end,
                _ => false,
            }
        });
        if !in_window {
            return false;
        }
    }

    if !conditions.client_cidrs.is_empty() {
        match ctx.client_ip {
            Some(ip) if conditions.client_cidrs.iter().any(|net| net.contains(&ip)) => {}
            _ => return false,
        }
    }

    if conditions.require_vpn && !ctx.via_vpn {
        return false;
    }

    true
}

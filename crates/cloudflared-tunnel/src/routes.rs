//! Hostname route convergence
//!
//! Cloudflare route registration is idempotent per hostname, so this only
//! trims redundant calls: it never decides correctness.

use std::collections::BTreeSet;

use cloudflared_common::crd::TunnelIngressRule;

/// Distinct routable hostnames named by the rules
///
/// Rules without a hostname are catch-alls and have nothing to route.
pub fn desired_routes(rules: &[TunnelIngressRule]) -> BTreeSet<String> {
    rules
        .iter()
        .filter_map(TunnelIngressRule::routable_hostname)
        .map(str::to_string)
        .collect()
}

/// `desired \ recorded`, in lexicographic order
pub fn difference(desired: &BTreeSet<String>, recorded: &BTreeSet<String>) -> Vec<String> {
    desired.difference(recorded).cloned().collect()
}

/// Desired hostnames, or the zone apex when the rules name none
pub fn desired_routes_or_apex(rules: &[TunnelIngressRule], zone_name: &str) -> BTreeSet<String> {
    let mut desired = desired_routes(rules);
    if desired.is_empty() {
        desired.insert(zone_name.to_string());
    }
    desired
}

/// Hostnames still to register for a Tunnel
pub fn routes_to_register(
    rules: &[TunnelIngressRule],
    recorded: &[String],
    zone_name: &str,
) -> Vec<String> {
    let recorded: BTreeSet<String> = recorded.iter().cloned().collect();
    difference(&desired_routes_or_apex(rules, zone_name), &recorded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(hosts: &[&str]) -> Vec<TunnelIngressRule> {
        hosts
            .iter()
            .map(|h| TunnelIngressRule {
                hostname: (!h.is_empty()).then(|| h.to_string()),
                service: "http://svc:80".to_string(),
                ..Default::default()
            })
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_desired_routes_collapse_duplicates_and_drop_empty() {
        assert_eq!(desired_routes(&rules(&["a", "b", "a", ""])), set(&["a", "b"]));

        let explicit_empty = vec![TunnelIngressRule {
            hostname: Some(String::new()),
            service: "http://svc".to_string(),
            ..Default::default()
        }];
        assert!(desired_routes(&explicit_empty).is_empty());
    }

    #[test]
    fn test_difference_is_set_difference() {
        assert_eq!(difference(&set(&["a", "b"]), &set(&["a"])), vec!["b"]);
        assert!(difference(&set(&["a"]), &set(&["a", "b"])).is_empty());
    }

    #[test]
    fn test_difference_is_lexicographic() {
        let desired = set(&["c.example.com", "a.example.com", "b.example.com"]);
        assert_eq!(
            difference(&desired, &BTreeSet::new()),
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[test]
    fn test_zone_apex_is_the_fallback_route() {
        assert_eq!(
            routes_to_register(&rules(&[""]), &[], "example.com"),
            vec!["example.com"]
        );
        assert!(routes_to_register(&[], &["example.com".to_string()], "example.com").is_empty());
    }

    #[test]
    fn test_recorded_routes_are_skipped() {
        let recorded = vec!["a.example.com".to_string()];
        assert_eq!(
            routes_to_register(
                &rules(&["b.example.com", "a.example.com"]),
                &recorded,
                "example.com"
            ),
            vec!["b.example.com"]
        );
    }
}

//! Matching configured group patterns against the live group inventory.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::TaggingRule;
use crate::tagger::WatchedGroup;

/// Check if a group name matches a glob pattern.
///
/// Matching rules:
/// - "*" matches every name
/// - A pattern without `*` must equal the name exactly
/// - Otherwise the literal pieces between `*`s must appear in order, the
///   first anchored at the start and the last at the end unless the
///   pattern begins or ends with `*`
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let leading_glob = pattern.starts_with('*');
    let trailing_glob = pattern.ends_with('*');
    let (last, middle) = match parts.split_last() {
        Some(split) => split,
        None => return false,
    };

    let mut rest = name;
    for (i, part) in middle.iter().enumerate() {
        if i == 0 && !leading_glob {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    trailing_glob || rest.ends_with(last)
}

/// Resolve rules against live group names, keyed by live name.
///
/// One rule may match many groups. When several rules match the same
/// group, the later rule wins.
pub fn resolve_groups(rules: &[TaggingRule], live_names: &[String]) -> BTreeMap<String, WatchedGroup> {
    let mut watched = BTreeMap::new();

    for rule in rules {
        for name in live_names {
            if !glob_matches(&rule.asg_name, name) {
                continue;
            }
            debug!(pattern = %rule.asg_name, asg = %name, "Pattern matched ASG");
            if watched
                .insert(name.clone(), rule.watched_group(name))
                .is_some()
            {
                warn!(
                    pattern = %rule.asg_name,
                    asg = %name,
                    "ASG matched by more than one rule, using the later rule"
                );
            }
        }
    }

    watched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, tag_value: &str) -> TaggingRule {
        TaggingRule {
            asg_name: pattern.to_string(),
            tags: [("rule".to_string(), tag_value.to_string())]
                .into_iter()
                .collect(),
            key_prefix: Vec::new(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_glob_exact() {
        assert!(glob_matches("my-asg", "my-asg"));
        assert!(!glob_matches("my-asg", "my-asg-nodes"));
        assert!(!glob_matches("my-asg", "other"));
    }

    #[test]
    fn test_glob_star_matches_all() {
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("*", ""));
    }

    #[test]
    fn test_glob_trailing_wildcard() {
        assert!(glob_matches("my-asg*", "my-asg-nodes"));
        assert!(glob_matches("my-asg*", "my-asg"));
        assert!(!glob_matches("my-asg*", "prod-my-asg"));
    }

    #[test]
    fn test_glob_leading_wildcard() {
        assert!(glob_matches("*-nodes", "prod-nodes"));
        assert!(!glob_matches("*-nodes", "prod-nodes-2"));
    }

    #[test]
    fn test_glob_inner_wildcards() {
        assert!(glob_matches("eks-*-workers-*", "eks-prod-workers-a1"));
        assert!(glob_matches("a*b*c", "axxbyyc"));
        assert!(!glob_matches("a*b*c", "axxcyyb"));
        assert!(!glob_matches("a*c", "ab"));
    }

    #[test]
    fn test_glob_is_not_regex() {
        assert!(!glob_matches("my.asg", "myxasg"));
        assert!(glob_matches("my.asg", "my.asg"));
        assert!(!glob_matches("my-asg?", "my-asg1"));
    }

    #[test]
    fn test_resolve_one_pattern_many_groups() {
        let live = names(&["my-asg-nodes", "my-asg-masters", "other"]);
        let watched = resolve_groups(&[rule("my-asg*", "a")], &live);

        let keys: Vec<&String> = watched.keys().collect();
        assert_eq!(keys, vec!["my-asg-masters", "my-asg-nodes"]);
        assert_eq!(watched["my-asg-nodes"].name, "my-asg-nodes");
    }

    #[test]
    fn test_resolve_no_match() {
        let live = names(&["other"]);
        assert!(resolve_groups(&[rule("my-asg*", "a")], &live).is_empty());
    }

    #[test]
    fn test_resolve_later_rule_wins() {
        let live = names(&["my-asg-nodes"]);
        let watched = resolve_groups(&[rule("my-asg*", "first"), rule("*-nodes", "second")], &live);

        assert_eq!(watched.len(), 1);
        assert_eq!(
            watched["my-asg-nodes"].tags.get("rule").map(String::as_str),
            Some("second")
        );
    }
}

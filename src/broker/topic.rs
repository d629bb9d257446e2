//! Topic filter matching
//!
//! Exact-match plus the two MQTT wildcards: `+` matches exactly one level,
//! `#` (only legal as the final level) matches the rest of the topic. Good
//! enough for the mock broker's scenarios; a production topic trie is out of
//! scope of this crate.

/// Whether `topic` (a publish topic, never containing wildcards) matches
/// `filter` (a subscription filter, which may).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    // Per MQTT 3.1: a filter starting with '$' never matches a topic that
    // doesn't also start with '$' (reserved for broker-internal topics),
    // even under a leading wildcard.
    if topic.starts_with('$') && !filter.starts_with('$') {
        return false;
    }

    matches_levels(&filter_levels, &topic_levels)
}

fn matches_levels(filter: &[&str], topic: &[&str]) -> bool {
    match (filter.first(), topic.first()) {
        (Some(&"#"), _) => filter.len() == 1,
        (Some(&"+"), Some(_)) => matches_levels(&filter[1..], &topic[1..]),
        (Some(f), Some(t)) => *f == *t && matches_levels(&filter[1..], &topic[1..]),
        (Some(_), None) => false,
        (None, None) => true,
        (None, Some(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("grand/foo/bar", "grand/foo/bar"));
        assert!(!topic_matches("grand/foo/bar", "grand/foo/baz"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("grand/+/bar", "grand/foo/bar"));
        assert!(!topic_matches("grand/+/bar", "grand/foo/baz/bar"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("grand/#", "grand/foo/bar"));
        assert!(topic_matches("grand/#", "grand"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn dollar_topics_excluded_from_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }
}

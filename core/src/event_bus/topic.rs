/// Topic grammar (§4.1, §4.2): `:`-separated segments, `*` matches exactly one segment,
/// `**` matches the remainder of the topic (zero or more segments) and may only appear as
/// the final pattern segment. Only `[A-Za-z0-9:*_-]` are accepted characters (§4.2).
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{EventBusError, EventBusResult};

static ALLOWED_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9:*_-]+$").unwrap());

pub fn validate_topic(topic: &str) -> EventBusResult<()> {
    if topic.is_empty() || topic.contains('*') {
        return Err(EventBusError::InvalidTopic(topic.to_string()));
    }
    if !ALLOWED_CHARS.is_match(topic) {
        return Err(EventBusError::InvalidTopic(topic.to_string()));
    }
    if topic.starts_with(':') || topic.ends_with(':') || topic.contains("::") {
        return Err(EventBusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> EventBusResult<()> {
    if pattern.is_empty() {
        return Err(EventBusError::InvalidPattern(pattern.to_string()));
    }
    if !ALLOWED_CHARS.is_match(pattern) {
        return Err(EventBusError::InvalidPattern(pattern.to_string()));
    }
    let segments: Vec<&str> = pattern.split(':').collect();
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }
        if *seg == "**" && i != segments.len() - 1 {
            return Err(EventBusError::InvalidPattern(format!(
                "{pattern}: ** only allowed as the final segment"
            )));
        }
        if seg.contains('*') && *seg != "*" && *seg != "**" {
            return Err(EventBusError::InvalidPattern(format!(
                "{pattern}: wildcard must occupy a whole segment"
            )));
        }
    }
    Ok(())
}

/// Matches a concrete topic against a subscription pattern (§4.1). A pattern with no `:`
/// and no wildcard is an exact-topic subscription and always matches itself.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let topic_segments: Vec<&str> = topic.split(':').collect();

    let mut pi = 0;
    let mut ti = 0;
    while pi < pattern_segments.len() {
        match pattern_segments[pi] {
            "**" => return true,
            "*" => {
                if ti >= topic_segments.len() {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
            literal => {
                if ti >= topic_segments.len() || topic_segments[ti] != literal {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
        }
    }
    ti == topic_segments.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exact_topic_only() {
        assert!(matches("agent:spawned", "agent:spawned"));
        assert!(!matches("agent:spawned", "agent:terminated"));
        assert!(!matches("agent:spawned", "agent:spawned:extra"));
    }

    #[test]
    fn single_star_matches_one_segment() {
        assert!(matches("agent:*:status", "agent:1:status"));
        assert!(!matches("agent:*:status", "agent:1:2:status"));
    }

    #[test]
    fn double_star_matches_remainder() {
        assert!(matches("agent:**", "agent:1:spawned"));
        assert!(matches("agent:**", "agent"));
        assert!(!matches("agent:**", "task:1:spawned"));
    }

    #[test]
    fn pattern_validation_rejects_mid_pattern_double_star() {
        assert!(validate_pattern("agent:**:status").is_err());
        assert!(validate_pattern("agent:**").is_ok());
        assert!(validate_pattern("a*b").is_err());
    }

    #[test]
    fn topic_validation_rejects_wildcards_and_bad_characters() {
        assert!(validate_topic("agent:*").is_err());
        assert!(validate_topic("agent::spawned").is_err());
        assert!(validate_topic("agent:spawned").is_ok());
        assert!(validate_topic("agent spawned").is_err());
    }
}

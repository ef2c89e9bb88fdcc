//! Name normalization and validation for topics, agents, tags and priorities

use crate::error::{DataError, DataResult};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum length of a topic or agent name
pub const MAX_NAME_LENGTH: usize = 64;

/// Maximum number of tags on one message
pub const MAX_TAGS: usize = 10;

/// Maximum length of a single tag
pub const MAX_TAG_LENGTH: usize = 50;

/// Accepted priority values
pub const PRIORITIES: [&str; 3] = ["low", "normal", "high"];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static pattern"))
}

/// Where a send request is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Topic(String),
    Agent(String),
}

impl Target {
    /// Canonical `to` value (`topic` or `@agent`)
    pub fn as_address(&self) -> String {
        match self {
            Target::Topic(name) => name.clone(),
            Target::Agent(name) => format!("@{}", name),
        }
    }
}

/// Trim and lowercase a topic name
pub fn normalize_topic(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Trim, lowercase and strip a leading `@` from an agent name
pub fn normalize_agent_name(name: &str) -> String {
    let trimmed = name.trim();
    trimmed.strip_prefix('@').unwrap_or(trimmed).trim().to_lowercase()
}

pub fn validate_topic(name: &str) -> DataResult<()> {
    validate_name("topic", name)
}

pub fn validate_agent_name(name: &str) -> DataResult<()> {
    validate_name("agent", name)
}

fn validate_name(field: &'static str, name: &str) -> DataResult<()> {
    if name.is_empty() {
        return Err(DataError::invalid(field, "must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(DataError::invalid(
            field,
            format!("{:?} is longer than {} characters", name, MAX_NAME_LENGTH),
        ));
    }
    if !name_pattern().is_match(name) {
        return Err(DataError::invalid(
            field,
            format!("{:?} must use lowercase letters, digits and dashes", name),
        ));
    }
    Ok(())
}

/// Normalize and validate tags, returning them deduplicated in input order
pub fn validate_tags(tags: &[String]) -> DataResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if tag.len() > MAX_TAG_LENGTH {
            return Err(DataError::invalid(
                "tag",
                format!("{:?} is longer than {} characters", tag, MAX_TAG_LENGTH),
            ));
        }
        if !name_pattern().is_match(&tag) {
            return Err(DataError::invalid(
                "tag",
                format!("{:?} must use lowercase letters, digits and dashes", tag),
            ));
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    if out.len() > MAX_TAGS {
        return Err(DataError::invalid(
            "tags",
            format!("at most {} tags are allowed", MAX_TAGS),
        ));
    }
    Ok(out)
}

pub fn validate_priority(priority: &str) -> DataResult<()> {
    if PRIORITIES.contains(&priority) {
        Ok(())
    } else {
        Err(DataError::invalid(
            "priority",
            format!("{:?} is not one of {}", priority, PRIORITIES.join(", ")),
        ))
    }
}

/// Parse a `to` value into a validated topic or agent target
pub fn normalize_target(to: &str) -> DataResult<Target> {
    let trimmed = to.trim();
    if trimmed.is_empty() {
        return Err(DataError::invalid("target", "must not be empty"));
    }
    if trimmed.starts_with('@') {
        let agent = normalize_agent_name(trimmed);
        validate_agent_name(&agent)?;
        Ok(Target::Agent(agent))
    } else {
        let topic = normalize_topic(trimmed);
        validate_topic(&topic)?;
        Ok(Target::Topic(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_agent_name() {
        assert_eq!(normalize_agent_name("  @Alice "), "alice");
        assert_eq!(normalize_agent_name("bob"), "bob");
    }

    #[test]
    fn test_validate_names() {
        assert!(validate_topic("task").is_ok());
        assert!(validate_topic("build-42").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("-lead").is_err());
        assert!(validate_topic("has space").is_err());
        assert!(validate_agent_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_tags_dedups_and_lowercases() {
        let tags = vec!["Release".to_string(), "release".to_string(), " done ".to_string()];
        assert_eq!(validate_tags(&tags).unwrap(), vec!["release", "done"]);

        let bad = vec!["no_underscores".to_string()];
        assert!(validate_tags(&bad).is_err());

        let many: Vec<String> = (0..=MAX_TAGS).map(|i| format!("t{}", i)).collect();
        assert!(validate_tags(&many).is_err());
    }

    #[test]
    fn test_validate_priority() {
        assert!(validate_priority("high").is_ok());
        assert!(validate_priority("urgent").is_err());
    }

    #[test]
    fn test_normalize_target() {
        assert_eq!(normalize_target("@Bob").unwrap(), Target::Agent("bob".into()));
        assert_eq!(normalize_target(" Task ").unwrap(), Target::Topic("task".into()));
        assert_eq!(Target::Agent("bob".into()).as_address(), "@bob");
        assert!(normalize_target("@").is_err());
        assert!(normalize_target("").is_err());
    }
}

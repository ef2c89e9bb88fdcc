//! Message predicates shared by listings, search and subscriptions

use crate::store::normalize_agent_name;
use crate::types::{DEFAULT_PRIORITY, Message, MessageFilter, SearchQuery, SubscriptionFilter};
use chrono::{DateTime, Utc};

/// Effective priority of a stored message
pub fn priority_of(message: &Message) -> &str {
    if message.priority.is_empty() {
        DEFAULT_PRIORITY
    } else {
        &message.priority
    }
}

/// Agent a DM is addressed to, normalized (`@Bob` -> `bob`)
pub fn dm_recipient(message: &Message) -> Option<String> {
    message
        .to
        .trim()
        .strip_prefix('@')
        .map(normalize_agent_name)
}

/// A DM the viewer sent to themselves
pub fn is_self_dm(viewer: &str, message: &Message) -> bool {
    let viewer = normalize_agent_name(viewer);
    normalize_agent_name(&message.from) == viewer && dm_recipient(message).as_deref() == Some(viewer.as_str())
}

/// Inclusive time-range check
pub fn in_time_range(
    time: DateTime<Utc>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> bool {
    since.is_none_or(|s| time >= s) && until.is_none_or(|u| time <= u)
}

fn sender_matches(message: &Message, from: Option<&str>) -> bool {
    from.is_none_or(|f| normalize_agent_name(&message.from) == normalize_agent_name(f))
}

/// `to` filters accept `topic`, `@agent`, or a bare agent name for a DM
fn recipient_matches(message: &Message, to: Option<&str>) -> bool {
    let Some(to) = to else {
        return true;
    };
    let wanted = to.trim().to_lowercase();
    let actual = message.to.trim().to_lowercase();
    if actual == wanted {
        return true;
    }
    match dm_recipient(message) {
        Some(agent) => agent == normalize_agent_name(&wanted),
        None => false,
    }
}

fn priority_matches(message: &Message, priority: Option<&str>) -> bool {
    priority.is_none_or(|p| priority_of(message).eq_ignore_ascii_case(p.trim()))
}

/// Every required tag is present (case-insensitive, order ignored)
pub fn has_all_tags(message: &Message, required: &[String]) -> bool {
    required.iter().all(|want| {
        let want = want.trim();
        want.is_empty() || message.tags.iter().any(|t| t.trim().eq_ignore_ascii_case(want))
    })
}

/// Attribute and time predicates of a listing filter (limit is applied separately)
pub fn matches_filter(message: &Message, filter: &MessageFilter) -> bool {
    in_time_range(message.time, filter.since, filter.until)
        && sender_matches(message, filter.from.as_deref())
        && recipient_matches(message, filter.to.as_deref())
        && priority_matches(message, filter.priority.as_deref())
        && has_all_tags(message, &filter.tags)
}

/// Search predicates other than text, scope and `has_reply`
pub fn matches_search_attributes(message: &Message, query: &SearchQuery) -> bool {
    in_time_range(message.time, query.since, query.until)
        && sender_matches(message, query.from.as_deref())
        && recipient_matches(message, query.to.as_deref())
        && priority_matches(message, query.priority.as_deref())
        && has_all_tags(message, &query.tags)
}

/// Attribute predicates of a subscription (scope is handled by the source)
pub fn matches_subscription(message: &Message, filter: &SubscriptionFilter) -> bool {
    sender_matches(message, filter.from.as_deref())
        && priority_matches(message, filter.priority.as_deref())
        && has_all_tags(message, &filter.tags)
}

/// Keep the most recent `limit` messages of an ID-ordered list (0 keeps all)
pub fn apply_limit(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
    if limit > 0 && messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }
    messages
}

/// Case-insensitive substring search.
///
/// Returns the byte offset and byte length of the first match within
/// `haystack`, so callers can highlight the original text.
pub fn find_substring(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return Some((0, 0));
    }
    let needle: String = needle.chars().flat_map(char::to_lowercase).collect();

    // Lowered text plus, per lowered char, the byte offset of its source char
    let mut lowered = String::with_capacity(haystack.len());
    let mut origins: Vec<(usize, usize)> = Vec::with_capacity(haystack.len());
    for (offset, ch) in haystack.char_indices() {
        for lower in ch.to_lowercase() {
            origins.push((lowered.len(), offset));
            lowered.push(lower);
        }
    }

    let start = lowered.find(&needle)?;
    let end = start + needle.len();
    let origin_of = |lowered_pos: usize| -> usize {
        let idx = origins.partition_point(|(pos, _)| *pos < lowered_pos);
        origins.get(idx).map_or(haystack.len(), |(_, orig)| *orig)
    };

    let orig_start = origin_of(start);
    let orig_end = origin_of(end).max(orig_start);
    Some((orig_start, orig_end - orig_start))
}

/// Peer of a DM from `viewer`'s point of view.
///
/// `owner` is the agent whose inbox directory holds the message. Returns
/// `None` when the message does not belong to any conversation of the viewer
/// (including self-addressed DMs); such messages are skipped.
pub fn dm_peer(viewer: &str, owner: &str, message: &Message) -> Option<String> {
    let viewer = normalize_agent_name(viewer);
    let owner = normalize_agent_name(owner);
    let from = normalize_agent_name(&message.from);
    let to = dm_recipient(message).unwrap_or_default();

    if from == viewer && !to.is_empty() && to != viewer {
        return Some(to);
    }
    if to == viewer && !from.is_empty() && from != viewer {
        return Some(from);
    }
    if owner == viewer && !from.is_empty() && from != viewer {
        return Some(from);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn msg(from: &str, to: &str, body: &str) -> Message {
        Message {
            id: "20260101-000000-0001".into(),
            from: from.into(),
            to: to.into(),
            time: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            body: json!(body),
            reply_to: String::new(),
            priority: String::new(),
            host: String::new(),
            tags: vec!["Release".into(), "done".into()],
        }
    }

    #[test]
    fn test_find_substring_case_insensitive() {
        assert_eq!(find_substring("Deploy READY now", "ready"), Some((7, 5)));
        assert_eq!(find_substring("abc", "zzz"), None);
        assert_eq!(find_substring("abc", ""), Some((0, 0)));
    }

    #[test]
    fn test_find_substring_reports_original_offsets() {
        // Multi-byte chars before the match shift byte offsets
        let text = "Ünïcode DEPLOY";
        let (offset, len) = find_substring(text, "deploy").unwrap();
        assert_eq!(&text[offset..offset + len], "DEPLOY");

        let (offset, len) = find_substring("straße ÄB", "äb").unwrap();
        assert_eq!(&"straße ÄB"[offset..offset + len], "ÄB");
    }

    #[test]
    fn test_find_substring_punctuation() {
        assert_eq!(find_substring("done!? yes", "!?"), Some((4, 2)));
    }

    #[test]
    fn test_matches_filter() {
        let m = msg("Alice", "task", "x");
        let mut filter = MessageFilter {
            from: Some("alice".into()),
            tags: vec!["release".into()],
            priority: Some("normal".into()),
            ..Default::default()
        };
        assert!(matches_filter(&m, &filter));

        filter.tags.push("missing".into());
        assert!(!matches_filter(&m, &filter));

        let filter = MessageFilter {
            since: Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()),
            until: Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(matches_filter(&m, &filter));
    }

    #[test]
    fn test_recipient_filter_accepts_bare_agent() {
        let m = msg("alice", "@bob", "x");
        let filter = MessageFilter {
            to: Some("bob".into()),
            ..Default::default()
        };
        assert!(matches_filter(&m, &filter));

        let filter = MessageFilter {
            to: Some("@Bob".into()),
            ..Default::default()
        };
        assert!(matches_filter(&m, &filter));
    }

    #[test]
    fn test_apply_limit_keeps_most_recent() {
        let messages: Vec<Message> = (0..5)
            .map(|i| {
                let mut m = msg("a", "t", "x");
                m.id = format!("id-{}", i);
                m
            })
            .collect();
        let kept = apply_limit(messages, 3);
        let ids: Vec<_> = kept.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["id-2", "id-3", "id-4"]);
    }

    #[test]
    fn test_dm_peer_resolution() {
        assert_eq!(dm_peer("alice", "bob", &msg("alice", "@bob", "")), Some("bob".into()));
        assert_eq!(dm_peer("alice", "alice", &msg("bob", "@alice", "")), Some("bob".into()));
        assert_eq!(dm_peer("bob", "bob", &msg("alice", "@bob", "")), Some("alice".into()));
        // Message in the viewer's inbox addressed elsewhere: peer is the sender
        assert_eq!(dm_peer("alice", "alice", &msg("carol", "@dave", "")), Some("carol".into()));
    }

    #[test]
    fn test_dm_peer_unrelated_or_self_is_skipped() {
        assert_eq!(dm_peer("alice", "dave", &msg("carol", "@dave", "")), None);
        assert_eq!(dm_peer("alice", "alice", &msg("alice", "@alice", "")), None);
        assert_eq!(dm_peer("alice", "bob", &msg("", "task", "")), None);
    }
}

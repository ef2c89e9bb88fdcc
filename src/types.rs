use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Priority applied when a send request leaves it empty
pub const DEFAULT_PRIORITY: &str = "normal";

/// Topic value that selects every topic in a subscription
pub const ALL_TOPICS: &str = "*";

/// A single mailbox message, one JSON file on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sortable, time-prefixed identifier (`YYYYMMDD-HHMMSS-NNNN`)
    #[serde(default)]
    pub id: String,
    pub from: String,
    /// Topic name, or `@agent` for a direct message
    pub to: String,
    pub time: DateTime<Utc>,
    /// Plain text or structured JSON
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Message {
    /// Body rendered as text; structured bodies are serialized to JSON
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// True when the message is addressed to an agent rather than a topic
    pub fn is_dm(&self) -> bool {
        self.to.starts_with('@')
    }

    /// Tags in display order (sorted, deduplicated)
    pub fn sorted_tags(&self) -> Vec<String> {
        let mut tags = self.tags.clone();
        tags.sort();
        tags.dedup();
        tags
    }
}

/// Summary of one topic directory
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub message_count: usize,
    /// Sorted, deduplicated senders
    pub participants: Vec<String>,
    pub last_message: Option<Message>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// One peer conversation from the viewpoint of a viewing agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DmConversation {
    /// The peer agent
    pub agent: String,
    pub message_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_message: Option<Message>,
}

/// Registered agent, as listed by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Filter for topic and DM listings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub priority: Option<String>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
    /// Keep only the most recent N matches (0 = unlimited)
    pub limit: usize,
}

impl MessageFilter {
    /// True when the filter constrains anything beyond time range and limit
    pub fn has_attribute_predicates(&self) -> bool {
        self.from.is_some() || self.to.is_some() || self.priority.is_some() || !self.tags.is_empty()
    }
}

/// Filter for live subscriptions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    /// `*` (or empty) for everything, a topic name, or `@agent` for a DM pair
    pub topic: String,
    /// Viewing agent; scopes DMs
    pub agent: Option<String>,
    /// Resume strictly after this message ID
    pub since_id: Option<String>,
    /// Start from this time when no ID is known
    pub since: Option<DateTime<Utc>>,
    pub from: Option<String>,
    pub priority: Option<String>,
    pub tags: Vec<String>,
}

impl SubscriptionFilter {
    /// Subscribe to one topic, `@agent` pair, or `*`
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }
}

/// Full-text and attribute search across topics and DMs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    /// Case-insensitive substring of the body
    pub text: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Restrict to one target (`topic` or `@agent`)
    pub in_target: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    pub tags: Vec<String>,
    /// Only messages some other message in the same target replies to
    pub has_reply: bool,
}

/// One search hit with its neighbours for context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Target the message lives in (`topic` or `@agent`)
    pub topic: String,
    pub message: Message,
    /// Byte offset and length of the match in `message.body_text()`
    pub match_offset: Option<usize>,
    pub match_length: usize,
    pub prev: Option<Message>,
    pub next: Option<Message>,
}

/// A request to send a message through a provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendRequest {
    /// Falls back to the configured self identity when empty
    pub from: Option<String>,
    pub to: String,
    pub body: Value,
    pub reply_to: Option<String>,
    pub priority: Option<String>,
    pub tags: Vec<String>,
    pub host: Option<String>,
}

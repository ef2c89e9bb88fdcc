//! Provider that streams live updates from the `forged` daemon
//!
//! Only subscriptions talk to the daemon. Every other query is answered by the
//! embedded [`FileProvider`], and while the daemon is down subscriptions fall
//! back to file polling through the same relay the hybrid provider uses.

use super::file::FileProvider;
use super::hybrid::{LiveSource, spawn_relay};
use super::{CancelToken, Provider, Subscription, deliver};
use crate::config::ProviderConfig;
use crate::daemon::{DaemonAddr, WatchClient, WatchRequest, resolve_addr};
use crate::error::{DataError, DataResult};
use crate::query::matches_subscription;
use crate::store::{normalize_agent_name, normalize_topic};
use crate::types::{
    ALL_TOPICS, AgentRecord, DmConversation, Message, MessageFilter, SearchQuery, SearchResult,
    SendRequest, SubscriptionFilter, TopicInfo,
};
use chrono::SecondsFormat;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{SyncSender, sync_channel};
use std::thread;
use tracing::{debug, warn};

/// Messages read ahead of the relay
const STREAM_BUFFER: usize = 64;

/// Build the watch request for a subscription
pub fn watch_request(filter: &SubscriptionFilter, default_viewer: Option<&str>) -> WatchRequest {
    let topic = match filter.topic.trim() {
        "" => ALL_TOPICS.to_string(),
        t if t.starts_with('@') => format!("@{}", normalize_agent_name(t)),
        t if t == ALL_TOPICS => ALL_TOPICS.to_string(),
        t => normalize_topic(t),
    };
    let agent = filter
        .agent
        .as_deref()
        .or(default_viewer)
        .map(normalize_agent_name)
        .unwrap_or_default();
    let since = match (&filter.since_id, &filter.since) {
        (Some(id), _) if !id.is_empty() => id.clone(),
        (_, Some(time)) => time.to_rfc3339_opts(SecondsFormat::Secs, true),
        _ => String::new(),
    };
    WatchRequest::watch(topic, agent, since)
}

/// Whether a streamed message belongs to the requested scope
fn in_watch_scope(request: &WatchRequest, message: &Message) -> bool {
    match request.topic.as_str() {
        ALL_TOPICS => true,
        t if t.starts_with('@') => {
            let from = normalize_agent_name(&message.from);
            let involves = |agent: &str| from == agent || normalize_agent_name(&message.to) == agent;
            involves(&t[1..]) && (request.agent.is_empty() || involves(request.agent.as_str()))
        }
        t => message.to == t,
    }
}

/// Live source backed by a daemon watch stream
pub struct DaemonSource {
    configured: Option<String>,
    store_root: PathBuf,
    viewer: Option<String>,
}

impl DaemonSource {
    pub fn new(configured: Option<String>, store_root: impl Into<PathBuf>, viewer: Option<String>) -> Self {
        Self {
            configured,
            store_root: store_root.into(),
            viewer,
        }
    }

    /// Address currently selected by discovery
    pub fn addr(&self) -> DaemonAddr {
        resolve_addr(self.configured.as_deref(), &self.store_root)
    }

    fn stream(
        mut client: WatchClient,
        request: WatchRequest,
        filter: SubscriptionFilter,
        out: SyncSender<Message>,
        cancel: CancelToken,
    ) {
        let floor = filter.since_id.clone().filter(|id| !id.is_empty());
        while !cancel.is_cancelled() {
            let message = match client.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(addr = %client.addr(), error = %e, "daemon stream ended");
                    break;
                }
            };
            if floor.as_ref().is_some_and(|floor| message.id <= *floor) {
                continue;
            }
            if !in_watch_scope(&request, &message) || !matches_subscription(&message, &filter) {
                continue;
            }
            if !deliver(&out, message, &cancel) {
                break;
            }
        }
        debug!("daemon stream reader stopped");
    }
}

impl LiveSource for DaemonSource {
    fn name(&self) -> &'static str {
        "forged"
    }

    fn reachable(&self) -> bool {
        self.addr().probe()
    }

    fn open(&self, filter: SubscriptionFilter, parent: &CancelToken) -> DataResult<Subscription> {
        let addr = self.addr();
        let request = watch_request(&filter, self.viewer.as_deref());
        let mut client = WatchClient::connect(&addr)?;
        client.watch(&request)?;
        debug!(%addr, topic = %request.topic, since = %request.since, "daemon watch started");

        let cancel = parent.child();
        let (tx, rx) = sync_channel(STREAM_BUFFER);
        let token = cancel.clone();
        thread::Builder::new()
            .name("fmail-forged".into())
            .spawn(move || Self::stream(client, request, filter, tx, token))
            .map_err(|e| DataError::Unavailable(format!("spawn stream reader: {}", e)))?;
        Ok(Subscription::new(rx, cancel))
    }
}

/// Answers queries from files, streams subscriptions from the daemon
pub struct ForgedProvider {
    files: Arc<FileProvider>,
    daemon: Arc<DaemonSource>,
}

impl ForgedProvider {
    pub fn new(config: ProviderConfig) -> DataResult<Self> {
        Ok(Self::with_files(Arc::new(FileProvider::new(config)?)))
    }

    /// Share an existing file provider for queries and fallback polling
    pub fn with_files(files: Arc<FileProvider>) -> Self {
        let config = files.config();
        let daemon = Arc::new(DaemonSource::new(
            config.forged_addr.clone(),
            files.store().root().to_path_buf(),
            config.self_agent.clone(),
        ));
        Self { files, daemon }
    }

    pub fn daemon(&self) -> Arc<DaemonSource> {
        Arc::clone(&self.daemon)
    }

    pub fn files(&self) -> &FileProvider {
        &self.files
    }
}

impl Provider for ForgedProvider {
    fn topics(&self) -> DataResult<Vec<TopicInfo>> {
        self.files.topics()
    }

    fn messages(&self, topic: &str, filter: &MessageFilter) -> DataResult<Vec<Message>> {
        self.files.messages(topic, filter)
    }

    fn dm_conversations(&self, agent: &str) -> DataResult<Vec<DmConversation>> {
        self.files.dm_conversations(agent)
    }

    fn dms(&self, agent: &str, filter: &MessageFilter) -> DataResult<Vec<Message>> {
        self.files.dms(agent, filter)
    }

    fn agents(&self) -> DataResult<Vec<AgentRecord>> {
        self.files.agents()
    }

    fn search(&self, query: &SearchQuery) -> DataResult<Vec<SearchResult>> {
        self.files.search(query)
    }

    fn send(&self, request: &SendRequest) -> DataResult<Message> {
        self.files.send(request)
    }

    fn subscribe_with(&self, filter: SubscriptionFilter, parent: &CancelToken) -> Subscription {
        let config = self.files.config();
        spawn_relay(
            self.daemon() as Arc<dyn LiveSource>,
            Arc::clone(&self.files) as Arc<dyn LiveSource>,
            filter,
            parent,
            config.subscribe_buffer,
            config.reconnect_interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn msg(id: &str, from: &str, to: &str) -> Message {
        Message {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            time: Utc::now(),
            body: json!("x"),
            reply_to: String::new(),
            priority: String::new(),
            host: String::new(),
            tags: vec![],
        }
    }

    #[test]
    fn test_watch_request_fields() {
        let req = watch_request(&SubscriptionFilter::default(), Some("Alice"));
        assert_eq!(req.topic, "*");
        assert_eq!(req.agent, "alice");
        assert_eq!(req.since, "");

        let filter = SubscriptionFilter {
            topic: "@Bob".into(),
            since_id: Some("20260101-000000-0003".into()),
            since: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let req = watch_request(&filter, None);
        assert_eq!(req.topic, "@bob");
        assert_eq!(req.since, "20260101-000000-0003");

        let filter = SubscriptionFilter {
            topic: "Task".into(),
            since: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let req = watch_request(&filter, None);
        assert_eq!(req.topic, "task");
        assert_eq!(req.since, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_watch_scope() {
        let topic = WatchRequest::watch("task", "", "");
        assert!(in_watch_scope(&topic, &msg("1", "a", "task")));
        assert!(!in_watch_scope(&topic, &msg("1", "a", "other")));

        let pair = WatchRequest::watch("@bob", "alice", "");
        assert!(in_watch_scope(&pair, &msg("1", "alice", "@bob")));
        assert!(in_watch_scope(&pair, &msg("1", "bob", "@alice")));
        assert!(!in_watch_scope(&pair, &msg("1", "carol", "@alice")));
    }

    #[test]
    fn test_unreachable_daemon_refuses_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = DaemonSource::new(
            Some(dir.path().join("none.sock").display().to_string()),
            dir.path(),
            None,
        );
        assert!(!source.reachable());
        assert!(source.open(SubscriptionFilter::default(), &CancelToken::new()).is_err());
    }
}

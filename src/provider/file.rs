//! Provider backed directly by the on-disk store
//!
//! Three layers sit between a query and the disk:
//!
//! 1. Short-lived result caches (topics, agents, per-target message lists,
//!    per-viewer conversations), valid for `cache_ttl`
//! 2. The [`DirectoryMetadataIndex`], refreshed per directory when its mtime
//!    changes or `metadata_ttl` expires
//! 3. The shared [`MessageCache`] of parsed files
//!
//! Result caches and metadata share one `RwLock`; the search index has its
//! own `Mutex`. Values are computed without holding either lock and installed
//! afterwards. When both are needed the search lock is taken first.

use super::hybrid::LiveSource;
use super::poll::FilePoller;
use super::{CancelToken, Provider, Subscription};
use crate::cache::{CachedReader, MessageCache, TimedEntry, modified_time};
use crate::config::ProviderConfig;
use crate::error::{DataError, DataResult};
use crate::index::search::{replied_ids, scan_target, sort_results};
use crate::index::{DirSnapshot, DirectoryMetadataIndex, LoadedTarget, TextSearchIndex, refresh_dir};
use crate::query::{
    apply_limit, dm_peer, in_time_range, is_self_dm, matches_filter, window_range,
};
use crate::store::{
    MailStore, Target, list_message_files, normalize_agent_name, normalize_target,
    normalize_topic, validate_agent_name, validate_priority, validate_tags, validate_topic,
};
use crate::types::{
    AgentRecord, DEFAULT_PRIORITY, DmConversation, Message, MessageFilter, SearchQuery,
    SearchResult, SendRequest, SubscriptionFilter, TopicInfo,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Default)]
struct CacheState {
    topics: Option<TimedEntry<Vec<TopicInfo>>>,
    agents: Option<TimedEntry<Vec<AgentRecord>>>,
    /// Keyed by target (`topic` or `@agent`)
    messages: HashMap<String, TimedEntry<Vec<Message>>>,
    /// Keyed by viewing agent
    conversations: HashMap<String, TimedEntry<Vec<DmConversation>>>,
    metadata: DirectoryMetadataIndex,
}

/// Answers every query from the file store
pub struct FileProvider {
    store: Arc<MailStore>,
    cache: Arc<MessageCache>,
    config: ProviderConfig,
    state: RwLock<CacheState>,
    search: Mutex<TextSearchIndex>,
}

impl FileProvider {
    /// Create a provider over `config.root`
    pub fn new(config: ProviderConfig) -> DataResult<Self> {
        let config = config.normalized();
        let root = config
            .root
            .clone()
            .ok_or_else(|| DataError::invalid("root", "no mailbox root configured"))?;
        let cache = Arc::new(MessageCache::new(config.message_cache_size));
        Ok(Self::with_store(Arc::new(MailStore::new(root)), cache, config))
    }

    /// Provider over an existing store and message cache
    pub fn with_store(store: Arc<MailStore>, cache: Arc<MessageCache>, config: ProviderConfig) -> Self {
        Self {
            store,
            cache,
            config: config.normalized(),
            state: RwLock::new(CacheState::default()),
            search: Mutex::new(TextSearchIndex::new()),
        }
    }

    /// Provider with default settings over a store root
    pub fn open(root: impl AsRef<Path>) -> DataResult<Self> {
        Self::new(ProviderConfig::with_root(root.as_ref()))
    }

    pub fn store(&self) -> &MailStore {
        &self.store
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn message_cache(&self) -> &MessageCache {
        &self.cache
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_search(&self) -> MutexGuard<'_, TextSearchIndex> {
        self.search.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> CachedReader<'_> {
        CachedReader::new(&self.store, &self.cache)
    }

    fn poller(&self) -> FilePoller {
        FilePoller::new(Arc::clone(&self.store), Arc::clone(&self.cache), self.config.clone())
    }

    /// Metadata snapshot of a target, refreshed when stale
    fn snapshot(&self, target: &str) -> DataResult<Arc<DirSnapshot>> {
        let dir = self.store.target_dir(target);
        let prev = self.read_state().metadata.get(target);
        let now = SystemTime::now();

        if let Some(prev) = &prev {
            let current = modified_time(&dir)?;
            if prev.is_fresh(current, now, self.config.metadata_ttl) {
                return Ok(Arc::clone(prev));
            }
        }

        let fresh = Arc::new(refresh_dir(&dir, prev.as_deref(), self.reader(), now)?);
        self.write_state().metadata.install(target, Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Full ID-ordered message list of a target
    fn target_messages(&self, target: &str) -> DataResult<Vec<Message>> {
        if let Some(messages) = self
            .read_state()
            .messages
            .get(target)
            .and_then(|e| e.get())
        {
            return Ok(messages.clone());
        }

        let messages = self.snapshot(target)?.messages();
        self.write_state().messages.insert(
            target.to_string(),
            TimedEntry::new(messages.clone(), self.config.cache_ttl),
        );
        Ok(messages)
    }

    /// Every topic and DM inbox, as target names
    fn all_targets(&self) -> DataResult<Vec<String>> {
        let mut targets = self.store.list_topics()?;
        targets.extend(
            self.store
                .list_dm_owners()?
                .into_iter()
                .map(|owner| format!("@{}", owner)),
        );
        Ok(targets)
    }

    /// Read only the files inside the requested time window, newest first,
    /// stopping once `limit` messages matched
    fn windowed_messages(&self, topic: &str, filter: &MessageFilter) -> DataResult<Vec<Message>> {
        let dir = self.store.topic_dir(topic);
        let names = list_message_files(&dir)?;
        let range = window_range(&names, filter.since, filter.until);
        let reader = self.reader();

        let mut out = Vec::new();
        for name in names[range].iter().rev() {
            let Some(message) = reader.read(&dir.join(name))? else {
                continue;
            };
            if !in_time_range(message.time, filter.since, filter.until) {
                continue;
            }
            out.push(message);
            if filter.limit > 0 && out.len() >= filter.limit {
                break;
            }
        }
        out.reverse();
        Ok(out)
    }

    fn build_topics(&self) -> DataResult<Vec<TopicInfo>> {
        let mut topics = Vec::new();
        for name in self.store.list_topics()? {
            let snapshot = self.snapshot(&name)?;
            let last = snapshot.summary.last_message.clone();
            topics.push(TopicInfo {
                message_count: snapshot.summary.count,
                participants: snapshot.summary.participants.clone(),
                last_activity: last.as_ref().map(|m| m.time),
                last_message: last,
                name,
            });
        }
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    fn build_conversations(&self, viewer: &str) -> DataResult<Vec<DmConversation>> {
        let mut peers: BTreeMap<String, (usize, Option<Message>)> = BTreeMap::new();

        for owner in self.store.list_dm_owners()? {
            let snapshot = match self.snapshot(&format!("@{}", owner)) {
                Ok(snapshot) => snapshot,
                Err(e) if owner != viewer => {
                    warn!(owner = %owner, error = %e, "skipping unreadable DM inbox");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for meta in snapshot.files.values() {
                let Some(peer) = dm_peer(viewer, &owner, &meta.message) else {
                    continue;
                };
                let (count, last) = peers.entry(peer).or_insert((0, None));
                *count += 1;
                if last.as_ref().is_none_or(|l| meta.id > l.id) {
                    *last = Some(meta.message.clone());
                }
            }
        }

        let mut conversations: Vec<DmConversation> = peers
            .into_iter()
            .map(|(agent, (message_count, last))| DmConversation {
                agent,
                message_count,
                last_activity: last.as_ref().map(|m| m.time),
                last_message: last,
            })
            .collect();
        conversations.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.agent.cmp(&b.agent))
        });
        Ok(conversations)
    }

    /// Bring the search index up to date: drift check when due, then rebuild dirty targets
    fn refresh_search_index(&self, index: &mut TextSearchIndex) -> DataResult<()> {
        let drift_due = index
            .last_drift_check()
            .is_none_or(|at| at.elapsed() >= self.config.metadata_ttl);
        if drift_due {
            let mut current = HashMap::new();
            for target in self.all_targets()? {
                let mtime = modified_time(&self.store.target_dir(&target))?;
                current.insert(target, mtime);
            }
            index.detect_drift(&current);
        }

        index.refresh(|target| {
            let snapshot = self.snapshot(target)?;
            if snapshot.dir_modified.is_none() && snapshot.files.is_empty() {
                return Ok(None);
            }
            Ok(Some(LoadedTarget {
                messages: snapshot.messages(),
                dir_modified: snapshot.dir_modified,
            }))
        })?;
        Ok(())
    }

    /// Linear search over the scoped targets, used when there is no text
    fn scan_search(&self, query: &SearchQuery) -> DataResult<Vec<SearchResult>> {
        let targets = match query.in_target.as_deref().map(str::trim) {
            Some(scope) if !scope.is_empty() => vec![scope_target(scope)?],
            _ => self.all_targets()?,
        };

        let mut results = Vec::new();
        for target in targets {
            let messages = self.target_messages(&target)?;
            let replied = query.has_reply.then(|| replied_ids(&messages));
            results.extend(scan_target(
                &target,
                &messages,
                0..messages.len(),
                query,
                replied.as_ref(),
            ));
        }
        sort_results(&mut results);
        Ok(results)
    }

    /// Validate a send request and fill in defaults
    fn normalize_send(&self, request: &SendRequest) -> DataResult<(Target, Message)> {
        let from = request
            .from
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.self_agent.clone())
            .ok_or_else(|| DataError::invalid("from", "sender is required"))?;
        let from = normalize_agent_name(&from);
        validate_agent_name(&from)?;

        let target = normalize_target(&request.to)?;

        let body = match &request.body {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            other => Some(other.clone()),
        }
        .ok_or_else(|| DataError::invalid("body", "message body is required"))?;

        let priority = request
            .priority
            .as_deref()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PRIORITY.to_string());
        validate_priority(&priority)?;

        let tags = validate_tags(&request.tags)?;

        let message = Message {
            id: String::new(),
            from,
            to: target.as_address(),
            // Unset, so the store stamps time and ID from the same clock reading
            time: DateTime::<Utc>::default(),
            body,
            reply_to: request.reply_to.as_deref().unwrap_or("").trim().to_string(),
            priority,
            host: request.host.as_deref().unwrap_or("").trim().to_string(),
            tags,
        };
        Ok((target, message))
    }

    /// Drop every cached value a new message in `target` could make stale
    pub fn invalidate(&self, target: &str) {
        {
            let mut state = self.write_state();
            if let Some(entry) = state.messages.get_mut(target) {
                entry.invalidate();
            }
            state.metadata.invalidate(target);
            if target.starts_with('@') {
                state.conversations.values_mut().for_each(TimedEntry::invalidate);
            } else if let Some(topics) = state.topics.as_mut() {
                topics.invalidate();
            }
        }
        self.lock_search().mark_dirty(target);
        debug!(key = target, "invalidated caches");
    }

    /// Drop every cached value
    pub fn invalidate_all(&self) {
        {
            let mut state = self.write_state();
            state.topics = None;
            state.agents = None;
            state.messages.clear();
            state.conversations.clear();
            state.metadata.invalidate_all();
        }
        let mut index = self.lock_search();
        if let Ok(targets) = self.all_targets() {
            for target in targets {
                index.mark_dirty(&target);
            }
        }
    }
}

/// Target name for a search scope (`topic` or `@agent`)
fn scope_target(scope: &str) -> DataResult<String> {
    match scope.strip_prefix('@') {
        Some(agent) => {
            let agent = normalize_agent_name(agent);
            validate_agent_name(&agent)?;
            Ok(format!("@{}", agent))
        }
        None => {
            let topic = normalize_topic(scope);
            validate_topic(&topic)?;
            Ok(topic)
        }
    }
}

impl Provider for FileProvider {
    fn topics(&self) -> DataResult<Vec<TopicInfo>> {
        if let Some(topics) = self.read_state().topics.as_ref().and_then(|e| e.get()) {
            return Ok(topics.clone());
        }
        let topics = self.build_topics()?;
        self.write_state().topics = Some(TimedEntry::new(topics.clone(), self.config.cache_ttl));
        Ok(topics)
    }

    fn messages(&self, topic: &str, filter: &MessageFilter) -> DataResult<Vec<Message>> {
        let topic = normalize_topic(topic);
        validate_topic(&topic)?;

        if !filter.has_attribute_predicates() {
            return self.windowed_messages(&topic, filter);
        }
        let matched: Vec<Message> = self
            .target_messages(&topic)?
            .into_iter()
            .filter(|m| matches_filter(m, filter))
            .collect();
        Ok(apply_limit(matched, filter.limit))
    }

    fn dm_conversations(&self, agent: &str) -> DataResult<Vec<DmConversation>> {
        let viewer = normalize_agent_name(agent);
        validate_agent_name(&viewer)?;

        if let Some(cached) = self
            .read_state()
            .conversations
            .get(&viewer)
            .and_then(|e| e.get())
        {
            return Ok(cached.clone());
        }
        let conversations = self.build_conversations(&viewer)?;
        self.write_state().conversations.insert(
            viewer,
            TimedEntry::new(conversations.clone(), self.config.cache_ttl),
        );
        Ok(conversations)
    }

    fn dms(&self, agent: &str, filter: &MessageFilter) -> DataResult<Vec<Message>> {
        let peer = normalize_agent_name(agent);
        validate_agent_name(&peer)?;

        // `to` names the viewer here, not a recipient predicate
        let mut filter = filter.clone();
        let to = filter
            .to
            .take()
            .map(|to| normalize_agent_name(&to))
            .filter(|to| !to.is_empty());
        let viewer = self
            .config
            .self_agent
            .as_deref()
            .map(normalize_agent_name)
            .or(to)
            .ok_or_else(|| DataError::invalid("agent", "viewer identity is required for DMs"))?;
        validate_agent_name(&viewer)?;

        let owners = if viewer == peer {
            vec![peer.clone()]
        } else {
            vec![peer.clone(), viewer.clone()]
        };

        let mut out = Vec::new();
        for owner in owners {
            for message in self.target_messages(&format!("@{}", owner))? {
                let in_pair = if viewer == peer {
                    is_self_dm(&viewer, &message)
                } else {
                    dm_peer(&viewer, &owner, &message).as_deref() == Some(peer.as_str())
                };
                if in_pair && matches_filter(&message, &filter) {
                    out.push(message);
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(apply_limit(out, filter.limit))
    }

    fn agents(&self) -> DataResult<Vec<AgentRecord>> {
        if let Some(agents) = self.read_state().agents.as_ref().and_then(|e| e.get()) {
            return Ok(agents.clone());
        }
        let agents = self.store.list_agent_records()?;
        self.write_state().agents = Some(TimedEntry::new(agents.clone(), self.config.cache_ttl));
        Ok(agents)
    }

    fn search(&self, query: &SearchQuery) -> DataResult<Vec<SearchResult>> {
        if query.text.is_empty() {
            return self.scan_search(query);
        }
        let mut index = self.lock_search();
        self.refresh_search_index(&mut index)?;
        let mut query = query.clone();
        if let Some(scope) = query.in_target.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query.in_target = Some(scope_target(scope)?);
        }
        Ok(index.search(&query))
    }

    fn send(&self, request: &SendRequest) -> DataResult<Message> {
        let (target, message) = self.normalize_send(request)?;
        self.store.ensure_root()?;
        let stored = self.store.store_message(&message)?;

        if let Err(e) = self.store.touch_agent(&stored.from, &stored.host) {
            warn!(agent = %stored.from, error = %e, "failed to update agent record");
        }
        let key = match &target {
            Target::Topic(topic) => topic.clone(),
            Target::Agent(agent) => format!("@{}", agent),
        };
        self.invalidate(&key);
        if let Some(agents) = self.write_state().agents.as_mut() {
            agents.invalidate();
        }
        Ok(stored)
    }

    fn subscribe_with(&self, filter: SubscriptionFilter, parent: &CancelToken) -> Subscription {
        self.poller().spawn(filter, parent)
    }
}

impl LiveSource for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn reachable(&self) -> bool {
        true
    }

    fn open(&self, filter: SubscriptionFilter, cancel: &CancelToken) -> DataResult<Subscription> {
        Ok(self.poller().spawn(filter, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> FileProvider {
        FileProvider::open(dir.path().join(".fmail")).unwrap()
    }

    fn send(p: &FileProvider, from: &str, to: &str, body: &str) -> Message {
        p.send(&SendRequest {
            from: Some(from.into()),
            to: to.into(),
            body: json!(body),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_send_normalizes_request() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        let stored = p
            .send(&SendRequest {
                from: Some(" @Alice ".into()),
                to: "Task".into(),
                body: json!("hi"),
                tags: vec!["Release".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stored.from, "alice");
        assert_eq!(stored.to, "task");
        assert_eq!(stored.priority, "normal");
        assert_eq!(stored.tags, vec!["release"]);
        assert!(!stored.id.is_empty());
        assert_eq!(crate::store::id::time_prefix(stored.time), &stored.id[..15]);
    }

    #[test]
    fn test_send_validation_errors() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        let empty_body = SendRequest {
            from: Some("alice".into()),
            to: "task".into(),
            body: json!("  "),
            ..Default::default()
        };
        assert!(p.send(&empty_body).unwrap_err().is_validation());

        let no_sender = SendRequest {
            to: "task".into(),
            body: json!("x"),
            ..Default::default()
        };
        assert!(p.send(&no_sender).unwrap_err().is_validation());

        let bad_priority = SendRequest {
            from: Some("alice".into()),
            to: "task".into(),
            body: json!("x"),
            priority: Some("urgent".into()),
            ..Default::default()
        };
        assert!(p.send(&bad_priority).unwrap_err().is_validation());
    }

    #[test]
    fn test_send_uses_configured_identity() {
        let dir = TempDir::new().unwrap();
        let config = ProviderConfig {
            self_agent: Some("robot".into()),
            ..ProviderConfig::with_root(dir.path().join(".fmail"))
        };
        let p = FileProvider::new(config).unwrap();
        let stored = p
            .send(&SendRequest {
                to: "@alice".into(),
                body: json!({"kind": "ping"}),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stored.from, "robot");
        assert_eq!(p.agents().unwrap()[0].name, "robot");
    }

    #[test]
    fn test_send_invalidates_topics_immediately() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        send(&p, "alice", "task", "one");
        assert_eq!(p.topics().unwrap()[0].message_count, 1);

        send(&p, "bob", "task", "two");
        let topics = p.topics().unwrap();
        assert_eq!(topics[0].message_count, 2);
        assert_eq!(topics[0].participants, vec!["alice", "bob"]);
    }

    #[test]
    fn test_invalidate_drops_cached_listing() {
        let dir = TempDir::new().unwrap();
        let config = ProviderConfig {
            cache_ttl: std::time::Duration::from_secs(60),
            metadata_ttl: std::time::Duration::from_secs(60),
            ..ProviderConfig::with_root(dir.path().join(".fmail"))
        };
        let p = FileProvider::new(config.clone()).unwrap();
        let filter = MessageFilter {
            from: Some("alice".into()),
            ..Default::default()
        };
        send(&p, "alice", "task", "one");
        assert_eq!(p.messages("task", &filter).unwrap().len(), 1);

        // Another writer sharing the store
        let other = FileProvider::with_store(Arc::clone(&p.store), Arc::new(MessageCache::new(16)), config);
        send(&other, "alice", "task", "two");
        assert_eq!(p.messages("task", &filter).unwrap().len(), 1);

        p.invalidate("task");
        assert_eq!(p.messages("task", &filter).unwrap().len(), 2);
        assert_eq!(p.topics().unwrap()[0].message_count, 2);
    }

    #[test]
    fn test_dms_need_viewer() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        send(&p, "alice", "@bob", "hi");
        let err = p.dms("bob", &MessageFilter::default()).unwrap_err();
        assert!(err.is_validation());

        let filter = MessageFilter {
            to: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(p.dms("bob", &filter).unwrap().len(), 1);
    }

    #[test]
    fn test_search_scope_is_normalized() {
        let dir = TempDir::new().unwrap();
        let p = provider(&dir);
        send(&p, "alice", "task", "deploy now");
        send(&p, "alice", "other", "deploy later");
        let query = SearchQuery {
            text: "deploy".into(),
            in_target: Some("TASK".into()),
            ..Default::default()
        };
        let results = p.search(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].topic, "task");
    }

    #[test]
    fn test_new_requires_root() {
        assert!(FileProvider::new(ProviderConfig::default()).is_err());
    }
}

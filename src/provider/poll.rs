//! Filesystem polling loop behind file-based subscriptions
//!
//! Every poll lists the directories in scope, reads only the files past each
//! directory's cursor, and delivers matches in ID order. The interval drops
//! back to `poll_min` after a poll that delivered something and doubles up
//! to `poll_max` while idle.

use super::{CancelToken, Subscription, deliver};
use crate::cache::{CachedReader, MessageCache};
use crate::config::ProviderConfig;
use crate::error::DataResult;
use crate::query::{dm_peer, is_self_dm, matches_subscription, position_after};
use crate::store::{MailStore, file_stem, list_message_files, lower_bound, normalize_agent_name};
use crate::types::{ALL_TOPICS, Message, SubscriptionFilter};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{SyncSender, sync_channel};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// What a subscription covers
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PollScope {
    /// Every topic, plus DMs involving the viewer when one is known
    All { viewer: Option<String> },
    Topic(String),
    /// The viewer/peer pair, or the whole inbox of `peer` without a viewer
    Direct { peer: String, viewer: Option<String> },
}

impl PollScope {
    pub(crate) fn resolve(filter: &SubscriptionFilter, default_viewer: Option<&str>) -> Self {
        let viewer = filter
            .agent
            .as_deref()
            .or(default_viewer)
            .map(normalize_agent_name)
            .filter(|v| !v.is_empty());
        let topic = filter.topic.trim();
        if topic.is_empty() || topic == ALL_TOPICS {
            PollScope::All { viewer }
        } else if topic.starts_with('@') {
            PollScope::Direct {
                peer: normalize_agent_name(topic),
                viewer,
            }
        } else {
            PollScope::Topic(topic.to_lowercase())
        }
    }
}

/// One directory to watch and how to decide whether its messages are in scope
struct WatchedDir {
    key: String,
    dir: PathBuf,
    /// Inbox owner for DM directories
    owner: Option<String>,
}

/// Owns what a polling thread needs from the file provider
#[derive(Clone)]
pub(crate) struct FilePoller {
    store: Arc<MailStore>,
    cache: Arc<MessageCache>,
    config: ProviderConfig,
}

impl FilePoller {
    pub(crate) fn new(store: Arc<MailStore>, cache: Arc<MessageCache>, config: ProviderConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Start polling on a background thread
    pub(crate) fn spawn(self, filter: SubscriptionFilter, parent: &CancelToken) -> Subscription {
        let cancel = parent.child();
        let (tx, rx) = sync_channel(self.config.subscribe_buffer.max(1));
        let token = cancel.clone();
        let spawned = thread::Builder::new()
            .name("fmail-poll".into())
            .spawn(move || self.run(filter, tx, token));
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start polling thread");
        }
        Subscription::new(rx, cancel)
    }

    fn run(self, filter: SubscriptionFilter, out: SyncSender<Message>, cancel: CancelToken) {
        let scope = PollScope::resolve(&filter, self.config.self_agent.as_deref());
        let mut state = PollState::new(&filter, Utc::now());
        let mut interval = self.config.poll_min;
        debug!(?scope, "file subscription started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.poll_once(&scope, &filter, &mut state) {
                Ok(batch) => {
                    let delivered = batch.len();
                    for message in batch {
                        if !deliver(&out, message, &cancel) {
                            debug!("file subscription closed");
                            return;
                        }
                    }
                    interval = next_interval(interval, delivered > 0, &self.config);
                }
                Err(e) => {
                    warn!(error = %e, "subscription poll failed");
                    interval = next_interval(interval, false, &self.config);
                }
            }
            if cancel.wait_timeout(interval) {
                break;
            }
        }
        debug!("file subscription stopped");
    }

    fn watched_dirs(&self, scope: &PollScope) -> DataResult<Vec<WatchedDir>> {
        let mut dirs = Vec::new();
        match scope {
            PollScope::Topic(topic) => dirs.push(WatchedDir {
                key: topic.clone(),
                dir: self.store.topic_dir(topic),
                owner: None,
            }),
            PollScope::All { viewer } => {
                for topic in self.store.list_topics()? {
                    dirs.push(WatchedDir {
                        key: topic.clone(),
                        dir: self.store.topic_dir(&topic),
                        owner: None,
                    });
                }
                if viewer.is_some() {
                    for owner in self.store.list_dm_owners()? {
                        dirs.push(self.dm_dir(owner));
                    }
                }
            }
            PollScope::Direct { peer, viewer } => {
                dirs.push(self.dm_dir(peer.clone()));
                if let Some(viewer) = viewer.as_ref().filter(|v| *v != peer) {
                    dirs.push(self.dm_dir(viewer.clone()));
                }
            }
        }
        Ok(dirs)
    }

    fn dm_dir(&self, owner: String) -> WatchedDir {
        WatchedDir {
            key: format!("@{}", owner),
            dir: self.store.dm_dir(&owner),
            owner: Some(owner),
        }
    }

    /// One pass over every watched directory; returns new matches in ID order.
    ///
    /// An unlistable directory is skipped for this round and an unreadable
    /// file is skipped for good; neither holds back the other directories.
    fn poll_once(
        &self,
        scope: &PollScope,
        filter: &SubscriptionFilter,
        state: &mut PollState,
    ) -> DataResult<Vec<Message>> {
        let reader = CachedReader::new(&self.store, &self.cache);
        let mut batch = Vec::new();

        for watched in self.watched_dirs(scope)? {
            let names = match list_message_files(&watched.dir) {
                Ok(names) => names,
                Err(e) => {
                    warn!(dir = %watched.key, error = %e, "skipping unlistable directory");
                    continue;
                }
            };
            let Some(start) = state.start_index(&watched.key, &names) else {
                continue;
            };
            for name in &names[start..] {
                let message = match reader.read(&watched.dir.join(name)) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(dir = %watched.key, file = %name, error = %e, "skipping unreadable message");
                        continue;
                    }
                };
                if in_scope(scope, &watched, &message) && matches_subscription(&message, filter) {
                    batch.push(message);
                }
            }
            if let Some(last) = names.last() {
                state.advance(&watched.key, file_stem(last));
            }
        }
        state.first_poll = false;

        batch.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(batch)
    }
}

fn in_scope(scope: &PollScope, watched: &WatchedDir, message: &Message) -> bool {
    let Some(owner) = watched.owner.as_deref() else {
        return true;
    };
    match scope {
        PollScope::Topic(_) => true,
        PollScope::All { viewer: None } => false,
        PollScope::All {
            viewer: Some(viewer),
        } => is_self_dm(viewer, message) || dm_peer(viewer, owner, message).is_some(),
        PollScope::Direct { peer, viewer: None } => owner == peer,
        PollScope::Direct {
            peer,
            viewer: Some(viewer),
        } => {
            if peer == viewer {
                is_self_dm(viewer, message)
            } else {
                dm_peer(viewer, owner, message).as_deref() == Some(peer.as_str())
            }
        }
    }
}

fn next_interval(current: Duration, delivered: bool, config: &ProviderConfig) -> Duration {
    if delivered {
        config.poll_min
    } else {
        (current * 2).clamp(config.poll_min, config.poll_max)
    }
}

/// Per-directory cursors of one subscription
struct PollState {
    cursors: HashMap<String, String>,
    since_id: Option<String>,
    since_bound: Option<String>,
    /// Floor for directories that appear after the first poll
    started_bound: String,
    first_poll: bool,
}

impl PollState {
    fn new(filter: &SubscriptionFilter, started: DateTime<Utc>) -> Self {
        Self {
            cursors: HashMap::new(),
            since_id: filter.since_id.clone().filter(|s| !s.is_empty()),
            since_bound: filter.since.map(lower_bound),
            started_bound: lower_bound(started),
            first_poll: true,
        }
    }

    /// Index of the first unseen file, or `None` to skip the directory this round
    fn start_index(&mut self, key: &str, names: &[String]) -> Option<usize> {
        if let Some(cursor) = self.cursors.get(key) {
            return Some(position_after(names, cursor));
        }
        if let Some(id) = &self.since_id {
            return Some(position_after(names, id));
        }
        if let Some(bound) = &self.since_bound {
            return Some(names.partition_point(|n| file_stem(n) < bound.as_str()));
        }
        if self.first_poll {
            // Live-only subscription: existing messages are history
            if let Some(last) = names.last() {
                self.cursors.insert(key.to_string(), file_stem(last).to_string());
            }
            return None;
        }
        Some(names.partition_point(|n| file_stem(n) < self.started_bound.as_str()))
    }

    fn advance(&mut self, key: &str, last: &str) {
        match self.cursors.get_mut(key) {
            Some(cursor) if cursor.as_str() >= last => {}
            Some(cursor) => *cursor = last.to_string(),
            None => {
                self.cursors.insert(key.to_string(), last.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn names(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| format!("{}.json", id)).collect()
    }

    #[test]
    fn test_scope_resolution() {
        let filter = SubscriptionFilter::for_topic("*");
        assert_eq!(
            PollScope::resolve(&filter, Some("Alice")),
            PollScope::All {
                viewer: Some("alice".into())
            }
        );

        let filter = SubscriptionFilter::for_topic("@Bob");
        assert_eq!(
            PollScope::resolve(&filter, None),
            PollScope::Direct {
                peer: "bob".into(),
                viewer: None
            }
        );

        let filter = SubscriptionFilter::for_topic("Task");
        assert_eq!(PollScope::resolve(&filter, None), PollScope::Topic("task".into()));
    }

    #[test]
    fn test_live_only_skips_existing_then_reads_new() {
        let mut state = PollState::new(&SubscriptionFilter::default(), Utc::now());
        let existing = names(&["20260101-000000-0001", "20260101-000000-0002"]);
        assert_eq!(state.start_index("task", &existing), None);
        state.first_poll = false;

        let grown = names(&[
            "20260101-000000-0001",
            "20260101-000000-0002",
            "20260101-000001-0001",
        ]);
        assert_eq!(state.start_index("task", &grown), Some(2));
    }

    #[test]
    fn test_since_id_resumes_after() {
        let filter = SubscriptionFilter {
            since_id: Some("20260101-000000-0001".into()),
            ..Default::default()
        };
        let mut state = PollState::new(&filter, Utc::now());
        let existing = names(&["20260101-000000-0001", "20260101-000000-0002"]);
        assert_eq!(state.start_index("task", &existing), Some(1));
    }

    #[test]
    fn test_new_directory_after_first_poll_starts_at_subscription_time() {
        let started = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 5).unwrap();
        let mut state = PollState::new(&SubscriptionFilter::default(), started);
        state.first_poll = false;
        let listing = names(&["20260101-000004-0001", "20260101-000005-0001"]);
        assert_eq!(state.start_index("new", &listing), Some(1));
    }

    #[test]
    fn test_interval_backoff() {
        let config = ProviderConfig {
            poll_min: Duration::from_millis(100),
            poll_max: Duration::from_millis(350),
            ..Default::default()
        };
        let mut interval = config.poll_min;
        interval = next_interval(interval, false, &config);
        assert_eq!(interval, Duration::from_millis(200));
        interval = next_interval(interval, false, &config);
        assert_eq!(interval, Duration::from_millis(350));
        interval = next_interval(interval, true, &config);
        assert_eq!(interval, Duration::from_millis(100));
    }
}

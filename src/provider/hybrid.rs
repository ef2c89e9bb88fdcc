//! Live-source failover
//!
//! A relay thread forwards messages from whichever source is active:
//!
//! ```text
//!            daemon reachable (timer)
//!   File  ─────────────────────────────▶  Forged
//!         ◀─────────────────────────────
//!      daemon unreachable (timer) or stream closed
//! ```
//!
//! The highest delivered ID is tracked across switches. Before switching, the
//! old channel is drained; the new source then resumes strictly after that
//! ID, and anything it yields at or below that floor is dropped. Within one
//! source session messages pass through in the order the source emits them,
//! even when a later directory yields a lower ID.

use super::file::FileProvider;
use super::forged::{DaemonSource, ForgedProvider};
use super::{CancelToken, Provider, Subscription, deliver};
use crate::config::ProviderConfig;
use crate::error::DataResult;
use crate::types::{
    AgentRecord, DmConversation, Message, MessageFilter, SearchQuery, SearchResult, SendRequest,
    SubscriptionFilter, TopicInfo,
};
use chrono::Utc;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, SyncSender, TryRecvError, sync_channel};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the relay wakes up to check cancellation and the switch timer
const RELAY_TICK: Duration = Duration::from_millis(50);

/// Something that can produce a live message stream
pub trait LiveSource: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Cheap reachability probe; must not block for long
    fn reachable(&self) -> bool;

    /// Start streaming messages matching `filter` until `cancel` fires
    fn open(&self, filter: SubscriptionFilter, cancel: &CancelToken) -> DataResult<Subscription>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    File,
    Forged,
}

struct Relay {
    forged: Arc<dyn LiveSource>,
    file: Arc<dyn LiveSource>,
    filter: SubscriptionFilter,
    interval: Duration,
    cancel: CancelToken,
    out: SyncSender<Message>,
    /// Highest ID delivered so far
    last_id: Option<String>,
    /// `last_id` at the time the active source was opened
    floor: Option<String>,
    started: chrono::DateTime<Utc>,
}

impl Relay {
    /// Filter for a (re)opened source: resume after the last delivered ID
    fn resume_filter(&self) -> SubscriptionFilter {
        let mut filter = self.filter.clone();
        match &self.last_id {
            Some(id) => {
                filter.since_id = Some(id.clone());
                filter.since = None;
            }
            None if filter.since_id.is_none() && filter.since.is_none() => {
                filter.since = Some(self.started);
            }
            None => {}
        }
        filter
    }

    fn source(&self, which: Active) -> &Arc<dyn LiveSource> {
        match which {
            Active::File => &self.file,
            Active::Forged => &self.forged,
        }
    }

    /// Open `which`, falling back to the file source if the daemon refuses
    fn open(&mut self, which: Active) -> Option<(Active, Subscription)> {
        self.floor = self.last_id.clone();
        let source = Arc::clone(self.source(which));
        match source.open(self.resume_filter(), &self.cancel) {
            Ok(sub) => {
                info!(source = source.name(), "live source active");
                Some((which, sub))
            }
            Err(e) if which == Active::Forged => {
                warn!(error = %e, "daemon stream unavailable, polling files");
                self.open(Active::File)
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "failed to open live source");
                None
            }
        }
    }

    /// Forward one message unless the active source replayed one from before it opened
    fn forward(&mut self, message: Message) -> bool {
        if self.floor.as_ref().is_some_and(|floor| message.id <= *floor) {
            return true;
        }
        let id = message.id.clone();
        if !deliver(&self.out, message, &self.cancel) {
            return false;
        }
        if self.last_id.as_ref().is_none_or(|last| id > *last) {
            self.last_id = Some(id);
        }
        true
    }

    /// Forward whatever the old source already produced
    fn drain(&mut self, old: &Subscription) -> bool {
        loop {
            match old.try_recv() {
                Ok(message) => {
                    if !self.forward(message) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn run(mut self) {
        let initial = if self.forged.reachable() {
            Active::Forged
        } else {
            Active::File
        };
        let mut current = self.open(initial);
        let mut last_check = Instant::now();

        while !self.cancel.is_cancelled() {
            let Some((active, sub)) = current.take() else {
                // Nothing could be opened; retry after the reconnect interval
                if self.cancel.wait_timeout(self.interval) {
                    break;
                }
                let which = if self.forged.reachable() {
                    Active::Forged
                } else {
                    Active::File
                };
                current = self.open(which);
                last_check = Instant::now();
                continue;
            };

            match sub.recv_timeout(RELAY_TICK) {
                Ok(message) => {
                    if !self.forward(message) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!(source = self.source(active).name(), "live source closed, falling back to files");
                    drop(sub);
                    current = self.open(Active::File);
                    last_check = Instant::now();
                    continue;
                }
            }

            if last_check.elapsed() >= self.interval {
                last_check = Instant::now();
                let want = if self.forged.reachable() {
                    Active::Forged
                } else {
                    Active::File
                };
                if want != active {
                    debug!(from = ?active, to = ?want, "switching live source");
                    sub.cancel();
                    if !self.drain(&sub) {
                        break;
                    }
                    drop(sub);
                    current = self.open(want);
                    continue;
                }
            }
            current = Some((active, sub));
        }
        debug!("relay stopped");
    }
}

/// Run a failover relay between a daemon source and the file source
pub fn spawn_relay(
    forged: Arc<dyn LiveSource>,
    file: Arc<dyn LiveSource>,
    filter: SubscriptionFilter,
    parent: &CancelToken,
    buffer: usize,
    interval: Duration,
) -> Subscription {
    let cancel = parent.child();
    let (tx, rx) = sync_channel(buffer.max(1));
    let relay = Relay {
        forged,
        file,
        last_id: filter.since_id.clone().filter(|s| !s.is_empty()),
        floor: None,
        filter,
        interval,
        cancel: cancel.clone(),
        out: tx,
        started: Utc::now(),
    };
    let spawned = thread::Builder::new()
        .name("fmail-relay".into())
        .spawn(move || relay.run());
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start relay thread");
    }
    Subscription::new(rx, cancel)
}

/// Reads from files, streams from the daemon when possible
pub struct HybridProvider {
    files: Arc<FileProvider>,
    forged: ForgedProvider,
    live: Option<(Arc<dyn LiveSource>, Arc<dyn LiveSource>)>,
}

impl HybridProvider {
    pub fn new(config: ProviderConfig) -> DataResult<Self> {
        let files = Arc::new(FileProvider::new(config)?);
        let forged = ForgedProvider::with_files(Arc::clone(&files));
        Ok(Self {
            files,
            forged,
            live: None,
        })
    }

    /// Replace the live sources (daemon first, then files)
    pub fn with_sources(mut self, forged: Arc<dyn LiveSource>, file: Arc<dyn LiveSource>) -> Self {
        self.live = Some((forged, file));
        self
    }

    pub fn files(&self) -> &FileProvider {
        &self.files
    }

    pub fn forged(&self) -> &ForgedProvider {
        &self.forged
    }

    fn sources(&self) -> (Arc<dyn LiveSource>, Arc<dyn LiveSource>) {
        match &self.live {
            Some((forged, file)) => (Arc::clone(forged), Arc::clone(file)),
            None => {
                let forged: Arc<DaemonSource> = self.forged.daemon();
                let file: Arc<FileProvider> = Arc::clone(&self.files);
                (forged as Arc<dyn LiveSource>, file as Arc<dyn LiveSource>)
            }
        }
    }
}

impl Provider for HybridProvider {
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
        let (forged, file) = self.sources();
        let config = self.files.config();
        spawn_relay(
            forged,
            file,
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
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn msg(n: usize) -> Message {
        Message {
            id: format!("20260101-000000-{:04}", n),
            from: "alice".into(),
            to: "task".into(),
            time: Utc::now(),
            body: json!(format!("m{}", n)),
            reply_to: String::new(),
            priority: String::new(),
            host: String::new(),
            tags: vec![],
        }
    }

    /// Replays a shared log; optionally closes after emitting `close_after` messages
    struct FakeSource {
        name: &'static str,
        log: Arc<Mutex<Vec<Message>>>,
        up: AtomicBool,
        close_after: Option<usize>,
        opens: AtomicUsize,
    }

    impl FakeSource {
        fn new(name: &'static str, log: Arc<Mutex<Vec<Message>>>, close_after: Option<usize>) -> Self {
            Self {
                name,
                log,
                up: AtomicBool::new(true),
                close_after,
                opens: AtomicUsize::new(0),
            }
        }
    }

    impl LiveSource for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn reachable(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn open(&self, filter: SubscriptionFilter, cancel: &CancelToken) -> DataResult<Subscription> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let cancel = cancel.child();
            let (tx, rx) = sync_channel(4);
            let log = Arc::clone(&self.log);
            let close_after = self.close_after;
            let token = cancel.clone();
            thread::spawn(move || {
                let mut last = filter.since_id.unwrap_or_default();
                let mut sent = 0;
                loop {
                    let pending: Vec<Message> = log
                        .lock()
                        .unwrap()
                        .iter()
                        .filter(|m| m.id > last)
                        .cloned()
                        .collect();
                    for m in pending {
                        if close_after.is_some_and(|n| sent >= n) {
                            return;
                        }
                        last = m.id.clone();
                        if !deliver(&tx, m, &token) {
                            return;
                        }
                        sent += 1;
                    }
                    if token.wait_timeout(Duration::from_millis(5)) {
                        return;
                    }
                }
            });
            Ok(Subscription::new(rx, cancel))
        }
    }

    fn collect(sub: &Subscription, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        while ids.len() < n {
            match sub.recv_timeout(Duration::from_secs(5)) {
                Ok(m) => ids.push(m.id),
                Err(_) => break,
            }
        }
        ids
    }

    #[test]
    fn test_stream_close_falls_back_without_gaps() {
        let log = Arc::new(Mutex::new((1..=10).map(msg).collect::<Vec<_>>()));
        let forged = Arc::new(FakeSource::new("forged", Arc::clone(&log), Some(4)));
        let file = Arc::new(FakeSource::new("file", Arc::clone(&log), None));

        let sub = spawn_relay(
            forged.clone(),
            file.clone(),
            SubscriptionFilter {
                since_id: Some("0".into()),
                ..Default::default()
            },
            &CancelToken::new(),
            8,
            Duration::from_secs(60),
        );
        let ids = collect(&sub, 10);
        let expected: Vec<String> = (1..=10).map(|n| msg(n).id).collect();
        assert_eq!(ids, expected);
        assert_eq!(file.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_switches_sources_without_repeats() {
        let log = Arc::new(Mutex::new((1..=3).map(msg).collect::<Vec<_>>()));
        let forged = Arc::new(FakeSource::new("forged", Arc::clone(&log), None));
        forged.up.store(false, Ordering::SeqCst);
        let file = Arc::new(FakeSource::new("file", Arc::clone(&log), None));

        let sub = spawn_relay(
            forged.clone(),
            file.clone(),
            SubscriptionFilter {
                since_id: Some("0".into()),
                ..Default::default()
            },
            &CancelToken::new(),
            8,
            Duration::from_millis(20),
        );
        let mut ids = collect(&sub, 3);

        forged.up.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        log.lock().unwrap().extend((4..=6).map(msg));
        ids.extend(collect(&sub, 3));

        forged.up.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        log.lock().unwrap().extend((7..=8).map(msg));
        ids.extend(collect(&sub, 2));

        let expected: Vec<String> = (1..=8).map(|n| msg(n).id).collect();
        assert_eq!(ids, expected);
        assert!(forged.opens.load(Ordering::SeqCst) >= 1);
        assert!(file.opens.load(Ordering::SeqCst) >= 2);
    }

    /// Emits a fixed sequence once, ignoring the resume point
    struct ScriptedSource(Vec<Message>);

    impl LiveSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn reachable(&self) -> bool {
            true
        }

        fn open(&self, _filter: SubscriptionFilter, cancel: &CancelToken) -> DataResult<Subscription> {
            let cancel = cancel.child();
            let (tx, rx) = sync_channel(8);
            let script = self.0.clone();
            let token = cancel.clone();
            thread::spawn(move || {
                for m in script {
                    if !deliver(&tx, m, &token) {
                        return;
                    }
                }
                token.wait_timeout(Duration::from_secs(60));
            });
            Ok(Subscription::new(rx, cancel))
        }
    }

    #[test]
    fn test_floor_only_drops_replayed_messages() {
        // 3 and 5 predate the resume point; 6 arriving after 7 comes from another directory
        let script = [3, 5, 7, 6, 8].into_iter().map(msg).collect();
        let forged = Arc::new(ScriptedSource(script));
        let file = Arc::new(FakeSource::new("file", Arc::new(Mutex::new(Vec::new())), None));

        let sub = spawn_relay(
            forged,
            file,
            SubscriptionFilter {
                since_id: Some(msg(5).id),
                ..Default::default()
            },
            &CancelToken::new(),
            8,
            Duration::from_secs(60),
        );
        let ids = collect(&sub, 3);
        let expected: Vec<String> = [7, 6, 8].into_iter().map(|n| msg(n).id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_cancel_ends_stream() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let forged = Arc::new(FakeSource::new("forged", Arc::clone(&log), None));
        let file = Arc::new(FakeSource::new("file", log, None));
        let parent = CancelToken::new();
        let sub = spawn_relay(
            forged,
            file,
            SubscriptionFilter::default(),
            &parent,
            1,
            Duration::from_secs(1),
        );
        parent.cancel();
        assert!(sub.recv().is_none());
    }
}

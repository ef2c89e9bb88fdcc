//! Data providers for the dashboard
//!
//! - [`FileProvider`] - answers everything from the on-disk store, polls for live updates
//! - [`ForgedProvider`] - streams live updates from the `forged` daemon when it is up
//! - [`HybridProvider`] - switches the live source between the two without gaps or repeats
//!
//! All three implement [`Provider`]; live updates arrive on a [`Subscription`].

pub mod file;
pub mod forged;
pub mod hybrid;
pub mod poll;

pub use file::FileProvider;
pub use forged::ForgedProvider;
pub use hybrid::{HybridProvider, LiveSource, spawn_relay};

use crate::error::DataResult;
use crate::types::{
    AgentRecord, DmConversation, Message, MessageFilter, SearchQuery, SearchResult, SendRequest,
    SubscriptionFilter, TopicInfo,
};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Read, search, send and subscribe operations the dashboard needs
pub trait Provider: Send + Sync {
    /// All topic summaries, sorted by name
    fn topics(&self) -> DataResult<Vec<TopicInfo>>;

    /// Messages of one topic in ID order
    fn messages(&self, topic: &str, filter: &MessageFilter) -> DataResult<Vec<Message>>;

    /// Conversations of `agent`, most recently active first
    fn dm_conversations(&self, agent: &str) -> DataResult<Vec<DmConversation>>;

    /// The conversation between the viewer and `agent`, in ID order
    fn dms(&self, agent: &str, filter: &MessageFilter) -> DataResult<Vec<Message>>;

    fn agents(&self) -> DataResult<Vec<AgentRecord>>;

    fn search(&self, query: &SearchQuery) -> DataResult<Vec<SearchResult>>;

    /// Store a message and return it with its assigned ID
    fn send(&self, request: &SendRequest) -> DataResult<Message>;

    /// Start a live subscription that also ends when `parent` is cancelled
    fn subscribe_with(&self, filter: SubscriptionFilter, parent: &CancelToken) -> Subscription;

    fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.subscribe_with(filter, &CancelToken::new())
    }
}

struct CancelState {
    cancelled: Mutex<bool>,
    signal: Condvar,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            signal: Condvar::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        {
            let mut cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.signal.notify_all();

        let children: Vec<Weak<CancelState>> = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cooperative cancellation shared between a subscriber and its background loop.
///
/// Cancelling a token also cancels every token derived from it with
/// [`child`](Self::child).
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState::new()),
        }
    }

    /// A token cancelled together with this one (but not the other way round)
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        self.state
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&child.state));
        // Parent may have been cancelled before the child was registered
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Sleep up to `timeout`, waking early on cancellation.
    /// Returns true when the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .state
            .signal
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Receiving end of a live subscription. Dropping it cancels the background loop.
pub struct Subscription {
    receiver: Receiver<Message>,
    cancel: CancelToken,
}

impl Subscription {
    pub fn new(receiver: Receiver<Message>, cancel: CancelToken) -> Self {
        Self { receiver, cancel }
    }

    /// Block for the next message; `None` once the stream has ended
    pub fn recv(&self) -> Option<Message> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Message, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Message, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Handle that stops this subscription from another thread
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn iter(&self) -> impl Iterator<Item = Message> + '_ {
        self.receiver.iter()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll interval while waiting for room in a full delivery channel
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(10);

/// Push one message, waiting while the channel is full.
/// Returns false when the subscriber is gone or the token was cancelled.
pub(crate) fn deliver(out: &SyncSender<Message>, message: Message, cancel: &CancelToken) -> bool {
    let mut pending = message;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match out.try_send(pending) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(back)) => {
                pending = back;
                if cancel.wait_timeout(BACKPRESSURE_RETRY) {
                    return false;
                }
            }
        }
    }
}

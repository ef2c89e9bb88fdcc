//! # fmail-data - dashboard data layer for fmail
//!
//! fmail stores every message as one JSON file under `.fmail/topics/<topic>/`
//! or `.fmail/dm/<agent>/`. This crate answers the dashboard's questions about
//! that store quickly and keeps it up to date live.
//!
//! ## Architecture
//!
//! - [`store`] - the on-disk mailbox (IDs, names, read/write)
//! - [`cache`] - LRU of parsed message files plus TTL result entries
//! - [`index`] - per-directory metadata summaries and the inverted text index
//! - [`query`] - filters, DM peer resolution and ID-range windowing
//! - [`provider`] - the [`Provider`] trait and its file, daemon and hybrid implementations
//! - [`daemon`] - client for the `forged` watch stream
//! - [`output`] - terminal rendering for the CLI
//!
//! ## Quick Start
//!
//! ```ignore
//! use fmail_data::{FileProvider, MessageFilter, Provider, SearchQuery};
//!
//! let provider = FileProvider::open("/path/to/project/.fmail")?;
//! for topic in provider.topics()? {
//!     println!("{} ({} messages)", topic.name, topic.message_count);
//! }
//!
//! let recent = provider.messages("task", &MessageFilter { limit: 20, ..Default::default() })?;
//! let hits = provider.search(&SearchQuery { text: "deploy".into(), ..Default::default() })?;
//! ```
//!
//! ## Performance
//!
//! Repeated queries are served from three layers before touching the disk:
//!
//! 1. **Result caches** - short TTL, invalidated on send
//! 2. **Directory metadata** - refreshed only when a directory's mtime changes
//! 3. **Message cache** - parsed files keyed by path and modification time
//!
//! Text search walks an inverted token index that is updated incrementally
//! for the directories that changed.

pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod index;
pub mod output;
pub mod provider;
pub mod query;
pub mod store;
pub mod types;
pub mod utils;

pub use config::ProviderConfig;
pub use error::{DataError, DataResult};
pub use provider::{
    CancelToken, FileProvider, ForgedProvider, HybridProvider, Provider, Subscription,
};
pub use store::MailStore;
pub use types::{
    AgentRecord, DmConversation, Message, MessageFilter, SearchQuery, SearchResult, SendRequest,
    SubscriptionFilter, TopicInfo,
};

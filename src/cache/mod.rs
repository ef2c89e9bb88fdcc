//! In-memory caches shared by the providers
//!
//! - [`MessageCache`] - bounded LRU of parsed messages, keyed by file identity
//! - [`TimedEntry`] - TTL wrapper for short-lived query results
//! - [`CachedReader`] - stat + read-through helper combining the store and cache

mod message_cache;
mod timed;

pub use message_cache::{DEFAULT_MESSAGE_CACHE_SIZE, MessageCache};
pub use timed::TimedEntry;

use crate::error::{DataError, DataResult};
use crate::store::MailStore;
use crate::types::Message;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Modification time of a path, or `None` when it does not exist
pub fn modified_time(path: &Path) -> DataResult<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => meta
            .modified()
            .map(Some)
            .map_err(|e| DataError::io(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DataError::io(path, e)),
    }
}

/// Reads message files through the shared [`MessageCache`]
#[derive(Clone, Copy)]
pub struct CachedReader<'a> {
    store: &'a MailStore,
    cache: &'a MessageCache,
}

impl<'a> CachedReader<'a> {
    pub fn new(store: &'a MailStore, cache: &'a MessageCache) -> Self {
        Self { store, cache }
    }

    /// Read a file whose modification time is already known.
    /// A file that vanished before it could be read yields `None`.
    pub fn read_at(&self, path: &Path, modified: SystemTime) -> DataResult<Option<Message>> {
        if let Some(message) = self.cache.get(path, modified) {
            return Ok(Some(message));
        }
        match self.store.read_message(path) {
            Ok(message) => {
                self.cache.put(path, modified, &message);
                Ok(Some(message))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stat then read; `None` when the file is gone
    pub fn read(&self, path: &Path) -> DataResult<Option<Message>> {
        match modified_time(path)? {
            Some(modified) => self.read_at(path, modified),
            None => Ok(None),
        }
    }
}

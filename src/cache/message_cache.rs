use crate::types::Message;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// Capacity used when the configured one is zero
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 4096;

struct CachedMessage {
    modified: SystemTime,
    message: Message,
}

/// Bounded LRU of parsed messages keyed by file path and modification time
///
/// An entry is only served while the file's modification time matches the
/// one it was stored with. Every `get` and `put` reorders the recency list.
pub struct MessageCache {
    entries: Mutex<LruCache<PathBuf, CachedMessage>>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_MESSAGE_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached message for `path` if it was stored with exactly `modified`
    pub fn get(&self, path: &Path, modified: SystemTime) -> Option<Message> {
        let mut entries = self.lock();
        match entries.get(path) {
            Some(entry) if entry.modified == modified => return Some(entry.message.clone()),
            Some(_) => {}
            None => return None,
        }
        // Stale: the file changed since it was cached
        entries.pop(path);
        None
    }

    /// Insert or refresh an entry and mark it most recently used
    pub fn put(&self, path: &Path, modified: SystemTime, message: &Message) {
        self.lock().put(
            path.to_path_buf(),
            CachedMessage {
                modified,
                message: message.clone(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<PathBuf, CachedMessage>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn msg(id: &str) -> Message {
        Message {
            id: id.into(),
            from: "alice".into(),
            to: "task".into(),
            time: Utc::now(),
            body: json!("body"),
            reply_to: String::new(),
            priority: String::new(),
            host: String::new(),
            tags: vec!["x".into()],
        }
    }

    #[test]
    fn test_hit_requires_matching_mtime() {
        let cache = MessageCache::new(4);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_secs(1);
        let path = Path::new("/store/topics/task/a.json");

        cache.put(path, t0, &msg("a"));
        assert_eq!(cache.get(path, t0).unwrap().id, "a");

        // Modified file misses and evicts the stale entry
        assert!(cache.get(path, t1).is_none());
        assert!(cache.get(path, t0).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_keeps_recently_touched() {
        let cache = MessageCache::new(2);
        let t = SystemTime::UNIX_EPOCH;
        let (a, b, c) = (Path::new("a"), Path::new("b"), Path::new("c"));

        cache.put(a, t, &msg("a"));
        cache.put(b, t, &msg("b"));
        // Touch `a` so `b` becomes least recently used
        assert!(cache.get(a, t).is_some());
        cache.put(c, t, &msg("c"));

        assert!(cache.get(a, t).is_some());
        assert!(cache.get(b, t).is_none());
        assert!(cache.get(c, t).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_returned_values_are_independent_copies() {
        let cache = MessageCache::new(2);
        let t = SystemTime::UNIX_EPOCH;
        let path = Path::new("a");
        cache.put(path, t, &msg("a"));

        let mut first = cache.get(path, t).unwrap();
        first.tags.push("mutated".into());
        assert_eq!(cache.get(path, t).unwrap().tags, vec!["x"]);
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let cache = MessageCache::new(0);
        assert_eq!(cache.capacity(), DEFAULT_MESSAGE_CACHE_SIZE);
    }
}

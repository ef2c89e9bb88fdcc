//! Incremental per-directory summaries
//!
//! A [`DirSnapshot`] remembers, for one topic or DM inbox, the directory
//! mtime when it was last checked and the metadata of every message file.
//! Refreshing a stale snapshot lists the directory again but only parses the
//! files whose `(name, mtime)` pair is new; everything else is carried over.
//! The summary (count, participants, last message) is always recomputed from
//! the per-file map, never from disk.

use crate::cache::{CachedReader, modified_time};
use crate::error::DataResult;
use crate::store::list_message_files;
use crate::types::Message;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// What the index keeps about one message file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub id: String,
    pub from: String,
    pub to: String,
    pub activity: DateTime<Utc>,
    pub modified: SystemTime,
    pub message: Message,
}

impl FileMetadata {
    fn new(modified: SystemTime, message: Message) -> Self {
        Self {
            id: message.id.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            activity: message.time,
            modified,
            message,
        }
    }
}

/// Aggregate view of one directory
#[derive(Debug, Clone, Default)]
pub struct DirSummary {
    pub count: usize,
    /// Sorted, deduplicated senders
    pub participants: Vec<String>,
    /// Most recent message by `(id, file name)`
    pub last_message: Option<Message>,
}

impl DirSummary {
    fn from_files(files: &BTreeMap<String, FileMetadata>) -> Self {
        let participants: BTreeSet<&str> = files
            .values()
            .map(|f| f.from.as_str())
            .filter(|f| !f.is_empty())
            .collect();
        let last = files
            .iter()
            .max_by(|(name_a, a), (name_b, b)| (&a.id, name_a).cmp(&(&b.id, name_b)))
            .map(|(_, f)| f.message.clone());

        Self {
            count: files.len(),
            participants: participants.into_iter().map(str::to_string).collect(),
            last_message: last,
        }
    }
}

/// Cached state of one directory
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    /// Directory mtime at the last check; `None` when it did not exist
    pub dir_modified: Option<SystemTime>,
    pub checked_at: SystemTime,
    /// Keyed by file name, so iteration is in ID order
    pub files: BTreeMap<String, FileMetadata>,
    pub summary: DirSummary,
}

impl DirSnapshot {
    pub fn empty() -> Self {
        Self {
            dir_modified: None,
            checked_at: SystemTime::UNIX_EPOCH,
            files: BTreeMap::new(),
            summary: DirSummary::default(),
        }
    }

    /// Fresh while younger than `ttl` and the directory looks the same:
    /// either its mtime is unchanged, or it is still absent and we hold no files.
    pub fn is_fresh(&self, current: Option<SystemTime>, now: SystemTime, ttl: Duration) -> bool {
        let within_ttl = now
            .duration_since(self.checked_at)
            .map(|age| age < ttl)
            .unwrap_or(false);
        if !within_ttl {
            return false;
        }
        match current {
            None => self.dir_modified.is_none() && self.files.is_empty(),
            Some(mtime) => self.dir_modified == Some(mtime),
        }
    }

    /// Messages in ID order, deep-copied
    pub fn messages(&self) -> Vec<Message> {
        self.files.values().map(|f| f.message.clone()).collect()
    }
}

/// Rebuild a directory snapshot, reusing unchanged per-file entries from `prev`.
///
/// Files that vanish between listing and reading are skipped. Any other read
/// or parse failure is returned.
pub fn refresh_dir(
    dir: &Path,
    prev: Option<&DirSnapshot>,
    reader: CachedReader<'_>,
    now: SystemTime,
) -> DataResult<DirSnapshot> {
    let dir_modified = modified_time(dir)?;
    let names = list_message_files(dir)?;

    let mut files = BTreeMap::new();
    let mut changed: Vec<(String, PathBuf, SystemTime)> = Vec::new();
    for name in names {
        let path = dir.join(&name);
        let Some(modified) = modified_time(&path)? else {
            continue;
        };
        match prev.and_then(|p| p.files.get(&name)) {
            Some(meta) if meta.modified == modified => {
                files.insert(name, meta.clone());
            }
            _ => changed.push((name, path, modified)),
        }
    }

    let reused = files.len();
    let parsed: Vec<(String, FileMetadata)> = changed
        .par_iter()
        .map(|(name, path, modified)| {
            reader
                .read_at(path, *modified)
                .map(|m| m.map(|m| (name.clone(), FileMetadata::new(*modified, m))))
        })
        .collect::<DataResult<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    debug!(
        dir = %dir.display(),
        reused,
        parsed = parsed.len(),
        "refreshed directory metadata"
    );
    files.extend(parsed);

    let summary = DirSummary::from_files(&files);
    Ok(DirSnapshot {
        dir_modified,
        checked_at: now,
        files,
        summary,
    })
}

/// Snapshots for every topic (`name`) and DM inbox (`@agent`) seen so far
#[derive(Debug, Default)]
pub struct DirectoryMetadataIndex {
    snapshots: HashMap<String, Arc<DirSnapshot>>,
}

impl DirectoryMetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: &str) -> Option<Arc<DirSnapshot>> {
        self.snapshots.get(target).cloned()
    }

    pub fn install(&mut self, target: &str, snapshot: Arc<DirSnapshot>) {
        self.snapshots.insert(target.to_string(), snapshot);
    }

    /// Force the next lookup of `target` to re-check its directory.
    /// Per-file entries are kept so unchanged files are not re-read.
    pub fn invalidate(&mut self, target: &str) {
        if let Some(snapshot) = self.snapshots.get_mut(target) {
            Arc::make_mut(snapshot).checked_at = SystemTime::UNIX_EPOCH;
        }
    }

    pub fn invalidate_all(&mut self) {
        for snapshot in self.snapshots.values_mut() {
            Arc::make_mut(snapshot).checked_at = SystemTime::UNIX_EPOCH;
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

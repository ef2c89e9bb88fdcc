//! On-disk mailbox store
//!
//! One JSON file per message:
//!
//! ```text
//! <root>/topics/<topic>/<id>.json
//! <root>/dm/<agent>/<id>.json      (stored under the recipient)
//! <root>/agents/<name>.json
//! ```
//!
//! Writes are exclusive-create, so a file whose modification time has not
//! changed is known to hold the same message. Everything above this module
//! relies on that.

pub mod id;
pub mod names;

pub use id::{IdGenerator, file_stem, lower_bound, upper_bound};
pub use names::{
    Target, normalize_agent_name, normalize_target, normalize_topic, validate_agent_name,
    validate_priority, validate_tags, validate_topic,
};

use crate::error::{DataError, DataResult};
use crate::types::{AgentRecord, Message};
use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Largest accepted serialized message
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

const TOPICS_DIR: &str = "topics";
const DM_DIR: &str = "dm";
const AGENTS_DIR: &str = "agents";

/// Attempts before giving up on finding a free ID
const MAX_ID_ATTEMPTS: usize = 1000;

/// File-per-message store rooted at a `.fmail` directory
#[derive(Debug)]
pub struct MailStore {
    root: PathBuf,
    ids: IdGenerator,
    reads: AtomicU64,
}

impl MailStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ids: IdGenerator::new(),
            reads: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and its fixed subdirectories
    pub fn ensure_root(&self) -> DataResult<()> {
        for dir in [TOPICS_DIR, DM_DIR, AGENTS_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).map_err(|e| DataError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn topics_root(&self) -> PathBuf {
        self.root.join(TOPICS_DIR)
    }

    pub fn dm_root(&self) -> PathBuf {
        self.root.join(DM_DIR)
    }

    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        self.topics_root().join(topic)
    }

    pub fn dm_dir(&self, agent: &str) -> PathBuf {
        self.dm_root().join(agent)
    }

    /// Directory for a target name: `@agent` maps to a DM inbox, anything else to a topic
    pub fn target_dir(&self, target: &str) -> PathBuf {
        match target.strip_prefix('@') {
            Some(agent) => self.dm_dir(agent),
            None => self.topic_dir(target),
        }
    }

    /// Number of message files parsed so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write a message, assigning its ID (and time when unset). Returns the ID.
    pub fn save_message(&self, message: &Message) -> DataResult<String> {
        self.store_message(message).map(|stored| stored.id)
    }

    /// Like [`save_message`](Self::save_message) but returns the stored message
    pub fn store_message(&self, message: &Message) -> DataResult<Message> {
        let dir = match normalize_target(&message.to)? {
            Target::Topic(topic) => self.topic_dir(&topic),
            Target::Agent(agent) => self.dm_dir(&agent),
        };
        fs::create_dir_all(&dir).map_err(|e| DataError::io(&dir, e))?;

        let mut message = message.clone();
        let now = Utc::now();
        if message.time.timestamp() == 0 {
            message.time = now;
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            message.id = self.ids.next(now);
            let payload = serde_json::to_vec_pretty(&message).map_err(|e| DataError::Parse {
                path: dir.clone(),
                source: e,
            })?;
            if payload.len() > MAX_MESSAGE_SIZE {
                return Err(DataError::invalid(
                    "body",
                    format!("message exceeds {} bytes", MAX_MESSAGE_SIZE),
                ));
            }

            let final_path = dir.join(format!("{}.json", message.id));
            let tmp_path = dir.join(format!(".{}.json.tmp", message.id));
            write_file(&tmp_path, &payload).map_err(|e| DataError::io(&tmp_path, e))?;

            // hard_link fails if the target exists, which makes publication exclusive
            let linked = fs::hard_link(&tmp_path, &final_path);
            let _ = fs::remove_file(&tmp_path);
            match linked {
                Ok(()) => {
                    debug!(id = %message.id, to = %message.to, "saved message");
                    return Ok(message);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(DataError::io(&final_path, e)),
            }
        }

        Err(DataError::io(
            &dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "no free message id"),
        ))
    }

    /// Parse one message file
    pub fn read_message(&self, path: &Path) -> DataResult<Message> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = fs::read(path).map_err(|e| DataError::io(path, e))?;
        serde_json::from_slice(&data).map_err(|e| DataError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Topic directory names, sorted
    pub fn list_topics(&self) -> DataResult<Vec<String>> {
        list_subdirs(&self.topics_root())
    }

    /// Agents that own a DM inbox directory, sorted
    pub fn list_dm_owners(&self) -> DataResult<Vec<String>> {
        list_subdirs(&self.dm_root())
    }

    /// All agent records, sorted by name
    pub fn list_agent_records(&self) -> DataResult<Vec<AgentRecord>> {
        let dir = self.root.join(AGENTS_DIR);
        let mut records = Vec::new();
        for name in list_message_files(&dir)? {
            let path = dir.join(&name);
            let data = match fs::read(&path) {
                Ok(d) => d,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DataError::io(&path, e)),
            };
            let record: AgentRecord =
                serde_json::from_slice(&data).map_err(|e| DataError::Parse { path, source: e })?;
            records.push(record);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Create or refresh an agent record's `last_seen`
    pub fn touch_agent(&self, name: &str, host: &str) -> DataResult<AgentRecord> {
        let name = normalize_agent_name(name);
        validate_agent_name(&name)?;
        let dir = self.root.join(AGENTS_DIR);
        fs::create_dir_all(&dir).map_err(|e| DataError::io(&dir, e))?;

        let path = dir.join(format!("{}.json", name));
        let now = Utc::now();
        let mut record = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<AgentRecord>(&data).map_err(|e| {
                DataError::Parse {
                    path: path.clone(),
                    source: e,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => AgentRecord {
                name: name.clone(),
                host: String::new(),
                status: String::new(),
                first_seen: now,
                last_seen: now,
            },
            Err(e) => return Err(DataError::io(&path, e)),
        };
        record.last_seen = now;
        if !host.is_empty() {
            record.host = host.to_string();
        }

        let payload = serde_json::to_vec_pretty(&record).map_err(|e| DataError::Parse {
            path: path.clone(),
            source: e,
        })?;
        let tmp_path = dir.join(format!(".{}.json.tmp", name));
        write_file(&tmp_path, &payload).map_err(|e| DataError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| DataError::io(&path, e))?;
        Ok(record)
    }
}

fn write_file(path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(payload)?;
    file.sync_all()
}

/// Sorted names of the `.json` files in a directory; a missing directory is empty
pub fn list_message_files(dir: &Path) -> DataResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DataError::io(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DataError::io(dir, e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_message_file(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Message files end in `.json`; hidden temp files are skipped
pub fn is_message_file(name: &str) -> bool {
    name.ends_with(".json") && !name.starts_with('.')
}

fn list_subdirs(dir: &Path) -> DataResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DataError::io(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DataError::io(dir, e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn message(from: &str, to: &str, body: &str) -> Message {
        Message {
            id: String::new(),
            from: from.into(),
            to: to.into(),
            time: Utc::now(),
            body: json!(body),
            reply_to: String::new(),
            priority: String::new(),
            host: String::new(),
            tags: vec![],
        }
    }

    #[test]
    fn test_save_and_read_topic_message() {
        let dir = TempDir::new().unwrap();
        let store = MailStore::new(dir.path());
        store.ensure_root().unwrap();

        let id = store.save_message(&message("alice", "task", "hi")).unwrap();
        let path = store.topic_dir("task").join(format!("{}.json", id));
        let read = store.read_message(&path).unwrap();

        assert_eq!(read.id, id);
        assert_eq!(read.body_text(), "hi");
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.list_topics().unwrap(), vec!["task"]);
    }

    #[test]
    fn test_dm_lands_in_recipient_dir() {
        let dir = TempDir::new().unwrap();
        let store = MailStore::new(dir.path());

        let id = store.save_message(&message("alice", "@Bob", "psst")).unwrap();
        let names = list_message_files(&store.dm_dir("bob")).unwrap();
        assert_eq!(names, vec![format!("{}.json", id)]);
        assert_eq!(store.list_dm_owners().unwrap(), vec!["bob"]);
        assert_eq!(store.target_dir("@bob"), store.dm_dir("bob"));
    }

    #[test]
    fn test_ids_increase_and_files_sort() {
        let dir = TempDir::new().unwrap();
        let store = MailStore::new(dir.path());
        let ids: Vec<String> = (0..5)
            .map(|i| store.save_message(&message("a", "t", &i.to_string())).unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let names = list_message_files(&store.topic_dir("t")).unwrap();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_missing_dir_lists_empty() {
        let dir = TempDir::new().unwrap();
        let store = MailStore::new(dir.path().join("nope"));
        assert!(store.list_topics().unwrap().is_empty());
        assert!(list_message_files(&store.topic_dir("x")).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_invalid_target() {
        let dir = TempDir::new().unwrap();
        let store = MailStore::new(dir.path());
        let err = store.save_message(&message("a", "Bad Topic", "x")).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_touch_agent_keeps_first_seen() {
        let dir = TempDir::new().unwrap();
        let store = MailStore::new(dir.path());
        let first = store.touch_agent("Alice", "box1").unwrap();
        let second = store.touch_agent("alice", "").unwrap();

        assert_eq!(first.first_seen, second.first_seen);
        assert_eq!(second.host, "box1");
        let records = store.list_agent_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "alice");
    }
}

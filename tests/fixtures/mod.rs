//! Shared helpers for integration tests: a throwaway mailbox on disk
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use fmail_data::{FileProvider, Message, ProviderConfig};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Base time for fixture message IDs
pub fn time_at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 18, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
}

/// ID of the `seq`-th message written `secs` seconds after the base time
pub fn id_at(secs: u32, seq: u32) -> String {
    format!("{}-{:04}", time_at(secs).format("%Y%m%d-%H%M%S"), seq)
}

pub struct Mailbox {
    pub dir: TempDir,
    /// Store root (`<project>/.fmail`)
    pub root: PathBuf,
}

impl Mailbox {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path().join(".fmail");
        fs::create_dir_all(&root).expect("mailbox root");
        Self { dir, root }
    }

    /// Config with long cache lifetimes and fast polling
    pub fn config(&self) -> ProviderConfig {
        ProviderConfig {
            root: Some(self.root.clone()),
            cache_ttl: Duration::from_secs(60),
            metadata_ttl: Duration::from_secs(60),
            poll_min: Duration::from_millis(10),
            poll_max: Duration::from_millis(40),
            reconnect_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn provider(&self) -> FileProvider {
        FileProvider::new(self.config()).expect("provider")
    }

    /// Write a message file directly, the way another process would
    pub fn write(&self, dir: &str, id: &str, from: &str, to: &str, body: &str) -> Message {
        let secs = &id[..15];
        let time = DateTime::parse_from_str(&format!("{} +0000", secs), "%Y%m%d-%H%M%S %z")
            .expect("id time")
            .with_timezone(&Utc);
        let message = Message {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            time,
            body: json!(body),
            reply_to: String::new(),
            priority: "normal".to_string(),
            host: String::new(),
            tags: vec![],
        };
        let path = self.root.join(dir);
        fs::create_dir_all(&path).expect("message dir");
        fs::write(
            path.join(format!("{}.json", id)),
            serde_json::to_vec_pretty(&message).expect("encode"),
        )
        .expect("write message");
        message
    }

    pub fn write_topic(&self, topic: &str, id: &str, from: &str, body: &str) -> Message {
        self.write(&format!("topics/{}", topic), id, from, topic, body)
    }

    /// DM stored in `owner`'s inbox
    pub fn write_dm(&self, owner: &str, id: &str, from: &str, to: &str, body: &str) -> Message {
        self.write(&format!("dm/{}", owner), id, from, to, body)
    }
}

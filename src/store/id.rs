//! Message ID generation and time-to-ID bounds
//!
//! IDs look like `20260118-093012-0007`: the UTC second the message was
//! written followed by a per-second sequence number. Because the prefix is
//! fixed-width, lexicographic order of IDs is chronological order, which lets
//! range queries binary-search file names instead of reading files.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

const PREFIX_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Sorts after every sequence suffix of the same second
const UPPER_SENTINEL: char = '~';

/// ID prefix for the second containing `time`
pub fn time_prefix(time: DateTime<Utc>) -> String {
    time.format(PREFIX_FORMAT).to_string()
}

/// Smallest string that sorts at or before every ID written at or after `time`
pub fn lower_bound(time: DateTime<Utc>) -> String {
    time_prefix(time)
}

/// Largest string that sorts at or after every ID written at or before `time`
pub fn upper_bound(time: DateTime<Utc>) -> String {
    let mut bound = time_prefix(time);
    bound.push(UPPER_SENTINEL);
    bound
}

/// Format a full ID
pub fn format_id(time: DateTime<Utc>, seq: u32) -> String {
    format!("{}-{:04}", time_prefix(time), seq)
}

/// Strip the `.json` extension from a message file name
pub fn file_stem(name: &str) -> &str {
    name.strip_suffix(".json").unwrap_or(name)
}

/// Issues monotonically increasing IDs within this process
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<(String, u32)>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next ID for a message written at `time`
    pub fn next(&self, time: DateTime<Utc>) -> String {
        let prefix = time_prefix(time);
        let mut last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // A clock step backwards keeps issuing under the newer prefix
        if prefix > last.0 {
            *last = (prefix, 1);
        } else {
            last.1 += 1;
        }
        format!("{}-{:04}", last.0, last.1)
    }
}

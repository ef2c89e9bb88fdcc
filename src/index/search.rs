//! Incremental inverted index over message bodies
//!
//! Postings map a token to `(target, position)` pairs, where position indexes
//! the target's ID-ordered message list. Targets are rebuilt one at a time:
//! their postings are removed as a unit, re-inserted from the new message
//! list, and only the tokens touched by the refresh are re-sorted.
//!
//! A query token matches every indexed token that contains it, so an indexed
//! search returns exactly what a linear case-insensitive substring scan
//! returns. Containing tokens are found through a trigram map over the
//! vocabulary; query tokens shorter than a trigram walk the vocabulary.
//! Queries without any alphanumeric token fall back to the scan.

use crate::error::DataResult;
use crate::query::{find_substring, matches_search_attributes};
use crate::types::{Message, SearchQuery, SearchResult};
use crate::utils::{extract_tokens, tokenize_query};
use ahash::{AHashMap, AHashSet};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::debug;

/// One occurrence of a token
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Posting {
    pub target: Arc<str>,
    pub position: u32,
}

#[derive(Debug)]
struct TargetEntry {
    name: Arc<str>,
    messages: Vec<Message>,
    tokens: Vec<String>,
    dir_modified: Option<SystemTime>,
    /// IDs that some message in this target replies to, computed on first use
    replied: Option<HashSet<String>>,
}

/// Content of one target as loaded from the store
#[derive(Debug, Clone)]
pub struct LoadedTarget {
    /// ID-ordered messages
    pub messages: Vec<Message>,
    pub dir_modified: Option<SystemTime>,
}

/// Token index across all topics and DM inboxes
#[derive(Debug, Default)]
pub struct TextSearchIndex {
    targets: HashMap<String, TargetEntry>,
    postings: AHashMap<String, Vec<Posting>>,
    /// Trigram -> indexed tokens containing it
    grams: AHashMap<[u8; 3], AHashSet<String>>,
    dirty: BTreeSet<String>,
    last_drift_check: Option<Instant>,
}

impl TextSearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a target for rebuild on the next refresh
    pub fn mark_dirty(&mut self, target: &str) {
        self.dirty.insert(target.to_string());
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn token_count(&self) -> usize {
        self.postings.len()
    }

    pub fn gram_count(&self) -> usize {
        self.grams.len()
    }

    pub fn is_indexed(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    /// Time of the last drift check, `None` before the first one
    pub fn last_drift_check(&self) -> Option<Instant> {
        self.last_drift_check
    }

    /// Compare stored directory mtimes against `current` (target -> mtime)
    /// and mark every target that changed, appeared or disappeared.
    /// Returns how many targets were marked.
    pub fn detect_drift(&mut self, current: &HashMap<String, Option<SystemTime>>) -> usize {
        let mut marked = Vec::new();
        for (target, mtime) in current {
            match self.targets.get(target) {
                Some(entry) if entry.dir_modified == *mtime => {}
                _ => marked.push(target.clone()),
            }
        }
        for target in self.targets.keys() {
            if !current.contains_key(target) {
                marked.push(target.clone());
            }
        }
        self.last_drift_check = Some(Instant::now());

        let count = marked.len();
        self.dirty.extend(marked);
        if count > 0 {
            debug!(count, "search index drift detected");
        }
        count
    }

    /// Rebuild every dirty target.
    ///
    /// `load` returns the target's current content, or `None` when it no
    /// longer exists. On error the failing target and all not yet processed
    /// ones stay dirty.
    pub fn refresh<F>(&mut self, mut load: F) -> DataResult<usize>
    where
        F: FnMut(&str) -> DataResult<Option<LoadedTarget>>,
    {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let pending: Vec<String> = std::mem::take(&mut self.dirty).into_iter().collect();
        let mut touched: AHashSet<String> = AHashSet::new();
        let mut rebuilt = 0;

        for (i, target) in pending.iter().enumerate() {
            let loaded = match load(target) {
                Ok(loaded) => loaded,
                Err(e) => {
                    self.dirty.extend(pending[i..].iter().cloned());
                    self.normalize_postings(&touched);
                    return Err(e);
                }
            };
            self.remove_target(target, &mut touched);
            if let Some(loaded) = loaded {
                self.insert_target(target, loaded, &mut touched);
            }
            rebuilt += 1;
        }

        self.normalize_postings(&touched);
        debug!(
            targets = rebuilt,
            tokens = touched.len(),
            "search index refreshed"
        );
        Ok(rebuilt)
    }

    fn remove_target(&mut self, target: &str, touched: &mut AHashSet<String>) {
        let Some(entry) = self.targets.remove(target) else {
            return;
        };
        for token in entry.tokens {
            if let Some(list) = self.postings.get_mut(&token) {
                list.retain(|p| &*p.target != target);
                if list.is_empty() {
                    self.postings.remove(&token);
                    self.drop_grams(&token);
                }
            }
            touched.insert(token);
        }
    }

    fn insert_target(&mut self, target: &str, loaded: LoadedTarget, touched: &mut AHashSet<String>) {
        let name: Arc<str> = Arc::from(target);
        let mut target_tokens: HashSet<String> = HashSet::new();

        for (position, message) in loaded.messages.iter().enumerate() {
            for token in extract_tokens(&message.body_text()) {
                let list = self.postings.entry(token.clone()).or_default();
                let is_new = list.is_empty();
                list.push(Posting {
                    target: Arc::clone(&name),
                    position: position as u32,
                });
                if is_new {
                    self.add_grams(&token);
                }
                target_tokens.insert(token);
            }
        }

        touched.extend(target_tokens.iter().cloned());
        self.targets.insert(
            target.to_string(),
            TargetEntry {
                name,
                messages: loaded.messages,
                tokens: target_tokens.into_iter().collect(),
                dir_modified: loaded.dir_modified,
                replied: None,
            },
        );
    }

    /// Sort and dedup only the postings lists changed by a refresh
    fn normalize_postings(&mut self, touched: &AHashSet<String>) {
        for token in touched {
            if let Some(list) = self.postings.get_mut(token) {
                list.sort();
                list.dedup();
            }
        }
    }

    fn add_grams(&mut self, token: &str) {
        for gram in trigrams(token) {
            self.grams.entry(gram).or_default().insert(token.to_string());
        }
    }

    fn drop_grams(&mut self, token: &str) {
        for gram in trigrams(token) {
            if let Some(tokens) = self.grams.get_mut(&gram) {
                tokens.remove(token);
                if tokens.is_empty() {
                    self.grams.remove(&gram);
                }
            }
        }
    }

    /// Indexed tokens containing `query_token`, itself included
    fn matching_tokens(&self, query_token: &str) -> Vec<&str> {
        if query_token.len() < 3 {
            return self
                .postings
                .keys()
                .filter(|token| token.contains(query_token))
                .map(String::as_str)
                .collect();
        }
        let mut smallest: Option<&AHashSet<String>> = None;
        for gram in trigrams(query_token) {
            let Some(tokens) = self.grams.get(&gram) else {
                return Vec::new();
            };
            if smallest.is_none_or(|s| tokens.len() < s.len()) {
                smallest = Some(tokens);
            }
        }
        smallest
            .into_iter()
            .flatten()
            .filter(|token| token.contains(query_token))
            .map(String::as_str)
            .collect()
    }

    /// Postings of one query token: the union over every indexed token containing it
    fn candidates_for(&self, query_token: &str) -> Vec<Posting> {
        let mut out: Vec<Posting> = Vec::new();
        for token in self.matching_tokens(query_token) {
            if let Some(list) = self.postings.get(token) {
                out.extend(list.iter().cloned());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Intersected candidate set of all query tokens, sorted by (target, position)
    fn candidates(&self, tokens: &[String]) -> Vec<Posting> {
        let mut result: Option<Vec<Posting>> = None;
        for token in tokens {
            let list = self.candidates_for(token);
            if list.is_empty() {
                return Vec::new();
            }
            result = Some(match result {
                None => list,
                Some(prev) => intersect_sorted(&prev, &list),
            });
            if result.as_ref().is_some_and(|r| r.is_empty()) {
                return Vec::new();
            }
        }
        result.unwrap_or_default()
    }

    /// Search the indexed corpus
    pub fn search(&mut self, query: &SearchQuery) -> Vec<SearchResult> {
        let tokens = tokenize_query(&query.text);
        if tokens.is_empty() {
            return self.scan(query);
        }

        let mut by_target: HashMap<Arc<str>, Vec<usize>> = HashMap::new();
        for posting in self.candidates(&tokens) {
            by_target
                .entry(posting.target)
                .or_default()
                .push(posting.position as usize);
        }

        let mut results = Vec::new();
        for (target, positions) in by_target {
            if !in_scope(&target, query) {
                continue;
            }
            if let Some(entry) = self.targets.get_mut(&*target) {
                results.extend(match_entry(entry, positions.into_iter(), query));
            }
        }
        sort_results(&mut results);
        results
    }

    /// Linear scan over every indexed message; same results as [`search`](Self::search)
    pub fn scan(&mut self, query: &SearchQuery) -> Vec<SearchResult> {
        let mut results = Vec::new();
        for entry in self.targets.values_mut() {
            if !in_scope(&entry.name, query) {
                continue;
            }
            let positions = 0..entry.messages.len();
            results.extend(match_entry(entry, positions, query));
        }
        sort_results(&mut results);
        results
    }
}

fn in_scope(target: &str, query: &SearchQuery) -> bool {
    match query.in_target.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(scope) => scope.eq_ignore_ascii_case(target),
    }
}

fn match_entry(
    entry: &mut TargetEntry,
    positions: impl Iterator<Item = usize>,
    query: &SearchQuery,
) -> Vec<SearchResult> {
    if query.has_reply && entry.replied.is_none() {
        entry.replied = Some(replied_ids(&entry.messages));
    }
    let replied = if query.has_reply {
        entry.replied.as_ref()
    } else {
        None
    };
    scan_target(&entry.name, &entry.messages, positions, query, replied)
}

/// Evaluate the full search predicate on selected positions of one target
pub fn scan_target(
    target: &str,
    messages: &[Message],
    positions: impl IntoIterator<Item = usize>,
    query: &SearchQuery,
    replied: Option<&HashSet<String>>,
) -> Vec<SearchResult> {
    let mut results = Vec::new();
    for position in positions {
        let Some(message) = messages.get(position) else {
            continue;
        };
        if !matches_search_attributes(message, query) {
            continue;
        }
        if let Some(replied) = replied {
            if !replied.contains(&message.id) {
                continue;
            }
        }
        let (match_offset, match_length) = if query.text.is_empty() {
            (None, 0)
        } else {
            match find_substring(&message.body_text(), &query.text) {
                Some((offset, length)) => (Some(offset), length),
                None => continue,
            }
        };
        results.push(SearchResult {
            topic: target.to_string(),
            message: message.clone(),
            match_offset,
            match_length,
            prev: position.checked_sub(1).and_then(|p| messages.get(p)).cloned(),
            next: messages.get(position + 1).cloned(),
        });
    }
    results
}

/// IDs referenced by a `reply_to` within one target
pub fn replied_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter(|m| !m.reply_to.is_empty())
        .map(|m| m.reply_to.clone())
        .collect()
}

/// Search result order: message ID, then target name
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| (&a.message.id, &a.topic).cmp(&(&b.message.id, &b.topic)));
}

fn trigrams(token: &str) -> impl Iterator<Item = [u8; 3]> + '_ {
    token.as_bytes().windows(3).map(|w| [w[0], w[1], w[2]])
}

fn intersect_sorted(a: &[Posting], b: &[Posting]) -> Vec<Posting> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

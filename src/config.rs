//! Provider configuration
//!
//! Priority: environment variables > `[dashboard]` section of the user config
//! file > defaults. Unset, zero and negative values fall back to the default.

use crate::cache::DEFAULT_MESSAGE_CACHE_SIZE;
use crate::utils::get_config_path;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(500);
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_MAX: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_SUBSCRIBE_BUFFER: usize = 256;

/// Configuration file format (TOML)
/// Located at ~/Library/Application Support/fmail/config.toml (macOS)
/// or %LOCALAPPDATA%/fmail/config.toml (Windows)
/// or ~/.local/share/fmail/config.toml (Linux)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub dashboard: DashboardConfigFile,
}

/// `[dashboard]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardConfigFile {
    pub cache_ttl_ms: Option<i64>,
    pub metadata_ttl_ms: Option<i64>,
    pub poll_min_ms: Option<i64>,
    pub poll_max_ms: Option<i64>,
    pub reconnect_ms: Option<i64>,
    pub subscribe_buffer: Option<i64>,
    pub message_cache_size: Option<i64>,
    pub self_agent: Option<String>,
    pub forged_addr: Option<String>,
    pub root: Option<PathBuf>,
}

/// Settings shared by the file, daemon and hybrid providers
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Store root (`<project>/.fmail`); discovered from the working directory when unset
    pub root: Option<PathBuf>,
    /// Lifetime of topic, agent and message-list results
    pub cache_ttl: Duration,
    /// Lifetime of a directory metadata snapshot with an unchanged mtime
    pub metadata_ttl: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
    /// How often the daemon is re-probed while polling files
    pub reconnect_interval: Duration,
    pub subscribe_buffer: usize,
    pub message_cache_size: usize,
    /// Identity used for DM views and as the default sender
    pub self_agent: Option<String>,
    /// Explicit daemon address (unix socket path or `host:port`)
    pub forged_addr: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            root: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            metadata_ttl: DEFAULT_METADATA_TTL,
            poll_min: DEFAULT_POLL_MIN,
            poll_max: DEFAULT_POLL_MAX,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            subscribe_buffer: DEFAULT_SUBSCRIBE_BUFFER,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            self_agent: None,
            forged_addr: None,
        }
    }
}

impl ProviderConfig {
    /// Config rooted at an explicit store directory, defaults elsewhere
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Load config from file in the app data directory
    /// Returns None if file doesn't exist or can't be parsed
    fn load_from_file() -> Option<ConfigFile> {
        let config_path = get_config_path().ok()?;
        if !config_path.exists() {
            return None;
        }
        let content = fs::read_to_string(&config_path).ok()?;
        match toml::from_str(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(path = %config_path.display(), error = %e, "ignoring unreadable config file");
                None
            }
        }
    }

    /// Load config with priority: environment variables > config file > defaults
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(file) = Self::load_from_file() {
            config.apply_file(&file.dashboard);
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.normalized()
    }

    /// Apply the values present in a `[dashboard]` section
    pub fn apply_file(&mut self, file: &DashboardConfigFile) {
        set_duration(&mut self.cache_ttl, file.cache_ttl_ms);
        set_duration(&mut self.metadata_ttl, file.metadata_ttl_ms);
        set_duration(&mut self.poll_min, file.poll_min_ms);
        set_duration(&mut self.poll_max, file.poll_max_ms);
        set_duration(&mut self.reconnect_interval, file.reconnect_ms);
        set_count(&mut self.subscribe_buffer, file.subscribe_buffer);
        set_count(&mut self.message_cache_size, file.message_cache_size);
        set_text(&mut self.self_agent, file.self_agent.as_deref());
        set_text(&mut self.forged_addr, file.forged_addr.as_deref());
        if let Some(root) = &file.root {
            self.root = Some(root.clone());
        }
    }

    /// Apply `FMAIL_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());

        set_duration(&mut self.cache_ttl, number("FMAIL_CACHE_TTL_MS"));
        set_duration(&mut self.metadata_ttl, number("FMAIL_METADATA_TTL_MS"));
        set_duration(&mut self.poll_min, number("FMAIL_POLL_MIN_MS"));
        set_duration(&mut self.poll_max, number("FMAIL_POLL_MAX_MS"));
        set_duration(&mut self.reconnect_interval, number("FMAIL_RECONNECT_MS"));
        set_count(&mut self.subscribe_buffer, number("FMAIL_SUBSCRIBE_BUFFER"));
        set_count(&mut self.message_cache_size, number("FMAIL_MESSAGE_CACHE"));
        set_text(&mut self.self_agent, lookup("FMAIL_AGENT").as_deref());
        set_text(&mut self.forged_addr, lookup("FMAIL_FORGED_ADDR").as_deref());
        if let Some(root) = lookup("FMAIL_ROOT").filter(|r| !r.trim().is_empty()) {
            self.root = Some(PathBuf::from(root.trim()));
        }
    }

    /// Replace zero values with defaults and keep `poll_max >= poll_min`
    pub fn normalized(mut self) -> Self {
        or_default(&mut self.cache_ttl, DEFAULT_CACHE_TTL);
        or_default(&mut self.metadata_ttl, DEFAULT_METADATA_TTL);
        or_default(&mut self.poll_min, DEFAULT_POLL_MIN);
        or_default(&mut self.poll_max, DEFAULT_POLL_MAX);
        or_default(&mut self.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        if self.poll_max < self.poll_min {
            self.poll_max = self.poll_min;
        }
        if self.subscribe_buffer == 0 {
            self.subscribe_buffer = DEFAULT_SUBSCRIBE_BUFFER;
        }
        if self.message_cache_size == 0 {
            self.message_cache_size = DEFAULT_MESSAGE_CACHE_SIZE;
        }
        self.self_agent = self
            .self_agent
            .take()
            .map(|a| crate::store::normalize_agent_name(&a))
            .filter(|a| !a.is_empty());
        self
    }
}

fn set_duration(slot: &mut Duration, ms: Option<i64>) {
    if let Some(ms) = ms.filter(|ms| *ms > 0) {
        *slot = Duration::from_millis(ms as u64);
    }
}

fn set_count(slot: &mut usize, value: Option<i64>) {
    if let Some(v) = value.filter(|v| *v > 0) {
        *slot = v as usize;
    }
}

fn set_text(slot: &mut Option<String>, value: Option<&str>) {
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        *slot = Some(v.to_string());
    }
}

fn or_default(slot: &mut Duration, default: Duration) {
    if slot.is_zero() {
        *slot = default;
    }
}

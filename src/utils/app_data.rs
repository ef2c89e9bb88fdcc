use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "fmail";
const CONFIG_FILE: &str = "config.toml";

/// Name of the mailbox directory inside a project
pub const MAILBOX_DIR: &str = ".fmail";

/// Get the per-user application data directory
pub fn get_app_data_dir() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        // Linux/Unix: use XDG_DATA_HOME or ~/.local/share
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    Ok(base.join(APP_NAME))
}

/// Path of the user config file (may not exist)
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_app_data_dir()?.join(CONFIG_FILE))
}

/// Find the project that owns a mailbox, starting from `start_path`.
/// Walks up the directory tree looking for:
/// 1. A `.fmail` directory
/// 2. A `.git` directory (a project that has not sent mail yet)
///
/// Falls back to the start path itself.
pub fn find_project_root(start_path: &Path) -> Result<PathBuf> {
    let start = fs::canonicalize(start_path)
        .with_context(|| format!("Failed to resolve {}", start_path.display()))?;

    for marker in [MAILBOX_DIR, ".git"] {
        let mut current = start.as_path();
        loop {
            if current.join(marker).is_dir() {
                return Ok(current.to_path_buf());
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    Ok(start)
}

/// Mailbox store root for a project
pub fn mailbox_root(project_root: &Path) -> PathBuf {
    project_root.join(MAILBOX_DIR)
}

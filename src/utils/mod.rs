//! Utility functions shared across the crate.
//!
//! ## Modules
//!
//! - [`app_data`] - Per-user config location and project root discovery
//! - [`tokenizer`] - Token extraction for the text search index
//!
//! ```no_run
//! use fmail_data::utils::extract_tokens;
//!
//! let tokens = extract_tokens("Deploy ready: build-42");
//! // Returns: {"deploy", "ready", "build", "42"}
//! ```

pub mod app_data;
pub mod tokenizer;

pub use app_data::*;
pub use tokenizer::*;

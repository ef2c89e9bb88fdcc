pub mod metadata;
pub mod search;

pub use metadata::{DirSnapshot, DirSummary, DirectoryMetadataIndex, FileMetadata, refresh_dir};
pub use search::{LoadedTarget, Posting, TextSearchIndex};

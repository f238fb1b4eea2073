//! 📦 Knobs every file-bearing source shares, whether the files live on a disk or in a bucket.

use serde::Deserialize;

use crate::connector::lenient;

/// 📦 Flattened into `FileSourceConfig` and `S3SourceConfig`.
#[derive(Debug, Deserialize, Clone)]
pub(crate) struct CommonFileSourceConfig {
    /// Glob over file names (and whole keys, see `pattern.rs`).
    #[serde(default = "default_file_pattern", alias = "pattern")]
    pub file_pattern: String,
    /// An empty match set fails the run instead of succeeding with zero rows.
    #[serde(default, deserialize_with = "lenient::bool")]
    pub require_matches: bool,
    /// Move, not copy: delete the source once it has safely landed.
    #[serde(default = "default_delete_after_transfer", deserialize_with = "lenient::bool")]
    pub delete_after_transfer: bool,
}

impl Default for CommonFileSourceConfig {
    fn default() -> Self {
        Self {
            file_pattern: default_file_pattern(),
            require_matches: false,
            delete_after_transfer: default_delete_after_transfer(),
        }
    }
}

fn default_file_pattern() -> String {
    "*".to_string()
}

// -- 🚚 files move by default; copying is opt-in
fn default_delete_after_transfer() -> bool {
    true
}

//! 📂 Local and NFS-mounted directories, on both ends of the ferry.
//!
//! 🚰 `FileSource` lists regular files directly under `path` (no recursion) and opens them
//! with tokio. 🕳️ `FileSink` writes `<path>/<name>.part` first and renames it into place,
//! so a reader polling the directory never sees half a file.
//!
//! 💀 Disk full → `DestinationWriteFailed`, and the `.part` gets swept up on the way out.
//!
//! 🔁 Source and sink pointed at one directory would rename each file over itself and then
//! delete it. That pair is refused when the plan is built, and the sink refuses any unit
//! whose target is its own source file.

use std::path::Path;

mod file_sink;
mod file_source;

pub(crate) use file_sink::{FileSink, FileSinkConfig};
pub(crate) use file_source::{FileSource, FileSourceConfig};

/// 🔁 Do two paths name the same place on disk? Resolved through symlinks and `..` when
/// both exist, compared as written otherwise.
pub(crate) async fn same_place(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.components().eq(b.components()),
    }
}

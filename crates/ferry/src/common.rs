//! 📦 Common data structures: the things that ride the ferry.
//!
//! A `TransferUnit` is one file, one object, or one freshly generated export. It knows its
//! name, where its bytes live, and how big it is. It does NOT carry the bytes. Bytes only
//! flow when a writer asks a `UnitOpener` for a reader, so a thousand-file listing costs a
//! thousand small structs, not a thousand files in RAM. 🦆

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::errors::PipelineError;

/// 🌊 The byte stream of a unit. Boxed so S3 bodies, local files and test cursors all fit.
pub type UnitReader = Box<dyn AsyncRead + Send + Unpin>;

/// 📍 Where a unit's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitLocation {
    Local(PathBuf),
    Object { bucket: String, key: String },
}

impl fmt::Display for UnitLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Object { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

/// 🎯 One file/object/export moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    /// File name as it should appear at the destination.
    pub name: String,
    pub location: UnitLocation,
    pub size_bytes: u64,
    /// Known when the unit is an export we produced ourselves.
    pub rows: Option<u64>,
}

impl TransferUnit {
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            location: UnitLocation::Local(path.into()),
            size_bytes,
            rows: None,
        }
    }

    pub fn object(
        name: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            name: name.into(),
            location: UnitLocation::Object { bucket: bucket.into(), key: key.into() },
            size_bytes,
            rows: None,
        }
    }

    /// 📛 `name` without its last extension. `orders.2024.csv` → `orders.2024`.
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

/// ✅ What a writer reports back for a unit it placed successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitWrite {
    /// Rows the destination reports having loaded, when it counts rows at all.
    pub rows: Option<u64>,
}

/// 📬 Per-unit verdict. Failures are values here, not early returns.
#[derive(Debug)]
pub struct UnitOutcome {
    pub unit: TransferUnit,
    pub result: Result<UnitWrite, PipelineError>,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// 🔓 Hands out a fresh reader for a unit. Writers that retry simply open again.
#[async_trait]
pub trait UnitOpener: Send + Sync {
    async fn open(&self, unit: &TransferUnit) -> Result<UnitReader>;
}

/// 📂 Opens units that live on the local disk. Exports are always local.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

#[async_trait]
impl UnitOpener for LocalFiles {
    async fn open(&self, unit: &TransferUnit) -> Result<UnitReader> {
        open_local(unit).await
    }
}

pub(crate) async fn open_local(unit: &TransferUnit) -> Result<UnitReader> {
    match &unit.location {
        UnitLocation::Local(path) => {
            let the_file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("💀 opening '{}' for reading", path.display()))?;
            Ok(Box::new(the_file))
        }
        other => anyhow::bail!("💀 '{other}' is not a local file and this opener only does disks"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn the_one_where_the_stem_loses_only_the_last_extension() {
        assert_eq!(TransferUnit::local("orders.2024.csv", "/x", 0).stem(), "orders.2024");
        assert_eq!(TransferUnit::local("README", "/x", 0).stem(), "README");
        assert_eq!(TransferUnit::local(".env", "/x", 0).stem(), ".env");
    }

    #[test]
    fn the_one_where_locations_print_like_people_expect() {
        let the_object = TransferUnit::object("a.pdf", "raw", "in/a.pdf", 3);
        assert_eq!(the_object.location.to_string(), "s3://raw/in/a.pdf");
    }

    #[tokio::test]
    async fn the_one_where_local_files_open_and_objects_do_not() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello ferry").expect("💀 write fixture");

        let mut the_reader = LocalFiles
            .open(&TransferUnit::local("hello.txt", &path, 11))
            .await
            .expect("💀 local file should open");
        let mut the_bytes = String::new();
        the_reader.read_to_string(&mut the_bytes).await.expect("💀 read");
        assert_eq!(the_bytes, "hello ferry");

        let the_error = LocalFiles
            .open(&TransferUnit::object("x", "b", "k", 0))
            .await
            .err()
            .expect("💀 objects are not local");
        assert!(the_error.to_string().contains("s3://b/k"));
    }
}

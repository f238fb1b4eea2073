use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, warn};

use super::same_place;
use crate::common::{TransferUnit, UnitLocation, UnitOpener, UnitWrite};
use crate::errors::PipelineError;

// -- 🕳️ FileSinkConfig, cousin of FileSourceConfig, equally traumatized by disk-full errors.
#[derive(Debug, Deserialize, Clone)]
pub(crate) struct FileSinkConfig {
    pub path: PathBuf,
}

/// 🕳️ FileSink: copies the unit into `path`, via a `.part` file and an atomic rename.
///
/// ⚠️ An existing file with the same name is replaced. A directory with the same name is not,
/// and the unit fails.
#[derive(Debug)]
pub(crate) struct FileSink {
    sink_config: FileSinkConfig,
}

impl FileSink {
    pub(crate) fn new(sink_config: FileSinkConfig) -> Self {
        Self { sink_config }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.sink_config.path
    }

    pub(crate) async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError> {
        let dir = &self.sink_config.path;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("💀 creating destination directory '{}'", dir.display()))
            .map_err(|e| PipelineError::destination_unavailable(&e))?;

        let target = dir.join(&unit.name);
        let part = dir.join(format!("{}.part", unit.name));

        // -- renaming a file over itself "succeeds", and then the source would consume it
        if let UnitLocation::Local(origin) = &unit.location
            && same_place(origin, &target).await
        {
            return Err(PipelineError::DestinationWriteFailed(format!(
                "'{}' is already at '{}'; source and destination are the same file",
                unit.name,
                target.display()
            )));
        }

        let copied = match copy_into(unit, opener, &part).await {
            Ok(n) => n,
            Err(e) => {
                discard(&part).await;
                return Err(PipelineError::destination_write_failed(&e));
            }
        };

        if let Err(e) = tokio::fs::rename(&part, &target).await {
            discard(&part).await;
            let e = anyhow::Error::new(e).context(format!(
                "💀 moving '{}' into place at '{}'",
                part.display(),
                target.display()
            ));
            return Err(PipelineError::destination_write_failed(&e));
        }

        debug!("📂 wrote {copied} bytes to '{}'", target.display());
        Ok(UnitWrite { rows: unit.rows })
    }
}

async fn copy_into(
    unit: &TransferUnit,
    opener: &dyn UnitOpener,
    part: &Path,
) -> anyhow::Result<u64> {
    let mut reader = opener
        .open(unit)
        .await
        .with_context(|| format!("💀 opening source unit '{}'", unit.name))?;
    let mut file_buf = io::BufWriter::new(
        File::create(part)
            .await
            .with_context(|| format!("💀 creating '{}'", part.display()))?,
    );
    let copied = io::copy(&mut reader, &mut file_buf)
        .await
        .with_context(|| format!("💀 copying '{}' to '{}'", unit.name, part.display()))?;
    // -- async Drop isn't a thing; flush explicitly or the tail of the file stays in the buffer
    file_buf
        .flush()
        .await
        .with_context(|| format!("💀 flushing '{}'", part.display()))?;
    file_buf
        .get_ref()
        .sync_all()
        .await
        .with_context(|| format!("💀 syncing '{}'", part.display()))?;
    Ok(copied)
}

async fn discard(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("🧹 could not clean up '{}': {e}", part.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LocalFiles;
    use crate::errors::ErrorKind;

    fn fixture(dir: &Path, name: &str, body: &[u8]) -> TransferUnit {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("💀 fixture");
        TransferUnit::local(name, path, body.len() as u64)
    }

    #[tokio::test]
    async fn the_one_where_the_file_lands_whole_and_no_part_is_left() {
        let src = tempfile::tempdir().expect("💀 tempdir");
        let dst = tempfile::tempdir().expect("💀 tempdir");
        let the_unit = fixture(src.path(), "report.pdf", b"%PDF-1.7 totally a pdf");
        let out_dir = dst.path().join("nested/out");

        let the_sink = FileSink::new(FileSinkConfig { path: out_dir.clone() });
        the_sink.write(&the_unit, &LocalFiles).await.expect("💀 write");

        assert_eq!(
            std::fs::read(out_dir.join("report.pdf")).expect("💀 read back"),
            b"%PDF-1.7 totally a pdf"
        );
        assert!(!out_dir.join("report.pdf.part").exists());
    }

    #[tokio::test]
    async fn the_one_where_a_directory_squatting_on_the_name_fails_the_unit() {
        let src = tempfile::tempdir().expect("💀 tempdir");
        let dst = tempfile::tempdir().expect("💀 tempdir");
        let the_unit = fixture(src.path(), "taken.csv", b"a,b\n1,2\n");
        std::fs::create_dir(dst.path().join("taken.csv")).expect("💀 squatter");

        let the_sink = FileSink::new(FileSinkConfig { path: dst.path().to_path_buf() });
        let the_error = the_sink.write(&the_unit, &LocalFiles).await.unwrap_err();

        assert_eq!(the_error.kind(), ErrorKind::DestinationWriteFailed);
        assert!(!dst.path().join("taken.csv.part").exists());
    }

    #[tokio::test]
    async fn the_one_where_a_file_is_never_copied_onto_itself() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let the_unit = fixture(dir.path(), "a.pdf", b"%PDF-1.4 the only copy");

        let the_sink = FileSink::new(FileSinkConfig { path: dir.path().to_path_buf() });
        let the_error = the_sink.write(&the_unit, &LocalFiles).await.unwrap_err();

        assert_eq!(the_error.kind(), ErrorKind::DestinationWriteFailed);
        assert_eq!(
            std::fs::read(dir.path().join("a.pdf")).expect("💀 the original should survive"),
            b"%PDF-1.4 the only copy"
        );
        assert!(!dir.path().join("a.pdf.part").exists());
    }
}

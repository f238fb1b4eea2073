use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backends::common_config::CommonFileSourceConfig;
use crate::backends::pattern::KeyPattern;
use crate::common::{TransferUnit, UnitLocation, UnitReader, open_local};
use crate::errors::PipelineError;

// -- 📂 FileSourceConfig lives next to the FileSource that reads it. One backend, one file.
#[derive(Debug, Deserialize, Clone)]
pub(crate) struct FileSourceConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub common_config: CommonFileSourceConfig,
}

/// 📂 FileSource: a directory listing with opinions about which names count.
#[derive(Debug)]
pub(crate) struct FileSource {
    source_config: FileSourceConfig,
    pattern: KeyPattern,
}

impl FileSource {
    pub(crate) fn new(source_config: FileSourceConfig) -> Result<Self, PipelineError> {
        let pattern = KeyPattern::new(&source_config.common_config.file_pattern, "")?;
        Ok(Self { source_config, pattern })
    }

    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.source_config.path
    }

    pub(crate) fn options(&self) -> &CommonFileSourceConfig {
        &self.source_config.common_config
    }

    pub(crate) async fn list(&self) -> Result<Vec<TransferUnit>, PipelineError> {
        let dir = &self.source_config.path;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("💀 listing source directory '{}'", dir.display()))
            .map_err(|e| PipelineError::source_unavailable(&e))?;

        let mut units = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .with_context(|| format!("💀 reading an entry of '{}'", dir.display()))
                .map_err(|e| PipelineError::source_unavailable(&e))?;
            let Some(entry) = entry else { break };

            let Ok(name) = entry.file_name().into_string() else {
                debug!("🙈 skipping a non-UTF-8 file name in '{}'", dir.display());
                continue;
            };
            // -- metadata follows symlinks; a dangling link just drops out of the listing
            let Ok(metadata) = tokio::fs::metadata(entry.path()).await else {
                continue;
            };
            if !metadata.is_file() || !self.pattern.matches(&name) {
                trace!("⏭️ '{name}' is not a matching regular file");
                continue;
            }
            units.push(TransferUnit::local(name, entry.path(), metadata.len()));
        }

        units.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(
            "📂 {} file(s) in '{}' match '{}'",
            units.len(),
            dir.display(),
            self.source_config.common_config.file_pattern
        );
        Ok(units)
    }

    pub(crate) async fn open(&self, unit: &TransferUnit) -> Result<UnitReader> {
        open_local(unit).await
    }

    pub(crate) async fn consume(&self, unit: &TransferUnit) -> Result<()> {
        let UnitLocation::Local(path) = &unit.location else {
            anyhow::bail!("💀 '{}' is not a local file, nothing to remove", unit.location);
        };
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("💀 removing transferred source file '{}'", path.display()))
    }
}

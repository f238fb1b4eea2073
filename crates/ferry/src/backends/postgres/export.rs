//! 🐘➡️📄 Cursor export: a query goes in, a CSV file comes out, memory stays flat.
//!
//! ```text
//!   BEGIN READ ONLY
//!   DECLARE ferry_export NO SCROLL CURSOR FOR <query>
//!   FETCH <batch_size> FROM ferry_export   ──▶ ExportWriter::write_batch  (repeat)
//!   CLOSE ferry_export; COMMIT
//! ```
//!
//! `simple_query` hands every value back as text, which is exactly what CSV wants, so no
//! per-type conversion table lives here. NULL becomes an empty field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_postgres::SimpleQueryMessage;
use tracing::{debug, info, warn};

use super::{PgConnectionConfig, connect};
use crate::common::TransferUnit;
use crate::connector::lenient;
use crate::errors::PipelineError;

const CURSOR_NAME: &str = "ferry_export";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PostgresExportConfig {
    #[serde(flatten)]
    pub connection: PgConnectionConfig,
    pub query: String,
    /// Rows per FETCH, and therefore rows per write to disk.
    #[serde(default = "default_batch_size", deserialize_with = "lenient::usize")]
    pub batch_size: usize,
    /// strftime-style template; `%` sequences are rendered with the local clock.
    #[serde(default = "default_csv_filename")]
    pub csv_filename: String,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_csv_filename() -> String {
    "export_%Y%m%d_%H%M%S.csv".to_string()
}

#[derive(Debug)]
pub(crate) struct PostgresExport {
    config: PostgresExportConfig,
    export_dir: PathBuf,
    connect_timeout: Duration,
}

impl PostgresExport {
    pub(crate) fn new(
        config: PostgresExportConfig,
        export_dir: PathBuf,
        connect_timeout: Duration,
    ) -> Self {
        Self { config, export_dir, connect_timeout }
    }

    /// 🚀 Run the query and spool it to CSV. `Ok(None)` means zero rows and no file.
    pub(crate) async fn export(&self) -> Result<Option<TransferUnit>, PipelineError> {
        let the_target = self.config.connection.describe();
        let pg = self
            .config
            .connection
            .to_pg_config(self.connect_timeout)
            .map_err(|e| PipelineError::ConfigInvalid(format!("{e:#}")))?;
        let client = connect(&pg, self.connect_timeout)
            .await
            .with_context(|| format!("connecting to source database {the_target}"))
            .map_err(|e| PipelineError::source_unavailable(&e))?;

        let query = self.config.query.trim().trim_end_matches(';');
        let batch_size = self.config.batch_size.max(1);
        debug!("🐘 declaring cursor on {the_target} with batch size {batch_size}");

        client
            .batch_execute("BEGIN READ ONLY")
            .await
            .context("opening read-only transaction")
            .map_err(|e| PipelineError::source_query_failed(&e))?;
        client
            .batch_execute(&format!("DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR {query}"))
            .await
            .context("declaring export cursor")
            .map_err(|e| PipelineError::source_query_failed(&e))?;

        let file_name = render_filename(&self.config.csv_filename);
        let mut writer = ExportWriter::new(&self.export_dir, file_name);
        if let Err(e) = spool(&client, batch_size, &mut writer).await {
            writer.discard().await;
            return Err(e);
        }

        // -- the transaction is read-only; a failed COMMIT loses nothing
        if let Err(e) = client.batch_execute(&format!("CLOSE {CURSOR_NAME}; COMMIT")).await {
            warn!("⚠️ closing export cursor failed, moving on: {e}");
        }

        let the_unit = writer
            .finish()
            .await
            .map_err(|e| PipelineError::source_export_failed(&e))?;
        match &the_unit {
            Some(unit) => info!(
                "✅ exported {} rows ({} bytes) to {}",
                unit.rows.unwrap_or(0),
                unit.size_bytes,
                unit.location
            ),
            None => info!("📭 query on {the_target} returned no rows, no export file created"),
        }
        Ok(the_unit)
    }
}

/// 🔁 FETCH until the cursor runs dry, handing each batch to the writer.
async fn spool(
    client: &tokio_postgres::Client,
    batch_size: usize,
    writer: &mut ExportWriter,
) -> Result<(), PipelineError> {
    let fetch = format!("FETCH {batch_size} FROM {CURSOR_NAME}");
    loop {
        let messages = client
            .simple_query(&fetch)
            .await
            .context("fetching from export cursor")
            .map_err(|e| PipelineError::source_query_failed(&e))?;

        let mut header: Vec<String> = Vec::new();
        let mut batch: Vec<Vec<Option<String>>> = Vec::with_capacity(batch_size);
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if header.is_empty() {
                    header = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                batch.push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        let fetched = batch.len();
        writer
            .write_batch(&header, &batch)
            .await
            .map_err(|e| PipelineError::source_export_failed(&e))?;
        debug!("📄 spooled {fetched} rows ({} so far)", writer.rows());
        if fetched < batch_size {
            return Ok(());
        }
    }
}

/// 🖊️ Incremental CSV writer. The file is only created once the first row shows up.
#[derive(Debug)]
pub(crate) struct ExportWriter {
    path: PathBuf,
    name: String,
    file: Option<BufWriter<File>>,
    rows: u64,
    bytes: u64,
}

impl ExportWriter {
    pub(crate) fn new(dir: &Path, name: String) -> Self {
        Self { path: dir.join(&name), name, file: None, rows: 0, bytes: 0 }
    }

    pub(crate) fn rows(&self) -> u64 {
        self.rows
    }

    pub(crate) async fn write_batch(
        &mut self,
        header: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut csv_buf = csv::Writer::from_writer(Vec::with_capacity(rows.len() * 64));
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("💀 creating export directory '{}'", parent.display())
                })?;
            }
            let the_file = File::create(&self.path)
                .await
                .with_context(|| format!("💀 creating export file '{}'", self.path.display()))?;
            self.file = Some(BufWriter::new(the_file));
            csv_buf.write_record(header).context("💀 encoding CSV header")?;
        }

        for row in rows {
            csv_buf
                .write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))
                .context("💀 encoding CSV row")?;
        }
        let encoded = csv_buf
            .into_inner()
            .map_err(|e| anyhow!("💀 flushing CSV encoder: {}", e.error()))?;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("💀 export file vanished between create and write"))?;
        file.write_all(&encoded)
            .await
            .with_context(|| format!("💀 writing to export file '{}'", self.path.display()))?;

        self.rows += rows.len() as u64;
        self.bytes += encoded.len() as u64;
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> Result<Option<TransferUnit>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let flushed = file.flush().await;
        if let Err(e) = flushed {
            let e = anyhow::Error::new(e)
                .context(format!("💀 flushing export file '{}'", self.path.display()));
            self.discard().await;
            return Err(e);
        }
        let mut the_unit = TransferUnit::local(self.name, self.path, self.bytes);
        the_unit.rows = Some(self.rows);
        Ok(Some(the_unit))
    }

    /// 🧹 Throw away a half-written export. Nothing to do if no row ever arrived.
    pub(crate) async fn discard(self) {
        let Some(file) = self.file else {
            return;
        };
        drop(file);
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("🧹 removed partial export '{}'", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("🧹 could not remove partial export '{}': {e}", self.path.display()),
        }
    }
}

/// 🕰️ Render `%Y%m%d`-style sequences. A template chrono can't parse is used verbatim.
fn render_filename(template: &str) -> String {
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return template.to_string();
    }
    Local::now().format_with_items(items.into_iter()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::UnitLocation;

    fn row(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[tokio::test]
    async fn the_one_where_two_batches_make_one_header_and_nulls_go_blank() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let header = vec!["id".to_string(), "note".to_string()];
        let mut the_writer = ExportWriter::new(dir.path(), "orders.csv".into());

        let the_first_batch = [row(&[Some("1"), Some("hello, world")]), row(&[Some("2"), None])];
        the_writer.write_batch(&header, &the_first_batch).await.expect("💀 first batch");
        the_writer
            .write_batch(&header, &[row(&[Some("3"), Some("say \"hi\"")])])
            .await
            .expect("💀 second batch");

        let the_unit = the_writer.finish().await.expect("💀 finish").expect("💀 a file");
        assert_eq!(the_unit.rows, Some(3));
        assert_eq!(the_unit.name, "orders.csv");

        let UnitLocation::Local(path) = &the_unit.location else {
            panic!("💀 exports are local files");
        };
        let the_text = std::fs::read_to_string(path).expect("💀 read back");
        assert_eq!(
            the_text,
            "id,note\n1,\"hello, world\"\n2,\n3,\"say \"\"hi\"\"\"\n"
        );
        assert_eq!(the_unit.size_bytes, the_text.len() as u64);
    }

    #[tokio::test]
    async fn the_one_where_zero_rows_leave_no_file_behind() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let mut the_writer = ExportWriter::new(dir.path(), "empty.csv".into());
        the_writer.write_batch(&["id".to_string()], &[]).await.expect("💀 empty batch");

        assert!(the_writer.finish().await.expect("💀 finish").is_none());
        assert!(!dir.path().join("empty.csv").exists());
    }

    #[tokio::test]
    async fn the_one_where_a_broken_export_leaves_no_half_file_behind() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let run_dir = dir.path().join("run-7-a1b2");
        let mut the_writer = ExportWriter::new(&run_dir, "orders.csv".into());
        the_writer
            .write_batch(&["id".to_string()], &[row(&[Some("1")])])
            .await
            .expect("💀 first batch");
        assert!(run_dir.join("orders.csv").exists());

        // -- the next FETCH blew up, so the run throws away what it had
        the_writer.discard().await;

        assert!(!run_dir.join("orders.csv").exists());
    }

    #[tokio::test]
    async fn the_one_where_discarding_an_untouched_writer_is_a_no_op() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        ExportWriter::new(dir.path(), "never.csv".into()).discard().await;
        assert_eq!(std::fs::read_dir(dir.path()).expect("💀 read_dir").count(), 0);
    }

    #[test]
    fn the_one_where_the_default_filename_gets_a_timestamp() {
        let the_name = render_filename(&default_csv_filename());
        assert!(the_name.starts_with("export_"));
        assert!(the_name.ends_with(".csv"));
        assert_eq!(the_name.len(), "export_20240101_000000.csv".len());
        assert_eq!(render_filename("plain.csv"), "plain.csv");
        assert_eq!(render_filename("broken_%Q.csv"), "broken_%Q.csv");
    }

    #[test]
    fn the_one_where_export_settings_accept_stringly_batch_sizes() {
        let the_config: PostgresExportConfig = serde_json::from_value(serde_json::json!({
            "host": "db", "database": "shop", "username": "ro", "password": "pw",
            "query": "SELECT 1", "batch_size": "500",
        }))
        .expect("💀 settings parse");
        assert_eq!(the_config.batch_size, 500);
        assert_eq!(the_config.connection.port, 5432);
        assert!(the_config.csv_filename.contains("%Y"));
    }
}

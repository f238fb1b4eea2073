//! 📄➡️🐘 COPY loader: stream a CSV unit into a table without ever holding it whole.
//!
//! The header line is read first to shape the table (one TEXT column per header name),
//! then replayed into `COPY ... WITH (FORMAT csv, HEADER true)` followed by the rest of
//! the bytes in fixed-size chunks. Postgres does the CSV parsing; we do the plumbing.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures::SinkExt;
use pg_escape::quote_identifier;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info};

use super::{PgConnectionConfig, connect, sanitize_identifier};
use crate::common::{TransferUnit, UnitOpener, UnitWrite};
use crate::errors::PipelineError;

const COPY_CHUNK_BYTES: usize = 64 * 1024;
const SCHEMA_EXISTS_SQL: &str = "SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1::text";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PostgresLoaderConfig {
    #[serde(flatten)]
    pub connection: PgConnectionConfig,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Defaults to the unit's file stem, sanitized.
    #[serde(default, alias = "table_name")]
    pub table: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug)]
pub(crate) struct PostgresLoader {
    config: PostgresLoaderConfig,
    connect_timeout: Duration,
}

impl PostgresLoader {
    pub(crate) fn new(config: PostgresLoaderConfig, connect_timeout: Duration) -> Self {
        Self { config, connect_timeout }
    }

    fn table_for(&self, unit: &TransferUnit) -> String {
        self.config
            .table
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| sanitize_identifier(unit.stem()))
    }

    pub(crate) async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError> {
        let the_table = self.table_for(unit);
        let reader = opener
            .open(unit)
            .await
            .with_context(|| format!("opening '{}' for COPY", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;
        let mut reader = BufReader::new(reader);

        let mut header_line = String::new();
        reader
            .read_line(&mut header_line)
            .await
            .with_context(|| format!("reading CSV header of '{}'", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;
        let columns = parse_header(&header_line)
            .with_context(|| format!("'{}' is not loadable CSV", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;

        let pg = self
            .config
            .connection
            .to_pg_config(self.connect_timeout)
            .map_err(|e| PipelineError::ConfigInvalid(format!("{e:#}")))?;
        let client = connect(&pg, self.connect_timeout)
            .await
            .with_context(|| {
                format!("connecting to destination database {}", self.config.connection.describe())
            })
            .map_err(|e| PipelineError::destination_unavailable(&e))?;

        ensure_schema(&client, &self.config.schema)
            .await
            .map_err(|e| PipelineError::destination_write_failed(&e))?;
        let ddl = create_table_sql(&self.config.schema, &the_table, &columns);
        debug!("🐘 {ddl}");
        client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("creating table {}.{}", self.config.schema, the_table))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;

        let copy_stmt = copy_sql(&self.config.schema, &the_table, &columns);
        let rows = stream_copy(&client, &copy_stmt, header_line, &mut reader)
            .await
            .with_context(|| {
                format!("COPY of '{}' into {}.{}", unit.name, self.config.schema, the_table)
            })
            .map_err(|e| PipelineError::destination_write_failed(&e))?;

        info!(
            "✅ loaded {rows} rows from '{}' into {}.{}",
            unit.name, self.config.schema, the_table
        );
        Ok(UnitWrite { rows: Some(rows) })
    }
}

/// 📁 `CREATE SCHEMA IF NOT EXISTS` still needs CREATE on the database, even when the schema
/// is already there. Look first, create only when it's missing.
async fn ensure_schema(client: &tokio_postgres::Client, schema: &str) -> Result<()> {
    let existing = client
        .query_opt(SCHEMA_EXISTS_SQL, &[&schema])
        .await
        .with_context(|| format!("looking up schema '{schema}'"))?;
    if existing.is_some() {
        return Ok(());
    }
    let ddl = create_schema_sql(schema);
    debug!("🐘 {ddl}");
    client
        .batch_execute(&ddl)
        .await
        .with_context(|| format!("creating schema '{schema}'"))
}

async fn stream_copy<R>(
    client: &tokio_postgres::Client,
    copy_stmt: &str,
    header_line: String,
    reader: &mut R,
) -> Result<u64>
where
    R: AsyncReadExt + Unpin,
{
    let sink = client.copy_in(copy_stmt).await.context("starting COPY")?;
    let mut sink = Box::pin(sink);

    // -- the header was consumed for DDL, COPY still expects it because HEADER true
    sink.send(Bytes::from(header_line.into_bytes()))
        .await
        .context("sending CSV header to COPY")?;

    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut buf).await.context("reading CSV body")?;
        if n == 0 {
            break;
        }
        sink.send(Bytes::copy_from_slice(&buf[..n]))
            .await
            .context("sending CSV chunk to COPY")?;
    }

    sink.as_mut().finish().await.context("finishing COPY")
}

fn parse_header(line: &str) -> Result<Vec<String>> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Err(anyhow!("💀 empty file or empty header line"));
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(trimmed.as_bytes());
    let record = reader
        .records()
        .next()
        .ok_or_else(|| anyhow!("💀 header line parsed to nothing"))?
        .context("💀 header line is not valid CSV")?;
    Ok(record.iter().map(|name| name.trim().to_string()).collect())
}

fn create_table_sql(schema: &str, table: &str, columns: &[String]) -> String {
    let column_defs = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({column_defs})",
        quote_identifier(schema),
        quote_identifier(table),
    )
}

fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema))
}

fn copy_sql(schema: &str, table: &str, columns: &[String]) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c).into_owned())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {}.{} ({column_list}) FROM STDIN WITH (FORMAT csv, HEADER true)",
        quote_identifier(schema),
        quote_identifier(table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_quoted_headers_with_commas_survive() {
        let the_columns = parse_header("id,\"last, first\",Amount\r\n").expect("💀 header");
        assert_eq!(the_columns, vec!["id", "last, first", "Amount"]);
        assert!(parse_header("\n").is_err());
    }

    #[test]
    fn the_one_where_every_identifier_gets_quoted_when_it_needs_it() {
        let columns = vec!["id".to_string(), "Order Total".to_string()];
        let the_ddl = create_table_sql("public", "orders", &columns);
        assert!(the_ddl.starts_with("CREATE TABLE IF NOT EXISTS"));
        assert!(the_ddl.contains("\"Order Total\" TEXT"));

        let the_copy = copy_sql("staging", "Orders", &columns);
        assert!(the_copy.starts_with("COPY "));
        assert!(the_copy.contains(".\"Orders\" ("));
        assert!(the_copy.contains("\"Order Total\""));
        assert!(the_copy.ends_with("FROM STDIN WITH (FORMAT csv, HEADER true)"));
    }

    #[test]
    fn the_one_where_table_ddl_never_touches_the_schema() {
        let columns = vec!["id".to_string()];
        let the_ddl = create_table_sql("public", "orders", &columns);
        assert!(!the_ddl.contains("SCHEMA"));
        assert!(!the_ddl.contains(';'));

        assert_eq!(create_schema_sql("staging"), "CREATE SCHEMA IF NOT EXISTS staging");
        assert!(create_schema_sql("Landing Zone").ends_with("\"Landing Zone\""));
        assert!(SCHEMA_EXISTS_SQL.contains("pg_namespace"));
        assert!(SCHEMA_EXISTS_SQL.contains("$1"));
    }

    #[test]
    fn the_one_where_the_table_falls_back_to_the_file_stem() {
        let the_loader = PostgresLoader::new(
            serde_json::from_value(serde_json::json!({
                "connection_string": "postgresql://u@db/dw"
            }))
            .expect("💀 settings"),
            Duration::from_secs(1),
        );
        assert_eq!(the_loader.config.schema, "public");
        let the_unit = TransferUnit::local("Daily Orders.csv", "/tmp/x", 0);
        assert_eq!(the_loader.table_for(&the_unit), "daily_orders");
    }
}

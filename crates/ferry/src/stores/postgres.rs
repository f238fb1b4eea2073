//! 🐘 PostgreSQL-backed config store and run ledger.
//!
//! ```text
//!   connectors(id, name, source_id, destination_id,
//!              source_overrides jsonb, destination_overrides jsonb)
//!   sources(id, kind, settings jsonb)
//!   destinations(id, kind, settings jsonb)
//!   connector_runs(id bigserial, connector_id, correlation_id, status,
//!                  started_at, finished_at, rows_ingested, log_summary)
//! ```
//!
//! Every column is cast on the way in and out, so an `integer` id column and a `bigint`
//! one look the same from here.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::{Client, Row};
use tracing::{debug, info};

use crate::backends::postgres::{connect, normalize_postgres_url};
use crate::connector::Settings;
use crate::ledger::{RunId, RunLedger, RunStatus};
use crate::resolver::{ConfigStore, ConnectorRecord, DefinitionRecord};

pub struct PostgresStore {
    client: Client,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// 🚀 Connect to the store database. Accepts `postgresql+psycopg2://` URLs too.
    pub async fn connect(database_url: &str, connect_timeout: Duration) -> Result<Self> {
        let normalized = normalize_postgres_url(database_url);
        let mut pg: tokio_postgres::Config = normalized
            .parse()
            .context("💀 store database URL is not a valid PostgreSQL URL")?;
        pg.connect_timeout(connect_timeout);
        let client = connect(&pg, connect_timeout)
            .await
            .context("💀 connecting to the connector store database")?;
        info!("🗄️ connected to the connector store");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn definition(&self, table: &str, id: i64) -> Result<Option<DefinitionRecord>> {
        let sql = format!(
            "SELECT id::bigint AS id, kind::text AS kind, settings::jsonb AS settings \
             FROM {table} WHERE id = $1::bigint"
        );
        let row = self
            .client
            .query_opt(sql.as_str(), &[&id])
            .await
            .with_context(|| format!("💀 reading {table} row {id}"))?;
        row.map(|row| -> Result<DefinitionRecord> {
            Ok(DefinitionRecord {
                id: row.try_get("id")?,
                kind: row.try_get::<_, Option<String>>("kind")?.unwrap_or_default(),
                settings: settings_column(&row, "settings")?,
            })
        })
        .transpose()
    }
}

fn settings_column(row: &Row, column: &str) -> Result<Settings> {
    let value: Option<Value> = row
        .try_get(column)
        .with_context(|| format!("💀 decoding jsonb column '{column}'"))?;
    match value {
        None | Some(Value::Null) => Ok(Settings::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => bail!("💀 column '{column}' holds {other}, expected a JSON object"),
    }
}

#[async_trait]
impl ConfigStore for PostgresStore {
    async fn connector(&self, connector_id: i64) -> Result<Option<ConnectorRecord>> {
        let row = self
            .client
            .query_opt(
                "SELECT id::bigint AS id, name::text AS name, \
                        source_id::bigint AS source_id, destination_id::bigint AS destination_id, \
                        source_overrides::jsonb AS source_overrides, \
                        destination_overrides::jsonb AS destination_overrides \
                 FROM connectors WHERE id = $1::bigint",
                &[&connector_id],
            )
            .await
            .with_context(|| format!("💀 reading connector {connector_id}"))?;

        row.map(|row| -> Result<ConnectorRecord> {
            Ok(ConnectorRecord {
                id: row.try_get("id")?,
                name: row.try_get::<_, Option<String>>("name")?.unwrap_or_default(),
                source_id: row.try_get("source_id")?,
                destination_id: row.try_get("destination_id")?,
                source_overrides: settings_column(&row, "source_overrides")?,
                destination_overrides: settings_column(&row, "destination_overrides")?,
            })
        })
        .transpose()
    }

    async fn source_definition(&self, source_id: i64) -> Result<Option<DefinitionRecord>> {
        self.definition("sources", source_id).await
    }

    async fn destination_definition(
        &self,
        destination_id: i64,
    ) -> Result<Option<DefinitionRecord>> {
        self.definition("destinations", destination_id).await
    }
}

#[async_trait]
impl RunLedger for PostgresStore {
    async fn begin(&self, connector_id: i64, correlation_id: &str) -> Result<RunId> {
        let row = self
            .client
            .query_one(
                "INSERT INTO connector_runs (connector_id, correlation_id, status, started_at) \
                 VALUES ($1::bigint, $2::text, $3::text, now()) RETURNING id::bigint AS id",
                &[&connector_id, &correlation_id, &RunStatus::Started.as_str()],
            )
            .await
            .context("💀 inserting connector_runs row")?;
        let id: i64 = row.try_get("id")?;
        debug!("📒 run {id} started for connector {connector_id}");
        Ok(RunId::Persisted(id))
    }

    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        rows_ingested: u64,
        log_summary: &str,
    ) -> Result<()> {
        let RunId::Persisted(id) = run_id else {
            debug!("📒 run {run_id} was never persisted, nothing to finish");
            return Ok(());
        };
        let rows = i64::try_from(rows_ingested).unwrap_or(i64::MAX);
        let updated = self
            .client
            .execute(
                "UPDATE connector_runs \
                 SET status = $2::text, finished_at = now(), \
                     rows_ingested = COALESCE($3::bigint, rows_ingested), \
                     log_summary = COALESCE($4::text, log_summary) \
                 WHERE id = $1::bigint",
                &[&id, &status.as_str(), &Some(rows), &Some(log_summary)],
            )
            .await
            .with_context(|| format!("💀 finishing connector_runs row {id}"))?;
        if updated == 0 {
            bail!("💀 connector_runs row {id} does not exist");
        }
        debug!("📒 run {id} finished as {status}");
        Ok(())
    }
}

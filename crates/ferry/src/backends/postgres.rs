//! 🐘 PostgreSQL plumbing shared by the cursor export, the COPY loader and the stores.
//!
//! One connect helper, one connection-settings struct, one URL normalizer. The backends
//! underneath decide what to actually say to the database.

mod export;
mod loader;

pub(crate) use export::{ExportWriter, PostgresExport, PostgresExportConfig};
pub(crate) use loader::{PostgresLoader, PostgresLoaderConfig};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::warn;

use crate::connector::lenient;

/// 🔌 Where a database lives and who we are when we get there.
///
/// Either a full `connection_string`, or the discrete host/port/database/username/password
/// keys. The string wins when both are present.
#[derive(Clone, Deserialize)]
pub(crate) struct PgConnectionConfig {
    #[serde(default, alias = "url")]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port", deserialize_with = "lenient::u16")]
    pub port: u16,
    #[serde(default, alias = "dbname")]
    pub database: Option<String>,
    #[serde(default, alias = "user")]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    5432
}

// -- 🔒 no passwords in logs, not even at trace level
impl fmt::Debug for PgConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnectionConfig")
            .field("connection_string", &self.connection_string.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .finish()
    }
}

impl PgConnectionConfig {
    pub(crate) fn to_pg_config(&self, connect_timeout: Duration) -> Result<PgConfig> {
        let mut pg = match self.connection_string.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => PgConfig::from_str(&normalize_postgres_url(raw))
                .context("💀 connection string is not a valid PostgreSQL URL")?,
            None => {
                let mut pg = PgConfig::new();
                if let Some(host) = &self.host {
                    pg.host(host);
                }
                pg.port(self.port);
                if let Some(database) = &self.database {
                    pg.dbname(database);
                }
                if let Some(username) = &self.username {
                    pg.user(username);
                }
                if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
                    pg.password(password);
                }
                pg
            }
        };
        pg.connect_timeout(connect_timeout);
        Ok(pg)
    }

    /// 🏷️ `host:port/db` for log lines and error contexts.
    pub(crate) fn describe(&self) -> String {
        match (&self.host, &self.database) {
            (Some(host), Some(db)) => format!("{host}:{}/{db}", self.port),
            _ if self.connection_string.is_some() => "<connection string>".to_string(),
            _ => "<unnamed database>".to_string(),
        }
    }
}

/// 🚀 Connect and park the connection future on its own task.
pub(crate) async fn connect(pg: &PgConfig, timeout: Duration) -> Result<Client> {
    let (client, connection) = tokio::time::timeout(timeout, pg.connect(NoTls))
        .await
        .context("💀 timed out connecting to PostgreSQL")?
        .context("💀 PostgreSQL refused to shake hands")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("🐘 PostgreSQL connection closed with an error: {e}");
        }
    });

    Ok(client)
}

/// 🧽 `postgresql+psycopg2://...` and friends become plain `postgresql://...`.
pub fn normalize_postgres_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((base, _driver)) if base.starts_with("postgres") => {
                format!("postgresql://{rest}")
            }
            _ => trimmed.to_string(),
        },
        None => trimmed.to_string(),
    }
}

/// 🏷️ Make an arbitrary string safe to use as an unquoted-looking identifier.
pub(crate) fn sanitize_identifier(raw: &str) -> String {
    let mut cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        cleaned.insert(0, '_');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_the_driver_suffix_gets_peeled_off() {
        assert_eq!(
            normalize_postgres_url("postgresql+psycopg2://u:p@db:5432/prefect"),
            "postgresql://u:p@db:5432/prefect"
        );
        assert_eq!(normalize_postgres_url(" postgres://u@db/x "), "postgres://u@db/x");
        assert_eq!(normalize_postgres_url("host=db user=u"), "host=db user=u");
    }

    #[test]
    fn the_one_where_discrete_keys_build_a_config_with_a_default_port() {
        let the_settings: PgConnectionConfig = serde_json::from_value(json!({
            "host": "db",
            "database": "shop",
            "username": "ro",
            "password": "hunter2",
        }))
        .expect("💀 settings parse");
        assert_eq!(the_settings.port, 5432);
        assert_eq!(the_settings.describe(), "db:5432/shop");

        let the_pg = the_settings.to_pg_config(Duration::from_secs(10)).expect("💀 pg config");
        assert_eq!(the_pg.get_dbname(), Some("shop"));
        assert_eq!(the_pg.get_user(), Some("ro"));
        assert_eq!(the_pg.get_ports(), &[5432]);
    }

    #[test]
    fn the_one_where_the_connection_string_wins() {
        let the_settings: PgConnectionConfig = serde_json::from_value(json!({
            "connection_string": "postgresql+psycopg2://loader@warehouse:6543/dw",
            "host": "ignored",
        }))
        .expect("💀 settings parse");
        let the_pg = the_settings.to_pg_config(Duration::from_secs(1)).expect("💀 pg config");
        assert_eq!(the_pg.get_dbname(), Some("dw"));
        assert_eq!(the_pg.get_ports(), &[6543]);
        assert!(!format!("{the_settings:?}").contains("loader@"));
    }

    #[test]
    fn the_one_where_identifiers_get_scrubbed() {
        assert_eq!(sanitize_identifier("Orders 2024-Q1"), "orders_2024_q1");
        assert_eq!(sanitize_identifier("2024_orders"), "_2024_orders");
        assert_eq!(sanitize_identifier(""), "_");
    }
}

//! 📒 The Run Ledger: one row per run, opened once, closed once, never erased.
//!
//! `begin` hands back a `RunId`. When the ledger is down the orchestrator mints a
//! `RunId::Ephemeral` instead and carries on moving data; finishing an ephemeral run is a
//! logged no-op for persistent ledgers. History with a hole beats no transfer at all.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// 🆔 Who is this run, as far as the ledger knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunId {
    Persisted(i64),
    Ephemeral(Uuid),
}

impl RunId {
    pub fn ephemeral() -> Self {
        Self::Ephemeral(Uuid::new_v4())
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted(id) => write!(f, "{id}"),
            Self::Ephemeral(uuid) => write!(f, "ephemeral-{uuid}"),
        }
    }
}

/// 🚦 `Started` on insert; exactly one move to `Success` or `Failed` after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 📝 One ledger row, as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub connector_id: i64,
    pub correlation_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_ingested: Option<u64>,
    pub log_summary: Option<String>,
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Insert a `started` row and return its id.
    async fn begin(&self, connector_id: i64, correlation_id: &str) -> Result<RunId>;

    /// Move the run to its terminal status. Called once per run.
    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        rows_ingested: u64,
        log_summary: &str,
    ) -> Result<()>;
}

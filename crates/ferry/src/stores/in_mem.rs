use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;

use crate::ledger::{RunId, RunLedger, RunRecord, RunStatus};
use crate::resolver::{ConfigStore, ConnectorRecord, DefinitionRecord};

/// 🧪 Connector definitions in a HashMap. Nothing persists, nothing needs to.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    connectors: Mutex<HashMap<i64, ConnectorRecord>>,
    sources: Mutex<HashMap<i64, DefinitionRecord>>,
    destinations: Mutex<HashMap<i64, DefinitionRecord>>,
}

impl InMemoryConfigStore {
    pub fn put_connector(&self, record: ConnectorRecord) {
        lock(&self.connectors).insert(record.id, record);
    }

    pub fn put_source(&self, record: DefinitionRecord) {
        lock(&self.sources).insert(record.id, record);
    }

    pub fn put_destination(&self, record: DefinitionRecord) {
        lock(&self.destinations).insert(record.id, record);
    }
}

// -- a poisoned test mutex still holds perfectly good data
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn connector(&self, connector_id: i64) -> Result<Option<ConnectorRecord>> {
        Ok(lock(&self.connectors).get(&connector_id).cloned())
    }

    async fn source_definition(&self, source_id: i64) -> Result<Option<DefinitionRecord>> {
        Ok(lock(&self.sources).get(&source_id).cloned())
    }

    async fn destination_definition(
        &self,
        destination_id: i64,
    ) -> Result<Option<DefinitionRecord>> {
        Ok(lock(&self.destinations).get(&destination_id).cloned())
    }
}

/// 🧪 A ledger you can read back, and break on purpose.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    next_id: AtomicI64,
    records: Mutex<Vec<RunRecord>>,
    finish_calls: Mutex<Vec<RunId>>,
    fail_begin: AtomicBool,
}

impl InMemoryLedger {
    /// Make every `begin` fail, as if the ledger database were down.
    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<RunRecord> {
        lock(&self.records).clone()
    }

    /// Every `finish` ever called, ephemeral ids included.
    pub fn finish_calls(&self) -> Vec<RunId> {
        lock(&self.finish_calls).clone()
    }
}

#[async_trait]
impl RunLedger for InMemoryLedger {
    async fn begin(&self, connector_id: i64, correlation_id: &str) -> Result<RunId> {
        if self.fail_begin.load(Ordering::SeqCst) {
            bail!("💀 ledger is down (on purpose)");
        }
        let run_id = RunId::Persisted(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.records).push(RunRecord {
            run_id,
            connector_id,
            correlation_id: correlation_id.to_string(),
            status: RunStatus::Started,
            started_at: Utc::now(),
            finished_at: None,
            rows_ingested: None,
            log_summary: None,
        });
        Ok(run_id)
    }

    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        rows_ingested: u64,
        log_summary: &str,
    ) -> Result<()> {
        lock(&self.finish_calls).push(run_id);
        if run_id.is_ephemeral() {
            return Ok(());
        }

        let mut records = lock(&self.records);
        let record = records
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| anyhow!("💀 run {run_id} was never begun"))?;
        if record.status.is_terminal() {
            bail!("💀 run {run_id} is already {}", record.status);
        }
        record.status = status;
        record.finished_at = Some(Utc::now());
        record.rows_ingested = Some(rows_ingested);
        record.log_summary = Some(log_summary.to_string());
        Ok(())
    }
}

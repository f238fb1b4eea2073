//! 🎬 The Pipeline Orchestrator: one connector id in, one `RunOutcome` out, and exactly one
//! ledger row closed behind it.
//!
//! ```text
//!   Initializing ──▶ Resolving ──▶ Transferring ──▶ Finalizing ──▶ Succeeded | Failed
//!        │ begin        │ resolve      │ route + move       │ finish (always, once)
//! ```
//!
//! `run` never returns an error and never panics outward. Every failure ends up as
//! `{status: failed, log_summary}` and a finished ledger row.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app_config::RuntimeConfig;
use crate::backends::{Sink, SinkBackend, Source, SourceBackend};
use crate::common::{LocalFiles, UnitLocation, UnitOutcome};
use crate::errors::{PipelineError, truncate_chars};
use crate::ledger::{RunId, RunLedger, RunStatus};
use crate::resolver::{ConfigStore, resolve};
use crate::router::{BackendContext, TransferPlan};
use crate::workers::{panic_message, transfer_all};

/// Upper bound on `log_summary`, in characters.
pub const MAX_LOG_SUMMARY_CHARS: usize = 2000;

/// 📦 What a run reports back, to the caller and to the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub rows_ingested: u64,
    pub log_summary: String,
    #[serde(skip)]
    pub run_id: RunId,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Initializing,
    Resolving,
    Transferring,
    Finalizing,
    Succeeded,
    Failed,
}

/// What Transferring hands to Finalizing.
#[derive(Debug)]
struct Transferred {
    status: RunStatus,
    rows_ingested: u64,
    summary: String,
}

impl Transferred {
    fn success(rows_ingested: u64, summary: impl Into<String>) -> Self {
        Self { status: RunStatus::Success, rows_ingested, summary: summary.into() }
    }
}

/// 🎬 The orchestrator. Cheap to share; every run is independent.
pub struct Pipeline {
    store: Arc<dyn ConfigStore>,
    ledger: Arc<dyn RunLedger>,
    runtime: RuntimeConfig,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("runtime", &self.runtime).finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        ledger: Arc<dyn RunLedger>,
        runtime: RuntimeConfig,
    ) -> Self {
        Self { store, ledger, runtime }
    }

    /// 🚀 Run one connector end to end.
    pub async fn run(&self, connector_id: i64, correlation_id: Option<String>) -> RunOutcome {
        let mut state = PipelineState::Initializing;
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("manual-{connector_id}-{}", Utc::now().timestamp()));
        info!("🚀 connector {connector_id} starting (correlation id '{correlation_id}')");

        let run_id = match self.ledger.begin(connector_id, &correlation_id).await {
            Ok(run_id) => run_id,
            Err(e) => {
                let the_ephemeral = RunId::ephemeral();
                warn!("⚠️ run ledger unavailable, continuing as {the_ephemeral}: {e:#}");
                the_ephemeral
            }
        };

        let attempt =
            AssertUnwindSafe(self.execute(connector_id, run_id, &mut state)).catch_unwind().await;
        let transferred = match attempt {
            Ok(Ok(transferred)) => transferred,
            Ok(Err(e)) => {
                error!("❌ connector {connector_id} failed: {}", e.summary_line());
                let summary = e.summary_line();
                Transferred { status: RunStatus::Failed, rows_ingested: 0, summary }
            }
            Err(payload) => {
                let the_message = panic_message(payload.as_ref());
                error!("💀 connector {connector_id} panicked: {the_message}");
                Transferred {
                    status: RunStatus::Failed,
                    rows_ingested: 0,
                    summary: format!("pipeline panicked: {the_message}"),
                }
            }
        };

        transition(&mut state, PipelineState::Finalizing);
        let log_summary = truncate_chars(&transferred.summary, MAX_LOG_SUMMARY_CHARS);
        if let Err(e) = self
            .ledger
            .finish(run_id, transferred.status, transferred.rows_ingested, &log_summary)
            .await
        {
            error!("💀 could not finish run {run_id} in the ledger: {e:#}");
        }

        transition(
            &mut state,
            match transferred.status {
                RunStatus::Success => PipelineState::Succeeded,
                _ => PipelineState::Failed,
            },
        );
        info!(
            "🏁 connector {connector_id} run {run_id}: {} ({} rows)",
            transferred.status, transferred.rows_ingested
        );
        RunOutcome {
            status: transferred.status,
            rows_ingested: transferred.rows_ingested,
            log_summary,
            run_id,
        }
    }

    async fn execute(
        &self,
        connector_id: i64,
        run_id: RunId,
        state: &mut PipelineState,
    ) -> Result<Transferred, PipelineError> {
        transition(state, PipelineState::Resolving);
        let template_vars = self.runtime.template_vars();
        let config = resolve(self.store.as_ref(), connector_id, &template_vars).await?;
        info!(
            "🧩 connector '{}': {} → {}",
            config.connector_name, config.source_kind, config.destination_kind
        );

        transition(state, PipelineState::Transferring);
        let ctx = BackendContext::for_run(&self.runtime, run_id);
        let plan = TransferPlan::build(&config, &ctx).await?;
        match plan {
            TransferPlan::Raw { source, sink } => {
                let concurrency_limit = self.runtime.concurrency_limit;
                self.move_files(source, sink, concurrency_limit, RowCount::Units).await
            }
            TransferPlan::FilesIntoDatabase { source, sink } => {
                self.move_files(source, sink, 1, RowCount::Loaded).await
            }
            TransferPlan::ExportThenLoad { export, sink } => {
                let Some(unit) = export.export().await? else {
                    let summary = "Query returned no rows. No CSV file created.";
                    return Ok(Transferred::success(0, summary));
                };
                let rows_exported = unit.rows.unwrap_or(0);
                // -- on failure the export stays in its run directory for inspection
                sink.write(&unit, &LocalFiles).await?;
                if let UnitLocation::Local(path) = &unit.location {
                    clean_up_export(path, &ctx.export_dir).await;
                }
                Ok(Transferred::success(
                    rows_exported,
                    format!("Exported {rows_exported} rows to '{}' and delivered it.", unit.name),
                ))
            }
        }
    }

    async fn move_files(
        &self,
        source: SourceBackend,
        sink: SinkBackend,
        concurrency_limit: usize,
        row_count: RowCount,
    ) -> Result<Transferred, PipelineError> {
        let options = source.options().clone();
        let units = source.list().await?;
        if units.is_empty() {
            if options.require_matches {
                return Err(PipelineError::ConfigInvalid(format!(
                    "no files matched pattern '{}' and matches are required",
                    options.file_pattern
                )));
            }
            let summary = format!("No files matched pattern '{}'.", options.file_pattern);
            return Ok(Transferred::success(0, summary));
        }

        let outcomes = transfer_all(
            units,
            Arc::new(source),
            Arc::new(sink),
            concurrency_limit,
            options.delete_after_transfer,
        )
        .await;
        Ok(tally(&outcomes, row_count))
    }
}

/// What `rows_ingested` counts for a multi-unit transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowCount {
    /// one per delivered file
    Units,
    /// rows reported by the sink
    Loaded,
}

fn tally(outcomes: &[UnitOutcome], row_count: RowCount) -> Transferred {
    let succeeded: Vec<&UnitOutcome> = outcomes.iter().filter(|o| o.is_success()).collect();
    let mut reasons: Vec<String> = Vec::new();
    for outcome in outcomes {
        if let Err(e) = &outcome.result {
            let reason = format!("{}: {}", outcome.unit.name, e.summary_line());
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
        }
    }

    let rows_ingested = match row_count {
        RowCount::Units => succeeded.len() as u64,
        RowCount::Loaded => succeeded
            .iter()
            .filter_map(|o| o.result.as_ref().ok().and_then(|w| w.rows))
            .sum(),
    };
    let headline = format!("Transferred {} of {} files.", succeeded.len(), outcomes.len());
    let summary = if reasons.is_empty() {
        headline
    } else {
        format!("{headline} Failures: {}", reasons.join("; "))
    };

    Transferred {
        status: if succeeded.is_empty() { RunStatus::Failed } else { RunStatus::Success },
        rows_ingested,
        summary,
    }
}

/// 🧹 A delivered export takes its run directory with it.
async fn clean_up_export(path: &Path, run_dir: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("⚠️ export file '{}' delivered but not cleaned up: {e}", path.display());
        return;
    }
    if let Err(e) = tokio::fs::remove_dir(run_dir).await {
        debug!("🧹 leaving export directory '{}' in place: {e}", run_dir.display());
    }
}

fn transition(state: &mut PipelineState, next: PipelineState) {
    debug!("🔄 {state:?} → {next:?}");
    *state = next;
}

//! 🧵 Workers: the fan-out that moves units while the orchestrator waits for the tally.
//!
//! ```text
//!   units ──▶ [async-channel] ──▶ TransferWorker ×N ──▶ [async-channel] ──▶ outcomes
//!                                   │ write (panic-proof)
//!                                   └ consume on success, when asked
//! ```
//!
//! N is `min(units, concurrency_limit)`. Nobody spawns a worker just to watch an empty queue.
//! Every unit comes back out as exactly one `UnitOutcome`, even the ones whose worker died.
//! Units ride the channels with their position in the listing, which is what identifies them.
//! Two units that would land under the same destination name never start.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::{Sink, Source};
use crate::common::{TransferUnit, UnitOutcome};
use crate::errors::PipelineError;

mod transfer_worker;
pub(crate) use transfer_worker::TransferWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 🚀 Transfer every unit with bounded concurrency. Outcomes come back sorted by name.
pub(crate) async fn transfer_all<Src, Snk>(
    units: Vec<TransferUnit>,
    source: Arc<Src>,
    sink: Arc<Snk>,
    concurrency_limit: usize,
    delete_after_transfer: bool,
) -> Vec<UnitOutcome>
where
    Src: Source + 'static,
    Snk: Sink + 'static,
{
    if units.is_empty() {
        return Vec::new();
    }

    let (units, mut outcomes) = split_name_clashes(units);
    if units.is_empty() {
        outcomes.sort_by(|a, b| a.unit.name.cmp(&b.unit.name));
        return outcomes;
    }

    let worker_count = units.len().min(concurrency_limit.max(1));
    info!("🧵 transferring {} units with {worker_count} workers", units.len());

    let (unit_tx, unit_rx) = async_channel::unbounded::<(usize, TransferUnit)>();
    let (outcome_tx, outcome_rx) = async_channel::unbounded::<(usize, UnitOutcome)>();

    for (slot, unit) in units.iter().enumerate() {
        // -- unbounded and we still hold the receiver, so this cannot fail
        let _ = unit_tx.send((slot, unit.clone())).await;
    }
    unit_tx.close();

    let handles: Vec<JoinHandle<Result<()>>> = (0..worker_count)
        .map(|worker_id| {
            TransferWorker::new(
                worker_id,
                unit_rx.clone(),
                outcome_tx.clone(),
                Arc::clone(&source),
                Arc::clone(&sink),
                delete_after_transfer,
            )
            .start()
        })
        .collect();
    drop(outcome_tx);
    drop(unit_rx);

    for (worker_id, joined) in futures::future::join_all(handles).await.into_iter().enumerate() {
        match joined {
            Ok(Ok(())) => debug!("🏁 worker {worker_id} done"),
            Ok(Err(e)) => error!("💀 worker {worker_id} stopped early: {e:#}"),
            Err(join_err) => error!("💀 worker {worker_id} died: {join_err}"),
        }
    }

    let mut slots: Vec<Option<UnitOutcome>> = units.iter().map(|_| None).collect();
    while let Ok((slot, outcome)) = outcome_rx.try_recv() {
        if let Some(entry) = slots.get_mut(slot) {
            *entry = Some(outcome);
        }
    }

    // -- a slot with no outcome went down with its worker
    for (unit, slot) in units.into_iter().zip(slots) {
        let outcome = slot.unwrap_or_else(|| {
            let message =
                format!("'{}' ({}) was lost when its worker stopped", unit.name, unit.location);
            UnitOutcome { unit, result: Err(PipelineError::DestinationWriteFailed(message)) }
        });
        outcomes.push(outcome);
    }

    outcomes.sort_by(|a, b| a.unit.name.cmp(&b.unit.name));
    outcomes
}

/// 🪢 Pull out every unit whose destination name is shared with another one. Both would
/// write the same target, so none of them go and each gets a failed outcome naming the rest.
fn split_name_clashes(units: Vec<TransferUnit>) -> (Vec<TransferUnit>, Vec<UnitOutcome>) {
    let mut by_name: HashMap<&str, Vec<String>> = HashMap::new();
    for unit in &units {
        by_name.entry(unit.name.as_str()).or_default().push(unit.location.to_string());
    }
    let clashes: HashMap<String, String> = by_name
        .into_iter()
        .filter(|(_, locations)| locations.len() > 1)
        .map(|(name, locations)| (name.to_string(), locations.join(", ")))
        .collect();
    if clashes.is_empty() {
        return (units, Vec::new());
    }

    let mut clear = Vec::with_capacity(units.len());
    let mut refused = Vec::new();
    for unit in units {
        match clashes.get(&unit.name) {
            Some(locations) => {
                warn!("🪢 '{}' is claimed by more than one source unit: {locations}", unit.name);
                let message = format!(
                    "'{}' would overwrite another unit of the same name ({locations})",
                    unit.name
                );
                let result = Err(PipelineError::DestinationWriteFailed(message));
                refused.push(UnitOutcome { unit, result });
            }
            None => clear.push(unit),
        }
    }
    (clear, refused)
}

/// Best-effort text out of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{
        FileSink, FileSinkConfig, FileSource, FileSourceConfig, SinkBackend, SourceBackend,
    };
    use crate::common::{UnitOpener, UnitReader, UnitWrite};
    use crate::errors::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn file_source(dir: &std::path::Path) -> SourceBackend {
        let config: FileSourceConfig =
            serde_json::from_value(serde_json::json!({ "path": dir })).expect("💀 settings");
        SourceBackend::Filesystem(FileSource::new(config).expect("💀 source"))
    }

    fn file_sink(dir: &std::path::Path) -> SinkBackend {
        let config: FileSinkConfig =
            serde_json::from_value(serde_json::json!({ "path": dir })).expect("💀 settings");
        SinkBackend::Filesystem(FileSink::new(config))
    }

    #[tokio::test]
    async fn the_one_where_every_file_lands_and_the_source_empties() {
        let inbox = tempfile::tempdir().expect("💀 tempdir");
        let outbox = tempfile::tempdir().expect("💀 tempdir");
        for name in ["c.pdf", "a.pdf", "b.pdf"] {
            std::fs::write(inbox.path().join(name), name).expect("💀 fixture");
        }
        let the_source = Arc::new(file_source(inbox.path()));
        let units = the_source.list().await.expect("💀 list");

        let the_outcomes =
            transfer_all(units, the_source, Arc::new(file_sink(outbox.path())), 2, true).await;

        let the_names: Vec<&str> = the_outcomes.iter().map(|o| o.unit.name.as_str()).collect();
        assert_eq!(the_names, vec!["a.pdf", "b.pdf", "c.pdf"]);
        assert!(the_outcomes.iter().all(UnitOutcome::is_success));
        let the_copy = std::fs::read_to_string(outbox.path().join("b.pdf")).expect("💀 read");
        assert_eq!(the_copy, "b.pdf");
        assert_eq!(std::fs::read_dir(inbox.path()).expect("💀 read_dir").count(), 0);
    }

    #[tokio::test]
    async fn the_one_where_copy_mode_leaves_the_originals_alone() {
        let inbox = tempfile::tempdir().expect("💀 tempdir");
        let outbox = tempfile::tempdir().expect("💀 tempdir");
        std::fs::write(inbox.path().join("keep.csv"), "a,b\n").expect("💀 fixture");
        let the_source = Arc::new(file_source(inbox.path()));
        let units = the_source.list().await.expect("💀 list");

        let the_outcomes =
            transfer_all(units, the_source, Arc::new(file_sink(outbox.path())), 4, false).await;

        assert!(the_outcomes[0].is_success());
        assert!(inbox.path().join("keep.csv").exists());
        assert!(outbox.path().join("keep.csv").exists());
    }

    #[derive(Debug)]
    struct GrumpySink {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Sink for GrumpySink {
        async fn write(
            &self,
            unit: &TransferUnit,
            _opener: &dyn UnitOpener,
        ) -> Result<UnitWrite, PipelineError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match unit.name.as_str() {
                "boom.pdf" => panic!("the sink tripped over its own feet"),
                "nope.pdf" => Err(PipelineError::DestinationWriteFailed("nope".into())),
                _ => Ok(UnitWrite::default()),
            }
        }
    }

    #[derive(Debug)]
    struct NamesOnly;

    #[async_trait]
    impl UnitOpener for NamesOnly {
        async fn open(&self, _unit: &TransferUnit) -> Result<UnitReader> {
            Ok(Box::new(tokio::io::empty()))
        }
    }

    #[async_trait]
    impl Source for NamesOnly {
        async fn list(&self) -> Result<Vec<TransferUnit>, PipelineError> {
            Ok(Vec::new())
        }

        async fn consume(&self, unit: &TransferUnit) -> Result<()> {
            anyhow::bail!("'{}' should never be consumed", unit.name)
        }
    }

    #[tokio::test]
    async fn the_one_where_a_panic_is_just_another_failed_unit() {
        let units: Vec<TransferUnit> = ["ok-1.pdf", "boom.pdf", "nope.pdf", "ok-2.pdf", "ok-3.pdf"]
            .into_iter()
            .map(|name| TransferUnit::local(name, format!("/nowhere/{name}"), 1))
            .collect();
        let the_sink =
            Arc::new(GrumpySink { in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) });

        let the_outcomes =
            transfer_all(units, Arc::new(NamesOnly), Arc::clone(&the_sink), 2, false).await;

        assert_eq!(the_outcomes.len(), 5);
        let the_failures: Vec<(&str, ErrorKind)> = the_outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.unit.name.as_str(), e.kind())))
            .collect();
        assert_eq!(
            the_failures,
            vec![
                ("boom.pdf", ErrorKind::DestinationWriteFailed),
                ("nope.pdf", ErrorKind::DestinationWriteFailed),
            ]
        );
        assert!(the_sink.peak.load(Ordering::SeqCst) <= 2);
    }

    /// Falls over while consuming its first unit, taking the worker down with it.
    #[derive(Debug)]
    struct FragileConsume;

    #[async_trait]
    impl UnitOpener for FragileConsume {
        async fn open(&self, _unit: &TransferUnit) -> Result<UnitReader> {
            Ok(Box::new(tokio::io::empty()))
        }
    }

    #[async_trait]
    impl Source for FragileConsume {
        async fn list(&self) -> Result<Vec<TransferUnit>, PipelineError> {
            Ok(Vec::new())
        }

        async fn consume(&self, unit: &TransferUnit) -> Result<()> {
            if unit.name == "first.pdf" {
                panic!("the source fell over while deleting");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn the_one_where_a_dead_worker_still_leaves_an_outcome_for_every_unit() {
        let units = vec![
            TransferUnit::object("first.pdf", "raw", "in/first.pdf", 1),
            TransferUnit::object("second.pdf", "raw", "in/second.pdf", 1),
        ];
        let the_sink =
            Arc::new(GrumpySink { in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) });

        let the_outcomes = transfer_all(units, Arc::new(FragileConsume), the_sink, 1, true).await;

        assert_eq!(the_outcomes.len(), 2);
        let the_lost = &the_outcomes[0];
        assert_eq!(the_lost.unit.name, "first.pdf");
        let the_error = the_lost.result.as_ref().expect_err("💀 a lost unit should fail");
        assert!(the_error.to_string().contains("s3://raw/in/first.pdf"));
        assert_eq!(the_outcomes[1].unit.name, "second.pdf");
        assert!(the_outcomes[1].result.is_err());
    }

    #[tokio::test]
    async fn the_one_where_same_named_objects_from_different_folders_never_start() {
        let units = vec![
            TransferUnit::object("report.pdf", "raw", "in/2024/report.pdf", 1),
            TransferUnit::object("report.pdf", "raw", "in/2025/report.pdf", 1),
            TransferUnit::object("solo.pdf", "raw", "in/solo.pdf", 1),
        ];
        let the_sink =
            Arc::new(GrumpySink { in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) });

        let the_outcomes =
            transfer_all(units, Arc::new(NamesOnly), Arc::clone(&the_sink), 4, false).await;

        assert_eq!(the_outcomes.len(), 3);
        let the_clashes: Vec<&UnitOutcome> =
            the_outcomes.iter().filter(|o| o.unit.name == "report.pdf").collect();
        assert_eq!(the_clashes.len(), 2);
        for clash in the_clashes {
            let the_error = clash.result.as_ref().expect_err("💀 a clash should fail");
            assert_eq!(the_error.kind(), ErrorKind::DestinationWriteFailed);
            assert!(the_error.to_string().contains("s3://raw/in/2024/report.pdf"));
            assert!(the_error.to_string().contains("s3://raw/in/2025/report.pdf"));
        }
        let the_solo = the_outcomes.iter().find(|o| o.unit.name == "solo.pdf").expect("💀 solo");
        assert!(the_solo.is_success());
        assert_eq!(the_sink.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn the_one_where_nothing_to_do_spawns_nobody() {
        let the_sink =
            Arc::new(GrumpySink { in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let the_outcomes =
            transfer_all(Vec::new(), Arc::new(NamesOnly), Arc::clone(&the_sink), 8, true).await;
        assert!(the_outcomes.is_empty());
        assert_eq!(the_sink.peak.load(Ordering::SeqCst), 0);
    }
}

//! 🚚 The TransferWorker: pulls a unit, writes it, reports back, repeat until the queue runs dry.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Worker, panic_message};
use crate::backends::{Sink, Source};
use crate::common::{TransferUnit, UnitOutcome, UnitWrite};
use crate::errors::PipelineError;

#[derive(Debug)]
pub(crate) struct TransferWorker<Src, Snk> {
    worker_id: usize,
    rx: Receiver<(usize, TransferUnit)>,
    outcomes: Sender<(usize, UnitOutcome)>,
    source: Arc<Src>,
    sink: Arc<Snk>,
    delete_after_transfer: bool,
}

impl<Src, Snk> TransferWorker<Src, Snk>
where
    Src: Source + 'static,
    Snk: Sink + 'static,
{
    pub(crate) fn new(
        worker_id: usize,
        rx: Receiver<(usize, TransferUnit)>,
        outcomes: Sender<(usize, UnitOutcome)>,
        source: Arc<Src>,
        sink: Arc<Snk>,
        delete_after_transfer: bool,
    ) -> Self {
        Self { worker_id, rx, outcomes, source, sink, delete_after_transfer }
    }

    async fn transfer_one(&self, unit: &TransferUnit) -> Result<UnitWrite, PipelineError> {
        let attempt = AssertUnwindSafe(self.sink.write(unit, self.source.as_ref()))
            .catch_unwind()
            .await;
        match attempt {
            Ok(result) => result,
            Err(payload) => Err(PipelineError::DestinationWriteFailed(format!(
                "sink panicked while writing '{}': {}",
                unit.name,
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl<Src, Snk> Worker for TransferWorker<Src, Snk>
where
    Src: Source + 'static,
    Snk: Sink + 'static,
{
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 worker {} draining the unit queue", self.worker_id);
            while let Ok((slot, unit)) = self.rx.recv().await {
                let result = self.transfer_one(&unit).await;
                match &result {
                    Ok(_) => {
                        info!("✅ '{}' delivered", unit.name);
                        if self.delete_after_transfer
                            && let Err(e) = self.source.consume(&unit).await
                        {
                            // -- a failed consume never fails a delivered unit
                            let name = &unit.name;
                            warn!("⚠️ '{name}' delivered but not removed from the source: {e:#}");
                        }
                    }
                    Err(e) => warn!("❌ '{}' failed: {}", unit.name, e.summary_line()),
                }
                self.outcomes.send((slot, UnitOutcome { unit, result })).await.map_err(|_| {
                    anyhow::anyhow!("💀 outcome channel closed under worker {}", self.worker_id)
                })?;
            }
            debug!("🏁 worker {}: queue closed and empty", self.worker_id);
            Ok(())
        })
    }
}

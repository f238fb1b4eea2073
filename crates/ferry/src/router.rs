//! 🧭 The Transfer Router: two kinds in, one strategy out.
//!
//! ```text
//!                     │ database │ object_store │ sftp │ filesystem │ rest_api
//!   ──────────────────┼──────────┼──────────────┼──────┼────────────┼─────────
//!   database          │    EL    │      EL      │  EL  │     EL     │   ✗
//!   object_store      │    EL    │     raw      │ raw  │    raw     │  raw
//!   filesystem        │    EL    │     raw      │ raw  │    raw     │  raw
//! ```
//!
//! raw = bytes move untouched, one unit per file, fanned out to workers.
//! EL  = extract-load: export or read CSV, then load it, strictly in sequence.
//! ✗   = `UnsupportedPipelineShape`, decided before a single backend is built.

use std::path::PathBuf;
use std::time::Duration;

use crate::app_config::RuntimeConfig;
use crate::backends::{
    FileSink, FileSinkConfig, FileSource, FileSourceConfig, PostgresExport, PostgresExportConfig,
    PostgresLoader, PostgresLoaderConfig, RestSink, RestSinkConfig, S3Sink, S3SinkConfig, S3Source,
    S3SourceConfig, SftpSink, SftpSinkConfig, SinkBackend, SourceBackend, same_place,
};
use crate::connector::{ConnectorConfig, DestinationKind, Settings, SourceKind, settings_into};
use crate::errors::PipelineError;
use crate::ledger::RunId;

/// 🛣️ How a run moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    RawTransfer,
    ExtractLoad,
}

/// 🧭 Pure decision table. No I/O, no settings, just kinds.
pub fn route(
    source_kind: SourceKind,
    destination_kind: DestinationKind,
) -> Result<TransferMode, PipelineError> {
    use DestinationKind as D;
    use SourceKind as S;

    match (source_kind, destination_kind) {
        (S::Database, D::Rest) => Err(PipelineError::UnsupportedPipelineShape {
            source_kind,
            destination_kind,
        }),
        (S::Database, _) => Ok(TransferMode::ExtractLoad),
        (S::ObjectStore | S::Filesystem, D::Database) => Ok(TransferMode::ExtractLoad),
        (S::ObjectStore | S::Filesystem, D::ObjectStore | D::Sftp | D::Filesystem | D::Rest) => {
            Ok(TransferMode::RawTransfer)
        }
    }
}

/// 🏗️ What the orchestrator actually runs: typed backends, built once per run.
#[derive(Debug)]
pub(crate) enum TransferPlan {
    /// Files in, files out, via the worker pool.
    Raw { source: SourceBackend, sink: SinkBackend },
    /// Query → CSV export → any file-accepting or database sink.
    ExportThenLoad { export: PostgresExport, sink: SinkBackend },
    /// CSV files → COPY, one at a time.
    FilesIntoDatabase { source: SourceBackend, sink: SinkBackend },
}

/// ⏱️ Runtime knobs the backends need at construction time.
#[derive(Debug, Clone)]
pub(crate) struct BackendContext {
    /// Private to one run. Two exports never share a directory, whatever their file names.
    pub export_dir: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl BackendContext {
    pub(crate) fn for_run(runtime: &RuntimeConfig, run_id: RunId) -> Self {
        let run_dir = format!("run-{run_id}-{}", uuid::Uuid::new_v4().simple());
        Self {
            export_dir: runtime.export_dir.join(run_dir),
            connect_timeout: Duration::from_secs(runtime.connect_timeout_secs),
            request_timeout: Duration::from_secs(runtime.request_timeout_secs),
        }
    }
}

impl TransferPlan {
    /// Route, then build. Type errors in settings surface here as `ConfigInvalid`.
    pub(crate) async fn build(
        config: &ConnectorConfig,
        ctx: &BackendContext,
    ) -> Result<Self, PipelineError> {
        let mode = route(config.source_kind, config.destination_kind)?;
        let sink = build_sink(config.destination_kind, &config.destination_settings, ctx).await?;

        match (mode, config.source_kind) {
            (TransferMode::ExtractLoad, SourceKind::Database) => {
                let export_config: PostgresExportConfig =
                    settings_into(&config.source_settings, "database source")?;
                let export =
                    PostgresExport::new(export_config, ctx.export_dir.clone(), ctx.connect_timeout);
                Ok(Self::ExportThenLoad { export, sink })
            }
            (TransferMode::ExtractLoad, _) => Ok(Self::FilesIntoDatabase {
                source: build_source(config.source_kind, &config.source_settings, ctx).await?,
                sink,
            }),
            (TransferMode::RawTransfer, _) => {
                let source = build_source(config.source_kind, &config.source_settings, ctx).await?;
                refuse_a_loop(&source, &sink).await?;
                Ok(Self::Raw { source, sink })
            }
        }
    }
}

/// 🔁 A directory copied into itself. Every file would be renamed over itself and then
/// consumed.
async fn refuse_a_loop(source: &SourceBackend, sink: &SinkBackend) -> Result<(), PipelineError> {
    if let (SourceBackend::Filesystem(from), SinkBackend::Filesystem(to)) = (source, sink)
        && same_place(from.dir(), to.dir()).await
    {
        return Err(PipelineError::ConfigInvalid(format!(
            "source and destination are the same directory ('{}')",
            from.dir().display()
        )));
    }
    Ok(())
}

async fn build_source(
    kind: SourceKind,
    settings: &Settings,
    ctx: &BackendContext,
) -> Result<SourceBackend, PipelineError> {
    match kind {
        SourceKind::ObjectStore => {
            let source_config: S3SourceConfig = settings_into(settings, "object store source")?;
            Ok(SourceBackend::ObjectStore(S3Source::new(source_config, ctx.connect_timeout).await?))
        }
        SourceKind::Filesystem => {
            let source_config: FileSourceConfig = settings_into(settings, "filesystem source")?;
            Ok(SourceBackend::Filesystem(FileSource::new(source_config)?))
        }
        SourceKind::Database => Err(PipelineError::ConfigInvalid(
            "a database source exports rows, it does not list files".to_string(),
        )),
    }
}

async fn build_sink(
    kind: DestinationKind,
    settings: &Settings,
    ctx: &BackendContext,
) -> Result<SinkBackend, PipelineError> {
    Ok(match kind {
        DestinationKind::ObjectStore => {
            let sink_config: S3SinkConfig = settings_into(settings, "object store destination")?;
            SinkBackend::ObjectStore(S3Sink::new(sink_config, ctx.connect_timeout).await)
        }
        DestinationKind::Sftp => {
            let sink_config: SftpSinkConfig = settings_into(settings, "sftp destination")?;
            SinkBackend::Sftp(SftpSink::new(sink_config, ctx.connect_timeout, ctx.request_timeout))
        }
        DestinationKind::Filesystem => {
            let sink_config: FileSinkConfig = settings_into(settings, "filesystem destination")?;
            SinkBackend::Filesystem(FileSink::new(sink_config))
        }
        DestinationKind::Rest => {
            let sink_config: RestSinkConfig = settings_into(settings, "rest destination")?;
            SinkBackend::Rest(RestSink::new(sink_config, ctx.connect_timeout, ctx.request_timeout)?)
        }
        DestinationKind::Database => {
            let sink_config: PostgresLoaderConfig =
                settings_into(settings, "database destination")?;
            SinkBackend::Database(PostgresLoader::new(sink_config, ctx.connect_timeout))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    const ALL_SOURCES: [SourceKind; 3] =
        [SourceKind::Database, SourceKind::ObjectStore, SourceKind::Filesystem];
    const ALL_DESTINATIONS: [DestinationKind; 5] = [
        DestinationKind::Database,
        DestinationKind::ObjectStore,
        DestinationKind::Sftp,
        DestinationKind::Filesystem,
        DestinationKind::Rest,
    ];

    #[test]
    fn the_one_where_every_pair_gets_exactly_one_answer() {
        for source in ALL_SOURCES {
            for destination in ALL_DESTINATIONS {
                let the_route = route(source, destination);
                match (source, destination) {
                    (SourceKind::Database, DestinationKind::Rest) => assert_eq!(
                        the_route.unwrap_err().kind(),
                        ErrorKind::UnsupportedPipelineShape
                    ),
                    (SourceKind::Database, _) | (_, DestinationKind::Database) => {
                        assert_eq!(the_route.unwrap(), TransferMode::ExtractLoad)
                    }
                    _ => assert_eq!(the_route.unwrap(), TransferMode::RawTransfer),
                }
            }
        }
    }

    #[test]
    fn the_one_where_two_runs_never_share_an_export_directory() {
        let runtime = RuntimeConfig { export_dir: "/var/spool/ferry".into(), ..Default::default() };

        let the_first = BackendContext::for_run(&runtime, RunId::Persisted(7));
        let the_second = BackendContext::for_run(&runtime, RunId::Persisted(7));

        assert_ne!(the_first.export_dir, the_second.export_dir);
        assert!(the_first.export_dir.starts_with("/var/spool/ferry"));
        let the_leaf = the_first.export_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(the_leaf.starts_with("run-7-"));
        assert_eq!(the_first.connect_timeout, Duration::from_secs(runtime.connect_timeout_secs));
    }

    fn ctx(dir: &std::path::Path) -> BackendContext {
        BackendContext {
            export_dir: dir.to_path_buf(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn config(
        source_kind: SourceKind,
        source: serde_json::Value,
        destination_kind: DestinationKind,
        destination: serde_json::Value,
    ) -> ConnectorConfig {
        ConnectorConfig {
            connector_id: 1,
            connector_name: "router-test".into(),
            source_kind,
            destination_kind,
            source_settings: source.as_object().cloned().unwrap_or_default(),
            destination_settings: destination.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn the_one_where_a_filesystem_pair_becomes_a_raw_plan() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let the_plan = TransferPlan::build(
            &config(
                SourceKind::Filesystem,
                json!({ "path": "/in", "file_pattern": "*.pdf" }),
                DestinationKind::Filesystem,
                json!({ "path": "/out" }),
            ),
            &ctx(dir.path()),
        )
        .await
        .expect("💀 plan");
        assert!(matches!(
            the_plan,
            TransferPlan::Raw {
                source: SourceBackend::Filesystem(_),
                sink: SinkBackend::Filesystem(_)
            }
        ));
    }

    #[tokio::test]
    async fn the_one_where_a_directory_cannot_ferry_into_itself() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        std::fs::create_dir(dir.path().join("inbox")).expect("💀 mkdir");
        let the_inbox = dir.path().join("inbox");
        let the_same_inbox = dir.path().join("inbox/./../inbox");

        let the_error = TransferPlan::build(
            &config(
                SourceKind::Filesystem,
                json!({ "path": the_inbox }),
                DestinationKind::Filesystem,
                json!({ "path": the_same_inbox }),
            ),
            &ctx(dir.path()),
        )
        .await
        .unwrap_err();

        assert_eq!(the_error.kind(), ErrorKind::ConfigInvalid);
        assert!(the_error.to_string().contains("same directory"));
    }

    #[tokio::test]
    async fn the_one_where_a_query_to_sftp_is_an_export_plan() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let the_plan = TransferPlan::build(
            &config(
                SourceKind::Database,
                json!({
                    "host": "db",
                    "database": "d",
                    "username": "u",
                    "password": "p",
                    "query": "SELECT 1"
                }),
                DestinationKind::Sftp,
                json!({ "host": "nas", "username": "u", "password": "p" }),
            ),
            &ctx(dir.path()),
        )
        .await
        .expect("💀 plan");
        assert!(matches!(
            the_plan,
            TransferPlan::ExportThenLoad { sink: SinkBackend::Sftp(_), .. }
        ));
    }

    #[tokio::test]
    async fn the_one_where_a_mistyped_port_is_caught_before_any_io() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let the_error = TransferPlan::build(
            &config(
                SourceKind::Filesystem,
                json!({ "path": "/in" }),
                DestinationKind::Sftp,
                json!({ "host": "nas", "username": "u", "password": "p", "port": "abc" }),
            ),
            &ctx(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(the_error.kind(), ErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn the_one_where_database_to_rest_never_builds_anything() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let the_error = TransferPlan::build(
            &config(
                SourceKind::Database,
                json!({}),
                DestinationKind::Rest,
                json!({ "url": "http://x" }),
            ),
            &ctx(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(the_error.kind(), ErrorKind::UnsupportedPipelineShape);
    }
}

//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 Sources list units and hand out their bytes. 🕳️ Sinks take a unit plus something
//! that can open it, and put the bytes somewhere else. In between sits the worker pool,
//! which neither knows nor cares whether it's shoveling PDFs into SFTP or CSVs into S3.
//!
//! Each family is a trait plus a backend enum that dispatches with a `match`. Adding a
//! backend means adding a variant, and the compiler walks you to every arm you forgot. 🦆

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{TransferUnit, UnitOpener, UnitReader, UnitWrite};
use crate::errors::PipelineError;

pub(crate) mod common_config;
pub(crate) mod file;
pub(crate) mod object_store;
pub(crate) mod pattern;
pub(crate) mod postgres;
pub(crate) mod rest;
pub(crate) mod sftp;

pub(crate) use common_config::CommonFileSourceConfig;
pub(crate) use file::{FileSink, FileSinkConfig, FileSource, FileSourceConfig, same_place};
pub(crate) use object_store::{S3Sink, S3SinkConfig, S3Source, S3SourceConfig};
pub(crate) use postgres::{
    PostgresExport, PostgresExportConfig, PostgresLoader, PostgresLoaderConfig,
};
pub(crate) use rest::{RestSink, RestSinkConfig};
pub(crate) use sftp::{SftpSink, SftpSinkConfig};

// ===== Source Trait and Backend Enum =====

/// 🚰 A source of discrete files.
///
/// # Contract
/// - `list` returns every matching unit, sorted by key, without reading any content.
/// - `open` (via `UnitOpener`) streams one unit's bytes; it may be called more than once.
/// - `consume` removes a unit that has safely landed elsewhere.
#[async_trait]
pub(crate) trait Source: UnitOpener + fmt::Debug {
    async fn list(&self) -> Result<Vec<TransferUnit>, PipelineError>;
    async fn consume(&self, unit: &TransferUnit) -> Result<()>;
}

/// 🎭 The many faces of a file source.
#[derive(Debug)]
pub(crate) enum SourceBackend {
    ObjectStore(S3Source),
    Filesystem(FileSource),
}

impl SourceBackend {
    pub(crate) fn options(&self) -> &CommonFileSourceConfig {
        match self {
            SourceBackend::ObjectStore(s) => s.options(),
            SourceBackend::Filesystem(f) => f.options(),
        }
    }
}

#[async_trait]
impl UnitOpener for SourceBackend {
    async fn open(&self, unit: &TransferUnit) -> Result<UnitReader> {
        match self {
            SourceBackend::ObjectStore(s) => s.open(unit).await,
            SourceBackend::Filesystem(f) => f.open(unit).await,
        }
    }
}

#[async_trait]
impl Source for SourceBackend {
    async fn list(&self) -> Result<Vec<TransferUnit>, PipelineError> {
        match self {
            SourceBackend::ObjectStore(s) => s.list().await,
            SourceBackend::Filesystem(f) => f.list().await,
        }
    }

    async fn consume(&self, unit: &TransferUnit) -> Result<()> {
        match self {
            SourceBackend::ObjectStore(s) => s.consume(unit).await,
            SourceBackend::Filesystem(f) => f.consume(unit).await,
        }
    }
}

// ===== Sink Trait and Backend Enum =====

/// 🕳️ A destination for units.
///
/// # Contract
/// - `write` places exactly one unit and reports back. It never panics on bad data and never
///   deletes anything at the source; that is the orchestrator's call.
/// - Connection-level trouble is `DestinationUnavailable`, everything after the connection
///   is up is `DestinationWriteFailed`.
/// - `&self`, not `&mut self`: one sink is shared by every worker in the pool.
#[async_trait]
pub(crate) trait Sink: fmt::Debug + Send + Sync {
    async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError>;
}

/// 🎭 The many faces of a sink.
#[derive(Debug)]
pub(crate) enum SinkBackend {
    ObjectStore(S3Sink),
    Sftp(SftpSink),
    Filesystem(FileSink),
    Rest(RestSink),
    Database(PostgresLoader),
}

#[async_trait]
impl Sink for SinkBackend {
    async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError> {
        match self {
            SinkBackend::ObjectStore(sink) => sink.write(unit, opener).await,
            SinkBackend::Sftp(sink) => sink.write(unit, opener).await,
            SinkBackend::Filesystem(sink) => sink.write(unit, opener).await,
            SinkBackend::Rest(sink) => sink.write(unit, opener).await,
            SinkBackend::Database(sink) => sink.write(unit, opener).await,
        }
    }
}

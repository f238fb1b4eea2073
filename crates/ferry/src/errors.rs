//! 💀 The error taxonomy. Every way a run can go sideways, with a name tag.
//!
//! Three families, three blast radii:
//! - 🔧 pre-transfer (`ConfigNotFound`, `ConfigInvalid`, `UnsupportedPipelineShape`): fatal,
//!   nothing was moved, nothing will be.
//! - 🚰 source (`SourceUnavailable`, `SourceQueryFailed`, `SourceExportFailed`): fatal for the
//!   run, no units were produced.
//! - 🕳️ destination (`DestinationUnavailable`, `DestinationWriteFailed`): per unit. One bad
//!   file does not sink the ship unless every file is bad.
//!
//! The plumbing underneath speaks `anyhow` (context chains all the way down). Backends
//! translate into this enum at their seams, so the orchestrator only ever matches on
//! these eight shapes. 🦆

use std::fmt;

use thiserror::Error;

use crate::connector::{DestinationKind, SourceKind};

/// 📏 Driver error text beyond this is trimmed. The ledger is not a log aggregator.
pub(crate) const MAX_DRIVER_ERROR_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connector configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("connector configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("unsupported pipeline shape: {source_kind} -> {destination_kind}")]
    UnsupportedPipelineShape {
        source_kind: SourceKind,
        destination_kind: DestinationKind,
    },

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("source query failed: {0}")]
    SourceQueryFailed(String),

    #[error("source export failed: {0}")]
    SourceExportFailed(String),

    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("destination write failed: {0}")]
    DestinationWriteFailed(String),
}

/// 🏷️ The variant without its payload. Handy for summaries and test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigNotFound,
    ConfigInvalid,
    UnsupportedPipelineShape,
    SourceUnavailable,
    SourceQueryFailed,
    SourceExportFailed,
    DestinationUnavailable,
    DestinationWriteFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "ConfigNotFound",
            Self::ConfigInvalid => "ConfigInvalid",
            Self::UnsupportedPipelineShape => "UnsupportedPipelineShape",
            Self::SourceUnavailable => "SourceUnavailable",
            Self::SourceQueryFailed => "SourceQueryFailed",
            Self::SourceExportFailed => "SourceExportFailed",
            Self::DestinationUnavailable => "DestinationUnavailable",
            Self::DestinationWriteFailed => "DestinationWriteFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::UnsupportedPipelineShape { .. } => ErrorKind::UnsupportedPipelineShape,
            Self::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            Self::SourceQueryFailed(_) => ErrorKind::SourceQueryFailed,
            Self::SourceExportFailed(_) => ErrorKind::SourceExportFailed,
            Self::DestinationUnavailable(_) => ErrorKind::DestinationUnavailable,
            Self::DestinationWriteFailed(_) => ErrorKind::DestinationWriteFailed,
        }
    }

    /// 📝 `Kind: message`, the form that lands in the run ledger.
    pub fn summary_line(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    // 🔧 Constructors from an anyhow chain. `{:#}` flattens the whole chain onto one line,
    // then we trim so one chatty driver can't blow up the ledger column.

    pub(crate) fn source_unavailable(err: &anyhow::Error) -> Self {
        Self::SourceUnavailable(truncate_chars(&format!("{err:#}"), MAX_DRIVER_ERROR_CHARS))
    }

    pub(crate) fn source_query_failed(err: &anyhow::Error) -> Self {
        Self::SourceQueryFailed(truncate_chars(&format!("{err:#}"), MAX_DRIVER_ERROR_CHARS))
    }

    pub(crate) fn source_export_failed(err: &anyhow::Error) -> Self {
        Self::SourceExportFailed(truncate_chars(&format!("{err:#}"), MAX_DRIVER_ERROR_CHARS))
    }

    pub(crate) fn destination_unavailable(err: &anyhow::Error) -> Self {
        Self::DestinationUnavailable(truncate_chars(&format!("{err:#}"), MAX_DRIVER_ERROR_CHARS))
    }

    pub(crate) fn destination_write_failed(err: &anyhow::Error) -> Self {
        Self::DestinationWriteFailed(truncate_chars(&format!("{err:#}"), MAX_DRIVER_ERROR_CHARS))
    }
}

/// ✂️ Trim to at most `max_chars` characters, on a char boundary, with an ellipsis when cut.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut trimmed = text[..cut].to_string();
            trimmed.push('…');
            trimmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn the_one_where_short_text_survives_truncation_untouched() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exact", 5), "exact");
    }

    #[test]
    fn the_one_where_long_text_gets_an_ellipsis_on_a_char_boundary() {
        let the_cut = truncate_chars("ñññññ", 3);
        assert_eq!(the_cut, "ñññ…");
    }

    #[test]
    fn the_one_where_anyhow_chains_flatten_into_the_variant() {
        let the_root: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
        let the_chain = the_root.context("connecting to db:5432").unwrap_err();
        let the_error = PipelineError::source_unavailable(&the_chain);

        assert_eq!(the_error.kind(), ErrorKind::SourceUnavailable);
        let the_line = the_error.summary_line();
        assert!(the_line.starts_with("SourceUnavailable: "));
        assert!(the_line.contains("connecting to db:5432"));
        assert!(the_line.contains("connection refused"));
    }

    #[test]
    fn the_one_where_unsupported_shapes_name_both_kinds() {
        let the_error = PipelineError::UnsupportedPipelineShape {
            source_kind: SourceKind::Database,
            destination_kind: DestinationKind::Rest,
        };
        let the_message = the_error.to_string();
        assert!(the_message.contains("database"));
        assert!(the_message.contains("rest_api"));
    }
}

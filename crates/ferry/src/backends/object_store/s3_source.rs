use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, trace};

use super::client::{S3ConnectionConfig, source_sdk_error};
use crate::backends::common_config::CommonFileSourceConfig;
use crate::backends::pattern::KeyPattern;
use crate::common::{TransferUnit, UnitLocation, UnitReader, open_local};
use crate::errors::PipelineError;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct S3SourceConfig {
    #[serde(flatten)]
    pub connection: S3ConnectionConfig,
    /// Key prefix to list under. A trailing `/` is added when missing.
    #[serde(default, alias = "prefix")]
    pub path: String,
    #[serde(flatten)]
    pub common_config: CommonFileSourceConfig,
}

impl S3SourceConfig {
    fn prefix(&self) -> String {
        let trimmed = self.path.trim().trim_start_matches('/');
        if trimmed.is_empty() || trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        }
    }
}

/// 🪣 S3Source: lists a prefix, streams objects on demand, deletes them once delivered.
pub(crate) struct S3Source {
    source_config: S3SourceConfig,
    prefix: String,
    pattern: KeyPattern,
    client: aws_sdk_s3::Client,
}

// 🐛 the SDK client is a wall of Arc'd internals; nobody debugging a source wants to read it
impl std::fmt::Debug for S3Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Source")
            .field("source_config", &self.source_config)
            .finish()
    }
}

impl S3Source {
    pub(crate) async fn new(
        source_config: S3SourceConfig,
        connect_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let prefix = source_config.prefix();
        let pattern = KeyPattern::new(&source_config.common_config.file_pattern, &prefix)?;
        let client = source_config.connection.client(connect_timeout).await;
        Ok(Self { source_config, prefix, pattern, client })
    }

    pub(crate) fn options(&self) -> &CommonFileSourceConfig {
        &self.source_config.common_config
    }

    pub(crate) async fn list(&self) -> Result<Vec<TransferUnit>, PipelineError> {
        let bucket = &self.source_config.connection.bucket;
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();

        let mut units = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page
                .map_err(|e| {
                    source_sdk_error(e, format!("💀 listing s3://{bucket}/{}", self.prefix))
                })
                .map_err(|e| PipelineError::source_unavailable(&e))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if !self.pattern.matches(key) {
                    trace!("⏭️ s3://{bucket}/{key} does not match");
                    continue;
                }
                let name = key.rsplit('/').next().unwrap_or(key);
                let size = object.size().unwrap_or(0).max(0) as u64;
                units.push(TransferUnit::object(name, bucket.as_str(), key, size));
            }
        }

        units.sort_by(|a, b| key_of(a).cmp(key_of(b)));
        debug!(
            "🪣 {} object(s) under s3://{bucket}/{} match '{}'",
            units.len(),
            self.prefix,
            self.source_config.common_config.file_pattern
        );
        Ok(units)
    }

    pub(crate) async fn open(&self, unit: &TransferUnit) -> Result<UnitReader> {
        let UnitLocation::Object { bucket, key } = &unit.location else {
            return open_local(unit).await;
        };
        let the_response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| source_sdk_error(e, format!("💀 GetObject s3://{bucket}/{key}")))?;
        // -- ByteStream → AsyncRead, boxed so it fits `UnitReader`
        Ok(Box::new(the_response.body.into_async_read()))
    }

    pub(crate) async fn consume(&self, unit: &TransferUnit) -> Result<()> {
        let UnitLocation::Object { bucket, key } = &unit.location else {
            anyhow::bail!("💀 '{}' is not an object in a bucket", unit.location);
        };
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| source_sdk_error(e, format!("💀 DeleteObject s3://{bucket}/{key}")))
            .context("removing transferred source object")?;
        Ok(())
    }
}

fn key_of(unit: &TransferUnit) -> &str {
    match &unit.location {
        UnitLocation::Object { key, .. } => key,
        UnitLocation::Local(_) => &unit.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: &str) -> S3SourceConfig {
        serde_json::from_value(serde_json::json!({
            "bucket": "raw",
            "path": path,
            "file_pattern": "*.csv",
            "delete_after_transfer": "false",
        }))
        .expect("💀 settings parse")
    }

    #[test]
    fn the_one_where_the_prefix_grows_a_trailing_slash() {
        assert_eq!(config("incoming").prefix(), "incoming/");
        assert_eq!(config("/incoming/").prefix(), "incoming/");
        assert_eq!(config("").prefix(), "");
    }

    #[test]
    fn the_one_where_flattened_options_land_in_the_common_config() {
        let the_config = config("incoming");
        assert_eq!(the_config.connection.bucket, "raw");
        assert_eq!(the_config.common_config.file_pattern, "*.csv");
        assert!(!the_config.common_config.delete_after_transfer);
        assert!(!the_config.common_config.require_matches);
    }
}

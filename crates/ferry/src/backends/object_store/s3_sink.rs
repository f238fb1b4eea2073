use std::time::Duration;

use anyhow::{Context, anyhow};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::client::{S3ConnectionConfig, classify_sdk_error};
use crate::common::{TransferUnit, UnitOpener, UnitReader, UnitWrite};
use crate::connector::lenient;
use crate::errors::PipelineError;

const MIB: u64 = 1024 * 1024;
/// S3 rejects non-final parts smaller than this.
const MIN_PART_BYTES: u64 = 5 * MIB;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct S3SinkConfig {
    #[serde(flatten)]
    pub connection: S3ConnectionConfig,
    #[serde(default, alias = "path")]
    pub prefix: String,
    #[serde(default = "default_multipart_threshold_mb", deserialize_with = "lenient::u64")]
    pub multipart_threshold_mb: u64,
    #[serde(
        default = "default_part_size_mb",
        alias = "chunk_size_mb",
        deserialize_with = "lenient::u64"
    )]
    pub part_size_mb: u64,
}

fn default_multipart_threshold_mb() -> u64 {
    25
}

fn default_part_size_mb() -> u64 {
    5
}

impl S3SinkConfig {
    fn part_size_bytes(&self) -> u64 {
        (self.part_size_mb * MIB).max(MIN_PART_BYTES)
    }

    fn threshold_bytes(&self) -> u64 {
        self.multipart_threshold_mb * MIB
    }
}

/// 🧩 One slice of a multipart upload. Part numbers start at 1, as S3 insists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartPlan {
    pub number: i32,
    pub len: u64,
}

/// 📐 Cut `size` bytes into parts of `part_size`; the last part takes the remainder.
/// The lengths always sum to `size`.
pub(crate) fn plan_parts(size: u64, part_size: u64) -> Vec<PartPlan> {
    let part_size = part_size.max(1);
    let mut plan = Vec::with_capacity(size.div_ceil(part_size) as usize);
    let mut remaining = size;
    let mut number = 1;
    while remaining > 0 {
        let len = remaining.min(part_size);
        plan.push(PartPlan { number, len });
        remaining -= len;
        number += 1;
    }
    plan
}

pub(crate) fn object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// 🪣 S3Sink: small units in one PutObject, big ones in parts.
pub(crate) struct S3Sink {
    sink_config: S3SinkConfig,
    client: aws_sdk_s3::Client,
}

impl std::fmt::Debug for S3Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Sink")
            .field("sink_config", &self.sink_config)
            .finish()
    }
}

impl S3Sink {
    pub(crate) async fn new(sink_config: S3SinkConfig, connect_timeout: Duration) -> Self {
        let client = sink_config.connection.client(connect_timeout).await;
        Self { sink_config, client }
    }

    pub(crate) async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError> {
        let bucket = &self.sink_config.connection.bucket;
        let key = object_key(&self.sink_config.prefix, &unit.name);
        let mut reader = opener
            .open(unit)
            .await
            .with_context(|| format!("opening '{}' for upload", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;

        if unit.size_bytes > self.sink_config.threshold_bytes() {
            self.upload_multipart(unit, &key, &mut reader).await?;
        } else {
            let mut body = Vec::with_capacity(unit.size_bytes as usize);
            reader
                .read_to_end(&mut body)
                .await
                .with_context(|| format!("reading '{}' for upload", unit.name))
                .map_err(|e| PipelineError::destination_write_failed(&e))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, format!("PutObject s3://{bucket}/{key}")))?;
        }

        info!("🪣 uploaded '{}' to s3://{bucket}/{key}", unit.name);
        Ok(UnitWrite { rows: unit.rows })
    }

    async fn upload_multipart(
        &self,
        unit: &TransferUnit,
        key: &str,
        reader: &mut UnitReader,
    ) -> Result<(), PipelineError> {
        let bucket = &self.sink_config.connection.bucket;
        let the_session = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                classify_sdk_error(e, format!("CreateMultipartUpload s3://{bucket}/{key}"))
            })?;
        let upload_id = the_session
            .upload_id()
            .ok_or_else(|| {
                PipelineError::destination_write_failed(&anyhow!(
                    "CreateMultipartUpload s3://{bucket}/{key} returned no upload id"
                ))
            })?
            .to_string();

        match self.upload_parts(unit, key, &upload_id, reader).await {
            Ok(parts) => {
                let the_manifest =
                    CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(the_manifest)
                    .send()
                    .await
                    .map_err(|e| {
                        let what = format!("CompleteMultipartUpload s3://{bucket}/{key}");
                        classify_sdk_error(e, what)
                    })?;
                Ok(())
            }
            Err(e) => {
                // -- 🧹 an abandoned multipart session keeps billing for its parts
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "⚠️ aborting multipart upload {upload_id} for s3://{bucket}/{key} failed: \
                         {abort_err}"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        unit: &TransferUnit,
        key: &str,
        upload_id: &str,
        reader: &mut UnitReader,
    ) -> Result<Vec<CompletedPart>, PipelineError> {
        let bucket = &self.sink_config.connection.bucket;
        let plan = plan_parts(unit.size_bytes, self.sink_config.part_size_bytes());
        let mut completed = Vec::with_capacity(plan.len());

        for part in plan {
            let mut buf = Vec::with_capacity(part.len as usize);
            (&mut *reader)
                .take(part.len)
                .read_to_end(&mut buf)
                .await
                .with_context(|| format!("reading part {} of '{}'", part.number, unit.name))
                .map_err(|e| PipelineError::destination_write_failed(&e))?;
            if buf.len() as u64 != part.len {
                return Err(PipelineError::destination_write_failed(&anyhow!(
                    "'{}' ended after {} of {} bytes in part {}",
                    unit.name,
                    buf.len(),
                    part.len,
                    part.number
                )));
            }

            let the_response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part.number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| {
                    let what = format!("UploadPart {} s3://{bucket}/{key}", part.number);
                    classify_sdk_error(e, what)
                })?;

            debug!("🧩 part {} ({} bytes) of '{}' is up", part.number, part.len, unit.name);
            completed.push(
                CompletedPart::builder()
                    .set_e_tag(the_response.e_tag().map(str::to_string))
                    .part_number(part.number)
                    .build(),
            );
        }

        // -- the plan came from the listed size; a file that grew since would lose its tail
        let mut one_more = [0u8; 1];
        let trailing = reader
            .read(&mut one_more)
            .await
            .with_context(|| format!("checking for the end of '{}'", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;
        if trailing > 0 {
            return Err(PipelineError::destination_write_failed(&anyhow!(
                "'{}' is longer than the {} bytes it was listed with",
                unit.name,
                unit.size_bytes
            )));
        }
        Ok(completed)
    }
}

//! 🪣 S3 and every S3-shaped thing (MinIO, Ceph, that one appliance in the basement).
//!
//! 🧠 Knowledge graph:
//! - `client.rs`: credentials + region + custom endpoint → `aws_sdk_s3::Client`
//! - `s3_source.rs`: paginated `ListObjectsV2` under a prefix, `GetObject` streamed through
//!   `ByteStream::into_async_read()`, `DeleteObject` once a unit has landed
//! - `s3_sink.rs`: `PutObject` for small units, multipart upload for big ones, one part in
//!   memory at a time

mod client;
mod s3_sink;
mod s3_source;

pub(crate) use client::S3ConnectionConfig;
pub(crate) use s3_sink::{S3Sink, S3SinkConfig};
pub(crate) use s3_source::{S3Source, S3SourceConfig};

use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{
    Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use serde::Deserialize;

use crate::errors::PipelineError;

/// 🔧 How to reach a bucket. Shared by the S3 source and sink configs via `flatten`.
#[derive(Clone, Deserialize)]
pub(crate) struct S3ConnectionConfig {
    pub bucket: String,
    /// 🌎 us-east-1, the Florida of AWS regions. Everyone ends up there eventually.
    #[serde(default = "default_region", alias = "aws_region")]
    pub region: String,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    /// Self-hosted endpoint. Switches the client to path-style addressing and only sends
    /// checksums the operation requires, since S3-compatible stores vary in what they accept.
    #[serde(default, alias = "endpoint")]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl fmt::Debug for S3ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ConnectionConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field(
                "aws_secret_access_key",
                &self.aws_secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

impl S3ConnectionConfig {
    /// 🚀 Build a client. Explicit keys win; otherwise the standard AWS chain
    /// (env vars → ~/.aws/config → instance role → hope).
    pub(crate) async fn client(&self, connect_timeout: Duration) -> aws_sdk_s3::Client {
        let mut loader = aws_config::from_env()
            .region(Region::new(self.region.clone()))
            .timeout_config(TimeoutConfig::builder().connect_timeout(connect_timeout).build());

        if let (Some(key_id), Some(secret)) = (
            non_blank(&self.aws_access_key_id),
            non_blank(&self.aws_secret_access_key),
        ) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "ferry-connector-settings",
            ));
        }

        let the_shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&the_shared_config);
        if let Some(endpoint) = non_blank(&self.endpoint_url) {
            builder = builder
                .endpoint_url(normalize_endpoint(endpoint))
                .force_path_style(true)
                .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
                .response_checksum_validation(ResponseChecksumValidation::WhenRequired);
        }
        aws_sdk_s3::Client::from_conf(builder.build())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// 🌐 `minio:9000` → `http://minio:9000`. Anything with a scheme passes through untouched.
pub(crate) fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// 🧭 Dispatch/timeout failures never reached the bucket; everything else did.
pub(crate) fn classify_sdk_error<E, R>(err: SdkError<E, R>, what: String) -> PipelineError
where
    E: std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    let unreachable = matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_));
    let the_chain = anyhow!("{}", DisplayErrorContext(&err)).context(what);
    if unreachable {
        PipelineError::destination_unavailable(&the_chain)
    } else {
        PipelineError::destination_write_failed(&the_chain)
    }
}

/// 🏷️ Same as above, for the source side of the ferry.
pub(crate) fn source_sdk_error<E, R>(err: SdkError<E, R>, what: String) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    anyhow!("{}", DisplayErrorContext(&err)).context(what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_bare_hosts_get_an_http_scheme() {
        assert_eq!(normalize_endpoint("minio:9000"), "http://minio:9000");
        assert_eq!(normalize_endpoint("https://s3.example.com/"), "https://s3.example.com");
    }

    #[test]
    fn the_one_where_secrets_stay_out_of_debug_output() {
        let the_config: S3ConnectionConfig = serde_json::from_value(serde_json::json!({
            "bucket": "raw",
            "aws_access_key_id": "AKIA",
            "aws_secret_access_key": "wJalrXUtnFEMI",
        }))
        .expect("💀 settings parse");
        assert_eq!(the_config.region, "us-east-1");
        let the_debug = format!("{the_config:?}");
        assert!(!the_debug.contains("wJalrXUtnFEMI"));
        assert!(the_debug.contains("<redacted>"));
    }
}

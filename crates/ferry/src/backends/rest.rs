//! 📡 REST sink: POST (or PUT, or PATCH) a unit at an HTTP endpoint, retrying the flaky bits.
//!
//! Two body shapes:
//! - multipart (default): the unit is one streamed part named `file_field_name`, and
//!   `additional_fields` ride along as text parts.
//! - raw: the unit is the whole body with `content_type`; `additional_fields` become headers.
//!
//! Retries: at most `max_attempts` tries total. Connection errors, timeouts, 429 and 5xx get
//! another go after an exponential backoff. Any other 4xx is final on the first try, since
//! asking the same bad question louder doesn't make it a good question. The body is re-opened
//! from the source on every attempt, so nothing is held in memory between tries.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::common::{TransferUnit, UnitOpener, UnitWrite};
use crate::connector::lenient;
use crate::errors::{PipelineError, truncate_chars};

#[derive(Clone, Deserialize)]
pub(crate) struct RestSinkConfig {
    #[serde(alias = "endpoint_url")]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_true", deserialize_with = "lenient::bool")]
    pub use_multipart: bool,
    #[serde(default = "default_file_field_name")]
    pub file_field_name: String,
    #[serde(default)]
    pub additional_fields: BTreeMap<String, Value>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    /// Applied after `headers`, so these win on a name clash.
    #[serde(default)]
    pub custom_headers: BTreeMap<String, Value>,
    /// `bearer_token`, `api_key` or `basic`. Anything else (or nothing) sends no auth.
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(
        default = "default_max_attempts",
        alias = "max_retries",
        deserialize_with = "lenient::usize"
    )]
    pub max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms", deserialize_with = "lenient::u64")]
    pub retry_backoff_ms: u64,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub timeout_secs: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}
fn default_true() -> bool {
    true
}
fn default_file_field_name() -> String {
    "file".to_string()
}
fn default_content_type() -> String {
    "application/octet-stream".to_string()
}
fn default_api_key_header() -> String {
    "Authorization".to_string()
}
fn default_max_attempts() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

fn lenient_opt_u64<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    lenient::u64(deserializer).map(Some)
}

impl std::fmt::Debug for RestSinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSinkConfig")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("use_multipart", &self.use_multipart)
            .field("auth_type", &self.auth_type)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish_non_exhaustive()
    }
}

/// 🔑 How the request proves who it is.
#[derive(Clone)]
enum RestAuth {
    None,
    Bearer(String),
    ApiKey { header: String, value: String },
    Basic { username: String, password: String },
}

impl RestAuth {
    fn from_config(config: &RestSinkConfig) -> Result<Self, PipelineError> {
        let secret = config.api_key.clone().or_else(|| config.token.clone()).unwrap_or_default();
        match config.auth_type.as_deref().map(|a| a.trim().to_ascii_lowercase()) {
            Some(kind) if kind == "bearer_token" || kind == "bearer" => {
                require(&secret, "bearer_token auth needs api_key or token")?;
                Ok(Self::Bearer(secret))
            }
            Some(kind) if kind == "api_key" => {
                require(&secret, "api_key auth needs api_key")?;
                Ok(Self::ApiKey { header: config.api_key_header.clone(), value: secret })
            }
            Some(kind) if kind == "basic" => {
                let username = config.username.clone().unwrap_or_default();
                require(&username, "basic auth needs username")?;
                Ok(Self::Basic { username, password: config.password.clone().unwrap_or_default() })
            }
            _ => Ok(Self::None),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => request,
            Self::Bearer(token) => request.bearer_auth(token),
            Self::ApiKey { header, value } => request.header(header.as_str(), value.as_str()),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

// -- 🔒 Debug names the scheme, never the secret
impl std::fmt::Debug for RestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::ApiKey { header, .. } => write!(f, "ApiKey({header}: <redacted>)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}:<redacted>)"),
        }
    }
}

fn require(value: &str, problem: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        Err(PipelineError::ConfigInvalid(problem.to_string()))
    } else {
        Ok(())
    }
}

/// 📝 JSON settings values → header/field text. Strings lose their quotes, the rest don't.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 🔁 Worth another try?
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[derive(Debug)]
pub(crate) struct RestSink {
    sink_config: RestSinkConfig,
    method: Method,
    auth: RestAuth,
    client: Client,
}

impl RestSink {
    pub(crate) fn new(
        sink_config: RestSinkConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let method = match sink_config.method.trim().to_ascii_uppercase().as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            other => {
                return Err(PipelineError::ConfigInvalid(format!(
                    "REST method '{other}' is not one of POST, PUT, PATCH"
                )));
            }
        };
        let auth = RestAuth::from_config(&sink_config)?;
        let timeout = sink_config.timeout_secs.map(Duration::from_secs).unwrap_or(request_timeout);
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ConfigInvalid(format!("building HTTP client: {e}")))?;
        Ok(Self { sink_config, method, auth, client })
    }

    pub(crate) async fn write(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<UnitWrite, PipelineError> {
        let max_attempts = self.sink_config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.send_once(unit, opener).await? {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "📡 {} '{}' to {} -> {} (attempt {attempt})",
                        self.method,
                        unit.name,
                        self.sink_config.url,
                        response.status()
                    );
                    return Ok(UnitWrite { rows: unit.rows });
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let the_error = PipelineError::destination_write_failed(&anyhow!(
                        "{} {} answered {status}: {}",
                        self.method,
                        self.sink_config.url,
                        truncate_chars(body.trim(), 200)
                    ));
                    if !is_retryable_status(status) {
                        return Err(the_error);
                    }
                    last_error = Some(the_error);
                }
                Err(http_err) if http_err.is_builder() => {
                    return Err(PipelineError::ConfigInvalid(format!(
                        "building request for {}: {http_err}",
                        self.sink_config.url
                    )));
                }
                Err(http_err) => {
                    let unreachable = http_err.is_connect() || http_err.is_timeout();
                    let the_chain = anyhow::Error::new(http_err)
                        .context(format!("{} {}", self.method, self.sink_config.url));
                    last_error = Some(if unreachable {
                        PipelineError::destination_unavailable(&the_chain)
                    } else {
                        PipelineError::destination_write_failed(&the_chain)
                    });
                }
            }

            if attempt < max_attempts {
                let backoff = self.backoff(attempt);
                warn!(
                    "🔁 '{}' attempt {attempt}/{max_attempts} failed, retrying in {}ms",
                    unit.name,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::destination_write_failed(&anyhow!("no attempts were made"))
        }))
    }

    /// `retry_backoff_ms × 2^(attempt-1)`
    fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
        Duration::from_millis(self.sink_config.retry_backoff_ms.saturating_mul(factor))
    }

    /// Outer error: we couldn't even build the request (source unreadable, bad header).
    /// Inner error: the HTTP exchange itself failed.
    async fn send_once(
        &self,
        unit: &TransferUnit,
        opener: &dyn UnitOpener,
    ) -> Result<Result<Response, reqwest::Error>, PipelineError> {
        let reader = opener
            .open(unit)
            .await
            .with_context(|| format!("opening '{}' for upload", unit.name))
            .map_err(|e| PipelineError::destination_write_failed(&e))?;
        let body = Body::wrap_stream(ReaderStream::new(reader));

        let mut request = self.client.request(self.method.clone(), &self.sink_config.url);
        let the_headers = self.sink_config.headers.iter().chain(&self.sink_config.custom_headers);
        for (name, value) in the_headers {
            request = request.header(name.as_str(), value_text(value));
        }
        request = self.auth.apply(request);

        request = if self.sink_config.use_multipart {
            let part = Part::stream_with_length(body, unit.size_bytes)
                .file_name(unit.name.clone())
                .mime_str(&self.sink_config.content_type)
                .map_err(|e| PipelineError::ConfigInvalid(format!("content_type: {e}")))?;
            let mut form = Form::new();
            for (name, value) in &self.sink_config.additional_fields {
                form = form.text(name.clone(), value_text(value));
            }
            request.multipart(form.part(self.sink_config.file_field_name.clone(), part))
        } else {
            for (name, value) in &self.sink_config.additional_fields {
                request = request.header(name.as_str(), value_text(value));
            }
            request
                .header(CONTENT_TYPE, self.sink_config.content_type.as_str())
                .body(body)
        };

        debug!("📡 sending '{}' ({} bytes) to {}", unit.name, unit.size_bytes, self.sink_config.url);
        Ok(request.send().await)
    }
}

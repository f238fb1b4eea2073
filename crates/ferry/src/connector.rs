//! 🔌 Connector vocabulary: what kinds of things we read from, what kinds of things we write
//! to, and the immutable bag of settings a run carries from start to finish.
//!
//! Settings stay as a JSON map until the router turns them into typed backend configs.
//! The map form is what the config store hands us and what overrides merge into; the
//! typed form is what backends actually want. `settings_into` is the bridge.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::PipelineError;

/// 📦 Key/value settings for one side of a connector. Straight from the JSON column.
pub type Settings = Map<String, Value>;

/// 🚰 Where the data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Database,
    ObjectStore,
    Filesystem,
}

/// 🕳️ Where the data goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Database,
    ObjectStore,
    Sftp,
    Filesystem,
    Rest,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::ObjectStore => "object_store",
            Self::Filesystem => "filesystem",
        }
    }

    /// 📁 Does this kind hand out discrete files (as opposed to rows)?
    pub fn is_file_bearing(&self) -> bool {
        matches!(self, Self::ObjectStore | Self::Filesystem)
    }

    /// 📜 Each inner slice is a group of alternatives; at least one key per group must be set.
    pub(crate) fn required_keys(&self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Database => &[
                &["host"],
                &["database"],
                &["username"],
                &["password"],
                &["query"],
            ],
            Self::ObjectStore => &[&["bucket"]],
            Self::Filesystem => &[&["path"]],
        }
    }
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::ObjectStore => "object_store",
            Self::Sftp => "sftp",
            Self::Filesystem => "filesystem",
            Self::Rest => "rest_api",
        }
    }

    /// 📁 Can this destination take a file as-is?
    pub fn accepts_files(&self) -> bool {
        !matches!(self, Self::Database)
    }

    pub(crate) fn required_keys(&self) -> &'static [&'static [&'static str]] {
        match self {
            // -- a connection string stands in for the whole host/database/username trio,
            // -- checked separately in `missing_keys`
            Self::Database => &[&["host"], &["database"], &["username"]],
            Self::ObjectStore => &[&["bucket"]],
            Self::Sftp => &[&["host"], &["username"], &["password", "pkey_path"]],
            Self::Filesystem => &[&["path"]],
            Self::Rest => &[&["url", "endpoint_url"]],
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "database" | "sql_database" => Ok(Self::Database),
            "s3" | "object_store" | "minio" => Ok(Self::ObjectStore),
            "filesystem" | "nfs" | "local" => Ok(Self::Filesystem),
            other => Err(PipelineError::ConfigInvalid(format!(
                "unrecognized source kind '{other}'"
            ))),
        }
    }
}

impl FromStr for DestinationKind {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "database" => Ok(Self::Database),
            "s3" | "object_store" | "minio" => Ok(Self::ObjectStore),
            "sftp" => Ok(Self::Sftp),
            "filesystem" | "nfs" | "local" => Ok(Self::Filesystem),
            "rest_api" | "rest" | "http" => Ok(Self::Rest),
            other => Err(PipelineError::ConfigInvalid(format!(
                "unrecognized destination kind '{other}'"
            ))),
        }
    }
}

/// 🧊 The resolved, merged, validated configuration for exactly one run.
///
/// Built once by the resolver and passed by reference down the call chain. Nobody mutates
/// it and nobody stashes it in a global.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorConfig {
    pub connector_id: i64,
    pub connector_name: String,
    pub source_kind: SourceKind,
    pub destination_kind: DestinationKind,
    pub source_settings: Settings,
    pub destination_settings: Settings,
}

/// 🔍 Present means: key exists, not null, and not an empty/blank string.
pub(crate) fn has_value(settings: &Settings, key: &str) -> bool {
    match settings.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// 📋 Which required key groups are unsatisfied? Returned as `a|b` for alternative groups.
pub(crate) fn missing_keys(
    settings: &Settings,
    groups: &'static [&'static [&'static str]],
) -> Vec<String> {
    groups
        .iter()
        .filter(|group| !group.iter().any(|key| has_value(settings, key)))
        .map(|group| group.join("|"))
        .collect()
}

/// 🔄 JSON map → typed backend config. Type mismatches are configuration errors.
pub(crate) fn settings_into<T: DeserializeOwned>(
    settings: &Settings,
    what: &str,
) -> Result<T, PipelineError> {
    serde_json::from_value(Value::Object(settings.clone()))
        .map_err(|e| PipelineError::ConfigInvalid(format!("{what} settings: {e}")))
}

/// 🧩 Lenient numeric fields. Config UIs love to send `"22"` where they mean `22`.
pub(crate) mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Text(String),
    }

    fn to_u64<'de, D: Deserializer<'de>>(raw: NumberOrString) -> Result<u64, D::Error> {
        match raw {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| serde::de::Error::custom(format!("'{s}' is not a number: {e}"))),
        }
    }

    pub(crate) fn u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let n = to_u64::<D>(NumberOrString::deserialize(deserializer)?)?;
        u16::try_from(n).map_err(|_| serde::de::Error::custom(format!("{n} is out of range")))
    }

    pub(crate) fn usize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        let n = to_u64::<D>(NumberOrString::deserialize(deserializer)?)?;
        usize::try_from(n).map_err(|_| serde::de::Error::custom(format!("{n} is out of range")))
    }

    pub(crate) fn u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        to_u64::<D>(NumberOrString::deserialize(deserializer)?)
    }

    /// `true`, `"true"`, `"yes"`, `1` and `1.0` all mean yes. Any nonzero number does.
    pub(crate) fn bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" | "" => Ok(false),
                other => Err(serde::de::Error::custom(format!("'{other}' is not a boolean"))),
            },
            other => Err(serde::de::Error::custom(format!("{other} is not a boolean"))),
        }
    }
}

//! 🔧 The Configuration Resolver: three JSON layers walk in, one `ConnectorConfig` walks out.
//!
//! ```text
//!   base source settings ──┐
//!                          ├── + source overrides ──────▶ source_settings
//!   base dest settings ────┤
//!                          └── + destination overrides ─▶ destination_settings
//! ```
//!
//! Overrides win key by key. Absent keys fall through to the base. Then required keys get
//! checked against the declared kind, before anyone opens a socket.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::connector::{
    ConnectorConfig, DestinationKind, Settings, SourceKind, has_value, missing_keys,
};
use crate::errors::PipelineError;

/// 📇 One row of the connectors relation.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRecord {
    pub id: i64,
    pub name: String,
    pub source_id: Option<i64>,
    pub destination_id: Option<i64>,
    pub source_overrides: Settings,
    pub destination_overrides: Settings,
}

/// 📇 One row of the sources or destinations relation.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRecord {
    pub id: i64,
    pub kind: String,
    pub settings: Settings,
}

/// 📚 Read-only access to connector definitions. The engine never writes here.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn connector(&self, connector_id: i64) -> Result<Option<ConnectorRecord>>;
    async fn source_definition(&self, source_id: i64) -> Result<Option<DefinitionRecord>>;
    async fn destination_definition(&self, destination_id: i64) -> Result<Option<DefinitionRecord>>;
}

/// 🏷️ Placeholders rendered into destination `path` / `prefix` values.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub project_id: String,
    pub env: String,
}

impl TemplateVars {
    fn render(&self, raw: &str) -> String {
        raw.replace("{project_id}", &self.project_id)
            .replace("{env}", &self.env)
    }
}

const TEMPLATED_DESTINATION_KEYS: &[&str] = &["path", "prefix"];

/// 🔀 Key-by-key merge. `overrides` wins wherever it has a key.
pub(crate) fn merge_settings(base: &Settings, overrides: &Settings) -> Settings {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// 🚀 Resolve a connector id into an immutable, validated configuration.
pub async fn resolve(
    store: &dyn ConfigStore,
    connector_id: i64,
    vars: &TemplateVars,
) -> Result<ConnectorConfig, PipelineError> {
    debug!("🔧 resolving connector {connector_id}");

    let connector = store
        .connector(connector_id)
        .await
        .map_err(|e| store_unreachable(&e))?
        .ok_or_else(|| PipelineError::ConfigNotFound(format!("connector {connector_id}")))?;

    let source_id = connector.source_id.ok_or_else(|| {
        PipelineError::ConfigNotFound(format!("connector {connector_id} has no source definition"))
    })?;
    let destination_id = connector.destination_id.ok_or_else(|| {
        PipelineError::ConfigNotFound(format!(
            "connector {connector_id} has no destination definition"
        ))
    })?;

    let source = store
        .source_definition(source_id)
        .await
        .map_err(|e| store_unreachable(&e))?
        .ok_or_else(|| {
            PipelineError::ConfigNotFound(format!(
                "source definition {source_id} referenced by connector {connector_id}"
            ))
        })?;
    let destination = store
        .destination_definition(destination_id)
        .await
        .map_err(|e| store_unreachable(&e))?
        .ok_or_else(|| {
            PipelineError::ConfigNotFound(format!(
                "destination definition {destination_id} referenced by connector {connector_id}"
            ))
        })?;

    let source_kind: SourceKind = source.kind.parse()?;
    let destination_kind: DestinationKind = destination.kind.parse()?;

    let source_settings = merge_settings(&source.settings, &connector.source_overrides);
    let mut destination_settings =
        merge_settings(&destination.settings, &connector.destination_overrides);

    for key in TEMPLATED_DESTINATION_KEYS {
        if let Some(Value::String(raw)) = destination_settings.get(*key) {
            let rendered = vars.render(raw);
            destination_settings.insert((*key).to_string(), Value::String(rendered));
        }
    }

    validate(source_kind, &source_settings, destination_kind, &destination_settings)?;

    info!(
        "✅ resolved connector {} ('{}'): {} -> {}",
        connector.id, connector.name, source_kind, destination_kind
    );

    Ok(ConnectorConfig {
        connector_id: connector.id,
        connector_name: connector.name,
        source_kind,
        destination_kind,
        source_settings,
        destination_settings,
    })
}

fn validate(
    source_kind: SourceKind,
    source_settings: &Settings,
    destination_kind: DestinationKind,
    destination_settings: &Settings,
) -> Result<(), PipelineError> {
    let mut problems = Vec::new();

    let source_missing = missing_keys(source_settings, source_kind.required_keys());
    if !source_missing.is_empty() {
        problems.push(format!(
            "{} source is missing required settings: {}",
            source_kind,
            source_missing.join(", ")
        ));
    }

    // -- 🐘 a connection string is a complete database address on its own
    let destination_missing = if destination_kind == DestinationKind::Database
        && has_value(destination_settings, "connection_string")
    {
        Vec::new()
    } else {
        missing_keys(destination_settings, destination_kind.required_keys())
    };
    if !destination_missing.is_empty() {
        problems.push(format!(
            "{} destination is missing required settings: {}",
            destination_kind,
            destination_missing.join(", ")
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ConfigInvalid(problems.join("; ")))
    }
}

fn store_unreachable(err: &anyhow::Error) -> PipelineError {
    PipelineError::ConfigNotFound(format!("config store read failed: {err:#}"))
}

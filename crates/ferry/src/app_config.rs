//! 🔧 App Configuration: where the engine learns where the store lives and how hard to push.
//!
//! 📐 Layers, weakest first:
//!   1. `DATABASE_URL`, the variable every deployment already sets
//!   2. `FERRY_*` env vars, nested with `__` (`FERRY_RUNTIME__CONCURRENCY_LIMIT=8`)
//!   3. an optional TOML file, which wins on conflicts
//!
//! Connector settings are not in here. Those live in the store, one row per connector. 🦆

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::postgres::normalize_postgres_url;
use crate::resolver::TemplateVars;

/// 📦 Everything the engine needs before it reads its first connector.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🗄️ Where connector definitions and the run ledger live.
#[derive(Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default, alias = "url")]
    pub database_url: Option<String>,
}

// -- the URL carries a password
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// ⚙️ Knobs that shape a run without changing what it moves.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on raw-transfer workers.
    #[serde(default = "default_concurrency_limit", alias = "max_workers")]
    pub concurrency_limit: usize,
    /// Where database exports are written before delivery.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default)]
    pub env: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            export_dir: default_export_dir(),
            project_id: default_project_id(),
            env: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars { project_id: self.project_id.clone(), env: self.env.clone() }
    }
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_export_dir() -> PathBuf {
    std::env::temp_dir().join("ferry-exports")
}

fn default_project_id() -> String {
    "default_project".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// 🚀 Load the config from env vars and, when given, a TOML file.
///
/// - `config_file_name` is None → env vars only.
/// - `config_file_name` is Some → env vars + TOML, merged. TOML wins.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new()
        .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "store.database_url".into()))
        .merge(Env::prefixed("FERRY_").split("__"));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables \
             (FERRY_*, DATABASE_URL).",
            path.display()
        ),
        None => {
            "💀 Failed to parse configuration from environment variables (FERRY_*, DATABASE_URL)."
                .to_string()
        }
    };

    let mut app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.store.database_url = app_config
        .store
        .database_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(normalize_postgres_url);
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_test_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let the_path = dir.path().join("ferry.toml");
        fs::write(&the_path, contents).expect("💀 Failed to write test config.");
        the_path
    }

    #[test]
    fn the_one_where_the_toml_file_sets_everything() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let config_path = write_test_config(
            &dir,
            r#"
            [store]
            database_url = "postgresql+psycopg2://ferry:pw@db:5432/connectors"

            [runtime]
            concurrency_limit = 8
            export_dir = "/var/tmp/exports"
            project_id = "acme"
            env = "staging"
            connect_timeout_secs = 3
            "#,
        );

        let app_config = load_config(Some(config_path.as_path())).expect("💀 config should parse");

        assert_eq!(
            app_config.store.database_url.as_deref(),
            Some("postgresql://ferry:pw@db:5432/connectors")
        );
        assert_eq!(app_config.runtime.concurrency_limit, 8);
        assert_eq!(app_config.runtime.export_dir, PathBuf::from("/var/tmp/exports"));
        assert_eq!(app_config.runtime.template_vars().project_id, "acme");
        assert_eq!(app_config.runtime.template_vars().env, "staging");
        assert_eq!(app_config.runtime.connect_timeout_secs, 3);
        assert_eq!(app_config.runtime.request_timeout_secs, 300);
    }

    #[test]
    fn the_one_where_runtime_defaults_show_up_uninvited_but_helpful() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let config_path = write_test_config(&dir, "[store]\n");

        let app_config: AppConfig = Figment::new()
            .merge(Toml::file(config_path.as_path()))
            .extract()
            .expect("💀 defaults should fill every runtime knob");

        assert_eq!(app_config.runtime.concurrency_limit, 4);
        assert_eq!(app_config.runtime.project_id, "default_project");
        assert_eq!(app_config.runtime.env, "");
        assert_eq!(app_config.runtime.connect_timeout_secs, 10);
        assert!(app_config.store.database_url.is_none());
    }

    #[test]
    fn the_one_where_the_store_password_stays_out_of_the_logs() {
        let the_store = StoreConfig { database_url: Some("postgresql://u:hunter2@db/x".into()) };
        assert!(!format!("{the_store:?}").contains("hunter2"));
    }

    #[test]
    fn the_one_where_a_typo_in_the_toml_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().expect("💀 tempdir");
        let config_path = write_test_config(&dir, "[runtime]\nconcurrency_limit = \"lots\"\n");
        assert!(load_config(Some(config_path.as_path())).is_err());
    }
}

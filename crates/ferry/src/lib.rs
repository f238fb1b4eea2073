//! ⛴️ ferry: give it a connector id, it moves the data and writes down what happened.
//!
//! 🧭 The tour, in the order a run visits it:
//!   - [`resolver`] turns a connector id into a validated [`connector::ConnectorConfig`]
//!   - [`router`] picks raw transfer or extract-load and builds the backends
//!   - `backends` do the I/O, `workers` fan raw transfers out
//!   - [`pipeline`] drives all of it and closes the [`ledger`] row exactly once

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

pub mod app_config;
pub(crate) mod backends;
pub mod common;
pub mod connector;
pub mod errors;
pub mod ledger;
pub mod pipeline;
pub mod resolver;
pub mod router;
pub mod stores;
pub(crate) mod workers;

pub use app_config::{AppConfig, RuntimeConfig, load_config};
pub use errors::{ErrorKind, PipelineError};
pub use ledger::{RunId, RunStatus};
pub use pipeline::{Pipeline, RunOutcome};

use crate::stores::PostgresStore;

/// 🚀 Run one connector against the PostgreSQL store named in the config.
///
/// Only store connection trouble comes back as `Err`. Anything that goes wrong inside the
/// run is in the returned [`RunOutcome`].
pub async fn run(
    app_config: AppConfig,
    connector_id: i64,
    correlation_id: Option<String>,
) -> Result<RunOutcome> {
    let database_url = app_config.store.database_url.as_deref().context(
        "💀 no store database configured. Set DATABASE_URL, FERRY_STORE__DATABASE_URL, or \
         [store] database_url",
    )?;
    let connect_timeout = Duration::from_secs(app_config.runtime.connect_timeout_secs);
    let the_store = Arc::new(PostgresStore::connect(database_url, connect_timeout).await?);

    let pipeline = Pipeline::new(the_store.clone(), the_store, app_config.runtime);
    Ok(pipeline.run(connector_id, correlation_id).await)
}

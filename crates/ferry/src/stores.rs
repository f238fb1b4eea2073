//! 🗄️ Where connector definitions are read from and run history is written to.
//!
//! - `postgres.rs`: the real thing. Same database serves both the config tables and the
//!   `connector_runs` ledger.
//! - `in_mem.rs`: HashMaps behind a mutex, for tests and for anyone wiring the engine up
//!   without a database.

pub mod in_mem;
pub mod postgres;

pub use in_mem::{InMemoryConfigStore, InMemoryLedger};
pub use postgres::PostgresStore;

//! Low-level connection management for the CHIME database.
//!
//! This crate defines no tables. It establishes, reuses and tears down
//! per-thread database connections and gives model packages a shared
//! [`PROXY`] to issue queries through:
//!
//! - **config**: configuration discovery (environment, rc files, provider) and test-safe mode
//! - **error**: [`ChimeDbError`], one enum for every failure
//! - **models**: settings, values and rows
//! - **services**: connectors for SQLite and PostgreSQL, SSH tunnelling
//! - **state**: thread-local [`connect`], [`close`] and [`atomic`]
//! - **proxy**: the shared [`PROXY`]
//! - **orm**: helpers for model packages (enum/JSON fields, name tables, table creation, wiki logins)
//! - **logging**: optional subscriber setup
//!
//! ```no_run
//! use chimedb_core::{connect, close, PROXY};
//!
//! connect(false, false)?;
//! let rows = PROXY.query("SELECT name FROM telescope", &[])?;
//! close();
//! # Ok::<(), chimedb_core::ChimeDbError>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod orm;
pub mod proxy;
pub mod services;
pub mod state;


pub use config::{set_config_provider, test_enable};
pub use error::{ChimeDbError, ChimeDbResult, ErrorInfo};
pub use models::{Backend, DatabaseSettings, Row, Value};
pub use orm::{check_tables, create_tables, EnumField, JsonDictField, NameCache, NameTable, Table};
pub use proxy::{Proxy, PROXY};
pub use services::{Connector, ConnectorSet, Database};
pub use state::{atomic, close, connect, connect_read_write, current_connector};

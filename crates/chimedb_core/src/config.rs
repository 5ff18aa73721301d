//! Connection configuration discovery.
//!
//! Sources are probed in order and the first one that exists wins, even if
//! the connection data it supplies later fails to connect.
//!
//! Normal mode:
//!
//! 1. `CHIMEDB_SQLITE`: path or `file:` URI of an SQLite database
//! 2. the YAML rc file named by `CHIMEDBRC`
//! 3. `./.chimedbrc`, `~/.chimedbrc`, `/etc/chime/chimedbrc`
//! 4. a provider registered with [`set_config_provider`]
//!
//! Test-safe mode ([`test_enable`] or a non-empty `CHIMEDB_TEST_ENABLE`)
//! ignores all of the above and uses `CHIMEDB_TEST_SQLITE`, then
//! `CHIMEDB_TEST_RC`, then a shared in-memory SQLite database.
//!
//! An rc file looks like:
//!
//! ```yaml
//! chimedb:
//!     db_type:         postgresql
//!     db:              chime
//!     user_ro:         chime_ro
//!     passwd_ro:       ...
//!     user_rw:         chime_rw
//!     passwd_rw:       ...
//!     host:            db.example.org
//!     port:            5432
//!     tunnel_host:     gateway.example.org
//!     tunnel_user:     observer
//!     tunnel_identity: ~/.ssh/id_ed25519
//! ```

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::connection::DEFAULT_PG_PORT;
use crate::models::{DatabaseSettings, TunnelSettings};
use crate::services::sqlite::MEMORY_URI;
use crate::services::{ConnectorSet, PgTarget, PostgresConnector, SqliteConnector};

use parking_lot::RwLock;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// SQLite database used in normal mode.
pub const ENV_SQLITE: &str = "CHIMEDB_SQLITE";
/// Rc file used in normal mode.
pub const ENV_RC: &str = "CHIMEDBRC";
/// Non-empty value turns on test-safe mode.
pub const ENV_TEST_ENABLE: &str = "CHIMEDB_TEST_ENABLE";
/// SQLite database used in test-safe mode.
pub const ENV_TEST_SQLITE: &str = "CHIMEDB_TEST_SQLITE";
/// Rc file used in test-safe mode.
pub const ENV_TEST_RC: &str = "CHIMEDB_TEST_RC";
/// Server connect timeout in whole seconds.
pub const ENV_CONNECT_TIMEOUT: &str = "CHIMEDB_CONNECT_TIMEOUT";

/// Used when `CHIMEDB_CONNECT_TIMEOUT` is unset or invalid.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const SYSTEM_RC_FILE: &str = "/etc/chime/chimedbrc";
const RC_FILE_NAME: &str = ".chimedbrc";

/// Context reported for the in-memory test database.
const TEST_MEMORY_CONTEXT: &str = "test-safe mode";

static TEST_ENABLE: AtomicBool = AtomicBool::new(false);

/// Builds connector candidates when no file-based configuration is found.
pub type ConfigProvider = Arc<dyn Fn() -> ChimeDbResult<ConnectorSet> + Send + Sync>;

static PROVIDER: RwLock<Option<ConfigProvider>> = parking_lot::const_rwlock(None);

/// Enable test-safe mode for the rest of the process.
pub fn test_enable() {
    if !TEST_ENABLE.swap(true, Ordering::SeqCst) {
        tracing::debug!("Enabling test-safe mode");
    }
}

/// True once test-safe mode has been enabled.
pub fn is_test_enabled() -> bool {
    TEST_ENABLE.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_test_mode() {
    TEST_ENABLE.store(false, Ordering::SeqCst);
}

/// Register the last-resort configuration source.
///
/// The provider is called on every thread that connects, so it must build
/// fresh connectors each time.
pub fn set_config_provider<F>(provider: F)
where
    F: Fn() -> ChimeDbResult<ConnectorSet> + Send + Sync + 'static,
{
    *PROVIDER.write() = Some(Arc::new(provider));
}

/// Remove a registered provider.
pub fn clear_config_provider() {
    *PROVIDER.write() = None;
}

/// Value of an environment variable, treating empty as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Timeout for server connects, from `CHIMEDB_CONNECT_TIMEOUT`.
pub fn connect_timeout() -> Duration {
    let Some(value) = env_var(ENV_CONNECT_TIMEOUT) else {
        return DEFAULT_CONNECT_TIMEOUT;
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            tracing::warn!("{ENV_CONNECT_TIMEOUT} set to an invalid value: {value}");
            DEFAULT_CONNECT_TIMEOUT
        }
    }
}

/// Find the active configuration source and build its connectors.
pub fn resolve() -> ChimeDbResult<ConnectorSet> {
    if env_var(ENV_TEST_ENABLE).is_some() {
        test_enable();
    }
    let test_mode = is_test_enabled();

    let sqlite_var = if test_mode { ENV_TEST_SQLITE } else { ENV_SQLITE };
    if let Some(db) = env_var(sqlite_var) {
        return Ok(sqlite_connectors(&db, sqlite_var));
    }

    if let Some(connectors) = try_rc_files(test_mode)? {
        return Ok(connectors);
    }

    if test_mode {
        return Ok(sqlite_connectors(MEMORY_URI, TEST_MEMORY_CONTEXT));
    }

    let provider = PROVIDER.read().clone();
    match provider {
        Some(provider) => provider(),
        None => Err(ChimeDbError::no_route(
            "Unable to find connection configuration for the database! \
             Either provide a chimedb rc file in one of the default locations \
             or register a config provider.",
        )),
    }
}

fn sqlite_connectors(db: &str, context: &str) -> ConnectorSet {
    ConnectorSet::single(
        Box::new(SqliteConnector::new(db, false)),
        Box::new(SqliteConnector::new(db, true)),
        context,
    )
}

/// Rc files to try, in order.
fn rc_candidates(test_mode: bool) -> ChimeDbResult<Vec<PathBuf>> {
    if test_mode {
        return match env_var(ENV_TEST_RC) {
            Some(rc) if rc.contains("chimedbrc") => Err(ChimeDbError::config(format!(
                "Bad value for {ENV_TEST_RC}: cannot contain \"chimedbrc\""
            ))),
            Some(rc) => Ok(vec![PathBuf::from(rc)]),
            None => Ok(Vec::new()),
        };
    }

    let mut candidates = Vec::new();
    if let Some(rc) = env_var(ENV_RC) {
        candidates.push(PathBuf::from(rc));
    }
    candidates.push(Path::new(".").join(RC_FILE_NAME));
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(RC_FILE_NAME));
    }
    candidates.push(PathBuf::from(SYSTEM_RC_FILE));
    Ok(candidates)
}

fn try_rc_files(test_mode: bool) -> ChimeDbResult<Option<ConnectorSet>> {
    for path in rc_candidates(test_mode)? {
        if let Some(settings) = read_rc_file(&path)? {
            let context = path.display().to_string();
            return connectors_from_settings(settings, &context).map(Some);
        }
    }
    Ok(None)
}

#[derive(Deserialize)]
struct RcFile {
    chimedb: Option<DatabaseSettings>,
}

/// Read the `chimedb` section of an rc file.
///
/// Missing, unreadable, or empty files and files without a `chimedb` section
/// yield `None`. Malformed contents are an error.
pub fn read_rc_file(path: &Path) -> ChimeDbResult<Option<DatabaseSettings>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::trace!(path = %path.display(), error = %e, "Rc file not readable");
            return Ok(None);
        }
    };

    let parse_error = |e: serde_yaml::Error| {
        ChimeDbError::config_with_source(format!("Invalid rc file {}", path.display()), e)
    };

    let value: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(parse_error)?;
    if value.is_null() {
        tracing::debug!(path = %path.display(), "Skipping empty rc file");
        return Ok(None);
    }

    let rc: RcFile = serde_yaml::from_value(value).map_err(parse_error)?;
    if rc.chimedb.is_none() {
        tracing::debug!(path = %path.display(), "Skipping rc file without a chimedb section");
    }
    Ok(rc.chimedb)
}

/// Build read-only and read-write connectors from rc settings.
pub fn connectors_from_settings(
    settings: DatabaseSettings,
    context: &str,
) -> ChimeDbResult<ConnectorSet> {
    let db_type = settings.db_type.as_deref().unwrap_or("postgresql").to_lowercase();
    match db_type.as_str() {
        "sqlite" => Ok(sqlite_connectors(&settings.db, context)),
        "postgresql" | "postgres" => postgres_connectors(settings, context),
        other => Err(ChimeDbError::config(format!("Invalid database type ({other}) in {context}"))),
    }
}

fn postgres_connectors(settings: DatabaseSettings, context: &str) -> ChimeDbResult<ConnectorSet> {
    let missing = |key: &str| ChimeDbError::config(format!("Missing required key '{key}' in {context}"));

    let host = settings.host.clone().ok_or_else(|| missing("host"))?;
    let user_ro = settings.user_ro.clone().ok_or_else(|| missing("user_ro"))?;
    let user_rw = settings.user_rw.clone().ok_or_else(|| missing("user_rw"))?;
    let port = match &settings.port {
        Some(port) => port.resolve().map_err(|e| ChimeDbError::config(format!("{e} in {context}")))?,
        None => DEFAULT_PG_PORT,
    };

    let tunnel = match &settings.tunnel_host {
        Some(tunnel_host) => Some(
            TunnelSettings::parse(
                tunnel_host,
                settings.tunnel_user.as_deref(),
                settings.tunnel_identity.clone(),
            )
            .map_err(|e| ChimeDbError::config(format!("{e} in {context}")))?,
        ),
        None => None,
    };

    let read_only = PgTarget {
        host,
        port,
        dbname: settings.db.clone(),
        user: user_ro,
        password: settings.passwd_ro.clone(),
        tunnel,
        connect_timeout: connect_timeout(),
    };
    let read_write = PgTarget { user: user_rw, password: settings.passwd_rw, ..read_only.clone() };

    Ok(ConnectorSet::single(
        Box::new(PostgresConnector::new(read_only, false)),
        Box::new(PostgresConnector::new(read_write, true)),
        context,
    ))
}

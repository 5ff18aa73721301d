//! Thread-local connection state.
//!
//! Each thread holds its own read-only and read-write connectors. Nothing in
//! here is shared between threads, so no locking is needed; every thread that
//! wants the database calls [`connect`] itself.

use crate::config;
use crate::error::{ChimeDbError, ChimeDbResult};
use crate::proxy::PROXY;
use crate::services::{Connector, ConnectorSet, Database};

use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
struct ThreadConnectors {
    read_only: Option<Rc<dyn Connector>>,
    read_write: Option<Rc<dyn Connector>>,
}

thread_local! {
    static CONNECTORS: RefCell<ThreadConnectors> = RefCell::new(ThreadConnectors::default());
}

/// The connector established for this thread, or `None` before [`connect`].
pub fn current_connector(read_write: bool) -> Option<Rc<dyn Connector>> {
    CONNECTORS.with(|c| {
        let c = c.borrow();
        if read_write {
            c.read_write.clone()
        } else {
            c.read_only.clone()
        }
    })
}

fn has_connectors() -> bool {
    CONNECTORS.with(|c| {
        let c = c.borrow();
        c.read_only.is_some() || c.read_write.is_some()
    })
}

/// Connect this thread to the database and bind [`PROXY`] to it.
///
/// The first call resolves the configuration and establishes both a
/// read-only and a read-write connector. Later calls reuse them as-is unless
/// `reconnect` is set, in which case the old connectors are closed first.
/// The proxy is rebound on every call to the connector for `read_write`.
pub fn connect(read_write: bool, reconnect: bool) -> ChimeDbResult<Rc<dyn Database>> {
    if has_connectors() && !reconnect {
        tracing::debug!("Connection already exists.");
    } else {
        if reconnect {
            close();
        }
        establish(config::resolve()?)?;
    }

    let connector = current_connector(read_write)
        .ok_or_else(|| ChimeDbError::connection("No database connection could be established."))?;
    let db = connector.database()?;
    PROXY.initialize(db.clone());
    Ok(db)
}

fn establish(set: ConnectorSet) -> ChimeDbResult<()> {
    let ConnectorSet { read_only, read_write, context } = set;

    let ro = first_working(read_only, &context, false);
    let rw = first_working(read_write, &context, true);
    let complete = ro.is_some() && rw.is_some();

    CONNECTORS.with(|c| {
        let mut c = c.borrow_mut();
        c.read_only = ro;
        c.read_write = rw;
    });

    if complete {
        Ok(())
    } else {
        Err(ChimeDbError::connection(
            "Connection data found, but no connection could be established.",
        ))
    }
}

/// Probe the candidates in order and keep the first that answers.
fn first_working(
    candidates: Vec<Box<dyn Connector>>,
    context: &str,
    read_write: bool,
) -> Option<Rc<dyn Connector>> {
    let mode = if read_write { "Read-write" } else { "Read-only" };

    for connector in candidates {
        match connector.probe() {
            Ok(()) => {
                tracing::info!(
                    "{mode} connection to {} defined by {context} established.",
                    connector.description()
                );
                return Some(Rc::from(connector));
            }
            Err(e) => {
                tracing::debug!(
                    "Unable to connect to {} defined by {context}: {e}",
                    connector.description()
                );
                connector.close();
            }
        }
    }

    tracing::warn!(mode, context, "Could not establish connection to CHIME database.");
    None
}

/// Connect and hand back the read-write database, for tools that manage
/// their own transactions.
///
/// The proxy is bound read-only as with a plain [`connect`]. Failures to reach
/// the database are wrapped in a single "chimedb connection failed" error.
pub fn connect_read_write() -> ChimeDbResult<Rc<dyn Database>> {
    if let Err(e) = connect(false, false) {
        return Err(if e.is_connection_error() {
            ChimeDbError::connection_with_source("chimedb connection failed", e)
        } else {
            e
        });
    }

    let connector = current_connector(true)
        .ok_or_else(|| ChimeDbError::connection("No database connection could be established."))?;
    connector.database()
}

/// Close this thread's connections, discarding uncommitted work.
///
/// Idempotent; the proxy is unbound for this thread.
pub fn close() {
    let (read_only, read_write) = CONNECTORS.with(|c| {
        let mut c = c.borrow_mut();
        (c.read_only.take(), c.read_write.take())
    });
    for connector in read_only.into_iter().chain(read_write) {
        connector.close();
    }
    PROXY.reset();
}

/// Connect, then run `f` in a transaction on [`PROXY`].
///
/// Commits when `f` returns `Ok`, rolls back on `Err`. The connection stays
/// open afterwards.
pub fn atomic<T, E>(read_write: bool, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
where
    E: From<ChimeDbError>,
{
    connect(read_write, false)?;
    PROXY.atomic(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::clean_env;
    use crate::models::Value;
    use serial_test::serial;

    #[test]
    fn test_uninitialised_connectors() {
        std::thread::spawn(|| {
            assert!(current_connector(false).is_none());
            assert!(current_connector(true).is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[serial]
    fn test_reconnect_replaces_connectors() {
        clean_env();
        config::test_enable();

        let first = connect(true, false).unwrap();
        let connector = current_connector(true).unwrap();

        let second = connect(true, true).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(!Rc::ptr_eq(&connector, &current_connector(true).unwrap()));

        close();
        clean_env();
    }

    #[test]
    #[serial]
    fn test_no_working_connector() {
        clean_env();
        let dir = tempfile::tempdir().unwrap();
        // Read-only open of a missing file fails; read-write would create it.
        std::env::set_var(config::ENV_TEST_SQLITE, dir.path().join("absent.db"));
        config::test_enable();

        let err = connect(false, false).unwrap_err();
        assert!(err.to_string().contains("no connection could be established"));
        assert!(current_connector(false).is_none());
        assert!(current_connector(true).is_some());

        // The half-established state is reused; the read-only side is still missing.
        let err = connect(false, false).unwrap_err();
        assert!(err.to_string().contains("No database connection could be established."));
        assert!(connect(true, false).is_ok());

        close();
        clean_env();
    }

    #[test]
    #[serial]
    fn test_connect_read_write() {
        clean_env();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var(config::ENV_TEST_SQLITE, file.path());
        config::test_enable();

        let db = connect_read_write().unwrap();
        db.execute_batch("CREATE TABLE testtable (datum INTEGER)").unwrap();
        assert!(Rc::ptr_eq(&db, &current_connector(true).unwrap().database().unwrap()));
        // The proxy stays on the read-only side.
        assert!(PROXY.execute("INSERT INTO testtable VALUES ($1)", &[Value::Integer(1)]).is_err());

        close();
        clean_env();
    }

    #[test]
    #[serial]
    fn test_connect_read_write_wraps_connection_failure() {
        clean_env();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(config::ENV_TEST_SQLITE, dir.path().join("absent.db"));
        config::test_enable();

        let err = connect_read_write().unwrap_err();
        assert!(matches!(err, ChimeDbError::Connection { .. }), "got {err:?}");
        assert!(err.to_string().contains("chimedb connection failed"));
        close();

        // Configuration errors pass through unchanged.
        clean_env();
        std::env::set_var(config::ENV_TEST_RC, "/etc/chimedbrc");
        config::test_enable();
        let err = connect_read_write().unwrap_err();
        assert!(matches!(err, ChimeDbError::Config { .. }), "got {err:?}");

        close();
        clean_env();
    }

    #[test]
    #[serial]
    fn test_atomic_connects_and_commits() {
        clean_env();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var(config::ENV_TEST_SQLITE, file.path());
        config::test_enable();

        let result: ChimeDbResult<()> = atomic(true, || {
            PROXY.execute_batch("CREATE TABLE testtable (datum INTEGER)")?;
            PROXY.execute("INSERT INTO testtable VALUES ($1)", &[Value::Integer(83)])?;
            Ok(())
        });
        result.unwrap();

        close();
        connect(false, false).unwrap();
        let datum = PROXY.query_scalar("SELECT datum FROM testtable", &[]).unwrap();
        assert_eq!(datum, Value::Integer(83));

        close();
        clean_env();
    }
}

//! The shared database proxy.
//!
//! Model code issues its queries through [`PROXY`] rather than holding a
//! connection itself. [`crate::connect`] binds the proxy to the current
//! thread's database; other threads see their own binding.

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::{Row, Value};
use crate::services::Database;

use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static BOUND: RefCell<Option<Rc<dyn Database>>> = const { RefCell::new(None) };
}

/// Indirection to the database bound on the calling thread.
#[derive(Debug)]
pub struct Proxy {
    _private: (),
}

/// The process-wide proxy.
pub static PROXY: Proxy = Proxy { _private: () };

impl Proxy {
    /// Bind this thread's proxy to `db`.
    pub fn initialize(&self, db: Rc<dyn Database>) {
        BOUND.with(|bound| *bound.borrow_mut() = Some(db));
    }

    /// True if this thread's proxy is bound to an open database.
    pub fn is_initialized(&self) -> bool {
        BOUND.with(|bound| bound.borrow().as_ref().is_some_and(|db| !db.is_closed()))
    }

    pub(crate) fn reset(&self) {
        BOUND.with(|bound| bound.borrow_mut().take());
    }

    /// The bound database.
    pub fn database(&self) -> ChimeDbResult<Rc<dyn Database>> {
        BOUND
            .with(|bound| bound.borrow().clone())
            .filter(|db| !db.is_closed())
            .ok_or_else(|| {
                ChimeDbError::connection("Database proxy is not initialized; call connect() first")
            })
    }

    /// Execute a statement, returning the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> ChimeDbResult<u64> {
        self.database()?.execute(sql, params)
    }

    /// Execute one or more statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> ChimeDbResult<()> {
        self.database()?.execute_batch(sql)
    }

    /// Run a query and return every row.
    pub fn query(&self, sql: &str, params: &[Value]) -> ChimeDbResult<Vec<Row>> {
        self.database()?.query(sql, params)
    }

    /// Run a query that must return at least one row; the first is returned.
    pub fn query_one(&self, sql: &str, params: &[Value]) -> ChimeDbResult<Row> {
        self.query(sql, params)?
            .into_iter()
            .next()
            .ok_or_else(|| ChimeDbError::not_found("Query returned no rows"))
    }

    /// First column of the first row.
    pub fn query_scalar(&self, sql: &str, params: &[Value]) -> ChimeDbResult<Value> {
        let row = self.query_one(sql, params)?;
        row.values()
            .first()
            .cloned()
            .ok_or_else(|| ChimeDbError::not_found("Query returned no columns"))
    }

    /// Check whether a table exists.
    pub fn table_exists(&self, table: &str) -> ChimeDbResult<bool> {
        self.database()?.table_exists(table)
    }

    /// Begin a transaction (a savepoint when one is already open).
    pub fn begin(&self) -> ChimeDbResult<()> {
        self.database()?.begin()
    }

    /// Commit the innermost transaction.
    pub fn commit(&self) -> ChimeDbResult<()> {
        self.database()?.commit()
    }

    /// Roll back the innermost transaction.
    pub fn rollback(&self) -> ChimeDbResult<()> {
        self.database()?.rollback()
    }

    /// Run `f` inside a transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back on `Err`.
    /// Nested calls use savepoints. If `f` ends the transaction itself with
    /// [`Proxy::commit`] or [`Proxy::rollback`], nothing more is done.
    pub fn atomic<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<ChimeDbError>,
    {
        let db = self.database()?;
        db.begin()?;
        let depth = db.transaction_depth();
        tracing::debug!(depth, "Entering atomic context");

        let result = f();

        if db.is_closed() || db.transaction_depth() < depth {
            tracing::debug!(depth, "Atomic context already ended");
            return result;
        }

        let result = match result {
            Ok(value) => match db.commit() {
                Ok(()) => Ok(value),
                Err(e) => {
                    if let Err(rollback_err) = db.rollback() {
                        tracing::warn!(error = %rollback_err, "Rollback after failed commit failed");
                    }
                    Err(e.into())
                }
            },
            Err(e) => {
                if let Err(rollback_err) = db.rollback() {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        };
        tracing::debug!(depth, "Exited atomic context");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{Connector, SqliteConnector};

    fn bind_scratch() -> (tempfile::NamedTempFile, SqliteConnector) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let connector = SqliteConnector::new(file.path().to_str().unwrap(), true);
        PROXY.initialize(connector.database().unwrap());
        PROXY.execute_batch("CREATE TABLE testtable (datum INTEGER)").unwrap();
        PROXY.execute("INSERT INTO testtable VALUES ($1)", &[Value::Integer(83)]).unwrap();
        (file, connector)
    }

    fn datum() -> i64 {
        PROXY.query_scalar("SELECT datum FROM testtable", &[]).unwrap().as_i64().unwrap()
    }

    #[test]
    fn test_unbound_proxy_is_connection_error() {
        PROXY.reset();
        assert!(!PROXY.is_initialized());
        let err = PROXY.query("SELECT 1", &[]).unwrap_err();
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("call connect() first"));
    }

    #[test]
    fn test_query_helpers() {
        let (_file, connector) = bind_scratch();
        assert!(PROXY.is_initialized());
        assert!(PROXY.table_exists("testtable").unwrap());
        assert!(!PROXY.table_exists("othertable").unwrap());

        let row = PROXY.query_one("SELECT datum FROM testtable", &[]).unwrap();
        assert_eq!(row.try_i64("datum").unwrap(), 83);

        let err = PROXY.query_one("SELECT datum FROM testtable WHERE datum < 0", &[]).unwrap_err();
        assert!(matches!(err, ChimeDbError::NotFound { .. }));

        connector.close();
        assert!(!PROXY.is_initialized());
        PROXY.reset();
    }

    #[test]
    fn test_atomic_commit_and_rollback() {
        let (_file, _connector) = bind_scratch();

        let ok: ChimeDbResult<()> = PROXY.atomic(|| {
            PROXY.execute("UPDATE testtable SET datum = 84", &[])?;
            Ok(())
        });
        ok.unwrap();
        assert_eq!(datum(), 84);

        let err: ChimeDbResult<()> = PROXY.atomic(|| {
            PROXY.execute("UPDATE testtable SET datum = 85", &[])?;
            Err(ChimeDbError::validation("abort"))
        });
        assert!(err.is_err());
        assert_eq!(datum(), 84);
        PROXY.reset();
    }

    #[test]
    fn test_atomic_nests_with_savepoints() {
        let (_file, _connector) = bind_scratch();

        let outer: ChimeDbResult<()> = PROXY.atomic(|| {
            PROXY.execute("UPDATE testtable SET datum = 1", &[])?;
            let inner: ChimeDbResult<()> = PROXY.atomic(|| {
                PROXY.execute("UPDATE testtable SET datum = 2", &[])?;
                Err(ChimeDbError::validation("inner only"))
            });
            assert!(inner.is_err());
            Ok(())
        });
        outer.unwrap();
        assert_eq!(datum(), 1);
        PROXY.reset();
    }

    #[test]
    fn test_atomic_respects_explicit_rollback() {
        let (_file, _connector) = bind_scratch();

        let result: ChimeDbResult<()> = PROXY.atomic(|| {
            PROXY.execute("UPDATE testtable SET datum = 84", &[])?;
            PROXY.rollback()
        });
        result.unwrap();
        assert_eq!(datum(), 83);
        assert_eq!(PROXY.database().unwrap().transaction_depth(), 0);
        PROXY.reset();
    }
}

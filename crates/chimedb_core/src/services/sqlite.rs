//! SQLite backend built on rusqlite.

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::{Backend, Row, Value};
use crate::services::connection::{
    begin_statement, commit_statement, rollback_statement, Connector, Database,
};

use rusqlite::{Connection, OpenFlags, Statement};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// URI of the shared in-memory database used in test-safe mode.
pub const MEMORY_URI: &str = "file::memory:?cache=shared";

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector for SQLite databases.
///
/// A read-only connector rewrites a plain path into a `mode=ro` URI; a value
/// that is already a `file:` URI is used unchanged.
pub struct SqliteConnector {
    uri: String,
    read_write: bool,
    database: RefCell<Option<Rc<SqliteDatabase>>>,
}

impl SqliteConnector {
    /// Create a connector for a filename or `file:` URI.
    pub fn new(db: impl Into<String>, read_write: bool) -> Self {
        let db = db.into();
        let uri = if !read_write && !db.starts_with("file:") {
            format!("file:{db}?mode=ro")
        } else {
            db
        };
        Self { uri, read_write, database: RefCell::new(None) }
    }

    /// Create a connector for the shared in-memory database.
    pub fn in_memory(read_write: bool) -> Self {
        Self::new(MEMORY_URI, read_write)
    }

    /// The filename or URI this connector opens.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> ChimeDbResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&self.uri, flags).map_err(|e| {
            ChimeDbError::connection_with_source(
                format!("Failed to connect to Sqlite database {}.", self.uri),
                e,
            )
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

impl Connector for SqliteConnector {
    fn description(&self) -> String {
        format!("Sqlite database at {}", self.uri)
    }

    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn read_write(&self) -> bool {
        self.read_write
    }

    fn probe(&self) -> ChimeDbResult<()> {
        let conn = self.open()?;
        // A read-only open is lazy; touch the schema so a missing file fails here.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| {
                ChimeDbError::connection_with_source(
                    format!("Failed to connect to Sqlite database {}.", self.uri),
                    e,
                )
            })?;
        conn.close().map_err(|(_, e)| ChimeDbError::from(e))
    }

    fn database(&self) -> ChimeDbResult<Rc<dyn Database>> {
        if let Some(db) = self.database.borrow().as_ref() {
            if db.is_usable() {
                return Ok(db.clone());
            }
        }

        let db = Rc::new(SqliteDatabase::new(self.open()?, self.uri.clone()));
        *self.database.borrow_mut() = Some(db.clone());
        Ok(db)
    }

    fn close(&self) {
        if let Some(db) = self.database.borrow_mut().take() {
            tracing::debug!(uri = %self.uri, "Closing database.");
            db.close();
        }
    }
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector")
            .field("uri", &self.uri)
            .field("read_write", &self.read_write)
            .finish()
    }
}

/// An open SQLite connection.
pub struct SqliteDatabase {
    uri: String,
    conn: RefCell<Option<Connection>>,
    depth: Cell<usize>,
}

impl SqliteDatabase {
    fn new(conn: Connection, uri: String) -> Self {
        Self { uri, conn: RefCell::new(Some(conn)), depth: Cell::new(0) }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> ChimeDbResult<T>) -> ChimeDbResult<T> {
        let guard = self.conn.borrow();
        let conn = guard.as_ref().ok_or_else(|| {
            ChimeDbError::connection(format!("Sqlite database {} is closed", self.uri))
        })?;
        f(conn)
    }
}

/// Bind `params` so that `$n` always receives `params[n - 1]`.
///
/// SQLite treats `$1` as a named parameter and numbers parameters by first
/// appearance, so each slot is resolved by its name. `?` and `?n` slots bind
/// by their own index.
fn bind_positional(stmt: &mut Statement<'_>, params: &[Value]) -> ChimeDbResult<()> {
    let expected = stmt.parameter_count();
    let mut highest = 0;

    for slot in 1..=expected {
        let position = match stmt.parameter_name(slot) {
            Some(name) if name.starts_with('$') => name[1..].parse::<usize>().map_err(|_| {
                ChimeDbError::validation(format!(
                    "Unsupported parameter {name}; use positional $1, $2, ..."
                ))
            })?,
            _ => slot,
        };
        let value = position
            .checked_sub(1)
            .and_then(|idx| params.get(idx))
            .ok_or(rusqlite::Error::InvalidParameterCount(params.len(), position.max(expected)))?;
        stmt.raw_bind_parameter(slot, value)?;
        highest = highest.max(position);
    }

    if highest != params.len() {
        return Err(rusqlite::Error::InvalidParameterCount(params.len(), highest).into());
    }
    Ok(())
}

impl Database for SqliteDatabase {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn execute(&self, sql: &str, params: &[Value]) -> ChimeDbResult<u64> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            bind_positional(&mut stmt, params)?;
            let changed = stmt.raw_execute()?;
            Ok(changed as u64)
        })
    }

    fn query(&self, sql: &str, params: &[Value]) -> ChimeDbResult<Vec<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> =
                stmt.column_names().into_iter().map(String::from).collect();

            bind_positional(&mut stmt, params)?;
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let values = (0..columns.len())
                    .map(|idx| row.get_ref(idx).map(Value::from))
                    .collect::<Result<Vec<_>, _>>()?;
                out.push(Row::new(columns.clone(), values));
            }
            Ok(out)
        })
    }

    fn execute_batch(&self, sql: &str) -> ChimeDbResult<()> {
        self.with_conn(|conn| conn.execute_batch(sql).map_err(ChimeDbError::from))
    }

    fn table_exists(&self, table: &str) -> ChimeDbResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn begin(&self) -> ChimeDbResult<()> {
        let depth = self.depth.get();
        self.execute_batch(&begin_statement(depth))?;
        self.depth.set(depth + 1);
        Ok(())
    }

    fn commit(&self) -> ChimeDbResult<()> {
        let depth = self.depth.get();
        if depth == 0 {
            return Err(ChimeDbError::inconsistency("Commit without an open transaction"));
        }
        self.execute_batch(&commit_statement(depth))?;
        self.depth.set(depth - 1);
        Ok(())
    }

    fn rollback(&self) -> ChimeDbResult<()> {
        let depth = self.depth.get();
        if depth == 0 {
            return Err(ChimeDbError::inconsistency("Rollback without an open transaction"));
        }
        // The level is gone whether or not the statement succeeds.
        self.depth.set(depth - 1);
        self.execute_batch(&rollback_statement(depth))
    }

    fn transaction_depth(&self) -> usize {
        self.depth.get()
    }

    fn is_usable(&self) -> bool {
        self.conn.borrow().is_some()
    }

    fn is_closed(&self) -> bool {
        self.conn.borrow().is_none()
    }

    fn close(&self) {
        self.depth.set(0);
        if let Some(conn) = self.conn.borrow_mut().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(uri = %self.uri, error = %e, "Error while closing Sqlite database");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn seeded_file() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch("CREATE TABLE testtable (datum INTEGER); INSERT INTO testtable VALUES (83);")
            .unwrap();
        file
    }

    #[test]
    fn test_read_only_uri_rewrite() {
        let ro = SqliteConnector::new("/data/chime.db", false);
        assert_eq!(ro.uri(), "file:/data/chime.db?mode=ro");

        let rw = SqliteConnector::new("/data/chime.db", true);
        assert_eq!(rw.uri(), "/data/chime.db");

        // URIs pass through untouched.
        let uri = SqliteConnector::new("file:/data/chime.db", false);
        assert_eq!(uri.uri(), "file:/data/chime.db");
        assert_eq!(uri.description(), "Sqlite database at file:/data/chime.db");
    }

    #[test]
    fn test_read_only_connector_rejects_writes() {
        let file = seeded_file();
        let path = file.path().to_str().unwrap();

        let ro = SqliteConnector::new(path, false);
        ro.probe().unwrap();
        let db = ro.database().unwrap();
        let rows = db.query("SELECT datum FROM testtable", &[]).unwrap();
        assert_eq!(rows[0].try_i64("datum").unwrap(), 83);

        let err = db.execute("UPDATE testtable SET datum = $1", &[Value::Integer(1)]).unwrap_err();
        assert!(matches!(err, ChimeDbError::Database { .. }), "got {err:?}");
    }

    #[test]
    fn test_read_write_connector_updates() {
        let file = seeded_file();
        let rw = SqliteConnector::new(file.path().to_str().unwrap(), true);
        let db = rw.database().unwrap();

        let changed =
            db.execute("UPDATE testtable SET datum = $1", &[Value::Integer(166)]).unwrap();
        assert_eq!(changed, 1);
        let rows = db.query("SELECT datum FROM testtable", &[]).unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::Integer(166)));
    }

    #[test]
    fn test_database_handle_is_reused_until_closed() {
        let file = seeded_file();
        let rw = SqliteConnector::new(file.path().to_str().unwrap(), true);

        let first = rw.database().unwrap();
        let second = rw.database().unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        rw.close();
        assert!(first.is_closed());
        assert!(first.query("SELECT 1", &[]).unwrap_err().is_connection_error());

        let third = rw.database().unwrap();
        assert!(!Rc::ptr_eq(&first, &third));
        rw.close();
        // Idempotent.
        rw.close();
    }

    #[test]
    fn test_probe_missing_read_only_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.db");
        let ro = SqliteConnector::new(missing.to_str().unwrap(), false);
        let err = ro.probe().unwrap_err();
        assert!(err.is_connection_error(), "got {err:?}");
    }

    #[test]
    fn test_placeholders_bind_by_number() {
        let file = seeded_file();
        let rw = SqliteConnector::new(file.path().to_str().unwrap(), true);
        let db = rw.database().unwrap();

        let rows = db
            .query("SELECT $2 AS a, $1 AS b, $2 AS c", &[Value::Integer(1), Value::Integer(2)])
            .unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::Integer(2)));
        assert_eq!(rows[0].get(1), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get(2), Some(&Value::Integer(2)));

        let changed = db
            .execute(
                "UPDATE testtable SET datum = $2 WHERE datum = $1",
                &[Value::Integer(83), Value::Integer(84)],
            )
            .unwrap();
        assert_eq!(changed, 1);
        let rows = db.query("SELECT datum FROM testtable", &[]).unwrap();
        assert_eq!(rows[0].try_i64("datum").unwrap(), 84);
    }

    #[test]
    fn test_placeholder_count_mismatch() {
        let file = seeded_file();
        let rw = SqliteConnector::new(file.path().to_str().unwrap(), true);
        let db = rw.database().unwrap();

        assert!(db.query("SELECT $2 AS a", &[Value::Integer(1)]).is_err());
        assert!(db.query("SELECT $1 AS a", &[Value::Integer(1), Value::Integer(2)]).is_err());
    }

    #[test]
    fn test_nested_transactions_use_savepoints() {
        let file = seeded_file();
        let rw = SqliteConnector::new(file.path().to_str().unwrap(), true);
        let db = rw.database().unwrap();

        db.begin().unwrap();
        db.execute("UPDATE testtable SET datum = 1", &[]).unwrap();
        db.begin().unwrap();
        assert_eq!(db.transaction_depth(), 2);
        db.execute("UPDATE testtable SET datum = 2", &[]).unwrap();
        db.rollback().unwrap();
        db.commit().unwrap();
        assert_eq!(db.transaction_depth(), 0);

        let rows = db.query("SELECT datum FROM testtable", &[]).unwrap();
        assert_eq!(rows[0].try_i64("datum").unwrap(), 1);
        assert!(matches!(db.commit(), Err(ChimeDbError::Inconsistency { .. })));
    }

    #[test]
    fn test_close_discards_uncommitted_work() {
        let file = seeded_file();
        let rw = SqliteConnector::new(file.path().to_str().unwrap(), true);
        let db = rw.database().unwrap();
        db.begin().unwrap();
        db.execute("DELETE FROM testtable", &[]).unwrap();
        rw.close();

        let db = rw.database().unwrap();
        let rows = db.query("SELECT COUNT(*) AS n FROM testtable", &[]).unwrap();
        assert_eq!(rows[0].try_i64("n").unwrap(), 1);
    }
}

//! Connector and database abstractions shared by the SQLite and PostgreSQL backends.
//!
//! A [`Connector`] knows how to reach one database in one mode (read-only or
//! read-write). It hands out a shared [`Database`] handle, reopening it when the
//! previous one is no longer usable. Both live in thread-local state and are
//! never shared across threads.

use crate::error::ChimeDbResult;
use crate::models::{Backend, Row, Value};

use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

/// Loopback address used for tunnel endpoints.
///
/// This cannot be "localhost": some client libraries treat that name as a
/// request for a local socket.
pub const LOCALHOST: &str = "127.0.0.1";

/// How long a tunnel liveness check waits.
pub const TUNNEL_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// An open database handle.
///
/// Parameters use positional `$1, $2, ...` placeholders on every backend.
pub trait Database {
    /// Which engine this handle talks to.
    fn backend(&self) -> Backend;

    /// Execute a statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> ChimeDbResult<u64>;

    /// Execute a query, returning all rows.
    fn query(&self, sql: &str, params: &[Value]) -> ChimeDbResult<Vec<Row>>;

    /// Execute one or more statements without parameters.
    fn execute_batch(&self, sql: &str) -> ChimeDbResult<()>;

    /// Check whether a table exists in the current schema.
    fn table_exists(&self, table: &str) -> ChimeDbResult<bool>;

    /// Begin a transaction, or a savepoint if one is already open.
    fn begin(&self) -> ChimeDbResult<()>;

    /// Commit the innermost transaction or savepoint.
    fn commit(&self) -> ChimeDbResult<()>;

    /// Roll back the innermost transaction or savepoint.
    fn rollback(&self) -> ChimeDbResult<()>;

    /// Current transaction nesting depth (0 = autocommit).
    fn transaction_depth(&self) -> usize;

    /// True if the handle is open and its connection is still alive.
    fn is_usable(&self) -> bool;

    /// True once [`Database::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Close the handle, discarding any uncommitted work. Idempotent.
    fn close(&self);
}

impl std::fmt::Debug for dyn Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend())
            .field("depth", &self.transaction_depth())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Knows how to create connections to a given database.
pub trait Connector {
    /// Human-readable description (never includes credentials).
    fn description(&self) -> String;

    /// Which engine this connector targets.
    fn backend(&self) -> Backend;

    /// True for a read-write connector.
    fn read_write(&self) -> bool;

    /// Open and immediately close a connection, proving the database is reachable.
    fn probe(&self) -> ChimeDbResult<()>;

    /// The shared database handle, opened or reopened as needed.
    fn database(&self) -> ChimeDbResult<Rc<dyn Database>>;

    /// Close the database handle and any route resources (tunnels).
    fn close(&self);
}

/// Candidate connectors for both modes, tried in order.
pub struct ConnectorSet {
    /// Read-only candidates
    pub read_only: Vec<Box<dyn Connector>>,
    /// Read-write candidates
    pub read_write: Vec<Box<dyn Connector>>,
    /// Where this configuration came from, for log messages
    pub context: String,
}

impl ConnectorSet {
    /// Create a set from a single connector per mode.
    pub fn single(
        read_only: Box<dyn Connector>,
        read_write: Box<dyn Connector>,
        context: impl Into<String>,
    ) -> Self {
        Self { read_only: vec![read_only], read_write: vec![read_write], context: context.into() }
    }
}

impl std::fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let describe =
            |list: &[Box<dyn Connector>]| list.iter().map(|c| c.description()).collect::<Vec<_>>();
        f.debug_struct("ConnectorSet")
            .field("read_only", &describe(&self.read_only))
            .field("read_write", &describe(&self.read_write))
            .field("context", &self.context)
            .finish()
    }
}

/// SQL to open a transaction at the given nesting depth.
pub(crate) fn begin_statement(depth: usize) -> String {
    if depth == 0 {
        "BEGIN".to_string()
    } else {
        format!("SAVEPOINT chimedb_sp{depth}")
    }
}

/// SQL to commit the transaction opened at `depth - 1`.
pub(crate) fn commit_statement(depth: usize) -> String {
    if depth <= 1 {
        "COMMIT".to_string()
    } else {
        format!("RELEASE SAVEPOINT chimedb_sp{}", depth - 1)
    }
}

/// SQL to roll back the transaction opened at `depth - 1`.
pub(crate) fn rollback_statement(depth: usize) -> String {
    if depth <= 1 {
        "ROLLBACK".to_string()
    } else {
        let sp = depth - 1;
        // Rolling back to a savepoint leaves it open; release it too.
        format!("ROLLBACK TO SAVEPOINT chimedb_sp{sp}; RELEASE SAVEPOINT chimedb_sp{sp}")
    }
}

/// True if a TCP connection to `host:port` succeeds within `timeout`.
pub fn reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        tracing::debug!(host, port, "Could not resolve database host");
        return false;
    };
    addrs.into_iter().any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// True if something is listening on the local tunnel port.
pub fn tunnel_active(tunnel_port: Option<u16>) -> bool {
    match tunnel_port {
        Some(port) => reachable(LOCALHOST, port, TUNNEL_CHECK_TIMEOUT),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_transaction_statements() {
        assert_eq!(begin_statement(0), "BEGIN");
        assert_eq!(begin_statement(1), "SAVEPOINT chimedb_sp1");
        assert_eq!(commit_statement(1), "COMMIT");
        assert_eq!(commit_statement(2), "RELEASE SAVEPOINT chimedb_sp1");
        assert_eq!(rollback_statement(1), "ROLLBACK");
        assert!(rollback_statement(3).starts_with("ROLLBACK TO SAVEPOINT chimedb_sp2"));
    }

    #[test]
    fn test_tunnel_active_tracks_listener() {
        let listener = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tunnel_active(Some(port)));

        drop(listener);
        assert!(!tunnel_active(Some(port)));
        assert!(!tunnel_active(None));
    }

    #[test]
    fn test_unresolvable_host_is_unreachable() {
        assert!(!reachable("no-such-host.invalid", 5432, Duration::from_millis(200)));
    }
}

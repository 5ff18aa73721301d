//! PostgreSQL backend built on tokio-postgres.
//!
//! The public surface is blocking. Each connector owns a small multi-thread
//! tokio runtime that drives the client connection and, when the server is
//! only reachable through an SSH gateway, the tunnel forwarding task.
//!
//! Route resolution happens on every new client connection:
//!
//! 1. a cached route is reused if still alive (the server, or the tunnel's
//!    local port, must still accept TCP connections)
//! 2. otherwise the server is probed directly with a TCP connect
//! 3. otherwise an SSH tunnel is opened, if one is configured
//!
//! Failing all three is a [`ChimeDbError::NoRouteToDatabase`].

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::value::value_from_pg;
use crate::models::{Backend, Row, TunnelSettings, Value};
use crate::services::connection::{
    begin_statement, commit_statement, reachable, rollback_statement, tunnel_active, Connector,
    Database, LOCALHOST,
};
use crate::services::ssh_tunnel::{SshTunnelHandle, SshTunnelService};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

/// Reported to the server as `application_name`.
const APPLICATION_NAME: &str = "chimedb";

/// Server-side option that makes every transaction read-only.
const READ_ONLY_OPTIONS: &str = "-c default_transaction_read_only=on";

/// Where and as whom to connect.
#[derive(Clone)]
pub struct PgTarget {
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Login role
    pub user: String,
    /// Login password
    pub password: Option<String>,
    /// SSH gateway used when the server is not directly reachable
    pub tunnel: Option<TunnelSettings>,
    /// Timeout for both the TCP route probe and the client connect
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for PgTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tunnel", &self.tunnel)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

enum Route {
    Direct,
    Tunnel(SshTunnelHandle),
}

#[derive(Default)]
struct PgState {
    runtime: Option<Arc<Runtime>>,
    route: Option<Route>,
    database: Option<Rc<PostgresDatabase>>,
}

struct PgInner {
    target: PgTarget,
    read_write: bool,
    state: RefCell<PgState>,
}

/// Connector for a PostgreSQL server, optionally behind an SSH gateway.
pub struct PostgresConnector {
    inner: Rc<PgInner>,
}

impl PostgresConnector {
    /// Create a connector. Nothing is opened until [`Connector::probe`] or
    /// [`Connector::database`] is called.
    pub fn new(target: PgTarget, read_write: bool) -> Self {
        Self {
            inner: Rc::new(PgInner { target, read_write, state: RefCell::new(PgState::default()) }),
        }
    }

    /// Connection target.
    pub fn target(&self) -> &PgTarget {
        &self.inner.target
    }

    /// Local port of the active tunnel, if the current route is tunnelled.
    pub fn tunnel_port(&self) -> Option<u16> {
        match &self.inner.state.borrow().route {
            Some(Route::Tunnel(handle)) => Some(handle.local_port),
            _ => None,
        }
    }
}

impl PgInner {
    fn runtime(&self) -> ChimeDbResult<Arc<Runtime>> {
        if let Some(runtime) = &self.state.borrow().runtime {
            return Ok(runtime.clone());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("chimedb-postgres")
            .enable_all()
            .build()
            .map_err(|e| ChimeDbError::connection_with_source("Failed to start database runtime", e))?;
        let runtime = Arc::new(runtime);
        self.state.borrow_mut().runtime = Some(runtime.clone());
        Ok(runtime)
    }

    /// Resolve the host and port a client should connect to.
    fn ensure_route(&self, runtime: &Runtime) -> ChimeDbResult<(String, u16)> {
        let target = &self.target;
        let mut direct_lost = false;
        {
            let mut state = self.state.borrow_mut();
            let cached = match &state.route {
                Some(Route::Direct) if reachable(&target.host, target.port, target.connect_timeout) => {
                    Some((target.host.clone(), target.port))
                }
                Some(Route::Tunnel(handle))
                    if handle.is_active() && tunnel_active(Some(handle.local_port)) =>
                {
                    Some((LOCALHOST.to_string(), handle.local_port))
                }
                _ => None,
            };
            if let Some(route) = cached {
                return Ok(route);
            }

            match state.route.take() {
                Some(Route::Tunnel(handle)) => {
                    tracing::warn!(tunnel_host = %handle.tunnel_host, "SSH tunnel is down");
                    handle.stop();
                }
                Some(Route::Direct) => {
                    tracing::warn!(host = %target.host, port = target.port, "Direct route to database lost");
                    direct_lost = true;
                }
                None => {}
            }
            // Handles already given out reconnect on their next statement.
            state.database = None;
        }

        if !direct_lost && reachable(&target.host, target.port, target.connect_timeout) {
            self.state.borrow_mut().route = Some(Route::Direct);
            return Ok((target.host.clone(), target.port));
        }

        let Some(tunnel) = &target.tunnel else {
            return Err(ChimeDbError::no_route(format!(
                "Unable to reach {}:{} and no tunnel_host is configured",
                target.host, target.port
            )));
        };

        tracing::debug!(
            host = %target.host,
            port = target.port,
            tunnel_host = %tunnel.host,
            "Direct route failed; tunnelling"
        );
        let handle = runtime
            .block_on(SshTunnelService::establish(tunnel, &target.host, target.port))
            .map_err(|e| {
                ChimeDbError::no_route_with_source(
                    format!("Could not tunnel through {}", tunnel.host),
                    e,
                )
            })?;

        let local_port = handle.local_port;
        self.state.borrow_mut().route = Some(Route::Tunnel(handle));
        Ok((LOCALHOST.to_string(), local_port))
    }

    fn pg_config(&self, host: &str, port: u16) -> tokio_postgres::Config {
        let target = &self.target;
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .dbname(&target.dbname)
            .user(&target.user)
            .application_name(APPLICATION_NAME)
            .connect_timeout(target.connect_timeout);
        if let Some(password) = &target.password {
            config.password(password);
        }
        if !self.read_write {
            config.options(READ_ONLY_OPTIONS);
        }
        config
    }

    fn connect_client(&self) -> ChimeDbResult<(Client, Arc<Runtime>)> {
        let runtime = self.runtime()?;
        let (host, port) = self.ensure_route(&runtime)?;
        let config = self.pg_config(&host, port);
        let timeout = self.target.connect_timeout;

        let (client, connection) = runtime
            .block_on(async { tokio::time::timeout(timeout, config.connect(NoTls)).await })
            .map_err(|_| {
                ChimeDbError::connection(format!(
                    "Timed out after {}s connecting to {host}:{port}",
                    timeout.as_secs_f32()
                ))
            })??;

        runtime.spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "PostgreSQL connection ended with error");
            }
        });

        Ok((client, runtime))
    }

    fn drop_tunnel(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(state.route, Some(Route::Tunnel(_))) {
            if let Some(Route::Tunnel(handle)) = state.route.take() {
                handle.stop();
            }
        }
    }
}

impl Connector for PostgresConnector {
    fn description(&self) -> String {
        let target = &self.inner.target;
        let mut description = format!("PostgreSQL database at {} port {}", target.host, target.port);
        if let Some(Route::Tunnel(handle)) = &self.inner.state.borrow().route {
            description.push_str(&format!(
                " tunnelled through {} to localhost port {}",
                handle.tunnel_host, handle.local_port
            ));
        }
        description
    }

    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn read_write(&self) -> bool {
        self.inner.read_write
    }

    fn probe(&self) -> ChimeDbResult<()> {
        match self.inner.connect_client() {
            Ok((client, _)) => {
                drop(client);
                Ok(())
            }
            Err(e) if e.is_no_route() => Err(e),
            Err(e) => {
                self.inner.drop_tunnel();
                Err(ChimeDbError::connection_with_source(
                    format!("Operational Error while connecting to database: {e}"),
                    e,
                ))
            }
        }
    }

    fn database(&self) -> ChimeDbResult<Rc<dyn Database>> {
        if let Some(db) = self.inner.state.borrow().database.as_ref() {
            if db.is_usable() {
                return Ok(db.clone());
            }
        }

        let (client, runtime) = self.inner.connect_client()?;
        let db = Rc::new(PostgresDatabase {
            connector: Rc::downgrade(&self.inner),
            runtime,
            client: RefCell::new(Some(client)),
            depth: Cell::new(0),
            closed: Cell::new(false),
        });
        self.inner.state.borrow_mut().database = Some(db.clone());
        Ok(db)
    }

    fn close(&self) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(db) = state.database.take() {
            tracing::debug!(host = %self.inner.target.host, "Closing database.");
            db.close();
        }
        if let Some(Route::Tunnel(handle)) = state.route.take() {
            handle.stop();
        }
        // Handles still held elsewhere keep the runtime alive until they drop.
        if let Some(runtime) = state.runtime.take() {
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
        }
    }
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector")
            .field("target", &self.inner.target)
            .field("read_write", &self.inner.read_write)
            .field("tunnel_port", &self.tunnel_port())
            .finish()
    }
}

/// An open PostgreSQL client.
///
/// Outside a transaction, a statement that fails because the connection was
/// lost is retried once on a fresh connection.
pub struct PostgresDatabase {
    connector: Weak<PgInner>,
    runtime: Arc<Runtime>,
    client: RefCell<Option<Client>>,
    depth: Cell<usize>,
    closed: Cell<bool>,
}

impl PostgresDatabase {
    fn attempt<T>(&self, op: &mut impl FnMut(&Client) -> ChimeDbResult<T>) -> ChimeDbResult<T> {
        let guard = self.client.borrow();
        let client = guard
            .as_ref()
            .ok_or_else(|| ChimeDbError::connection("PostgreSQL database is closed"))?;
        op(client)
    }

    fn with_retry<T>(&self, mut op: impl FnMut(&Client) -> ChimeDbResult<T>) -> ChimeDbResult<T> {
        match self.attempt(&mut op) {
            Err(e) if e.is_connection_error() && self.depth.get() == 0 && !self.closed.get() => {
                tracing::warn!(error = %e, "Lost connection to database; reconnecting");
                self.reopen()?;
                self.attempt(&mut op)
            }
            other => other,
        }
    }

    fn reopen(&self) -> ChimeDbResult<()> {
        let connector = self
            .connector
            .upgrade()
            .ok_or_else(|| ChimeDbError::connection("Database connector has been dropped"))?;
        let (client, _) = connector.connect_client()?;
        *self.client.borrow_mut() = Some(client);
        Ok(())
    }
}

fn pg_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn convert_row(row: &tokio_postgres::Row) -> ChimeDbResult<Row> {
    let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..row.len()).map(|idx| value_from_pg(row, idx)).collect::<ChimeDbResult<_>>()?;
    Ok(Row::new(columns, values))
}

impl Database for PostgresDatabase {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn execute(&self, sql: &str, params: &[Value]) -> ChimeDbResult<u64> {
        let params = pg_params(params);
        self.with_retry(|client| Ok(self.runtime.block_on(client.execute(sql, &params))?))
    }

    fn query(&self, sql: &str, params: &[Value]) -> ChimeDbResult<Vec<Row>> {
        let params = pg_params(params);
        self.with_retry(|client| {
            let rows = self.runtime.block_on(client.query(sql, &params))?;
            rows.iter().map(convert_row).collect()
        })
    }

    fn execute_batch(&self, sql: &str) -> ChimeDbResult<()> {
        self.with_retry(|client| Ok(self.runtime.block_on(client.batch_execute(sql))?))
    }

    fn table_exists(&self, table: &str) -> ChimeDbResult<bool> {
        self.with_retry(|client| {
            let row = self.runtime.block_on(client.query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1::text)",
                &[&table],
            ))?;
            Ok(row.try_get::<_, bool>(0)?)
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
        self.depth.set(depth - 1);
        self.execute_batch(&rollback_statement(depth))
    }

    fn transaction_depth(&self) -> usize {
        self.depth.get()
    }

    fn is_usable(&self) -> bool {
        self.client.borrow().as_ref().is_some_and(|client| !client.is_closed())
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn close(&self) {
        self.closed.set(true);
        self.depth.set(0);
        // Dropping the client terminates the session and discards open transactions.
        self.client.borrow_mut().take();
    }
}

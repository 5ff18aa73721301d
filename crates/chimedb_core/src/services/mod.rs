//! Backend services for the chimedb connection layer.
//!
//! - `connection` - Connector and Database traits, route probing
//! - `sqlite` - SQLite backend (rusqlite)
//! - `postgres` - PostgreSQL backend (tokio-postgres on a private runtime)
//! - `ssh_tunnel` - SSH tunnel used when the server is not directly reachable

pub mod connection;
pub mod postgres;
pub mod sqlite;
pub mod ssh_tunnel;

pub use connection::{Connector, ConnectorSet, Database};
pub use postgres::{PgTarget, PostgresConnector, PostgresDatabase};
pub use sqlite::{SqliteConnector, SqliteDatabase};
pub use ssh_tunnel::{SshTunnelHandle, SshTunnelService};

//! Connection settings as read from a chimedb rc file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default PostgreSQL server port.
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Default SSH port on a tunnel host.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A port given either as a YAML number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// `port: 5432`
    Number(u16),
    /// `port: "5432"`
    Text(String),
}

impl PortSpec {
    /// Resolve to a numeric port.
    pub fn resolve(&self) -> Result<u16, String> {
        match self {
            Self::Number(port) => Ok(*port),
            Self::Text(s) => s.trim().parse().map_err(|_| format!("Invalid port number '{s}'")),
        }
    }
}

/// The `chimedb` section of an rc file.
///
/// Passwords are optional; the tunnel entries are omitted when the server is
/// reachable directly.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// `postgresql` (default) or `sqlite`
    pub db_type: Option<String>,
    /// Database name, or the SQLite filename/URI
    pub db: String,
    /// Read-only login
    pub user_ro: Option<String>,
    /// Read-only password
    pub passwd_ro: Option<String>,
    /// Read-write login
    pub user_rw: Option<String>,
    /// Read-write password
    pub passwd_rw: Option<String>,
    /// Server hostname
    pub host: Option<String>,
    /// Server port
    pub port: Option<PortSpec>,
    /// SSH host to tunnel through, optionally `host:port`
    pub tunnel_host: Option<String>,
    /// SSH login on the tunnel host
    pub tunnel_user: Option<String>,
    /// Private key for the tunnel host
    pub tunnel_identity: Option<PathBuf>,
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("db_type", &self.db_type)
            .field("db", &self.db)
            .field("user_ro", &self.user_ro)
            .field("passwd_ro", &self.passwd_ro.as_ref().map(|_| "<redacted>"))
            .field("user_rw", &self.user_rw)
            .field("passwd_rw", &self.passwd_rw.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tunnel_host", &self.tunnel_host)
            .field("tunnel_user", &self.tunnel_user)
            .field("tunnel_identity", &self.tunnel_identity)
            .finish()
    }
}

/// SSH tunnel endpoint and login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Private key; the SSH agent is used when absent
    pub identity: Option<PathBuf>,
}

impl TunnelSettings {
    /// Build tunnel settings from an rc-file `tunnel_host` value.
    ///
    /// `tunnel_host` may carry an explicit port (`gateway:2222`). A missing
    /// username falls back to `$USER`, and a leading `~` in the identity path
    /// is expanded.
    pub fn parse(
        tunnel_host: &str,
        username: Option<&str>,
        identity: Option<PathBuf>,
    ) -> Result<Self, String> {
        let (host, port) = match tunnel_host.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("Invalid port in tunnel_host '{tunnel_host}'"))?;
                (host.to_string(), port)
            }
            None => (tunnel_host.to_string(), DEFAULT_SSH_PORT),
        };
        if host.is_empty() {
            return Err("tunnel_host is empty".to_string());
        }

        let username = username
            .map(String::from)
            .or_else(|| std::env::var("USER").ok())
            .ok_or_else(|| format!("No tunnel_user given for {host} and $USER is unset"))?;

        Ok(Self { host, port, username, identity: identity.map(expand_home) })
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: PathBuf) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return path;
    };
    let expanded = path.strip_prefix("~").ok().map(|rest| home.join(rest));
    expanded.unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec() {
        assert_eq!(PortSpec::Number(5433).resolve().unwrap(), 5433);
        assert_eq!(PortSpec::Text("3306".into()).resolve().unwrap(), 3306);
        assert!(PortSpec::Text("db".into()).resolve().is_err());
    }

    #[test]
    fn test_tunnel_settings_parse() {
        let t = TunnelSettings::parse("gw.example.org", Some("obs"), None).unwrap();
        assert_eq!(t.host, "gw.example.org");
        assert_eq!(t.port, 22);
        assert_eq!(t.username, "obs");

        let t = TunnelSettings::parse("gw:2222", Some("obs"), None).unwrap();
        assert_eq!(t.port, 2222);

        assert!(TunnelSettings::parse("gw:ssh", Some("obs"), None).is_err());
    }

    #[test]
    fn test_identity_home_expansion() {
        let t = TunnelSettings::parse("gw", Some("obs"), Some(PathBuf::from("~/.ssh/id_ed25519")))
            .unwrap();
        let identity = t.identity.unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(identity, home.join(".ssh/id_ed25519"));
        }
    }

    #[test]
    fn test_settings_debug_redacts_passwords() {
        let settings = DatabaseSettings {
            db: "chime".into(),
            passwd_ro: Some("hunter2".into()),
            passwd_rw: Some("s3cret".into()),
            ..Default::default()
        };
        let out = format!("{settings:?}");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("s3cret"));
        assert!(out.contains("<redacted>"));
    }
}

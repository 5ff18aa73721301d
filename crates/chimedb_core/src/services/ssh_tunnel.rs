// SSH tunnel used when the database server cannot be reached directly

use crate::error::{ChimeDbError, ChimeDbResult};
use crate::models::TunnelSettings;
use crate::services::connection::LOCALHOST;

use async_trait::async_trait;
use russh::client;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::KeyPair;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type SshHandle = Arc<Mutex<client::Handle<SshClientHandler>>>;

/// Handle to an active SSH tunnel.
///
/// The tunnel stops when the handle is stopped or dropped.
pub struct SshTunnelHandle {
    /// Local port the tunnel is listening on
    pub local_port: u16,
    /// SSH host the tunnel goes through
    pub tunnel_host: String,
    /// Database host, as seen from the tunnel host
    pub remote_host: String,
    /// Database port
    pub remote_port: u16,
    cancel_token: CancellationToken,
}

impl SshTunnelHandle {
    /// Stop the SSH tunnel.
    pub fn stop(&self) {
        if !self.cancel_token.is_cancelled() {
            self.cancel_token.cancel();
            tracing::info!(
                tunnel_host = %self.tunnel_host,
                local_port = self.local_port,
                "SSH tunnel stopped"
            );
        }
    }

    /// False once the tunnel has been stopped.
    pub fn is_active(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }

    /// A handle for a local port that nothing forwards, plus its cancel token.
    #[cfg(test)]
    pub(crate) fn detached(local_port: u16, tunnel_host: &str) -> (Self, CancellationToken) {
        let cancel_token = CancellationToken::new();
        let handle = Self {
            local_port,
            tunnel_host: tunnel_host.to_string(),
            remote_host: "db.example.org".to_string(),
            remote_port: 5432,
            cancel_token: cancel_token.clone(),
        };
        (handle, cancel_token)
    }
}

impl Drop for SshTunnelHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl std::fmt::Debug for SshTunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnelHandle")
            .field("local_port", &self.local_port)
            .field("tunnel_host", &self.tunnel_host)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("active", &self.is_active())
            .finish()
    }
}

/// SSH client handler for russh.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Unknown host keys are accepted, as with an auto-add policy.
        Ok(true)
    }
}

/// Opens SSH tunnels to database servers.
pub struct SshTunnelService;

impl SshTunnelService {
    /// Open a tunnel through `tunnel` to `remote_host:remote_port`.
    ///
    /// Must run inside a tokio runtime; the forwarding task is spawned on it
    /// and lives until the returned handle is stopped or dropped.
    pub async fn establish(
        tunnel: &TunnelSettings,
        remote_host: &str,
        remote_port: u16,
    ) -> ChimeDbResult<SshTunnelHandle> {
        tracing::info!(
            tunnel_host = %tunnel.host,
            tunnel_port = tunnel.port,
            remote_host,
            remote_port,
            "Establishing SSH tunnel"
        );

        let ssh_client = Arc::new(Mutex::new(Self::connect_ssh(tunnel).await?));

        let listener = TcpListener::bind((LOCALHOST, 0)).await.map_err(|e| {
            ChimeDbError::connection_with_source("Failed to bind local port for SSH tunnel", e)
        })?;
        let local_port = listener.local_addr()?.port();
        tracing::debug!(local_port, "SSH tunnel listening");

        let cancel_token = CancellationToken::new();
        tokio::spawn(Self::run_tunnel(
            listener,
            ssh_client,
            remote_host.to_string(),
            remote_port,
            cancel_token.clone(),
        ));

        Ok(SshTunnelHandle {
            local_port,
            tunnel_host: tunnel.host.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
            cancel_token,
        })
    }

    /// Connect and authenticate to the SSH server.
    async fn connect_ssh(tunnel: &TunnelSettings) -> ChimeDbResult<client::Handle<SshClientHandler>> {
        let addr = tokio::net::lookup_host((tunnel.host.as_str(), tunnel.port))
            .await
            .map_err(|e| {
                ChimeDbError::connection_with_source(
                    format!("Could not resolve SSH host {}", tunnel.host),
                    e,
                )
            })?
            .next()
            .ok_or_else(|| {
                ChimeDbError::connection(format!("No address found for SSH host {}", tunnel.host))
            })?;

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, SshClientHandler).await.map_err(|e| {
            ChimeDbError::connection_with_source(
                format!("Failed to connect to SSH server {}:{}", tunnel.host, tunnel.port),
                e,
            )
        })?;

        let authenticated = match &tunnel.identity {
            Some(path) => Self::authenticate_key_file(&mut handle, &tunnel.username, path).await?,
            None => Self::authenticate_with_agent(&mut handle, &tunnel.username).await?,
        };

        if !authenticated {
            return Err(ChimeDbError::connection(format!(
                "SSH authentication failed for {}@{}",
                tunnel.username, tunnel.host
            )));
        }

        tracing::info!(
            username = %tunnel.username,
            tunnel_host = %tunnel.host,
            "SSH authentication successful"
        );
        Ok(handle)
    }

    async fn authenticate_key_file(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
        path: &Path,
    ) -> ChimeDbResult<bool> {
        let key = Self::load_private_key(path).await?;
        handle.authenticate_publickey(username, key).await.map_err(|e| {
            ChimeDbError::connection_with_source("SSH key authentication failed", e)
        })
    }

    /// Load an unencrypted private key. Encrypted keys belong in the agent.
    async fn load_private_key(path: &Path) -> ChimeDbResult<Arc<KeyPair>> {
        let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
            ChimeDbError::connection_with_source(
                format!("Failed to read SSH key file {}", path.display()),
                e,
            )
        })?;

        let key = russh_keys::decode_secret_key(&key_data, None).map_err(|e| {
            ChimeDbError::connection_with_source(
                format!("Failed to parse SSH key file {}", path.display()),
                e,
            )
        })?;
        Ok(Arc::new(key))
    }

    #[cfg(unix)]
    async fn authenticate_with_agent(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> ChimeDbResult<bool> {
        use tokio::net::UnixStream;

        let socket_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            ChimeDbError::connection("No tunnel_identity given and SSH_AUTH_SOCK is not set")
        })?;
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            ChimeDbError::connection_with_source("Failed to connect to SSH agent", e)
        })?;

        let mut agent = AgentClient::connect(stream);
        let identities = agent.request_identities().await.map_err(|e| {
            ChimeDbError::connection_with_source("Failed to get identities from SSH agent", e)
        })?;
        tracing::debug!(count = identities.len(), "SSH agent identities");

        for identity in identities {
            let (returned_agent, auth_result) =
                handle.authenticate_future(username, identity, agent).await;
            agent = returned_agent;
            match auth_result {
                Ok(true) => return Ok(true),
                Ok(false) => tracing::debug!("SSH agent key rejected, trying next"),
                Err(e) => tracing::debug!(error = %e, "SSH agent auth error, trying next"),
            }
        }

        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_with_agent(
        _handle: &mut client::Handle<SshClientHandler>,
        _username: &str,
    ) -> ChimeDbResult<bool> {
        Err(ChimeDbError::connection(
            "SSH agent authentication is only supported on unix; set tunnel_identity",
        ))
    }

    /// Accept local connections until cancelled.
    async fn run_tunnel(
        listener: TcpListener,
        ssh_client: SshHandle,
        remote_host: String,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::debug!(%peer_addr, "New tunnel connection");
                        let ssh_client = ssh_client.clone();
                        let remote_host = remote_host.clone();
                        let cancel = cancel_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::forward_connection(
                                local_stream, ssh_client, &remote_host, remote_port, cancel,
                            )
                            .await
                            {
                                tracing::warn!(error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to accept tunnel connection"),
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        // Dropping the listener closes the local port, which is what liveness checks see.
        drop(listener);
        let handle = ssh_client.lock().await;
        if let Err(e) = handle.disconnect(russh::Disconnect::ByApplication, "", "en").await {
            tracing::debug!(error = %e, "SSH disconnect failed");
        }
    }

    /// Pipe one local connection through a direct-tcpip channel.
    async fn forward_connection(
        mut local_stream: TcpStream,
        ssh_client: SshHandle,
        remote_host: &str,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) -> ChimeDbResult<()> {
        let channel = {
            let handle = ssh_client.lock().await;
            handle
                .channel_open_direct_tcpip(remote_host, u32::from(remote_port), LOCALHOST, 0)
                .await
                .map_err(|e| {
                    ChimeDbError::connection_with_source("Failed to open SSH channel", e)
                })?
        };
        let mut channel = channel.into_stream();

        tokio::select! {
            copied = tokio::io::copy_bidirectional(&mut local_stream, &mut channel) => {
                let (sent, received) = copied.map_err(|e| {
                    ChimeDbError::connection_with_source("SSH tunnel stream failed", e)
                })?;
                tracing::trace!(sent, received, "Tunnel connection closed");
            }
            _ = cancel_token.cancelled() => {}
        }
        Ok(())
    }
}

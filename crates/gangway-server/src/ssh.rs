//! The SFTP/WebDAV SSH server.
//!
//! Accepts SSH connections, authenticates users against their configured
//! keys, serves the `sftp` subsystem over the user's filesystem chain and
//! routes `direct-tcpip` channels into the virtual port fabric. For every
//! user with WebDAV enabled a virtual listener plus HTTP service is
//! started at boot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key;
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use gangway_vfs::{EmptyMount, FileSystem};

use crate::access_log::{AccessLog, ConnectionInfo};
use crate::config::SftpConfig;
use crate::fabric::PortFabric;
use crate::hostkey::{self, HostKeyError};
use crate::sftp_adapter::SftpSession;
use crate::webdav;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error("authorized key for user {user}: {message}")]
    BadAuthorizedKey { user: String, message: String },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("ssh transport: {0}")]
    Transport(String),
}

/// A forwarded `direct-tcpip` channel, as delivered to a virtual
/// listener. The channel is already accepted; out-of-band requests on it
/// are discarded by the transport layer.
pub struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub info: ConnectionInfo,
}

struct Shared {
    config: SftpConfig,
    keys_per_user: HashMap<String, Vec<ssh_key::PublicKey>>,
    access: AccessLog,
    fabric: PortFabric<ForwardedChannel>,
    cancel: CancellationToken,
    active: AtomicU32,
}

impl Shared {
    fn over_limit(&self) -> bool {
        let max = self.config.server.max_connections;
        max > 0 && self.active.load(Ordering::SeqCst) >= max
    }

    /// Build the user's filesystem chain; a configuration problem yields
    /// the empty mount so the session still comes up.
    fn filesystem_for(&self, username: &str) -> Arc<dyn FileSystem> {
        match self.config.users.get(username) {
            Some(user) => match user.build_filesystem() {
                Ok(fs) => fs,
                Err(e) => {
                    error!(user = username, error = %e, "cannot build filesystem, serving empty mount");
                    Arc::new(EmptyMount)
                }
            },
            None => Arc::new(EmptyMount),
        }
    }
}

/// The file server: host keys, per-user filesystems, the forwarding
/// fabric and the SSH listener.
pub struct FileServer {
    shared: Arc<Shared>,
    keys: Vec<PrivateKey>,
}

impl FileServer {
    pub fn new(config: SftpConfig) -> Result<Self, ServerError> {
        let keys = hostkey::load_or_generate(&config.server.host_keys)?;

        let mut keys_per_user = HashMap::new();
        for (username, user) in &config.users {
            let mut parsed = Vec::with_capacity(user.authorized_keys.len());
            for line in &user.authorized_keys {
                let key = ssh_key::PublicKey::from_openssh(line).map_err(|e| {
                    ServerError::BadAuthorizedKey {
                        user: username.clone(),
                        message: e.to_string(),
                    }
                })?;
                parsed.push(key);
            }
            keys_per_user.insert(username.clone(), parsed);
        }

        let cancel = CancellationToken::new();
        Ok(Self {
            shared: Arc::new(Shared {
                keys_per_user,
                access: AccessLog::stdout(),
                fabric: PortFabric::new(cancel.clone()),
                cancel,
                active: AtomicU32::new(0),
                config,
            }),
            keys,
        })
    }

    /// Token that shuts the server's services down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Start one WebDAV service per user with the feature enabled.
    fn start_webdav_services(&self) {
        let config = &self.shared.config;
        for (username, user) in &config.users {
            if !user.webdav {
                continue;
            }
            let fs = match user.build_filesystem() {
                Ok(fs) => fs,
                Err(e) => {
                    error!(user = %username, error = %e, "cannot build filesystem for webdav");
                    continue;
                }
            };
            let listener = self
                .shared
                .fabric
                .create_listener(config.webdav_port, username);
            webdav::spawn_webdav(fs, listener, self.shared.cancel.clone());
        }
    }

    /// Run until the transport fails or the cancel token fires.
    pub async fn run(self) -> Result<(), ServerError> {
        self.start_webdav_services();

        let russh_config = server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: self.keys.clone(),
            ..Default::default()
        };

        let addr = self.shared.config.server.listen_addr();
        let socket = TcpListener::bind(&addr).await.map_err(|source| {
            ServerError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;
        info!(%addr, "sftp server listening");

        let cancel = self.shared.cancel.clone();
        let mut factory = Factory {
            shared: Arc::clone(&self.shared),
        };
        tokio::select! {
            result = factory.run_on_socket(Arc::new(russh_config), &socket) => {
                result.map_err(|e| ServerError::Transport(e.to_string()))
            }
            _ = cancel.cancelled() => {
                info!("sftp server shutting down");
                Ok(())
            }
        }
    }
}

struct Factory {
    shared: Arc<Shared>,
}

impl server::Server for Factory {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        ClientHandler {
            shared: Arc::clone(&self.shared),
            peer: peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            username: None,
            counted: false,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        debug!(error = %error, "session error");
    }
}

/// Handler for one SSH connection.
struct ClientHandler {
    shared: Arc<Shared>,
    peer: String,
    username: Option<String>,
    counted: bool,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ClientHandler {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            username: self.username.clone().unwrap_or_default(),
            remote_ip: self.peer.clone(),
        }
    }

    fn refuse_session(&mut self, channel_id: ChannelId) {
        if let Some(channel) = self.channels.remove(&channel_id) {
            info!(user = ?self.username, peer = %self.peer, "denying non-sftp session");
            tokio::spawn(async move {
                let _ = channel
                    .data(&b"This server only provides SFTP and WebDAV access.\r\n"[..])
                    .await;
                let _ = channel.eof().await;
                let _ = channel.close().await;
            });
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        if self.counted {
            self.shared.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl server::Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.shared.over_limit() {
            info!(user, peer = %self.peer, "rejecting connection: limit reached");
            return Ok(Auth::reject());
        }
        let accepted = self
            .shared
            .keys_per_user
            .get(user)
            .map(|keys| keys.iter().any(|k| k.key_data() == public_key.key_data()))
            .unwrap_or(false);
        if !accepted {
            info!(user, peer = %self.peer, "public key rejected");
            return Ok(Auth::reject());
        }
        self.username = Some(user.to_string());
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        self.counted = true;
        info!(user, peer = %self.peer, "authenticated");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let info = self.connection_info();
        let fs = self.shared.filesystem_for(&info.username);
        let access = self.shared.access.clone();
        let cancel = self.shared.cancel.clone();
        let handler = SftpSession::new(fs, info.clone(), access.clone());

        session.channel_success(channel_id)?;
        tokio::spawn(async move {
            access.login(&info, "granted").await;
            tokio::select! {
                _ = russh_sftp::server::run(channel.into_stream(), handler) => {}
                _ = cancel.cancelled() => {}
            }
            access.logout(&info).await;
        });
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel_id)?;
        self.refuse_session(channel_id);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel_id)?;
        self.refuse_session(channel_id);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let info = self.connection_info();
        // Server-level forwarding policy: the user must have WebDAV
        // enabled (SSH `Prohibited` otherwise).
        let allowed = self
            .shared
            .config
            .users
            .get(&info.username)
            .map(|u| u.webdav)
            .unwrap_or(false);
        if !allowed {
            info!(user = %info.username, "rejecting forward: webdav disabled");
            return Ok(false);
        }
        let username = info.username.clone();
        match self.shared.fabric.dispatch(
            host_to_connect,
            port_to_connect,
            &username,
            ForwardedChannel { channel, info },
        ) {
            Ok(()) => Ok(true),
            Err(reason) => {
                info!(host = host_to_connect, port = port_to_connect, %reason, "rejecting forward");
                Ok(false)
            }
        }
    }
}

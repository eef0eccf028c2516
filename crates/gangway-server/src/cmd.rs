//! Expose a local command over SSH.
//!
//! Every shell or exec request starts the *configured* command (never the
//! client-supplied one) with piped stdio: channel data feeds stdin,
//! stdout comes back as channel data, stderr as extended data, and the
//! exit status is reported when the child ends. PTY requests are
//! acknowledged and their dimensions logged; resize handling beyond that
//! is left to the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::CmdConfig;
use crate::hostkey;
use crate::ssh::ServerError;

/// The command-over-SSH server.
pub struct CommandServer {
    shared: Arc<Shared>,
    keys: Vec<russh::keys::PrivateKey>,
}

struct Shared {
    config: CmdConfig,
    authorized: Vec<ssh_key::PublicKey>,
    active: AtomicU32,
}

impl CommandServer {
    pub fn new(config: CmdConfig) -> Result<Self, ServerError> {
        let keys = hostkey::load_or_generate(&config.server.host_keys)?;
        let mut authorized = Vec::with_capacity(config.authorized_keys.len());
        for line in &config.authorized_keys {
            let key = ssh_key::PublicKey::from_openssh(line).map_err(|e| {
                ServerError::BadAuthorizedKey {
                    user: "<any>".to_string(),
                    message: e.to_string(),
                }
            })?;
            authorized.push(key);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                authorized,
                active: AtomicU32::new(0),
            }),
            keys,
        })
    }

    pub async fn run(self) -> Result<(), ServerError> {
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
        info!(%addr, command = %self.shared.config.command, "command server listening");

        let mut factory = Factory {
            shared: Arc::clone(&self.shared),
        };
        factory
            .run_on_socket(Arc::new(russh_config), &socket)
            .await
            .map_err(|e| ServerError::Transport(e.to_string()))
    }
}

struct Factory {
    shared: Arc<Shared>,
}

impl server::Server for Factory {
    type Handler = CmdHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        CmdHandler {
            shared: Arc::clone(&self.shared),
            peer: peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            counted: false,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        debug!(error = %error, "session error");
    }
}

struct CmdHandler {
    shared: Arc<Shared>,
    peer: String,
    counted: bool,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl Drop for CmdHandler {
    fn drop(&mut self) {
        if self.counted {
            self.shared.active.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(peer = %self.peer, "disconnected");
    }
}

impl CmdHandler {
    /// Start the configured command and bridge it to the channel.
    fn start_command(&mut self, channel_id: ChannelId, session: &mut Session) -> bool {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return false;
        };
        let config = &self.shared.config;
        let spawned = Command::new(&config.command)
            .args(&config.command_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %config.command, error = %e, "cannot start command");
                return false;
            }
        };

        let handle = session.handle();
        tokio::spawn(async move {
            let mut stdin = child.stdin.take();
            let mut stdout = child.stdout.take();
            let mut stderr = child.stderr.take();
            let (mut from_client, mut to_client) = tokio::io::split(channel.into_stream());

            let stdin_task = tokio::spawn(async move {
                if let Some(stdin) = stdin.as_mut() {
                    let _ = tokio::io::copy(&mut from_client, stdin).await;
                    let _ = stdin.shutdown().await;
                }
            });
            let stdout_task = tokio::spawn(async move {
                if let Some(stdout) = stdout.as_mut() {
                    let _ = tokio::io::copy(stdout, &mut to_client).await;
                }
                let _ = to_client.shutdown().await;
            });
            let stderr_handle = handle.clone();
            let stderr_task = tokio::spawn(async move {
                let Some(stderr) = stderr.as_mut() else {
                    return;
                };
                let mut buf = vec![0u8; 8192];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stderr_handle
                                .extended_data(channel_id, 1, CryptoVec::from(buf[..n].to_vec()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            });

            let status = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            stdin_task.abort();

            let code = status
                .ok()
                .and_then(|s| s.code())
                .unwrap_or(1) as u32;
            let _ = handle.exit_status_request(channel_id, code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        true
    }
}

impl server::Handler for CmdHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let max = self.shared.config.server.max_connections;
        if max > 0 && self.shared.active.load(Ordering::SeqCst) >= max {
            info!(user, peer = %self.peer, "rejecting connection: limit reached");
            return Ok(Auth::reject());
        }
        let accepted = self
            .shared
            .authorized
            .iter()
            .any(|k| k.key_data() == public_key.key_data());
        if !accepted {
            info!(user, peer = %self.peer, "public key rejected");
            return Ok(Auth::reject());
        }
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        self.counted = true;
        info!(user, peer = %self.peer, "connected");
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

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(%term, col_width, row_height, "pty requested");
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(col_width, row_height, "window change");
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.start_command(channel_id, session) {
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The configured command runs regardless of what was requested.
        if self.start_command(channel_id, session) {
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }
}

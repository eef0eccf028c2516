//! Gangway server library.
//!
//! SSH file server (SFTP + forwarded WebDAV) and command-over-SSH
//! server, on top of the `gangway-vfs` filesystem layer.

pub mod access_log;
pub mod cmd;
pub mod config;
pub mod fabric;
pub mod hostkey;
pub mod sftp_adapter;
pub mod ssh;
pub mod webdav;

pub use access_log::{AccessLog, ConnectionInfo};
pub use cmd::CommandServer;
pub use config::{CmdConfig, ConfigError, MountConfig, ServerConfig, SftpConfig, UserConfig};
pub use fabric::{DispatchError, PortFabric, VirtualListener};
pub use ssh::{FileServer, ForwardedChannel, ServerError};

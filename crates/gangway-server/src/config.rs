//! Declarative TOML configuration.
//!
//! One config tree per subcommand: [`CmdConfig`] for exposing a command
//! over SSH, [`SftpConfig`] for the SFTP/WebDAV file server. Both share
//! [`ServerConfig`]. A missing config file is written out with defaults
//! so the operator has something to edit.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gangway_vfs::{
    AccessPolicy, DirMount, FileSystem, FsError, PermissionWrapper, UnionMount,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot encode config: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("bad mount: {0}")]
    Mount(#[from] FsError),

    #[error("bad permission pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fields shared by every server subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub host: String,
    /// SSH port to listen on.
    pub port: u16,
    /// Private host key files. Missing ones are generated.
    pub host_keys: Vec<PathBuf>,
    /// Reject further connections beyond this count; 0 means unlimited.
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2222,
            host_keys: vec![PathBuf::from("serverkey.key")],
            max_connections: 0,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for `gangway cmd`: run a program and pipe it over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdConfig {
    #[serde(flatten)]
    pub server: ServerConfig,
    /// Accepted public keys, in authorized_keys line format.
    pub authorized_keys: Vec<String>,
    /// The command to start for each session.
    pub command: String,
    /// Arguments for the command.
    pub command_args: Vec<String>,
}

impl Default for CmdConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            authorized_keys: Vec::new(),
            command: "cat".to_string(),
            command_args: Vec::new(),
        }
    }
}

/// One served directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Host directory whose contents are served.
    pub root: PathBuf,
    /// Serve without any write permission.
    #[serde(default)]
    pub read_only: bool,
}

/// Per-user settings of the file server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Accepted public keys, in authorized_keys line format.
    pub authorized_keys: Vec<String>,
    /// Directories served to this user, each under its key as a name in
    /// a virtual root. The reserved key `""` serves that single mount
    /// directly, without a virtual root; it cannot be combined with
    /// named mounts.
    pub filesystem: HashMap<String, MountConfig>,
    /// Regexes for paths this user may read. Matched against virtual paths.
    pub can_read: Vec<String>,
    /// Regexes for paths this user may write.
    pub can_write: Vec<String>,
    /// Regexes for paths hidden from this user entirely.
    pub should_hide: Vec<String>,
    /// Allow forwarding the WebDAV port for this user.
    pub webdav: bool,
}

impl UserConfig {
    /// Build this user's filesystem chain: mounts, optional union root,
    /// optional permission wrapper. Empty permission lists mean the raw
    /// mount is served without a wrapper.
    pub fn build_filesystem(&self) -> Result<Arc<dyn FileSystem>, ConfigError> {
        let base: Arc<dyn FileSystem> = if let Some(entry) = self.filesystem.get("") {
            if self.filesystem.len() > 1 {
                return Err(ConfigError::Invalid(
                    "the \"\" mount cannot be combined with named mounts".to_string(),
                ));
            }
            Arc::new(DirMount::new(&entry.root, entry.read_only)?)
        } else {
            let mut table: BTreeMap<String, Arc<dyn FileSystem>> = BTreeMap::new();
            for (name, entry) in &self.filesystem {
                table.insert(
                    name.clone(),
                    Arc::new(DirMount::new(&entry.root, entry.read_only)?),
                );
            }
            Arc::new(UnionMount::new(table)?)
        };
        if self.can_read.is_empty() && self.can_write.is_empty() && self.should_hide.is_empty() {
            return Ok(base);
        }
        let policy = AccessPolicy::new(&self.can_read, &self.can_write, &self.should_hide)?;
        Ok(Arc::new(PermissionWrapper::new(base, policy)))
    }
}

/// Configuration for `gangway sftp`: the multi-tenant file server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    #[serde(flatten)]
    pub server: ServerConfig,
    /// The virtual port WebDAV is reachable on through an SSH forward.
    pub webdav_port: u32,
    /// Users accepted by the server.
    pub users: HashMap<String, UserConfig>,
}

impl Default for SftpConfig {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert(
            "user".to_string(),
            UserConfig {
                authorized_keys: vec!["ssh-ed25519 AAAA... someone@somewhere".to_string()],
                filesystem: HashMap::from([(
                    String::new(),
                    MountConfig {
                        root: PathBuf::from("/"),
                        read_only: true,
                    },
                )]),
                can_read: vec![".*".to_string()],
                can_write: vec![".*".to_string()],
                should_hide: Vec::new(),
                webdav: false,
            },
        );
        Self {
            server: ServerConfig::default(),
            webdav_port: 80,
            users,
        }
    }
}

/// Load a TOML config file.
pub fn load<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&data)?)
}

/// Write a config with its defaults, for the operator to edit.
pub fn write_default<T: Serialize + Default>(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(&T::default())?;
    std::fs::write(path, rendered)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_sftp_config_roundtrips() {
        let rendered = toml::to_string_pretty(&SftpConfig::default()).unwrap();
        let parsed: SftpConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 2222);
        assert_eq!(parsed.webdav_port, 80);
        assert!(parsed.users.contains_key("user"));
        assert!(parsed.users["user"].filesystem.contains_key(""));
    }

    #[test]
    fn parses_a_full_user_entry() {
        let toml_src = r#"
            host = "127.0.0.1"
            port = 2022
            host_keys = ["/etc/gangway/hostkey"]
            webdav_port = 8080

            [users.amy]
            authorized_keys = ["ssh-ed25519 AAAA amy@laptop"]
            can_read = [".*"]
            can_write = ["^/pics(/.*)?$"]
            should_hide = ["/secret(/.*)?"]
            webdav = true

            [users.amy.filesystem.docs]
            root = "/srv/docs"
            read_only = true

            [users.amy.filesystem.pics]
            root = "/srv/pics"
        "#;
        let config: SftpConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.port, 2022);
        let amy = &config.users["amy"];
        assert!(amy.webdav);
        assert!(amy.filesystem["docs"].read_only);
        assert!(!amy.filesystem["pics"].read_only);
    }

    #[tokio::test]
    async fn bare_mount_without_policy_lists_directly() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello"), b"x").unwrap();

        let user = UserConfig {
            filesystem: HashMap::from([(
                String::new(),
                MountConfig {
                    root: dir.path().to_path_buf(),
                    read_only: false,
                },
            )]),
            ..Default::default()
        };
        let fs = user.build_filesystem().unwrap();
        let mut lister = fs.list("/").await.unwrap();
        let chunk = lister.fill(8, 0).await.unwrap();
        assert_eq!(chunk.entries[0].name, "hello");
    }

    #[tokio::test]
    async fn union_user_serves_named_mounts() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let user = UserConfig {
            filesystem: HashMap::from([
                (
                    "docs".to_string(),
                    MountConfig {
                        root: a.path().to_path_buf(),
                        read_only: true,
                    },
                ),
                (
                    "pics".to_string(),
                    MountConfig {
                        root: b.path().to_path_buf(),
                        read_only: false,
                    },
                ),
            ]),
            ..Default::default()
        };
        let fs = user.build_filesystem().unwrap();
        let mut lister = fs.list("/").await.unwrap();
        let chunk = lister.fill(8, 0).await.unwrap();
        let names: Vec<_> = chunk.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["docs", "pics"]);

        // The read-only mount refuses writes through the chain.
        assert!(fs.writer("/docs/new").await.unwrap_err().is_forbidden());
    }

    #[tokio::test]
    async fn policy_lists_produce_a_wrapper() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("secret")).unwrap();
        let user = UserConfig {
            filesystem: HashMap::from([(
                String::new(),
                MountConfig {
                    root: dir.path().to_path_buf(),
                    read_only: false,
                },
            )]),
            can_read: vec![".*".to_string()],
            can_write: vec![".*".to_string()],
            should_hide: vec!["/secret(/.*)?".to_string()],
            ..Default::default()
        };
        let fs = user.build_filesystem().unwrap();
        assert!(fs.stat("/secret").await.unwrap_err().is_forbidden());
    }

    #[test]
    fn empty_key_cannot_be_combined() {
        let user = UserConfig {
            filesystem: HashMap::from([
                (
                    String::new(),
                    MountConfig {
                        root: PathBuf::from("/srv/a"),
                        read_only: false,
                    },
                ),
                (
                    "docs".to_string(),
                    MountConfig {
                        root: PathBuf::from("/srv/b"),
                        read_only: false,
                    },
                ),
            ]),
            ..Default::default()
        };
        assert!(matches!(
            user.build_filesystem(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn bad_regex_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let user = UserConfig {
            filesystem: HashMap::from([(
                String::new(),
                MountConfig {
                    root: dir.path().to_path_buf(),
                    read_only: false,
                },
            )]),
            can_read: vec!["(".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            user.build_filesystem(),
            Err(ConfigError::Pattern(_))
        ));
    }
}

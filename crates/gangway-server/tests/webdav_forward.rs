//! End-to-end test of the in-band WebDAV forward.
//!
//! Drives a real SSH client against an in-process server with ephemeral
//! keys: a `direct-tcpip` channel to the virtual WebDAV port must serve a
//! PROPFIND of the user's filesystem, and users without the feature must
//! be rejected at channel-open time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use gangway_server::{FileServer, MountConfig, ServerConfig, SftpConfig, UserConfig};

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn ephemeral_key() -> PrivateKey {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .expect("failed to generate client key")
}

fn user_entry(key: &PrivateKey, root: &std::path::Path, webdav: bool) -> UserConfig {
    UserConfig {
        authorized_keys: vec![key.public_key().to_openssh().unwrap()],
        filesystem: HashMap::from([(
            String::new(),
            MountConfig {
                root: root.to_path_buf(),
                read_only: false,
            },
        )]),
        can_read: Vec::new(),
        can_write: Vec::new(),
        should_hide: Vec::new(),
        webdav,
    }
}

struct Harness {
    addr: SocketAddr,
    #[allow(dead_code)]
    dirs: Vec<tempfile::TempDir>,
}

/// Start a server with two users: `u` (webdav on) and `v` (webdav off).
async fn start_server(u_key: &PrivateKey, v_key: &PrivateKey) -> Harness {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let keydir = tempfile::TempDir::new().unwrap();
    let served = tempfile::TempDir::new().unwrap();
    std::fs::write(served.path().join("hello.txt"), b"forwarded!").unwrap();

    let config = SftpConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            host_keys: vec![keydir.path().join("hostkey")],
            max_connections: 0,
        },
        webdav_port: 80,
        users: HashMap::from([
            ("u".to_string(), user_entry(u_key, served.path(), true)),
            ("v".to_string(), user_entry(v_key, served.path(), false)),
        ]),
    };

    let server = FileServer::new(config).expect("server construction failed");
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("server error: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    Harness {
        addr,
        dirs: vec![keydir, served],
    }
}

async fn connect(
    addr: SocketAddr,
    username: &str,
    key: PrivateKey,
) -> client::Handle<AcceptAnyHostKey> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, addr, AcceptAnyHostKey)
        .await
        .expect("ssh connect failed");
    let auth = session
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .expect("auth errored");
    assert!(auth.success(), "auth rejected for {username}");
    session
}

#[tokio::test]
async fn forwarded_propfind_lists_the_users_filesystem() {
    let u_key = ephemeral_key();
    let v_key = ephemeral_key();
    let harness = start_server(&u_key, &v_key).await;

    let session = connect(harness.addr, "u", u_key).await;
    let channel = session
        .channel_open_direct_tcpip("localhost", 80, "127.0.0.1", 41999)
        .await
        .expect("direct-tcpip refused for webdav user");

    let mut stream = channel.into_stream();
    stream
        .write_all(
            b"PROPFIND / HTTP/1.1\r\n\
              Host: localhost\r\n\
              Depth: 1\r\n\
              Connection: close\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(
        text.starts_with("HTTP/1.1 207"),
        "expected multi-status, got: {}",
        text.lines().next().unwrap_or("<empty>")
    );
    assert!(text.contains("hello.txt"), "listing missing entry: {text}");
}

#[tokio::test]
async fn forward_is_prohibited_without_webdav() {
    let u_key = ephemeral_key();
    let v_key = ephemeral_key();
    let harness = start_server(&u_key, &v_key).await;

    let session = connect(harness.addr, "v", v_key).await;
    let refused = session
        .channel_open_direct_tcpip("localhost", 80, "127.0.0.1", 41999)
        .await;
    assert!(refused.is_err(), "forward should be prohibited for v");
}

#[tokio::test]
async fn forward_to_an_unknown_port_is_refused() {
    let u_key = ephemeral_key();
    let v_key = ephemeral_key();
    let harness = start_server(&u_key, &v_key).await;

    let session = connect(harness.addr, "u", u_key).await;
    let refused = session
        .channel_open_direct_tcpip("localhost", 4444, "127.0.0.1", 41999)
        .await;
    assert!(refused.is_err(), "unregistered port must be refused");
}

//! Host key management.
//!
//! Configured key files are loaded; missing ones are generated as Ed25519
//! pairs (private `0600`, `<path>.pub` `0644` in authorized_keys form).
//! Offering two keys of the same algorithm is a fatal configuration
//! error, since the transport can only present one per algorithm.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("at least one host key is required")]
    NoneConfigured,

    #[error("two host keys share the algorithm {0}")]
    DuplicateAlgorithm(String),

    #[error("host key {path}: {message}")]
    Key { path: PathBuf, message: String },

    #[error("host key I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("key generation failed: {0}")]
    Generate(String),
}

/// Generate a fresh Ed25519 host key.
pub fn generate_key() -> Result<PrivateKey, HostKeyError> {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(|e| HostKeyError::Generate(e.to_string()))
}

/// Render a key pair: the private key in OpenSSH PEM form and the public
/// key as an authorized_keys line suffixed with `user@host`.
pub fn render_key_pair(key: &PrivateKey) -> Result<(String, String), HostKeyError> {
    let private_pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| HostKeyError::Generate(e.to_string()))?
        .to_string();
    let mut public = key.public_key().clone();
    public.set_comment(key_comment());
    let public_line = public
        .to_openssh()
        .map_err(|e| HostKeyError::Generate(e.to_string()))?;
    Ok((private_pem, format!("{public_line}\n")))
}

fn key_comment() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "gangway".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}

/// Write a generated key pair next to each other with the conventional
/// modes.
pub fn write_key_pair(path: &Path, key: &PrivateKey) -> Result<(), HostKeyError> {
    let (private_pem, public_line) = render_key_pair(key)?;
    fs::write(path, private_pem)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    let mut pub_path = path.as_os_str().to_owned();
    pub_path.push(".pub");
    let pub_path = PathBuf::from(pub_path);
    fs::write(&pub_path, public_line)?;
    fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Load every configured host key, generating missing files on the way,
/// and refuse duplicate algorithms.
pub fn load_or_generate(paths: &[PathBuf]) -> Result<Vec<PrivateKey>, HostKeyError> {
    if paths.is_empty() {
        return Err(HostKeyError::NoneConfigured);
    }
    let mut keys: Vec<PrivateKey> = Vec::with_capacity(paths.len());
    for path in paths {
        let key = if path.exists() {
            russh::keys::load_secret_key(path, None).map_err(|e| HostKeyError::Key {
                path: path.clone(),
                message: e.to_string(),
            })?
        } else {
            info!(path = %path.display(), "host key not found, generating");
            let key = generate_key()?;
            write_key_pair(path, &key)?;
            key
        };
        for existing in &keys {
            if existing.algorithm() == key.algorithm() {
                return Err(HostKeyError::DuplicateAlgorithm(
                    key.algorithm().to_string(),
                ));
            }
        }
        keys.push(key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_and_reloads_missing_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostkey");

        let keys = load_or_generate(&[path.clone()]).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(path.exists());
        assert!(dir.path().join("hostkey.pub").exists());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let pub_mode = std::fs::metadata(dir.path().join("hostkey.pub"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(pub_mode & 0o777, 0o644);

        // Second run loads the same key instead of regenerating.
        let reloaded = load_or_generate(&[path]).unwrap();
        assert_eq!(
            keys[0].public_key().to_openssh().unwrap(),
            reloaded[0].public_key().to_openssh().unwrap()
        );
    }

    #[test]
    fn public_line_is_authorized_keys_form() {
        let key = generate_key().unwrap();
        let (private_pem, public_line) = render_key_pair(&key).unwrap();
        assert!(private_pem.contains("OPENSSH PRIVATE KEY"));
        assert!(public_line.starts_with("ssh-ed25519 "));
        assert!(public_line.trim_end().contains('@'));
    }

    #[test]
    fn duplicate_algorithms_are_fatal() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_key_pair(&a, &generate_key().unwrap()).unwrap();
        write_key_pair(&b, &generate_key().unwrap()).unwrap();

        assert!(matches!(
            load_or_generate(&[a, b]),
            Err(HostKeyError::DuplicateAlgorithm(_))
        ));
    }

    #[test]
    fn empty_configuration_is_fatal() {
        assert!(matches!(
            load_or_generate(&[]),
            Err(HostKeyError::NoneConfigured)
        ));
    }
}

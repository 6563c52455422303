//! Persistence of the server's identifying Ed25519 keypair.

use std::path::{Path, PathBuf};

use ssh_key::{Algorithm, PrivateKey};

use crate::{Error, Result};

/// Loads or generates the persistent Ed25519 host key identifying a `whisp` server.
///
/// Mirrors the layout of `SPEC_FULL.md` §6: a directory holding
/// `ssh_host_key` (mode `0600`) and `ssh_host_key.pub` (mode `0644`),
/// created on first start and reused thereafter.
#[derive(Debug)]
pub struct HostKeyStore {
    dir: PathBuf,
}

impl HostKeyStore {
    /// Use `$HOME/.whisp-<name>/` as the default persistence directory.
    pub fn default_dir(name: &str) -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            Error::HostKey("unable to resolve the current user's home directory".into())
        })?;

        Ok(home.join(format!(".whisp-{name}")))
    }

    /// Open (or create) a host-key store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join("ssh_host_key")
    }

    fn pub_path(&self) -> PathBuf {
        self.dir.join("ssh_host_key.pub")
    }

    /// Load the persisted key, generating and persisting a fresh one if absent.
    pub fn load_or_generate(&self) -> Result<PrivateKey> {
        let path = self.key_path();

        if path.exists() {
            self.load(&path)
        } else {
            let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
            self.persist(&key)?;

            tracing::info!("Generated a new host key at `{}`", path.display());

            Ok(key)
        }
    }

    fn load(&self, path: &Path) -> Result<PrivateKey> {
        let contents = std::fs::read_to_string(path)?;

        PrivateKey::from_openssh(&contents).map_err(Error::from)
    }

    fn persist(&self, key: &PrivateKey) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let armored = key.to_openssh(ssh_key::LineEnding::LF)?;
        std::fs::write(self.key_path(), armored)?;

        let public = key.public_key().to_openssh()?;
        std::fs::write(self.pub_path(), public + "\n")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            std::fs::set_permissions(self.key_path(), std::fs::Permissions::from_mode(0o600))?;
            std::fs::set_permissions(self.pub_path(), std::fs::Permissions::from_mode(0o644))?;
        }

        Ok(())
    }
}

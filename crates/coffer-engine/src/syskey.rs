//! System-domain unlock key files.
//!
//! Containers in the system trust domain unlock without human interaction:
//! a dedicated key file, named after the container's signature, holds the
//! raw master key. One file per signature, owner read/write only on Unix.
//!
//! A missing file is an ordinary `None` — the establishment protocol then
//! falls through to the caller's explicit credential samples. A file of the
//! wrong size is structural damage and reported as such.

use std::path::{Path, PathBuf};

use crate::blob::SIGNATURE_LEN;
use crate::crypto::KEY_LEN;
use crate::error::{EngineError, Result};

/// Directory of per-signature system unlock keys.
#[derive(Debug, Clone)]
pub struct SystemKeyDir {
    dir: PathBuf,
}

impl SystemKeyDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, signature: &[u8; SIGNATURE_LEN]) -> PathBuf {
        self.dir.join(format!("{}.key", hex(signature)))
    }

    /// Look up the master key for `signature`. `Ok(None)` when no key file
    /// exists.
    pub fn lookup(&self, signature: &[u8; SIGNATURE_LEN]) -> Result<Option<[u8; KEY_LEN]>> {
        let path = self.key_path(signature);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if data.len() != KEY_LEN {
            return Err(EngineError::MalformedBlob {
                reason: format!(
                    "system key file {} has {} bytes, expected {KEY_LEN}",
                    path.display(),
                    data.len()
                ),
            });
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&data);
        tracing::debug!(path = %path.display(), "system unlock key found");
        Ok(Some(key))
    }

    /// Install (or replace) the master key for `signature`.
    pub fn install(&self, signature: &[u8; SIGNATURE_LEN], key: &[u8; KEY_LEN]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.key_path(signature);
        std::fs::write(&path, key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %path.display(), "installed system unlock key");
        Ok(())
    }

    /// Remove the key file for `signature`, if present.
    pub fn remove(&self, signature: &[u8; SIGNATURE_LEN]) -> Result<()> {
        let path = self.key_path(signature);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "removed system unlock key");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

//! Master and operational secrets.
//!
//! Each container is protected by two layers of key material:
//!
//! - The **master secret** unwraps exactly one thing: the operational
//!   secret envelope persisted in the container blob. It is derived from a
//!   passphrase, supplied as a raw key (key-reference credentials, system
//!   key files), or handed over by a platform key-store.
//! - The **operational secret** is what actually wraps stored items and
//!   private ACL blobs. It is generated once at container creation and
//!   survives passphrase changes unchanged — only its envelope is rewrapped.
//!
//! [`CryptoCore`] owns both and enforces the ordering invariant: an
//! operational secret never exists without a master secret, and a failed
//! unwrap never leaves partial state behind.
//!
//! The persisted envelope layout is `[kdf salt][nonce][ciphertext+tag]`.
//! The salt rides along even for raw-key masters so the envelope shape is
//! uniform and a passphrase can always be re-derived against it.

use crate::crypto::{self, KEY_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::{EngineError, Result};

/// Minimum byte length of a well-formed envelope.
pub const ENVELOPE_MIN_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// A fully derived 256-bit master key.
///
/// Constructed from a passphrase + salt, or directly from raw key bytes.
/// The debug representation never prints key material.
#[derive(Clone)]
pub struct MasterSecret {
    key: [u8; KEY_LEN],
}

impl MasterSecret {
    /// Derive a master secret from a passphrase and a KDF salt.
    pub fn derive(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> Self {
        let mut key = [0u8; KEY_LEN];
        crypto::derive_key(passphrase, salt, &mut key);
        Self { key }
    }

    /// Wrap raw key bytes as a master secret.
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub(crate) fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Constant-time comparison of two master secrets.
    pub fn matches(&self, other: &MasterSecret) -> bool {
        crypto::keys_equal(&self.key, &other.key)
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Seal an operational secret under a master secret.
///
/// Returns the persisted envelope `[salt][nonce][ciphertext+tag]`. The
/// caller picks the salt: for passphrase masters it must be the salt the
/// key was derived with, for raw-key masters any random salt will do.
pub fn seal_envelope(
    master: &MasterSecret,
    salt: &[u8; SALT_LEN],
    operational: &[u8; KEY_LEN],
) -> Result<Vec<u8>> {
    let sealed = crypto::seal(master.key(), operational)?;
    let mut envelope = Vec::with_capacity(SALT_LEN + sealed.len());
    envelope.extend_from_slice(salt);
    envelope.extend_from_slice(&sealed);
    Ok(envelope)
}

/// Attempt to open an envelope with a candidate master secret.
///
/// `Ok(None)` means the candidate is wrong; an error means the envelope is
/// structurally invalid.
pub fn open_envelope(master: &MasterSecret, envelope: &[u8]) -> Result<Option<[u8; KEY_LEN]>> {
    if envelope.len() < ENVELOPE_MIN_LEN {
        return Err(EngineError::MalformedBlob {
            reason: format!("secret envelope too short: {} bytes", envelope.len()),
        });
    }
    match crypto::open(master.key(), &envelope[SALT_LEN..])? {
        Some(plaintext) => {
            if plaintext.len() != KEY_LEN {
                return Err(EngineError::MalformedBlob {
                    reason: "operational secret has wrong width".into(),
                });
            }
            let mut operational = [0u8; KEY_LEN];
            operational.copy_from_slice(&plaintext);
            Ok(Some(operational))
        }
        None => Ok(None),
    }
}

/// Read the KDF salt carried at the front of an envelope.
pub fn envelope_salt(envelope: &[u8]) -> Result<[u8; SALT_LEN]> {
    if envelope.len() < ENVELOPE_MIN_LEN {
        return Err(EngineError::MalformedBlob {
            reason: format!("secret envelope too short: {} bytes", envelope.len()),
        });
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&envelope[..SALT_LEN]);
    Ok(salt)
}

/// Per-container cryptographic state: the master secret and, once the
/// container is unlocked, the operational secret.
#[derive(Default)]
pub struct CryptoCore {
    master: Option<MasterSecret>,
    operational: Option<[u8; KEY_LEN]>,
}

impl CryptoCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_master(&self) -> bool {
        self.master.is_some()
    }

    /// Whether an operational secret is currently held, i.e. the container
    /// is usable for item crypto.
    pub fn is_operational(&self) -> bool {
        self.operational.is_some()
    }

    pub fn master(&self) -> Option<&MasterSecret> {
        self.master.as_ref()
    }

    /// Install (or replace) the master secret. The operational secret, if
    /// any, is unaffected — passphrase changes keep it and rewrap only the
    /// envelope.
    pub fn set_master(&mut self, master: MasterSecret) {
        self.master = Some(master);
    }

    /// Generate a fresh operational secret. Requires a master secret first.
    pub fn generate_operational(&mut self) -> Result<()> {
        if self.master.is_none() {
            return Err(EngineError::Internal(
                "operational secret requires an established master secret".into(),
            ));
        }
        self.operational = Some(crypto::random_array()?);
        Ok(())
    }

    /// Install an operational secret recovered from an envelope. Requires a
    /// master secret first.
    pub(crate) fn install_operational(&mut self, operational: [u8; KEY_LEN]) -> Result<()> {
        if self.master.is_none() {
            return Err(EngineError::Internal(
                "operational secret requires an established master secret".into(),
            ));
        }
        self.operational = Some(operational);
        Ok(())
    }

    /// Attempt to recover the operational secret from `envelope` using the
    /// held master secret. `Ok(false)` on cryptographic mismatch, with no
    /// state mutated. `Ok(false)` also when no master secret is held.
    pub fn unwrap_operational(&mut self, envelope: &[u8]) -> Result<bool> {
        let Some(master) = &self.master else {
            return Ok(false);
        };
        match open_envelope(master, envelope)? {
            Some(operational) => {
                self.operational = Some(operational);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Seal the current operational secret under the current master.
    pub fn wrap_operational(&self, salt: &[u8; SALT_LEN]) -> Result<Vec<u8>> {
        let master = self.master.as_ref().ok_or_else(|| {
            EngineError::Internal("cannot wrap without a master secret".into())
        })?;
        let operational = self.operational.as_ref().ok_or_else(|| {
            EngineError::Internal("cannot wrap without an operational secret".into())
        })?;
        seal_envelope(master, salt, operational)
    }

    /// The operational secret, or an error naming the locked container.
    pub fn operational(&self, container: &str) -> Result<&[u8; KEY_LEN]> {
        self.operational.as_ref().ok_or_else(|| EngineError::Locked {
            container: container.to_string(),
        })
    }

    /// Drop all in-memory key material. Used on lock.
    pub fn invalidate(&mut self) {
        self.master = None;
        self.operational = None;
    }
}

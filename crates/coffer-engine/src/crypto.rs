//! Cryptographic primitives, built on the `ring` crate.
//!
//! - **Sealing/opening**: AES-256-GCM with a fresh random 96-bit nonce per
//!   seal. Sealed output is self-contained: `[nonce][ciphertext+tag]`.
//! - **Key derivation**: PBKDF2-HMAC-SHA256 turns a passphrase and salt into
//!   a 256-bit key.
//! - **Randomness**: all signatures, salts, and operational secrets come
//!   from `ring`'s `SystemRandom`.
//!
//! A failed [`open`] with the wrong key is reported as `Ok(None)`, not an
//! error: wrong-secret outcomes are ordinary booleans in this engine, and
//! only structural problems (truncated input, bad key length) are errors.
//!
//! # Security Notes
//!
//! - Random 96-bit nonces are collision-safe for up to ~2^32 seals under a
//!   single key, far beyond what any container performs.
//! - The PBKDF2 iteration count follows the OWASP recommendation for
//!   HMAC-SHA256.
//! - Zeroization of key material on drop is left to a future `zeroize`
//!   integration.

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{EngineError, Result};

/// AES-256 key width in bytes.
pub const KEY_LEN: usize = 32;

/// AES-256-GCM nonce width in bytes (96 bits).
pub const NONCE_LEN: usize = aead::NONCE_LEN;

/// GCM authentication tag width in bytes.
pub const TAG_LEN: usize = 16;

/// KDF salt width in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count (OWASP 2023).
const KDF_ITERATIONS: u32 = 600_000;

static KDF_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// Yields exactly one nonce, then refuses. Each bound key in this module is
/// used for a single seal or open, so a longer sequence would be a bug.
struct OneShotNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

fn aead_key(key: &[u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Result<(UnboundKey, OneShotNonce)> {
    let unbound = UnboundKey::new(AEAD_ALG, key).map_err(|_| EngineError::Crypto {
        reason: "failed to build AES-256-GCM key".into(),
    })?;
    Ok((unbound, OneShotNonce(Some(nonce))))
}

/// Seal `plaintext` under `key`, returning `[nonce][ciphertext+tag]`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let (unbound, seq) = aead_key(key, nonce)?;
    let mut sealing = SealingKey::new(unbound, seq);

    let mut buf = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(Aad::empty(), &mut buf)
        .map_err(|_| EngineError::Crypto {
            reason: "seal_in_place failed".into(),
        })?;

    let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buf);

    tracing::trace!(plaintext_len = plaintext.len(), sealed_len = out.len(), "sealed");
    Ok(out)
}

/// Open a `[nonce][ciphertext+tag]` blob produced by [`seal`].
///
/// Returns `Ok(None)` when authentication fails — wrong key or tampered
/// ciphertext. Returns an error only for structurally short input.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Option<Vec<u8>>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(EngineError::MalformedBlob {
            reason: format!("sealed payload too short: {} bytes", sealed.len()),
        });
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&sealed[..NONCE_LEN]);

    let (unbound, seq) = aead_key(key, nonce)?;
    let mut opening = OpeningKey::new(unbound, seq);

    let mut buf = sealed[NONCE_LEN..].to_vec();
    match opening.open_in_place(Aad::empty(), &mut buf) {
        Ok(plaintext) => Ok(Some(plaintext.to_vec())),
        Err(_) => Ok(None),
    }
}

/// Derive a 256-bit key from `passphrase` and `salt` via PBKDF2.
pub fn derive_key(passphrase: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    let iterations =
        std::num::NonZeroU32::new(KDF_ITERATIONS).expect("KDF_ITERATIONS is non-zero");
    pbkdf2::derive(KDF_ALG, iterations, salt, passphrase, out);
}

/// Constant-time equality for key-sized secrets.
pub fn keys_equal(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

/// Fill `buf` with CSPRNG output.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| EngineError::Crypto {
            reason: "system CSPRNG failure".into(),
        })
}

/// Generate a random array, typically a key, salt, or signature.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

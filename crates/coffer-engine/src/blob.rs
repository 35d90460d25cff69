//! Container blob codec.
//!
//! The persisted form of a container is a self-describing binary blob:
//!
//! ```text
//! [magic u32] [format u32] [signature 16B]
//! [idle timeout secs u32] [lock-on-sleep u8]
//! [public ACL: u32 length + bytes]
//! [wrapped operational-secret envelope: u32 length + bytes]
//! ```
//!
//! All integers are little-endian regardless of host byte order. Decoding
//! is strict: truncation, a bad magic, or an out-of-range format version is
//! a hard [`EngineError::MalformedBlob`]/[`EngineError::UnsupportedVersion`]
//! — structural damage is never coerced into an authentication failure.
//!
//! Format history: version 1 blobs predate partition lists; version 2 (the
//! current form) is identical on the wire but subjects its containers to
//! the partition membership check. Old versions stay readable forever;
//! re-encoding always writes the current version.

use std::time::Duration;

use crate::error::{EngineError, Result};

/// Width of a container signature in bytes.
pub const SIGNATURE_LEN: usize = 16;

/// `b"cfr1"` little-endian.
pub const CONTAINER_MAGIC: u32 = 0x3172_6663;

/// Oldest format version this build still reads.
pub const FORMAT_MIN: u32 = 1;

/// Format version written by this build. Containers at or above
/// [`FORMAT_PARTITIONED`] are subject to the partition membership check.
pub const FORMAT_CURRENT: u32 = 2;

/// First format version that carries partition semantics.
pub const FORMAT_PARTITIONED: u32 = 2;

/// Persisted per-container parameters.
///
/// Captured into [`crate::container::ContainerCommon`] on first unlock and
/// sticky from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerParams {
    /// How long the container stays unlocked without activity. Zero
    /// disables idle locking.
    pub idle_timeout: Duration,

    /// Whether a sleep-triggered lock-all should lock this container.
    pub lock_on_sleep: bool,
}

impl Default for ContainerParams {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            lock_on_sleep: true,
        }
    }
}

/// Decoded form of a persisted container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBlob {
    pub format: u32,
    pub signature: [u8; SIGNATURE_LEN],
    pub params: ContainerParams,
    /// Encoded ACL entries, stored in the clear.
    pub public_acl: Vec<u8>,
    /// Wrapped operational-secret envelope (`[salt][nonce][ct+tag]`).
    pub sealed_secret: Vec<u8>,
}

impl ContainerBlob {
    /// Serialize to the persisted byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + 4 + SIGNATURE_LEN + 5 + 8 + self.public_acl.len() + self.sealed_secret.len(),
        );
        put_u32(&mut out, CONTAINER_MAGIC);
        put_u32(&mut out, self.format);
        out.extend_from_slice(&self.signature);
        let secs = self.params.idle_timeout.as_secs().min(u64::from(u32::MAX)) as u32;
        put_u32(&mut out, secs);
        out.push(u8::from(self.params.lock_on_sleep));
        put_bytes(&mut out, &self.public_acl);
        put_bytes(&mut out, &self.sealed_secret);
        out
    }

    /// Parse a persisted blob, validating structure and version.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);

        let magic = r.u32("container magic")?;
        if magic != CONTAINER_MAGIC {
            return Err(EngineError::MalformedBlob {
                reason: format!("bad container magic {magic:#010x}"),
            });
        }

        let format = r.u32("container format")?;
        if !(FORMAT_MIN..=FORMAT_CURRENT).contains(&format) {
            return Err(EngineError::UnsupportedVersion { found: format });
        }

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(r.take(SIGNATURE_LEN, "container signature")?);

        let idle_secs = r.u32("idle timeout")?;
        let lock_on_sleep = match r.u8("lock-on-sleep flag")? {
            0 => false,
            1 => true,
            other => {
                return Err(EngineError::MalformedBlob {
                    reason: format!("lock-on-sleep flag out of range: {other}"),
                });
            }
        };

        let public_acl = r.bytes("public ACL")?.to_vec();
        let sealed_secret = r.bytes("secret envelope")?.to_vec();

        if !r.is_empty() {
            return Err(EngineError::MalformedBlob {
                reason: format!("{} trailing bytes after container blob", r.remaining()),
            });
        }

        Ok(Self {
            format,
            signature,
            params: ContainerParams {
                idle_timeout: Duration::from_secs(u64::from(idle_secs)),
                lock_on_sleep,
            },
            public_acl,
            sealed_secret,
        })
    }
}

// ---------------------------------------------------------------------------
// Byte plumbing shared by the blob, key, and ACL codecs
// ---------------------------------------------------------------------------

/// Strict little-endian cursor. Every read names the field it was after so
/// truncation errors say what was missing.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(EngineError::MalformedBlob {
                reason: format!("truncated reading {field}: need {n}, have {}", self.remaining()),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    pub(crate) fn u16(&mut self, field: &str) -> Result<u16> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, field: &str) -> Result<u32> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A u32-length-prefixed byte run.
    pub(crate) fn bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.u32(field)? as usize;
        self.take(len, field)
    }

    /// A u16-length-prefixed UTF-8 string.
    pub(crate) fn string(&mut self, field: &str) -> Result<String> {
        let len = self.u16(field)? as usize;
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| EngineError::MalformedBlob {
            reason: format!("{field} is not valid UTF-8"),
        })
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Write a u32-length-prefixed byte run.
pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

/// Write a u16-length-prefixed UTF-8 string.
pub(crate) fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

//! Per-key blob codec: encode, decode, recode.
//!
//! A key's persisted form carries its classification header, a cleartext
//! public ACL, a protected private ACL, and the key material itself:
//!
//! ```text
//! [magic u32] [version u32]
//! [class u8] [usage u32] [clear u8]
//! [public ACL: u32 length + bytes]
//! [private ACL: u32 length + bytes]      (wrapped unless clear)
//! [key material: u32 length + bytes]     (wrapped unless clear)
//! ```
//!
//! A public asymmetric key without encrypt usage has nothing worth hiding,
//! so it skips secret-dependent wrapping entirely and is stored in the
//! clear — decodable from a locked container. Everything else wraps under
//! the owning container's operational secret, which requires the container
//! to be unlocked on both encode and decode.
//!
//! **Recoding** re-encodes a foreign key for a different container while
//! preserving the plaintext material, the ACL content, and the
//! clear/wrapped classification bit. It demands that the target container
//! has declared the foreign key's container as its in-progress migration
//! source, and it takes the two containers' state mutexes in canonical
//! identity order so mirrored recodes on other threads cannot
//! cross-deadlock.

use std::sync::Arc;

use bitflags::bitflags;

use crate::blob::{ByteReader, put_bytes, put_u32};
use crate::container::ContainerCommon;
use crate::crypto;
use crate::error::{EngineError, Result};

/// `b"cky1"` little-endian.
pub const KEY_MAGIC: u32 = 0x3179_6b63;

/// Key blob format version written by this build.
pub const KEY_FORMAT: u32 = 1;

/// Cryptographic class of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Symmetric,
    Public,
    Private,
}

impl KeyClass {
    fn to_wire(self) -> u8 {
        match self {
            Self::Symmetric => 1,
            Self::Public => 2,
            Self::Private => 3,
        }
    }

    fn from_wire(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Symmetric),
            2 => Ok(Self::Public),
            3 => Ok(Self::Private),
            other => Err(EngineError::MalformedBlob {
                reason: format!("unknown key class {other}"),
            }),
        }
    }
}

bitflags! {
    /// Declared usages of a stored key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyUsage: u32 {
        const ENCRYPT = 1 << 0;
        const DECRYPT = 1 << 1;
        const SIGN = 1 << 2;
        const VERIFY = 1 << 3;
        const WRAP = 1 << 4;
        const DERIVE = 1 << 5;
    }
}

/// A key as the caller sees it: classification plus raw material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub class: KeyClass,
    pub usage: KeyUsage,
    pub material: Vec<u8>,
}

impl KeySpec {
    /// Whether this key is persisted without secret-dependent wrapping.
    fn stores_clear(&self) -> bool {
        self.class == KeyClass::Public && !self.usage.contains(KeyUsage::ENCRYPT)
    }
}

/// A fully decoded key blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub spec: KeySpec,
    pub public_acl: Vec<u8>,
    pub private_acl: Vec<u8>,
    /// The persisted classification bit: whether the blob was stored in
    /// the clear.
    pub stored_clear: bool,
}

/// Encode a key for `container`.
///
/// Wrapped keys require the container to be unlocked; the wrap happens
/// under its state mutex.
pub fn encode(
    container: &Arc<ContainerCommon>,
    spec: &KeySpec,
    public_acl: &[u8],
    private_acl: &[u8],
) -> Result<Vec<u8>> {
    let clear = spec.stores_clear();
    let (private_acl_out, material_out) = if clear {
        (private_acl.to_vec(), spec.material.clone())
    } else {
        container.with_operational(|key| {
            Ok((
                crypto::seal(key, private_acl)?,
                crypto::seal(key, &spec.material)?,
            ))
        })?
    };

    let mut out = Vec::new();
    put_u32(&mut out, KEY_MAGIC);
    put_u32(&mut out, KEY_FORMAT);
    out.push(spec.class.to_wire());
    put_u32(&mut out, spec.usage.bits());
    out.push(u8::from(clear));
    put_bytes(&mut out, public_acl);
    put_bytes(&mut out, &private_acl_out);
    put_bytes(&mut out, &material_out);

    tracing::trace!(container = %container.identity(), clear, "key encoded");
    Ok(out)
}

/// Decode a key blob owned by `container`.
///
/// Wrapped blobs require the container to be unlocked. A wrap that fails to
/// open under the container's operational secret is an authorization
/// failure, indistinguishable from any other denial.
pub fn decode(container: &Arc<ContainerCommon>, blob: &[u8]) -> Result<DecodedKey> {
    let parsed = parse(blob)?;
    if parsed.clear {
        return Ok(DecodedKey {
            spec: KeySpec {
                class: parsed.class,
                usage: parsed.usage,
                material: parsed.material,
            },
            public_acl: parsed.public_acl,
            private_acl: parsed.private_acl,
            stored_clear: true,
        });
    }

    let (private_acl, material) = container.with_operational(|key| {
        let private_acl = crypto::open(key, &parsed.private_acl)?.ok_or(EngineError::AuthDenied)?;
        let material = crypto::open(key, &parsed.material)?.ok_or(EngineError::AuthDenied)?;
        Ok((private_acl, material))
    })?;

    Ok(DecodedKey {
        spec: KeySpec {
            class: parsed.class,
            usage: parsed.usage,
            material,
        },
        public_acl: parsed.public_acl,
        private_acl,
        stored_clear: false,
    })
}

/// Re-encode a foreign key under `target`'s secrets.
///
/// `blob` must belong to `source`, and `target` must have declared `source`
/// as its in-progress migration origin — a foreign key from anywhere else
/// is refused. The plaintext material, both ACL blobs, and the
/// clear/wrapped classification are preserved.
pub fn recode(
    source: &Arc<ContainerCommon>,
    target: &Arc<ContainerCommon>,
    blob: &[u8],
) -> Result<Vec<u8>> {
    if source.identity() == target.identity() {
        return Err(EngineError::AuthDenied);
    }
    if target.migration_source().as_ref() != Some(source.identity()) {
        tracing::debug!(
            source = %source.identity(),
            target = %target.identity(),
            "recode refused: source is not the declared migration origin"
        );
        return Err(EngineError::AuthDenied);
    }

    let parsed = parse(blob)?;

    // Canonical identity order, so a mirrored recode on another thread
    // acquires the same two mutexes in the same order.
    let source_first = source.identity() < target.identity();
    let (first, second) = if source_first {
        (source, target)
    } else {
        (target, source)
    };
    let guard_first = first.state();
    let guard_second = second.state();
    let (src, tgt) = if source_first {
        (&guard_first, &guard_second)
    } else {
        (&guard_second, &guard_first)
    };

    let (private_acl_out, material_out) = if parsed.clear {
        (parsed.private_acl.clone(), parsed.material.clone())
    } else {
        let src_key = src.core.operational(&source.identity().name)?;
        let tgt_key = tgt.core.operational(&target.identity().name)?;

        let private_acl = crypto::open(src_key, &parsed.private_acl)?
            .ok_or(EngineError::AuthDenied)?;
        let material = crypto::open(src_key, &parsed.material)?.ok_or(EngineError::AuthDenied)?;

        (crypto::seal(tgt_key, &private_acl)?, crypto::seal(tgt_key, &material)?)
    };

    let mut out = Vec::new();
    put_u32(&mut out, KEY_MAGIC);
    put_u32(&mut out, KEY_FORMAT);
    out.push(parsed.class.to_wire());
    put_u32(&mut out, parsed.usage.bits());
    out.push(u8::from(parsed.clear));
    put_bytes(&mut out, &parsed.public_acl);
    put_bytes(&mut out, &private_acl_out);
    put_bytes(&mut out, &material_out);

    tracing::info!(
        source = %source.identity(),
        target = %target.identity(),
        clear = parsed.clear,
        "key recoded"
    );
    Ok(out)
}

struct ParsedKeyBlob {
    class: KeyClass,
    usage: KeyUsage,
    clear: bool,
    public_acl: Vec<u8>,
    private_acl: Vec<u8>,
    material: Vec<u8>,
}

fn parse(blob: &[u8]) -> Result<ParsedKeyBlob> {
    let mut r = ByteReader::new(blob);

    let magic = r.u32("key magic")?;
    if magic != KEY_MAGIC {
        return Err(EngineError::MalformedBlob {
            reason: format!("bad key magic {magic:#010x}"),
        });
    }
    let format = r.u32("key format")?;
    if format != KEY_FORMAT {
        return Err(EngineError::UnsupportedVersion { found: format });
    }

    let class = KeyClass::from_wire(r.u8("key class")?)?;
    let usage_bits = r.u32("key usage")?;
    let usage = KeyUsage::from_bits(usage_bits).ok_or_else(|| EngineError::MalformedBlob {
        reason: format!("unknown key usage bits {usage_bits:#010x}"),
    })?;
    let clear = match r.u8("clear flag")? {
        0 => false,
        1 => true,
        other => {
            return Err(EngineError::MalformedBlob {
                reason: format!("clear flag out of range: {other}"),
            });
        }
    };

    let public_acl = r.bytes("public ACL")?.to_vec();
    let private_acl = r.bytes("private ACL")?.to_vec();
    let material = r.bytes("key material")?.to_vec();

    if !r.is_empty() {
        return Err(EngineError::MalformedBlob {
            reason: format!("{} trailing bytes after key blob", r.remaining()),
        });
    }

    Ok(ParsedKeyBlob {
        class,
        usage,
        clear,
        public_acl,
        private_acl,
        material,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::container::TrustDomain;
    use crate::handle::ContainerHandle;
    use crate::registry::ContainerRegistry;

    fn unlocked_container(name: &str) -> (Arc<ContainerRegistry>, Arc<ContainerCommon>) {
        let registry = ContainerRegistry::new(EngineConfig::default());
        let handle =
            ContainerHandle::create(&registry, name, TrustDomain::User, b"pw", "apps:test")
                .unwrap();
        let common = Arc::clone(handle.common());
        (registry, common)
    }

    fn symmetric_key() -> KeySpec {
        KeySpec {
            class: KeyClass::Symmetric,
            usage: KeyUsage::ENCRYPT | KeyUsage::DECRYPT,
            material: vec![0x42; 32],
        }
    }

    #[test]
    fn wrapped_roundtrip() {
        let (_registry, container) = unlocked_container("a");
        let spec = symmetric_key();

        let blob = encode(&container, &spec, b"public-acl", b"private-acl").unwrap();
        let decoded = decode(&container, &blob).unwrap();

        assert_eq!(decoded.spec, spec);
        assert_eq!(decoded.public_acl, b"public-acl");
        assert_eq!(decoded.private_acl, b"private-acl");
        assert!(!decoded.stored_clear);
    }

    #[test]
    fn public_key_without_encrypt_usage_stores_clear() {
        let (_registry, container) = unlocked_container("a");
        let spec = KeySpec {
            class: KeyClass::Public,
            usage: KeyUsage::VERIFY,
            material: vec![7; 64],
        };

        let blob = encode(&container, &spec, b"pub", b"priv").unwrap();

        // Decodable even while the container is locked.
        container.lock();
        let decoded = decode(&container, &blob).unwrap();
        assert!(decoded.stored_clear);
        assert_eq!(decoded.spec.material, spec.material);
    }

    #[test]
    fn public_key_with_encrypt_usage_is_wrapped() {
        let (_registry, container) = unlocked_container("a");
        let spec = KeySpec {
            class: KeyClass::Public,
            usage: KeyUsage::ENCRYPT,
            material: vec![7; 64],
        };

        let blob = encode(&container, &spec, b"pub", b"priv").unwrap();
        container.lock();
        assert!(matches!(
            decode(&container, &blob),
            Err(EngineError::Locked { .. })
        ));
    }

    #[test]
    fn encode_wrapped_requires_unlock() {
        let (_registry, container) = unlocked_container("a");
        container.lock();
        assert!(matches!(
            encode(&container, &symmetric_key(), b"", b""),
            Err(EngineError::Locked { .. })
        ));
    }

    #[test]
    fn decode_under_wrong_container_is_denied() {
        let (_ra, a) = unlocked_container("a");
        let (_rb, b) = unlocked_container("b");

        let blob = encode(&a, &symmetric_key(), b"pub", b"priv").unwrap();
        assert!(matches!(decode(&b, &blob), Err(EngineError::AuthDenied)));
    }

    #[test]
    fn recode_requires_declared_migration_source() {
        let (_ra, a) = unlocked_container("a");
        let (_rb, b) = unlocked_container("b");
        let blob = encode(&a, &symmetric_key(), b"pub", b"priv").unwrap();

        // No declaration: refused.
        assert!(matches!(recode(&a, &b, &blob), Err(EngineError::AuthDenied)));

        // Declaring a different source: still refused.
        let (_rc, c) = unlocked_container("c");
        b.begin_migration(c.identity().clone());
        assert!(matches!(recode(&a, &b, &blob), Err(EngineError::AuthDenied)));

        // Correct declaration: the recoded key decodes under the target.
        b.begin_migration(a.identity().clone());
        let recoded = recode(&a, &b, &blob).unwrap();
        let decoded = decode(&b, &recoded).unwrap();
        assert_eq!(decoded.spec, symmetric_key());
        assert_eq!(decoded.private_acl, b"priv");

        // And no longer decodes under the source.
        assert!(matches!(decode(&a, &recoded), Err(EngineError::AuthDenied)));
    }

    #[test]
    fn recode_preserves_clear_classification() {
        let (_ra, a) = unlocked_container("a");
        let (_rb, b) = unlocked_container("b");
        b.begin_migration(a.identity().clone());

        let spec = KeySpec {
            class: KeyClass::Public,
            usage: KeyUsage::VERIFY,
            material: vec![9; 48],
        };
        let blob = encode(&a, &spec, b"pub", b"priv").unwrap();
        let recoded = recode(&a, &b, &blob).unwrap();

        let decoded = decode(&b, &recoded).unwrap();
        assert!(decoded.stored_clear);
        assert_eq!(decoded.spec.material, spec.material);
    }

    #[test]
    fn truncated_key_blob_is_structural() {
        let (_registry, container) = unlocked_container("a");
        let blob = encode(&container, &symmetric_key(), b"pub", b"priv").unwrap();
        assert!(matches!(
            decode(&container, &blob[..blob.len() - 3]),
            Err(EngineError::MalformedBlob { .. })
        ));
    }
}

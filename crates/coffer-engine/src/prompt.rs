//! The interactive prompt subject.
//!
//! This is the trust gate most users actually see: "application X wants to
//! use item Y". Its persisted form has two generations:
//!
//! - **legacy** (binary version 1): just the description string;
//! - **current** (binary version 2): a selector — a version word plus flag
//!   bits — followed by the description.
//!
//! Legacy encodings remain readable indefinitely and are rewritten in the
//! current form on the next encode. A selector whose *own* version word is
//! unknown is a hard parse error: flags we cannot interpret gate security
//! decisions, so guessing is not an option.
//!
//! Validation order is deliberate. The caller's signature status is checked
//! against the selector flags *before* any question is posed: an unsigned
//! caller without [`PromptFlags::ALLOW_UNSIGNED`] (or a broken one without
//! [`PromptFlags::ALLOW_INVALID`]) is denied silently, and the agent never
//! hears about it. Only then does the question go out — under the UI mutex,
//! never the state mutex, bounded by the configured deadline, and abandoned
//! if the container locks while it is pending.

use std::sync::Arc;

use bitflags::bitflags;

use crate::agent::{Caller, InteractiveAgent, PromptReply, SignatureStatus, call_with_deadline};
use crate::blob::ByteReader;
use crate::config::EngineConfig;
use crate::container::{ContainerCommon, TrustDomain};
use crate::error::{EngineError, Result};

bitflags! {
    /// Selector flag bits of a prompt subject.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PromptFlags: u32 {
        /// Callers with no signature at all may still be prompted.
        const ALLOW_UNSIGNED = 1 << 0;
        /// Callers with a broken or unverifiable signature may still be
        /// prompted.
        const ALLOW_INVALID = 1 << 1;
        /// Every approval requires the container passphrase to be re-entered.
        const REQUIRE_PASSPHRASE = 1 << 2;
    }
}

/// Selector version understood by this build.
pub const SELECTOR_VERSION: u32 = 1;

/// Prompt subject binary versions.
const BINVER_LEGACY: u8 = 1;
const BINVER_CURRENT: u8 = 2;

/// The selector: versioned flag word steering prompt behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptSelector {
    pub version: u32,
    pub flags: PromptFlags,
}

impl Default for PromptSelector {
    fn default() -> Self {
        Self {
            version: SELECTOR_VERSION,
            flags: PromptFlags::empty(),
        }
    }
}

/// Interactive trust-gate subject.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSubject {
    pub selector: PromptSelector,
    /// Human-readable description shown in the prompt.
    pub description: String,
    /// Runtime diagnostic counter; not persisted.
    pub attempts: u32,
}

impl PromptSubject {
    pub fn new(description: &str) -> Self {
        Self {
            selector: PromptSelector::default(),
            description: description.to_string(),
            attempts: 0,
        }
    }

    /// Serialize in the current binary form (version byte included).
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(BINVER_CURRENT);
        crate::blob::put_u32(out, self.selector.version);
        crate::blob::put_u32(out, self.selector.flags.bits());
        crate::blob::put_string(out, &self.description);
    }

    /// Parse either binary generation (version byte first).
    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let binver = r.u8("prompt subject version")?;
        match binver {
            BINVER_LEGACY => {
                let description = r.string("prompt description")?;
                Ok(Self {
                    selector: PromptSelector::default(),
                    description,
                    attempts: 0,
                })
            }
            BINVER_CURRENT => {
                let version = r.u32("prompt selector version")?;
                if version != SELECTOR_VERSION {
                    return Err(EngineError::UnsupportedVersion { found: version });
                }
                let bits = r.u32("prompt selector flags")?;
                let flags =
                    PromptFlags::from_bits(bits).ok_or_else(|| EngineError::MalformedBlob {
                        reason: format!("unknown prompt flags {bits:#010x}"),
                    })?;
                let description = r.string("prompt description")?;
                Ok(Self {
                    selector: PromptSelector { version, flags },
                    description,
                    attempts: 0,
                })
            }
            other => Err(EngineError::UnsupportedVersion {
                found: u32::from(other),
            }),
        }
    }
}

/// What the prompt decided.
#[derive(Debug, Default)]
pub(crate) struct PromptVerdict {
    pub allowed: bool,
    /// Present when the user chose "remember" and the caller's signature
    /// was valid: the signing identity to clone into the enclosing
    /// threshold.
    pub remember_identity: Option<Vec<u8>>,
}

impl PromptVerdict {
    fn denied() -> Self {
        Self::default()
    }
}

pub(crate) struct PromptContext<'a> {
    pub container: &'a str,
    pub domain: TrustDomain,
    pub reason: &'a str,
}

/// Whether this session recently authorized a privileged system-container
/// edit.
///
/// Always false: there is no session-level right tracking, so the
/// confirmation prompt runs for every privileged edit.
pub fn has_authorized_for_system_keychain() -> bool {
    false
}

/// Run the full prompt decision for one subject snapshot.
///
/// Never called with an engine lock held; takes the UI mutex itself for the
/// duration of the question. `epoch0` is the container's lock epoch when
/// the request began — if it moves while the question is pending, the
/// prompt is abandoned and the verdict is a denial.
pub(crate) fn evaluate(
    subject: &PromptSubject,
    ctx: &PromptContext<'_>,
    caller: &Caller,
    agent: &Arc<dyn InteractiveAgent>,
    config: &EngineConfig,
    container: &ContainerCommon,
    epoch0: u64,
) -> PromptVerdict {
    let status = caller.oracle().code_signature();
    let flags = subject.selector.flags;

    // Signature gating comes first; a gated caller is denied silently and
    // the agent is never consulted.
    match status {
        SignatureStatus::Valid => {}
        SignatureStatus::Unsigned => {
            if !flags.contains(PromptFlags::ALLOW_UNSIGNED) {
                tracing::debug!(container = ctx.container, "unsigned caller denied without prompt");
                return PromptVerdict::denied();
            }
        }
        SignatureStatus::Broken | SignatureStatus::NotFound => {
            if !flags.contains(PromptFlags::ALLOW_INVALID) {
                tracing::debug!(
                    container = ctx.container,
                    ?status,
                    "caller with invalid signature denied without prompt"
                );
                return PromptVerdict::denied();
            }
        }
    }

    let require_passphrase = flags.contains(PromptFlags::REQUIRE_PASSPHRASE)
        || caller.oracle().force_passphrase_prompt();

    let reply = {
        let _ui = container.ui_lock();
        let cancelled = || container.lock_epoch() != epoch0;
        let name = ctx.container.to_string();
        let reason = ctx.reason.to_string();

        if ctx.domain == TrustDomain::System && !has_authorized_for_system_keychain() {
            call_with_deadline(agent, config.prompt_deadline(), &cancelled, move |a| {
                a.confirm_system_edit(&name, &reason)
            })
        } else {
            call_with_deadline(agent, config.prompt_deadline(), &cancelled, move |a| {
                a.prompt_use(&name, &reason, require_passphrase)
            })
        }
    };

    match reply {
        Some(PromptReply::Allow { remember }) => PromptVerdict {
            allowed: true,
            remember_identity: if remember && status == SignatureStatus::Valid {
                caller.oracle().signing_identity()
            } else {
                None
            },
        },
        Some(PromptReply::Deny) => {
            tracing::debug!(container = ctx.container, "user declined prompt");
            PromptVerdict::denied()
        }
        Some(PromptReply::Error(err)) => {
            tracing::warn!(container = ctx.container, error = %err, "agent failed to prompt");
            PromptVerdict::denied()
        }
        None => PromptVerdict::denied(),
    }
}

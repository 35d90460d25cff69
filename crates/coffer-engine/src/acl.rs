//! ACL model and evaluation engine.
//!
//! A container's ACL is an ordered list of entries, each pairing a set of
//! authorized operations with a *subject* — the predicate a caller must
//! satisfy. The subject set is closed, so it is a plain enum with
//! exhaustive matching: what never matches ([`AclSubject::Comment`],
//! [`AclSubject::Partition`]) and what may mutate the ACL as a side effect
//! ([`AclSubject::Prompt`]) is visible in the type rather than buried in
//! dispatch conventions.
//!
//! Evaluation is two-phase. Phase one runs under the container's state
//! mutex (taken before the caller-process lock, always in that order) and
//! decides everything that needs no human: simple predicates, thresholds,
//! the migration-capability bypass, and the partition membership check.
//! Phase two — only when a prompt subject could still tip the outcome and
//! the request permits UI — runs with the state mutex *released*, under the
//! UI mutex, and re-validates the container's lock epoch afterwards before
//! applying any side effect.
//!
//! Side effects that piggy-back on a successful validation (installing a
//! missing partition list, cloning a remembered caller into the ACL) never
//! fail the primary operation; they surface through
//! [`AclValidation::stale_acl`] so the caller knows its cached ACL is out
//! of date.

use std::sync::Arc;

use bitflags::bitflags;
use chrono::Utc;

use crate::agent::{Caller, Capability, InteractiveAgent};
use crate::blob::{ByteReader, FORMAT_PARTITIONED, put_bytes, put_string, put_u32};
use crate::config::EngineConfig;
use crate::container::{CommonState, ContainerCommon};
use crate::crypto::{KEY_LEN, SALT_LEN};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::handle::{Credentials, CredentialSample};
use crate::partition::PartitionSubject;
use crate::prompt::{self, PromptContext, PromptSubject};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// An operation a caller may request against a container or key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclOp {
    Decrypt,
    Encrypt,
    Sign,
    Derive,
    ExportClear,
    ExportWrapped,
    ChangeAcl,
    /// Authorization tag used by the partition-extension prompt.
    PartitionId,
}

impl AclOp {
    fn bit(self) -> u32 {
        match self {
            Self::Decrypt => 1 << 0,
            Self::Encrypt => 1 << 1,
            Self::Sign => 1 << 2,
            Self::Derive => 1 << 3,
            Self::ExportClear => 1 << 4,
            Self::ExportWrapped => 1 << 5,
            Self::ChangeAcl => 1 << 6,
            Self::PartitionId => 1 << 7,
        }
    }

    /// Short human description used in prompt reason strings.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Decrypt => "decrypt an item",
            Self::Encrypt => "encrypt an item",
            Self::Sign => "sign with a key",
            Self::Derive => "derive from a key",
            Self::ExportClear => "export a key in the clear",
            Self::ExportWrapped => "export a wrapped key",
            Self::ChangeAcl => "change access rules",
            Self::PartitionId => "share with another application group",
        }
    }
}

bitflags! {
    /// Set of operations an ACL entry authorizes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AclOpSet: u32 {
        const DECRYPT = 1 << 0;
        const ENCRYPT = 1 << 1;
        const SIGN = 1 << 2;
        const DERIVE = 1 << 3;
        const EXPORT_CLEAR = 1 << 4;
        const EXPORT_WRAPPED = 1 << 5;
        const CHANGE_ACL = 1 << 6;
        const PARTITION_ID = 1 << 7;
    }
}

impl AclOpSet {
    pub fn allows(self, op: AclOp) -> bool {
        self.bits() & op.bit() != 0
    }
}

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Passphrase predicate: a PBKDF2 verifier over a per-subject salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordSubject {
    pub salt: [u8; SALT_LEN],
    pub verifier: [u8; KEY_LEN],
}

impl PasswordSubject {
    pub fn from_passphrase(passphrase: &[u8]) -> Result<Self> {
        let salt = crate::crypto::random_array()?;
        let mut verifier = [0u8; KEY_LEN];
        crate::crypto::derive_key(passphrase, &salt, &mut verifier);
        Ok(Self { salt, verifier })
    }

    pub fn matches(&self, passphrase: &[u8]) -> bool {
        let mut candidate = [0u8; KEY_LEN];
        crate::crypto::derive_key(passphrase, &self.salt, &mut candidate);
        crate::crypto::keys_equal(&candidate, &self.verifier)
    }
}

/// N-of-M composite subject.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSubject {
    pub required: u32,
    pub subjects: Vec<AclSubject>,
}

/// Matches a specific requesting user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSubject {
    pub uid: u32,
}

/// Matches a validly signed caller with a specific signing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSignatureSubject {
    pub requirement: Vec<u8>,
}

/// The closed set of ACL subjects.
#[derive(Debug, Clone, PartialEq)]
pub enum AclSubject {
    /// Unconditional allow.
    Any,
    Password(PasswordSubject),
    Threshold(ThresholdSubject),
    Process(ProcessSubject),
    CodeSignature(CodeSignatureSubject),
    /// Annotation; never matches.
    Comment(Vec<u8>),
    /// Reference to a pre-authorization slot.
    PreAuth(u32),
    /// Interactive trust gate; may mutate the ACL as a side effect.
    Prompt(PromptSubject),
    /// Partition co-ownership payload; never matches directly.
    Partition(PartitionSubject),
}

/// One authorization rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AclEntry {
    pub tag: String,
    pub ops: AclOpSet,
    pub subject: AclSubject,
}

// ---------------------------------------------------------------------------
// The ACL itself
// ---------------------------------------------------------------------------

/// Decoded, live ACL for one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acl {
    pub entries: Vec<AclEntry>,
    changed: bool,
}

/// Lazy instantiation state kept inside the container's guarded state.
pub(crate) enum AclState {
    Uninstantiated,
    Instantiated(Acl),
}

impl Acl {
    pub fn new(entries: Vec<AclEntry>) -> Self {
        Self {
            entries,
            changed: false,
        }
    }

    /// The ACL a freshly created container gets: one prompt-gated entry
    /// covering every operation, plus a partition list holding the
    /// creator's identifier.
    pub fn standard(description: &str, creator_partition: &str) -> Self {
        Self {
            entries: vec![
                AclEntry {
                    tag: "default".into(),
                    ops: AclOpSet::all(),
                    subject: AclSubject::Threshold(ThresholdSubject {
                        required: 1,
                        subjects: vec![AclSubject::Prompt(PromptSubject::new(description))],
                    }),
                },
                AclEntry {
                    tag: "_partition".into(),
                    ops: AclOpSet::empty(),
                    subject: AclSubject::Partition(PartitionSubject {
                        partitions: vec![creator_partition.to_string()],
                    }),
                },
            ],
            changed: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub(crate) fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// The container's partition list, if any. At most one exists.
    pub fn partition(&self) -> Option<&PartitionSubject> {
        self.entries.iter().find_map(|e| match &e.subject {
            AclSubject::Partition(p) => Some(p),
            _ => None,
        })
    }

    pub(crate) fn partition_mut(&mut self) -> Option<&mut PartitionSubject> {
        self.entries.iter_mut().find_map(|e| match &mut e.subject {
            AclSubject::Partition(p) => Some(p),
            _ => None,
        })
    }

    /// Append a partition entry holding `partitions`. Replaces nothing: the
    /// caller must have checked no partition entry exists yet.
    pub(crate) fn install_partition(&mut self, partitions: Vec<String>) {
        self.entries.push(AclEntry {
            tag: "_partition".into(),
            ops: AclOpSet::empty(),
            subject: AclSubject::Partition(PartitionSubject { partitions }),
        });
    }

    // -- Codec --------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.entries.len() as u32);
        for entry in &self.entries {
            put_string(&mut out, &entry.tag);
            put_u32(&mut out, entry.ops.bits());
            encode_subject(&entry.subject, &mut out);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let count = r.u32("ACL entry count")? as usize;
        let mut entries = Vec::with_capacity(count);
        let mut partition_seen = false;
        for _ in 0..count {
            let tag = r.string("ACL entry tag")?;
            let bits = r.u32("ACL entry operations")?;
            let ops = AclOpSet::from_bits(bits).ok_or_else(|| EngineError::MalformedBlob {
                reason: format!("unknown operation bits {bits:#010x}"),
            })?;
            let subject = decode_subject(&mut r)?;
            if matches!(subject, AclSubject::Partition(_)) {
                if partition_seen {
                    return Err(EngineError::MalformedBlob {
                        reason: "more than one partition entry".into(),
                    });
                }
                partition_seen = true;
            }
            entries.push(AclEntry { tag, ops, subject });
        }
        if !r.is_empty() {
            return Err(EngineError::MalformedBlob {
                reason: format!("{} trailing bytes after ACL", r.remaining()),
            });
        }
        Ok(Self {
            entries,
            changed: false,
        })
    }
}

// Subject wire tags.
const TAG_ANY: u8 = 1;
const TAG_PASSWORD: u8 = 2;
const TAG_THRESHOLD: u8 = 3;
const TAG_PROCESS: u8 = 4;
const TAG_CODE_SIGNATURE: u8 = 5;
const TAG_COMMENT: u8 = 6;
const TAG_PREAUTH: u8 = 7;
const TAG_PROMPT: u8 = 8;
const TAG_PARTITION: u8 = 9;

/// Binary version written for every subject except the prompt subject,
/// which has its own history (see [`prompt`]).
const SUBJECT_VERSION: u8 = 1;

fn encode_subject(subject: &AclSubject, out: &mut Vec<u8>) {
    match subject {
        AclSubject::Any => {
            out.push(TAG_ANY);
            out.push(SUBJECT_VERSION);
        }
        AclSubject::Password(p) => {
            out.push(TAG_PASSWORD);
            out.push(SUBJECT_VERSION);
            out.extend_from_slice(&p.salt);
            out.extend_from_slice(&p.verifier);
        }
        AclSubject::Threshold(t) => {
            out.push(TAG_THRESHOLD);
            out.push(SUBJECT_VERSION);
            put_u32(out, t.required);
            put_u32(out, t.subjects.len() as u32);
            for child in &t.subjects {
                encode_subject(child, out);
            }
        }
        AclSubject::Process(p) => {
            out.push(TAG_PROCESS);
            out.push(SUBJECT_VERSION);
            put_u32(out, p.uid);
        }
        AclSubject::CodeSignature(cs) => {
            out.push(TAG_CODE_SIGNATURE);
            out.push(SUBJECT_VERSION);
            put_bytes(out, &cs.requirement);
        }
        AclSubject::Comment(bytes) => {
            out.push(TAG_COMMENT);
            out.push(SUBJECT_VERSION);
            put_bytes(out, bytes);
        }
        AclSubject::PreAuth(slot) => {
            out.push(TAG_PREAUTH);
            out.push(SUBJECT_VERSION);
            put_u32(out, *slot);
        }
        AclSubject::Prompt(p) => {
            out.push(TAG_PROMPT);
            p.encode_into(out);
        }
        AclSubject::Partition(p) => {
            out.push(TAG_PARTITION);
            out.push(SUBJECT_VERSION);
            p.encode_into(out);
        }
    }
}

fn decode_subject(r: &mut ByteReader<'_>) -> Result<AclSubject> {
    let tag = r.u8("subject tag")?;
    if tag == TAG_PROMPT {
        // The prompt subject owns its binary versioning (legacy + current).
        return Ok(AclSubject::Prompt(PromptSubject::decode(r)?));
    }

    let version = r.u8("subject version")?;
    if version != SUBJECT_VERSION {
        return Err(EngineError::UnsupportedVersion {
            found: u32::from(version),
        });
    }

    match tag {
        TAG_ANY => Ok(AclSubject::Any),
        TAG_PASSWORD => {
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(r.take(SALT_LEN, "password salt")?);
            let mut verifier = [0u8; KEY_LEN];
            verifier.copy_from_slice(r.take(KEY_LEN, "password verifier")?);
            Ok(AclSubject::Password(PasswordSubject { salt, verifier }))
        }
        TAG_THRESHOLD => {
            let required = r.u32("threshold requirement")?;
            let count = r.u32("threshold child count")? as usize;
            let mut subjects = Vec::with_capacity(count);
            for _ in 0..count {
                subjects.push(decode_subject(r)?);
            }
            if required == 0 || required as usize > count {
                return Err(EngineError::MalformedBlob {
                    reason: format!("threshold {required} of {count} is not satisfiable"),
                });
            }
            Ok(AclSubject::Threshold(ThresholdSubject { required, subjects }))
        }
        TAG_PROCESS => Ok(AclSubject::Process(ProcessSubject {
            uid: r.u32("process uid")?,
        })),
        TAG_CODE_SIGNATURE => Ok(AclSubject::CodeSignature(CodeSignatureSubject {
            requirement: r.bytes("signature requirement")?.to_vec(),
        })),
        TAG_COMMENT => Ok(AclSubject::Comment(r.bytes("comment")?.to_vec())),
        TAG_PREAUTH => Ok(AclSubject::PreAuth(r.u32("preauth slot")?)),
        TAG_PARTITION => Ok(AclSubject::Partition(PartitionSubject::decode(r)?)),
        other => Err(EngineError::MalformedBlob {
            reason: format!("unknown subject tag {other}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Outcome of a successful validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AclValidation {
    /// The validation mutated the ACL (partition install/extension,
    /// remembered caller). The caller's cached copy is stale and must be
    /// re-fetched.
    pub stale_acl: bool,
}

enum SubjectOutcome {
    Granted,
    Denied,
    /// A prompt subject could still grant this, pending the human.
    NeedsPrompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionStatus {
    /// Bypassed or pre-partition format: no check applies.
    Exempt,
    /// Caller's partition id is listed.
    Member,
    /// A list exists but the caller is not on it.
    Missing,
    /// No partition entry at all: auto-upgrade installs one.
    Absent,
}

struct PromptPlan {
    entry_index: usize,
    subject: PromptSubject,
}

/// Decide the instantiated ACL for a state guard, decoding lazily.
pub(crate) fn ensure_instantiated<'a>(
    st: &'a mut CommonState,
    container: &str,
) -> Result<&'a mut Acl> {
    if matches!(st.acl, AclState::Uninstantiated) {
        if st.locked {
            return Err(EngineError::Locked {
                container: container.to_string(),
            });
        }
        let acl = if st.public_acl.is_empty() {
            Acl::default()
        } else {
            Acl::decode(&st.public_acl)?
        };
        tracing::debug!(container, entries = acl.entries.len(), "ACL instantiated");
        st.acl = AclState::Instantiated(acl);
    }
    match &mut st.acl {
        AclState::Instantiated(acl) => Ok(acl),
        AclState::Uninstantiated => Err(EngineError::Internal(
            "ACL instantiation did not take".into(),
        )),
    }
}

/// Evaluates operations against one container's ACL.
pub struct AclEngine<'a> {
    container: &'a Arc<ContainerCommon>,
    agent: &'a Arc<dyn InteractiveAgent>,
    config: &'a EngineConfig,
}

impl<'a> AclEngine<'a> {
    pub fn new(
        container: &'a Arc<ContainerCommon>,
        agent: &'a Arc<dyn InteractiveAgent>,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            container,
            agent,
            config,
        }
    }

    /// Validate `op` for `caller`. `ui_allowed` states whether this request
    /// may put questions to a human.
    ///
    /// Denials — wrong credentials, no matching entry, partition mismatch —
    /// all surface as [`EngineError::AuthDenied`].
    pub fn validate(
        &self,
        op: AclOp,
        creds: &Credentials,
        caller: &Caller,
        ui_allowed: bool,
    ) -> Result<AclValidation> {
        let container = self.container;
        let name = container.identity().name.clone();
        let epoch0 = container.lock_epoch();
        let bypass = caller.oracle().platform_signed()
            && caller.oracle().has_capability(Capability::Migration);

        let mut stale = false;
        let mut prompt_plan: Option<PromptPlan> = None;
        let mut need_prompt = false;
        let mut need_extension = false;

        // Phase one: everything that needs no human, under the state mutex
        // and then the caller-process lock.
        {
            let mut st = container.state();
            let _process = caller.lock();

            if st.locked {
                return Err(EngineError::Locked { container: name });
            }
            let format = st.format;
            let acl = ensure_instantiated(&mut st, &name)?;

            let mut granted = false;
            for (index, entry) in acl.entries.iter_mut().enumerate() {
                if !entry.ops.allows(op) {
                    continue;
                }
                match eval_subject(&mut entry.subject, creds, caller, bypass) {
                    SubjectOutcome::Granted => {
                        granted = true;
                        break;
                    }
                    SubjectOutcome::NeedsPrompt => {
                        if prompt_plan.is_none() {
                            prompt_plan = snapshot_prompt(index, &entry.subject);
                        }
                    }
                    SubjectOutcome::Denied => {}
                }
            }

            if granted {
                match partition_status(acl, format, caller, bypass) {
                    PartitionStatus::Exempt | PartitionStatus::Member => {}
                    PartitionStatus::Absent => {
                        install_caller_partition(acl, caller, container);
                        stale = true;
                    }
                    PartitionStatus::Missing => {
                        if ui_allowed {
                            need_extension = true;
                        } else {
                            tracing::debug!(container = %name, "partition check failed without UI");
                            return Err(EngineError::AuthDenied);
                        }
                    }
                }
            } else if prompt_plan.is_some() && ui_allowed {
                need_prompt = true;
            } else {
                return Err(EngineError::AuthDenied);
            }
        }

        // Phase two: the human. No engine locks are held while asking.
        if need_prompt {
            let plan = prompt_plan.ok_or_else(|| {
                EngineError::Internal("prompt phase without a prompt plan".into())
            })?;
            let ctx = PromptContext {
                container: &name,
                domain: container.domain(),
                reason: op.describe(),
            };
            let verdict =
                prompt::evaluate(&plan.subject, &ctx, caller, self.agent, self.config, container, epoch0);
            if !verdict.allowed {
                return Err(EngineError::AuthDenied);
            }

            // Re-acquire and re-check: the container may have locked while
            // the question was pending.
            let mut st = container.state();
            let _process = caller.lock();
            if st.locked || container.lock_epoch() != epoch0 {
                tracing::debug!(container = %name, "approved prompt abandoned: container locked");
                return Err(EngineError::AuthDenied);
            }
            let format = st.format;
            let acl = ensure_instantiated(&mut st, &name)?;

            record_prompt_result(acl, &plan, verdict.remember_identity, container, &mut stale);

            match partition_status(acl, format, caller, bypass) {
                PartitionStatus::Exempt | PartitionStatus::Member => {}
                PartitionStatus::Absent => {
                    install_caller_partition(acl, caller, container);
                    stale = true;
                }
                PartitionStatus::Missing => need_extension = true,
            }
        }

        if need_extension {
            if !crate::partition::extend(container, caller, self.agent, self.config, epoch0)? {
                return Err(EngineError::AuthDenied);
            }
            stale = true;
        }

        Ok(AclValidation { stale_acl: stale })
    }
}

fn snapshot_prompt(entry_index: usize, subject: &AclSubject) -> Option<PromptPlan> {
    let prompt = match subject {
        AclSubject::Prompt(p) => Some(p),
        AclSubject::Threshold(t) => t.subjects.iter().find_map(|s| match s {
            AclSubject::Prompt(p) => Some(p),
            _ => None,
        }),
        _ => None,
    };
    prompt.map(|p| PromptPlan {
        entry_index,
        subject: p.clone(),
    })
}

/// Apply post-approval bookkeeping: the diagnostic attempt counter and, for
/// a "remember" approval, the caller-identity clone prepended to the
/// enclosing threshold so it is tried first from now on. The clone is a
/// side effect of an already-granted operation, so it logs rather than
/// fails.
fn record_prompt_result(
    acl: &mut Acl,
    plan: &PromptPlan,
    remember_identity: Option<Vec<u8>>,
    container: &ContainerCommon,
    stale: &mut bool,
) {
    let mut remembered = false;
    {
        let Some(entry) = acl.entries.get_mut(plan.entry_index) else {
            tracing::warn!("prompt entry vanished during interaction");
            return;
        };
        match &mut entry.subject {
            AclSubject::Threshold(t) => {
                for child in t.subjects.iter_mut() {
                    if let AclSubject::Prompt(p) = child {
                        p.attempts += 1;
                        break;
                    }
                }
                if let Some(requirement) = remember_identity {
                    t.subjects.insert(
                        0,
                        AclSubject::CodeSignature(CodeSignatureSubject { requirement }),
                    );
                    remembered = true;
                }
            }
            AclSubject::Prompt(p) => {
                p.attempts += 1;
                if remember_identity.is_some() {
                    // A bare prompt has no enclosing threshold to extend.
                    tracing::debug!("remember requested on a bare prompt subject; skipped");
                }
            }
            _ => {}
        }
    }
    if remembered {
        acl.mark_changed();
        container.invalidate_blob();
        container.events().publish(EngineEvent::AclChanged {
            container: container.identity().name.clone(),
            at: Utc::now(),
        });
        *stale = true;
        tracing::info!(container = %container.identity(), "caller identity remembered in ACL");
    }
}

fn partition_status(
    acl: &Acl,
    format: u32,
    caller: &Caller,
    bypass: bool,
) -> PartitionStatus {
    if bypass || format < FORMAT_PARTITIONED {
        return PartitionStatus::Exempt;
    }
    match acl.partition() {
        None => PartitionStatus::Absent,
        Some(p) if p.contains(&caller.oracle().partition_id()) => PartitionStatus::Member,
        Some(_) => PartitionStatus::Missing,
    }
}

/// Auto-upgrade a container with no partition list: the caller's identifier
/// becomes the sole entry and the stale-ACL signal is raised.
fn install_caller_partition(acl: &mut Acl, caller: &Caller, container: &ContainerCommon) {
    let id = caller.oracle().partition_id();
    acl.install_partition(vec![id.clone()]);
    acl.mark_changed();
    container.invalidate_blob();
    container.events().publish(EngineEvent::AclChanged {
        container: container.identity().name.clone(),
        at: Utc::now(),
    });
    tracing::info!(container = %container.identity(), partition = %id, "partition list installed");
}

fn eval_subject(
    subject: &mut AclSubject,
    creds: &Credentials,
    caller: &Caller,
    bypass: bool,
) -> SubjectOutcome {
    match subject {
        AclSubject::Any => SubjectOutcome::Granted,
        AclSubject::Password(p) => {
            let matched = creds.samples.iter().any(|s| match s {
                CredentialSample::Passphrase(pass) => p.matches(pass),
                _ => false,
            });
            if matched {
                SubjectOutcome::Granted
            } else {
                SubjectOutcome::Denied
            }
        }
        AclSubject::Threshold(t) => {
            let mut granted = 0u32;
            let mut promptable = 0u32;
            for child in t.subjects.iter_mut() {
                match eval_subject(child, creds, caller, bypass) {
                    SubjectOutcome::Granted => granted += 1,
                    SubjectOutcome::NeedsPrompt => promptable += 1,
                    SubjectOutcome::Denied => {}
                }
            }
            if granted >= t.required {
                SubjectOutcome::Granted
            } else if promptable > 0 && granted + 1 >= t.required {
                // A single approval can tip the threshold.
                SubjectOutcome::NeedsPrompt
            } else {
                SubjectOutcome::Denied
            }
        }
        AclSubject::Process(p) => {
            if caller.oracle().uid() == p.uid {
                SubjectOutcome::Granted
            } else {
                SubjectOutcome::Denied
            }
        }
        AclSubject::CodeSignature(cs) => {
            let matches = caller.oracle().code_signature()
                == crate::agent::SignatureStatus::Valid
                && caller.oracle().signing_identity().as_deref() == Some(cs.requirement.as_slice());
            if matches {
                SubjectOutcome::Granted
            } else {
                SubjectOutcome::Denied
            }
        }
        AclSubject::Comment(_) => SubjectOutcome::Denied,
        AclSubject::PreAuth(slot) => {
            let matched = creds
                .samples
                .iter()
                .any(|s| matches!(s, CredentialSample::PreAuthorized(candidate) if *candidate == *slot));
            if matched {
                SubjectOutcome::Granted
            } else {
                SubjectOutcome::Denied
            }
        }
        AclSubject::Prompt(p) => {
            if bypass {
                // Sanctioned migration tooling: allowed without a question,
                // recorded for diagnostics.
                p.attempts += 1;
                SubjectOutcome::Granted
            } else {
                SubjectOutcome::NeedsPrompt
            }
        }
        AclSubject::Partition(_) => SubjectOutcome::Denied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StaticProcess;
    use crate::prompt::PromptFlags;

    fn caller(oracle: StaticProcess) -> Caller {
        Caller::new(Arc::new(oracle))
    }

    fn eval(subject: &mut AclSubject, creds: &Credentials, c: &Caller) -> bool {
        matches!(
            eval_subject(subject, creds, c, false),
            SubjectOutcome::Granted
        )
    }

    #[test]
    fn any_always_grants() {
        let c = caller(StaticProcess::signed("apps:demo"));
        assert!(eval(&mut AclSubject::Any, &Credentials::none(), &c));
    }

    #[test]
    fn comment_and_partition_never_grant() {
        let c = caller(StaticProcess::signed("apps:demo"));
        assert!(!eval(
            &mut AclSubject::Comment(b"managed by IT".to_vec()),
            &Credentials::none(),
            &c
        ));
        assert!(!eval(
            &mut AclSubject::Partition(PartitionSubject {
                partitions: vec!["apps:demo".into()],
            }),
            &Credentials::none(),
            &c
        ));
    }

    #[test]
    fn password_subject_matches_sample() {
        let c = caller(StaticProcess::signed("apps:demo"));
        let mut subject =
            AclSubject::Password(PasswordSubject::from_passphrase(b"hunter2").unwrap());

        assert!(eval(&mut subject, &Credentials::from_passphrase(b"hunter2"), &c));
        assert!(!eval(&mut subject, &Credentials::from_passphrase(b"wrong"), &c));
        assert!(!eval(&mut subject, &Credentials::none(), &c));
    }

    #[test]
    fn process_subject_matches_uid() {
        let mut oracle = StaticProcess::signed("apps:demo");
        oracle.uid = 777;
        let c = caller(oracle);

        assert!(eval(
            &mut AclSubject::Process(ProcessSubject { uid: 777 }),
            &Credentials::none(),
            &c
        ));
        assert!(!eval(
            &mut AclSubject::Process(ProcessSubject { uid: 778 }),
            &Credentials::none(),
            &c
        ));
    }

    #[test]
    fn code_signature_requires_valid_and_matching() {
        let signed = caller(StaticProcess::signed("apps:demo"));
        let unsigned = caller(StaticProcess::unsigned("apps:demo"));
        let mut subject = AclSubject::CodeSignature(CodeSignatureSubject {
            requirement: b"signer:apps:demo".to_vec(),
        });

        assert!(eval(&mut subject, &Credentials::none(), &signed));
        assert!(!eval(&mut subject, &Credentials::none(), &unsigned));
    }

    #[test]
    fn preauth_matches_slot_sample() {
        let c = caller(StaticProcess::signed("apps:demo"));
        let creds = Credentials {
            samples: vec![CredentialSample::PreAuthorized(3)],
        };
        assert!(eval(&mut AclSubject::PreAuth(3), &creds, &c));
        assert!(!eval(&mut AclSubject::PreAuth(4), &creds, &c));
    }

    #[test]
    fn threshold_two_of_three() {
        let mut oracle = StaticProcess::signed("apps:demo");
        oracle.uid = 501;
        let c = caller(oracle);

        let mut subject = AclSubject::Threshold(ThresholdSubject {
            required: 2,
            subjects: vec![
                AclSubject::Process(ProcessSubject { uid: 501 }),
                AclSubject::Password(PasswordSubject::from_passphrase(b"pw").unwrap()),
                AclSubject::Comment(Vec::new()),
            ],
        });

        // uid alone is 1 of 2.
        assert!(!eval(&mut subject, &Credentials::none(), &c));
        // uid + passphrase reaches the threshold.
        assert!(eval(&mut subject, &Credentials::from_passphrase(b"pw"), &c));
    }

    #[test]
    fn migration_bypass_grants_prompt_and_counts() {
        let migrator = caller(StaticProcess::migrator("apps:migrate"));
        let mut subject = AclSubject::Prompt(PromptSubject::new("login item"));

        assert!(matches!(
            eval_subject(&mut subject, &Credentials::none(), &migrator, true),
            SubjectOutcome::Granted
        ));
        if let AclSubject::Prompt(p) = &subject {
            assert_eq!(p.attempts, 1);
        } else {
            unreachable!()
        }
    }

    #[test]
    fn acl_codec_roundtrip() {
        let mut prompt = PromptSubject::new("mail password");
        prompt.selector.flags = PromptFlags::ALLOW_UNSIGNED;
        let acl = Acl {
            entries: vec![
                AclEntry {
                    tag: "default".into(),
                    ops: AclOpSet::all(),
                    subject: AclSubject::Threshold(ThresholdSubject {
                        required: 1,
                        subjects: vec![
                            AclSubject::CodeSignature(CodeSignatureSubject {
                                requirement: b"signer:mail".to_vec(),
                            }),
                            AclSubject::Prompt(prompt),
                        ],
                    }),
                },
                AclEntry {
                    tag: "export".into(),
                    ops: AclOpSet::EXPORT_WRAPPED,
                    subject: AclSubject::Password(
                        PasswordSubject::from_passphrase(b"export-pw").unwrap(),
                    ),
                },
                AclEntry {
                    tag: "_partition".into(),
                    ops: AclOpSet::empty(),
                    subject: AclSubject::Partition(PartitionSubject {
                        partitions: vec!["apps:mail".into(), "teamid:XYZ".into()],
                    }),
                },
            ],
            changed: false,
        };

        let decoded = Acl::decode(&acl.encode()).unwrap();
        assert_eq!(decoded.entries.len(), 3);
        // The runtime attempt counter is not persisted; compare structure.
        assert_eq!(decoded.entries[1], acl.entries[1]);
        assert_eq!(decoded.entries[2], acl.entries[2]);
    }

    #[test]
    fn duplicate_partition_entries_rejected() {
        let mut acl = Acl::standard("x", "apps:a");
        acl.install_partition(vec!["apps:b".into()]);
        assert!(matches!(
            Acl::decode(&acl.encode()),
            Err(EngineError::MalformedBlob { .. })
        ));
    }

    #[test]
    fn unsatisfiable_threshold_rejected() {
        let acl = Acl {
            entries: vec![AclEntry {
                tag: "broken".into(),
                ops: AclOpSet::all(),
                subject: AclSubject::Threshold(ThresholdSubject {
                    required: 3,
                    subjects: vec![AclSubject::Any],
                }),
            }],
            changed: false,
        };
        assert!(matches!(
            Acl::decode(&acl.encode()),
            Err(EngineError::MalformedBlob { .. })
        ));
    }

    #[test]
    fn standard_acl_shape() {
        let acl = Acl::standard("login keychain", "apps:login");
        assert_eq!(acl.entries.len(), 2);
        assert!(acl.partition().unwrap().contains("apps:login"));
        assert!(acl.entries[0].ops.allows(AclOp::Decrypt));
        assert!(acl.entries[0].ops.allows(AclOp::ChangeAcl));
    }
}

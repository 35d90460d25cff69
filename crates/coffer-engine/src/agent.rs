//! External collaborator interfaces.
//!
//! The engine never verifies a code signature, paints a dialog, or talks to
//! a platform secret manager itself. Those capabilities arrive through three
//! traits, all `Send + Sync` so requests can be served from any worker
//! thread:
//!
//! - [`ProcessOracle`] — answers identity questions about the requesting
//!   process (signature status, capabilities, partition identifier).
//! - [`InteractiveAgent`] — delivers questions to a human and returns their
//!   answer.
//! - [`SecureKeyStore`] — an optional platform secret manager a container's
//!   master secret can be bound to.
//!
//! Agent calls run through [`call_with_deadline`], which dispatches the
//! query on a helper thread and waits with a bounded deadline and a
//! cancellation probe, so a vanished agent can never park a request thread
//! forever.
//!
//! [`StaticProcess`], [`ScriptedAgent`], and [`MemoryKeyStore`] are simple
//! in-memory implementations, used heavily by the test suite and usable as
//! stand-ins wherever a real platform binding is unavailable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};

use crate::container::TrackedMutex;
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Process identity
// ---------------------------------------------------------------------------

/// Outcome of a code-signature check on the requesting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The process carries a valid signature.
    Valid,
    /// The process carries no signature at all.
    Unsigned,
    /// The signature exists but fails verification.
    Broken,
    /// The process could not be found or inspected.
    NotFound,
}

/// Platform-verified capabilities a process may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Sanctioned bulk-migration tooling: bypasses prompt subjects and the
    /// partition membership check.
    Migration,
}

/// Identity questions about the requesting process.
pub trait ProcessOracle: Send + Sync {
    /// Result of verifying the process's code signature.
    fn code_signature(&self) -> SignatureStatus;

    /// Whether the signature, when valid, chains to the platform itself.
    fn platform_signed(&self) -> bool;

    /// Whether the process holds a platform-verified capability.
    fn has_capability(&self, capability: Capability) -> bool;

    /// The process's partition identifier (trust-group tag).
    fn partition_id(&self) -> String;

    /// The process's numeric user id.
    fn uid(&self) -> u32;

    /// Opaque bytes identifying the signer, for ACL cloning. `None` when
    /// the process is unsigned.
    fn signing_identity(&self) -> Option<Vec<u8>>;

    /// Whether the process's own signing metadata demands passphrase
    /// re-entry on every prompt.
    fn force_passphrase_prompt(&self) -> bool {
        false
    }
}

/// A requesting process: its identity oracle plus the per-process lock the
/// ACL evaluator takes after the container lock (fixed order, container
/// before process).
pub struct Caller {
    oracle: Arc<dyn ProcessOracle>,
    lock: TrackedMutex<()>,
}

impl Caller {
    pub fn new(oracle: Arc<dyn ProcessOracle>) -> Self {
        Self {
            oracle,
            lock: TrackedMutex::new(()),
        }
    }

    pub fn oracle(&self) -> &dyn ProcessOracle {
        self.oracle.as_ref()
    }

    pub(crate) fn lock(&self) -> crate::container::TrackedGuard<'_, ()> {
        self.lock.lock()
    }
}

// ---------------------------------------------------------------------------
// Interactive agent
// ---------------------------------------------------------------------------

/// A human's answer to a use-confirmation or system-edit prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptReply {
    /// Approved. `remember` asks the engine to stop prompting this caller.
    Allow { remember: bool },
    /// Declined.
    Deny,
    /// The agent failed to deliver the question.
    Error(String),
}

/// Delivers questions to a human (or whatever stands in for one).
///
/// Implementations may block for as long as they like; the engine bounds
/// every call with [`call_with_deadline`].
pub trait InteractiveAgent: Send + Sync {
    /// Ask for a container's passphrase during unlock. `None` on cancel.
    fn prompt_unlock(&self, container: &str) -> Option<Vec<u8>>;

    /// Ask permission to use a protected item.
    fn prompt_use(&self, container: &str, reason: &str, require_passphrase: bool) -> PromptReply;

    /// Ask for the old and new secrets during a secret change. `None` on
    /// cancel.
    fn prompt_new_secret(&self, container: &str, reason: &str) -> Option<(Vec<u8>, Vec<u8>)>;

    /// Ask for explicit confirmation of a privileged system-container edit.
    fn confirm_system_edit(&self, container: &str, reason: &str) -> PromptReply;
}

/// Run an agent query on a helper thread, bounded by `deadline` and a
/// cancellation probe.
///
/// Returns `None` when the deadline passes, `cancelled` reports true, or
/// the helper thread dies. The orphaned query keeps running on its thread;
/// its eventual answer lands in a disconnected channel and is discarded,
/// so an abandoned prompt can never mutate engine state.
pub(crate) fn call_with_deadline<R, F>(
    agent: &Arc<dyn InteractiveAgent>,
    deadline: Duration,
    cancelled: &dyn Fn() -> bool,
    query: F,
) -> Option<R>
where
    R: Send + 'static,
    F: FnOnce(&dyn InteractiveAgent) -> R + Send + 'static,
{
    const POLL_SLICE: Duration = Duration::from_millis(25);

    let (tx, rx) = bounded(1);
    let agent = Arc::clone(agent);
    let spawned = std::thread::Builder::new()
        .name("coffer-prompt".into())
        .spawn(move || {
            let _ = tx.send(query(agent.as_ref()));
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not spawn prompt thread");
        return None;
    }

    let started = Instant::now();
    loop {
        match rx.recv_timeout(POLL_SLICE) {
            Ok(reply) => return Some(reply),
            Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {
                if cancelled() {
                    tracing::debug!("prompt abandoned: container locked while waiting");
                    return None;
                }
                if started.elapsed() >= deadline {
                    tracing::warn!(?deadline, "prompt abandoned: agent deadline passed");
                    return None;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Secure key-store
// ---------------------------------------------------------------------------

/// A platform secret manager a container can be bound to. All failures are
/// environment errors, retryable by the caller.
pub trait SecureKeyStore: Send + Sync {
    /// Unlock the store's context with the container secret.
    fn unlock(&self, context: &str, secret: &[u8]) -> Result<()>;

    /// Change the stored secret, authorized by the old one.
    fn change_secret(&self, context: &str, old: &[u8], new: &[u8]) -> Result<()>;

    /// Create a context protected by `secret`.
    fn create(&self, context: &str, secret: &[u8]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// A [`ProcessOracle`] with fixed answers.
#[derive(Debug, Clone)]
pub struct StaticProcess {
    pub signature: SignatureStatus,
    pub platform: bool,
    pub capabilities: Vec<Capability>,
    pub partition: String,
    pub uid: u32,
    pub identity: Option<Vec<u8>>,
    pub force_passphrase: bool,
}

impl StaticProcess {
    /// A validly signed, uncapable process in the given partition.
    pub fn signed(partition: &str) -> Self {
        Self {
            signature: SignatureStatus::Valid,
            platform: false,
            capabilities: Vec::new(),
            partition: partition.to_string(),
            uid: 501,
            identity: Some(format!("signer:{partition}").into_bytes()),
            force_passphrase: false,
        }
    }

    /// An unsigned process in the given partition.
    pub fn unsigned(partition: &str) -> Self {
        Self {
            signature: SignatureStatus::Unsigned,
            identity: None,
            ..Self::signed(partition)
        }
    }

    /// A platform-signed process holding the migration capability.
    pub fn migrator(partition: &str) -> Self {
        Self {
            platform: true,
            capabilities: vec![Capability::Migration],
            ..Self::signed(partition)
        }
    }
}

impl ProcessOracle for StaticProcess {
    fn code_signature(&self) -> SignatureStatus {
        self.signature
    }

    fn platform_signed(&self) -> bool {
        self.platform
    }

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn partition_id(&self) -> String {
        self.partition.clone()
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    fn signing_identity(&self) -> Option<Vec<u8>> {
        self.identity.clone()
    }

    fn force_passphrase_prompt(&self) -> bool {
        self.force_passphrase
    }
}

/// An [`InteractiveAgent`] that plays back queued answers and counts every
/// call, so tests can assert "the agent was never consulted".
#[derive(Default)]
pub struct ScriptedAgent {
    unlock_replies: Mutex<Vec<Option<Vec<u8>>>>,
    use_replies: Mutex<Vec<PromptReply>>,
    new_secret_replies: Mutex<Vec<Option<(Vec<u8>, Vec<u8>)>>>,
    system_replies: Mutex<Vec<PromptReply>>,
    pub unlock_calls: AtomicUsize,
    pub use_calls: AtomicUsize,
    pub new_secret_calls: AtomicUsize,
    pub system_calls: AtomicUsize,
    last_require_passphrase: Mutex<Option<bool>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a passphrase answer for the next unlock prompt.
    pub fn push_unlock(&self, reply: Option<&[u8]>) {
        self.unlock_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply.map(<[u8]>::to_vec));
    }

    /// Queue an answer for the next use prompt.
    pub fn push_use(&self, reply: PromptReply) {
        self.use_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply);
    }

    /// Queue an answer for the next secret-change prompt.
    pub fn push_new_secret(&self, reply: Option<(&[u8], &[u8])>) {
        self.new_secret_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply.map(|(a, b)| (a.to_vec(), b.to_vec())));
    }

    /// Queue an answer for the next system-edit confirmation.
    pub fn push_system(&self, reply: PromptReply) {
        self.system_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply);
    }

    /// Total prompts of any kind delivered so far.
    pub fn total_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
            + self.use_calls.load(Ordering::SeqCst)
            + self.new_secret_calls.load(Ordering::SeqCst)
            + self.system_calls.load(Ordering::SeqCst)
    }

    /// The `require_passphrase` flag seen by the most recent use prompt.
    pub fn last_require_passphrase(&self) -> Option<bool> {
        *self
            .last_require_passphrase
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn pop<T>(queue: &Mutex<Vec<T>>) -> Option<T> {
        let mut q = queue.lock().unwrap_or_else(|e| e.into_inner());
        if q.is_empty() { None } else { Some(q.remove(0)) }
    }
}

impl InteractiveAgent for ScriptedAgent {
    fn prompt_unlock(&self, _container: &str) -> Option<Vec<u8>> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        Self::pop(&self.unlock_replies).flatten()
    }

    fn prompt_use(&self, _container: &str, _reason: &str, require_passphrase: bool) -> PromptReply {
        self.use_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .last_require_passphrase
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(require_passphrase);
        Self::pop(&self.use_replies).unwrap_or(PromptReply::Deny)
    }

    fn prompt_new_secret(&self, _container: &str, _reason: &str) -> Option<(Vec<u8>, Vec<u8>)> {
        self.new_secret_calls.fetch_add(1, Ordering::SeqCst);
        Self::pop(&self.new_secret_replies).flatten()
    }

    fn confirm_system_edit(&self, _container: &str, _reason: &str) -> PromptReply {
        self.system_calls.fetch_add(1, Ordering::SeqCst);
        Self::pop(&self.system_replies).unwrap_or(PromptReply::Deny)
    }
}

/// A [`SecureKeyStore`] backed by a map, recording secret changes.
#[derive(Default)]
pub struct MemoryKeyStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
    pub change_calls: AtomicUsize,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The secret currently stored for `context`.
    pub fn secret(&self, context: &str) -> Option<Vec<u8>> {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(context)
            .cloned()
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn unlock(&self, context: &str, secret: &[u8]) -> Result<()> {
        let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        match secrets.get(context) {
            Some(stored) if stored == secret => Ok(()),
            Some(_) => Err(EngineError::AuthDenied),
            None => Err(EngineError::KeyStoreFailed {
                reason: format!("unknown context {context}"),
            }),
        }
    }

    fn change_secret(&self, context: &str, old: &[u8], new: &[u8]) -> Result<()> {
        self.change_calls.fetch_add(1, Ordering::SeqCst);
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        match secrets.get(context) {
            Some(stored) if stored == old => {
                secrets.insert(context.to_string(), new.to_vec());
                Ok(())
            }
            Some(_) => Err(EngineError::AuthDenied),
            None => Err(EngineError::KeyStoreFailed {
                reason: format!("unknown context {context}"),
            }),
        }
    }

    fn create(&self, context: &str, secret: &[u8]) -> Result<()> {
        self.secrets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(context.to_string(), secret.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_returns_answer_in_time() {
        let agent: Arc<dyn InteractiveAgent> = Arc::new(ScriptedAgent::new());
        let reply = call_with_deadline(
            &agent,
            Duration::from_secs(5),
            &|| false,
            |a| a.prompt_use("login", "read item", false),
        );
        assert_eq!(reply, Some(PromptReply::Deny));
    }

    struct StalledAgent;

    impl InteractiveAgent for StalledAgent {
        fn prompt_unlock(&self, _: &str) -> Option<Vec<u8>> {
            std::thread::sleep(Duration::from_secs(30));
            None
        }
        fn prompt_use(&self, _: &str, _: &str, _: bool) -> PromptReply {
            std::thread::sleep(Duration::from_secs(30));
            PromptReply::Deny
        }
        fn prompt_new_secret(&self, _: &str, _: &str) -> Option<(Vec<u8>, Vec<u8>)> {
            None
        }
        fn confirm_system_edit(&self, _: &str, _: &str) -> PromptReply {
            PromptReply::Deny
        }
    }

    #[test]
    fn deadline_abandons_stalled_agent() {
        let agent: Arc<dyn InteractiveAgent> = Arc::new(StalledAgent);
        let started = Instant::now();
        let reply = call_with_deadline(
            &agent,
            Duration::from_millis(100),
            &|| false,
            |a| a.prompt_unlock("login"),
        );
        assert_eq!(reply, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_probe_wins_over_deadline() {
        let agent: Arc<dyn InteractiveAgent> = Arc::new(StalledAgent);
        let started = Instant::now();
        let reply = call_with_deadline(
            &agent,
            Duration::from_secs(30),
            &|| true,
            |a| a.prompt_unlock("login"),
        );
        assert_eq!(reply, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn memory_keystore_change_requires_old_secret() {
        let store = MemoryKeyStore::new();
        store.create("login", b"old").unwrap();

        assert!(matches!(
            store.change_secret("login", b"wrong", b"new"),
            Err(EngineError::AuthDenied)
        ));
        store.change_secret("login", b"old", b"new").unwrap();
        assert_eq!(store.secret("login").as_deref(), Some(&b"new"[..]));
    }
}

//! Per-client container handles and credential establishment.
//!
//! A [`ContainerHandle`] is what a client actually holds: a decoded copy of
//! the container's persisted blob, a version-tagged cache of its encoded
//! form, the last credentials that worked, and an `Arc` to the shared
//! [`ContainerCommon`] everything secret-dependent delegates to.
//!
//! Credential establishment scans caller-supplied *samples* in order and
//! stops at the first success. The ordering rules are subtle and load-
//! bearing:
//!
//! - System-domain containers try their dedicated key file before anything
//!   else, and never prompt a human.
//! - A [`CredentialSample::Cancel`] does not abort the scan — it only
//!   suppresses the trailing default-prompt fallback, so explicit samples
//!   after the cancel are still attempted.
//! - An empty sample list means "use the default": the interactive prompt,
//!   unless the container is system-domain.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::acl::{Acl, AclEngine, AclOp, AclState, AclValidation};
use crate::agent::{Caller, InteractiveAgent, SecureKeyStore, call_with_deadline};
use crate::blob::{ContainerBlob, FORMAT_CURRENT};
use crate::container::{ContainerCommon, ContainerIdentity, TrustDomain};
use crate::crypto::{self, KEY_LEN, SALT_LEN};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::registry::ContainerRegistry;
use crate::secrets::{MasterSecret, envelope_salt, open_envelope};

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A key handle supplied as a credential: raw symmetric bytes, or a sealed
/// key that unwraps through another reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReference {
    Symmetric(Vec<u8>),
    Wrapped {
        sealed: Vec<u8>,
        unwrap_with: Box<KeyReference>,
    },
}

impl KeyReference {
    /// Resolve to raw master-key bytes. `Ok(None)` when the reference does
    /// not yield a usable key (wrong width, failed unwrap) — that is an
    /// authentication failure, not a structural one.
    pub(crate) fn resolve(&self) -> Result<Option<[u8; KEY_LEN]>> {
        match self {
            Self::Symmetric(bytes) => {
                if bytes.len() != KEY_LEN {
                    return Ok(None);
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(bytes);
                Ok(Some(key))
            }
            Self::Wrapped { sealed, unwrap_with } => {
                let Some(outer) = unwrap_with.resolve()? else {
                    return Ok(None);
                };
                match crypto::open(&outer, sealed)? {
                    Some(bytes) if bytes.len() == KEY_LEN => {
                        let mut key = [0u8; KEY_LEN];
                        key.copy_from_slice(&bytes);
                        Ok(Some(key))
                    }
                    _ => Ok(None),
                }
            }
        }
    }
}

/// One credential the caller offers during establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSample {
    /// Delegate to the interactive agent.
    InteractivePrompt,
    /// An explicit passphrase (for new-secret establishment: the candidate
    /// new passphrase).
    Passphrase(Vec<u8>),
    /// An explicit key handle.
    KeyReference(KeyReference),
    /// A pre-authorization slot reference, consumed by ACL evaluation.
    PreAuthorized(u32),
    /// Stop trying defaults; explicit samples after this are still scanned.
    Cancel,
}

/// Ordered credential samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub samples: Vec<CredentialSample>,
}

impl Credentials {
    /// No samples at all: establishment falls back to the default prompt.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        Self {
            samples: vec![CredentialSample::Passphrase(passphrase.to_vec())],
        }
    }

    pub fn with(mut self, sample: CredentialSample) -> Self {
        self.samples.push(sample);
        self
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct CachedBlob {
    version: u64,
    bytes: Vec<u8>,
}

/// A client's reference to one container.
pub struct ContainerHandle {
    registry: Arc<ContainerRegistry>,
    common: Arc<ContainerCommon>,
    /// Decoded persisted form this handle was opened with, kept in sync
    /// with the shared state after secret changes and re-encodes.
    blob: ContainerBlob,
    cached: Option<CachedBlob>,
    /// Last master secret that worked for this handle.
    cached_secret: Option<MasterSecret>,
}

impl ContainerHandle {
    /// Open a handle onto a persisted container blob.
    pub fn open(
        registry: &Arc<ContainerRegistry>,
        name: &str,
        bytes: &[u8],
        domain: TrustDomain,
    ) -> Result<Self> {
        let blob = ContainerBlob::decode(bytes)?;
        let identity = ContainerIdentity::new(name, blob.signature);
        let common = registry.find_or_create(identity, domain, Some(blob.format));
        tracing::debug!(container = %common.identity(), "handle opened");
        Ok(Self {
            registry: Arc::clone(registry),
            common,
            blob,
            cached: None,
            cached_secret: None,
        })
    }

    /// Create a new container protected by `passphrase`. The new container
    /// is unlocked, carries the standard prompt-gated ACL, and lists
    /// `creator_partition` as the sole partition member.
    pub fn create(
        registry: &Arc<ContainerRegistry>,
        name: &str,
        domain: TrustDomain,
        passphrase: &[u8],
        creator_partition: &str,
    ) -> Result<Self> {
        let signature = crypto::random_array()?;
        let identity = ContainerIdentity::new(name, signature);
        let common = registry.find_or_create(identity, domain, Some(FORMAT_CURRENT));

        let salt = crypto::random_array::<SALT_LEN>()?;
        let master = MasterSecret::derive(passphrase, &salt);
        {
            let mut st = common.state();
            let st = &mut *st;
            if !st.sealed_secret.is_empty() {
                return Err(EngineError::Internal(format!(
                    "container {name} already initialized"
                )));
            }
            st.core.set_master(master.clone());
            st.core.generate_operational()?;
            st.sealed_secret = st.core.wrap_operational(&salt)?;

            let acl = Acl::standard(name, creator_partition);
            st.public_acl = acl.encode();
            st.acl = AclState::Instantiated(acl);

            st.locked = false;
            st.params_captured = true;
            if !st.params.idle_timeout.is_zero() {
                st.idle_deadline = Some(Instant::now() + st.params.idle_timeout);
            }
            st.format = FORMAT_CURRENT;
        }

        tracing::info!(container = %common.identity(), "container created");
        common.events().publish(EngineEvent::Unlocked {
            container: name.to_string(),
            at: Utc::now(),
        });

        let bytes = common.encode_blob()?;
        let blob = ContainerBlob::decode(&bytes)?;
        Ok(Self {
            registry: Arc::clone(registry),
            cached: Some(CachedBlob {
                version: common.version(),
                bytes,
            }),
            common,
            blob,
            cached_secret: Some(master),
        })
    }

    pub fn common(&self) -> &Arc<ContainerCommon> {
        &self.common
    }

    pub fn is_locked(&self) -> bool {
        self.common.is_locked()
    }

    /// Lock the underlying container.
    pub fn lock(&self) {
        self.common.lock();
    }

    /// Record client activity (resets the idle deadline).
    pub fn activity(&self) {
        self.common.activity();
    }

    /// Release this handle, dropping the registry entry if nothing else
    /// references the (locked) container.
    pub fn close(self) {
        let registry = Arc::clone(&self.registry);
        let identity = self.common.identity().clone();
        drop(self);
        registry.remove_if_unreferenced(&identity);
    }

    /// Validate an ACL-gated operation for `caller` against this container.
    pub fn validate(
        &self,
        op: AclOp,
        creds: &Credentials,
        caller: &Caller,
        agent: &Arc<dyn InteractiveAgent>,
        ui_allowed: bool,
    ) -> Result<AclValidation> {
        AclEngine::new(&self.common, agent, self.registry.config()).validate(
            op,
            creds,
            caller,
            ui_allowed,
        )
    }

    // -- Establish the existing secret --------------------------------------

    /// Establish the container's current master secret and unlock it.
    ///
    /// Sample scan order and fallback rules are described in the module
    /// docs. Exhausting every option raises [`EngineError::AuthDenied`].
    pub fn establish_old_secret(
        &mut self,
        creds: &Credentials,
        agent: &Arc<dyn InteractiveAgent>,
    ) -> Result<()> {
        if !self.common.is_locked() {
            return Ok(());
        }
        let domain = self.common.domain();

        // System-domain containers get their dedicated key file first.
        if domain == TrustDomain::System {
            let signature = self.common.identity().signature;
            let system_key = self.registry.system_keys().lookup(&signature)?;
            if let Some(key) = system_key
                && self.try_master(MasterSecret::from_key(key))?
            {
                return Ok(());
            }
        }

        let mut saw_cancel = false;
        for sample in &creds.samples {
            match sample {
                CredentialSample::InteractivePrompt => {
                    if domain != TrustDomain::System && self.prompt_unlock(agent)? {
                        return Ok(());
                    }
                }
                CredentialSample::Passphrase(passphrase) => {
                    let master = self.master_from_passphrase(passphrase)?;
                    if self.try_master(master)? {
                        return Ok(());
                    }
                }
                CredentialSample::KeyReference(reference) => {
                    let resolved = reference.resolve()?;
                    if let Some(key) = resolved
                        && self.try_master(MasterSecret::from_key(key))?
                    {
                        return Ok(());
                    }
                }
                CredentialSample::PreAuthorized(_) => {}
                CredentialSample::Cancel => saw_cancel = true,
            }
        }

        // Default fallback: the interactive prompt, unless a cancel sample
        // suppressed it or the container never prompts.
        if !saw_cancel
            && domain != TrustDomain::System
            && self.prompt_unlock(agent)?
        {
            return Ok(());
        }

        tracing::debug!(container = %self.common.identity(), "credential establishment exhausted");
        Err(EngineError::AuthDenied)
    }

    // -- Establish a new secret ----------------------------------------------

    /// Change the container's master secret. Returns `true` iff the secret
    /// actually changed; a candidate equal to the current secret is a
    /// no-op `false` with no re-encryption and no version bump.
    ///
    /// For containers bound to an external secure key-store, the change is
    /// propagated there first — authorized by the old secret — so a store
    /// failure leaves local state untouched.
    pub fn establish_new_secret(
        &mut self,
        creds: &Credentials,
        reason: &str,
        agent: &Arc<dyn InteractiveAgent>,
        keystore: Option<&dyn SecureKeyStore>,
    ) -> Result<bool> {
        let name = self.common.identity().name.clone();
        if self.common.is_locked() {
            return Err(EngineError::Locked { container: name });
        }
        let current = self
            .common
            .master_snapshot()
            .ok_or_else(|| EngineError::Internal("unlocked container without master".into()))?;

        let fallback = vec![CredentialSample::InteractivePrompt];
        let samples: &[CredentialSample] =
            if creds.samples.is_empty() && self.common.domain() != TrustDomain::System {
                &fallback
            } else {
                &creds.samples
            };

        for sample in samples {
            match sample {
                CredentialSample::Passphrase(new_pass) => {
                    if self.master_from_passphrase(new_pass)?.matches(&current) {
                        tracing::debug!(container = %name, "secret change is a no-op");
                        return Ok(false);
                    }
                    let salt = crypto::random_array::<SALT_LEN>()?;
                    let new_master = MasterSecret::derive(new_pass, &salt);
                    self.apply_new_master(new_master, salt, &current, keystore)?;
                    return Ok(true);
                }
                CredentialSample::KeyReference(reference) => {
                    if let Some(key) = reference.resolve()? {
                        let new_master = MasterSecret::from_key(key);
                        if new_master.matches(&current) {
                            return Ok(false);
                        }
                        let salt = crypto::random_array::<SALT_LEN>()?;
                        self.apply_new_master(new_master, salt, &current, keystore)?;
                        return Ok(true);
                    }
                }
                CredentialSample::InteractivePrompt => {
                    if self.common.domain() == TrustDomain::System {
                        continue;
                    }
                    let reply = {
                        let _ui = self.common.ui_lock();
                        let container = name.clone();
                        let reason = reason.to_string();
                        call_with_deadline(
                            agent,
                            self.registry.config().prompt_deadline(),
                            &|| false,
                            move |a| a.prompt_new_secret(&container, &reason),
                        )
                    };
                    if let Some(Some((old_pass, new_pass))) = reply {
                        if !self.master_from_passphrase(&old_pass)?.matches(&current) {
                            // Wrong old secret; keep scanning.
                            continue;
                        }
                        if self.master_from_passphrase(&new_pass)?.matches(&current) {
                            return Ok(false);
                        }
                        let salt = crypto::random_array::<SALT_LEN>()?;
                        let new_master = MasterSecret::derive(&new_pass, &salt);
                        self.apply_new_master(new_master, salt, &current, keystore)?;
                        return Ok(true);
                    }
                }
                CredentialSample::PreAuthorized(_) | CredentialSample::Cancel => {}
            }
        }

        Err(EngineError::AuthDenied)
    }

    // -- Non-mutating probe --------------------------------------------------

    /// Answer "would these credentials unlock this container" without side
    /// effects and without ever prompting.
    pub fn check_credentials(&self, creds: &Credentials) -> bool {
        let envelope = self.effective_envelope();
        for sample in &creds.samples {
            let master = match sample {
                CredentialSample::Passphrase(passphrase) => {
                    match self.master_from_passphrase(passphrase) {
                        Ok(master) => master,
                        Err(_) => continue,
                    }
                }
                CredentialSample::KeyReference(reference) => match reference.resolve() {
                    Ok(Some(key)) => MasterSecret::from_key(key),
                    _ => continue,
                },
                CredentialSample::InteractivePrompt
                | CredentialSample::PreAuthorized(_)
                | CredentialSample::Cancel => continue,
            };
            if matches!(open_envelope(&master, &envelope), Ok(Some(_))) {
                return true;
            }
        }
        false
    }

    // -- Blob cache ----------------------------------------------------------

    /// The container's encoded persisted form. Served from the cache while
    /// the version stamp matches; re-encoded (reflecting the latest ACL
    /// content) once it does not.
    pub fn encoded_blob(&mut self) -> Result<Vec<u8>> {
        let version = self.common.version();
        if let Some(cached) = &self.cached
            && cached.version == version
        {
            return Ok(cached.bytes.clone());
        }
        self.refresh_blob()?;
        Ok(self
            .cached
            .as_ref()
            .map(|c| c.bytes.clone())
            .unwrap_or_default())
    }

    /// Re-establish the secret this handle last used successfully.
    pub fn reestablish(&mut self) -> Result<bool> {
        let Some(master) = self.cached_secret.clone() else {
            return Ok(false);
        };
        self.try_master(master)
    }

    // -- Internals -----------------------------------------------------------

    fn try_master(&mut self, master: MasterSecret) -> Result<bool> {
        if self.common.try_unlock_with_master(&self.blob, master.clone())? {
            self.cached_secret = Some(master);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The authoritative secret envelope: the shared state's copy once one
    /// is captured, the handle's decoded blob before that.
    fn effective_envelope(&self) -> Vec<u8> {
        self.common
            .envelope_snapshot()
            .unwrap_or_else(|| self.blob.sealed_secret.clone())
    }

    fn master_from_passphrase(&self, passphrase: &[u8]) -> Result<MasterSecret> {
        let envelope = self.effective_envelope();
        let salt = envelope_salt(&envelope)?;
        Ok(MasterSecret::derive(passphrase, &salt))
    }

    /// Ask the agent for the passphrase, bounded and retried. Each attempt
    /// takes the UI mutex only while the question is out, and re-checks the
    /// lock state before using the answer.
    fn prompt_unlock(&mut self, agent: &Arc<dyn InteractiveAgent>) -> Result<bool> {
        let deadline = self.registry.config().prompt_deadline();
        let retries = self.registry.config().prompt_retry_limit.max(1);
        let name = self.common.identity().name.clone();

        for _ in 0..retries {
            let reply = {
                let _ui = self.common.ui_lock();
                let container = name.clone();
                call_with_deadline(agent, deadline, &|| false, move |a| {
                    a.prompt_unlock(&container)
                })
            };
            match reply {
                None => return Ok(false),
                Some(None) => return Ok(false),
                Some(Some(passphrase)) => {
                    if !self.common.is_locked() {
                        // Someone unlocked while the question was pending.
                        return Ok(true);
                    }
                    let master = self.master_from_passphrase(&passphrase)?;
                    if self.try_master(master)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Commit a new master secret: external key-store first, then the local
    /// rewrap, version bump, and change notification.
    fn apply_new_master(
        &mut self,
        new_master: MasterSecret,
        salt: [u8; SALT_LEN],
        old_master: &MasterSecret,
        keystore: Option<&dyn SecureKeyStore>,
    ) -> Result<()> {
        let name = self.common.identity().name.clone();

        if let Some(store) = keystore {
            store.change_secret(&name, old_master.key(), new_master.key())?;
        }

        {
            let mut st = self.common.state();
            let st = &mut *st;
            if st.locked {
                return Err(EngineError::Locked { container: name });
            }
            st.core.set_master(new_master.clone());
            st.sealed_secret = st.core.wrap_operational(&salt)?;
        }
        self.common.invalidate_blob();
        self.common.events().publish(EngineEvent::SecretChanged {
            container: name.clone(),
            at: Utc::now(),
        });
        tracing::info!(container = %name, "master secret changed");

        self.cached_secret = Some(new_master);
        self.refresh_blob()
    }

    fn refresh_blob(&mut self) -> Result<()> {
        let bytes = self.common.encode_blob()?;
        self.blob = ContainerBlob::decode(&bytes)?;
        self.cached = Some(CachedBlob {
            version: self.common.version(),
            bytes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use crate::config::EngineConfig;

    fn test_registry() -> Arc<ContainerRegistry> {
        let mut config = EngineConfig::default();
        config.prompt_deadline_secs = 2;
        config.system_key_dir = std::env::temp_dir().join(format!(
            "coffer-syskeys-{}-{:x}",
            std::process::id(),
            u64::from_le_bytes(crypto::random_array::<8>().unwrap())
        ));
        ContainerRegistry::new(config)
    }

    fn agent() -> Arc<dyn InteractiveAgent> {
        Arc::new(ScriptedAgent::new())
    }

    #[test]
    fn create_lock_establish_roundtrip() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        assert!(!handle.is_locked());

        handle.lock();
        assert!(handle.is_locked());

        handle
            .establish_old_secret(&Credentials::from_passphrase(b"s1"), &agent())
            .unwrap();
        assert!(!handle.is_locked());
    }

    #[test]
    fn wrong_passphrase_denied_without_prompt_fallback_after_cancel() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        handle.lock();

        let scripted = Arc::new(ScriptedAgent::new());
        let dyn_agent: Arc<dyn InteractiveAgent> = scripted.clone();

        let creds = Credentials::none()
            .with(CredentialSample::Cancel)
            .with(CredentialSample::Passphrase(b"wrong".to_vec()));
        let result = handle.establish_old_secret(&creds, &dyn_agent);
        assert!(matches!(result, Err(EngineError::AuthDenied)));
        // Cancel suppressed the default prompt fallback.
        assert_eq!(scripted.total_calls(), 0);
    }

    #[test]
    fn explicit_sample_after_cancel_still_attempted() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        handle.lock();

        let creds = Credentials::none()
            .with(CredentialSample::Cancel)
            .with(CredentialSample::Passphrase(b"s1".to_vec()));
        handle.establish_old_secret(&creds, &agent()).unwrap();
        assert!(!handle.is_locked());
    }

    #[test]
    fn empty_samples_fall_back_to_prompt() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        handle.lock();

        let scripted = Arc::new(ScriptedAgent::new());
        scripted.push_unlock(Some(b"s1"));
        let dyn_agent: Arc<dyn InteractiveAgent> = scripted.clone();

        handle
            .establish_old_secret(&Credentials::none(), &dyn_agent)
            .unwrap();
        assert!(!handle.is_locked());
        assert_eq!(scripted.unlock_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn unlock_prompt_retries_after_wrong_answer() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        handle.lock();

        let scripted = Arc::new(ScriptedAgent::new());
        scripted.push_unlock(Some(b"typo"));
        scripted.push_unlock(Some(b"s1"));
        let dyn_agent: Arc<dyn InteractiveAgent> = scripted.clone();

        handle
            .establish_old_secret(&Credentials::none(), &dyn_agent)
            .unwrap();
        assert!(!handle.is_locked());
        assert_eq!(scripted.unlock_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn key_reference_establishment() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "keys", TrustDomain::User, b"s1", "apps:keys")
                .unwrap();

        // Rebind the container to a raw key.
        let raw = crypto::random_array::<KEY_LEN>().unwrap();
        let changed = handle
            .establish_new_secret(
                &Credentials::none().with(CredentialSample::KeyReference(
                    KeyReference::Symmetric(raw.to_vec()),
                )),
                "rebind to key",
                &agent(),
                None,
            )
            .unwrap();
        assert!(changed);

        handle.lock();

        // A wrapped reference that unwraps to the same key also works.
        let outer = crypto::random_array::<KEY_LEN>().unwrap();
        let sealed = crypto::seal(&outer, &raw).unwrap();
        let creds = Credentials::none().with(CredentialSample::KeyReference(
            KeyReference::Wrapped {
                sealed,
                unwrap_with: Box::new(KeyReference::Symmetric(outer.to_vec())),
            },
        ));
        handle.establish_old_secret(&creds, &agent()).unwrap();
        assert!(!handle.is_locked());
    }

    #[test]
    fn system_domain_unlocks_from_key_file_and_never_prompts() {
        let registry = test_registry();
        let mut handle = ContainerHandle::create(
            &registry,
            "System",
            TrustDomain::System,
            b"sys-secret",
            "apps:system",
        )
        .unwrap();

        // Install the master key in the system key directory.
        let master = handle.cached_secret.clone().unwrap();
        let signature = handle.common.identity().signature;
        registry
            .system_keys()
            .install(&signature, master.key())
            .unwrap();

        handle.lock();

        let scripted = Arc::new(ScriptedAgent::new());
        let dyn_agent: Arc<dyn InteractiveAgent> = scripted.clone();
        handle
            .establish_old_secret(&Credentials::none(), &dyn_agent)
            .unwrap();
        assert!(!handle.is_locked());
        assert_eq!(scripted.total_calls(), 0);

        // Without the key file, a prompt sample still never reaches the
        // agent for a system container.
        registry.system_keys().remove(&signature).unwrap();
        handle.lock();
        let result = handle.establish_old_secret(
            &Credentials::none().with(CredentialSample::InteractivePrompt),
            &dyn_agent,
        );
        assert!(matches!(result, Err(EngineError::AuthDenied)));
        assert_eq!(scripted.total_calls(), 0);
    }

    #[test]
    fn secret_change_scenario() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        let version_before = handle.common.version();

        // s1 -> s1: unchanged, no version bump.
        let changed = handle
            .establish_new_secret(
                &Credentials::from_passphrase(b"s1"),
                "routine rotation",
                &agent(),
                None,
            )
            .unwrap();
        assert!(!changed);
        assert_eq!(handle.common.version(), version_before);

        // s1 -> s2: changed, version bumped.
        let changed = handle
            .establish_new_secret(
                &Credentials::from_passphrase(b"s2"),
                "routine rotation",
                &agent(),
                None,
            )
            .unwrap();
        assert!(changed);
        assert!(handle.common.version() > version_before);

        // Old secret no longer works; the new one does.
        handle.lock();
        assert!(matches!(
            handle.establish_old_secret(
                &Credentials::none()
                    .with(CredentialSample::Cancel)
                    .with(CredentialSample::Passphrase(b"s1".to_vec())),
                &agent()
            ),
            Err(EngineError::AuthDenied)
        ));
        handle
            .establish_old_secret(&Credentials::from_passphrase(b"s2"), &agent())
            .unwrap();
        assert!(!handle.is_locked());
    }

    #[test]
    fn secret_change_propagates_to_keystore_with_old_authorization() {
        use crate::agent::MemoryKeyStore;

        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "cloud", TrustDomain::User, b"s1", "apps:cloud")
                .unwrap();

        let store = MemoryKeyStore::new();
        let old_master = handle.cached_secret.clone().unwrap();
        store.create("cloud", old_master.key()).unwrap();

        handle
            .establish_new_secret(
                &Credentials::from_passphrase(b"s2"),
                "rotation",
                &agent(),
                Some(&store),
            )
            .unwrap();

        let new_master = handle.cached_secret.clone().unwrap();
        assert_eq!(store.secret("cloud").as_deref(), Some(&new_master.key()[..]));
        assert_eq!(store.change_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn keystore_failure_leaves_local_secret_unchanged() {
        use crate::agent::MemoryKeyStore;

        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "cloud", TrustDomain::User, b"s1", "apps:cloud")
                .unwrap();

        // The store has never heard of this container: environment error.
        let store = MemoryKeyStore::new();
        let result = handle.establish_new_secret(
            &Credentials::from_passphrase(b"s2"),
            "rotation",
            &agent(),
            Some(&store),
        );
        assert!(matches!(result, Err(EngineError::KeyStoreFailed { .. })));

        // s1 still unlocks.
        handle.lock();
        handle
            .establish_old_secret(&Credentials::from_passphrase(b"s1"), &agent())
            .unwrap();
    }

    #[test]
    fn check_credentials_probes_without_mutation_or_prompts() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        handle.lock();

        let scripted = Arc::new(ScriptedAgent::new());
        let _dyn_agent: Arc<dyn InteractiveAgent> = scripted.clone();

        let probe = Credentials::none()
            .with(CredentialSample::InteractivePrompt)
            .with(CredentialSample::Passphrase(b"s1".to_vec()));
        assert!(handle.check_credentials(&probe));
        assert!(!handle.check_credentials(&Credentials::from_passphrase(b"nope")));

        // Probing neither unlocked the container nor consulted the agent.
        assert!(handle.is_locked());
        assert_eq!(scripted.total_calls(), 0);
    }

    #[test]
    fn cached_blob_invalidated_by_version_bump() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();

        let first = handle.encoded_blob().unwrap();
        let again = handle.encoded_blob().unwrap();
        assert_eq!(first, again);

        handle.common.invalidate_blob();
        // The cache must not serve the stale encoding's version; a fresh
        // encode is produced (bytes may or may not differ, the stamp must).
        let version = handle.common.version();
        let _fresh = handle.encoded_blob().unwrap();
        assert_eq!(handle.cached.as_ref().unwrap().version, version);
    }

    #[test]
    fn reestablish_uses_cached_secret() {
        let registry = test_registry();
        let mut handle =
            ContainerHandle::create(&registry, "login", TrustDomain::User, b"s1", "apps:login")
                .unwrap();
        handle.lock();
        assert!(handle.reestablish().unwrap());
        assert!(!handle.is_locked());
    }
}

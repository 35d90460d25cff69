//! Shared per-container state.
//!
//! One [`ContainerCommon`] exists per distinct (session, identity) pair —
//! the registry deduplicates — and every handle to that container delegates
//! its secret-dependent work here. It owns the [`CryptoCore`], the lock
//! flag, the sticky persisted parameters, the idle deadline, and the
//! version stamp that invalidates cached blob encodings.
//!
//! # The two-mutex rule
//!
//! Each container carries two locks: the **state mutex** guarding lock
//! state, crypto material, and parameters, and the **UI mutex** serializing
//! interactive prompts. A thread must never hold both at once. The correct
//! shape is: release the state mutex, take the UI mutex, interact, release
//! it, re-take the state mutex, and re-check what changed while you were
//! away — another thread may have unlocked, or the auto-lock timer may have
//! fired. [`TrackedMutex`] records its owner so debug builds assert the
//! rule at every acquisition.
//!
//! Prompt cancellation rides on the **lock epoch**: `lock()` bumps it, and
//! any interaction that began under an older epoch is abandoned when it
//! re-checks. Once `lock()` returns, no secret-dependent operation started
//! before the call can complete successfully.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::acl::AclState;
use crate::blob::{ContainerBlob, ContainerParams, FORMAT_CURRENT, SIGNATURE_LEN};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::secrets::{CryptoCore, MasterSecret, open_envelope};

/// Stable identity of a container: its logical name plus the random
/// signature minted at creation and carried in the persisted blob.
///
/// Equality over both fields is the registry's deduplication key. The `Ord`
/// impl defines the canonical cross-container lock order used by recoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerIdentity {
    pub name: String,
    pub signature: [u8; SIGNATURE_LEN],
}

impl ContainerIdentity {
    pub fn new(name: impl Into<String>, signature: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            name: name.into(),
            signature,
        }
    }
}

impl std::fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Which trust domain a container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDomain {
    /// Ordinary per-user container.
    User,
    /// Protected system container: unlocks via key file, never prompts for
    /// its passphrase, and privileged edits require explicit confirmation.
    System,
}

// ---------------------------------------------------------------------------
// Owner-tracked mutex
// ---------------------------------------------------------------------------

fn current_thread_token() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    // Reserve 0 as the "unowned" sentinel.
    hasher.finish() | 1
}

/// A mutex that remembers which thread holds it, so the two-mutex rule can
/// be asserted in debug builds.
pub(crate) struct TrackedMutex<T> {
    inner: Mutex<T>,
    owner: AtomicU64,
}

impl<T> TrackedMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> TrackedGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.owner.store(current_thread_token(), Ordering::Relaxed);
        TrackedGuard {
            guard,
            owner: &self.owner,
        }
    }

    pub(crate) fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_token()
    }
}

pub(crate) struct TrackedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a AtomicU64,
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Relaxed);
    }
}

impl<T> std::ops::Deref for TrackedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for TrackedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ---------------------------------------------------------------------------
// Container state
// ---------------------------------------------------------------------------

/// Everything the state mutex guards.
pub(crate) struct CommonState {
    pub(crate) locked: bool,
    pub(crate) core: CryptoCore,
    pub(crate) params: ContainerParams,
    /// Parameters are captured from the blob on first unlock only and
    /// sticky afterwards.
    pub(crate) params_captured: bool,
    pub(crate) idle_deadline: Option<Instant>,
    /// Authoritative wrapped operational-secret envelope. Empty until the
    /// container has been created or unlocked once.
    pub(crate) sealed_secret: Vec<u8>,
    /// Raw encoded ACL bytes, decoded lazily into `acl`.
    pub(crate) public_acl: Vec<u8>,
    pub(crate) acl: AclState,
    pub(crate) format: u32,
    /// Declared source of an in-progress key migration into this container.
    pub(crate) migration_source: Option<ContainerIdentity>,
}

/// Shared crypto/lock state for one container identity within a session.
pub struct ContainerCommon {
    identity: ContainerIdentity,
    domain: TrustDomain,
    default_system: bool,
    state: TrackedMutex<CommonState>,
    ui: TrackedMutex<()>,
    version: AtomicU64,
    lock_epoch: AtomicU64,
    events: EventBus,
    default_idle: Duration,
}

impl ContainerCommon {
    pub(crate) fn new(
        identity: ContainerIdentity,
        domain: TrustDomain,
        default_system: bool,
        seed_format: Option<u32>,
        default_idle: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            identity,
            domain,
            default_system,
            state: TrackedMutex::new(CommonState {
                locked: true,
                core: CryptoCore::new(),
                params: ContainerParams {
                    idle_timeout: default_idle,
                    ..ContainerParams::default()
                },
                params_captured: false,
                idle_deadline: None,
                sealed_secret: Vec::new(),
                public_acl: Vec::new(),
                acl: AclState::Uninstantiated,
                format: seed_format.unwrap_or(FORMAT_CURRENT),
                migration_source: None,
            }),
            ui: TrackedMutex::new(()),
            version: AtomicU64::new(1),
            lock_epoch: AtomicU64::new(0),
            events,
            default_idle,
        }
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.identity
    }

    pub fn domain(&self) -> TrustDomain {
        self.domain
    }

    pub fn is_default_system(&self) -> bool {
        self.default_system
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current blob version stamp. A cached encoding tagged with an older
    /// stamp is stale.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Bump the version stamp, invalidating every cached blob encoding.
    pub fn invalidate_blob(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn lock_epoch(&self) -> u64 {
        self.lock_epoch.load(Ordering::SeqCst)
    }

    /// Acquire the state mutex. Debug builds enforce the two-mutex rule.
    pub(crate) fn state(&self) -> TrackedGuard<'_, CommonState> {
        debug_assert!(
            !self.ui.held_by_current_thread(),
            "state mutex acquired while holding the UI mutex"
        );
        self.state.lock()
    }

    /// Acquire the UI mutex. Debug builds enforce the two-mutex rule.
    pub(crate) fn ui_lock(&self) -> TrackedGuard<'_, ()> {
        debug_assert!(
            !self.state.held_by_current_thread(),
            "UI mutex acquired while holding the state mutex"
        );
        self.ui.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    // -- Unlock / lock ------------------------------------------------------

    /// Attempt to unlock with the master secret already established in the
    /// crypto core. Re-entrant unlock is a no-op success; a missing master
    /// secret or a cryptographic mismatch is `Ok(false)`.
    pub fn unlock(&self, blob: &ContainerBlob) -> Result<bool> {
        let master = {
            let st = self.state();
            if !st.locked {
                return Ok(true);
            }
            match st.core.master() {
                Some(m) => m.clone(),
                None => {
                    tracing::debug!(container = %self.identity, "unlock without master secret");
                    return Ok(false);
                }
            }
        };
        self.try_unlock_with_master(blob, master)
    }

    /// Attempt to unlock with an explicit candidate master secret. On
    /// success the candidate becomes the established master.
    pub(crate) fn try_unlock_with_master(
        &self,
        blob: &ContainerBlob,
        master: MasterSecret,
    ) -> Result<bool> {
        if blob.signature != self.identity.signature {
            return Err(EngineError::MalformedBlob {
                reason: "blob signature does not match container identity".into(),
            });
        }

        {
            let mut st = self.state();
            let st = &mut *st;
            if !st.locked {
                return Ok(true);
            }

            let envelope = if st.sealed_secret.is_empty() {
                &blob.sealed_secret
            } else {
                &st.sealed_secret
            };
            let Some(operational) = open_envelope(&master, envelope)? else {
                tracing::debug!(container = %self.identity, "unlock failed: wrong secret");
                return Ok(false);
            };

            st.core.set_master(master);
            st.core.install_operational(operational)?;
            st.locked = false;

            if st.sealed_secret.is_empty() {
                st.sealed_secret = blob.sealed_secret.clone();
            }
            if st.public_acl.is_empty() {
                st.public_acl = blob.public_acl.clone();
            }
            st.format = blob.format;

            if !st.params_captured {
                st.params = blob.params;
                st.params_captured = true;
            }
            st.idle_deadline = idle_deadline_from(st.params.idle_timeout);
        }

        tracing::info!(container = %self.identity, "container unlocked");
        self.events.publish(EngineEvent::Unlocked {
            container: self.identity.name.clone(),
            at: Utc::now(),
        });
        Ok(true)
    }

    /// Lock the container. Idempotent: locking a locked container does
    /// nothing and emits nothing. Exactly one `Locked` event per
    /// unlocked→locked transition.
    pub fn lock(&self) {
        {
            let mut st = self.state();
            if st.locked {
                return;
            }
            st.locked = true;
            st.core.invalidate();
            st.acl = AclState::Uninstantiated;
            st.idle_deadline = None;
        }
        self.lock_epoch.fetch_add(1, Ordering::SeqCst);

        tracing::info!(container = %self.identity, "container locked");
        self.events.publish(EngineEvent::Locked {
            container: self.identity.name.clone(),
            at: Utc::now(),
        });
    }

    /// Record client activity: push the idle deadline out. No-op while
    /// locked.
    pub fn activity(&self) {
        let mut st = self.state();
        let st = &mut *st;
        if !st.locked {
            st.idle_deadline = idle_deadline_from(st.params.idle_timeout);
        }
    }

    /// Lock if the idle deadline has passed.
    pub(crate) fn sweep_idle(&self, now: Instant) {
        let expired = {
            let st = self.state();
            !st.locked && st.idle_deadline.is_some_and(|deadline| deadline <= now)
        };
        if expired {
            tracing::debug!(container = %self.identity, "idle timeout reached");
            self.lock();
        }
    }

    /// Whether a sleep-triggered lock-all should lock this container.
    pub(crate) fn locks_on_sleep(&self) -> bool {
        !self.default_system && self.state().params.lock_on_sleep
    }

    // -- Migration ----------------------------------------------------------

    /// Declare `source` as the origin of an in-progress key migration into
    /// this container. Recoding refuses foreign keys from anywhere else.
    pub fn begin_migration(&self, source: ContainerIdentity) {
        self.state().migration_source = Some(source);
    }

    pub fn end_migration(&self) {
        self.state().migration_source = None;
    }

    pub fn migration_source(&self) -> Option<ContainerIdentity> {
        self.state().migration_source.clone()
    }

    // -- Snapshots for the handle layer -------------------------------------

    /// The authoritative secret envelope, if one has been captured.
    pub(crate) fn envelope_snapshot(&self) -> Option<Vec<u8>> {
        let st = self.state();
        if st.sealed_secret.is_empty() {
            None
        } else {
            Some(st.sealed_secret.clone())
        }
    }

    pub(crate) fn master_snapshot(&self) -> Option<MasterSecret> {
        self.state().core.master().cloned()
    }

    /// Run `f` with the operational secret, under the state mutex for the
    /// whole duration.
    pub(crate) fn with_operational<T>(
        &self,
        f: impl FnOnce(&[u8; crate::crypto::KEY_LEN]) -> Result<T>,
    ) -> Result<T> {
        let st = self.state();
        let key = st.core.operational(&self.identity.name)?;
        f(key)
    }

    // -- Blob encoding ------------------------------------------------------

    /// Encode the container's current persisted form. Always reflects the
    /// latest ACL content: an instantiated, changed ACL is re-encoded and
    /// becomes the new stored section.
    pub fn encode_blob(&self) -> Result<Vec<u8>> {
        let mut st = self.state();
        let st = &mut *st;
        if st.sealed_secret.is_empty() {
            return Err(EngineError::Internal(
                "container has no secret envelope to persist".into(),
            ));
        }

        if let AclState::Instantiated(acl) = &mut st.acl
            && acl.changed()
        {
            st.public_acl = acl.encode();
            acl.clear_changed();
        }

        let blob = ContainerBlob {
            format: FORMAT_CURRENT,
            signature: self.identity.signature,
            params: st.params,
            public_acl: st.public_acl.clone(),
            sealed_secret: st.sealed_secret.clone(),
        };
        Ok(blob.encode())
    }
}

fn idle_deadline_from(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, SALT_LEN};
    use crate::secrets::seal_envelope;

    fn test_common(events: EventBus) -> (ContainerCommon, ContainerBlob, MasterSecret) {
        let signature = crypto::random_array().unwrap();
        let salt = crypto::random_array::<SALT_LEN>().unwrap();
        let master = MasterSecret::derive(b"passphrase", &salt);
        let operational = crypto::random_array().unwrap();
        let sealed = seal_envelope(&master, &salt, &operational).unwrap();

        let blob = ContainerBlob {
            format: FORMAT_CURRENT,
            signature,
            params: ContainerParams {
                idle_timeout: Duration::from_secs(60),
                lock_on_sleep: true,
            },
            public_acl: Vec::new(),
            sealed_secret: sealed,
        };

        let common = ContainerCommon::new(
            ContainerIdentity::new("test", signature),
            TrustDomain::User,
            false,
            Some(blob.format),
            Duration::from_secs(300),
            events,
        );
        (common, blob, master)
    }

    #[test]
    fn unlock_roundtrip_and_reject() {
        let (common, blob, master) = test_common(EventBus::new());

        assert!(common.try_unlock_with_master(&blob, master).unwrap());
        assert!(!common.is_locked());

        common.lock();
        assert!(common.is_locked());

        let salt = crate::secrets::envelope_salt(&blob.sealed_secret).unwrap();
        let wrong = MasterSecret::derive(b"not it", &salt);
        assert!(!common.try_unlock_with_master(&blob, wrong).unwrap());
        assert!(common.is_locked());
    }

    #[test]
    fn reentrant_unlock_is_noop_success() {
        let (common, blob, master) = test_common(EventBus::new());
        assert!(common.try_unlock_with_master(&blob, master).unwrap());

        // A second unlock with an arbitrary candidate succeeds untried.
        let junk = MasterSecret::from_key([0u8; 32]);
        assert!(common.try_unlock_with_master(&blob, junk).unwrap());
    }

    #[test]
    fn lock_is_idempotent_with_single_event() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let (common, blob, master) = test_common(bus);

        common.try_unlock_with_master(&blob, master).unwrap();
        common.lock();
        common.lock();
        common.lock();

        let locked_events = rx
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::Locked { .. }))
            .count();
        assert_eq!(locked_events, 1);
    }

    #[test]
    fn params_capture_is_sticky() {
        let (common, blob, master) = test_common(EventBus::new());
        common
            .try_unlock_with_master(&blob, master.clone())
            .unwrap();
        assert_eq!(
            common.state().params.idle_timeout,
            Duration::from_secs(60)
        );

        common.lock();

        // Unlock again with different persisted parameters: the captured
        // ones win.
        let mut altered = blob.clone();
        altered.params.idle_timeout = Duration::from_secs(9999);
        common.try_unlock_with_master(&altered, master).unwrap();
        assert_eq!(
            common.state().params.idle_timeout,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn invalidate_blob_bumps_version() {
        let (common, _, _) = test_common(EventBus::new());
        let before = common.version();
        common.invalidate_blob();
        assert!(common.version() > before);
    }

    #[test]
    fn sweep_idle_locks_after_deadline() {
        let (common, blob, master) = test_common(EventBus::new());
        common.try_unlock_with_master(&blob, master).unwrap();

        // A sweep "now" does nothing; a sweep past the deadline locks.
        common.sweep_idle(Instant::now());
        assert!(!common.is_locked());

        common.sweep_idle(Instant::now() + Duration::from_secs(3600));
        assert!(common.is_locked());
    }

    #[test]
    fn activity_pushes_deadline_out() {
        let (common, blob, master) = test_common(EventBus::new());
        common.try_unlock_with_master(&blob, master).unwrap();

        let first = common.state().idle_deadline;
        std::thread::sleep(Duration::from_millis(10));
        common.activity();
        let second = common.state().idle_deadline;
        assert!(second > first);
    }

    #[test]
    fn lock_bumps_epoch() {
        let (common, blob, master) = test_common(EventBus::new());
        common.try_unlock_with_master(&blob, master).unwrap();
        let epoch = common.lock_epoch();
        common.lock();
        assert!(common.lock_epoch() > epoch);
    }

    #[test]
    fn signature_mismatch_is_structural() {
        let (common, mut blob, master) = test_common(EventBus::new());
        blob.signature = crypto::random_array().unwrap();
        assert!(matches!(
            common.try_unlock_with_master(&blob, master),
            Err(EngineError::MalformedBlob { .. })
        ));
    }

    #[test]
    fn tracked_mutex_knows_its_owner() {
        let mutex = TrackedMutex::new(0u32);
        assert!(!mutex.held_by_current_thread());
        {
            let _guard = mutex.lock();
            assert!(mutex.held_by_current_thread());
        }
        assert!(!mutex.held_by_current_thread());
    }
}

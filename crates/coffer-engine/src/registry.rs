//! Session-scoped container registry.
//!
//! One [`ContainerRegistry`] exists per session. It owns the identity →
//! [`ContainerCommon`] map that deduplicates shared state: two handles
//! opened against the same (name, signature) pair always resolve to the
//! same instance, no matter how they raced. The map is a [`DashMap`], whose
//! sharded reader/writer locking gives cheap lookups and an atomic
//! insert-on-miss — a racing creator simply observes the winner's instance
//! and discards its own.
//!
//! The registry is also where session-wide lifecycle lives: the idle sweep,
//! the sleep/lock-all broadcast, and the final drain when the session ends.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::container::{ContainerCommon, ContainerIdentity, TrustDomain};
use crate::events::EventBus;
use crate::syskey::SystemKeyDir;

/// Process-wide registry of live containers for one session.
pub struct ContainerRegistry {
    config: EngineConfig,
    events: EventBus,
    system_keys: SystemKeyDir,
    map: DashMap<ContainerIdentity, Arc<ContainerCommon>>,
}

impl ContainerRegistry {
    /// Initialize a session registry from configuration.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let system_keys = SystemKeyDir::new(config.system_key_dir.clone());
        Arc::new(Self {
            config,
            events: EventBus::new(),
            system_keys,
            map: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn system_keys(&self) -> &SystemKeyDir {
        &self.system_keys
    }

    /// Find the shared state for `identity`, creating it on first open.
    ///
    /// The entry API re-checks under the shard's write lock, so concurrent
    /// first opens of the same identity converge on one instance.
    pub fn find_or_create(
        &self,
        identity: ContainerIdentity,
        domain: TrustDomain,
        seed_format: Option<u32>,
    ) -> Arc<ContainerCommon> {
        let entry = self.map.entry(identity.clone()).or_insert_with(|| {
            let default_system = domain == TrustDomain::System
                && identity.name == self.config.default_system_container;
            tracing::debug!(container = %identity, ?domain, "container state created");
            Arc::new(ContainerCommon::new(
                identity,
                domain,
                default_system,
                seed_format,
                self.config.default_idle_timeout(),
                self.events.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Look up shared state without creating it.
    pub fn get(&self, identity: &ContainerIdentity) -> Option<Arc<ContainerCommon>> {
        self.map.get(identity).map(|e| Arc::clone(e.value()))
    }

    /// Drop the registry's reference if nothing else holds one and the
    /// container is locked. Returns whether an entry was removed.
    pub fn remove_if_unreferenced(&self, identity: &ContainerIdentity) -> bool {
        let removed = self
            .map
            .remove_if(identity, |_, common| {
                Arc::strong_count(common) == 1 && common.is_locked()
            })
            .is_some();
        if removed {
            tracing::debug!(container = %identity, "container state released");
        }
        removed
    }

    /// Lock every container. A sleep-triggered broadcast skips the default
    /// system container and containers whose persisted parameters opt out
    /// of sleep locking; an explicit lock-all spares nothing.
    pub fn lock_all(&self, for_sleep: bool) {
        let containers: Vec<_> = self.map.iter().map(|e| Arc::clone(e.value())).collect();
        for common in containers {
            if for_sleep && !common.locks_on_sleep() {
                continue;
            }
            common.lock();
            self.remove_if_unreferenced(common.identity());
        }
    }

    /// Lock every container whose idle deadline has passed.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let containers: Vec<_> = self.map.iter().map(|e| Arc::clone(e.value())).collect();
        for common in containers {
            common.sweep_idle(now);
            self.remove_if_unreferenced(common.identity());
        }
    }

    /// End-of-session teardown: lock everything and clear the map.
    pub fn drain(&self) {
        self.lock_all(false);
        self.map.clear();
        tracing::info!("container registry drained");
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn test_registry() -> Arc<ContainerRegistry> {
        ContainerRegistry::new(EngineConfig::default())
    }

    fn identity(name: &str) -> ContainerIdentity {
        ContainerIdentity::new(name, [7u8; 16])
    }

    #[test]
    fn same_identity_resolves_to_same_instance() {
        let registry = test_registry();
        let a = registry.find_or_create(identity("login"), TrustDomain::User, None);
        let b = registry.find_or_create(identity("login"), TrustDomain::User, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_signature_is_a_different_container() {
        let registry = test_registry();
        let a = registry.find_or_create(identity("login"), TrustDomain::User, None);
        let other = ContainerIdentity::new("login", crypto::random_array().unwrap());
        let b = registry.find_or_create(other, TrustDomain::User, None);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_first_open_converges() {
        let registry = test_registry();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.find_or_create(identity("raced"), TrustDomain::User, None)
            }));
        }
        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_requires_locked_and_unreferenced() {
        let registry = test_registry();
        let common = registry.find_or_create(identity("x"), TrustDomain::User, None);

        // Still referenced by `common`.
        assert!(!registry.remove_if_unreferenced(&identity("x")));

        drop(common);
        // Unreferenced and locked (fresh containers start locked).
        assert!(registry.remove_if_unreferenced(&identity("x")));
        assert!(registry.is_empty());
    }

    #[test]
    fn sleep_lock_spares_default_system_container() {
        let mut config = EngineConfig::default();
        config.default_system_container = "System".into();
        let registry = ContainerRegistry::new(config);

        let system = registry.find_or_create(
            ContainerIdentity::new("System", [1u8; 16]),
            TrustDomain::System,
            None,
        );
        assert!(system.is_default_system());
        assert!(!system.locks_on_sleep());

        let user = registry.find_or_create(
            ContainerIdentity::new("login", [2u8; 16]),
            TrustDomain::User,
            None,
        );
        assert!(user.locks_on_sleep());
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = test_registry();
        let _a = registry.find_or_create(identity("a"), TrustDomain::User, None);
        let _b = registry.find_or_create(
            ContainerIdentity::new("b", [9u8; 16]),
            TrustDomain::User,
            None,
        );
        assert_eq!(registry.len(), 2);

        registry.drain();
        assert!(registry.is_empty());
    }
}

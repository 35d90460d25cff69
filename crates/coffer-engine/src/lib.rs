//! Coffer engine: encrypted keychain containers, ACL evaluation, and key
//! recoding.
//!
//! This crate is the core of Coffer, a local secrets store. It manages
//! encrypted credential containers, derives and caches the cryptographic
//! material protecting them, and gates every use of a stored secret
//! through an ACL evaluator tied to the identity of the requesting
//! process. Platform concerns — code-signature verification, prompt
//! delivery, secure key-stores — stay behind the traits in [`agent`].
//!
//! # Modules
//!
//! - [`crypto`] — AES-256-GCM sealing and PBKDF2 derivation via `ring`.
//! - [`secrets`] — master/operational secrets and the wrapped envelope.
//! - [`blob`] — the persisted container format.
//! - [`registry`] — session-scoped deduplication of shared container state.
//! - [`container`] — per-container lock/crypto state and the two-mutex rule.
//! - [`handle`] — client handles and the credential-establishment protocol.
//! - [`acl`] — the authorization model and evaluation engine.
//! - [`prompt`] — the interactive trust-gate subject.
//! - [`partition`] — the partition co-ownership subject and its extension.
//! - [`keyblob`] — per-key encode/decode and cross-container recoding.
//! - [`agent`] — collaborator interfaces (process identity, prompts,
//!   key-stores).
//! - [`syskey`] — system-domain unlock key files.
//! - [`events`] — the engine event bus.
//! - [`config`] — session configuration.
//! - [`error`] — the unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coffer_engine::agent::{Caller, InteractiveAgent, ScriptedAgent, StaticProcess};
//! use coffer_engine::acl::AclOp;
//! use coffer_engine::handle::{ContainerHandle, Credentials};
//! use coffer_engine::registry::ContainerRegistry;
//! use coffer_engine::container::TrustDomain;
//! use coffer_engine::EngineConfig;
//!
//! # fn example() -> coffer_engine::Result<()> {
//! let registry = ContainerRegistry::new(EngineConfig::default());
//! let agent: Arc<dyn InteractiveAgent> = Arc::new(ScriptedAgent::new());
//!
//! // Create a container and lock it again.
//! let mut handle = ContainerHandle::create(
//!     &registry, "login", TrustDomain::User, b"passphrase", "apps:demo",
//! )?;
//! handle.lock();
//!
//! // Re-establish the secret from explicit credentials and use it.
//! handle.establish_old_secret(&Credentials::from_passphrase(b"passphrase"), &agent)?;
//! let caller = Caller::new(Arc::new(StaticProcess::signed("apps:demo")));
//! handle.validate(AclOp::Decrypt, &Credentials::none(), &caller, &agent, false)?;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod agent;
pub mod blob;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handle;
pub mod keyblob;
pub mod partition;
pub mod prompt;
pub mod registry;
pub mod secrets;
pub mod syskey;

// Re-export the types most callers touch.
pub use acl::{Acl, AclEngine, AclOp, AclValidation};
pub use agent::{Caller, InteractiveAgent, ProcessOracle, SecureKeyStore};
pub use config::EngineConfig;
pub use container::{ContainerCommon, ContainerIdentity, TrustDomain};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use handle::{ContainerHandle, CredentialSample, Credentials};
pub use registry::ContainerRegistry;

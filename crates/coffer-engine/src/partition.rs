//! Partition co-ownership subject and the extension path.
//!
//! A partition entry never matches during ordinary evaluation — it is pure
//! storage for the list of partition identifiers (process trust-group tags)
//! allowed to use the container's keys. The ACL engine reads it through a
//! side channel, and this module implements the one way the list grows:
//! the caller asks the container's own prompt subject for permission under
//! the partition-extension authorization tag, and on approval its
//! identifier is appended.
//!
//! The extension only works against a standard-shaped ACL — a threshold
//! entry whose last child is a prompt subject. Anything else fails closed.

use std::sync::Arc;

use chrono::Utc;

use crate::acl::{AclSubject, ensure_instantiated};
use crate::agent::{Caller, InteractiveAgent};
use crate::blob::{ByteReader, put_string, put_u32};
use crate::config::EngineConfig;
use crate::container::ContainerCommon;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::prompt::{self, PromptContext, PromptSubject};

/// Stored list of partition identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionSubject {
    pub partitions: Vec<String>,
}

impl PartitionSubject {
    pub fn contains(&self, partition_id: &str) -> bool {
        self.partitions.iter().any(|p| p == partition_id)
    }

    /// Serialize the payload (the subject tag and version byte are written
    /// by the ACL codec).
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        put_u32(out, self.partitions.len() as u32);
        for partition in &self.partitions {
            put_string(out, partition);
        }
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.u32("partition count")? as usize;
        let mut partitions = Vec::with_capacity(count);
        for _ in 0..count {
            partitions.push(r.string("partition id")?);
        }
        Ok(Self { partitions })
    }
}

/// Locate the prompt subject of a standard-shaped ACL: a threshold entry
/// whose last child is a prompt.
fn standard_prompt(entries: &[crate::acl::AclEntry]) -> Option<PromptSubject> {
    entries.iter().find_map(|entry| match &entry.subject {
        AclSubject::Threshold(t) => match t.subjects.last() {
            Some(AclSubject::Prompt(p)) => Some(p.clone()),
            _ => None,
        },
        _ => None,
    })
}

/// Ask the container's own prompt subject whether the caller's partition
/// identifier may join the list. Returns `Ok(true)` when the list was
/// extended. Fails closed — `Ok(false)` — when no standard-shaped ACL
/// exists, the user declines, or the container locked while the question
/// was pending.
pub(crate) fn extend(
    container: &Arc<ContainerCommon>,
    caller: &Caller,
    agent: &Arc<dyn InteractiveAgent>,
    config: &EngineConfig,
    epoch0: u64,
) -> Result<bool> {
    let name = container.identity().name.clone();

    let subject = {
        let mut st = container.state();
        if st.locked || container.lock_epoch() != epoch0 {
            return Ok(false);
        }
        let acl = ensure_instantiated(&mut st, &name)?;
        match standard_prompt(&acl.entries) {
            Some(subject) => subject,
            None => {
                tracing::debug!(container = %name, "partition extension failed closed: no standard ACL shape");
                return Ok(false);
            }
        }
    };

    let ctx = PromptContext {
        container: &name,
        domain: container.domain(),
        reason: crate::acl::AclOp::PartitionId.describe(),
    };
    let verdict = prompt::evaluate(&subject, &ctx, caller, agent, config, container, epoch0);
    if !verdict.allowed {
        return Ok(false);
    }

    let mut st = container.state();
    if st.locked || container.lock_epoch() != epoch0 {
        tracing::debug!(container = %name, "partition extension abandoned: container locked");
        return Ok(false);
    }
    let acl = ensure_instantiated(&mut st, &name)?;

    let id = caller.oracle().partition_id();
    if acl.partition().is_some() {
        if let Some(p) = acl.partition_mut()
            && !p.contains(&id)
        {
            p.partitions.push(id.clone());
        }
    } else {
        acl.install_partition(vec![id.clone()]);
    }
    acl.mark_changed();
    container.invalidate_blob();
    container.events().publish(EngineEvent::AclChanged {
        container: name.clone(),
        at: Utc::now(),
    });
    tracing::info!(container = %name, partition = %id, "partition list extended");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Acl, AclEntry, AclOpSet, ThresholdSubject};

    #[test]
    fn payload_codec_roundtrip() {
        let subject = PartitionSubject {
            partitions: vec!["apps:mail".into(), "teamid:ABC123".into()],
        };
        let mut bytes = Vec::new();
        subject.encode_into(&mut bytes);
        let decoded = PartitionSubject::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, subject);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let subject = PartitionSubject::default();
        let mut bytes = Vec::new();
        subject.encode_into(&mut bytes);
        let decoded = PartitionSubject::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert!(decoded.partitions.is_empty());
    }

    #[test]
    fn standard_prompt_found_in_standard_acl() {
        let acl = Acl::standard("login", "apps:login");
        assert!(standard_prompt(&acl.entries).is_some());
    }

    #[test]
    fn standard_prompt_requires_prompt_as_last_child() {
        // Threshold whose last child is not a prompt: not standard-shaped.
        let acl = Acl::new(vec![AclEntry {
            tag: "default".into(),
            ops: AclOpSet::all(),
            subject: AclSubject::Threshold(ThresholdSubject {
                required: 1,
                subjects: vec![
                    AclSubject::Prompt(PromptSubject::new("x")),
                    AclSubject::Any,
                ],
            }),
        }]);
        assert!(standard_prompt(&acl.entries).is_none());

        let bare = Acl::new(vec![AclEntry {
            tag: "default".into(),
            ops: AclOpSet::all(),
            subject: AclSubject::Any,
        }]);
        assert!(standard_prompt(&bare.entries).is_none());
    }
}

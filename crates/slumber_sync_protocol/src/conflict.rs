//! Conflict detection and resolution.
//!
//! Resolution is last-write-wins on [`Version`]: the later `lastUpdated`
//! wins and an exact tie goes to the lexicographically greater `syncId`.
//! Both devices evaluate the same rule independently and converge on the
//! same winner without exchanging extra messages.

use crate::entity::{EntityKind, SyncRecord};
use crate::identity::{EntityId, EntityMeta, Version};

/// Anything that carries a version.
pub trait Versioned {
    /// Current version.
    fn version(&self) -> Version;
}

impl Versioned for Version {
    fn version(&self) -> Version {
        self.clone()
    }
}

impl Versioned for EntityMeta {
    fn version(&self) -> Version {
        EntityMeta::version(self)
    }
}

impl Versioned for SyncRecord {
    fn version(&self) -> Version {
        self.meta().version()
    }
}

/// Which copy of an entity survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictResolution {
    /// Keep the local copy; no write.
    KeepLocal,
    /// Write the remote copy.
    AcceptRemote,
}

impl ConflictResolution {
    /// Returns true if the store must be written.
    pub fn requires_write(&self) -> bool {
        matches!(self, ConflictResolution::AcceptRemote)
    }
}

/// Decides between a local and a remote copy of one entity.
///
/// Returns `None` only when neither side has the entity. Identical
/// versions keep the local copy, so re-applying a payload never writes.
pub fn resolve<V: Versioned + ?Sized>(
    local: Option<&V>,
    remote: Option<&V>,
) -> Option<ConflictResolution> {
    match (local, remote) {
        (None, None) => None,
        (Some(_), None) => Some(ConflictResolution::KeepLocal),
        (None, Some(_)) => Some(ConflictResolution::AcceptRemote),
        (Some(local), Some(remote)) => {
            if remote.version() > local.version() {
                Some(ConflictResolution::AcceptRemote)
            } else {
                Some(ConflictResolution::KeepLocal)
            }
        }
    }
}

/// Two divergent copies of one entity and how they were settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Entity identity.
    pub entity_id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Version held locally.
    pub local: Version,
    /// Version received from the peer.
    pub remote: Version,
    /// Outcome.
    pub resolution: ConflictResolution,
}

impl Conflict {
    /// Compares two copies of the same entity.
    ///
    /// Returns `None` when the versions are identical.
    pub fn detect(local: &SyncRecord, remote: &SyncRecord) -> Option<Self> {
        let local_version = local.version();
        let remote_version = remote.version();
        if local_version == remote_version {
            return None;
        }
        let resolution = resolve(Some(local), Some(remote))?;
        Some(Self {
            entity_id: remote.id(),
            kind: remote.kind(),
            local: local_version,
            remote: remote_version,
            resolution,
        })
    }

    /// Returns true if both copies were edited at the same instant.
    pub fn is_tie(&self) -> bool {
        self.local.last_updated == self.remote.last_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SyncId;
    use proptest::prelude::*;
    use slumber_codec::Timestamp;

    fn version(millis: i64, sync_id: &str) -> Version {
        Version {
            last_updated: Timestamp::from_millis(millis),
            sync_id: SyncId::new(sync_id),
        }
    }

    #[test]
    fn one_sided_entity_wins() {
        let v = version(1, "a");
        assert_eq!(
            resolve(Some(&v), None),
            Some(ConflictResolution::KeepLocal)
        );
        assert_eq!(
            resolve(None, Some(&v)),
            Some(ConflictResolution::AcceptRemote)
        );
        assert_eq!(resolve::<Version>(None, None), None);
    }

    #[test]
    fn later_edit_wins() {
        let older = version(100, "zzz");
        let newer = version(200, "aaa");
        assert_eq!(
            resolve(Some(&older), Some(&newer)),
            Some(ConflictResolution::AcceptRemote)
        );
        assert_eq!(
            resolve(Some(&newer), Some(&older)),
            Some(ConflictResolution::KeepLocal)
        );
    }

    #[test]
    fn tie_goes_to_greater_sync_id() {
        let low = version(100, "a1");
        let high = version(100, "b2");
        assert_eq!(
            resolve(Some(&low), Some(&high)),
            Some(ConflictResolution::AcceptRemote)
        );
        assert_eq!(
            resolve(Some(&high), Some(&low)),
            Some(ConflictResolution::KeepLocal)
        );
    }

    #[test]
    fn identical_versions_do_not_write() {
        let v = version(100, "same");
        let outcome = resolve(Some(&v), Some(&v.clone())).unwrap();
        assert!(!outcome.requires_write());
    }

    #[test]
    fn detect_reports_tie() {
        use crate::records::UserPreferences;

        let local = UserPreferences::new(Timestamp::from_millis(500));
        let mut remote = local.clone();
        remote.meta.sync_id = SyncId::new("ffffffff");
        let local = SyncRecord::from(local);
        let conflict = Conflict::detect(&local, &SyncRecord::from(remote)).unwrap();
        assert!(conflict.is_tie());
        assert_eq!(conflict.entity_id, local.id());
        assert!(Conflict::detect(&local, &local.clone()).is_none());
    }

    fn winner(a: &Version, b: &Version) -> Version {
        match resolve(Some(a), Some(b)) {
            Some(ConflictResolution::AcceptRemote) => b.clone(),
            _ => a.clone(),
        }
    }

    proptest! {
        #[test]
        fn winner_independent_of_argument_order(
            t1 in 0i64..5,
            t2 in 0i64..5,
            s1 in "[a-f0-9]{1,4}",
            s2 in "[a-f0-9]{1,4}",
        ) {
            let a = version(t1, &s1);
            let b = version(t2, &s2);
            prop_assert_eq!(winner(&a, &b), winner(&b, &a));
        }
    }
}

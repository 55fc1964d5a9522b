//! Local identity cache
//!
//! Maps identity keys (document URLs, usernames) to the node ids the store
//! assigned them, so repeat sightings of an entity skip the lookup query.
//! The cache is shared by every uploader behind one mutex and is never
//! authoritative: duplicate repair invalidates a whole kind at a time.

use crate::schema::EntityKind;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A cached identity: the assigned node id and, for entities uploaded at
/// the top level, the digest of the content last written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    pub uid: String,
    pub digest: Option<String>,
}

#[derive(Debug, Default)]
struct Maps {
    users: HashMap<String, CachedIdentity>,
    documents: HashMap<String, CachedIdentity>,
}

impl Maps {
    fn of(&mut self, kind: EntityKind) -> &mut HashMap<String, CachedIdentity> {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Document => &mut self.documents,
        }
    }
}

/// Identity key to node id mappings shared by all uploaders
///
/// Best effort only: the store stays authoritative and entries may point at
/// nodes that have since been deleted. A single mutex guards both maps.
#[derive(Debug, Default)]
pub struct IdentityCache {
    maps: Mutex<Maps>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a cached identity
    ///
    /// # Arguments
    ///
    /// * `kind` - Which map to search; users and documents never collide
    /// * `key` - The entity's identity key
    ///
    /// # Returns
    ///
    /// The cached node id and content digest, or `None` on a miss
    pub fn get(&self, kind: EntityKind, key: &str) -> Option<CachedIdentity> {
        self.lock().of(kind).get(key).cloned()
    }

    /// Records `uid` for `key`
    ///
    /// Without a new digest, the previous digest survives only if the uid
    /// is unchanged.
    ///
    /// # Arguments
    ///
    /// * `kind` - Entity kind of `key`
    /// * `key` - The entity's identity key
    /// * `uid` - Node id assigned by the store
    /// * `digest` - Content digest of a top-level upload, `None` for nested entities
    pub fn remember(&self, kind: EntityKind, key: &str, uid: &str, digest: Option<String>) {
        let mut maps = self.lock();
        let map = maps.of(kind);
        let digest = match digest {
            Some(digest) => Some(digest),
            None => map
                .get(key)
                .filter(|cached| cached.uid == uid)
                .and_then(|cached| cached.digest.clone()),
        };
        map.insert(
            key.to_string(),
            CachedIdentity {
                uid: uid.to_string(),
                digest,
            },
        );
    }

    /// Drops every entry of one kind
    ///
    /// Called after duplicate nodes were deleted, since any cached entry of
    /// that kind may now name a node that no longer exists.
    ///
    /// # Arguments
    ///
    /// * `kind` - The map to clear
    pub fn invalidate(&self, kind: EntityKind) {
        let mut maps = self.lock();
        let map = maps.of(kind);
        if !map.is_empty() {
            tracing::debug!("invalidating {} cached {} ids", map.len(), kind.as_str());
        }
        map.clear();
    }

    /// Number of cached identities of one kind
    pub fn len(&self, kind: EntityKind) -> usize {
        self.lock().of(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        let mut maps = self.lock();
        maps.of(EntityKind::User).is_empty() && maps.of(EntityKind::Document).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_separate() {
        let cache = IdentityCache::new();
        cache.remember(EntityKind::User, "alice", "0x1", None);
        cache.remember(EntityKind::Document, "alice", "0x2", None);

        assert_eq!(cache.get(EntityKind::User, "alice").unwrap().uid, "0x1");
        assert_eq!(cache.get(EntityKind::Document, "alice").unwrap().uid, "0x2");

        cache.invalidate(EntityKind::User);
        assert!(cache.get(EntityKind::User, "alice").is_none());
        assert_eq!(cache.len(EntityKind::Document), 1);
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_digest_survives_uid_only_updates() {
        let cache = IdentityCache::new();
        cache.remember(EntityKind::Document, "http://s/1", "0x1", Some("abc".to_string()));
        cache.remember(EntityKind::Document, "http://s/1", "0x1", None);
        assert_eq!(
            cache.get(EntityKind::Document, "http://s/1").unwrap().digest.as_deref(),
            Some("abc")
        );

        // a different node means the old content is unknown
        cache.remember(EntityKind::Document, "http://s/1", "0x9", None);
        let cached = cache.get(EntityKind::Document, "http://s/1").unwrap();
        assert_eq!(cached.uid, "0x9");
        assert_eq!(cached.digest, None);
    }
}

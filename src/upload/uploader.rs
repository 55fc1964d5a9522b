//! Identity resolution and upsert
//!
//! For each entity the uploader validates the whole nested tree, resolves
//! the entity and everything it links to against the identity cache or the
//! store, and writes the result in a single commit-now mutation. Identities
//! that do not exist yet get blank labels whose assigned ids are cached
//! afterwards. Duplicate nodes found during a lookup are deleted on the spot.

use crate::pipeline::{Entity, EntityReceivers};
use crate::schema::{Document, EntityKind, User, ValidationError};
use crate::store::{GraphStore, Mutation, RetryPolicy, Vars};
use crate::upload::{CachedIdentity, DomainStats, IdentityCache, UploadError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const USER_UID_QUERY: &str = "query useruid($username: string) {
    users(func: eq(username, $username)) {
        uid
    }
}";

const DOC_UID_QUERY: &str = "query docuid($url: string) {
    docs(func: eq(url, $url)) {
        uid
    }
}";

/// Label used for the top-level entity when it has no node yet
const USER_LABEL: &str = "user";
const DOC_LABEL: &str = "doc";

type Resolving<'a> = Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + 'a>>;

/// What happened to one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Upserted; carries the entity's node id
    Stored { uid: String },
    /// Same content as the last upload and every identity was cached
    Unchanged { uid: String },
    /// Carried no graph information
    Skipped,
}

#[derive(Debug, Deserialize)]
struct UidRow {
    #[serde(default)]
    uid: String,
}

enum Found {
    Cached(CachedIdentity),
    Stored(String),
    Missing,
}

/// Per-entity resolution state
#[derive(Default)]
struct Resolution {
    /// Identity already handled in this entity, mapped to its uid or blank label
    visited: HashMap<(EntityKind, String), String>,
    /// Nested nodes created by this mutation: label to identity
    created: Vec<(String, EntityKind, String)>,
    /// Whether every identity so far came out of the cache
    all_cached: bool,
}

impl Resolution {
    fn new(all_cached: bool) -> Self {
        Self {
            all_cached,
            ..Default::default()
        }
    }

    fn blank_label(&mut self, kind: EntityKind, key: &str) -> String {
        let label = format!("n{}", self.created.len());
        self.created.push((label.clone(), kind, key.to_string()));
        format!("_:{}", label)
    }
}

/// Resolves identities and upserts entities into a [`GraphStore`]
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn GraphStore>,
    cache: Arc<IdentityCache>,
    stats: Arc<DomainStats>,
    retry: RetryPolicy,
}

impl Uploader {
    /// Creates an uploader
    ///
    /// Clones share `cache` and `stats`, so one uploader can be cloned into
    /// every worker task.
    ///
    /// # Arguments
    ///
    /// * `store` - Graph store to resolve against and write to
    /// * `cache` - Identity cache shared with the other workers
    /// * `stats` - Per-domain counters updated after each upsert
    /// * `retry` - Backoff applied to every store call
    pub fn new(
        store: Arc<dyn GraphStore>,
        cache: Arc<IdentityCache>,
        stats: Arc<DomainStats>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            stats,
            retry,
        }
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn stats(&self) -> &DomainStats {
        &self.stats
    }

    /// Uploads entities until both queues close or `cancel` fires
    ///
    /// Failures only drop the entity at hand; each one is logged with the
    /// entity's kind and identity key.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Shared cancellation token
    /// * `receivers` - The uploader side of the entity queues
    pub async fn run(&self, cancel: &CancellationToken, receivers: &EntityReceivers) {
        loop {
            let entity = tokio::select! {
                _ = cancel.cancelled() => break,
                entity = receivers.next() => match entity {
                    Some(entity) => entity,
                    None => break,
                },
            };

            let kind = entity.kind();
            let key = entity.identity_key().to_string();
            let result = match entity {
                Entity::User(user) => self.upload_user(cancel, user).await,
                Entity::Document(doc) => self.upload_document(cancel, doc).await,
            };

            match result {
                Ok(outcome) => tracing::trace!("{} {}: {:?}", kind.as_str(), key, outcome),
                Err(e) if e.is_cancelled() => break,
                Err(e) => tracing::warn!("failed to upload {} {:?}: {}", kind.as_str(), key, e),
            }
        }
    }

    /// Resolves and upserts a user together with the documents it likes
    ///
    /// A user without likes carries no graph information and is skipped
    /// without touching the store.
    ///
    /// # Arguments
    ///
    /// * `cancel` - Aborts retries and in-flight store calls
    /// * `user` - The user, with nested liked documents
    ///
    /// # Returns
    ///
    /// * `UploadOutcome::Stored` - the upsert was committed
    /// * `UploadOutcome::Unchanged` - identical to the last upload, nothing was sent
    /// * `UploadOutcome::Skipped` - the user has no likes
    ///
    /// # Errors
    ///
    /// * `UploadError::Validation` - a required field is missing anywhere in the tree
    /// * `UploadError::Store` - a lookup, cleanup or upsert failed after retries
    /// * `UploadError::MissingUid` - the store did not assign an id to the new node
    pub async fn upload_user(
        &self,
        cancel: &CancellationToken,
        mut user: User,
    ) -> Result<UploadOutcome, UploadError> {
        validate_user(&user)?;
        let key = user.username.clone();
        if user.likes.is_empty() {
            tracing::debug!("user {:?} has no likes, skipping", key);
            return Ok(UploadOutcome::Skipped);
        }

        let digest = digest(EntityKind::User, &key, &user)?;
        let (reference, mut resolution) = self
            .resolve_top(cancel, EntityKind::User, &key, USER_LABEL, &digest)
            .await?;
        user.uid = Some(reference.clone());

        for doc in user.likes.iter_mut() {
            self.resolve_document(cancel, doc, &mut resolution).await?;
        }

        if resolution.all_cached {
            tracing::debug!("user {:?} unchanged", key);
            return Ok(UploadOutcome::Unchanged { uid: reference });
        }

        let payload = encode(EntityKind::User, &key, &user)?;
        let uid = self
            .commit(
                cancel,
                EntityKind::User,
                &key,
                USER_LABEL,
                reference,
                payload,
                resolution,
                digest,
            )
            .await?;

        for url in &user.urls {
            self.stats.record(url);
        }
        Ok(UploadOutcome::Stored { uid })
    }

    /// Resolves and upserts a document together with the users who like it
    ///
    /// # Arguments
    ///
    /// * `cancel` - Aborts retries and in-flight store calls
    /// * `doc` - The document, optionally with nested users in `likes`
    ///
    /// # Returns
    ///
    /// `UploadOutcome::Stored` or `UploadOutcome::Unchanged`; documents are
    /// never skipped.
    ///
    /// # Errors
    ///
    /// Same as [`Uploader::upload_user`].
    pub async fn upload_document(
        &self,
        cancel: &CancellationToken,
        mut doc: Document,
    ) -> Result<UploadOutcome, UploadError> {
        validate_document(&doc)?;
        let key = doc.url.clone();

        let digest = digest(EntityKind::Document, &key, &doc)?;
        let (reference, mut resolution) = self
            .resolve_top(cancel, EntityKind::Document, &key, DOC_LABEL, &digest)
            .await?;
        doc.uid = Some(reference.clone());

        for user in doc.likes.iter_mut() {
            self.resolve_user(cancel, user, &mut resolution).await?;
        }

        if resolution.all_cached {
            tracing::debug!("document {:?} unchanged", key);
            return Ok(UploadOutcome::Unchanged { uid: reference });
        }

        let payload = encode(EntityKind::Document, &key, &doc)?;
        let uid = self
            .commit(
                cancel,
                EntityKind::Document,
                &key,
                DOC_LABEL,
                reference,
                payload,
                resolution,
                digest,
            )
            .await?;

        self.stats.record(&doc.url);
        Ok(UploadOutcome::Stored { uid })
    }

    /// Resolves the top-level identity to its uid, or to `_:label` when the
    /// store has no node for it yet
    async fn resolve_top(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        key: &str,
        label: &str,
        digest: &str,
    ) -> Result<(String, Resolution), UploadError> {
        let (reference, unchanged) = match self.lookup(cancel, kind, key).await? {
            Found::Cached(cached) => {
                let unchanged = cached.digest.as_deref() == Some(digest);
                (cached.uid, unchanged)
            }
            Found::Stored(uid) => (uid, false),
            Found::Missing => (format!("_:{}", label), false),
        };

        let mut resolution = Resolution::new(unchanged);
        resolution
            .visited
            .insert((kind, key.to_string()), reference.clone());
        Ok((reference, resolution))
    }

    fn resolve_document<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        doc: &'a mut Document,
        resolution: &'a mut Resolution,
    ) -> Resolving<'a> {
        Box::pin(async move {
            let first = self
                .resolve_nested(
                    cancel,
                    EntityKind::Document,
                    &doc.url,
                    &mut doc.uid,
                    resolution,
                )
                .await?;
            if first {
                for user in doc.likes.iter_mut() {
                    self.resolve_user(cancel, user, resolution).await?;
                }
            } else {
                // the first occurrence of this document carries its edges
                doc.likes.clear();
            }
            Ok(())
        })
    }

    fn resolve_user<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        user: &'a mut User,
        resolution: &'a mut Resolution,
    ) -> Resolving<'a> {
        Box::pin(async move {
            let first = self
                .resolve_nested(
                    cancel,
                    EntityKind::User,
                    &user.username,
                    &mut user.uid,
                    resolution,
                )
                .await?;
            if first {
                for doc in user.likes.iter_mut() {
                    self.resolve_document(cancel, doc, resolution).await?;
                }
            } else {
                user.likes.clear();
            }
            Ok(())
        })
    }

    /// Fills `uid` for a nested entity; returns false when the identity was
    /// already visited and its children must not be walked again
    async fn resolve_nested(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        key: &str,
        uid: &mut Option<String>,
        resolution: &mut Resolution,
    ) -> Result<bool, UploadError> {
        let visit = (kind, key.to_string());
        if let Some(reference) = resolution.visited.get(&visit) {
            *uid = Some(reference.clone());
            return Ok(false);
        }

        let reference = match self.lookup(cancel, kind, key).await? {
            Found::Cached(cached) => cached.uid,
            Found::Stored(found) => {
                resolution.all_cached = false;
                found
            }
            Found::Missing => {
                resolution.all_cached = false;
                resolution.blank_label(kind, key)
            }
        };

        resolution.visited.insert(visit, reference.clone());
        *uid = Some(reference);
        Ok(true)
    }

    /// Looks an identity up in the cache, then in the store
    ///
    /// Multiple store matches are a duplicate left by an earlier race: every
    /// match but the first is deleted and the cache for the kind is dropped.
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        key: &str,
    ) -> Result<Found, UploadError> {
        if let Some(cached) = self.cache.get(kind, key) {
            return Ok(Found::Cached(cached));
        }

        let (query, result_set) = match kind {
            EntityKind::User => (USER_UID_QUERY, "users"),
            EntityKind::Document => (DOC_UID_QUERY, "docs"),
        };
        let mut vars = Vars::new();
        vars.insert(format!("${}", kind.key_predicate()), key.to_string());

        let what = format!("lookup of {} {:?}", kind.as_str(), key);
        let data = self
            .retry
            .run(cancel, &what, || self.store.query(query, &vars))
            .await
            .map_err(|e| UploadError::store("lookup", kind, key, e))?;

        let rows: Vec<UidRow> = match data.get(result_set) {
            Some(rows) => serde_json::from_value(rows.clone()).map_err(|source| {
                UploadError::Encode {
                    kind: kind.as_str(),
                    key: key.to_string(),
                    source,
                }
            })?,
            None => Vec::new(),
        };

        let Some((first, extras)) = rows.split_first() else {
            return Ok(Found::Missing);
        };
        if first.uid.is_empty() {
            return Err(UploadError::InvalidUid {
                kind: kind.as_str(),
                key: key.to_string(),
            });
        }

        if !extras.is_empty() {
            self.repair(cancel, kind, key, extras).await?;
        }
        Ok(Found::Stored(first.uid.clone()))
    }

    async fn repair(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        key: &str,
        extras: &[UidRow],
    ) -> Result<(), UploadError> {
        let uids: Vec<&str> = extras
            .iter()
            .map(|row| row.uid.as_str())
            .filter(|uid| !uid.is_empty())
            .collect();
        tracing::warn!(
            "found {} duplicate {} nodes for {:?}, deleting {:?}",
            uids.len(),
            kind.as_str(),
            key,
            uids
        );

        self.cache.invalidate(kind);

        let payload = Value::Array(
            uids.iter()
                .map(|uid| serde_json::json!({ "uid": uid }))
                .collect(),
        );
        let what = format!("duplicate cleanup of {} {:?}", kind.as_str(), key);
        self.retry
            .run(cancel, &what, || self.store.mutate(Mutation::delete(payload.clone())))
            .await
            .map_err(|e| UploadError::store("duplicate cleanup", kind, key, e))?;
        Ok(())
    }

    /// Submits the upsert and caches every id it produced
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        cancel: &CancellationToken,
        kind: EntityKind,
        key: &str,
        label: &str,
        reference: String,
        payload: Value,
        resolution: Resolution,
        digest: String,
    ) -> Result<String, UploadError> {
        let what = format!("upsert of {} {:?}", kind.as_str(), key);
        let assigned = self
            .retry
            .run(cancel, &what, || self.store.mutate(Mutation::set(payload.clone())))
            .await
            .map_err(|e| UploadError::store("upsert", kind, key, e))?;

        let uid = if reference.starts_with("_:") {
            assigned
                .uids
                .get(label)
                .filter(|uid| !uid.is_empty())
                .cloned()
                .ok_or_else(|| UploadError::MissingUid {
                    kind: kind.as_str(),
                    key: key.to_string(),
                    label: label.to_string(),
                })?
        } else {
            reference
        };

        self.cache.remember(kind, key, &uid, Some(digest));
        for (label, nested_kind, nested_key) in &resolution.created {
            match assigned.uids.get(label).filter(|uid| !uid.is_empty()) {
                Some(nested_uid) => self.cache.remember(*nested_kind, nested_key, nested_uid, None),
                None => tracing::warn!(
                    "mutation for {} {:?} returned no uid for nested {} {:?}",
                    kind.as_str(),
                    key,
                    nested_kind.as_str(),
                    nested_key
                ),
            }
        }
        Ok(uid)
    }
}

/// Validates a user and everything nested under it
fn validate_user(user: &User) -> Result<(), ValidationError> {
    user.validate()?;
    user.likes.iter().try_for_each(validate_document)
}

fn validate_document(doc: &Document) -> Result<(), ValidationError> {
    doc.validate()?;
    doc.likes.iter().try_for_each(validate_user)
}

fn encode<T: Serialize>(kind: EntityKind, key: &str, entity: &T) -> Result<Value, UploadError> {
    serde_json::to_value(entity).map_err(|source| UploadError::Encode {
        kind: kind.as_str(),
        key: key.to_string(),
        source,
    })
}

/// SHA-256 of the entity as emitted by the scraper
fn digest<T: Serialize>(kind: EntityKind, key: &str, entity: &T) -> Result<String, UploadError> {
    let bytes = serde_json::to_vec(entity).map_err(|source| UploadError::Encode {
        kind: kind.as_str(),
        key: key.to_string(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

//! Durable state: sled trees per entity, bincode values.
//!
//! # Locking
//!
//! All durable state is coordinated through named coarse locks acquired in a
//! fixed order to prevent deadlocks:
//!
//! ```text
//! Hosted < NeighborIdentity < Follower < Action < NeighborServer < Relation
//! ```
//!
//! Every composite operation in this module takes the locks it needs in this
//! order and nothing else; handlers never take store locks directly.
//!
//! # Crash consistency with image blobs
//!
//! Image files live outside the database. Writers stage new blobs to disk
//! before the row update and unlink replaced blobs only after it; a crash in
//! between leaks a file, which the orphan sweep reclaims at startup.

use crate::net::message::{SharedProfileAdd, SharedProfileChange};
use crate::types::{
    now, IdentityId, ImageId, PublicKeyBytes, SemVer, INITIALIZATION_BLOCK_SECS,
    REDIRECT_RETENTION_SECS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// ENTITIES
// =============================================================================

/// Identity hosted by this server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedProfile {
    pub identity_id: IdentityId,
    pub public_key: PublicKeyBytes,
    pub version: SemVer,
    pub name: String,
    pub profile_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub extra_data: String,
    pub profile_image: Option<ImageId>,
    pub thumbnail_image: Option<ImageId>,
    pub hosting_redirect: Option<IdentityId>,
    /// Present means the hosting agreement was cancelled; the sweep removes
    /// the row once this passes.
    pub expires_at: Option<u64>,
    pub plan_type: String,
    pub registered_at: u64,
}

impl HostedProfile {
    pub fn is_initialized(&self) -> bool {
        self.version.is_valid()
    }

    pub fn is_expired(&self, at: u64) -> bool {
        matches!(self.expires_at, Some(t) if t <= at)
    }

    /// Still served to queries: registered and not yet swept.
    pub fn is_active(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Identity replicated here from a neighbor server. Keyed by
/// `(identity_id, neighbor_id)` — the same identity may be visible through
/// several neighbors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborProfile {
    pub identity_id: IdentityId,
    pub public_key: PublicKeyBytes,
    pub neighbor_id: IdentityId,
    pub version: SemVer,
    pub name: String,
    pub profile_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub extra_data: String,
    pub thumbnail_image: Option<ImageId>,
}

/// Peer server receiving our profile updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follower {
    pub follower_id: IdentityId,
    pub ip: IpAddr,
    pub primary_port: u16,
    pub neighbor_port: u16,
    /// `None` while initialization is in progress; no profile updates flow to
    /// this follower until it becomes set.
    pub last_refresh_at: Option<u64>,
    /// Consecutive delivery failures recorded by the action worker.
    pub failure_count: u32,
}

/// Peer server whose identities we replicate locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborServer {
    pub neighbor_id: IdentityId,
    pub ip: IpAddr,
    pub neighbor_port: u16,
    pub last_refresh_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    AddProfile,
    ChangeProfile,
    RemoveProfile,
    /// Blocks all later actions for the follower until initialization
    /// finishes (or the blocker goes stale and is collected).
    InitializationInProgress,
}

/// Outbound replication task, produced in the same operation as the change
/// that caused it and consumed FIFO per follower by the action worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodAction {
    pub id: u64,
    pub follower_id: IdentityId,
    pub kind: ActionKind,
    pub target: Option<IdentityId>,
    pub timestamp: u64,
    pub execute_after: Option<u64>,
}

// =============================================================================
// OPERATION INPUTS / OUTPUTS
// =============================================================================

/// Resolved profile changes; `None` fields are untouched.
#[derive(Debug, Default)]
pub struct ProfileChanges {
    pub version: Option<SemVer>,
    pub name: Option<String>,
    /// `Some(None)` removes both images; `Some(Some(..))` replaces them with
    /// already-staged blob ids.
    pub images: Option<Option<(ImageId, Option<ImageId>)>>,
    pub location: Option<(f64, f64)>,
    pub extra_data: Option<String>,
}

#[derive(Debug)]
pub struct UpdateApplied {
    pub first_initialization: bool,
    /// Replaced blobs to unlink after the update.
    pub old_images: Vec<ImageId>,
    pub profile: HostedProfile,
}

pub enum RegisterOutcome {
    Created(HostedProfile),
    Reactivated(HostedProfile),
}

/// One validated inbound neighborhood operation, images already staged.
#[derive(Debug)]
pub enum NeighborOp {
    Add {
        add: SharedProfileAdd,
        thumbnail: Option<ImageId>,
    },
    Change {
        change: SharedProfileChange,
        thumbnail: Option<ImageId>,
    },
    Delete {
        identity_id: IdentityId,
    },
}

#[derive(Debug, Default)]
pub struct NeighborBatchApplied {
    /// Staged blob ids now referenced by committed rows.
    pub kept_images: Vec<ImageId>,
    /// Replaced or deleted blob ids to unlink.
    pub old_images: Vec<ImageId>,
}

/// Failure while applying one inbound neighborhood batch. Carries the item
/// index and, for validation failures, the offending field path.
#[derive(Debug)]
pub struct ActionBatchError {
    pub index: usize,
    pub field: Option<String>,
    pub internal: bool,
}

impl ActionBatchError {
    pub fn invalid(index: usize, field: impl Into<String>) -> Self {
        Self {
            index,
            field: Some(field.into()),
            internal: false,
        }
    }

    pub fn internal(index: usize, err: impl std::fmt::Display) -> Self {
        warn!("neighborhood batch internal error at item {}: {}", index, err);
        Self {
            index,
            field: None,
            internal: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("quota exceeded")]
    QuotaExceeded,
}

// =============================================================================
// STORE
// =============================================================================

pub struct Store {
    db: sled::Db,
    hosted: sled::Tree,
    neighbor_profiles: sled::Tree,
    followers: sled::Tree,
    actions: sled::Tree,
    neighbor_servers: sled::Tree,
    relations: sled::Tree,
    action_seq: AtomicU64,

    // Coarse locks; see module docs for the acquisition order.
    lock_hosted: Mutex<()>,
    lock_neighbor: Mutex<()>,
    lock_follower: Mutex<()>,
    lock_action: Mutex<()>,
    lock_neighbor_server: Mutex<()>,
    lock_relation: Mutex<()>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let hosted = db.open_tree("hosted")?;
        let neighbor_profiles = db.open_tree("neighbor_profiles")?;
        let followers = db.open_tree("followers")?;
        let actions = db.open_tree("actions")?;
        let neighbor_servers = db.open_tree("neighbor_servers")?;
        let relations = db.open_tree("relations")?;

        let next_seq = actions
            .last()?
            .map(|(k, _)| u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0u8; 8])) + 1)
            .unwrap_or(0);

        info!(
            "Store open: {} hosted, {} neighbor profiles, {} followers, {} queued actions",
            hosted.len(),
            neighbor_profiles.len(),
            followers.len(),
            actions.len()
        );

        Ok(Self {
            db,
            hosted,
            neighbor_profiles,
            followers,
            actions,
            neighbor_servers,
            relations,
            action_seq: AtomicU64::new(next_seq),
            lock_hosted: Mutex::new(()),
            lock_neighbor: Mutex::new(()),
            lock_follower: Mutex::new(()),
            lock_action: Mutex::new(()),
            lock_neighbor_server: Mutex::new(()),
            lock_relation: Mutex::new(()),
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    // =========================================================================
    // HOSTED IDENTITIES
    // =========================================================================

    pub fn get_hosted(&self, id: &IdentityId) -> Result<Option<HostedProfile>, StoreError> {
        match self.hosted.get(id)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn count_hosted(&self) -> usize {
        self.hosted.len()
    }

    /// Create a hosted identity, or reactivate one whose agreement was
    /// cancelled but not yet swept. The quota is checked under the same lock
    /// that inserts.
    pub async fn register_hosting(
        &self,
        public_key: PublicKeyBytes,
        plan_type: &str,
        max_hosted: usize,
    ) -> Result<RegisterOutcome, StoreError> {
        let _hosted = self.lock_hosted.lock().await;

        let identity_id = crate::crypto::identity_id(&public_key);
        if let Some(mut existing) = self.get_hosted(&identity_id)? {
            if existing.expires_at.is_none() {
                return Err(StoreError::AlreadyExists);
            }
            existing.expires_at = None;
            existing.hosting_redirect = None;
            existing.plan_type = plan_type.to_string();
            self.put_hosted(&existing)?;
            debug!("Reactivated hosted identity {}", hex::encode(&identity_id[..8]));
            return Ok(RegisterOutcome::Reactivated(existing));
        }

        if self.hosted.len() >= max_hosted {
            return Err(StoreError::QuotaExceeded);
        }

        let profile = HostedProfile {
            identity_id,
            public_key,
            version: SemVer::INVALID,
            name: String::new(),
            profile_type: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            extra_data: String::new(),
            profile_image: None,
            thumbnail_image: None,
            hosting_redirect: None,
            expires_at: None,
            plan_type: plan_type.to_string(),
            registered_at: now(),
        };
        self.put_hosted(&profile)?;
        Ok(RegisterOutcome::Created(profile))
    }

    /// Apply a validated profile update and enqueue one replication action
    /// per follower (`AddProfile` on first initialization, `ChangeProfile`
    /// afterwards).
    pub async fn apply_profile_update(
        &self,
        id: &IdentityId,
        changes: ProfileChanges,
    ) -> Result<UpdateApplied, StoreError> {
        let _hosted = self.lock_hosted.lock().await;
        let _follower = self.lock_follower.lock().await;
        let _action = self.lock_action.lock().await;

        let mut profile = self.get_hosted(id)?.ok_or(StoreError::NotFound)?;
        let first_initialization = !profile.is_initialized();
        let mut old_images = Vec::new();

        if let Some(v) = changes.version {
            profile.version = v;
        }
        if let Some(name) = changes.name {
            profile.name = name;
        }
        if let Some(images) = changes.images {
            if let Some(old) = profile.profile_image.take() {
                old_images.push(old);
            }
            if let Some(old) = profile.thumbnail_image.take() {
                old_images.push(old);
            }
            if let Some((image, thumbnail)) = images {
                profile.profile_image = Some(image);
                profile.thumbnail_image = thumbnail;
            }
        }
        if let Some((lat, lon)) = changes.location {
            profile.latitude = lat;
            profile.longitude = lon;
        }
        if let Some(extra) = changes.extra_data {
            profile.extra_data = extra;
        }

        self.put_hosted(&profile)?;

        let kind = if first_initialization {
            ActionKind::AddProfile
        } else {
            ActionKind::ChangeProfile
        };
        self.enqueue_for_followers(kind, Some(*id))?;

        Ok(UpdateApplied {
            first_initialization,
            old_images,
            profile,
        })
    }

    /// End the hosting agreement. A redirect keeps the row queryable for the
    /// retention window; without one the row expires immediately. Emits
    /// `RemoveProfile` actions for every follower.
    pub async fn cancel_hosting(
        &self,
        id: &IdentityId,
        redirect: Option<IdentityId>,
    ) -> Result<HostedProfile, StoreError> {
        let _hosted = self.lock_hosted.lock().await;
        let _follower = self.lock_follower.lock().await;
        let _action = self.lock_action.lock().await;

        let mut profile = self.get_hosted(id)?.ok_or(StoreError::NotFound)?;
        let at = now();
        profile.expires_at = Some(match redirect {
            Some(_) => at + REDIRECT_RETENTION_SECS,
            None => at,
        });
        profile.hosting_redirect = redirect;
        if !profile.is_initialized() {
            // Redirected lookups still return a structured profile.
            profile.version = SemVer::V1;
        }
        self.put_hosted(&profile)?;

        self.enqueue_for_followers(ActionKind::RemoveProfile, Some(*id))?;
        Ok(profile)
    }

    /// Remove hosted rows whose expiration has passed. Returns the ids and
    /// the image blobs they referenced, for unlinking by the caller.
    pub async fn sweep_expired(&self) -> Result<Vec<(IdentityId, Vec<ImageId>)>, StoreError> {
        let _hosted = self.lock_hosted.lock().await;

        let at = now();
        let mut removed = Vec::new();
        for entry in self.hosted.iter() {
            let (key, value) = entry?;
            let profile: HostedProfile = bincode::deserialize(&value)?;
            if profile.is_expired(at) {
                let images = profile
                    .profile_image
                    .into_iter()
                    .chain(profile.thumbnail_image)
                    .collect();
                self.hosted.remove(&key)?;
                removed.push((profile.identity_id, images));
            }
        }
        if !removed.is_empty() {
            info!("Expiration sweep removed {} hosted identities", removed.len());
        }
        Ok(removed)
    }

    /// Scan hosted profiles with a cheap prefilter and offset paging. Only
    /// initialized, non-expired rows are visible to search.
    pub fn scan_hosted<F>(
        &self,
        prefilter: F,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HostedProfile>, StoreError>
    where
        F: Fn(&HostedProfile) -> bool,
    {
        let mut matched = 0usize;
        let mut out = Vec::new();
        for entry in self.hosted.iter() {
            let (_, value) = entry?;
            let profile: HostedProfile = bincode::deserialize(&value)?;
            if !profile.is_initialized() || !profile.is_active() {
                continue;
            }
            if !prefilter(&profile) {
                continue;
            }
            if matched >= offset {
                out.push(profile);
                if out.len() >= limit {
                    break;
                }
            }
            matched += 1;
        }
        Ok(out)
    }

    /// Snapshot of the rows a new follower is initialized with.
    fn snapshot_initialized(&self) -> Result<Vec<HostedProfile>, StoreError> {
        let mut out = Vec::new();
        for entry in self.hosted.iter() {
            let (_, value) = entry?;
            let profile: HostedProfile = bincode::deserialize(&value)?;
            if profile.is_initialized() && profile.is_active() {
                out.push(profile);
            }
        }
        Ok(out)
    }

    fn put_hosted(&self, profile: &HostedProfile) -> Result<(), StoreError> {
        self.hosted
            .insert(profile.identity_id, bincode::serialize(profile)?)?;
        Ok(())
    }

    // =========================================================================
    // NEIGHBOR PROFILES
    // =========================================================================

    fn neighbor_profile_key(identity_id: &IdentityId, neighbor_id: &IdentityId) -> [u8; 64] {
        let mut key = [0u8; 64];
        key[..32].copy_from_slice(identity_id);
        key[32..].copy_from_slice(neighbor_id);
        key
    }

    pub fn get_neighbor_profile(
        &self,
        identity_id: &IdentityId,
        neighbor_id: &IdentityId,
    ) -> Result<Option<NeighborProfile>, StoreError> {
        let key = Self::neighbor_profile_key(identity_id, neighbor_id);
        match self.neighbor_profiles.get(key)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn count_neighbor_profiles(&self) -> usize {
        self.neighbor_profiles.len()
    }

    /// Apply one transaction of inbound neighborhood operations. All-or-
    /// nothing: an invalid item rolls the whole batch back and reports the
    /// item index and offending field.
    ///
    /// Items are staged in an overlay so later items in the same batch see
    /// the effects of earlier ones (an Add/Change/Delete sequence of one
    /// identity within a bundle is valid and nets out).
    pub async fn apply_neighbor_batch(
        &self,
        neighbor_id: &IdentityId,
        base_index: usize,
        ops: &[NeighborOp],
    ) -> Result<NeighborBatchApplied, ActionBatchError> {
        let _neighbor = self.lock_neighbor.lock().await;

        // key -> staged row; None marks a staged deletion.
        let mut staged: std::collections::HashMap<[u8; 64], Option<NeighborProfile>> =
            std::collections::HashMap::new();
        let mut applied = NeighborBatchApplied::default();

        // Staged state first, committed tree second.
        let current = |staged: &std::collections::HashMap<[u8; 64], Option<NeighborProfile>>,
                       key: &[u8; 64],
                       index: usize|
         -> Result<Option<NeighborProfile>, ActionBatchError> {
            if let Some(entry) = staged.get(key) {
                return Ok(entry.clone());
            }
            match self
                .neighbor_profiles
                .get(key)
                .map_err(|e| ActionBatchError::internal(index, e))?
            {
                Some(v) => Ok(Some(
                    bincode::deserialize(&v).map_err(|e| ActionBatchError::internal(index, e))?,
                )),
                None => Ok(None),
            }
        };

        for (i, op) in ops.iter().enumerate() {
            let index = base_index + i;
            match op {
                NeighborOp::Add { add, thumbnail } => {
                    let identity_id = crate::crypto::identity_id(&add.public_key);
                    let key = Self::neighbor_profile_key(&identity_id, neighbor_id);
                    if current(&staged, &key, index)?.is_some() {
                        return Err(ActionBatchError::invalid(
                            index,
                            format!("{index}.add.identityPublicKey"),
                        ));
                    }
                    let profile = NeighborProfile {
                        identity_id,
                        public_key: add.public_key,
                        neighbor_id: *neighbor_id,
                        version: add.version,
                        name: add.name.clone(),
                        profile_type: add.profile_type.clone(),
                        latitude: add.latitude,
                        longitude: add.longitude,
                        extra_data: add.extra_data.clone(),
                        thumbnail_image: *thumbnail,
                    };
                    staged.insert(key, Some(profile));
                    if let Some(id) = thumbnail {
                        applied.kept_images.push(*id);
                    }
                }
                NeighborOp::Change { change, thumbnail } => {
                    let key = Self::neighbor_profile_key(&change.identity_id, neighbor_id);
                    let Some(mut profile) = current(&staged, &key, index)? else {
                        return Err(ActionBatchError::invalid(index, "identityNetworkId"));
                    };

                    if change.set_version {
                        profile.version = change.version;
                    }
                    if change.set_name {
                        profile.name = change.name.clone();
                    }
                    if change.set_location {
                        profile.latitude = change.latitude;
                        profile.longitude = change.longitude;
                    }
                    if change.set_extra_data {
                        profile.extra_data = change.extra_data.clone();
                    }
                    if change.set_thumbnail {
                        if let Some(old) = profile.thumbnail_image.take() {
                            applied.old_images.push(old);
                        }
                        profile.thumbnail_image = *thumbnail;
                        if let Some(id) = thumbnail {
                            applied.kept_images.push(*id);
                        }
                    }

                    staged.insert(key, Some(profile));
                }
                NeighborOp::Delete { identity_id } => {
                    let key = Self::neighbor_profile_key(identity_id, neighbor_id);
                    let Some(profile) = current(&staged, &key, index)? else {
                        return Err(ActionBatchError::invalid(index, "identityNetworkId"));
                    };
                    if let Some(old) = profile.thumbnail_image {
                        applied.old_images.push(old);
                    }
                    staged.insert(key, None);
                }
            }
        }

        let mut batch = sled::Batch::default();
        for (key, entry) in staged {
            match entry {
                Some(profile) => {
                    let value = bincode::serialize(&profile)
                        .map_err(|e| ActionBatchError::internal(base_index, e))?;
                    batch.insert(&key[..], value);
                }
                None => batch.remove(&key[..]),
            }
        }
        self.neighbor_profiles
            .apply_batch(batch)
            .map_err(|e| ActionBatchError::internal(base_index, e))?;
        Ok(applied)
    }

    pub fn scan_neighbor_profiles<F>(
        &self,
        prefilter: F,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<NeighborProfile>, StoreError>
    where
        F: Fn(&NeighborProfile) -> bool,
    {
        let mut matched = 0usize;
        let mut out = Vec::new();
        for entry in self.neighbor_profiles.iter() {
            let (_, value) = entry?;
            let profile: NeighborProfile = bincode::deserialize(&value)?;
            if !prefilter(&profile) {
                continue;
            }
            if matched >= offset {
                out.push(profile);
                if out.len() >= limit {
                    break;
                }
            }
            matched += 1;
        }
        Ok(out)
    }

    /// Drop every profile replicated from one neighbor. Returns thumbnail
    /// blobs to unlink.
    pub async fn remove_neighbor_profiles(
        &self,
        neighbor_id: &IdentityId,
    ) -> Result<Vec<ImageId>, StoreError> {
        let _neighbor = self.lock_neighbor.lock().await;

        let mut images = Vec::new();
        let mut batch = sled::Batch::default();
        for entry in self.neighbor_profiles.iter() {
            let (key, value) = entry?;
            let profile: NeighborProfile = bincode::deserialize(&value)?;
            if &profile.neighbor_id == neighbor_id {
                if let Some(id) = profile.thumbnail_image {
                    images.push(id);
                }
                batch.remove(key);
            }
        }
        self.neighbor_profiles.apply_batch(batch)?;
        Ok(images)
    }

    // =========================================================================
    // FOLLOWERS
    // =========================================================================

    pub fn get_follower(&self, id: &IdentityId) -> Result<Option<Follower>, StoreError> {
        match self.followers.get(id)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn count_followers(&self) -> usize {
        self.followers.len()
    }

    pub fn list_followers(&self) -> Result<Vec<Follower>, StoreError> {
        let mut out = Vec::new();
        for entry in self.followers.iter() {
            let (_, value) = entry?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Admit a new follower: snapshot the initialized identity set, insert
    /// the follower row with `last_refresh_at = None`, and insert the
    /// blocking `InitializationInProgress` action, all in one operation.
    ///
    /// A follower re-requesting initialization replaces its previous state;
    /// this recovers cleanly from a crashed earlier attempt.
    pub async fn admit_follower(
        &self,
        follower: Follower,
        max_followers: usize,
    ) -> Result<Vec<HostedProfile>, StoreError> {
        let _hosted = self.lock_hosted.lock().await;
        let _follower = self.lock_follower.lock().await;
        let _action = self.lock_action.lock().await;

        let existed = self.followers.contains_key(follower.follower_id)?;
        if existed {
            self.remove_follower_locked(&follower.follower_id)?;
        } else if self.followers.len() >= max_followers {
            return Err(StoreError::QuotaExceeded);
        }

        let snapshot = self.snapshot_initialized()?;

        let mut row = follower;
        row.last_refresh_at = None;
        row.failure_count = 0;
        self.followers
            .insert(row.follower_id, bincode::serialize(&row)?)?;

        self.append_action(NeighborhoodAction {
            id: 0,
            follower_id: row.follower_id,
            kind: ActionKind::InitializationInProgress,
            target: None,
            timestamp: now(),
            execute_after: Some(now() + INITIALIZATION_BLOCK_SECS),
        })?;

        Ok(snapshot)
    }

    /// Mark a follower initialized and release its blocking action so the
    /// worker can proceed.
    pub async fn finish_follower_init(&self, follower_id: &IdentityId) -> Result<(), StoreError> {
        let _follower = self.lock_follower.lock().await;
        let _action = self.lock_action.lock().await;

        let mut follower = self.get_follower(follower_id)?.ok_or(StoreError::NotFound)?;
        let at = now();
        follower.last_refresh_at = Some(at);
        self.followers
            .insert(follower.follower_id, bincode::serialize(&follower)?)?;

        // Pull the blocker's execute_after into the past; the worker deletes
        // it on its next pass and resumes the queue.
        for entry in self.actions.iter() {
            let (key, value) = entry?;
            let mut action: NeighborhoodAction = bincode::deserialize(&value)?;
            if action.follower_id == *follower_id
                && action.kind == ActionKind::InitializationInProgress
            {
                action.execute_after = Some(at);
                self.actions.insert(key, bincode::serialize(&action)?)?;
            }
        }
        Ok(())
    }

    pub async fn remove_follower(&self, follower_id: &IdentityId) -> Result<bool, StoreError> {
        let _follower = self.lock_follower.lock().await;
        let _action = self.lock_action.lock().await;
        self.remove_follower_locked(follower_id)
    }

    /// Caller holds the follower and action locks.
    fn remove_follower_locked(&self, follower_id: &IdentityId) -> Result<bool, StoreError> {
        let existed = self.followers.remove(follower_id)?.is_some();
        let mut batch = sled::Batch::default();
        for entry in self.actions.iter() {
            let (key, value) = entry?;
            let action: NeighborhoodAction = bincode::deserialize(&value)?;
            if action.follower_id == *follower_id {
                batch.remove(key);
            }
        }
        self.actions.apply_batch(batch)?;
        Ok(existed)
    }

    /// Record a delivery failure; once the limit is hit the follower and its
    /// queue are dropped. Returns true when the follower was removed.
    pub async fn record_follower_failure(
        &self,
        follower_id: &IdentityId,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let _follower = self.lock_follower.lock().await;
        let _action = self.lock_action.lock().await;

        let Some(mut follower) = self.get_follower(follower_id)? else {
            return Ok(false);
        };
        follower.failure_count += 1;
        if follower.failure_count >= limit {
            warn!(
                "Follower {} unreachable {} times, dropping",
                hex::encode(&follower_id[..8]),
                follower.failure_count
            );
            self.remove_follower_locked(follower_id)?;
            return Ok(true);
        }
        self.followers
            .insert(follower.follower_id, bincode::serialize(&follower)?)?;
        Ok(false)
    }

    pub async fn reset_follower_failures(&self, follower_id: &IdentityId) -> Result<(), StoreError> {
        let _follower = self.lock_follower.lock().await;
        if let Some(mut follower) = self.get_follower(follower_id)? {
            if follower.failure_count != 0 {
                follower.failure_count = 0;
                self.followers
                    .insert(follower.follower_id, bincode::serialize(&follower)?)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // NEIGHBORHOOD ACTIONS
    // =========================================================================

    fn append_action(&self, mut action: NeighborhoodAction) -> Result<u64, StoreError> {
        let id = self.action_seq.fetch_add(1, Ordering::SeqCst);
        action.id = id;
        self.actions
            .insert(id.to_be_bytes(), bincode::serialize(&action)?)?;
        Ok(id)
    }

    /// Caller holds the follower and action locks. Only initialized-or-
    /// initializing followers get actions; the blocker defers delivery for
    /// the latter.
    fn enqueue_for_followers(
        &self,
        kind: ActionKind,
        target: Option<IdentityId>,
    ) -> Result<usize, StoreError> {
        let mut queued = 0;
        for entry in self.followers.iter() {
            let (_, value) = entry?;
            let follower: Follower = bincode::deserialize(&value)?;
            self.append_action(NeighborhoodAction {
                id: 0,
                follower_id: follower.follower_id,
                kind,
                target,
                timestamp: now(),
                execute_after: None,
            })?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Next deliverable action for the worker, FIFO per follower.
    ///
    /// Guarantees: an action with a future `execute_after` is never picked,
    /// and a follower with an active `InitializationInProgress` blocker gets
    /// nothing until the finish handler pulls the blocker into the past.
    /// Spent blockers are collected inline.
    pub async fn next_worker_action(&self) -> Result<Option<NeighborhoodAction>, StoreError> {
        let _action = self.lock_action.lock().await;

        let at = now();
        let mut blocked: HashSet<IdentityId> = HashSet::new();
        for entry in self.actions.iter() {
            let (_, value) = entry?;
            let action: NeighborhoodAction = bincode::deserialize(&value)?;
            if action.kind == ActionKind::InitializationInProgress
                && matches!(action.execute_after, Some(t) if t > at)
            {
                blocked.insert(action.follower_id);
            }
        }

        for entry in self.actions.iter() {
            let (key, value) = entry?;
            let action: NeighborhoodAction = bincode::deserialize(&value)?;
            if blocked.contains(&action.follower_id) {
                continue;
            }
            if matches!(action.execute_after, Some(t) if t > at) {
                continue;
            }
            if action.kind == ActionKind::InitializationInProgress {
                // Spent blocker: initialization finished or went stale.
                self.actions.remove(key)?;
                continue;
            }
            return Ok(Some(action));
        }
        Ok(None)
    }

    pub async fn delete_action(&self, id: u64) -> Result<(), StoreError> {
        let _action = self.lock_action.lock().await;
        self.actions.remove(id.to_be_bytes())?;
        Ok(())
    }

    pub fn count_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn list_actions(&self) -> Result<Vec<NeighborhoodAction>, StoreError> {
        let mut out = Vec::new();
        for entry in self.actions.iter() {
            let (_, value) = entry?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Every image id any row currently references; the startup orphan sweep
    /// unlinks blobs outside this set.
    pub fn referenced_images(&self) -> Result<HashSet<ImageId>, StoreError> {
        let mut out = HashSet::new();
        for entry in self.hosted.iter() {
            let (_, value) = entry?;
            let profile: HostedProfile = bincode::deserialize(&value)?;
            out.extend(profile.profile_image);
            out.extend(profile.thumbnail_image);
        }
        for entry in self.neighbor_profiles.iter() {
            let (_, value) = entry?;
            let profile: NeighborProfile = bincode::deserialize(&value)?;
            out.extend(profile.thumbnail_image);
        }
        Ok(out)
    }

    // =========================================================================
    // NEIGHBOR SERVERS
    // =========================================================================

    pub fn get_neighbor_server(
        &self,
        id: &IdentityId,
    ) -> Result<Option<NeighborServer>, StoreError> {
        match self.neighbor_servers.get(id)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn list_neighbor_servers(&self) -> Result<Vec<NeighborServer>, StoreError> {
        let mut out = Vec::new();
        for entry in self.neighbor_servers.iter() {
            let (_, value) = entry?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    pub async fn upsert_neighbor_server(&self, neighbor: NeighborServer) -> Result<(), StoreError> {
        let _ns = self.lock_neighbor_server.lock().await;
        self.neighbor_servers
            .insert(neighbor.neighbor_id, bincode::serialize(&neighbor)?)?;
        Ok(())
    }

    pub async fn set_neighbor_refresh(&self, id: &IdentityId) -> Result<(), StoreError> {
        let _ns = self.lock_neighbor_server.lock().await;
        let mut neighbor = self.get_neighbor_server(id)?.ok_or(StoreError::NotFound)?;
        neighbor.last_refresh_at = Some(now());
        self.neighbor_servers
            .insert(neighbor.neighbor_id, bincode::serialize(&neighbor)?)?;
        Ok(())
    }

    pub async fn remove_neighbor_server(&self, id: &IdentityId) -> Result<bool, StoreError> {
        let _ns = self.lock_neighbor_server.lock().await;
        Ok(self.neighbor_servers.remove(id)?.is_some())
    }

    // =========================================================================
    // RELATION CARDS
    // =========================================================================

    fn relation_key(identity_id: &IdentityId, application_id: &[u8; 32]) -> [u8; 64] {
        let mut key = [0u8; 64];
        key[..32].copy_from_slice(identity_id);
        key[32..].copy_from_slice(application_id);
        key
    }

    /// Attach a card; one card per `application_id` per identity, capped at
    /// `max_relations` distinct applications.
    pub async fn add_relation(
        &self,
        identity_id: &IdentityId,
        card: &crate::net::message::RelationCard,
        max_relations: usize,
    ) -> Result<(), StoreError> {
        let _relation = self.lock_relation.lock().await;

        let key = Self::relation_key(identity_id, &card.application_id);
        if self.relations.contains_key(key)? {
            return Err(StoreError::AlreadyExists);
        }
        if self.relations.scan_prefix(identity_id).count() >= max_relations {
            return Err(StoreError::QuotaExceeded);
        }
        self.relations.insert(key, bincode::serialize(card)?)?;
        Ok(())
    }

    pub async fn remove_relation(
        &self,
        identity_id: &IdentityId,
        application_id: &[u8; 32],
    ) -> Result<bool, StoreError> {
        let _relation = self.lock_relation.lock().await;
        let key = Self::relation_key(identity_id, application_id);
        Ok(self.relations.remove(key)?.is_some())
    }

    pub fn get_relations(
        &self,
        identity_id: &IdentityId,
    ) -> Result<Vec<crate::net::message::RelationCard>, StoreError> {
        let mut out = Vec::new();
        for entry in self.relations.scan_prefix(identity_id) {
            let (_, value) = entry?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        (dir, store)
    }

    fn follower(seed: u8) -> Follower {
        Follower {
            follower_id: [seed; 32],
            ip: "127.0.0.1".parse().unwrap(),
            primary_port: 16987,
            neighbor_port: 16988,
            last_refresh_at: None,
            failure_count: 0,
        }
    }

    #[tokio::test]
    async fn test_register_quota_and_duplicate() {
        let (_dir, store) = open_store();
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert!(store
            .register_hosting(kp1.public(), "individual", 1)
            .await
            .is_ok());
        assert!(matches!(
            store.register_hosting(kp1.public(), "individual", 1).await,
            Err(StoreError::AlreadyExists)
        ));
        assert!(matches!(
            store.register_hosting(kp2.public(), "individual", 1).await,
            Err(StoreError::QuotaExceeded)
        ));
    }

    #[tokio::test]
    async fn test_register_reactivates_cancelled() {
        let (_dir, store) = open_store();
        let kp = Keypair::generate();
        let id = kp.identity_id();

        store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap();
        store.cancel_hosting(&id, Some([5u8; 32])).await.unwrap();
        assert!(store.get_hosted(&id).unwrap().unwrap().expires_at.is_some());

        match store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap()
        {
            RegisterOutcome::Reactivated(p) => {
                assert!(p.expires_at.is_none());
                assert!(p.hosting_redirect.is_none());
            }
            RegisterOutcome::Created(_) => panic!("expected reactivation"),
        }
    }

    #[tokio::test]
    async fn test_update_emits_actions_per_follower() {
        let (_dir, store) = open_store();
        let kp = Keypair::generate();
        let id = kp.identity_id();

        store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap();
        store.admit_follower(follower(1), 10).await.unwrap();
        store.admit_follower(follower(2), 10).await.unwrap();
        store.finish_follower_init(&[1u8; 32]).await.unwrap();
        store.finish_follower_init(&[2u8; 32]).await.unwrap();

        let applied = store
            .apply_profile_update(
                &id,
                ProfileChanges {
                    version: Some(SemVer::V1),
                    name: Some("Alice".into()),
                    location: Some((50.0, 14.4)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(applied.first_initialization);

        let adds = store
            .list_actions()
            .unwrap()
            .into_iter()
            .filter(|a| a.kind == ActionKind::AddProfile)
            .count();
        assert_eq!(adds, 2);
    }

    #[tokio::test]
    async fn test_blocker_defers_follower_queue() {
        let (_dir, store) = open_store();
        let kp = Keypair::generate();
        let id = kp.identity_id();

        store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap();
        store.admit_follower(follower(1), 10).await.unwrap();

        store
            .apply_profile_update(
                &id,
                ProfileChanges {
                    version: Some(SemVer::V1),
                    name: Some("Alice".into()),
                    location: Some((50.0, 14.4)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Initialization in progress: nothing deliverable.
        assert!(store.next_worker_action().await.unwrap().is_none());

        // Finish releases the queue; the spent blocker is collected and the
        // AddProfile action surfaces.
        store.finish_follower_init(&[1u8; 32]).await.unwrap();
        let action = store.next_worker_action().await.unwrap().unwrap();
        assert_eq!(action.kind, ActionKind::AddProfile);
        assert_eq!(action.target, Some(id));
    }

    #[tokio::test]
    async fn test_follower_invariant_refresh_null_while_blocked() {
        let (_dir, store) = open_store();
        store.admit_follower(follower(1), 10).await.unwrap();

        let f = store.get_follower(&[1u8; 32]).unwrap().unwrap();
        assert!(f.last_refresh_at.is_none());
        let blockers: Vec<_> = store
            .list_actions()
            .unwrap()
            .into_iter()
            .filter(|a| a.kind == ActionKind::InitializationInProgress)
            .collect();
        assert_eq!(blockers.len(), 1);
        assert!(blockers[0].execute_after.unwrap() > now());

        store.finish_follower_init(&[1u8; 32]).await.unwrap();
        let f = store.get_follower(&[1u8; 32]).unwrap().unwrap();
        assert!(f.last_refresh_at.is_some());
        for a in store.list_actions().unwrap() {
            if a.kind == ActionKind::InitializationInProgress {
                assert!(a.execute_after.unwrap() <= now());
            }
        }
    }

    #[tokio::test]
    async fn test_remove_follower_purges_actions() {
        let (_dir, store) = open_store();
        let kp = Keypair::generate();
        let id = kp.identity_id();

        store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap();
        store.admit_follower(follower(1), 10).await.unwrap();
        store.finish_follower_init(&[1u8; 32]).await.unwrap();
        store
            .apply_profile_update(
                &id,
                ProfileChanges {
                    version: Some(SemVer::V1),
                    name: Some("A".into()),
                    location: Some((0.0, 0.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store.count_actions() > 0);
        assert!(store.remove_follower(&[1u8; 32]).await.unwrap());
        assert_eq!(store.count_actions(), 0);
    }

    #[tokio::test]
    async fn test_neighbor_add_change_delete_roundtrip() {
        let (_dir, store) = open_store();
        let neighbor_id = [7u8; 32];
        let kp = Keypair::generate();

        let add = SharedProfileAdd {
            public_key: kp.public(),
            version: SemVer::V1,
            name: "Bob".into(),
            profile_type: "person".into(),
            latitude: 1.0,
            longitude: 2.0,
            extra_data: String::new(),
            thumbnail_image: Default::default(),
        };
        let before = store.count_neighbor_profiles();

        store
            .apply_neighbor_batch(
                &neighbor_id,
                0,
                &[NeighborOp::Add {
                    add: add.clone(),
                    thumbnail: None,
                }],
            )
            .await
            .unwrap();

        let id = crate::crypto::identity_id(&kp.public());
        let change = SharedProfileChange {
            identity_id: id,
            set_name: true,
            name: "Robert".into(),
            ..Default::default()
        };
        store
            .apply_neighbor_batch(&neighbor_id, 0, &[NeighborOp::Change {
                change,
                thumbnail: None,
            }])
            .await
            .unwrap();
        assert_eq!(
            store
                .get_neighbor_profile(&id, &neighbor_id)
                .unwrap()
                .unwrap()
                .name,
            "Robert"
        );

        store
            .apply_neighbor_batch(&neighbor_id, 0, &[NeighborOp::Delete { identity_id: id }])
            .await
            .unwrap();
        assert_eq!(store.count_neighbor_profiles(), before);
    }

    #[tokio::test]
    async fn test_neighbor_duplicate_add_rolls_back_batch() {
        let (_dir, store) = open_store();
        let neighbor_id = [7u8; 32];
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        let mk = |kp: &Keypair, name: &str| SharedProfileAdd {
            public_key: kp.public(),
            version: SemVer::V1,
            name: name.into(),
            profile_type: "person".into(),
            latitude: 0.0,
            longitude: 0.0,
            extra_data: String::new(),
            thumbnail_image: Default::default(),
        };

        store
            .apply_neighbor_batch(&neighbor_id, 0, &[NeighborOp::Add {
                add: mk(&kp1, "a"),
                thumbnail: None,
            }])
            .await
            .unwrap();

        // Batch of [new, duplicate]: the duplicate fails with its index and
        // field, and the new row must not be committed.
        let err = store
            .apply_neighbor_batch(
                &neighbor_id,
                1,
                &[
                    NeighborOp::Add {
                        add: mk(&kp2, "b"),
                        thumbnail: None,
                    },
                    NeighborOp::Add {
                        add: mk(&kp1, "dup"),
                        thumbnail: None,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("2.add.identityPublicKey"));
        assert!(store
            .get_neighbor_profile(&crate::crypto::identity_id(&kp2.public()), &neighbor_id)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_relations_cap_and_duplicate() {
        let (_dir, store) = open_store();
        let identity = [1u8; 32];

        let card = |app: u8| crate::net::message::RelationCard {
            card_id: [app; 32],
            card_version: 1,
            application_id: [app; 32],
            card_type: "friend".into(),
            valid_from: 0,
            valid_to: u64::MAX,
            issuer_public_key: [0u8; 32],
            recipient_public_key: [0u8; 32],
            issuer_signature: Default::default(),
            recipient_signature: Default::default(),
        };

        store.add_relation(&identity, &card(1), 2).await.unwrap();
        assert!(matches!(
            store.add_relation(&identity, &card(1), 2).await,
            Err(StoreError::AlreadyExists)
        ));
        store.add_relation(&identity, &card(2), 2).await.unwrap();
        assert!(matches!(
            store.add_relation(&identity, &card(3), 2).await,
            Err(StoreError::QuotaExceeded)
        ));

        assert!(store.remove_relation(&identity, &[1u8; 32]).await.unwrap());
        assert_eq!(store.get_relations(&identity).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (_dir, store) = open_store();
        let kp = Keypair::generate();
        let id = kp.identity_id();

        store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap();
        // No redirect: expires immediately.
        store.cancel_hosting(&id, None).await.unwrap();

        let removed = store.sweep_expired().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_hosted(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_uninitialized_gets_structured_version() {
        let (_dir, store) = open_store();
        let kp = Keypair::generate();
        let id = kp.identity_id();

        store
            .register_hosting(kp.public(), "individual", 10)
            .await
            .unwrap();
        let cancelled = store.cancel_hosting(&id, Some([9u8; 32])).await.unwrap();
        assert_eq!(cancelled.version, SemVer::V1);
        assert_eq!(cancelled.hosting_redirect, Some([9u8; 32]));
    }
}

//! Inbound replication: validate and apply profile updates received from
//! initialized neighbors.
//!
//! Processing runs in two passes. Pass 1 validates every item and stages its
//! image to disk; a failure at item k still lets items 0..k-1 through. Pass 2
//! applies the surviving prefix in bounded transactions; the first failing
//! transaction stops the run. Whatever was staged but never committed, and
//! every blob a committed change replaced, is unlinked at the end.

use crate::db::{ActionBatchError, NeighborOp};
use crate::handlers::{reply_error, Handled};
use crate::images::is_valid_image;
use crate::net::dispatch::Outcome;
use crate::net::message::{
    ConversationPayload, ConversationResponse, SharedProfileUpdateItem, Status,
};
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{
    GeoLocation, IdentityId, ImageId, MAX_EXTRA_DATA_BYTES, MAX_NAME_BYTES, MAX_TYPE_BYTES,
    UPDATE_APPLY_BATCH,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Conversation entry point: only an initialized neighbor may push updates.
pub async fn shared_profile_update(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    items: Vec<SharedProfileUpdateItem>,
) -> Handled {
    let Some(sender) = session.identity_id().await else {
        return reply_error(Status::Internal);
    };

    match ctx.store.get_neighbor_server(&sender) {
        Ok(Some(n)) if n.last_refresh_at.is_some() => {}
        Ok(_) => return reply_error(Status::Rejected),
        Err(e) => {
            warn!("neighbor lookup failed: {}", e);
            return reply_error(Status::Internal);
        }
    }

    let status = process_update(ctx, &sender, items).await;
    (
        Some(ConversationResponse {
            status,
            payload: ConversationPayload::None,
        }),
        Outcome::Continue,
    )
}

/// Validate and apply an update bundle from `neighbor_id`. Also used by the
/// join flow, where the neighbor row exists but is not yet initialized.
pub async fn process_update(
    ctx: &Arc<ServerContext>,
    neighbor_id: &IdentityId,
    items: Vec<SharedProfileUpdateItem>,
) -> Status {
    // ---- Pass 1: validation + image staging -------------------------------
    let mut ops: Vec<NeighborOp> = Vec::with_capacity(items.len());
    let mut staged: Vec<ImageId> = Vec::new();
    let mut validation_error: Option<Status> = None;
    let mut any_refresh = false;

    for (index, item) in items.into_iter().enumerate() {
        match validate_item(index, item) {
            Ok(Validated::Refresh) => any_refresh = true,
            Ok(Validated::Op { op, image }) => {
                let op = match image {
                    Some(bytes) => {
                        let id = crate::crypto::random_image_id();
                        if let Err(e) = ctx.images.write(&id, &bytes).await {
                            warn!("image staging failed: {}", e);
                            validation_error = Some(Status::Internal);
                            break;
                        }
                        staged.push(id);
                        op.with_thumbnail(id)
                    }
                    None => op,
                };
                ops.push(op);
            }
            Err(status) => {
                validation_error = Some(status);
                break;
            }
        }
    }

    if any_refresh {
        if let Err(e) = ctx.store.set_neighbor_refresh(neighbor_id).await {
            warn!("neighbor refresh bump failed: {}", e);
        }
    }

    // ---- Pass 2: apply in bounded transactions ----------------------------
    let mut kept: HashSet<ImageId> = HashSet::new();
    let mut old_images: Vec<ImageId> = Vec::new();
    let mut apply_error: Option<Status> = None;

    let mut base_index = 0usize;
    for chunk in ops.chunks(UPDATE_APPLY_BATCH) {
        match ctx.store.apply_neighbor_batch(neighbor_id, base_index, chunk).await {
            Ok(applied) => {
                kept.extend(applied.kept_images);
                old_images.extend(applied.old_images);
            }
            Err(ActionBatchError {
                field: Some(field), ..
            }) => {
                apply_error = Some(Status::InvalidValue(field));
                break;
            }
            Err(_) => {
                apply_error = Some(Status::Internal);
                break;
            }
        }
        base_index += chunk.len();
    }

    // ---- Cleanup: staged-but-uncommitted and replaced blobs ---------------
    for id in &staged {
        if !kept.contains(id) {
            ctx.images.remove(id).await;
        }
    }
    ctx.images.remove_all(&old_images).await;

    debug!(
        "neighbor {} update: {} ops applied, refresh: {}",
        crate::crypto::fingerprint(neighbor_id),
        base_index.min(ops.len()),
        any_refresh
    );

    // An apply failure happened at an earlier index than any validation
    // failure, so it takes precedence.
    apply_error.or(validation_error).unwrap_or(Status::Ok)
}

// =============================================================================
// ITEM VALIDATION
// =============================================================================

#[derive(Debug)]
enum Validated {
    Refresh,
    Op {
        op: NeighborOp,
        /// Thumbnail bytes to stage, if the item carries one.
        image: Option<Vec<u8>>,
    },
}

impl NeighborOp {
    fn with_thumbnail(self, id: ImageId) -> NeighborOp {
        match self {
            NeighborOp::Add { add, .. } => NeighborOp::Add {
                add,
                thumbnail: Some(id),
            },
            NeighborOp::Change { change, .. } => NeighborOp::Change {
                change,
                thumbnail: Some(id),
            },
            other => other,
        }
    }
}

fn validate_item(index: usize, item: SharedProfileUpdateItem) -> Result<Validated, Status> {
    match item {
        SharedProfileUpdateItem::Refresh => Ok(Validated::Refresh),

        SharedProfileUpdateItem::Add(add) => {
            if !crate::crypto::is_valid_public_key(&add.public_key) {
                return Err(Status::invalid(format!("{index}.add.identityPublicKey")));
            }
            if !add.version.is_valid() {
                return Err(Status::invalid(format!("{index}.add.version")));
            }
            if add.name.is_empty() || add.name.len() > MAX_NAME_BYTES {
                return Err(Status::invalid(format!("{index}.add.name")));
            }
            if add.profile_type.len() > MAX_TYPE_BYTES {
                return Err(Status::invalid(format!("{index}.add.type")));
            }
            if add.extra_data.len() > MAX_EXTRA_DATA_BYTES {
                return Err(Status::invalid(format!("{index}.add.extraData")));
            }
            if !GeoLocation::new(add.latitude, add.longitude).is_valid() {
                return Err(Status::invalid(format!("{index}.add.latitude")));
            }
            if !add.thumbnail_image.is_empty() && !is_valid_image(&add.thumbnail_image) {
                return Err(Status::invalid(format!("{index}.add.thumbnailImage")));
            }

            let image = (!add.thumbnail_image.is_empty())
                .then(|| add.thumbnail_image.0.clone());
            Ok(Validated::Op {
                op: NeighborOp::Add {
                    add: *add,
                    thumbnail: None,
                },
                image,
            })
        }

        SharedProfileUpdateItem::Change(change) => {
            let any = change.set_version
                || change.set_name
                || change.set_location
                || change.set_extra_data
                || change.set_thumbnail;
            if !any {
                return Err(Status::invalid(format!("{index}.change.set*")));
            }
            if change.set_version && !change.version.is_valid() {
                return Err(Status::invalid(format!("{index}.change.version")));
            }
            if change.set_name && (change.name.is_empty() || change.name.len() > MAX_NAME_BYTES) {
                return Err(Status::invalid(format!("{index}.change.name")));
            }
            if change.set_location && !GeoLocation::new(change.latitude, change.longitude).is_valid()
            {
                return Err(Status::invalid(format!("{index}.change.latitude")));
            }
            if change.set_extra_data && change.extra_data.len() > MAX_EXTRA_DATA_BYTES {
                return Err(Status::invalid(format!("{index}.change.extraData")));
            }
            if change.set_thumbnail
                && !change.thumbnail_image.is_empty()
                && !is_valid_image(&change.thumbnail_image)
            {
                return Err(Status::invalid(format!("{index}.change.thumbnailImage")));
            }

            let image = (change.set_thumbnail && !change.thumbnail_image.is_empty())
                .then(|| change.thumbnail_image.0.clone());
            Ok(Validated::Op {
                op: NeighborOp::Change {
                    change: *change,
                    thumbnail: None,
                },
                image,
            })
        }

        SharedProfileUpdateItem::Delete { identity_id } => Ok(Validated::Op {
            op: NeighborOp::Delete { identity_id },
            image: None,
        }),
    }
}

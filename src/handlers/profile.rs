//! Profile updates and per-session application services.

use super::{reply, reply_error, Handled};
use crate::db::{ProfileChanges, StoreError};
use crate::images::is_valid_image;
use crate::net::message::{
    ConversationPayload, ConversationResponse, ProfileUpdate, Status, EXTRA_DATA_MAX, NAME_MAX,
    SERVICE_NAME_MAX,
};
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{GeoLocation, ImageId, SemVer, MAX_APPLICATION_SERVICES};
use std::sync::Arc;
use tracing::{debug, warn};

/// Partial profile update with set-flags.
///
/// The first update of an uninitialized profile must set version, name and
/// location. A changed image is staged to disk before the row update; the
/// replaced blobs are unlinked only after it. A crash in between leaks files
/// for the orphan sweep.
pub async fn update_profile(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    update: ProfileUpdate,
) -> Handled {
    let Some(identity) = session.identity_id().await else {
        return reply_error(Status::Internal);
    };
    let profile = match ctx.store.get_hosted(&identity) {
        Ok(Some(p)) => p,
        Ok(None) => return reply_error(Status::NotFound),
        Err(e) => {
            warn!("update lookup failed: {}", e);
            return reply_error(Status::Internal);
        }
    };

    if !update.any_set() {
        return reply_error(Status::invalid("set*"));
    }
    if !profile.is_initialized() {
        if !update.set_version {
            return reply_error(Status::invalid("setVersion"));
        }
        if !update.set_name {
            return reply_error(Status::invalid("setName"));
        }
        if !update.set_location {
            return reply_error(Status::invalid("setLocation"));
        }
    }

    if update.set_version && update.version != SemVer::V1 {
        return reply_error(Status::invalid("version"));
    }
    if update.set_name && (update.name.is_empty() || update.name.len() > NAME_MAX) {
        return reply_error(Status::invalid("name"));
    }
    if update.set_location
        && !GeoLocation::new(update.latitude, update.longitude).is_valid()
    {
        let field = if (-90.0..=90.0).contains(&update.latitude) && update.latitude.is_finite() {
            "longitude"
        } else {
            "latitude"
        };
        return reply_error(Status::invalid(field));
    }
    if update.set_extra_data && update.extra_data.len() > EXTRA_DATA_MAX {
        return reply_error(Status::invalid("extraData"));
    }
    if update.set_image {
        if !update.image.is_empty() && !is_valid_image(&update.image) {
            return reply_error(Status::invalid("image"));
        }
        if !update.thumbnail.is_empty() && !is_valid_image(&update.thumbnail) {
            return reply_error(Status::invalid("thumbnailImage"));
        }
        if update.image.is_empty() && !update.thumbnail.is_empty() {
            return reply_error(Status::invalid("thumbnailImage"));
        }
    }

    // Stage new blobs before touching the row.
    let mut staged: Vec<ImageId> = Vec::new();
    let images = if update.set_image {
        if update.image.is_empty() {
            Some(None)
        } else {
            let image_id = crate::crypto::random_image_id();
            if let Err(e) = ctx.images.write(&image_id, &update.image).await {
                warn!("image staging failed: {}", e);
                return reply_error(Status::Internal);
            }
            staged.push(image_id);

            let thumbnail_id = if update.thumbnail.is_empty() {
                None
            } else {
                let id = crate::crypto::random_image_id();
                if let Err(e) = ctx.images.write(&id, &update.thumbnail).await {
                    warn!("thumbnail staging failed: {}", e);
                    ctx.images.remove_all(&staged).await;
                    return reply_error(Status::Internal);
                }
                staged.push(id);
                Some(id)
            };
            Some(Some((image_id, thumbnail_id)))
        }
    } else {
        None
    };

    let changes = ProfileChanges {
        version: update.set_version.then_some(update.version),
        name: update.set_name.then(|| update.name.clone()),
        images,
        location: update.set_location.then_some((update.latitude, update.longitude)),
        extra_data: update.set_extra_data.then(|| update.extra_data.clone()),
    };

    match ctx.store.apply_profile_update(&identity, changes).await {
        Ok(applied) => {
            // Old blobs go away only after the committed row stopped
            // referencing them.
            ctx.images.remove_all(&applied.old_images).await;
            ctx.worker_signal.notify_one();
            debug!(
                "profile {} updated (first: {})",
                crate::crypto::fingerprint(&identity),
                applied.first_initialization
            );
            reply(ConversationResponse::ok(ConversationPayload::None))
        }
        Err(StoreError::NotFound) => {
            ctx.images.remove_all(&staged).await;
            reply_error(Status::NotFound)
        }
        Err(e) => {
            warn!("profile update failed: {}", e);
            ctx.images.remove_all(&staged).await;
            reply_error(Status::Internal)
        }
    }
}

/// Register application services on the checked-in session. The set is
/// capped; exceeding the cap applies nothing.
pub async fn application_service_add(
    session: &Arc<Session>,
    service_names: Vec<String>,
) -> Handled {
    for name in &service_names {
        if name.is_empty() || name.len() > SERVICE_NAME_MAX {
            return reply_error(Status::invalid("serviceName"));
        }
    }

    let mut state = session.state().await;
    let mut combined = state.application_services.clone();
    combined.extend(service_names.iter().cloned());
    if combined.len() > MAX_APPLICATION_SERVICES {
        return reply_error(Status::QuotaExceeded);
    }
    state.application_services = combined;
    reply(ConversationResponse::ok(ConversationPayload::None))
}

pub async fn application_service_remove(session: &Arc<Session>, service_name: &str) -> Handled {
    let mut state = session.state().await;
    if state.application_services.remove(service_name) {
        reply(ConversationResponse::ok(ConversationPayload::None))
    } else {
        reply_error(Status::NotFound)
    }
}

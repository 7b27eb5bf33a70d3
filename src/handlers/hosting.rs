//! Hosting agreement lifecycle and identity lookup.

use super::{reply, reply_error, Handled};
use crate::db::{RegisterOutcome, StoreError};
use crate::net::dispatch::Outcome;
use crate::net::message::{
    ConversationPayload, ConversationResponse, HostingContract, IdentityInfo, ImageBytes,
    SinglePayload, SingleResponse, Status, ThumbnailBytes,
};
use crate::net::serde_safe::BoundedVec;
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::IdentityId;
use std::sync::Arc;
use tracing::{info, warn};

/// Create or reactivate a hosted identity under a hosting-plan contract.
///
/// The contract key must be the key the conversation started with and the
/// signature must verify over the contract body. Plan semantics beyond the
/// recognized type literals are not checked here; see DESIGN.md.
pub async fn register_hosting(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    contract: HostingContract,
) -> Handled {
    let session_key = session.state().await.public_key;
    if session_key != Some(contract.public_key) {
        return reply_error(Status::invalid("contract.publicKey"));
    }
    if !HostingContract::RECOGNIZED_PLANS.contains(&contract.plan_type.as_str()) {
        return reply_error(Status::invalid("contract.planType"));
    }
    if crate::crypto::verify(
        &contract.public_key,
        &contract.signing_bytes(),
        &contract.signature,
    )
    .is_err()
    {
        return reply_error(Status::InvalidSignature);
    }

    match ctx
        .store
        .register_hosting(
            contract.public_key,
            &contract.plan_type,
            ctx.config.max_hosted_identities,
        )
        .await
    {
        Ok(RegisterOutcome::Created(p) | RegisterOutcome::Reactivated(p)) => {
            info!(
                "hosting registered for {} (plan {})",
                crate::crypto::fingerprint(&p.identity_id),
                p.plan_type
            );
            reply(ConversationResponse::ok(ConversationPayload::None))
        }
        Err(StoreError::AlreadyExists) => reply_error(Status::AlreadyExists),
        Err(StoreError::QuotaExceeded) => reply_error(Status::QuotaExceeded),
        Err(e) => {
            warn!("register hosting failed: {}", e);
            reply_error(Status::Internal)
        }
    }
}

/// End the hosting agreement of the checked-in identity. With a redirect the
/// profile stays queryable for the retention window; without one it expires
/// immediately and the next sweep removes it.
pub async fn cancel_hosting(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    redirect: Option<IdentityId>,
) -> Handled {
    let Some(identity) = session.identity_id().await else {
        return reply_error(Status::Internal);
    };

    match ctx.store.cancel_hosting(&identity, redirect).await {
        Ok(_) => {
            info!(
                "hosting cancelled for {} (redirect: {})",
                crate::crypto::fingerprint(&identity),
                redirect.is_some()
            );
            ctx.worker_signal.notify_one();
            reply(ConversationResponse::ok(ConversationPayload::None))
        }
        Err(StoreError::NotFound) => reply_error(Status::NotFound),
        Err(e) => {
            warn!("cancel hosting failed: {}", e);
            reply_error(Status::Internal)
        }
    }
}

/// Profile lookup by identity id, with optional image payloads and the
/// online session's application services.
pub async fn get_identity_information(
    ctx: &Arc<ServerContext>,
    identity_id: IdentityId,
    include_profile_image: bool,
    include_thumbnail_image: bool,
    include_application_services: bool,
) -> (SingleResponse, Outcome) {
    let profile = match ctx.store.get_hosted(&identity_id) {
        Ok(Some(p)) => p,
        Ok(None) => return (SingleResponse::error(Status::NotFound), Outcome::Continue),
        Err(e) => {
            warn!("identity lookup failed: {}", e);
            return (SingleResponse::error(Status::Internal), Outcome::Continue);
        }
    };

    let mut info = IdentityInfo {
        is_hosted: profile.is_active(),
        is_online: false,
        version: profile.version,
        name: profile.name.clone(),
        profile_type: profile.profile_type.clone(),
        latitude: profile.latitude,
        longitude: profile.longitude,
        extra_data: profile.extra_data.clone(),
        hosting_redirect: profile.hosting_redirect,
        application_services: BoundedVec::default(),
        profile_image: ImageBytes::default(),
        thumbnail_image: ThumbnailBytes::default(),
    };

    if let Some(online) = ctx.registry.online(&identity_id).await {
        info.is_online = true;
        if include_application_services {
            let mut services: Vec<String> = online
                .state()
                .await
                .application_services
                .iter()
                .cloned()
                .collect();
            services.sort();
            services.truncate(32);
            info.application_services = BoundedVec::new_unchecked(services);
        }
    }

    // A blob unlinked under a concurrent replace simply reads as absent.
    if include_profile_image {
        if let Some(id) = profile.profile_image {
            if let Ok(Some(data)) = ctx.images.read(&id).await {
                info.profile_image = ImageBytes::new_unchecked(data);
            }
        }
    }
    if include_thumbnail_image {
        if let Some(id) = profile.thumbnail_image {
            if let Ok(Some(data)) = ctx.images.read(&id).await {
                info.thumbnail_image = ThumbnailBytes::new_unchecked(data);
            }
        }
    }

    (
        SingleResponse::ok(SinglePayload::IdentityInformation(Box::new(info))),
        Outcome::Continue,
    )
}

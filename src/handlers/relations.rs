//! Related-identity cards: signed relationships between an issuer and the
//! hosted identity.

use super::{reply, reply_error, Handled};
use crate::db::StoreError;
use crate::net::message::{
    ConversationPayload, ConversationResponse, RelationCard, Status,
};
use crate::net::serde_safe::BoundedVec;
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{now, IdentityId, PublicKeyBytes, MAX_TYPE_BYTES};
use std::sync::Arc;
use tracing::warn;

/// Card integrity: the card id is the digest of the normalized card, the
/// issuer signs the card id, and the recipient signs the issuer-signed card.
fn validate_card(card: &RelationCard, session_key: &PublicKeyBytes) -> Result<(), Status> {
    if &card.recipient_public_key != session_key {
        return Err(Status::invalid("card.recipientPublicKey"));
    }
    if card.valid_from > card.valid_to {
        return Err(Status::invalid("card.validTo"));
    }
    if card.card_type.is_empty() || card.card_type.len() > MAX_TYPE_BYTES {
        return Err(Status::invalid("card.cardType"));
    }

    let canonical = card
        .canonical_bytes()
        .map_err(|_| Status::invalid("card"))?;
    if crate::crypto::sha256(&canonical) != card.card_id {
        return Err(Status::invalid("card.cardId"));
    }

    crate::crypto::verify(&card.issuer_public_key, &card.card_id, &card.issuer_signature)
        .map_err(|_| Status::InvalidSignature)?;
    crate::crypto::verify(
        &card.recipient_public_key,
        &card.recipient_signing_bytes(),
        &card.recipient_signature,
    )
    .map_err(|_| Status::InvalidSignature)?;
    Ok(())
}

pub async fn add_related_identity(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    card: RelationCard,
) -> Handled {
    let (identity, session_key) = {
        let state = session.state().await;
        match (state.identity_id, state.public_key) {
            (Some(i), Some(k)) => (i, k),
            _ => return reply_error(Status::Internal),
        }
    };

    if let Err(status) = validate_card(&card, &session_key) {
        return reply_error(status);
    }

    match ctx
        .store
        .add_relation(&identity, &card, ctx.config.max_identity_relations)
        .await
    {
        Ok(()) => reply(ConversationResponse::ok(ConversationPayload::None)),
        Err(StoreError::AlreadyExists) => reply_error(Status::AlreadyExists),
        Err(StoreError::QuotaExceeded) => reply_error(Status::QuotaExceeded),
        Err(e) => {
            warn!("add relation failed: {}", e);
            reply_error(Status::Internal)
        }
    }
}

pub async fn remove_related_identity(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    application_id: [u8; 32],
) -> Handled {
    let Some(identity) = session.identity_id().await else {
        return reply_error(Status::Internal);
    };

    match ctx.store.remove_relation(&identity, &application_id).await {
        Ok(true) => reply(ConversationResponse::ok(ConversationPayload::None)),
        Ok(false) => reply_error(Status::NotFound),
        Err(e) => {
            warn!("remove relation failed: {}", e);
            reply_error(Status::Internal)
        }
    }
}

/// Query cards of an identity with optional type and issuer filters. Cards
/// outside their validity window are only returned when asked for.
pub async fn get_relationships(
    ctx: &Arc<ServerContext>,
    identity_id: IdentityId,
    include_invalid: bool,
    card_type: Option<String>,
    issuer: Option<PublicKeyBytes>,
) -> Handled {
    let cards = match ctx.store.get_relations(&identity_id) {
        Ok(c) => c,
        Err(e) => {
            warn!("relation query failed: {}", e);
            return reply_error(Status::Internal);
        }
    };

    let at = now();
    let mut matched: Vec<RelationCard> = cards
        .into_iter()
        .filter(|c| include_invalid || (c.valid_from <= at && at <= c.valid_to))
        .filter(|c| card_type.as_deref().is_none_or(|t| c.card_type == t))
        .filter(|c| issuer.is_none_or(|i| c.issuer_public_key == i))
        .collect();
    matched.truncate(256);

    reply(ConversationResponse::ok(
        ConversationPayload::IdentityRelationships {
            cards: BoundedVec::new_unchecked(matched),
        },
    ))
}

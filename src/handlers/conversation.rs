//! Conversation establishment: Start, VerifyIdentity, CheckIn.

use super::{reply, reply_error, Handled};
use crate::net::message::{
    ConversationPayload, ConversationResponse, SignatureBytes, Status,
};
use crate::net::serde_safe::BoundedVec;
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{ConversationStatus, PublicKeyBytes, SemVer};
use std::sync::Arc;
use tracing::{debug, warn};

/// Version negotiation and challenge exchange.
///
/// Picks the highest version both sides speak (currently only 1.0.0), binds
/// the session to `sha256(public_key)` — this binding happens only on the
/// `None -> Started` edge — and returns the server's key, its signature over
/// the client challenge, and a fresh server challenge.
pub async fn start(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    versions: &BoundedVec<SemVer, 16>,
    client_challenge: [u8; 32],
    public_key: PublicKeyBytes,
) -> Handled {
    if !versions.iter().any(|v| *v == SemVer::V1) {
        return reply_error(Status::Unsupported);
    }

    let challenge = crate::crypto::random_challenge();
    let signature = ctx.keypair.sign(&client_challenge);

    {
        let mut state = session.state().await;
        state.status = ConversationStatus::Started;
        state.client_version = SemVer::V1;
        state.public_key = Some(public_key);
        state.identity_id = Some(crate::crypto::identity_id(&public_key));
        state.challenge = challenge;
    }

    debug!(
        "session {}: conversation started with {}",
        session.id,
        crate::crypto::fingerprint(&public_key)
    );

    reply(ConversationResponse::ok(ConversationPayload::Start {
        version: SemVer::V1,
        public_key: ctx.keypair.public(),
        signature: SignatureBytes::new_unchecked(signature.to_vec()),
        client_challenge,
        challenge,
    }))
}

/// Shared signature check for VerifyIdentity and CheckIn: the echoed
/// challenge must be the one this session was issued, and the signature over
/// it must verify against the session's bound public key.
async fn check_challenge_signature(
    session: &Arc<Session>,
    challenge: [u8; 32],
    signature: &SignatureBytes,
) -> Result<PublicKeyBytes, Status> {
    let state = session.state().await;
    if state.challenge != challenge {
        return Err(Status::invalid("challenge"));
    }
    let public_key = state.public_key.ok_or(Status::BadConversationStatus)?;
    drop(state);

    crate::crypto::verify(&public_key, &challenge, signature)
        .map_err(|_| Status::InvalidSignature)?;
    Ok(public_key)
}

/// Public-key recovery against the stored server challenge; advances the
/// conversation to `Verified`.
pub async fn verify_identity(
    session: &Arc<Session>,
    challenge: [u8; 32],
    signature: &SignatureBytes,
) -> Handled {
    match check_challenge_signature(session, challenge, signature).await {
        Ok(_) => {
            session.state().await.status = ConversationStatus::Verified;
            reply(ConversationResponse::ok(ConversationPayload::None))
        }
        Err(status) => reply_error(status),
    }
}

/// Same proof as `VerifyIdentity`, plus the identity must be hosted here.
/// Advances to `Authenticated` and registers the session as the identity's
/// online connection; a previous connection of the same identity is replaced
/// and disconnected.
pub async fn check_in(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    challenge: [u8; 32],
    signature: &SignatureBytes,
) -> Handled {
    let public_key = match check_challenge_signature(session, challenge, signature).await {
        Ok(k) => k,
        Err(status) => return reply_error(status),
    };

    let identity = crate::crypto::identity_id(&public_key);
    match ctx.store.get_hosted(&identity) {
        Ok(Some(profile)) if profile.is_active() => {}
        Ok(_) => return reply_error(Status::NotFound),
        Err(e) => {
            warn!("check-in lookup failed: {}", e);
            return reply_error(Status::Internal);
        }
    }

    session.state().await.status = ConversationStatus::Authenticated;
    if let Some(replaced) = ctx.registry.check_in(identity, session.clone()).await {
        replaced.force_close().await;
    }

    debug!(
        "session {}: identity {} checked in",
        session.id,
        crate::crypto::fingerprint(&identity)
    );
    reply(ConversationResponse::ok(ConversationPayload::None))
}

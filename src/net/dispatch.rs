//! Request dispatcher: precondition gates, routing, response matching.
//!
//! Each request kind declares the listener roles it may arrive on and the
//! conversation status it requires; the gate runs before any handler. Role
//! and status mismatches are protocol violations: the error status is sent
//! and the connection closes without any state change.
//!
//! Responses are paired with the server-originated request of the same
//! message id. A response that matches nothing, or mismatches the pending
//! request's single/conversation kind or request type (unless it carries an
//! error status), closes the connection.

use crate::handlers;
use crate::net::message::{
    Body, ConversationPayload, ConversationRequest, ConversationResponse, Message, Request,
    RequestKind, Response, SinglePayload, SingleRequest, SingleResponse, Status,
};
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{
    ConversationStatus, RoleSet, StatusGate, ROLE_CLIENT_APP_SERVICE, ROLE_CLIENT_CUSTOMER,
    ROLE_CLIENT_NON_CUSTOMER, ROLE_PRIMARY, ROLE_SERVER_NEIGHBOR,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the connection loop does after a message is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close,
}

// =============================================================================
// PRECONDITION TABLE
// =============================================================================

/// Roles a single request may arrive on. Zero means the kind is only ever
/// server-originated and never valid inbound.
fn single_roles(kind: RequestKind) -> RoleSet {
    match kind {
        RequestKind::Ping => {
            ROLE_PRIMARY
                | ROLE_SERVER_NEIGHBOR
                | ROLE_CLIENT_NON_CUSTOMER
                | ROLE_CLIENT_CUSTOMER
                | ROLE_CLIENT_APP_SERVICE
        }
        RequestKind::ListRoles => ROLE_PRIMARY,
        RequestKind::GetIdentityInformation => ROLE_CLIENT_NON_CUSTOMER | ROLE_CLIENT_CUSTOMER,
        RequestKind::ApplicationServiceSendMessage => ROLE_CLIENT_APP_SERVICE,
        _ => 0,
    }
}

/// Roles and conversation status a conversation request requires. Zero roles
/// marks server-originated kinds.
fn conversation_preconditions(kind: RequestKind) -> (RoleSet, StatusGate) {
    match kind {
        RequestKind::Start => (
            ROLE_SERVER_NEIGHBOR | ROLE_CLIENT_NON_CUSTOMER | ROLE_CLIENT_CUSTOMER,
            StatusGate::NoneOnly,
        ),
        RequestKind::VerifyIdentity => (
            ROLE_SERVER_NEIGHBOR | ROLE_CLIENT_NON_CUSTOMER,
            StatusGate::Started,
        ),
        RequestKind::CheckIn => (ROLE_CLIENT_CUSTOMER, StatusGate::Started),
        RequestKind::RegisterHosting => (ROLE_CLIENT_NON_CUSTOMER, StatusGate::Started),
        RequestKind::UpdateProfile => (ROLE_CLIENT_CUSTOMER, StatusGate::Authenticated),
        RequestKind::CancelHostingAgreement => (ROLE_CLIENT_CUSTOMER, StatusGate::Authenticated),
        RequestKind::ApplicationServiceAdd => (ROLE_CLIENT_CUSTOMER, StatusGate::Authenticated),
        RequestKind::ApplicationServiceRemove => (ROLE_CLIENT_CUSTOMER, StatusGate::Authenticated),
        RequestKind::CallIdentityApplicationService => (
            ROLE_CLIENT_NON_CUSTOMER | ROLE_CLIENT_CUSTOMER,
            StatusGate::Verified,
        ),
        RequestKind::ProfileSearch | RequestKind::ProfileSearchPart => (
            ROLE_CLIENT_NON_CUSTOMER | ROLE_CLIENT_CUSTOMER,
            StatusGate::Any,
        ),
        RequestKind::AddRelatedIdentity | RequestKind::RemoveRelatedIdentity => {
            (ROLE_CLIENT_CUSTOMER, StatusGate::Authenticated)
        }
        RequestKind::GetIdentityRelationshipsInformation => (
            ROLE_CLIENT_NON_CUSTOMER | ROLE_CLIENT_CUSTOMER,
            StatusGate::Any,
        ),
        RequestKind::StartNeighborhoodInitialization => {
            (ROLE_SERVER_NEIGHBOR, StatusGate::Verified)
        }
        RequestKind::NeighborhoodSharedProfileUpdate => {
            (ROLE_SERVER_NEIGHBOR, StatusGate::Verified)
        }
        RequestKind::StopNeighborhoodUpdates => (ROLE_SERVER_NEIGHBOR, StatusGate::Verified),
        // Server-originated kinds; never valid inbound.
        RequestKind::IncomingCallNotification
        | RequestKind::FinishNeighborhoodInitialization
        | RequestKind::ApplicationServiceReceiveMessageNotification
        | RequestKind::Ping
        | RequestKind::ListRoles
        | RequestKind::GetIdentityInformation
        | RequestKind::ApplicationServiceSendMessage => (0, StatusGate::Any),
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

pub async fn dispatch_message(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    msg: Message,
) -> Outcome {
    session.touch();
    match msg.body {
        Body::Request(Request::Single(req)) => dispatch_single(ctx, session, msg.id, req).await,
        Body::Request(Request::Conversation(req)) => {
            dispatch_conversation(ctx, session, msg.id, req).await
        }
        Body::Response(resp) => dispatch_response(session, msg.id, resp).await,
    }
}

async fn dispatch_single(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    id: u32,
    req: SingleRequest,
) -> Outcome {
    let allowed = single_roles(req.kind());
    if allowed == 0 {
        session
            .send_response(id, Response::Single(SingleResponse::error(Status::ProtocolViolation)))
            .await;
        return Outcome::Close;
    }
    if session.roles & allowed == 0 {
        session
            .send_response(id, Response::Single(SingleResponse::error(Status::BadRole)))
            .await;
        return Outcome::Close;
    }

    let (response, outcome) = match req {
        SingleRequest::Ping(payload) => (
            Some(SingleResponse::ok(SinglePayload::Ping(payload))),
            Outcome::Continue,
        ),
        SingleRequest::ListRoles => (
            Some(SingleResponse::ok(SinglePayload::ListRoles(ctx.role_infos()))),
            Outcome::Continue,
        ),
        SingleRequest::GetIdentityInformation {
            identity_id,
            include_profile_image,
            include_thumbnail_image,
            include_application_services,
        } => {
            let (response, outcome) = handlers::hosting::get_identity_information(
                ctx,
                identity_id,
                include_profile_image,
                include_thumbnail_image,
                include_application_services,
            )
            .await;
            (Some(response), outcome)
        }
        // Forwarded payloads suspend; the relay answers them asynchronously.
        SingleRequest::ApplicationServiceSendMessage { token, message } => {
            crate::relay::handle_app_service_message(ctx, session, id, token, message.into_inner())
                .await
        }
        SingleRequest::ApplicationServiceReceiveMessageNotification { .. } => (
            Some(SingleResponse::error(Status::ProtocolViolation)),
            Outcome::Close,
        ),
    };

    if let Some(response) = response {
        session.send_response(id, Response::Single(response)).await;
    }
    outcome
}

async fn dispatch_conversation(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    id: u32,
    req: ConversationRequest,
) -> Outcome {
    let kind = req.kind();
    let (allowed, gate) = conversation_preconditions(kind);

    if allowed == 0 {
        session
            .send_response(
                id,
                Response::Conversation(ConversationResponse::error(Status::ProtocolViolation)),
            )
            .await;
        return Outcome::Close;
    }
    if session.roles & allowed == 0 {
        debug!("bad role for {:?} on {}", kind, crate::types::role_name(session.roles));
        session
            .send_response(id, Response::Conversation(ConversationResponse::error(Status::BadRole)))
            .await;
        return Outcome::Close;
    }

    let status = session.status().await;
    if !gate.admits(status) {
        let error = if gate == StatusGate::Authenticated && status != ConversationStatus::None {
            Status::Unauthorized
        } else {
            Status::BadConversationStatus
        };
        session
            .send_response(id, Response::Conversation(ConversationResponse::error(error)))
            .await;
        return Outcome::Close;
    }

    let (response, outcome) = match req {
        ConversationRequest::Start {
            versions,
            challenge,
            public_key,
        } => handlers::conversation::start(ctx, session, &versions, challenge, public_key).await,
        ConversationRequest::VerifyIdentity { challenge, signature } => {
            handlers::conversation::verify_identity(session, challenge, &signature).await
        }
        ConversationRequest::CheckIn { challenge, signature } => {
            handlers::conversation::check_in(ctx, session, challenge, &signature).await
        }
        ConversationRequest::RegisterHosting { contract } => {
            handlers::hosting::register_hosting(ctx, session, contract).await
        }
        ConversationRequest::UpdateProfile(update) => {
            handlers::profile::update_profile(ctx, session, *update).await
        }
        ConversationRequest::CancelHostingAgreement { redirect } => {
            handlers::hosting::cancel_hosting(ctx, session, redirect).await
        }
        ConversationRequest::ApplicationServiceAdd { service_names } => {
            handlers::profile::application_service_add(session, service_names.into_inner()).await
        }
        ConversationRequest::ApplicationServiceRemove { service_name } => {
            handlers::profile::application_service_remove(session, &service_name).await
        }
        ConversationRequest::CallIdentityApplicationService {
            identity_id,
            service_name,
        } => {
            // A suspended caller gets its response from the relay engine.
            match crate::relay::handle_call(ctx, session, id, identity_id, service_name).await {
                Some(response) => (Some(response), Outcome::Continue),
                None => (None, Outcome::Continue),
            }
        }
        ConversationRequest::ProfileSearch(query) => {
            crate::search::profile_search(ctx, session, *query).await
        }
        ConversationRequest::ProfileSearchPart {
            record_index,
            record_count,
        } => crate::search::profile_search_part(session, record_index, record_count).await,
        ConversationRequest::AddRelatedIdentity { card } => {
            handlers::relations::add_related_identity(ctx, session, *card).await
        }
        ConversationRequest::RemoveRelatedIdentity { application_id } => {
            handlers::relations::remove_related_identity(ctx, session, application_id).await
        }
        ConversationRequest::GetIdentityRelationshipsInformation {
            identity_id,
            include_invalid,
            card_type,
            issuer,
        } => {
            handlers::relations::get_relationships(
                ctx,
                identity_id,
                include_invalid,
                card_type,
                issuer,
            )
            .await
        }
        ConversationRequest::StartNeighborhoodInitialization {
            primary_port,
            neighbor_port,
        } => {
            crate::replication::outbound::start_initialization(
                ctx,
                session,
                primary_port,
                neighbor_port,
            )
            .await
        }
        ConversationRequest::NeighborhoodSharedProfileUpdate { items } => {
            crate::replication::inbound::shared_profile_update(ctx, session, items.into_inner())
                .await
        }
        ConversationRequest::StopNeighborhoodUpdates => {
            crate::replication::outbound::stop_updates(ctx, session).await
        }
        // Zero-role kinds were rejected above.
        ConversationRequest::IncomingCallNotification { .. }
        | ConversationRequest::FinishNeighborhoodInitialization => unreachable!(),
    };

    if let Some(response) = response {
        session.send_response(id, Response::Conversation(response)).await;
    }
    outcome
}

// =============================================================================
// RESPONSE MATCHING
// =============================================================================

/// Kind a response payload answers, when the payload alone determines it.
fn conversation_payload_kind(payload: &ConversationPayload) -> Option<RequestKind> {
    match payload {
        ConversationPayload::None => None,
        ConversationPayload::Start { .. } => Some(RequestKind::Start),
        ConversationPayload::CallIdentityApplicationService { .. } => {
            Some(RequestKind::CallIdentityApplicationService)
        }
        ConversationPayload::ProfileSearch(_) => Some(RequestKind::ProfileSearch),
        ConversationPayload::ProfileSearchPart { .. } => Some(RequestKind::ProfileSearchPart),
        ConversationPayload::IdentityRelationships { .. } => {
            Some(RequestKind::GetIdentityRelationshipsInformation)
        }
    }
}

fn single_payload_kind(payload: &SinglePayload) -> Option<RequestKind> {
    match payload {
        SinglePayload::None => None,
        SinglePayload::Ping(_) => Some(RequestKind::Ping),
        SinglePayload::ListRoles(_) => Some(RequestKind::ListRoles),
        SinglePayload::IdentityInformation(_) => Some(RequestKind::GetIdentityInformation),
    }
}

async fn dispatch_response(session: &Arc<Session>, id: u32, resp: Response) -> Outcome {
    let Some(pending) = session.take_pending(id).await else {
        warn!("session {}: unmatched response id {}", session.id, id);
        return Outcome::Close;
    };

    // The single/conversation kind must match; the request type must match
    // unless the response carries an error status.
    let valid = match &resp {
        Response::Single(r) => {
            !pending.conversation
                && (!r.status.is_ok()
                    || single_payload_kind(&r.payload).is_none_or(|k| k == pending.kind))
        }
        Response::Conversation(r) => {
            pending.conversation
                && (!r.status.is_ok()
                    || conversation_payload_kind(&r.payload).is_none_or(|k| k == pending.kind))
        }
    };

    if !valid {
        warn!(
            "session {}: response id {} mismatches pending {:?}",
            session.id, id, pending.kind
        );
        return Outcome::Close;
    }

    // Receiver may be gone (timeout already fired); that is not an error.
    let _ = pending.reply.send(resp);
    Outcome::Continue
}

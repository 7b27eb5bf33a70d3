//! Application-service relay: tokenized message forwarding between two
//! authenticated identities across two independent connections.
//!
//! A call starts on the caller's verified connection, suspends there while
//! the callee answers an `IncomingCallNotification` on its checked-in
//! connection, and then moves to two fresh connections on the app-service
//! port, paired to the relay by token. Once established, a payload from one
//! side is delivered as a request to the other; the acknowledgement travels
//! back as the sender's response, so each direction runs in lockstep.
//!
//! Suspension, not nested awaits: both the caller's call request and a
//! sender's payload request are answered by detached tasks, so a session's
//! reader never blocks on the peer. Blocking the reader would deadlock two
//! simultaneous sends — each side's acknowledgement could only be read by
//! the reader waiting for it. A per-direction lock keeps the forward/ack
//! lockstep; the two directions stay independent.

use crate::net::dispatch::Outcome;
use crate::net::message::{
    ConversationPayload, ConversationRequest, ConversationResponse, Request, Response,
    SingleRequest, SingleResponse, Status,
};
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{
    now, IdentityId, PublicKeyBytes, RelayToken, INCOMING_CALL_TIMEOUT_SECS,
    RELAY_PAIRING_TIMEOUT_SECS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

// =============================================================================
// RELAY OBJECT
// =============================================================================

/// Relay lifecycle.
///
/// ```text
/// Created ──► CalleeNotified ──► CalleeAccepted ──► Established ──► Closed
///    │              │                  │                 │
///    └──────────────┴──────────────────┴─────────────────┴──► Closed
///                (rejection, timeout, disconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayPhase {
    Created,
    CalleeNotified,
    CalleeAccepted,
    Established,
    Closed,
}

struct RelayInner {
    phase: RelayPhase,
    /// App-service connections, bound during pairing.
    caller_conn: Option<Arc<Session>>,
    callee_conn: Option<Arc<Session>>,
}

pub struct Relay {
    pub caller_token: RelayToken,
    pub callee_token: RelayToken,
    pub service_name: String,
    pub caller_public_key: PublicKeyBytes,
    pub callee_identity: IdentityId,
    pub created_at: u64,
    inner: Mutex<RelayInner>,
    established: Notify,
    // Per-direction forward locks; tokio mutexes are FIFO, so queued
    // payloads of one direction keep their order.
    caller_dir: Mutex<()>,
    callee_dir: Mutex<()>,
}

impl Relay {
    fn new(service_name: String, caller_public_key: PublicKeyBytes, callee_identity: IdentityId) -> Self {
        Self {
            caller_token: crate::crypto::random_token(),
            callee_token: crate::crypto::random_token(),
            service_name,
            caller_public_key,
            callee_identity,
            created_at: now(),
            inner: Mutex::new(RelayInner {
                phase: RelayPhase::Created,
                caller_conn: None,
                callee_conn: None,
            }),
            established: Notify::new(),
            caller_dir: Mutex::new(()),
            callee_dir: Mutex::new(()),
        }
    }

    fn direction(&self, side: RelaySide) -> &Mutex<()> {
        match side {
            RelaySide::Caller => &self.caller_dir,
            RelaySide::Callee => &self.callee_dir,
        }
    }

    #[cfg(test)]
    pub fn for_tests(
        service_name: String,
        caller_public_key: PublicKeyBytes,
        callee_identity: IdentityId,
    ) -> Self {
        Self::new(service_name, caller_public_key, callee_identity)
    }

    pub async fn phase(&self) -> RelayPhase {
        self.inner.lock().await.phase
    }

    async fn set_phase(&self, phase: RelayPhase) {
        self.inner.lock().await.phase = phase;
    }

    /// Which side a token addresses, if it belongs to this relay at all.
    pub fn side_of(&self, token: &RelayToken) -> Option<RelaySide> {
        if token == &self.caller_token {
            Some(RelaySide::Caller)
        } else if token == &self.callee_token {
            Some(RelaySide::Callee)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    Caller,
    Callee,
}

// =============================================================================
// CALL SETUP
// =============================================================================

/// Open a call. Returns `Some(response)` for an immediate failure; `None`
/// means the caller is suspended and will be answered when the callee
/// settles the notification.
pub async fn handle_call(
    ctx: &Arc<ServerContext>,
    caller: &Arc<Session>,
    request_id: u32,
    callee_id: IdentityId,
    service_name: String,
) -> Option<ConversationResponse> {
    let callee_profile = match ctx.store.get_hosted(&callee_id) {
        Ok(Some(p)) => p,
        Ok(None) => return Some(ConversationResponse::error(Status::invalid("identityId"))),
        Err(e) => {
            warn!("call lookup failed: {}", e);
            return Some(ConversationResponse::error(Status::Internal));
        }
    };
    if !callee_profile.is_initialized() {
        return Some(ConversationResponse::error(Status::Uninitialized));
    }

    let Some(callee_session) = ctx.registry.online(&callee_id).await else {
        return Some(ConversationResponse::error(Status::NotAvailable));
    };
    if !callee_session
        .state()
        .await
        .application_services
        .contains(&service_name)
    {
        return Some(ConversationResponse::error(Status::invalid("serviceName")));
    }

    let caller_key = match caller.state().await.public_key {
        Some(k) => k,
        None => return Some(ConversationResponse::error(Status::Internal)),
    };

    let relay = Arc::new(Relay::new(service_name.clone(), caller_key, callee_id));
    ctx.registry.register_relay(relay.clone()).await;

    debug!(
        "relay {} -> {}: created for service {:?}",
        crate::crypto::fingerprint(&relay.caller_token),
        crate::crypto::fingerprint(&relay.callee_token),
        service_name
    );

    // Notify the callee on its checked-in connection.
    let notification = Request::Conversation(ConversationRequest::IncomingCallNotification {
        caller_public_key: caller_key,
        service_name,
        callee_token: relay.callee_token,
    });
    let Some(answer) = callee_session.send_request(notification).await else {
        destroy_relay(ctx, &relay).await;
        return Some(ConversationResponse::error(Status::NotAvailable));
    };
    relay.set_phase(RelayPhase::CalleeNotified).await;

    // Pairing watchdog: the whole relay lives RELAY_PAIRING_TIMEOUT_SECS to
    // reach Established.
    {
        let ctx = ctx.clone();
        let relay = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RELAY_PAIRING_TIMEOUT_SECS)).await;
            if relay.phase().await != RelayPhase::Established {
                debug!(
                    "relay {}: pairing timeout",
                    crate::crypto::fingerprint(&relay.caller_token)
                );
                destroy_relay(&ctx, &relay).await;
            }
        });
    }

    // Suspend the caller: the settlement task owns its response.
    let ctx = ctx.clone();
    let caller = caller.clone();
    let relay_task = relay.clone();
    tokio::spawn(async move {
        let response = match timeout(Duration::from_secs(INCOMING_CALL_TIMEOUT_SECS), answer).await
        {
            Ok(Ok(Response::Conversation(r))) if r.status.is_ok() => {
                relay_task.set_phase(RelayPhase::CalleeAccepted).await;
                Some(ConversationResponse::ok(
                    ConversationPayload::CallIdentityApplicationService {
                        caller_token: relay_task.caller_token,
                    },
                ))
            }
            // Callee declined.
            Ok(Ok(_)) => None,
            // Callee disconnected or never answered.
            Ok(Err(_)) | Err(_) => Some(ConversationResponse::error(Status::NotAvailable)),
        };

        let response = match response {
            Some(r) => r,
            None => ConversationResponse::error(Status::Rejected),
        };

        let accepted = response.status.is_ok();
        caller
            .send_response(request_id, Response::Conversation(response))
            .await;
        if !accepted {
            destroy_relay(&ctx, &relay_task).await;
        }
    });

    None
}

// =============================================================================
// APP-SERVICE PORT
// =============================================================================

/// Handle an `ApplicationServiceSendMessage` on the app-service port: the
/// first message pairs the connection to its relay side, later messages are
/// forwarded to the peer and answered with the peer's acknowledgement.
///
/// Forwarding suspends the sender's request (`None` response): a detached
/// task awaits the peer acknowledgement and answers under the original
/// message id, leaving this session's reader free to serve deliveries going
/// the other way.
pub async fn handle_app_service_message(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    request_id: u32,
    token: RelayToken,
    message: Vec<u8>,
) -> (Option<SingleResponse>, Outcome) {
    let bound = session.state().await.relay_token;

    match bound {
        None => {
            let (response, outcome) = pair_connection(ctx, session, token).await;
            (Some(response), outcome)
        }
        Some(t) if t != token => {
            // Cross-token abuse on a paired connection.
            (Some(SingleResponse::error(Status::NotFound)), Outcome::Close)
        }
        Some(_) => {
            let Some(relay) = ctx.registry.relay_by_token(&token).await else {
                return (Some(SingleResponse::error(Status::NotFound)), Outcome::Close);
            };
            let Some(side) = relay.side_of(&token) else {
                return (Some(SingleResponse::error(Status::NotFound)), Outcome::Close);
            };

            let ctx = ctx.clone();
            let session = session.clone();
            tokio::spawn(async move {
                // Lockstep per direction: the next payload of this side is
                // not forwarded until this one is acknowledged.
                let guard = relay.direction(side).lock().await;
                let (response, close) = forward_payload(&ctx, &relay, side, message).await;
                drop(guard);

                session
                    .send_response(request_id, Response::Single(response))
                    .await;
                if close {
                    session.force_close().await;
                }
            });
            (None, Outcome::Continue)
        }
    }
}

async fn pair_connection(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    token: RelayToken,
) -> (SingleResponse, Outcome) {
    let Some(relay) = ctx.registry.relay_by_token(&token).await else {
        return (SingleResponse::error(Status::NotFound), Outcome::Close);
    };
    let side = match relay.side_of(&token) {
        Some(s) => s,
        None => return (SingleResponse::error(Status::NotFound), Outcome::Close),
    };

    let both_bound = {
        let mut inner = relay.inner.lock().await;
        if inner.phase == RelayPhase::Closed {
            return (SingleResponse::error(Status::NotFound), Outcome::Close);
        }
        let slot = match side {
            RelaySide::Caller => &mut inner.caller_conn,
            RelaySide::Callee => &mut inner.callee_conn,
        };
        if slot.is_some() {
            // First match wins; a second connection with the same token is
            // an abuse.
            return (SingleResponse::error(Status::NotFound), Outcome::Close);
        }
        *slot = Some(session.clone());
        inner.caller_conn.is_some() && inner.callee_conn.is_some()
    };

    session.state().await.relay_token = Some(token);
    if both_bound {
        relay.set_phase(RelayPhase::Established).await;
        relay.established.notify_waiters();
        debug!(
            "relay {}: established",
            crate::crypto::fingerprint(&relay.caller_token)
        );
    }

    (SingleResponse::ok(crate::net::message::SinglePayload::None), Outcome::Continue)
}

/// Deliver one payload to the peer side and translate its acknowledgement.
/// The bool is "close the sender's connection".
async fn forward_payload(
    ctx: &Arc<ServerContext>,
    relay: &Arc<Relay>,
    side: RelaySide,
    message: Vec<u8>,
) -> (SingleResponse, bool) {
    // The peer may still be pairing; wait out the remainder of the window.
    // The waiter is registered before the phase re-check so an establish
    // landing in between is not lost.
    let notified = relay.established.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if relay.phase().await != RelayPhase::Established {
        let deadline = relay
            .created_at
            .saturating_add(RELAY_PAIRING_TIMEOUT_SECS)
            .saturating_sub(now());
        if timeout(Duration::from_secs(deadline.max(1)), notified).await.is_err()
            || relay.phase().await != RelayPhase::Established
        {
            destroy_relay(ctx, relay).await;
            return (SingleResponse::error(Status::NotAvailable), true);
        }
    }

    let peer = {
        let inner = relay.inner.lock().await;
        match side {
            RelaySide::Caller => inner.callee_conn.clone(),
            RelaySide::Callee => inner.caller_conn.clone(),
        }
    };
    let Some(peer) = peer else {
        destroy_relay(ctx, relay).await;
        return (SingleResponse::error(Status::NotAvailable), true);
    };

    let delivery = Request::Single(SingleRequest::ApplicationServiceReceiveMessageNotification {
        message: crate::net::message::AppMessageBytes::new_unchecked(message),
    });
    let Some(ack) = peer.send_request(delivery).await else {
        destroy_relay(ctx, relay).await;
        return (SingleResponse::error(Status::NotAvailable), true);
    };

    match ack.await {
        // The peer's acknowledgement status becomes the sender's response.
        Ok(Response::Single(r)) => (
            SingleResponse {
                status: r.status,
                payload: crate::net::message::SinglePayload::None,
            },
            false,
        ),
        Ok(Response::Conversation(_)) | Err(_) => {
            destroy_relay(ctx, relay).await;
            (SingleResponse::error(Status::NotAvailable), true)
        }
    }
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// Close the relay: unregister both tokens and disconnect any bound
/// app-service connections. Idempotent.
pub async fn destroy_relay(ctx: &Arc<ServerContext>, relay: &Arc<Relay>) {
    let (caller_conn, callee_conn) = {
        let mut inner = relay.inner.lock().await;
        if inner.phase == RelayPhase::Closed {
            return;
        }
        inner.phase = RelayPhase::Closed;
        (inner.caller_conn.take(), inner.callee_conn.take())
    };

    ctx.registry.remove_relay(relay).await;
    relay.established.notify_waiters();

    for conn in [caller_conn, callee_conn].into_iter().flatten() {
        conn.force_close().await;
    }

    debug!(
        "relay {}: destroyed",
        crate::crypto::fingerprint(&relay.caller_token)
    );
}

/// Session cleanup hook: an app-service connection going away destroys the
/// relay it was paired to, which also closes the peer.
pub async fn on_session_closed(ctx: &Arc<ServerContext>, session: &Arc<Session>) {
    let token = session.state().await.relay_token;
    if let Some(token) = token {
        if let Some(relay) = ctx.registry.relay_by_token(&token).await {
            destroy_relay(ctx, &relay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_side_resolution() {
        let relay = Relay::new("chat".into(), [1u8; 32], [2u8; 32]);
        assert_eq!(relay.side_of(&relay.caller_token), Some(RelaySide::Caller));
        assert_eq!(relay.side_of(&relay.callee_token), Some(RelaySide::Callee));
        assert_eq!(relay.side_of(&[0u8; 16]), None);
        assert_ne!(relay.caller_token, relay.callee_token);
    }

    #[tokio::test]
    async fn test_relay_phase_starts_created() {
        let relay = Relay::new("chat".into(), [1u8; 32], [2u8; 32]);
        assert_eq!(relay.phase().await, RelayPhase::Created);
    }
}

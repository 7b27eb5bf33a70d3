//! Neighborhood action worker and client-mode connections to peer servers.
//!
//! A single background task consumes the action queue FIFO per follower:
//! pick the next deliverable action, open a short-lived connection to the
//! follower's neighbor port, authenticate, deliver the corresponding update,
//! delete the action. Delivery failures back off to the next tick; a
//! follower that stays unreachable is dropped together with its queue.

use crate::crypto::Keypair;
use crate::db::ActionKind;
use crate::net::frame::{read_message, write_message, FrameError};
use crate::net::message::{
    Body, ConversationPayload, ConversationRequest, ConversationResponse, Message, Request,
    Response, SharedProfileAdd, SharedProfileChange, SharedProfileUpdateItem, SignatureBytes,
    Status, ThumbnailBytes,
};
use crate::net::serde_safe::BoundedVec;
use crate::net::server::ServerContext;
use crate::types::{IdentityId, PublicKeyBytes, SemVer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Queue re-check interval when no signal arrives.
pub const WORKER_TICK_SECS: u64 = 10;

/// Consecutive delivery failures before a follower is dropped.
pub const FOLLOWER_FAILURE_LIMIT: u32 = 5;

/// Per-operation network deadline for client-mode calls.
const CLIENT_IO_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("peer answered {0:?}")]
    Status(Status),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("operation timed out")]
    Timeout,
}

// =============================================================================
// CLIENT-MODE CONNECTION
// =============================================================================

/// Outbound connection to another server's neighbor port, speaking the same
/// framed protocol from the client side.
pub struct PeerClient {
    stream: TcpStream,
    next_id: u32,
    pub server_public_key: Option<PublicKeyBytes>,
    pub server_identity: Option<IdentityId>,
}

impl PeerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, WorkerError> {
        let stream = timeout(
            Duration::from_secs(CLIENT_IO_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| WorkerError::Timeout)??;
        Ok(Self {
            stream,
            next_id: 1,
            server_public_key: None,
            server_identity: None,
        })
    }

    async fn send(&mut self, request: Request) -> Result<u32, WorkerError> {
        let id = self.next_id;
        self.next_id += 1;
        write_message(&mut self.stream, &Message::request(id, request)).await?;
        Ok(id)
    }

    pub async fn send_response(&mut self, id: u32, response: Response) -> Result<(), WorkerError> {
        write_message(&mut self.stream, &Message::response(id, response)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, WorkerError> {
        timeout(
            Duration::from_secs(CLIENT_IO_TIMEOUT_SECS),
            read_message(&mut self.stream),
        )
        .await
        .map_err(|_| WorkerError::Timeout)?
        .map_err(WorkerError::from)
    }

    /// Send a conversation request and wait for its response. Interleaved
    /// server-originated requests are a violation on this path; the join
    /// flow reads frames itself.
    pub async fn call(
        &mut self,
        request: ConversationRequest,
    ) -> Result<ConversationResponse, WorkerError> {
        let id = self.send(Request::Conversation(request)).await?;
        let msg = self.recv().await?;
        match msg.body {
            Body::Response(Response::Conversation(r)) if msg.id == id => Ok(r),
            _ => Err(WorkerError::Protocol("unexpected frame")),
        }
    }

    /// Send a single request and wait for its response.
    pub async fn call_single(
        &mut self,
        request: crate::net::message::SingleRequest,
    ) -> Result<crate::net::message::SingleResponse, WorkerError> {
        let id = self.send(Request::Single(request)).await?;
        let msg = self.recv().await?;
        match msg.body {
            Body::Response(Response::Single(r)) if msg.id == id => Ok(r),
            _ => Err(WorkerError::Protocol("unexpected frame")),
        }
    }

    /// Start a conversation: version negotiation, challenge exchange, and
    /// verification of the server's signature over our challenge. Returns
    /// the server challenge to sign in `VerifyIdentity` or `CheckIn`.
    pub async fn start_conversation(
        &mut self,
        keypair: &Keypair,
    ) -> Result<[u8; 32], WorkerError> {
        let our_challenge = crate::crypto::random_challenge();
        let start = self
            .call(ConversationRequest::Start {
                versions: BoundedVec::new_unchecked(vec![SemVer::V1]),
                challenge: our_challenge,
                public_key: keypair.public(),
            })
            .await?;
        if !start.status.is_ok() {
            return Err(WorkerError::Status(start.status));
        }

        let ConversationPayload::Start {
            public_key,
            signature,
            client_challenge,
            challenge: server_challenge,
            ..
        } = start.payload
        else {
            return Err(WorkerError::Protocol("start payload missing"));
        };
        if client_challenge != our_challenge {
            return Err(WorkerError::Protocol("challenge echo mismatch"));
        }
        if crate::crypto::verify(&public_key, &our_challenge, &signature).is_err() {
            return Err(WorkerError::Protocol("server signature invalid"));
        }

        self.server_public_key = Some(public_key);
        self.server_identity = Some(crate::crypto::identity_id(&public_key));
        Ok(server_challenge)
    }

    /// Start the conversation and verify our identity: the server proves its
    /// key over our challenge, we prove ours over its challenge.
    pub async fn handshake(&mut self, keypair: &Keypair) -> Result<IdentityId, WorkerError> {
        let server_challenge = self.start_conversation(keypair).await?;

        let verify = self
            .call(ConversationRequest::VerifyIdentity {
                challenge: server_challenge,
                signature: SignatureBytes::new_unchecked(
                    keypair.sign(&server_challenge).to_vec(),
                ),
            })
            .await?;
        if !verify.status.is_ok() {
            return Err(WorkerError::Status(verify.status));
        }

        self.server_identity
            .ok_or(WorkerError::Protocol("missing server identity"))
    }
}

// =============================================================================
// ACTION WORKER
// =============================================================================

/// Run until the process exits. Woken by committing handlers and by a
/// periodic tick; the tick doubles as the retry backoff.
pub async fn run_action_worker(ctx: Arc<ServerContext>) {
    info!("neighborhood action worker running");
    loop {
        tokio::select! {
            _ = ctx.worker_signal.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(WORKER_TICK_SECS)) => {}
        }
        drain_queue(&ctx).await;
    }
}

async fn drain_queue(ctx: &Arc<ServerContext>) {
    loop {
        let action = match ctx.store.next_worker_action().await {
            Ok(Some(a)) => a,
            Ok(None) => break,
            Err(e) => {
                warn!("action queue read failed: {}", e);
                break;
            }
        };

        match deliver_action(ctx, &action).await {
            Ok(()) => {
                if let Err(e) = ctx.store.delete_action(action.id).await {
                    warn!("action {} delete failed: {}", action.id, e);
                    break;
                }
                let _ = ctx.store.reset_follower_failures(&action.follower_id).await;
            }
            Err(e) => {
                debug!(
                    "delivery of action {} to {} failed: {}",
                    action.id,
                    crate::crypto::fingerprint(&action.follower_id),
                    e
                );
                let _ = ctx
                    .store
                    .record_follower_failure(&action.follower_id, FOLLOWER_FAILURE_LIMIT)
                    .await;
                // Leave the action queued and retry at the next tick.
                break;
            }
        }
    }
}

async fn deliver_action(
    ctx: &Arc<ServerContext>,
    action: &crate::db::NeighborhoodAction,
) -> Result<(), WorkerError> {
    let Some(follower) = ctx
        .store
        .get_follower(&action.follower_id)
        .ok()
        .flatten()
    else {
        // Follower gone; its queue was purged, this action is a leftover.
        let _ = ctx.store.delete_action(action.id).await;
        return Ok(());
    };

    let Some(item) = action_item(ctx, action).await else {
        // Target vanished between queueing and delivery; a later action
        // covers the removal.
        let _ = ctx.store.delete_action(action.id).await;
        return Ok(());
    };

    let addr = SocketAddr::new(follower.ip, follower.neighbor_port);
    let mut client = PeerClient::connect(addr).await?;
    client.handshake(&ctx.keypair).await?;

    let response = client
        .call(ConversationRequest::NeighborhoodSharedProfileUpdate {
            items: BoundedVec::new_unchecked(vec![item, SharedProfileUpdateItem::Refresh]),
        })
        .await?;
    if !response.status.is_ok() {
        return Err(WorkerError::Status(response.status));
    }
    Ok(())
}

/// Materialize the update item an action stands for, reading the current
/// profile state.
async fn action_item(
    ctx: &Arc<ServerContext>,
    action: &crate::db::NeighborhoodAction,
) -> Option<SharedProfileUpdateItem> {
    let target = action.target?;

    match action.kind {
        ActionKind::RemoveProfile => Some(SharedProfileUpdateItem::Delete { identity_id: target }),
        ActionKind::AddProfile | ActionKind::ChangeProfile => {
            let profile = ctx.store.get_hosted(&target).ok().flatten()?;
            if !profile.is_initialized() || !profile.is_active() {
                return None;
            }
            let thumbnail = match profile.thumbnail_image {
                Some(id) => ctx
                    .images
                    .read(&id)
                    .await
                    .ok()
                    .flatten()
                    .map(ThumbnailBytes::new_unchecked)
                    .unwrap_or_default(),
                None => ThumbnailBytes::default(),
            };

            Some(match action.kind {
                ActionKind::AddProfile => SharedProfileUpdateItem::Add(Box::new(SharedProfileAdd {
                    public_key: profile.public_key,
                    version: profile.version,
                    name: profile.name,
                    profile_type: profile.profile_type,
                    latitude: profile.latitude,
                    longitude: profile.longitude,
                    extra_data: profile.extra_data,
                    thumbnail_image: thumbnail,
                })),
                // Changes replicate the full current state; application on
                // the receiving side is idempotent per field.
                _ => SharedProfileUpdateItem::Change(Box::new(SharedProfileChange {
                    identity_id: target,
                    set_version: true,
                    version: profile.version,
                    set_name: true,
                    name: profile.name,
                    set_location: true,
                    latitude: profile.latitude,
                    longitude: profile.longitude,
                    set_extra_data: true,
                    extra_data: profile.extra_data,
                    set_thumbnail: true,
                    thumbnail_image: thumbnail,
                })),
            })
        }
        ActionKind::InitializationInProgress => None,
    }
}

// =============================================================================
// JOINING A NEIGHBORHOOD
// =============================================================================

/// Become a follower of the server at `addr`: authenticate, request
/// initialization, apply the streamed snapshot, and mark the neighbor
/// initialized when the stream finishes.
pub async fn join_neighborhood(
    ctx: &Arc<ServerContext>,
    addr: SocketAddr,
) -> Result<IdentityId, WorkerError> {
    let mut client = PeerClient::connect(addr).await?;
    let neighbor_id = client.handshake(&ctx.keypair).await?;

    ctx.store
        .upsert_neighbor_server(crate::db::NeighborServer {
            neighbor_id,
            ip: addr.ip(),
            neighbor_port: addr.port(),
            last_refresh_at: None,
        })
        .await
        .map_err(|_| WorkerError::Protocol("neighbor row creation failed"))?;

    let response = client
        .call(ConversationRequest::StartNeighborhoodInitialization {
            primary_port: ctx.config.primary_port,
            neighbor_port: ctx.config.server_neighbor_port,
        })
        .await?;
    if !response.status.is_ok() {
        return Err(WorkerError::Status(response.status));
    }

    // The leader now streams snapshot batches as requests on this
    // connection, then finishes.
    loop {
        let msg = client.recv().await?;
        match msg.body {
            Body::Request(Request::Conversation(
                ConversationRequest::NeighborhoodSharedProfileUpdate { items },
            )) => {
                let status =
                    crate::replication::inbound::process_update(ctx, &neighbor_id, items.into_inner())
                        .await;
                let ok = status.is_ok();
                client
                    .send_response(
                        msg.id,
                        Response::Conversation(ConversationResponse {
                            status,
                            payload: ConversationPayload::None,
                        }),
                    )
                    .await?;
                if !ok {
                    return Err(WorkerError::Protocol("snapshot batch failed"));
                }
            }
            Body::Request(Request::Conversation(
                ConversationRequest::FinishNeighborhoodInitialization,
            )) => {
                ctx.store
                    .set_neighbor_refresh(&neighbor_id)
                    .await
                    .map_err(|_| WorkerError::Protocol("neighbor refresh failed"))?;
                client
                    .send_response(
                        msg.id,
                        Response::Conversation(ConversationResponse::ok(
                            ConversationPayload::None,
                        )),
                    )
                    .await?;
                info!(
                    "joined neighborhood of {} ({} profiles replicated)",
                    crate::crypto::fingerprint(&neighbor_id),
                    ctx.store.count_neighbor_profiles()
                );
                return Ok(neighbor_id);
            }
            _ => return Err(WorkerError::Protocol("unexpected frame during join")),
        }
    }
}

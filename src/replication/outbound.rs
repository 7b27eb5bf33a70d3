//! Outbound replication: admit a follower, stream the identity snapshot,
//! finish initialization.
//!
//! Admission, the snapshot, the follower row and its blocking action are one
//! store operation. The stream then runs on the follower's own connection as
//! server-originated requests: one batch in flight, each packed just under
//! the frame cap, each acknowledged before the next. Any error or disconnect
//! mid-stream removes the follower; the blocking action goes with it.

use crate::db::Follower;
use crate::handlers::{reply, reply_error, Handled};
use crate::net::frame::encoded_size;
use crate::net::message::{
    ConversationPayload, ConversationRequest, ConversationResponse, Message, Request, Response,
    SharedProfileAdd, SharedProfileUpdateItem, Status, ThumbnailBytes,
};
use crate::net::serde_safe::BoundedVec;
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{FRAME_SAFETY_MARGIN, MAX_FRAME_SIZE, MAX_UPDATE_ITEMS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Acknowledgement deadline per streamed batch.
const BATCH_ACK_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
enum InitError {
    #[error("follower connection lost")]
    Disconnected,

    #[error("follower answered {0:?}")]
    Refused(Status),

    #[error("batch acknowledgement timed out")]
    AckTimeout,

    #[error("codec error: {0}")]
    Codec(#[from] crate::net::frame::FrameError),
}

/// `StartNeighborhoodInitialization`: admission gates, then the snapshot
/// stream runs concurrently with this session's reader so the follower's
/// acknowledgements can flow back.
pub async fn start_initialization(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    primary_port: u16,
    neighbor_port: u16,
) -> Handled {
    let Some(follower_id) = session.identity_id().await else {
        return reply_error(Status::Internal);
    };

    if ctx.store.count_followers() >= ctx.config.max_followers {
        return reply_error(Status::Rejected);
    }
    if ctx.init_in_flight.load(Ordering::SeqCst) >= ctx.config.init_parallelism {
        return reply_error(Status::Busy);
    }

    let follower = Follower {
        follower_id,
        ip: session.remote.ip(),
        primary_port,
        neighbor_port,
        last_refresh_at: None,
        failure_count: 0,
    };
    let snapshot = match ctx
        .store
        .admit_follower(follower, ctx.config.max_followers)
        .await
    {
        Ok(s) => s,
        Err(crate::db::StoreError::QuotaExceeded) => return reply_error(Status::Rejected),
        Err(e) => {
            warn!("follower admission failed: {}", e);
            return reply_error(Status::Internal);
        }
    };

    info!(
        "neighborhood init started for follower {} ({} identities)",
        crate::crypto::fingerprint(&follower_id),
        snapshot.len()
    );

    ctx.init_in_flight.fetch_add(1, Ordering::SeqCst);
    session.state().await.init_follower = Some(follower_id);

    let ctx = ctx.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let result = stream_snapshot(&ctx, &session, snapshot).await;
        ctx.init_in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                if let Err(e) = ctx.store.finish_follower_init(&follower_id).await {
                    warn!("finishing follower init failed: {}", e);
                    let _ = ctx.store.remove_follower(&follower_id).await;
                    return;
                }
                session.state().await.init_follower = None;
                ctx.worker_signal.notify_one();
                info!(
                    "neighborhood init finished for follower {}",
                    crate::crypto::fingerprint(&follower_id)
                );
            }
            Err(e) => {
                warn!(
                    "neighborhood init for {} failed: {}",
                    crate::crypto::fingerprint(&follower_id),
                    e
                );
                let _ = ctx.store.remove_follower(&follower_id).await;
                session.force_close().await;
            }
        }
    });

    reply(ConversationResponse::ok(ConversationPayload::None))
}

/// Stream the snapshot as acknowledged batches, then finish.
async fn stream_snapshot(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    snapshot: Vec<crate::db::HostedProfile>,
) -> Result<(), InitError> {
    // Serialized size of an empty update envelope; item sizes add onto it.
    let base_size = encoded_size(&Message::request(
        u32::MAX,
        Request::Conversation(ConversationRequest::NeighborhoodSharedProfileUpdate {
            items: BoundedVec::default(),
        }),
    ))?;
    let budget = MAX_FRAME_SIZE - FRAME_SAFETY_MARGIN;

    let mut batch: Vec<SharedProfileUpdateItem> = Vec::new();
    let mut batch_size = base_size;

    for profile in snapshot {
        let item = add_item(ctx, profile).await;
        let item_size = crate::net::serde_safe::to_bytes(&item)
            .map(|b| b.len())
            .unwrap_or(budget);

        if !batch.is_empty()
            && (batch_size + item_size + 8 > budget || batch.len() >= MAX_UPDATE_ITEMS)
        {
            send_batch(session, std::mem::take(&mut batch)).await?;
            batch_size = base_size;
        }
        batch_size += item_size;
        batch.push(item);
    }
    if !batch.is_empty() {
        send_batch(session, batch).await?;
    }

    // Finish: on acknowledgement the follower becomes eligible for queued
    // updates.
    let finish = Request::Conversation(ConversationRequest::FinishNeighborhoodInitialization);
    let slot = session.send_request(finish).await.ok_or(InitError::Disconnected)?;
    match timeout(Duration::from_secs(BATCH_ACK_TIMEOUT_SECS), slot).await {
        Ok(Ok(Response::Conversation(r))) if r.status.is_ok() => Ok(()),
        Ok(Ok(Response::Conversation(r))) => Err(InitError::Refused(r.status)),
        Ok(Ok(Response::Single(_))) | Ok(Err(_)) => Err(InitError::Disconnected),
        Err(_) => Err(InitError::AckTimeout),
    }
}

async fn send_batch(
    session: &Arc<Session>,
    items: Vec<SharedProfileUpdateItem>,
) -> Result<(), InitError> {
    let count = items.len();
    let request = Request::Conversation(ConversationRequest::NeighborhoodSharedProfileUpdate {
        items: BoundedVec::new_unchecked(items),
    });
    let slot = session.send_request(request).await.ok_or(InitError::Disconnected)?;

    match timeout(Duration::from_secs(BATCH_ACK_TIMEOUT_SECS), slot).await {
        Ok(Ok(Response::Conversation(r))) if r.status.is_ok() => {
            debug!("snapshot batch of {} items acknowledged", count);
            Ok(())
        }
        Ok(Ok(Response::Conversation(r))) => Err(InitError::Refused(r.status)),
        Ok(Ok(Response::Single(_))) | Ok(Err(_)) => Err(InitError::Disconnected),
        Err(_) => Err(InitError::AckTimeout),
    }
}

/// Snapshot item for one hosted profile, thumbnail bytes inlined.
async fn add_item(
    ctx: &Arc<ServerContext>,
    profile: crate::db::HostedProfile,
) -> SharedProfileUpdateItem {
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

    SharedProfileUpdateItem::Add(Box::new(SharedProfileAdd {
        public_key: profile.public_key,
        version: profile.version,
        name: profile.name,
        profile_type: profile.profile_type,
        latitude: profile.latitude,
        longitude: profile.longitude,
        extra_data: profile.extra_data,
        thumbnail_image: thumbnail,
    }))
}

/// `StopNeighborhoodUpdates`: drop the follower row and its queued actions.
pub async fn stop_updates(ctx: &Arc<ServerContext>, session: &Arc<Session>) -> Handled {
    let Some(follower_id) = session.identity_id().await else {
        return reply_error(Status::Internal);
    };

    match ctx.store.remove_follower(&follower_id).await {
        Ok(true) => {
            info!(
                "follower {} unsubscribed",
                crate::crypto::fingerprint(&follower_id)
            );
            reply(ConversationResponse::ok(ConversationPayload::None))
        }
        Ok(false) => reply_error(Status::NotFound),
        Err(e) => {
            warn!("stop updates failed: {}", e);
            reply_error(Status::Internal)
        }
    }
}

// A follower disconnecting mid-initialization needs no separate cleanup
// hook: closing the session fails the stream task's pending slots, and its
// error path removes the follower row (and the blocking action with it).
// A hook racing the task here could remove a follower whose final
// acknowledgement was already read but not yet committed.
